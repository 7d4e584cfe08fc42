//! `cmpcov` records sub-instruction data-flow coverage for the
//! "trace-compare" family of sanitizer-coverage callbacks: for each
//! integer or memory comparison an instrumented binary performs, it
//! determines how many leading bytes of the two operands agree and
//! stores one record per matching prefix length, keyed by the comparison
//! site's program counter. At process exit, each loaded module's records
//! are flushed to their own `cmp.<module>.<pid>.sancov` file.
//!
//! This crate is meant to be linked into (or preloaded alongside) a
//! `-fsanitize-coverage=trace-cmp,trace-div` instrumented host process;
//! the symbols in this module are exactly the ones such a host expects
//! to find. See `SPEC_FULL.md` for the full design.

mod config;
mod dispatch;
mod dump;
mod module_map;
mod record;
mod runtime;
mod store;

pub use config::Configuration;
pub use module_map::{Module, ModuleMap};
pub use record::{decode, encode, hash32, MAGIC, MEMCMP_TAG1};
pub use store::TraceStore;

/// Captures the immediate caller's return address, i.e. the instruction
/// address of the comparison site that invoked the current ABI shim.
///
/// Uses the `llvm.returnaddress` compiler intrinsic, the same technique
/// used by comparable Rust sanitizer-coverage-hook implementations: it
/// only returns the correct frame's return address if this function
/// itself is inlined into its caller, hence `#[inline(always)]`.
#[inline(always)]
fn caller_pc() -> usize {
    extern "C" {
        #[link_name = "llvm.returnaddress"]
        fn llvm_returnaddress(level: i32) -> *const u8;
    }
    unsafe { llvm_returnaddress(0) as usize }
}

#[no_mangle]
pub extern "C" fn __sanitizer_cov_trace_cmp1(arg1: u8, arg2: u8) {
    dispatch::handle_cmp1(arg1, arg2);
}

#[no_mangle]
pub extern "C" fn __sanitizer_cov_trace_cmp2(arg1: u16, arg2: u16) {
    let pc = caller_pc();
    dispatch::handle_cmp2(pc, arg1, arg2);
}

#[no_mangle]
pub extern "C" fn __sanitizer_cov_trace_cmp4(arg1: u32, arg2: u32) {
    let pc = caller_pc();
    dispatch::handle_cmp4(pc, arg1, arg2);
}

#[no_mangle]
pub extern "C" fn __sanitizer_cov_trace_cmp8(arg1: u64, arg2: u64) {
    let pc = caller_pc();
    dispatch::handle_cmp8(pc, arg1, arg2);
}

#[no_mangle]
pub extern "C" fn __sanitizer_cov_trace_const_cmp1(arg1: u8, arg2: u8) {
    dispatch::handle_const_cmp1(arg1, arg2);
}

#[no_mangle]
pub extern "C" fn __sanitizer_cov_trace_const_cmp2(arg1: u16, arg2: u16) {
    let pc = caller_pc();
    dispatch::handle_const_cmp2(pc, arg1, arg2);
}

#[no_mangle]
pub extern "C" fn __sanitizer_cov_trace_const_cmp4(arg1: u32, arg2: u32) {
    let pc = caller_pc();
    dispatch::handle_const_cmp4(pc, arg1, arg2);
}

#[no_mangle]
pub extern "C" fn __sanitizer_cov_trace_const_cmp8(arg1: u64, arg2: u64) {
    let pc = caller_pc();
    dispatch::handle_const_cmp8(pc, arg1, arg2);
}

/// # Safety
/// `cases` must point to a valid, writable array laid out as
/// `[count, bitwidth, case_0, case_1, ..., case_{count-1}]`.
#[no_mangle]
pub unsafe extern "C" fn __sanitizer_cov_trace_switch(value: u64, cases: *mut u64) {
    let pc = caller_pc();
    dispatch::handle_switch(pc, value, cases);
}

#[no_mangle]
pub extern "C" fn __sanitizer_cov_trace_div4(value: u32) {
    dispatch::handle_div4(value);
}

#[no_mangle]
pub extern "C" fn __sanitizer_cov_trace_div8(value: u64) {
    dispatch::handle_div8(value);
}

#[no_mangle]
pub extern "C" fn __sanitizer_cov_trace_gep(idx: usize) {
    dispatch::handle_gep(idx);
}

/// # Safety
/// `s1` and `s2` must be valid to read for `n` bytes.
#[no_mangle]
pub unsafe extern "C" fn __sanitizer_weak_hook_memcmp(
    called_pc: usize,
    s1: *const u8,
    s2: *const u8,
    n: usize,
    _result: i32,
) {
    dispatch::handle_weak_memcmp(called_pc, s1, s2, n);
}

/// # Safety
/// `s1` and `s2` must be valid to read for up to `n` bytes, or until
/// their respective NUL terminator.
#[no_mangle]
pub unsafe extern "C" fn __sanitizer_weak_hook_strncmp(
    called_pc: usize,
    s1: *const u8,
    s2: *const u8,
    n: usize,
    _result: i32,
) {
    dispatch::handle_weak_strncmp(called_pc, s1, s2, n);
}

/// # Safety
/// `s1` and `s2` must be valid to read until their respective NUL
/// terminator, or for `MAX_DATA_CMP_LENGTH + 1` bytes.
#[no_mangle]
pub unsafe extern "C" fn __sanitizer_weak_hook_strcmp(
    called_pc: usize,
    s1: *const u8,
    s2: *const u8,
    _result: i32,
) {
    dispatch::handle_weak_strcmp(called_pc, s1, s2);
}

/// # Safety
/// Same contract as `__sanitizer_weak_hook_strncmp`. The case-insensitive
/// variants share the case-sensitive prefix-comparison code; the
/// resulting small imprecision (a byte-exact comparison standing in for
/// a case-insensitive one) is accepted, per spec.md §4.4.
#[no_mangle]
pub unsafe extern "C" fn __sanitizer_weak_hook_strncasecmp(
    called_pc: usize,
    s1: *const u8,
    s2: *const u8,
    n: usize,
    _result: i32,
) {
    dispatch::handle_weak_strncmp(called_pc, s1, s2, n);
}

/// # Safety
/// Same contract as `__sanitizer_weak_hook_strcmp`.
#[no_mangle]
pub unsafe extern "C" fn __sanitizer_weak_hook_strcasecmp(
    called_pc: usize,
    s1: *const u8,
    s2: *const u8,
    _result: i32,
) {
    dispatch::handle_weak_strcmp(called_pc, s1, s2);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_byte_comparisons_never_panic() {
        __sanitizer_cov_trace_cmp1(1, 1);
        __sanitizer_cov_trace_const_cmp1(1, 1);
    }

    #[test]
    fn div_and_gep_are_accepted_and_ignored() {
        __sanitizer_cov_trace_div4(10);
        __sanitizer_cov_trace_div8(10);
        __sanitizer_cov_trace_gep(0x1000);
    }

    #[test]
    fn switch_with_zero_cases_does_not_touch_memory() {
        let mut cases = [0u64; 2];
        unsafe {
            __sanitizer_cov_trace_switch(5, cases.as_mut_ptr());
        }
        assert_eq!(cases[0], 0);
    }

    #[test]
    fn weak_memcmp_with_zero_length_is_a_noop() {
        let a = [1u8];
        let b = [2u8];
        unsafe {
            __sanitizer_weak_hook_memcmp(caller_pc(), a.as_ptr(), b.as_ptr(), 0, 0);
        }
    }
}
