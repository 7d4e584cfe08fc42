//! Plain-Rust handlers for every trace-compare/trace-switch/weak-hook
//! callback, independent of the `extern "C"` ABI shims in `lib.rs`.
//!
//! Every entry point follows the skeleton from spec.md §4.4: acquire the
//! runtime (lazily initializing it on first use), check the relevant
//! feature flag, compute the matching-byte count, and forward one record
//! per matching prefix length to the `TraceStore`. None of these
//! functions ever panics or propagates an error to the caller: a miss
//! drops silently, a fatal condition aborts the process (see `runtime::fatal`).

use crate::record::MEMCMP_TAG1;
use crate::runtime::{with_runtime, with_runtime_try, Runtime};

/// Minimum constant value worth instrumenting; smaller constants carry no
/// more discriminating power than a 1-byte comparison, which is a no-op
/// per spec.md §4.4.
const MIN_INTERESTING_CONST: u64 = 256;

/// Computes the matching-prefix length (in bytes, little-endian / LSB
/// first) between `x` and `y`, bounded by `arg_length`.
fn matching_bytes(x: u64, y: u64, arg_length: u32) -> u32 {
    let xb = x.to_le_bytes();
    let yb = y.to_le_bytes();
    let mut i = 0;
    while i < arg_length && xb[i as usize] == yb[i as usize] {
        i += 1;
    }
    i
}

/// Emits one record per prefix length in `1..=matching_bytes` (spec.md
/// §4.4's "matching-byte emission policy": never collapse to one record
/// per call). The caller must already hold the runtime lock; this lets a
/// handler that reads or mutates other runtime-guarded state (e.g.
/// `handle_switch`'s `cases` array) do so under a single acquisition
/// instead of one lock per emitted record.
fn emit_prefix_records(runtime: &mut Runtime, pc: usize, matching: u32, switch_case: u8) {
    for k in 1..=matching {
        runtime.store.try_save(pc as u64, k as u8, switch_case);
    }
}

/// Narrows `arg_length` for a const-compare to the byte span of the
/// constant: the number of bytes needed to represent it within a
/// `full_bytes`-wide operand, i.e. `full_bytes` minus the number of
/// fully-zero leading bytes (leading zero bits rounded down to a whole
/// byte). This reproduces the observed policy from spec.md §4.4 and §9
/// exactly (see the Open Question resolution in DESIGN.md).
fn narrowed_arg_length(constant: u64, full_bytes: u32) -> u32 {
    if constant == 0 {
        return full_bytes;
    }
    // `constant` was widened from a `full_bytes`-wide integer into a u64,
    // so its top `64 - full_bytes * 8` bits are always zero; subtract
    // those out before counting the constant's own leading zero bytes.
    let bias = 64 - full_bytes * 8;
    let meaningful_leading_zero_bits = constant.leading_zeros() - bias;
    let leading_zero_bytes = meaningful_leading_zero_bits / 8;
    full_bytes - leading_zero_bytes
}

/// 1-byte comparisons (const and non-const): always a no-op, per
/// spec.md §4.4 ("single-byte operands are assumed to be trivially
/// brute-forceable").
pub fn handle_cmp1(_arg1: u8, _arg2: u8) {}
pub fn handle_const_cmp1(_arg1: u8, _arg2: u8) {}

macro_rules! nonconst_cmp_handler {
    ($name:ident, $ty:ty, $bytes:expr) => {
        pub fn $name(pc: usize, arg1: $ty, arg2: $ty) {
            with_runtime(|runtime| {
                if !runtime.config.enabled || !runtime.config.trace_nonconst_cmp {
                    return;
                }
                let matching = matching_bytes(arg1 as u64, arg2 as u64, $bytes);
                emit_prefix_records(runtime, pc, matching, 0);
            });
        }
    };
}

nonconst_cmp_handler!(handle_cmp2, u16, 2);
nonconst_cmp_handler!(handle_cmp4, u32, 4);
nonconst_cmp_handler!(handle_cmp8, u64, 8);

macro_rules! const_cmp_handler {
    ($name:ident, $ty:ty, $bytes:expr) => {
        /// `arg1` is the compile-time constant (spec.md §4.4).
        pub fn $name(pc: usize, arg1: $ty, arg2: $ty) {
            let constant = arg1 as u64;
            if constant < MIN_INTERESTING_CONST {
                return;
            }
            with_runtime(|runtime| {
                if !runtime.config.enabled {
                    return;
                }
                let arg_length = if $bytes == 2 {
                    2
                } else {
                    narrowed_arg_length(constant, $bytes)
                };
                let matching = matching_bytes(constant, arg2 as u64, arg_length);
                emit_prefix_records(runtime, pc, matching, 0);
            });
        }
    };
}

const_cmp_handler!(handle_const_cmp2, u16, 2);
const_cmp_handler!(handle_const_cmp4, u32, 4);
const_cmp_handler!(handle_const_cmp8, u64, 8);

/// `cases` layout per spec.md §4.4: `cases[0]` = case count, `cases[1]` =
/// operand bit-width, `cases[2..]` = case constants. `cases[0]` is
/// memoized to `0` in place when no case constant is interesting, so the
/// host skips future visits to this switch.
///
/// # Safety
/// `cases` must point to a valid, writable array of at least
/// `2 + cases[0]` `u64`s, per the ABI this instruments.
pub unsafe fn handle_switch(pc: usize, value: u64, cases: *mut u64) {
    with_runtime(|runtime| {
        let case_count = *cases as usize;
        if case_count == 0 {
            return;
        }
        if !runtime.config.enabled {
            return;
        }

        let bitwidth = *cases.add(1);
        let full_bytes = ((bitwidth / 8).max(1) as u32).min(8);

        let mut any_interesting = false;
        for i in 0..case_count {
            let case_value = *cases.add(2 + i);
            if case_value < MIN_INTERESTING_CONST {
                continue;
            }
            any_interesting = true;

            let arg_length = narrowed_arg_length(case_value, full_bytes);
            let matching = matching_bytes(value, case_value, arg_length);
            // Switch case index is 1-based.
            emit_prefix_records(runtime, pc, matching, (i + 1) as u8);
        }

        if !any_interesting {
            *cases = 0;
        }
    });
}

/// Divisions and GEP index computations are accepted for ABI
/// compatibility but never produce records (spec.md §1 non-goals).
pub fn handle_div4(_value: u32) {}
pub fn handle_div8(_value: u64) {}
pub fn handle_gep(_index: usize) {}

/// Shared implementation for all five memory/string weak hooks. `n` is
/// the already-capped effective comparison length in bytes; `s1`/`s2` are
/// raw pointers to the two operands. Uses try-lock (via
/// `with_runtime_try`) since these hooks are reachable from within the
/// library's own string comparisons.
fn handle_memory_compare(pc: usize, s1: *const u8, s2: *const u8, n: usize) {
    if n == 0 {
        return;
    }

    let acquired = with_runtime_try(|runtime| {
        if !runtime.config.enabled || !runtime.config.trace_memory_cmp {
            return;
        }

        let mut matching = 0u32;
        // Safety: the caller (a weak hook invoked by the instrumented
        // host) guarantees `s1`/`s2` are valid for `n` bytes; this
        // mirrors the guarantee real `memcmp`/`strncmp` callers make.
        unsafe {
            while (matching as usize) < n
                && *s1.add(matching as usize) == *s2.add(matching as usize)
            {
                matching += 1;
            }
        }

        for k in 1..=matching {
            runtime.store.try_save(pc as u64, MEMCMP_TAG1, k as u8);
        }
    });

    let _ = acquired;
}

/// Scans at most `limit` bytes from `s` for a NUL terminator, returning
/// its index if found within that bound.
///
/// # Safety
/// `s` must be valid to read for up to `limit` bytes.
unsafe fn nul_scan(s: *const u8, limit: usize) -> Option<usize> {
    for i in 0..limit {
        if *s.add(i) == 0 {
            return Some(i);
        }
    }
    None
}

/// `__sanitizer_weak_hook_memcmp`. Drops comparisons longer than
/// `MAX_DATA_CMP_LENGTH`.
///
/// # Safety
/// `s1`/`s2` must be valid to read for `n` bytes.
pub unsafe fn handle_weak_memcmp(pc: usize, s1: *const u8, s2: *const u8, n: usize) {
    if n > crate::record::MAX_DATA_CMP_LENGTH {
        return;
    }
    handle_memory_compare(pc, s1, s2, n);
}

/// `__sanitizer_weak_hook_strncmp` / `__sanitizer_weak_hook_strncasecmp`.
/// Effective length is `min(n, nul_scan(s1, n), nul_scan(s2, n))`.
///
/// # Safety
/// `s1`/`s2` must be valid to read for up to `n` bytes.
pub unsafe fn handle_weak_strncmp(pc: usize, s1: *const u8, s2: *const u8, n: usize) {
    let effective = nul_scan(s1, n)
        .into_iter()
        .chain(nul_scan(s2, n))
        .chain(std::iter::once(n))
        .min()
        .unwrap_or(n);

    if effective > crate::record::MAX_DATA_CMP_LENGTH {
        return;
    }
    handle_memory_compare(pc, s1, s2, effective);
}

/// `__sanitizer_weak_hook_strcmp` / `__sanitizer_weak_hook_strcasecmp`.
/// Scans both strings in parallel for up to `MAX_DATA_CMP_LENGTH + 1`
/// bytes; drops the comparison if neither terminates within that range.
///
/// # Safety
/// `s1`/`s2` must be valid to read until their respective NUL terminator,
/// or for `MAX_DATA_CMP_LENGTH + 1` bytes, whichever comes first.
pub unsafe fn handle_weak_strcmp(pc: usize, s1: *const u8, s2: *const u8) {
    let scan_limit = crate::record::MAX_DATA_CMP_LENGTH + 1;
    let len1 = nul_scan(s1, scan_limit);
    let len2 = nul_scan(s2, scan_limit);

    let (Some(len1), Some(len2)) = (len1, len2) else {
        return;
    };

    handle_memory_compare(pc, s1, s2, len1.min(len2));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_bytes_counts_shared_prefix() {
        assert_eq!(matching_bytes(0x1234, 0x1234, 2), 2);
        assert_eq!(matching_bytes(0x1234, 0x5634, 2), 1);
        assert_eq!(matching_bytes(0x1234, 0x5678, 2), 0);
    }

    #[test]
    fn narrowed_arg_length_is_byte_span_of_constant() {
        assert_eq!(narrowed_arg_length(0x1234, 4), 2);
        assert_eq!(narrowed_arg_length(0xDEAD_C0DE, 4), 4);
        assert_eq!(narrowed_arg_length(0x0000_0100, 4), 2);
        assert_eq!(narrowed_arg_length(0x100, 8), 2);
    }

    #[test]
    fn emit_prefix_records_is_noop_on_zero_matching() {
        with_runtime(|runtime| {
            let before = runtime.store.list_all().count();
            emit_prefix_records(runtime, 0x1000, 0, 0);
            assert_eq!(runtime.store.list_all().count(), before);
        });
    }

    #[test]
    fn nul_scan_finds_terminator_within_limit() {
        let data = b"abc\0xyz";
        unsafe {
            assert_eq!(nul_scan(data.as_ptr(), data.len()), Some(3));
            assert_eq!(nul_scan(data.as_ptr(), 2), None);
        }
    }
}
