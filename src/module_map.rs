//! Module enumeration and address resolution.
//!
//! On first use, `ModuleMap::discover` walks `/proc/self/maps` (the
//! Linux facility referenced by spec.md §4.2) and retains one `Module`
//! per distinct file-backed, executable mapping. Later module loads are
//! not observed, since the map is built exactly once, per spec.md §9's
//! "module map staleness" design note.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use rangemap::RangeMap;

/// A single loaded executable image or shared object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Module {
    pub name: String,
    pub base_address: u64,
    pub size: u64,
}

/// Resolves absolute instruction addresses to `(module_index, offset)`.
///
/// Built once, lazily, and never refreshed (see module docs).
#[derive(Debug, Default)]
pub struct ModuleMap {
    modules: Vec<Module>,
    ranges: RangeMap<u64, usize>,
}

struct ParsedMapping {
    start: u64,
    end: u64,
    executable: bool,
    path: Option<PathBuf>,
}

impl ModuleMap {
    /// An empty map: every `locate` call returns `None`. Used when
    /// enumeration fails entirely, per spec.md §4.2's error-handling note.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn discover() -> Self {
        let text = match fs::read_to_string("/proc/self/maps") {
            Ok(text) => text,
            Err(err) => {
                log::warn!("failed to read /proc/self/maps: {}", err);
                return Self::empty();
            }
        };

        // Group segments by backing file, in first-seen order, tracking the
        // minimal start and maximal end observed for each: a shared object
        // is routinely mapped as several discontiguous executable segments
        // (.text, .plt, ...) that must all resolve to the same module.
        let mut spans: IndexMap<PathBuf, (u64, u64)> = IndexMap::new();
        let mut segments: Vec<(PathBuf, u64, u64)> = Vec::new();

        for line in text.lines() {
            let Some(mapping) = parse_maps_line(line) else {
                continue;
            };
            if !mapping.executable {
                continue;
            }
            let Some(path) = mapping.path else {
                continue;
            };
            if !path.is_absolute() {
                // Pseudo-paths like "[vdso]" are not backed by a real module.
                continue;
            }

            spans
                .entry(path.clone())
                .and_modify(|(lo, hi)| {
                    *lo = (*lo).min(mapping.start);
                    *hi = (*hi).max(mapping.end);
                })
                .or_insert((mapping.start, mapping.end));
            segments.push((path, mapping.start, mapping.end));
        }

        let modules: Vec<Module> = spans
            .iter()
            .map(|(path, (lo, hi))| {
                let module = Module {
                    name: short_name(path),
                    base_address: *lo,
                    size: *hi - *lo,
                };
                log::debug!(
                    "discovered module {} @ {:#x} (size {:#x})",
                    module.name,
                    module.base_address,
                    module.size
                );
                module
            })
            .collect();

        let index_of: HashMap<PathBuf, usize> = spans
            .keys()
            .cloned()
            .enumerate()
            .map(|(i, path)| (path, i))
            .collect();

        let mut ranges = RangeMap::default();
        for (path, start, end) in segments {
            if let Some(&idx) = index_of.get(&path) {
                ranges.insert(start..end, idx);
            }
        }

        Self { modules, ranges }
    }

    /// Resolves `addr` to `(module_index, offset_within_module)`, or
    /// `None` if no known module's executable range contains it.
    pub fn locate(&self, addr: u64) -> Option<(usize, u64)> {
        let (_, &idx) = self.ranges.get_key_value(&addr)?;
        let module = &self.modules[idx];
        Some((idx, addr - module.base_address))
    }

    pub fn modules_count(&self) -> usize {
        self.modules.len()
    }

    pub fn module(&self, index: usize) -> Option<&Module> {
        self.modules.get(index)
    }

    pub fn module_name(&self, index: usize) -> Option<&str> {
        self.modules.get(index).map(|m| m.name.as_str())
    }

    /// Test-only constructor for building a `ModuleMap` from fixed data,
    /// without going through `/proc/self/maps`.
    #[cfg(test)]
    pub fn from_parts(modules: Vec<Module>, ranges: RangeMap<u64, usize>) -> Self {
        Self { modules, ranges }
    }
}

fn parse_maps_line(line: &str) -> Option<ParsedMapping> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 5 {
        return None;
    }

    let (start_str, end_str) = tokens[0].split_once('-')?;
    let start = u64::from_str_radix(start_str, 16).ok()?;
    let end = u64::from_str_radix(end_str, 16).ok()?;
    let executable = tokens[1].as_bytes().get(2) == Some(&b'x');

    let path = if tokens.len() > 5 {
        let raw = tokens[5..].join(" ");
        if raw.is_empty() || raw.starts_with('[') {
            None
        } else {
            Some(PathBuf::from(raw))
        }
    } else {
        None
    };

    Some(ParsedMapping {
        start,
        end,
        executable,
        path,
    })
}

/// Canonical short name: the base filename with its extension dropped.
fn short_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
