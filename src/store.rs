//! Deduplicated, per-module set of encoded trace records.

use indexmap::IndexSet;

use crate::module_map::ModuleMap;
use crate::record::encode;

/// Owns the `ModuleMap` and the per-module record sets.
///
/// Per-module sets are `IndexSet`s so that iteration order is insertion
/// order: deterministic given a deterministic calling sequence, which is
/// what the dumper needs to produce byte-identical files across runs with
/// identical inputs (spec.md §8).
#[derive(Debug, Default)]
pub struct TraceStore {
    module_map: ModuleMap,
    records: Vec<IndexSet<u64>>,
}

impl TraceStore {
    pub fn new(module_map: ModuleMap) -> Self {
        let records = (0..module_map.modules_count())
            .map(|_| IndexSet::new())
            .collect();
        Self {
            module_map,
            records,
        }
    }

    pub fn module_map(&self) -> &ModuleMap {
        &self.module_map
    }

    /// Resolves `pc` via the `ModuleMap`; if found, encodes
    /// `(pc_offset, tag1, tag2)` and inserts it into that module's set.
    /// Drops the record silently if `pc` resolves to no known module.
    ///
    /// Returns whether the record was newly inserted (for testing dedup).
    pub fn try_save(&mut self, pc: u64, tag1: u8, tag2: u8) -> bool {
        let Some((module_index, pc_offset)) = self.module_map.locate(pc) else {
            return false;
        };

        let word = encode(pc_offset, tag1, tag2);
        self.records[module_index].insert(word)
    }

    pub fn modules_count(&self) -> usize {
        self.module_map.modules_count()
    }

    pub fn module_name(&self, index: usize) -> Option<&str> {
        self.module_map.module_name(index)
    }

    /// Every `(module_index, encoded_word)` pair, in per-module insertion
    /// order. Cross-module ordering is arbitrary (by module index).
    pub fn list_all(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.records
            .iter()
            .enumerate()
            .flat_map(|(idx, set)| set.iter().map(move |&word| (idx, word)))
    }

    pub fn records_for(&self, module_index: usize) -> Option<&IndexSet<u64>> {
        self.records.get(module_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module_map::Module;
    use rangemap::RangeMap;

    fn store_with_one_module() -> TraceStore {
        let mut ranges = RangeMap::default();
        ranges.insert(0x1000..0x2000, 0);
        let module_map = ModuleMap::from_parts(
            vec![Module {
                name: "target".to_string(),
                base_address: 0x1000,
                size: 0x1000,
            }],
            ranges,
        );
        TraceStore::new(module_map)
    }

    #[test]
    fn try_save_is_idempotent() {
        let mut store = store_with_one_module();

        assert!(store.try_save(0x1010, 1, 0));
        assert!(!store.try_save(0x1010, 1, 0));
        assert!(!store.try_save(0x1010, 1, 0));

        assert_eq!(store.list_all().count(), 1);
    }

    #[test]
    fn try_save_drops_unresolved_addresses() {
        let mut store = store_with_one_module();
        assert!(!store.try_save(0xdead_beef, 1, 0));
        assert_eq!(store.list_all().count(), 0);
    }

    #[test]
    fn distinct_tags_are_distinct_records() {
        let mut store = store_with_one_module();
        assert!(store.try_save(0x1010, 1, 0));
        assert!(store.try_save(0x1010, 2, 0));
        assert_eq!(store.list_all().count(), 2);
    }

    #[test]
    fn iteration_order_is_insertion_order() {
        let mut store = store_with_one_module();
        store.try_save(0x1010, 3, 0);
        store.try_save(0x1020, 1, 0);
        store.try_save(0x1010, 1, 0);

        let words: Vec<u64> = store.list_all().map(|(_, w)| w).collect();
        let expected: Vec<u64> = vec![
            encode(0x10, 3, 0),
            encode(0x20, 1, 0),
            encode(0x10, 1, 0),
        ];
        assert_eq!(words, expected);
    }
}
