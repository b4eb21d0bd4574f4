//! Property-based tests for tsfs-store using proptest.
//!
//! These tests check the storage building blocks against simple in-memory
//! models: bit vectors, interval sets, the batch read scheduler and the
//! disk-resident B-tree.

use proptest::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tempfile::TempDir;
use tsfs_store::{
    resolve_all, BTree, DiskNodeIo, FsId, FsIdOrder, Location, LocationIndex, NodeCache,
    PersistentBitSet, ReadScheduler, SimpleInterval, StoreResult, ValidSet,
};

/// Generator for ids drawn from a small key space so operations collide.
fn any_fsid() -> impl Strategy<Value = FsId> {
    (0u32..4, 0u32..64).prop_map(|(family, n)| {
        FsId::parse(&format!("/fam{}/item{:03}", family, n)).unwrap()
    })
}

/// Generator for data record locations.
fn any_location() -> impl Strategy<Value = Location> {
    (0u32..4, 0u64..1_000_000, 1u32..4096).prop_map(|(file_id, offset, length)| Location {
        file_id,
        offset,
        length,
    })
}

#[derive(Debug, Clone)]
enum TreeOp {
    Insert(FsId, Location),
    Delete(FsId),
}

fn any_tree_op() -> impl Strategy<Value = TreeOp> {
    prop_oneof![
        3 => (any_fsid(), any_location()).prop_map(|(k, v)| TreeOp::Insert(k, v)),
        2 => any_fsid().prop_map(TreeOp::Delete),
    ]
}

fn open_tree(dir: &TempDir) -> BTree {
    let io = DiskNodeIo::open(
        &dir.path().join("p.idx"),
        &dir.path().join("p.bits"),
        4096,
        2,
        Arc::new(NodeCache::new("p", 8)),
    )
    .unwrap();
    BTree::new(io)
}

struct MapIndex(HashMap<FsId, Location>);

impl LocationIndex for MapIndex {
    fn lookup(&self, id: &FsId) -> StoreResult<Option<Location>> {
        Ok(self.0.get(id).copied())
    }
}

proptest! {
    /// Test: bits written, closed and reopened read back identically.
    #[test]
    fn test_bitset_reopen_round_trip(indices in proptest::collection::vec(0u64..2048, 0..200)) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("b.bits");
        let mut bits = PersistentBitSet::open(&path).unwrap();
        bits.update(&indices, true).unwrap();
        bits.close().unwrap();

        let reopened = PersistentBitSet::open(&path).unwrap();
        let mut expected: Vec<u64> = indices.clone();
        expected.sort_unstable();
        expected.dedup();
        prop_assert_eq!(reopened.all_index(true), expected.clone());
        prop_assert_eq!(reopened.cardinality(), expected.len() as u64);
    }

    /// Test: truncated bits stay false when the bitset grows again.
    #[test]
    fn test_bitset_truncate_does_not_resurrect(
        indices in proptest::collection::vec(0u64..512, 1..100),
        cut in 0u64..512,
        regrow in 512u64..1024,
    ) {
        let dir = TempDir::new().unwrap();
        let mut bits = PersistentBitSet::open(&dir.path().join("b.bits")).unwrap();
        bits.update(&indices, true).unwrap();
        bits.truncate(cut).unwrap();
        bits.set(regrow, true).unwrap();
        for i in cut..regrow {
            prop_assert!(!bits.get(i), "bit {} resurrected after truncate({})", i, cut);
        }
        for &i in indices.iter().filter(|&&i| i < cut) {
            prop_assert!(bits.get(i));
        }
    }

    /// Test: find_next_false returns the first clear bit at or after `from`.
    #[test]
    fn test_bitset_find_next_false(
        indices in proptest::collection::vec(0u64..256, 0..256),
        from in 0u64..300,
    ) {
        let dir = TempDir::new().unwrap();
        let mut bits = PersistentBitSet::open(&dir.path().join("b.bits")).unwrap();
        bits.update(&indices, true).unwrap();
        let found = bits.find_next_false(from);
        prop_assert!(found >= from);
        prop_assert!(!bits.get(found));
        for i in from..found {
            prop_assert!(bits.get(i));
        }
    }

    /// Test: a valid set agrees with a per-offset boolean model.
    #[test]
    fn test_interval_set_matches_model(
        ops in proptest::collection::vec((any::<bool>(), 0u64..200, 0u64..20), 1..60),
    ) {
        let mut set = ValidSet::new();
        let mut model = vec![false; 240];
        for (add, start, width) in ops {
            let end = start + width;
            if add {
                set.add(SimpleInterval::new(start, end));
            } else {
                set.remove(start, end);
            }
            for slot in &mut model[start as usize..=end as usize] {
                *slot = add;
            }
        }
        for (offset, &valid) in model.iter().enumerate() {
            prop_assert_eq!(set.contains(offset as u64), valid, "offset {}", offset);
        }
        // coalesced: no two intervals touch
        for pair in set.intervals().windows(2) {
            prop_assert!(pair[0].end + 1 < pair[1].start);
        }
    }

    /// Test: batch reads return each id's location in request order, and
    /// the read plan visits data in physical order.
    #[test]
    fn test_scheduler_preserves_request_order(
        stored in proptest::collection::hash_map(any_fsid(), any_location(), 0..40),
        requested in proptest::collection::vec(any_fsid(), 0..60),
    ) {
        let index = MapIndex(stored.clone());
        let orders = FsIdOrder::from_ids(&requested);
        let locations = resolve_all(&index, &orders).unwrap();

        let plan = ReadScheduler::plan(&locations);
        for pair in plan.windows(2) {
            prop_assert!((pair[0].file_id(), pair[0].offset()) <= (pair[1].file_id(), pair[1].offset()));
        }

        let mut results = ReadScheduler::execute(&locations, |entry, location| {
            Ok((entry.id.clone(), location))
        })
        .unwrap();
        results.resize_with(requested.len(), || None);
        for (id, result) in requested.iter().zip(results) {
            match stored.get(id) {
                Some(location) => prop_assert_eq!(result, Some((id.clone(), *location))),
                None => prop_assert!(result.is_none()),
            }
        }
    }

    /// Test: the B-tree behaves like a BTreeMap and stays well formed,
    /// including after reopening its files.
    #[test]
    fn test_btree_matches_model(ops in proptest::collection::vec(any_tree_op(), 1..150)) {
        let dir = TempDir::new().unwrap();
        let mut model = BTreeMap::new();
        {
            let mut tree = open_tree(&dir);
            for op in &ops {
                match op {
                    TreeOp::Insert(k, v) => {
                        prop_assert_eq!(tree.insert(k.clone(), *v).unwrap(), model.insert(k.clone(), *v));
                    }
                    TreeOp::Delete(k) => {
                        prop_assert_eq!(tree.delete(k).unwrap(), model.remove(k));
                    }
                }
                tree.io_mut().flush(false).unwrap();
                tree.check().unwrap();
            }
        }

        let tree = open_tree(&dir);
        let entries = tree.entries().unwrap();
        let expected: Vec<(FsId, Location)> = model.into_iter().collect();
        prop_assert_eq!(entries, expected);
        tree.check().unwrap();
    }
}
