//! Id-to-location resolution and physically ordered batch reads.
//!
//! A batch read is resolved in one pass through the index, sorted by
//! `(file_id, offset)` so the data files are scanned sequentially, and the
//! payloads are scattered back into the caller's order.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreResult;
use crate::fsid::FsId;

/// Where a committed record lives inside the data files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    /// Data file number.
    pub file_id: u32,
    /// Byte offset of the record frame.
    pub offset: u64,
    /// Length of the record frame in bytes.
    pub length: u32,
}

/// An id together with its position in the caller's request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsIdOrder {
    /// The requested id.
    pub id: FsId,
    /// Index of the result slot the caller expects this id in.
    pub original_order: usize,
}

impl FsIdOrder {
    /// Numbers `ids` by their position.
    pub fn from_ids(ids: &[FsId]) -> Vec<FsIdOrder> {
        ids.iter()
            .enumerate()
            .map(|(original_order, id)| FsIdOrder {
                id: id.clone(),
                original_order,
            })
            .collect()
    }
}

/// Resolution of one requested id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsIdLocation {
    /// The requested id.
    pub id: FsId,
    /// The caller's result slot.
    pub original_order: usize,
    /// Where the record lives, or `None` if the id has no committed value.
    pub location: Option<Location>,
}

impl FsIdLocation {
    /// Returns true if the id resolved to a committed record.
    pub fn exists(&self) -> bool {
        self.location.is_some()
    }

    /// Data file number, 0 when absent.
    pub fn file_id(&self) -> u32 {
        self.location.map_or(0, |l| l.file_id)
    }

    /// Record offset, 0 when absent.
    pub fn offset(&self) -> u64 {
        self.location.map_or(0, |l| l.offset)
    }
}

/// Source of committed locations, implemented by the index trees.
pub trait LocationIndex {
    /// Looks up the committed location of `id`.
    fn lookup(&self, id: &FsId) -> StoreResult<Option<Location>>;
}

/// Resolves `orders` against `index`, returning results in input order.
///
/// Lookups are issued in key order so consecutive descents share the
/// upper levels of the tree in the node cache.
pub fn resolve_all<I: LocationIndex + ?Sized>(
    index: &I,
    orders: &[FsIdOrder],
) -> StoreResult<Vec<FsIdLocation>> {
    let mut by_key: Vec<usize> = (0..orders.len()).collect();
    by_key.sort_by(|&a, &b| orders[a].id.cmp(&orders[b].id));

    let mut locations: Vec<Option<Location>> = vec![None; orders.len()];
    let mut previous: Option<(&FsId, Option<Location>)> = None;
    for i in by_key {
        let id = &orders[i].id;
        let location = match previous {
            Some((prev_id, loc)) if prev_id == id => loc,
            _ => index.lookup(id)?,
        };
        locations[i] = location;
        previous = Some((id, location));
    }

    Ok(orders
        .iter()
        .zip(locations)
        .map(|(order, location)| FsIdLocation {
            id: order.id.clone(),
            original_order: order.original_order,
            location,
        })
        .collect())
}

/// Turns resolved locations into a sequential read plan.
pub struct ReadScheduler;

impl ReadScheduler {
    /// Existing locations sorted by `(file_id, offset)`. The sort is stable,
    /// so duplicate ids keep their request order.
    pub fn plan(locations: &[FsIdLocation]) -> Vec<&FsIdLocation> {
        let mut plan: Vec<&FsIdLocation> = locations.iter().filter(|l| l.exists()).collect();
        plan.sort_by_key(|l| (l.file_id(), l.offset()));
        plan
    }

    /// Reads every existing location in physical order with `read` and
    /// places each payload in the slot named by its `original_order`.
    /// Absent ids leave their slot `None`.
    pub fn execute<T, F>(locations: &[FsIdLocation], mut read: F) -> StoreResult<Vec<Option<T>>>
    where
        F: FnMut(&FsIdLocation, Location) -> StoreResult<T>,
    {
        let slots = locations
            .iter()
            .map(|l| l.original_order + 1)
            .max()
            .unwrap_or(0);
        let mut results: Vec<Option<T>> = (0..slots).map(|_| None).collect();
        let plan = Self::plan(locations);
        debug!(
            requested = locations.len(),
            reads = plan.len(),
            "executing read plan"
        );
        for entry in plan {
            if let Some(location) = entry.location {
                results[entry.original_order] = Some(read(entry, location)?);
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct MapIndex {
        map: HashMap<FsId, Location>,
        lookups: RefCell<Vec<FsId>>,
    }

    impl LocationIndex for MapIndex {
        fn lookup(&self, id: &FsId) -> StoreResult<Option<Location>> {
            self.lookups.borrow_mut().push(id.clone());
            Ok(self.map.get(id).copied())
        }
    }

    fn id(s: &str) -> FsId {
        FsId::parse(s).unwrap()
    }

    fn loc(file_id: u32, offset: u64) -> Location {
        Location {
            file_id,
            offset,
            length: 16,
        }
    }

    fn index() -> MapIndex {
        let mut map = HashMap::new();
        map.insert(id("/t/a"), loc(1, 200));
        map.insert(id("/t/b"), loc(2, 0));
        map.insert(id("/t/c"), loc(1, 100));
        MapIndex {
            map,
            lookups: RefCell::new(Vec::new()),
        }
    }

    #[test]
    fn test_resolve_preserves_input_order() {
        let index = index();
        let ids = vec![id("/t/c"), id("/t/missing"), id("/t/a")];
        let resolved = resolve_all(&index, &FsIdOrder::from_ids(&ids)).unwrap();
        assert_eq!(resolved[0].id, ids[0]);
        assert_eq!(resolved[0].location, Some(loc(1, 100)));
        assert!(!resolved[1].exists());
        assert_eq!(resolved[2].original_order, 2);
        // lookups happen in key order
        assert_eq!(
            *index.lookups.borrow(),
            vec![id("/t/a"), id("/t/c"), id("/t/missing")]
        );
    }

    #[test]
    fn test_duplicate_ids_looked_up_once() {
        let index = index();
        let ids = vec![id("/t/a"), id("/t/a"), id("/t/a")];
        let resolved = resolve_all(&index, &FsIdOrder::from_ids(&ids)).unwrap();
        assert_eq!(index.lookups.borrow().len(), 1);
        assert!(resolved.iter().all(|r| r.location == Some(loc(1, 200))));
    }

    #[test]
    fn test_plan_orders_physically_and_skips_absent() {
        let index = index();
        let ids = vec![id("/t/a"), id("/t/b"), id("/t/nope"), id("/t/c")];
        let resolved = resolve_all(&index, &FsIdOrder::from_ids(&ids)).unwrap();
        let plan: Vec<&str> = ReadScheduler::plan(&resolved)
            .iter()
            .map(|l| l.id.name())
            .collect();
        assert_eq!(plan, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_execute_scatters_to_caller_order() {
        let index = index();
        let ids = vec![id("/t/a"), id("/t/b"), id("/t/c"), id("/t/zzz")];
        let resolved = resolve_all(&index, &FsIdOrder::from_ids(&ids)).unwrap();
        let mut physical = Vec::new();
        let results = ReadScheduler::execute(&resolved, |entry, location| {
            physical.push(entry.id.name().to_string());
            Ok(location.offset)
        })
        .unwrap();
        assert_eq!(physical, vec!["c", "a", "b"]);
        assert_eq!(results, vec![Some(200), Some(0), Some(100), None]);
    }

    #[test]
    fn test_stable_for_duplicates() {
        let resolved = vec![
            FsIdLocation {
                id: id("/t/x"),
                original_order: 0,
                location: Some(loc(1, 5)),
            },
            FsIdLocation {
                id: id("/t/x"),
                original_order: 1,
                location: Some(loc(1, 5)),
            },
        ];
        let plan = ReadScheduler::plan(&resolved);
        assert_eq!(plan[0].original_order, 0);
        assert_eq!(plan[1].original_order, 1);
    }
}
