//! CLRS B-tree over [`DiskNodeIo`].
//!
//! Inserts split full nodes on the way down and deletes top up thin
//! children on the way down, so neither ever has to walk back up. The root
//! stays in slot 0: when it splits its contents move to a fresh slot, and
//! when it empties its only child is pulled back into slot 0.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::fsid::FsId;
use crate::location::{FsIdLocation, Location, LocationIndex};

use super::node::Node;
use super::node_io::DiskNodeIo;
use super::ROOT_ADDR;

/// Summary produced by [`BTree::check`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    /// Reachable nodes.
    pub nodes: u64,
    /// Stored keys.
    pub keys: u64,
    /// Levels, 1 for a lone root.
    pub depth: u32,
}

/// A B-tree of `FsId -> Location`.
pub struct BTree {
    io: DiskNodeIo,
    t: usize,
}

impl BTree {
    /// Wraps opened node storage.
    pub fn new(io: DiskNodeIo) -> Self {
        let t = io.min_degree() as usize;
        Self { io, t }
    }

    /// The underlying node storage.
    pub fn io(&self) -> &DiskNodeIo {
        &self.io
    }

    /// Mutable access to the node storage, for flush and recovery.
    pub fn io_mut(&mut self) -> &mut DiskNodeIo {
        &mut self.io
    }

    fn max_keys(&self) -> usize {
        2 * self.t - 1
    }

    /// Looks up `key`.
    pub fn find(&self, key: &FsId) -> StoreResult<Option<Location>> {
        let mut node = self.io.read(ROOT_ADDR)?;
        loop {
            match node.keys.binary_search(key) {
                Ok(i) => return Ok(Some(node.values[i])),
                Err(i) => {
                    if node.is_leaf() {
                        return Ok(None);
                    }
                    let child = *node.children.get(i).ok_or_else(|| {
                        StoreError::corruption(format!("node {} is missing child {}", node.addr, i))
                    })?;
                    node = self.io.read(child)?;
                }
            }
        }
    }

    /// Resolves one id into a single-slot [`FsIdLocation`].
    pub fn resolve(&self, id: &FsId) -> StoreResult<FsIdLocation> {
        Ok(FsIdLocation {
            id: id.clone(),
            original_order: 0,
            location: self.find(id)?,
        })
    }

    /// Inserts or replaces `key`, returning the previous location.
    pub fn insert(&mut self, key: FsId, value: Location) -> StoreResult<Option<Location>> {
        let root = self.io.read(ROOT_ADDR)?;
        if root.keys.len() == self.max_keys() {
            // move the old root to a new slot and grow a level above it
            let moved_addr = self.io.allocate();
            let mut moved = Node::clone(&root);
            moved.addr = moved_addr;
            self.io.write(moved);
            let mut new_root = Node::leaf(ROOT_ADDR);
            new_root.children.push(moved_addr);
            self.split_child(&mut new_root, 0)?;
            debug!(moved_to = moved_addr, "b-tree grew a level");
        }

        let mut node = Node::clone(&*self.io.read(ROOT_ADDR)?);
        loop {
            match node.keys.binary_search(&key) {
                Ok(i) => {
                    let old = std::mem::replace(&mut node.values[i], value);
                    self.io.write(node);
                    return Ok(Some(old));
                }
                Err(mut i) => {
                    if node.is_leaf() {
                        node.keys.insert(i, key);
                        node.values.insert(i, value);
                        self.io.write(node);
                        return Ok(None);
                    }
                    let child = self.io.read(node.children[i])?;
                    if child.keys.len() == self.max_keys() {
                        self.split_child(&mut node, i)?;
                        match key.cmp(&node.keys[i]) {
                            std::cmp::Ordering::Equal => {
                                let old = std::mem::replace(&mut node.values[i], value);
                                self.io.write(node);
                                return Ok(Some(old));
                            }
                            std::cmp::Ordering::Greater => i += 1,
                            std::cmp::Ordering::Less => {}
                        }
                    }
                    node = Node::clone(&*self.io.read(node.children[i])?);
                }
            }
        }
    }

    /// Splits the full child `i` of `parent` and writes all three nodes.
    fn split_child(&mut self, parent: &mut Node, i: usize) -> StoreResult<()> {
        let t = self.t;
        let mut left = Node::clone(&*self.io.read(parent.children[i])?);
        let right_addr = self.io.allocate();
        let mut right = Node::leaf(right_addr);
        right.keys = left.keys.split_off(t);
        right.values = left.values.split_off(t);
        if !left.is_leaf() {
            right.children = left.children.split_off(t);
        }
        let (median_key, median_value) = match (left.keys.pop(), left.values.pop()) {
            (Some(k), Some(v)) => (k, v),
            _ => {
                return Err(StoreError::corruption(format!(
                    "split of non-full node {}",
                    left.addr
                )))
            }
        };
        parent.keys.insert(i, median_key);
        parent.values.insert(i, median_value);
        parent.children.insert(i + 1, right_addr);
        self.io.write(left);
        self.io.write(right);
        self.io.write(parent.clone());
        Ok(())
    }

    /// Removes `key`, returning its location if it was present.
    pub fn delete(&mut self, key: &FsId) -> StoreResult<Option<Location>> {
        let removed = self.delete_from(ROOT_ADDR, key)?;
        let root = self.io.read(ROOT_ADDR)?;
        if root.keys.is_empty() && !root.is_leaf() {
            // shrink a level by pulling the only child into the root slot
            let child_addr = root.children[0];
            let mut child = Node::clone(&*self.io.read(child_addr)?);
            child.addr = ROOT_ADDR;
            self.io.write(child);
            self.io.free(child_addr);
            debug!(freed = child_addr, "b-tree lost a level");
        }
        Ok(removed)
    }

    fn delete_from(&mut self, addr: u64, key: &FsId) -> StoreResult<Option<Location>> {
        let t = self.t;
        let mut node = Node::clone(&*self.io.read(addr)?);
        match node.keys.binary_search(key) {
            Ok(i) if node.is_leaf() => {
                node.keys.remove(i);
                let old = node.values.remove(i);
                self.io.write(node);
                Ok(Some(old))
            }
            Ok(i) => {
                let old = node.values[i];
                let left = self.io.read(node.children[i])?;
                if left.keys.len() >= t {
                    let (pk, pv) = self.max_entry(node.children[i])?;
                    node.keys[i] = pk.clone();
                    node.values[i] = pv;
                    let child = node.children[i];
                    self.io.write(node);
                    self.delete_from(child, &pk)?;
                    return Ok(Some(old));
                }
                let right = self.io.read(node.children[i + 1])?;
                if right.keys.len() >= t {
                    let (sk, sv) = self.min_entry(node.children[i + 1])?;
                    node.keys[i] = sk.clone();
                    node.values[i] = sv;
                    let child = node.children[i + 1];
                    self.io.write(node);
                    self.delete_from(child, &sk)?;
                    return Ok(Some(old));
                }
                let merged = self.merge_children(&mut node, i)?;
                self.delete_from(merged, key)
            }
            Err(_) if node.is_leaf() => Ok(None),
            Err(i) => {
                let child = self.ensure_child_has_spare(&mut node, i)?;
                self.delete_from(child, key)
            }
        }
    }

    /// Makes sure child `i` of `node` holds at least `t` keys by borrowing
    /// from a sibling or merging with one. Returns the slot to descend into.
    fn ensure_child_has_spare(&mut self, node: &mut Node, i: usize) -> StoreResult<u64> {
        let t = self.t;
        let child = self.io.read(node.children[i])?;
        if child.keys.len() >= t {
            return Ok(child.addr);
        }
        if i > 0 {
            let left = self.io.read(node.children[i - 1])?;
            if left.keys.len() >= t {
                let mut left = Node::clone(&left);
                let mut child = Node::clone(&child);
                let (lk, lv) = match (left.keys.pop(), left.values.pop()) {
                    (Some(k), Some(v)) => (k, v),
                    _ => return Err(StoreError::corruption("borrow from empty sibling")),
                };
                let sep_k = std::mem::replace(&mut node.keys[i - 1], lk);
                let sep_v = std::mem::replace(&mut node.values[i - 1], lv);
                child.keys.insert(0, sep_k);
                child.values.insert(0, sep_v);
                if let Some(c) = left.children.pop() {
                    child.children.insert(0, c);
                }
                let addr = child.addr;
                self.io.write(left);
                self.io.write(child);
                self.io.write(node.clone());
                return Ok(addr);
            }
        }
        if i + 1 < node.children.len() {
            let right = self.io.read(node.children[i + 1])?;
            if right.keys.len() >= t {
                let mut right = Node::clone(&right);
                let mut child = Node::clone(&child);
                let rk = right.keys.remove(0);
                let rv = right.values.remove(0);
                let sep_k = std::mem::replace(&mut node.keys[i], rk);
                let sep_v = std::mem::replace(&mut node.values[i], rv);
                child.keys.push(sep_k);
                child.values.push(sep_v);
                if !right.is_leaf() {
                    child.children.push(right.children.remove(0));
                }
                let addr = child.addr;
                self.io.write(right);
                self.io.write(child);
                self.io.write(node.clone());
                return Ok(addr);
            }
        }
        if i + 1 < node.children.len() {
            self.merge_children(node, i)
        } else {
            self.merge_children(node, i - 1)
        }
    }

    /// Merges child `i + 1` and separator `i` into child `i`, frees the
    /// right slot and writes both remaining nodes. Returns the merged slot.
    fn merge_children(&mut self, node: &mut Node, i: usize) -> StoreResult<u64> {
        let mut left = Node::clone(&*self.io.read(node.children[i])?);
        let right = Node::clone(&*self.io.read(node.children[i + 1])?);
        left.keys.push(node.keys.remove(i));
        left.values.push(node.values.remove(i));
        node.children.remove(i + 1);
        left.keys.extend(right.keys);
        left.values.extend(right.values);
        left.children.extend(right.children);
        let addr = left.addr;
        self.io.free(right.addr);
        self.io.write(left);
        self.io.write(node.clone());
        Ok(addr)
    }

    fn max_entry(&self, mut addr: u64) -> StoreResult<(FsId, Location)> {
        loop {
            let node = self.io.read(addr)?;
            if node.is_leaf() {
                return match (node.keys.last(), node.values.last()) {
                    (Some(k), Some(v)) => Ok((k.clone(), *v)),
                    _ => Err(StoreError::corruption(format!("empty leaf {}", addr))),
                };
            }
            addr = *node
                .children
                .last()
                .ok_or_else(|| StoreError::corruption(format!("childless node {}", addr)))?;
        }
    }

    fn min_entry(&self, mut addr: u64) -> StoreResult<(FsId, Location)> {
        loop {
            let node = self.io.read(addr)?;
            if node.is_leaf() {
                return match (node.keys.first(), node.values.first()) {
                    (Some(k), Some(v)) => Ok((k.clone(), *v)),
                    _ => Err(StoreError::corruption(format!("empty leaf {}", addr))),
                };
            }
            addr = node.children[0];
        }
    }

    /// Visits entries with key `>= start` in ascending order until `visit`
    /// returns false.
    pub fn scan_from<F>(&self, start: Option<&FsId>, mut visit: F) -> StoreResult<()>
    where
        F: FnMut(&FsId, &Location) -> bool,
    {
        self.scan_node(ROOT_ADDR, start, &mut visit)?;
        Ok(())
    }

    // returns false once the visitor asked to stop
    fn scan_node<F>(&self, addr: u64, start: Option<&FsId>, visit: &mut F) -> StoreResult<bool>
    where
        F: FnMut(&FsId, &Location) -> bool,
    {
        let node = self.io.read(addr)?;
        let first = match start {
            Some(s) => node.keys.partition_point(|k| k < s),
            None => 0,
        };
        for i in first..=node.keys.len() {
            if !node.is_leaf() {
                let bound = if i == first { start } else { None };
                if !self.scan_node(node.children[i], bound, visit)? {
                    return Ok(false);
                }
            }
            if i < node.keys.len() && !visit(&node.keys[i], &node.values[i]) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Every entry in key order.
    pub fn entries(&self) -> StoreResult<Vec<(FsId, Location)>> {
        let mut out = Vec::new();
        self.scan_from(None, |k, v| {
            out.push((k.clone(), *v));
            true
        })?;
        Ok(out)
    }

    /// Number of keys. Walks the whole tree.
    pub fn len(&self) -> StoreResult<u64> {
        let mut n = 0;
        self.scan_from(None, |_, _| {
            n += 1;
            true
        })?;
        Ok(n)
    }

    /// Returns true if the tree holds no keys.
    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.io.read(ROOT_ADDR)?.keys.is_empty())
    }

    /// Verifies ordering, occupancy, uniform leaf depth and that the set of
    /// allocated slots is exactly the set of reachable nodes.
    pub fn check(&self) -> StoreResult<CheckReport> {
        let mut report = CheckReport::default();
        let mut seen = HashSet::new();
        let mut leaf_depth = None;
        self.check_node(ROOT_ADDR, None, None, 1, &mut seen, &mut leaf_depth, &mut report)?;
        report.depth = leaf_depth.unwrap_or(1);

        if !self.io.has_pending() {
            for slot in self.io.allocated_slots() {
                if !seen.contains(&slot) {
                    return Err(StoreError::corruption(format!(
                        "allocated slot {} is not reachable from the root",
                        slot
                    )));
                }
            }
        }
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn check_node(
        &self,
        addr: u64,
        lower: Option<&FsId>,
        upper: Option<&FsId>,
        depth: u32,
        seen: &mut HashSet<u64>,
        leaf_depth: &mut Option<u32>,
        report: &mut CheckReport,
    ) -> StoreResult<()> {
        if !seen.insert(addr) {
            return Err(StoreError::corruption(format!("node {} reachable twice", addr)));
        }
        let node: Arc<Node> = self.io.read(addr)?;
        report.nodes += 1;
        report.keys += node.keys.len() as u64;

        if node.keys.len() > self.max_keys() {
            return Err(StoreError::corruption(format!(
                "node {} holds {} keys, max is {}",
                addr,
                node.keys.len(),
                self.max_keys()
            )));
        }
        if addr != ROOT_ADDR && node.keys.len() < self.t - 1 {
            return Err(StoreError::corruption(format!(
                "node {} holds {} keys, min is {}",
                addr,
                node.keys.len(),
                self.t - 1
            )));
        }
        if node.keys.windows(2).any(|w| w[0] >= w[1]) {
            return Err(StoreError::corruption(format!("keys of node {} out of order", addr)));
        }
        let below_lower = lower.is_some_and(|l| node.keys.first().is_some_and(|k| k <= l));
        let above_upper = upper.is_some_and(|u| node.keys.last().is_some_and(|k| k >= u));
        if below_lower || above_upper {
            return Err(StoreError::corruption(format!(
                "keys of node {} escape their parent's bounds",
                addr
            )));
        }

        if node.is_leaf() {
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(d) if d != depth => {
                    return Err(StoreError::corruption(format!(
                        "leaf {} at depth {}, others at {}",
                        addr, depth, d
                    )))
                }
                _ => {}
            }
            return Ok(());
        }
        if node.children.len() != node.keys.len() + 1 {
            return Err(StoreError::corruption(format!(
                "node {} has {} keys and {} children",
                addr,
                node.keys.len(),
                node.children.len()
            )));
        }
        for (i, &child) in node.children.iter().enumerate() {
            let lo = if i == 0 { lower } else { Some(&node.keys[i - 1]) };
            let hi = node.keys.get(i).or(upper);
            self.check_node(child, lo, hi, depth + 1, seen, leaf_depth, report)?;
        }
        Ok(())
    }
}

impl LocationIndex for BTree {
    fn lookup(&self, id: &FsId) -> StoreResult<Option<Location>> {
        self.find(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NodeCache;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn open(dir: &TempDir, t: u32) -> BTree {
        let io = DiskNodeIo::open(
            &dir.path().join("t.idx"),
            &dir.path().join("t.bits"),
            8192,
            t,
            Arc::new(NodeCache::new("t", 64)),
        )
        .unwrap();
        BTree::new(io)
    }

    fn key(i: u32) -> FsId {
        FsId::new("/k", &format!("{:05}", i)).unwrap()
    }

    fn loc(i: u32) -> Location {
        Location {
            file_id: i % 3,
            offset: i as u64 * 10,
            length: 10,
        }
    }

    #[test]
    fn test_insert_find_small() {
        let dir = TempDir::new().unwrap();
        let mut tree = open(&dir, 2);
        assert_eq!(tree.find(&key(1)).unwrap(), None);
        assert_eq!(tree.insert(key(1), loc(1)).unwrap(), None);
        assert_eq!(tree.find(&key(1)).unwrap(), Some(loc(1)));
        assert_eq!(tree.insert(key(1), loc(2)).unwrap(), Some(loc(1)));
        assert_eq!(tree.find(&key(1)).unwrap(), Some(loc(2)));
    }

    #[test]
    fn test_resolve_reports_existence() {
        let dir = TempDir::new().unwrap();
        let mut tree = open(&dir, 2);
        tree.insert(key(7), loc(7)).unwrap();
        let hit = tree.resolve(&key(7)).unwrap();
        assert!(hit.exists());
        assert_eq!(hit.offset(), 70);
        assert!(!tree.resolve(&key(8)).unwrap().exists());
    }

    #[test]
    fn test_many_inserts_keep_structure() {
        let dir = TempDir::new().unwrap();
        let mut tree = open(&dir, 2);
        // interleaved order exercises splits on both sides
        for i in (0..200).map(|i| (i * 37) % 200) {
            tree.insert(key(i), loc(i)).unwrap();
        }
        let report = tree.check().unwrap();
        assert_eq!(report.keys, 200);
        assert!(report.depth > 2);
        for i in 0..200 {
            assert_eq!(tree.find(&key(i)).unwrap(), Some(loc(i)));
        }
    }

    #[test]
    fn test_delete_everything_in_mixed_order() {
        let dir = TempDir::new().unwrap();
        let mut tree = open(&dir, 2);
        for i in 0..150 {
            tree.insert(key(i), loc(i)).unwrap();
        }
        tree.io_mut().flush(false).unwrap();
        for i in (0..150).map(|i| (i * 53) % 150) {
            assert_eq!(tree.delete(&key(i)).unwrap(), Some(loc(i)), "key {}", i);
            assert_eq!(tree.delete(&key(i)).unwrap(), None);
            tree.check().unwrap();
        }
        assert!(tree.is_empty().unwrap());
        tree.io_mut().flush(false).unwrap();
        // only the root slot may remain allocated
        assert!(tree.io().allocated_slots().iter().all(|&s| s == ROOT_ADDR));
        tree.check().unwrap();
    }

    #[test]
    fn test_matches_btreemap_model_and_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let mut model = BTreeMap::new();
        {
            let mut tree = open(&dir, 3);
            for step in 0..600u32 {
                let k = (step * 7919) % 257;
                if step % 3 == 2 {
                    assert_eq!(tree.delete(&key(k)).unwrap(), model.remove(&key(k)));
                } else {
                    assert_eq!(tree.insert(key(k), loc(step)).unwrap(), model.insert(key(k), loc(step)));
                }
                if step % 50 == 0 {
                    tree.io_mut().flush(true).unwrap();
                    tree.check().unwrap();
                }
            }
            tree.io_mut().flush(true).unwrap();
        }
        let tree = open(&dir, 3);
        tree.check().unwrap();
        let entries = tree.entries().unwrap();
        let expected: Vec<(FsId, Location)> = model.into_iter().collect();
        assert_eq!(entries, expected);
    }

    #[test]
    fn test_scan_from_and_stop() {
        let dir = TempDir::new().unwrap();
        let mut tree = open(&dir, 2);
        for i in 0..50 {
            tree.insert(key(i), loc(i)).unwrap();
        }
        let mut seen = Vec::new();
        tree.scan_from(Some(&key(17)), |k, _| {
            seen.push(k.clone());
            seen.len() < 5
        })
        .unwrap();
        assert_eq!(seen, (17..22).map(key).collect::<Vec<_>>());
        assert_eq!(tree.len().unwrap(), 50);
    }

    #[test]
    fn test_root_stays_in_slot_zero() {
        let dir = TempDir::new().unwrap();
        let mut tree = open(&dir, 2);
        for i in 0..20 {
            tree.insert(key(i), loc(i)).unwrap();
        }
        tree.io_mut().flush(true).unwrap();
        let root = tree.io().read(ROOT_ADDR).unwrap();
        assert_eq!(root.addr, ROOT_ADDR);
        assert!(!root.is_leaf());
    }
}
