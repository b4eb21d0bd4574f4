//! Page-level storage of B-tree nodes with staged writes and a node cache.
//!
//! Layout of an index file: page 0 is the header, node slot `i` lives at
//! byte offset `(i + 1) * page_size`. Slot 0 is the root. A companion
//! bitset marks which slots hold a live node.
//!
//! Mutations are staged as pending page ops. Reads see pending ops first,
//! then the cache, then disk. `flush` writes the pending pages and bitset
//! changes; nothing reaches the index files before that.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bitset::PersistentBitSet;
use crate::cache::NodeCache;
use crate::error::{StoreError, StoreResult};
use crate::frame;

use super::node::{page_bytes_needed, Node};
use super::{INDEX_MAGIC, INDEX_VERSION, ROOT_ADDR};

/// A staged change to one node slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PageOp {
    /// Write the node to its slot and mark the slot allocated.
    Write(Node),
    /// Free the slot.
    Delete(u64),
}

impl PageOp {
    /// Slot the op applies to.
    pub fn addr(&self) -> u64 {
        match self {
            PageOp::Write(node) => node.addr,
            PageOp::Delete(addr) => *addr,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexHeader {
    version: u32,
    page_size: u32,
    min_degree: u32,
}

/// Disk-backed node storage for one tree.
pub struct DiskNodeIo {
    file: File,
    path: PathBuf,
    page_size: u32,
    min_degree: u32,
    slots: PersistentBitSet,
    pending: BTreeMap<u64, PageOp>,
    cache: Arc<NodeCache>,
}

impl DiskNodeIo {
    /// Opens or creates the index file at `path` and its slot bitset at
    /// `bits_path`. An existing file must agree on page size and degree.
    pub fn open(
        path: &Path,
        bits_path: &Path,
        page_size: u32,
        min_degree: u32,
        cache: Arc<NodeCache>,
    ) -> StoreResult<Self> {
        if page_bytes_needed(min_degree) > page_size as usize {
            return Err(StoreError::InvalidConfig(format!(
                "page size {} too small for min degree {}",
                page_size, min_degree
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            let header = IndexHeader {
                version: INDEX_VERSION,
                page_size,
                min_degree,
            };
            let mut page = frame::encode(INDEX_MAGIC, &bincode::serialize(&header)?);
            page.resize(page_size as usize, 0);
            file.write_all_at(&page, 0)?;
            file.sync_all()?;
            info!(path = %path.display(), page_size, min_degree, "created index file");
        } else {
            let mut page = vec![0u8; page_size.min(len as u32) as usize];
            file.read_exact_at(&mut page, 0)?;
            let payload = frame::decode(INDEX_MAGIC, &page).map_err(|e| {
                StoreError::corruption(format!("index header of {}: {}", path.display(), e))
            })?;
            let header: IndexHeader = bincode::deserialize(payload)?;
            if header.version != INDEX_VERSION
                || header.page_size != page_size
                || header.min_degree != min_degree
            {
                return Err(StoreError::InvalidConfig(format!(
                    "{} was created with version {}, page size {}, min degree {}",
                    path.display(),
                    header.version,
                    header.page_size,
                    header.min_degree
                )));
            }
        }
        let slots = PersistentBitSet::open(bits_path)?;
        debug!(
            path = %path.display(),
            nodes = slots.cardinality(),
            "opened node storage"
        );
        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size,
            min_degree,
            slots,
            pending: BTreeMap::new(),
            cache,
        })
    }

    /// Minimum degree the file was created with.
    pub fn min_degree(&self) -> u32 {
        self.min_degree
    }

    /// The node cache serving this file.
    pub fn cache(&self) -> &Arc<NodeCache> {
        &self.cache
    }

    /// Index file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns true if slot `addr` holds a node, counting pending ops.
    pub fn is_allocated(&self, addr: u64) -> bool {
        match self.pending.get(&addr) {
            Some(PageOp::Write(_)) => true,
            Some(PageOp::Delete(_)) => false,
            None => self.slots.get(addr),
        }
    }

    /// Slots allocated on disk, ignoring pending ops.
    pub fn allocated_slots(&self) -> Vec<u64> {
        self.slots.all_index(true)
    }

    /// Reads the node in slot `addr`. An unallocated root reads as an empty
    /// leaf; any other unallocated slot is corruption.
    pub fn read(&self, addr: u64) -> StoreResult<Arc<Node>> {
        match self.pending.get(&addr) {
            Some(PageOp::Write(node)) => return Ok(Arc::new(node.clone())),
            Some(PageOp::Delete(_)) => {
                return Err(StoreError::corruption(format!(
                    "read of freed node slot {} in {}",
                    addr,
                    self.path.display()
                )))
            }
            None => {}
        }
        if let Some(node) = self.cache.get(addr) {
            return Ok(node);
        }
        if !self.slots.get(addr) {
            if addr == ROOT_ADDR {
                return Ok(Arc::new(Node::leaf(ROOT_ADDR)));
            }
            return Err(StoreError::corruption(format!(
                "reference to unallocated node slot {} in {}",
                addr,
                self.path.display()
            )));
        }
        let mut page = vec![0u8; self.page_size as usize];
        self.file.read_exact_at(&mut page, self.slot_offset(addr))?;
        let node = Arc::new(Node::from_page(addr, &page)?);
        self.cache.insert(addr, Arc::clone(&node));
        Ok(node)
    }

    /// Stages a write of `node` to its slot.
    pub fn write(&mut self, node: Node) {
        self.pending.insert(node.addr, PageOp::Write(node));
    }

    /// Stages freeing slot `addr`.
    pub fn free(&mut self, addr: u64) {
        self.pending.insert(addr, PageOp::Delete(addr));
    }

    /// Picks an unused slot. Slots with any pending op are skipped so a
    /// freed slot is not reused before the free is flushed.
    pub fn allocate(&mut self) -> u64 {
        let mut from = ROOT_ADDR + 1;
        loop {
            let candidate = self.slots.find_next_false(from);
            if !self.pending.contains_key(&candidate) {
                self.pending
                    .insert(candidate, PageOp::Write(Node::leaf(candidate)));
                return candidate;
            }
            from = candidate + 1;
        }
    }

    /// Returns true if there are staged ops.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// The staged ops in slot order.
    pub fn pending_ops(&self) -> Vec<PageOp> {
        self.pending.values().cloned().collect()
    }

    /// Stages ops recovered from the journal.
    pub fn stage(&mut self, ops: Vec<PageOp>) {
        for op in ops {
            self.pending.insert(op.addr(), op);
        }
    }

    /// Drops all staged ops.
    pub fn discard_pending(&mut self) {
        if !self.pending.is_empty() {
            debug!(path = %self.path.display(), ops = self.pending.len(), "discarded pending node ops");
            self.pending.clear();
        }
    }

    /// Writes staged pages and slot bits to disk. With `sync`, both files
    /// are fsynced before returning. Replaying the same ops is idempotent.
    pub fn flush(&mut self, sync: bool) -> StoreResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let ops = std::mem::take(&mut self.pending);
        let mut written = Vec::new();
        let mut freed = Vec::new();
        for op in ops.into_values() {
            match op {
                PageOp::Write(node) => {
                    let page = node.to_page(self.page_size as usize)?;
                    self.file.write_all_at(&page, self.slot_offset(node.addr))?;
                    written.push(node.addr);
                    self.cache.insert(node.addr, Arc::new(node));
                }
                PageOp::Delete(addr) => {
                    freed.push(addr);
                    self.cache.remove(addr);
                }
            }
        }
        self.slots.update(&written, true)?;
        self.slots.update(&freed, false)?;
        if !freed.is_empty() {
            self.slots.truncate_end_if_empty()?;
            let keep = (self.slots.len() + 1) * self.page_size as u64;
            if self.file.metadata()?.len() > keep {
                self.file.set_len(keep)?;
            }
        }
        if sync {
            self.file.sync_all()?;
            self.slots.sync()?;
        }
        debug!(
            path = %self.path.display(),
            written = written.len(),
            freed = freed.len(),
            "flushed node pages"
        );
        Ok(())
    }

    /// Frees every node and drops pending ops, leaving an empty root and a
    /// header-only index file.
    pub fn reset(&mut self, sync: bool) -> StoreResult<()> {
        self.pending.clear();
        self.cache.clear();
        self.slots.truncate(0)?;
        self.file.set_len(self.page_size as u64)?;
        if sync {
            self.file.sync_all()?;
            self.slots.sync()?;
        }
        info!(path = %self.path.display(), "reset node storage");
        Ok(())
    }

    fn slot_offset(&self, addr: u64) -> u64 {
        (addr + 1) * self.page_size as u64
    }
}
