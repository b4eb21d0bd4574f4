//! B-tree node layout and page encoding.

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::frame;
use crate::fsid::{FsId, MAX_FSID_LEN};
use crate::location::Location;

use super::{NODE_MAGIC, PAGE_HEADER_LEN};

/// One B-tree node. A node with no children is a leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Page slot of this node.
    pub addr: u64,
    /// Sorted keys.
    pub keys: Vec<FsId>,
    /// `values[i]` belongs to `keys[i]`.
    pub values: Vec<Location>,
    /// Child slots; `keys.len() + 1` of them in an internal node.
    pub children: Vec<u64>,
}

impl Node {
    /// An empty leaf at `addr`.
    pub fn leaf(addr: u64) -> Self {
        Self {
            addr,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Returns true if the node has no children.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Encodes the node into a zero-padded page of `page_size` bytes.
    pub fn to_page(&self, page_size: usize) -> StoreResult<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        let mut page = frame::encode(NODE_MAGIC, &payload);
        if page.len() > page_size {
            return Err(StoreError::InvalidArgument(format!(
                "node {} encodes to {} bytes, page size is {}",
                self.addr,
                page.len(),
                page_size
            )));
        }
        page.resize(page_size, 0);
        Ok(page)
    }

    /// Decodes and verifies the page read for slot `addr`.
    pub fn from_page(addr: u64, page: &[u8]) -> StoreResult<Self> {
        let payload = frame::decode(NODE_MAGIC, page)
            .map_err(|e| StoreError::corruption(format!("node page {}: {}", addr, e)))?;
        let node: Node = bincode::deserialize(payload)
            .map_err(|e| StoreError::corruption(format!("node page {}: {}", addr, e)))?;
        if node.addr != addr {
            return Err(StoreError::corruption(format!(
                "page at slot {} claims to be node {}",
                addr, node.addr
            )));
        }
        if node.values.len() != node.keys.len() {
            return Err(StoreError::corruption(format!(
                "node {} has {} keys but {} values",
                addr,
                node.keys.len(),
                node.values.len()
            )));
        }
        Ok(node)
    }
}

/// Upper bound of the bincode size of a full node (`2t - 1` keys of
/// maximum length) for minimum degree `t`.
pub fn max_encoded_len(min_degree: u32) -> usize {
    let t = min_degree as usize;
    let max_keys = 2 * t - 1;
    // path and name strings each carry a u64 length; the separating '/'
    // is not stored
    let key = 2 * 8 + MAX_FSID_LEN;
    let value = 4 + 8 + 4;
    8 // addr
        + 8 + max_keys * key
        + 8 + max_keys * value
        + 8 + (max_keys + 1) * 8
}

/// Bytes a full page must hold for minimum degree `t`.
pub fn page_bytes_needed(min_degree: u32) -> usize {
    max_encoded_len(min_degree) + PAGE_HEADER_LEN
}
