//! Disk-resident B-tree mapping ids to record locations.

pub mod node;
pub mod node_io;
pub mod tree;

pub use node_io::{DiskNodeIo, PageOp};
pub use tree::{BTree, CheckReport};

/// Magic of a node page frame: "TSND".
pub const NODE_MAGIC: u32 = 0x5453_4E44;
/// Magic of the index file header frame: "TSIX".
pub const INDEX_MAGIC: u32 = 0x5453_4958;
/// Current index file format version.
pub const INDEX_VERSION: u32 = 1;
/// Framing overhead of a node page.
pub const PAGE_HEADER_LEN: usize = crate::frame::FRAME_HEADER_LEN;
/// Slot of the root node. The root never moves.
pub const ROOT_ADDR: u64 = 0;
