//! # On-Disk Formats
//!
//! Every structure the tree persists, as zerocopy views over raw block bytes.
//! Multi-byte fields are little-endian wrapper types so the structs can be
//! cast directly from mmap'd or heap-backed block buffers without copying.
//!
//! ## Layout
//!
//! ```text
//! Root block (one of four owner formats, roots.rs):
//! ┌───────────────────────┬──────────────┬────────────────────────────┐
//! │ owner root header     │ list header  │ extent records ...         │
//! │ (56 or 64 bytes)      │ (16 bytes)   │ (16 bytes each, to end)    │
//! └───────────────────────┴──────────────┴────────────────────────────┘
//!
//! Extent block (non-root node, block.rs):
//! ┌───────────────────────┬──────────────┬────────────────────────────┐
//! │ extent block header   │ list header  │ extent records ...         │
//! │ (48 bytes)            │ (16 bytes)   │ (16 bytes each, to end)    │
//! └───────────────────────┴──────────────┴────────────────────────────┘
//!
//! Truncate log block (tlog.rs):
//! ┌───────────────────────┬────────────────────────────────────────────┐
//! │ truncate log header   │ {start_cluster, cluster_count} ranges ...  │
//! │ (32 bytes)            │ (8 bytes each, to end)                     │
//! └───────────────────────┴────────────────────────────────────────────┘
//! ```
//!
//! A record is 16 bytes in both leaf and interior nodes; bytes 4..8 are
//! reinterpreted by the containing node's depth. That reinterpretation is
//! confined to [`record`]; everything else works with the decoded
//! [`record::ExtentRec`] sum type.
//!
//! Validation philosophy: view constructors take the block number they were
//! read from and report structural problems as [`crate::error::Error::Corrupt`]
//! with that block, so callers can degrade the volume with a useful location.

pub mod block;
pub mod list;
pub mod record;
pub mod roots;
pub mod tlog;

pub use block::{seal_block, verify_block_check, EbMut, EbRef, ExtentBlockHeader};
pub use list::{list_capacity, ListHeader, ListMut, ListRef};
pub use record::{ExtentRec, InteriorRec, LeafRec, RawExtentRec, RecFlags};
pub use roots::{
    AttrTreeRootHeader, AttrValueRootHeader, DirIndexRootHeader, FileRootHeader, RootFormat,
};
pub use tlog::{TlogMut, TlogRef, TruncateLogHeader, TruncateRec};
