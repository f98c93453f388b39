//! # On-Disk Layout Constants
//!
//! This module centralizes the constants that define the on-disk format and
//! the transaction credit formulas. Constants that depend on each other are
//! co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! Geometry::block_size (512..4096 bytes, per volume)
//!       │
//!       ├─> extent block leaf/interior capacity
//!       │     (block_size - EXTENT_BLOCK_HEADER_SIZE - LIST_HEADER_SIZE)
//!       │         / EXTENT_REC_SIZE
//!       │
//!       ├─> root list capacity per owner
//!       │     (block_size - <owner root header size> - LIST_HEADER_SIZE)
//!       │         / EXTENT_REC_SIZE
//!       │
//!       ├─> truncate log capacity
//!       │     (block_size - TRUNCATE_LOG_HEADER_SIZE) / TRUNCATE_REC_SIZE
//!       │
//!       └─> JOURNAL_FRAME_HEADER_SIZE (32 bytes per frame)
//!             Each journal frame = header + one full block image
//!
//! MAX_TREE_DEPTH (5)
//!       │
//!       ├─> TreePath inline capacity (MAX_TREE_DEPTH + 1 nodes, root first)
//!       │
//!       └─> credit formulas below (worst case scales with depth)
//! ```
//!
//! ## Critical Invariants
//!
//! Enforced by compile-time assertions at the bottom of this file:
//!
//! 1. `EXTENT_REC_SIZE == 16` (leaf and interior records share one slot size)
//! 2. Every header size is a multiple of `EXTENT_REC_SIZE` alignment (8)
//! 3. The smallest supported block still fits a header plus several records

/// Number of non-root levels a tree may have. Depth 0 means records live
/// directly in the owner's root list; each level above that adds one layer of
/// extent blocks. Five levels of even modest fan-out outgrow any real volume.
pub const MAX_TREE_DEPTH: usize = 5;

// ============================================================================
// BLOCK GEOMETRY BOUNDS
// ============================================================================

/// Smallest supported block: 512 bytes (shift 9).
pub const MIN_BLOCK_SHIFT: u8 = 9;

/// Largest supported block: 4096 bytes (shift 12).
pub const MAX_BLOCK_SHIFT: u8 = 12;

/// Largest supported cluster: 1 MiB (shift 20). A cluster is never smaller
/// than a block.
pub const MAX_CLUSTER_SHIFT: u8 = 20;

pub const DEFAULT_BLOCK_SHIFT: u8 = 12;
pub const DEFAULT_CLUSTER_SHIFT: u8 = 12;

// ============================================================================
// ON-DISK STRUCTURE SIZES
// These are wire-format sizes; the zerocopy structs in ondisk/ carry
// matching compile-time assertions.
// ============================================================================

/// One extent record, leaf or interior. The two variants reinterpret the same
/// 16 bytes, so they must never diverge in size.
pub const EXTENT_REC_SIZE: usize = 16;

/// Extent list header preceding the record array inside any node.
pub const LIST_HEADER_SIZE: usize = 16;

/// Extent block header preceding the embedded list in a non-root node.
pub const EXTENT_BLOCK_HEADER_SIZE: usize = 48;

/// Root container header sizes. The root list starts immediately after and
/// runs to the end of the root block. Every root header is strictly larger
/// than [`EXTENT_BLOCK_HEADER_SIZE`]: a depth shift copies the whole root
/// list into a fresh extent block, and the copy must leave that block with
/// at least one free record slot.
pub const FILE_ROOT_HEADER_SIZE: usize = 64;
pub const ATTR_VALUE_ROOT_HEADER_SIZE: usize = 56;
pub const ATTR_TREE_ROOT_HEADER_SIZE: usize = 64;
pub const DIR_INDEX_ROOT_HEADER_SIZE: usize = 64;

/// Upper bound on the byte span a single attribute tree leaf may cover.
/// Stored in the attribute tree root, in clusters, at initialization.
pub const ATTR_TREE_LEAF_MAX_BYTES: u64 = 65536;

/// Truncate log block: header plus a dense array of 8-byte range records.
pub const TRUNCATE_LOG_HEADER_SIZE: usize = 32;
pub const TRUNCATE_REC_SIZE: usize = 8;

/// Journal frame header; each frame carries one block after-image.
pub const JOURNAL_FRAME_HEADER_SIZE: usize = 32;

// ============================================================================
// ON-DISK SIGNATURES
// Eight bytes, version-suffixed. Validated on every read of the matching
// structure; mismatch is a corruption report.
// ============================================================================

pub const EXTENT_BLOCK_SIG: &[u8; 8] = b"RFEXBL01";
pub const FILE_ROOT_SIG: &[u8; 8] = b"RFFIRT01";
pub const ATTR_VALUE_ROOT_SIG: &[u8; 8] = b"RFAVRT01";
pub const ATTR_TREE_ROOT_SIG: &[u8; 8] = b"RFATRT01";
pub const DIR_INDEX_ROOT_SIG: &[u8; 8] = b"RFDXRT01";
pub const TRUNCATE_LOG_SIG: &[u8; 8] = b"RFTLOG01";

// ============================================================================
// TRANSACTION CREDIT FORMULAS
// One credit covers write intent on one distinct block. Estimates are worst
// case for the operation; rotation extends mid-flight when a subtree spans
// more blocks than the original estimate covered.
// ============================================================================

/// Insert/remove/mark-written base estimate: both edge paths of a rotation
/// (2 * depth), the root, the rightmost leaf, and one slack block for the
/// sibling re-link.
pub const fn tree_op_credits(depth: u16) -> u32 {
    (depth as u32) * 2 + 3
}

/// Growth adds a chain of `depth` new blocks plus the root, the branch
/// target, and the previous rightmost leaf whose sibling pointer changes.
pub const fn grow_credits(depth: u16) -> u32 {
    depth as u32 + 3
}

/// Additional credits one subtree rotation step may need: both paths between
/// the subtree root and the leaves, plus the subtree root itself.
pub const fn rotate_subtree_credits(tree_depth: u16, subtree_depth: u16) -> u32 {
    (tree_depth.saturating_sub(subtree_depth) as u32) * 2 + 1
}

/// One truncation pass: the rightmost path, a left neighbor path, the root,
/// and the truncate log block.
pub const fn truncate_pass_credits(depth: u16) -> u32 {
    (depth as u32) * 2 + 4
}

// ============================================================================
// COMPILE-TIME INVARIANT CHECKS
// ============================================================================

const _: () = assert!(
    EXTENT_REC_SIZE == 16,
    "leaf and interior records reinterpret the same 16-byte slot"
);

const _: () = assert!(LIST_HEADER_SIZE % 8 == 0);
const _: () = assert!(EXTENT_BLOCK_HEADER_SIZE % 8 == 0);
const _: () = assert!(FILE_ROOT_HEADER_SIZE % 8 == 0);
const _: () = assert!(ATTR_VALUE_ROOT_HEADER_SIZE % 8 == 0);
const _: () = assert!(ATTR_TREE_ROOT_HEADER_SIZE % 8 == 0);
const _: () = assert!(DIR_INDEX_ROOT_HEADER_SIZE % 8 == 0);
const _: () = assert!(TRUNCATE_LOG_HEADER_SIZE % 8 == 0);

const _: () = assert!(FILE_ROOT_HEADER_SIZE > EXTENT_BLOCK_HEADER_SIZE);
const _: () = assert!(ATTR_VALUE_ROOT_HEADER_SIZE > EXTENT_BLOCK_HEADER_SIZE);
const _: () = assert!(ATTR_TREE_ROOT_HEADER_SIZE > EXTENT_BLOCK_HEADER_SIZE);
const _: () = assert!(DIR_INDEX_ROOT_HEADER_SIZE > EXTENT_BLOCK_HEADER_SIZE);

const _: () = assert!(
    (1usize << MIN_BLOCK_SHIFT)
        >= FILE_ROOT_HEADER_SIZE + LIST_HEADER_SIZE + 8 * EXTENT_REC_SIZE,
    "a 512-byte block must fit the largest root header plus at least 8 records"
);

const _: () = assert!(MAX_TREE_DEPTH < u16::MAX as usize);
