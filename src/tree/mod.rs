//! # Extent Tree Engine
//!
//! This module implements the allocation B-tree that maps an owner's
//! logical cluster space to physical clusters. Four owner structures embed
//! such a tree: file cluster maps, attribute value maps, the attribute
//! index tree, and directory lookup indexes. The engine is one body of
//! code; per-owner differences live behind the [`RootOps`] vtable chosen
//! at handle construction.
//!
//! ## Node Types
//!
//! - **Root list**: embedded in the owner's root block after the owner
//!   header. Capacity is whatever fits in the block, so it is small.
//! - **Extent blocks**: dedicated metadata blocks below the root, each an
//!   [`ExtentBlockHeader`](crate::ondisk::ExtentBlockHeader) plus a list.
//!
//! A list's depth tag decides how its records decode: depth 0 holds leaf
//! records (16-bit length, flags), anything deeper holds interior records
//! (32-bit length, no flags). Leaves are threaded left to right through
//! `next_leaf_blk`, and the root caches the rightmost leaf's address.
//!
//! ## Path Model
//!
//! Mutations descend from the root and keep a bounded stack of visited
//! blocks (the [`TreePath`]). The path stores block numbers only; views
//! are re-derived from the store at each touch, so no borrow outlives a
//! block access and the borrow checker rules out stale views.
//!
//! ## Mutation Protocol
//!
//! Every mutation runs inside a journal transaction: declare intent on a
//! block, change it, mark it dirty. Sizing comes from the credit formulas
//! in [`config`](crate::config); rotation extends the transaction when a
//! subtree spans more blocks than estimated.
//!
//! ## Keeping Order Without Merging Nodes
//!
//! The tree never rebalances across siblings on removal. Instead:
//!
//! - Inserting into a full leaf first rotates records rightward through
//!   interior boundaries to open a slot near the insert point.
//! - Removal leaves a zero-length record at slot 0, and a leftward
//!   rotation walks it off the tree, unlinking emptied subtrees into the
//!   deferred-reclaim context.
//!
//! An interior record always covers exactly its child's range; the edge
//! adjustment helpers in `rotate` restore that after every boundary move.

mod grow;
mod insert;
mod merge;
mod path;
mod rotate;
mod tree;
mod truncate;

pub use tree::ExtentTree;

pub(crate) use path::{PathNode, TreePath};

use crate::error::{Error, Result};
use crate::ondisk::record::{LeafRec, RecFlags};
use crate::ondisk::roots::{
    AttrTreeRootHeader, AttrValueRootHeader, DirIndexRootHeader, FileRootHeader, RootFormat,
};

fn apply_cluster_delta(current: u32, delta: i64) -> Result<u32> {
    let next = i64::from(current) + delta;
    if next < 0 || next > i64::from(u32::MAX) {
        return Err(Error::invariant(format!(
            "cluster count {} cannot absorb delta {}",
            current, delta
        )));
    }
    Ok(next as u32)
}

fn reject_unwritten(rec: &LeafRec) -> Result<()> {
    if rec.flags.contains(RecFlags::UNWRITTEN) {
        return Err(Error::invariant(
            "unwritten extents are only valid in file cluster maps",
        ));
    }
    Ok(())
}

/// Owner dispatch. One implementation per root container format; the
/// engine reads and writes owner fields only through this trait.
pub trait RootOps: Sync {
    fn format(&self) -> RootFormat;

    fn validate(&self, data: &[u8], blkno: u64) -> Result<()>;

    fn fs_generation(&self, data: &[u8], blkno: u64) -> Result<u32>;

    fn last_leaf_blk(&self, data: &[u8], blkno: u64) -> Result<u64>;

    fn set_last_leaf_blk(&self, data: &mut [u8], blkno: u64, leaf: u64) -> Result<()>;

    fn clusters(&self, data: &[u8], blkno: u64) -> Result<u32>;

    /// Apply a signed delta to the owner's total cluster count.
    fn update_clusters(&self, data: &mut [u8], blkno: u64, delta: i64) -> Result<()>;

    /// Owner veto over a record about to be inserted.
    fn insert_check(&self, _data: &[u8], _blkno: u64, _rec: &LeafRec) -> Result<()> {
        Ok(())
    }

    /// Structural agreement between owner header and root list.
    fn sanity_check(&self, data: &[u8], blkno: u64) -> Result<()> {
        self.validate(data, blkno)
    }

    /// Cap on the clusters one leaf record may cover, when the owner
    /// imposes one.
    fn max_leaf_clusters(&self, _data: &[u8], _blkno: u64) -> Result<Option<u32>> {
        Ok(None)
    }
}

pub(crate) struct FileOps;
pub(crate) struct AttrValueOps;
pub(crate) struct AttrTreeOps;
pub(crate) struct DirIndexOps;

pub(crate) static FILE_OPS: FileOps = FileOps;
pub(crate) static ATTR_VALUE_OPS: AttrValueOps = AttrValueOps;
pub(crate) static ATTR_TREE_OPS: AttrTreeOps = AttrTreeOps;
pub(crate) static DIR_INDEX_OPS: DirIndexOps = DirIndexOps;

impl RootOps for FileOps {
    fn format(&self) -> RootFormat {
        RootFormat::File
    }

    fn validate(&self, data: &[u8], blkno: u64) -> Result<()> {
        FileRootHeader::from_bytes(data, blkno).map(|_| ())
    }

    fn fs_generation(&self, data: &[u8], blkno: u64) -> Result<u32> {
        Ok(FileRootHeader::from_bytes(data, blkno)?.fs_generation())
    }

    fn last_leaf_blk(&self, data: &[u8], blkno: u64) -> Result<u64> {
        Ok(FileRootHeader::from_bytes(data, blkno)?.last_leaf_blk())
    }

    fn set_last_leaf_blk(&self, data: &mut [u8], blkno: u64, leaf: u64) -> Result<()> {
        FileRootHeader::from_bytes_mut(data, blkno)?.set_last_leaf_blk(leaf);
        Ok(())
    }

    fn clusters(&self, data: &[u8], blkno: u64) -> Result<u32> {
        Ok(FileRootHeader::from_bytes(data, blkno)?.clusters())
    }

    fn update_clusters(&self, data: &mut [u8], blkno: u64, delta: i64) -> Result<()> {
        let header = FileRootHeader::from_bytes_mut(data, blkno)?;
        let next = apply_cluster_delta(header.clusters(), delta)?;
        header.set_clusters(next);
        Ok(())
    }
}

impl RootOps for AttrValueOps {
    fn format(&self) -> RootFormat {
        RootFormat::AttrValue
    }

    fn validate(&self, data: &[u8], blkno: u64) -> Result<()> {
        AttrValueRootHeader::from_bytes(data, blkno).map(|_| ())
    }

    fn fs_generation(&self, data: &[u8], blkno: u64) -> Result<u32> {
        Ok(AttrValueRootHeader::from_bytes(data, blkno)?.fs_generation())
    }

    fn last_leaf_blk(&self, data: &[u8], blkno: u64) -> Result<u64> {
        Ok(AttrValueRootHeader::from_bytes(data, blkno)?.last_leaf_blk())
    }

    fn set_last_leaf_blk(&self, data: &mut [u8], blkno: u64, leaf: u64) -> Result<()> {
        AttrValueRootHeader::from_bytes_mut(data, blkno)?.set_last_leaf_blk(leaf);
        Ok(())
    }

    fn clusters(&self, data: &[u8], blkno: u64) -> Result<u32> {
        Ok(AttrValueRootHeader::from_bytes(data, blkno)?.clusters())
    }

    fn update_clusters(&self, data: &mut [u8], blkno: u64, delta: i64) -> Result<()> {
        let header = AttrValueRootHeader::from_bytes_mut(data, blkno)?;
        let next = apply_cluster_delta(header.clusters(), delta)?;
        header.set_clusters(next);
        Ok(())
    }

    fn insert_check(&self, _data: &[u8], _blkno: u64, rec: &LeafRec) -> Result<()> {
        reject_unwritten(rec)
    }
}

impl RootOps for AttrTreeOps {
    fn format(&self) -> RootFormat {
        RootFormat::AttrTree
    }

    fn validate(&self, data: &[u8], blkno: u64) -> Result<()> {
        AttrTreeRootHeader::from_bytes(data, blkno).map(|_| ())
    }

    fn fs_generation(&self, data: &[u8], blkno: u64) -> Result<u32> {
        Ok(AttrTreeRootHeader::from_bytes(data, blkno)?.fs_generation())
    }

    fn last_leaf_blk(&self, data: &[u8], blkno: u64) -> Result<u64> {
        Ok(AttrTreeRootHeader::from_bytes(data, blkno)?.last_leaf_blk())
    }

    fn set_last_leaf_blk(&self, data: &mut [u8], blkno: u64, leaf: u64) -> Result<()> {
        AttrTreeRootHeader::from_bytes_mut(data, blkno)?.set_last_leaf_blk(leaf);
        Ok(())
    }

    fn clusters(&self, data: &[u8], blkno: u64) -> Result<u32> {
        Ok(AttrTreeRootHeader::from_bytes(data, blkno)?.clusters())
    }

    fn update_clusters(&self, data: &mut [u8], blkno: u64, delta: i64) -> Result<()> {
        let header = AttrTreeRootHeader::from_bytes_mut(data, blkno)?;
        let next = apply_cluster_delta(header.clusters(), delta)?;
        header.set_clusters(next);
        Ok(())
    }

    fn insert_check(&self, _data: &[u8], _blkno: u64, rec: &LeafRec) -> Result<()> {
        reject_unwritten(rec)
    }

    fn sanity_check(&self, data: &[u8], blkno: u64) -> Result<()> {
        let header = AttrTreeRootHeader::from_bytes(data, blkno)?;
        let list = crate::ondisk::ListRef::new(
            &data[RootFormat::AttrTree.list_offset()..],
            blkno,
        )?;
        if list.tree_depth() > 0 && header.last_leaf_blk() == 0 {
            return Err(Error::corrupt(
                blkno,
                "attribute tree has branches but no rightmost leaf",
            ));
        }
        Ok(())
    }

    fn max_leaf_clusters(&self, data: &[u8], blkno: u64) -> Result<Option<u32>> {
        Ok(Some(
            AttrTreeRootHeader::from_bytes(data, blkno)?.max_leaf_clusters(),
        ))
    }
}

impl RootOps for DirIndexOps {
    fn format(&self) -> RootFormat {
        RootFormat::DirIndex
    }

    fn validate(&self, data: &[u8], blkno: u64) -> Result<()> {
        DirIndexRootHeader::from_bytes(data, blkno).map(|_| ())
    }

    fn fs_generation(&self, data: &[u8], blkno: u64) -> Result<u32> {
        Ok(DirIndexRootHeader::from_bytes(data, blkno)?.fs_generation())
    }

    fn last_leaf_blk(&self, data: &[u8], blkno: u64) -> Result<u64> {
        Ok(DirIndexRootHeader::from_bytes(data, blkno)?.last_leaf_blk())
    }

    fn set_last_leaf_blk(&self, data: &mut [u8], blkno: u64, leaf: u64) -> Result<()> {
        DirIndexRootHeader::from_bytes_mut(data, blkno)?.set_last_leaf_blk(leaf);
        Ok(())
    }

    fn clusters(&self, data: &[u8], blkno: u64) -> Result<u32> {
        Ok(DirIndexRootHeader::from_bytes(data, blkno)?.clusters())
    }

    fn update_clusters(&self, data: &mut [u8], blkno: u64, delta: i64) -> Result<()> {
        let header = DirIndexRootHeader::from_bytes_mut(data, blkno)?;
        let next = apply_cluster_delta(header.clusters(), delta)?;
        header.set_clusters(next);
        Ok(())
    }

    fn insert_check(&self, _data: &[u8], _blkno: u64, rec: &LeafRec) -> Result<()> {
        reject_unwritten(rec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_delta_bounds() {
        assert_eq!(apply_cluster_delta(10, 5).unwrap(), 15);
        assert_eq!(apply_cluster_delta(10, -10).unwrap(), 0);
        assert!(matches!(
            apply_cluster_delta(10, -11),
            Err(Error::Invariant(_))
        ));
        assert!(matches!(
            apply_cluster_delta(u32::MAX, 1),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn non_file_owners_reject_unwritten_records() {
        let rec = LeafRec {
            cpos: 0,
            clusters: 4,
            flags: RecFlags::UNWRITTEN,
            blkno: 8,
        };
        assert!(reject_unwritten(&rec).is_err());
        let written = LeafRec {
            flags: RecFlags::empty(),
            ..rec
        };
        assert!(reject_unwritten(&written).is_ok());
    }
}
