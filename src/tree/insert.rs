//! Insertion engine.
//!
//! Every insert is classified before any block is touched: does the new
//! range merge with an existing record (and from which side), does it land
//! past the current end of the tree, and is it a fresh mapping or one side
//! of a record split. The classification decides the path the mutation
//! takes: in-place merge, tail append with edge propagation, or a right
//! rotation to open a slot mid-tree. Growth runs first when a fresh record
//! needs a slot and the rightmost list has none.

use tracing::trace;

use crate::config::Geometry;
use crate::error::{Error, Result};
use crate::journal::Txn;
use crate::ondisk::record::{InteriorRec, LeafRec};
use crate::ondisk::{ListMut, ListRef};
use crate::store::BlockStore;
use crate::suballoc::MetaAlloc;

use super::path::{find_subtree_root, TreePath};
use super::tree::ExtentTree;

/// How a new range relates to an existing record it touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ContigType {
    None,
    /// New range ends where the record begins; it grows the record leftward.
    Left,
    /// Record ends where the new range begins; it grows the record rightward.
    Right,
    /// New range bridges two records into one.
    LeftRight,
}

/// Whether the insert lands past everything the target leaf maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum AppendType {
    None,
    Tail,
}

/// Which side of an existing record a split insert carves off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum SplitType {
    None,
    Left,
    Right,
}

/// Classification of one insert, computed before any mutation.
#[derive(Debug, Clone, Copy)]
pub(super) struct InsertType {
    pub split: SplitType,
    pub appending: AppendType,
    pub contig: ContigType,
    /// Index of the record being merged with; meaningful only when
    /// `contig` is not `None`.
    pub contig_index: usize,
    pub tree_depth: u16,
}

/// Physical and logical adjacency test. Ranges with different flags never
/// merge, and neither do ranges whose combined length leaves `u16`.
pub(super) fn extent_contig(geom: Geometry, ext: &LeafRec, ins: &LeafRec) -> ContigType {
    if ext.flags != ins.flags {
        return ContigType::None;
    }
    if ext.clusters.checked_add(ins.clusters).is_none() {
        return ContigType::None;
    }
    if ext.end() == ins.cpos
        && ext.blkno + geom.clusters_to_blocks(u32::from(ext.clusters)) == ins.blkno
    {
        return ContigType::Right;
    }
    if ins.end() == ext.cpos
        && ins.blkno + geom.clusters_to_blocks(u32::from(ins.clusters)) == ext.blkno
    {
        return ContigType::Left;
    }
    ContigType::None
}

/// Shrink `rec` by the length of `split_rec`, which covers one edge of it.
pub(super) fn subtract_from_rec(
    geom: Geometry,
    split: SplitType,
    rec: &LeafRec,
    split_rec: &LeafRec,
) -> Result<LeafRec> {
    let len = split_rec.clusters;
    let clusters = rec
        .clusters
        .checked_sub(len)
        .ok_or_else(|| Error::invariant("split range is longer than its host record"))?;
    match split {
        SplitType::Left => Ok(LeafRec {
            cpos: rec.cpos + u32::from(len),
            clusters,
            flags: rec.flags,
            blkno: rec.blkno + geom.clusters_to_blocks(u32::from(len)),
        }),
        SplitType::Right => Ok(LeafRec { clusters, ..*rec }),
        SplitType::None => Err(Error::invariant("subtract without a split side")),
    }
}

impl<S: BlockStore> ExtentTree<'_, S> {
    /// Classified insert entry point: merge, append, rotate, or grow first.
    pub(super) fn insert_extent(
        &mut self,
        txn: &mut Txn,
        rec: LeafRec,
        meta: &MetaAlloc,
    ) -> Result<()> {
        {
            let data = self.store.block(self.root_blkno)?;
            self.ops.insert_check(data, self.root_blkno, &rec)?;
        }

        let (mut ins, free_records) = self.figure_insert_type(&rec)?;
        trace!(
            appending = ?ins.appending,
            contig = ?ins.contig,
            index = ins.contig_index,
            free_records,
            depth = ins.tree_depth,
            "extent_insert_type"
        );

        if ins.contig == ContigType::None && free_records == 0 {
            self.grow_tree(txn, meta)?;
            ins.tree_depth = self.depth()?;
        }

        self.do_insert(txn, &rec, &ins)
    }

    /// Work out everything `do_insert` needs to know, plus the free slot
    /// count of the list an append would land in.
    fn figure_insert_type(&self, rec: &LeafRec) -> Result<(InsertType, u16)> {
        let mut ins = InsertType {
            split: SplitType::None,
            appending: AppendType::None,
            contig: ContigType::None,
            contig_index: 0,
            tree_depth: self.depth()?,
        };

        if ins.tree_depth == 0 {
            let root = self.list_at(self.root_node())?;
            let free_records = root.free_records();
            self.figure_contig_type(&mut ins, root, rec)?;
            Self::figure_appending_type(&mut ins, root, rec)?;
            return Ok((ins, free_records));
        }

        let last_leaf = self.last_leaf_blk()?;
        if last_leaf == 0 {
            return Err(Error::corrupt(
                self.root_blkno,
                "branched tree without a rightmost leaf",
            ));
        }
        let free_records = self.eb_at(last_leaf)?.list().free_records();

        // Past-the-end offsets fall through to the rightmost leaf, which
        // is exactly where an appending insert wants to look.
        let path = self.path_to(rec.cpos)?;
        let leaf = self.list_at(path.leaf())?;
        self.figure_contig_type(&mut ins, leaf, rec)?;

        // A left merge into slot 0 would have to re-point the neighboring
        // leaf's parent records. Treat it as non-contiguous instead; the
        // range still ends up mapped, just in its own record.
        if ins.contig == ContigType::Left && ins.contig_index == 0 {
            ins.contig = ContigType::None;
        }

        if path.leaf().blkno == last_leaf {
            Self::figure_appending_type(&mut ins, leaf, rec)?;
        }

        Ok((ins, free_records))
    }

    fn figure_contig_type(
        &self,
        ins: &mut InsertType,
        leaf: ListRef<'_>,
        rec: &LeafRec,
    ) -> Result<()> {
        let mut contig = ContigType::None;
        let mut index = 0;
        for idx in 0..leaf.next_free() as usize {
            let existing = leaf.leaf_rec(idx)?;
            contig = extent_contig(self.geom, &existing, rec);
            if contig != ContigType::None {
                index = idx;
                break;
            }
        }
        ins.contig = contig;
        ins.contig_index = index;

        if ins.contig != ContigType::None {
            let cap = self
                .ops
                .max_leaf_clusters(self.store.block(self.root_blkno)?, self.root_blkno)?;
            if let Some(cap) = cap {
                let merged = u32::from(rec.clusters) + leaf.rec_clusters(index)?;
                if merged > cap {
                    ins.contig = ContigType::None;
                }
            }
        }
        Ok(())
    }

    fn figure_appending_type(ins: &mut InsertType, leaf: ListRef<'_>, rec: &LeafRec) -> Result<()> {
        ins.appending = AppendType::None;
        let next_free = leaf.next_free();
        if next_free == 0 || (next_free == 1 && leaf.has_empty_head()) {
            ins.appending = AppendType::Tail;
            return Ok(());
        }
        let end = leaf.rec_end(next_free as usize - 1)?;
        if rec.cpos >= end {
            ins.appending = AppendType::Tail;
        }
        Ok(())
    }

    /// Run a classified insert. Also used by the split engine, which feeds
    /// it a `SplitType::Right` classification to carve a record in two.
    pub(super) fn do_insert(&mut self, txn: &mut Txn, rec: &LeafRec, ins: &InsertType) -> Result<()> {
        let journal = self.journal;
        let geom = self.geom;
        self.access_root(txn)?;

        if ins.tree_depth == 0 {
            {
                let mut root = self.list_at_mut(self.root_node())?;
                Self::insert_at_leaf(geom, &mut root, rec, ins)?;
            }
        } else {
            let rotate =
                ins.appending == AppendType::None && ins.contig == ContigType::None;
            let search_cpos = if rotate { u32::MAX } else { rec.cpos };
            let mut right_path = self.path_to(search_cpos)?;
            let mut left_path = None;

            if rotate {
                left_path = self.rotate_tree_right(txn, ins.split, rec.cpos, &mut right_path)?;
                // The rotation may have extended the transaction with the
                // root not yet re-declared.
                self.access_root(txn)?;
            } else if ins.appending == AppendType::Tail && ins.contig != ContigType::Left {
                left_path = self.append_rec_to_path(txn, rec, &right_path)?;
            }

            self.insert_path(txn, left_path.as_ref(), &right_path, rec, ins)?;
        }

        if ins.split == SplitType::None {
            self.update_clusters(i64::from(rec.clusters))?;
        }
        journal.dirty(txn, self.root_blkno)?;
        Ok(())
    }

    /// Put `rec` into its leaf according to the classification. The list
    /// must have room by now; growth and rotation have already run.
    fn insert_at_leaf(
        geom: Geometry,
        leaf: &mut ListMut<'_>,
        rec: &LeafRec,
        ins: &InsertType,
    ) -> Result<()> {
        if ins.split != SplitType::None {
            let idx = leaf
                .as_ref()
                .search(rec.cpos)
                .ok_or_else(|| Error::invariant("split insert missed its host record"))?;
            let host = leaf.leaf_rec(idx)?;
            let shrunk = subtract_from_rec(geom, ins.split, &host, rec)?;
            leaf.set_leaf_rec(idx, shrunk)?;
            return leaf.rotate_in(*rec);
        }

        if ins.contig != ContigType::None {
            let host = leaf.leaf_rec(ins.contig_index)?;
            let clusters = host
                .clusters
                .checked_add(rec.clusters)
                .ok_or_else(|| Error::invariant("merged record leaves the cluster limit"))?;
            let merged = if ins.contig == ContigType::Left {
                LeafRec {
                    cpos: rec.cpos,
                    clusters,
                    flags: host.flags,
                    blkno: rec.blkno,
                }
            } else {
                LeafRec { clusters, ..host }
            };
            return leaf.set_leaf_rec(ins.contig_index, merged);
        }

        let next_free = leaf.next_free();
        if next_free == 0 || (next_free == 1 && leaf.has_empty_head()) {
            leaf.set_leaf_rec(0, *rec)?;
            return leaf.set_next_free(1);
        }

        if ins.appending == AppendType::Tail {
            let end = leaf.as_ref().rec_end(next_free as usize - 1)?;
            if rec.cpos < end {
                return Err(Error::invariant("append lands inside the mapped range"));
            }
            leaf.push_leaf(*rec)?;
            return Ok(());
        }

        leaf.rotate_in(*rec)
    }

    /// A tail append into a branched tree stretches the interior spans on
    /// the way down. When the target leaf is still empty, the edge one
    /// branch to the left may need its spans pulled back too.
    fn append_rec_to_path(
        &mut self,
        txn: &mut Txn,
        rec: &LeafRec,
        right_path: &TreePath,
    ) -> Result<Option<TreePath>> {
        if right_path.leaf_level() == 0 {
            return Err(Error::invariant("append adjustment on a flat tree"));
        }

        let mut left_path = None;
        let effectively_empty = {
            let leaf = self.list_at(right_path.leaf())?;
            leaf.next_free() == 0 || (leaf.next_free() == 1 && leaf.has_empty_head())
        };
        if effectively_empty {
            match self.find_cpos_for_left_leaf(right_path)? {
                Some(left_cpos) if left_cpos > 0 => {
                    left_path = Some(self.path_to(left_cpos)?);
                }
                _ => {}
            }
        }

        self.access_path(txn, right_path)?;
        self.adjust_rightmost_records(txn, right_path, rec)?;
        Ok(left_path)
    }

    /// Write the record into the right path's leaf and stitch the interior
    /// edges back together when a left path took part.
    fn insert_path(
        &mut self,
        txn: &mut Txn,
        left_path: Option<&TreePath>,
        right_path: &TreePath,
        rec: &LeafRec,
        ins: &InsertType,
    ) -> Result<()> {
        let journal = self.journal;
        let geom = self.geom;

        if let Some(left) = left_path {
            journal.extend(txn, left.leaf_level() as u32)?;
            self.access_path(txn, left)?;
        }
        self.access_path(txn, right_path)?;

        if ins.split != SplitType::None {
            self.split_record(left_path, right_path, rec, ins.split)?;
            if let Some(left) = left_path {
                journal.dirty(txn, left.leaf().blkno)?;
            }
        } else {
            let mut leaf = self.list_at_mut(right_path.leaf())?;
            Self::insert_at_leaf(geom, &mut leaf, rec, ins)?;
        }
        journal.dirty(txn, right_path.leaf().blkno)?;

        if let Some(left) = left_path {
            let subtree = find_subtree_root(left, right_path)?;
            self.complete_edge_insert(txn, left, right_path, subtree)?;
        }
        Ok(())
    }

    /// Stretch the rightmost interior record of every level above the leaf
    /// to end where `rec` ends. The leaf itself is left alone.
    pub(super) fn adjust_rightmost_records(
        &mut self,
        txn: &mut Txn,
        path: &TreePath,
        rec: &LeafRec,
    ) -> Result<()> {
        let journal = self.journal;
        let end = rec.end();
        for level in 0..path.leaf_level() {
            let node = path.node(level);
            let (idx, current) = {
                let list = self.list_at(node)?;
                let idx = list.last_index().ok_or_else(|| {
                    Error::corrupt(node.blkno, "interior node has no records")
                })?;
                (idx, list.interior_rec(idx)?)
            };
            let clusters = end.checked_sub(current.cpos).ok_or_else(|| {
                Error::invariant("rightmost record ends before its parent span begins")
            })?;
            {
                let mut list = self.list_at_mut(node)?;
                list.set_interior_rec(
                    idx,
                    InteriorRec {
                        cpos: current.cpos,
                        clusters,
                        blkno: current.blkno,
                    },
                )?;
            }
            journal.dirty(txn, node.blkno)?;
        }
        Ok(())
    }
}
