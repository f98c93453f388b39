//! Merging and splitting of leaf records.
//!
//! Marking part of an unwritten range as written carves a new record out
//! of the one that maps it. The carved-off piece either replaces its host
//! outright, joins a flag-compatible neighbor, or takes a fresh slot. A
//! neighbor can live in the same leaf or across the leaf boundary, and a
//! range that bridges both neighbors collapses three records into one.
//!
//! Merges work on one edge at a time. The host record gives up the split
//! length, the neighbor absorbs it, and a host reduced to zero length
//! becomes the leaf's empty head for left rotation to carry away. A
//! right leaf drained to nothing by a cross-leaf merge is unlinked like
//! any other emptied rightmost branch.
//!
//! Splits that touch neither neighbor insert the carved piece as its own
//! record. An interior range needs two passes: the right remainder is
//! split off first, then the pass repeats on what is left of the host.

use tracing::{trace, warn};

use crate::config::Geometry;
use crate::dealloc::DeallocCtx;
use crate::error::{Error, Result};
use crate::journal::{CommitTrigger, Txn};
use crate::ondisk::record::{LeafRec, RecFlags};
use crate::ondisk::ListMut;
use crate::store::BlockStore;
use crate::suballoc::MetaAlloc;

use super::insert::{
    extent_contig, subtract_from_rec, AppendType, ContigType, InsertType, SplitType,
};
use super::path::{find_subtree_root, TreePath};
use super::tree::ExtentTree;

/// What the merge engine learned about a split before mutating anything.
struct MergeCtxt {
    contig: ContigType,
    /// The target leaf already carries the empty head record.
    has_empty: bool,
    /// The split range covers its host record exactly.
    covers: bool,
}

/// Build the record describing the right remainder of `rec` once it is
/// cut at `cpos`.
pub(super) fn make_right_split_rec(geom: Geometry, cpos: u32, rec: &LeafRec) -> Result<LeafRec> {
    let tail = rec
        .end()
        .checked_sub(cpos)
        .ok_or_else(|| Error::invariant("split point sits past its record"))?;
    let clusters = u16::try_from(tail)
        .map_err(|_| Error::invariant("split remainder exceeds a record's capacity"))?;
    let skip = cpos
        .checked_sub(rec.cpos)
        .ok_or_else(|| Error::invariant("split point sits before its record"))?;
    Ok(LeafRec {
        cpos,
        clusters,
        flags: rec.flags,
        blkno: rec.blkno + geom.clusters_to_blocks(skip),
    })
}

/// A merge that consumed the whole record at `index` leaves a zero-length
/// slot behind. Slide it to the head of the list, where the empty record
/// belongs; left rotation carries it off later. `next_free` is untouched.
pub(super) fn cleanup_merge(list: &mut ListMut<'_>, index: usize) -> Result<()> {
    if list.as_ref().rec_clusters(index)? != 0 {
        return Ok(());
    }
    if index > 0 {
        if list.has_empty_head() {
            return Err(Error::invariant("two empty records in one list"));
        }
        for idx in (0..index).rev() {
            let raw = list.raw(idx)?;
            list.set_raw(idx + 1, raw)?;
        }
    }
    list.clear_rec(0)
}

impl<S: BlockStore> ExtentTree<'_, S> {
    /// Classify which neighbors of the record at `index` the split range
    /// touches. Neighbors may sit across a leaf boundary; the left leaf is
    /// consulted only when the record is first in its leaf, the right leaf
    /// only when the leaf is full and the record is last.
    fn figure_merge_contig_type(
        &self,
        path: &TreePath,
        index: usize,
        split_rec: &LeafRec,
    ) -> Result<ContigType> {
        let geom = self.geom;
        let leaf = path.leaf();
        let depth = path.leaf_level();

        let mut left_neighbor = None;
        if index > 0 {
            left_neighbor = Some(self.list_at(leaf)?.leaf_rec(index - 1)?);
        } else if depth > 0 {
            // A left cpos of zero doubles as "no left leaf"; bail either
            // way, the leftmost record has nothing ahead of it to merge
            // with.
            if let Some(left_cpos) = self.find_cpos_for_left_leaf(path)? {
                if left_cpos != 0 {
                    let left_path = self.path_to(left_cpos)?;
                    let left_leaf = left_path.leaf();
                    let left_list = self.list_at(left_leaf)?;
                    if !left_list.is_full() {
                        return Err(Error::corrupt(
                            left_leaf.blkno,
                            "leaf left of a merge edge is not full",
                        ));
                    }
                    let last = left_list.next_free() as usize - 1;
                    left_neighbor = Some(left_list.leaf_rec(last)?);
                }
            }
        }

        let mut ret = ContigType::None;
        if let Some(neighbor) = left_neighbor {
            if index == 1 && neighbor.is_empty() {
                // The empty head sits between nothing and the host; a
                // split flush against the host's start can still take
                // that slot.
                if split_rec.cpos == self.list_at(leaf)?.rec_cpos(index)? {
                    ret = ContigType::Right;
                }
            } else {
                ret = extent_contig(geom, &neighbor, split_rec);
            }
        }

        let mut right_neighbor = None;
        let list = self.list_at(leaf)?;
        if index + 1 < list.next_free() as usize {
            right_neighbor = Some(list.leaf_rec(index + 1)?);
        } else if list.is_full() && depth > 0 {
            if let Some(right_cpos) = self.find_cpos_for_right_leaf(path)? {
                let right_path = self.path_to(right_cpos)?;
                let right_leaf = right_path.leaf();
                let right_list = self.list_at(right_leaf)?;
                let mut idx = 0;
                if right_list.rec_clusters(0)? == 0 {
                    if right_list.next_free() <= 1 {
                        return Err(Error::corrupt(
                            right_leaf.blkno,
                            "leaf right of a merge edge holds only an empty record",
                        ));
                    }
                    idx = 1;
                }
                right_neighbor = Some(right_list.leaf_rec(idx)?);
            }
        }

        if let Some(neighbor) = right_neighbor {
            let contig = extent_contig(geom, &neighbor, split_rec);
            if contig == ContigType::Left && ret == ContigType::Right {
                ret = ContigType::LeftRight;
            } else if ret == ContigType::None {
                ret = contig;
            }
        }
        Ok(ret)
    }

    /// Fold the split range into the neighbor on the host's right. The
    /// host record shrinks by the split length and the neighbor's start
    /// moves left to absorb it.
    fn merge_rec_right(
        &mut self,
        txn: &mut Txn,
        left_path: &TreePath,
        split_rec: &LeafRec,
        index: usize,
    ) -> Result<()> {
        let journal = self.journal;
        let geom = self.geom;
        let left_leaf = left_path.leaf();
        let split_clusters = split_rec.clusters;

        let (used, full) = {
            let list = self.list_at(left_leaf)?;
            (list.next_free() as usize, list.is_full())
        };
        if index >= used {
            return Err(Error::invariant("merge index out of bounds"));
        }
        let host = self.list_at(left_leaf)?.leaf_rec(index)?;

        let mut cross = None;
        let (right_node, right_idx) = if index == used - 1 && full {
            let right_cpos = self
                .find_cpos_for_right_leaf(left_path)?
                .ok_or_else(|| Error::invariant("cross-leaf merge from the rightmost leaf"))?;
            let right_path = self.path_to(right_cpos)?;
            let right_leaf = right_path.leaf();

            let mut idx = 0;
            {
                let right_list = self.list_at(right_leaf)?;
                if right_list.next_free() == 0 {
                    return Err(Error::invariant("merge into an empty leaf"));
                }
                if right_list.rec_clusters(0)? == 0 {
                    if right_list.next_free() <= 1 {
                        return Err(Error::invariant(
                            "merge into a leaf holding only an empty record",
                        ));
                    }
                    idx = 1;
                }
                if host.end() != right_list.rec_cpos(idx)? {
                    return Err(Error::invariant("cross-leaf neighbors are not adjacent"));
                }
            }

            let subtree = find_subtree_root(left_path, &right_path)?;
            let op_credits = txn.remaining_credits();
            self.extend_rotate_txn(txn, subtree, op_credits, &right_path)?;

            if left_path.node(subtree).blkno != right_path.node(subtree).blkno {
                return Err(Error::invariant("subtree roots disagree"));
            }
            journal.access(txn, right_path.node(subtree).blkno, CommitTrigger::SealBlock)?;
            for level in subtree + 1..right_path.num_levels() {
                journal.access(txn, right_path.node(level).blkno, CommitTrigger::SealBlock)?;
                journal.access(txn, left_path.node(level).blkno, CommitTrigger::SealBlock)?;
            }

            cross = Some((right_path, subtree));
            (right_leaf, idx)
        } else {
            if index == used - 1 {
                return Err(Error::invariant("tail merge in a leaf that still has room"));
            }
            (left_leaf, index + 1)
        };

        journal.access(txn, left_leaf.blkno, CommitTrigger::SealBlock)?;

        let neighbor = self.list_at(right_node)?.leaf_rec(right_idx)?;
        let host_clusters = host
            .clusters
            .checked_sub(split_clusters)
            .ok_or_else(|| Error::invariant("merge consumes more than its host record"))?;
        let grown = neighbor
            .clusters
            .checked_add(split_clusters)
            .ok_or_else(|| Error::invariant("merged record overflows its cluster count"))?;
        let neighbor_cpos = neighbor
            .cpos
            .checked_sub(u32::from(split_clusters))
            .ok_or_else(|| Error::invariant("merge moves a record before cluster zero"))?;
        let neighbor_blkno = neighbor
            .blkno
            .checked_sub(geom.clusters_to_blocks(u32::from(split_clusters)))
            .ok_or_else(|| Error::invariant("merge moves a record before block zero"))?;

        {
            let mut list = self.list_at_mut(left_leaf)?;
            list.set_leaf_rec(
                index,
                LeafRec {
                    clusters: host_clusters,
                    ..host
                },
            )?;
        }
        {
            let mut list = self.list_at_mut(right_node)?;
            list.set_leaf_rec(
                right_idx,
                LeafRec {
                    cpos: neighbor_cpos,
                    clusters: grown,
                    flags: neighbor.flags,
                    blkno: neighbor_blkno,
                },
            )?;
        }
        {
            let mut list = self.list_at_mut(left_leaf)?;
            cleanup_merge(&mut list, index)?;
        }
        journal.dirty(txn, left_leaf.blkno)?;

        if let Some((right_path, subtree)) = cross {
            journal.dirty(txn, right_path.leaf().blkno)?;
            self.complete_edge_insert(txn, left_path, &right_path, subtree)?;
        }
        Ok(())
    }

    /// Fold the split range into the neighbor on the host's left. The
    /// host's start moves right by the split length and the neighbor grows
    /// to meet it. A right leaf drained to a single empty record by a
    /// cross-leaf merge is unlinked, and `right_path` is repointed at the
    /// leaf that absorbed its record.
    fn merge_rec_left(
        &mut self,
        txn: &mut Txn,
        right_path: &mut TreePath,
        split_rec: &LeafRec,
        dealloc: &mut DeallocCtx,
        index: usize,
    ) -> Result<()> {
        let journal = self.journal;
        let geom = self.geom;
        let right_leaf = right_path.leaf();
        let split_clusters = split_rec.clusters;

        let host = self.list_at(right_leaf)?.leaf_rec(index)?;

        let mut cross = None;
        let mut has_empty = false;
        if index == 0 {
            let left_cpos = self
                .find_cpos_for_left_leaf(right_path)?
                .filter(|cpos| *cpos != 0)
                .ok_or_else(|| Error::invariant("cross-leaf merge from the leftmost leaf"))?;
            let left_path = self.path_to(left_cpos)?;
            let left_leaf = left_path.leaf();
            {
                let left_list = self.list_at(left_leaf)?;
                if !left_list.is_full() {
                    return Err(Error::invariant("cross-leaf merge through a leaf with room"));
                }
                let last = left_list.next_free() as usize - 1;
                if left_list.leaf_rec(last)?.end() != split_rec.cpos {
                    return Err(Error::invariant("cross-leaf neighbors are not adjacent"));
                }
            }

            let subtree = find_subtree_root(&left_path, right_path)?;
            let op_credits = txn.remaining_credits();
            self.extend_rotate_txn(txn, subtree, op_credits, &left_path)?;

            if left_path.node(subtree).blkno != right_path.node(subtree).blkno {
                return Err(Error::invariant("subtree roots disagree"));
            }
            journal.access(txn, right_path.node(subtree).blkno, CommitTrigger::SealBlock)?;
            for level in subtree + 1..right_path.num_levels() {
                journal.access(txn, right_path.node(level).blkno, CommitTrigger::SealBlock)?;
                journal.access(txn, left_path.node(level).blkno, CommitTrigger::SealBlock)?;
            }

            cross = Some((left_path, subtree));
        } else {
            has_empty = self.list_at(right_leaf)?.has_empty_head();
        }

        journal.access(txn, right_leaf.blkno, CommitTrigger::SealBlock)?;

        if has_empty && index == 1 {
            // The empty head takes the record whole; nothing grows.
            let mut list = self.list_at_mut(right_leaf)?;
            list.set_leaf_rec(0, *split_rec)?;
        } else {
            let (left_node, left_idx) = match &cross {
                Some((left_path, _)) => {
                    let node = left_path.leaf();
                    let idx = self.list_at(node)?.next_free() as usize - 1;
                    (node, idx)
                }
                None => (right_leaf, index - 1),
            };
            let left_rec = self.list_at(left_node)?.leaf_rec(left_idx)?;
            let grown = left_rec
                .clusters
                .checked_add(split_clusters)
                .ok_or_else(|| Error::invariant("merged record overflows its cluster count"))?;
            let mut list = self.list_at_mut(left_node)?;
            list.set_leaf_rec(
                left_idx,
                LeafRec {
                    clusters: grown,
                    ..left_rec
                },
            )?;
        }

        let host_clusters = host
            .clusters
            .checked_sub(split_clusters)
            .ok_or_else(|| Error::invariant("merge consumes more than its host record"))?;
        {
            let mut list = self.list_at_mut(right_leaf)?;
            list.set_leaf_rec(
                index,
                LeafRec {
                    cpos: host.cpos + u32::from(split_clusters),
                    clusters: host_clusters,
                    flags: host.flags,
                    blkno: host.blkno + geom.clusters_to_blocks(u32::from(split_clusters)),
                },
            )?;
        }
        {
            let mut list = self.list_at_mut(right_leaf)?;
            cleanup_merge(&mut list, index)?;
        }
        journal.dirty(txn, right_leaf.blkno)?;

        if let Some((left_path, subtree)) = cross {
            journal.dirty(txn, left_path.leaf().blkno)?;

            let (host_now, used_now) = {
                let list = self.list_at(right_leaf)?;
                (list.rec_clusters(index)?, list.next_free())
            };
            if host_now == 0 && used_now == 1 {
                // The right leaf held nothing but the host. Its branch
                // comes out, and the path follows the record left.
                let op_credits = txn.remaining_credits();
                self.extend_rotate_txn(txn, 0, op_credits, right_path)?;
                self.remove_rightmost_path(txn, right_path, dealloc)?;
                *right_path = left_path;
            } else {
                self.complete_edge_insert(txn, &left_path, right_path, subtree)?;
            }
        }
        Ok(())
    }

    /// Run the merges the classification called for. A bridging range
    /// merges right first, rotates the emptied host away, and then folds
    /// the combined record into the left neighbor.
    fn try_to_merge(
        &mut self,
        txn: &mut Txn,
        path: &mut TreePath,
        mut split_index: usize,
        split_rec: &LeafRec,
        dealloc: &mut DeallocCtx,
        ctxt: MergeCtxt,
    ) -> Result<()> {
        if ctxt.covers && ctxt.has_empty {
            // Emptying the host mints a new empty record, and a leaf may
            // carry only one. Rotate the existing one away first.
            self.rotate_tree_left(txn, path, dealloc)?;
            split_index = split_index
                .checked_sub(1)
                .ok_or_else(|| Error::invariant("merge target slid out of its leaf"))?;
        }

        match ctxt.contig {
            ContigType::None => Err(Error::invariant("merge attempted without a neighbor")),
            ContigType::LeftRight => {
                if !ctxt.covers {
                    return Err(Error::invariant(
                        "bridging merge does not cover its record",
                    ));
                }
                self.merge_rec_right(txn, path, split_rec, split_index)?;
                if !self.list_at(path.leaf())?.has_empty_head() {
                    return Err(Error::invariant("bridging merge left no empty record"));
                }
                self.rotate_tree_left(txn, path, dealloc)?;

                // The host slot now holds the combined right-side record;
                // fold all of it into the left neighbor.
                let rec = self.list_at(path.leaf())?.leaf_rec(split_index)?;
                self.merge_rec_left(txn, path, &rec, dealloc, split_index)?;

                if let Err(err) = self.rotate_tree_left(txn, path, dealloc) {
                    warn!(%err, "post_merge_rotate_failed");
                }
                Ok(())
            }
            // Contiguity names the side of the neighbor the split touches,
            // so a right-contiguous range folds leftward and vice versa.
            ContigType::Right => {
                self.merge_rec_left(txn, path, split_rec, dealloc, split_index)?;
                self.rotate_after_covering_merge(txn, path, dealloc, ctxt.covers);
                Ok(())
            }
            ContigType::Left => {
                self.merge_rec_right(txn, path, split_rec, split_index)?;
                self.rotate_after_covering_merge(txn, path, dealloc, ctxt.covers);
                Ok(())
            }
        }
    }

    /// A merge that consumed its host left an empty record behind. Rotate
    /// it away on a best-effort basis; the tree is already consistent.
    fn rotate_after_covering_merge(
        &mut self,
        txn: &mut Txn,
        path: &TreePath,
        dealloc: &mut DeallocCtx,
        covers: bool,
    ) {
        if !covers {
            return;
        }
        if let Err(err) = self.rotate_tree_left(txn, path, dealloc) {
            warn!(%err, "post_merge_rotate_failed");
        }
    }

    /// Shrink the host record by the split length and place the carved-off
    /// record. After a rotation the host and the open slot can sit in
    /// different leaves, which is why both paths take part. Journal
    /// declarations and dirtying are the caller's.
    pub(super) fn split_record(
        &mut self,
        left_path: Option<&TreePath>,
        right_path: &TreePath,
        split_rec: &LeafRec,
        split: SplitType,
    ) -> Result<()> {
        let geom = self.geom;
        let cpos = split_rec.cpos;
        let right_leaf = right_path.leaf();

        let search = self.list_at(right_leaf)?.search(cpos);
        let (host_node, insert_node, index) = match (search, left_path) {
            (Some(0), Some(left)) => {
                if self.list_at(right_leaf)?.has_empty_head() {
                    return Err(Error::invariant("split target sits behind an empty record"));
                }
                if split == SplitType::Left {
                    // The rotation parked the open slot in the left leaf;
                    // the carved-off front lands there and the host stays.
                    (right_leaf, left.leaf(), 0)
                } else {
                    // A right split keeps the host's front, which belongs
                    // in the left leaf. Move the host over and carve from
                    // there; the emptied slot takes the new record.
                    let host = self.list_at(right_leaf)?.leaf_rec(0)?;
                    {
                        let mut list = self.list_at_mut(left.leaf())?;
                        list.rotate_in(host)?;
                    }
                    {
                        let mut list = self.list_at_mut(right_leaf)?;
                        list.clear_rec(0)?;
                    }
                    let idx = self
                        .list_at(left.leaf())?
                        .search(cpos)
                        .ok_or_else(|| {
                            Error::invariant("record vanished while crossing leaves")
                        })?;
                    (left.leaf(), right_leaf, idx)
                }
            }
            (Some(idx), _) => (right_leaf, right_leaf, idx),
            (None, Some(left)) => {
                if !self.list_at(left.leaf())?.has_empty_head() {
                    return Err(Error::invariant("left leaf lost its empty slot"));
                }
                let idx = self.list_at(left.leaf())?.search(cpos).ok_or_else(|| {
                    Error::invariant("split target is in neither candidate leaf")
                })?;
                (left.leaf(), left.leaf(), idx)
            }
            (None, None) => {
                return Err(Error::invariant(
                    "split target is in neither candidate leaf",
                ));
            }
        };

        let host = self.list_at(host_node)?.leaf_rec(index)?;
        let shrunk = subtract_from_rec(geom, split, &host, split_rec)?;
        {
            let mut list = self.list_at_mut(host_node)?;
            list.set_leaf_rec(index, shrunk)?;
        }
        let mut list = self.list_at_mut(insert_node)?;
        list.rotate_in(*split_rec)
    }

    /// The split covers the whole host record; overwrite it in place.
    fn replace_extent_rec(
        &mut self,
        txn: &mut Txn,
        path: &TreePath,
        split_index: usize,
        split_rec: &LeafRec,
    ) -> Result<()> {
        let journal = self.journal;
        let leaf = path.leaf();
        journal.access(txn, leaf.blkno, CommitTrigger::SealBlock)?;
        {
            let mut list = self.list_at_mut(leaf)?;
            list.set_leaf_rec(split_index, *split_rec)?;
        }
        journal.dirty(txn, leaf.blkno)
    }

    /// Insert the split range as its own record, growing the tree when the
    /// rightmost list is out of slots. An interior range runs two passes:
    /// the right remainder splits off first, then the original range
    /// splits the shortened host.
    fn split_and_insert(
        &mut self,
        txn: &mut Txn,
        mut path: TreePath,
        mut split_index: usize,
        orig_split_rec: &LeafRec,
        meta: &MetaAlloc,
    ) -> Result<()> {
        let geom = self.geom;
        let mut split_rec = *orig_split_rec;
        let mut pass = 0u8;

        loop {
            // The host may move as the tree is reshaped below; work from a
            // copy.
            let rec = self.list_at(path.leaf())?.leaf_rec(split_index)?;

            let mut depth = self.depth()?;
            let free = if depth == 0 {
                self.list_at(self.root_node())?.free_records()
            } else {
                let last = self.last_leaf_blk()?;
                if last == 0 {
                    return Err(Error::corrupt(
                        self.root_blkno,
                        "branched tree without a rightmost leaf",
                    ));
                }
                self.eb_at(last)?.list().free_records()
            };
            if free == 0 {
                self.grow_tree(txn, meta)?;
                depth = self.depth()?;
            }

            let split = if split_rec.cpos == rec.cpos {
                SplitType::Left
            } else if split_rec.end() == rec.end() {
                SplitType::Right
            } else {
                if pass > 0 {
                    return Err(Error::invariant("middle split failed to converge"));
                }
                // Fake a right split now; a second pass carves the left
                // side out of the shortened host.
                split_rec = make_right_split_rec(geom, split_rec.end(), &rec)?;
                pass = 1;
                SplitType::Right
            };

            let ins = InsertType {
                split,
                appending: AppendType::None,
                contig: ContigType::None,
                contig_index: 0,
                tree_depth: depth,
            };
            self.do_insert(txn, &split_rec, &ins)?;

            if pass != 1 {
                break;
            }
            pass = 2;
            split_rec = *orig_split_rec;
            path = self.path_to(split_rec.cpos)?;
            split_index = self
                .list_at(path.leaf())?
                .search(split_rec.cpos)
                .ok_or_else(|| {
                    Error::corrupt(path.leaf().blkno, "record lost during a split")
                })?;
        }
        Ok(())
    }

    /// Carve `split_rec` out of the record at `split_index`, merging with
    /// whichever neighbors line up and inserting otherwise.
    pub(super) fn split_extent(
        &mut self,
        txn: &mut Txn,
        mut path: TreePath,
        split_index: usize,
        split_rec: &LeafRec,
        meta: &MetaAlloc,
        dealloc: &mut DeallocCtx,
    ) -> Result<()> {
        let leaf = path.leaf();
        let host = self.list_at(leaf)?.leaf_rec(split_index)?;
        if host.cpos > split_rec.cpos || host.end() < split_rec.end() {
            return Err(Error::corrupt(
                leaf.blkno,
                "split range leaves its host record",
            ));
        }

        let ctxt = MergeCtxt {
            contig: self.figure_merge_contig_type(&path, split_index, split_rec)?,
            has_empty: self.list_at(leaf)?.has_empty_head(),
            covers: host.cpos == split_rec.cpos && host.clusters == split_rec.clusters,
        };
        trace!(
            index = split_index,
            contig = ?ctxt.contig,
            has_empty = ctxt.has_empty,
            covers = ctxt.covers,
            "extent_split"
        );

        if ctxt.contig == ContigType::None {
            if ctxt.covers {
                self.replace_extent_rec(txn, &path, split_index, split_rec)
            } else {
                self.split_and_insert(txn, path, split_index, split_rec, meta)
            }
        } else {
            self.try_to_merge(txn, &mut path, split_index, split_rec, dealloc, ctxt)
        }
    }

    /// Clear the unwritten flag on `len` clusters starting at `cpos`,
    /// which must lie inside a single unwritten record. `phys_blkno` names
    /// where the written data actually landed.
    pub(super) fn mark_range_written(
        &mut self,
        txn: &mut Txn,
        cpos: u32,
        len: u32,
        phys_blkno: u64,
        meta: &MetaAlloc,
        dealloc: &mut DeallocCtx,
    ) -> Result<()> {
        let path = self.path_to(cpos)?;
        let leaf = path.leaf();
        let index = self
            .list_at(leaf)?
            .search(cpos)
            .ok_or_else(|| Error::corrupt(leaf.blkno, "no record maps the written range"))?;
        let host = self.list_at(leaf)?.leaf_rec(index)?;

        if !host.flags.contains(RecFlags::UNWRITTEN) {
            return Err(Error::corrupt(
                leaf.blkno,
                "written range is not marked unwritten",
            ));
        }
        let end = cpos
            .checked_add(len)
            .ok_or_else(|| Error::invariant("range wraps the cluster space"))?;
        if cpos < host.cpos || end > host.end() {
            return Err(Error::corrupt(
                leaf.blkno,
                "written range leaves its host record",
            ));
        }

        let split_rec = LeafRec {
            cpos,
            // Containment above bounds the length by the host's u16 count.
            clusters: len as u16,
            flags: host.flags & !RecFlags::UNWRITTEN,
            blkno: phys_blkno,
        };
        self.split_extent(txn, path, index, &split_rec, meta, dealloc)
    }
}

#[cfg(test)]
mod merge_tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::VolumeHealth;
    use crate::journal::{Journal, SyncMode};
    use crate::ondisk::FileRootHeader;
    use crate::store::{BlockStore, MemStore};

    const ROOT: u64 = 1;

    fn harness() -> (MemStore, Journal, MetaAlloc, Geometry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::create(
            dir.path().join("journal"),
            SyncMode::Off,
            Arc::new(VolumeHealth::new()),
        )
        .unwrap();
        let mut store = MemStore::new(512, 128);
        FileRootHeader::init(store.block_mut(ROOT).unwrap(), ROOT, 1).unwrap();
        let meta = MetaAlloc::new(0, 64, 64);
        let geom = Geometry::new(9, 9).unwrap();
        (store, journal, meta, geom, dir)
    }

    fn rec(cpos: u32, clusters: u16, blkno: u64, flags: RecFlags) -> LeafRec {
        LeafRec {
            cpos,
            clusters,
            flags,
            blkno,
        }
    }

    fn insert_one(
        tree: &mut ExtentTree<'_, MemStore>,
        journal: &Journal,
        meta: &MetaAlloc,
        r: LeafRec,
    ) {
        let mut txn = journal.begin(tree.insert_credits().unwrap()).unwrap();
        tree.insert(&mut txn, r.cpos, r.blkno, r.clusters, r.flags, meta)
            .unwrap();
        journal.commit(txn, tree.store).unwrap();
    }

    fn mark_one(
        tree: &mut ExtentTree<'_, MemStore>,
        journal: &Journal,
        meta: &MetaAlloc,
        cpos: u32,
        clusters: u32,
        phys: u64,
    ) {
        let mut dealloc = DeallocCtx::new();
        let mut txn = journal.begin(tree.remove_credits().unwrap()).unwrap();
        tree.mark_written(&mut txn, cpos, clusters, phys, meta, &mut dealloc)
            .unwrap();
        journal.commit(txn, tree.store).unwrap();
    }

    #[test]
    fn covering_write_replaces_the_record_in_place() {
        let (mut store, journal, meta, geom, _dir) = harness();
        let mut tree = ExtentTree::file(&mut store, &journal, geom, ROOT).unwrap();

        insert_one(&mut tree, &journal, &meta, rec(0, 10, 100, RecFlags::UNWRITTEN));
        mark_one(&mut tree, &journal, &meta, 0, 10, 100);

        let root = tree.list_at(tree.root_node()).unwrap();
        assert_eq!(root.next_free(), 1);
        let written = root.leaf_rec(0).unwrap();
        assert_eq!(written, rec(0, 10, 100, RecFlags::empty()));
        assert_eq!(tree.total_clusters().unwrap(), 10);
    }

    #[test]
    fn interior_write_splits_the_record_in_three() {
        let (mut store, journal, meta, geom, _dir) = harness();
        let mut tree = ExtentTree::file(&mut store, &journal, geom, ROOT).unwrap();

        insert_one(&mut tree, &journal, &meta, rec(0, 10, 100, RecFlags::UNWRITTEN));
        mark_one(&mut tree, &journal, &meta, 4, 2, 104);

        let root = tree.list_at(tree.root_node()).unwrap();
        assert_eq!(root.next_free(), 3);
        assert_eq!(root.leaf_rec(0).unwrap(), rec(0, 4, 100, RecFlags::UNWRITTEN));
        assert_eq!(root.leaf_rec(1).unwrap(), rec(4, 2, 104, RecFlags::empty()));
        assert_eq!(root.leaf_rec(2).unwrap(), rec(6, 4, 106, RecFlags::UNWRITTEN));
        assert_eq!(tree.total_clusters().unwrap(), 10);
    }

    #[test]
    fn edge_write_splits_the_record_in_two() {
        let (mut store, journal, meta, geom, _dir) = harness();
        let mut tree = ExtentTree::file(&mut store, &journal, geom, ROOT).unwrap();

        insert_one(&mut tree, &journal, &meta, rec(0, 10, 100, RecFlags::UNWRITTEN));
        mark_one(&mut tree, &journal, &meta, 0, 3, 100);

        let root = tree.list_at(tree.root_node()).unwrap();
        assert_eq!(root.next_free(), 2);
        assert_eq!(root.leaf_rec(0).unwrap(), rec(0, 3, 100, RecFlags::empty()));
        assert_eq!(root.leaf_rec(1).unwrap(), rec(3, 7, 103, RecFlags::UNWRITTEN));
    }

    #[test]
    fn write_against_a_written_neighbor_merges_into_it() {
        let (mut store, journal, meta, geom, _dir) = harness();
        let mut tree = ExtentTree::file(&mut store, &journal, geom, ROOT).unwrap();

        insert_one(&mut tree, &journal, &meta, rec(0, 4, 100, RecFlags::empty()));
        insert_one(&mut tree, &journal, &meta, rec(4, 6, 104, RecFlags::UNWRITTEN));
        mark_one(&mut tree, &journal, &meta, 4, 2, 104);

        let root = tree.list_at(tree.root_node()).unwrap();
        assert_eq!(root.next_free(), 2);
        assert_eq!(root.leaf_rec(0).unwrap(), rec(0, 6, 100, RecFlags::empty()));
        assert_eq!(root.leaf_rec(1).unwrap(), rec(6, 4, 106, RecFlags::UNWRITTEN));
        assert_eq!(tree.total_clusters().unwrap(), 10);
    }

    #[test]
    fn bridging_write_collapses_three_records_into_one() {
        let (mut store, journal, meta, geom, _dir) = harness();
        let mut tree = ExtentTree::file(&mut store, &journal, geom, ROOT).unwrap();

        insert_one(&mut tree, &journal, &meta, rec(0, 4, 100, RecFlags::empty()));
        insert_one(&mut tree, &journal, &meta, rec(4, 2, 104, RecFlags::UNWRITTEN));
        insert_one(&mut tree, &journal, &meta, rec(6, 4, 106, RecFlags::empty()));
        mark_one(&mut tree, &journal, &meta, 4, 2, 104);

        let root = tree.list_at(tree.root_node()).unwrap();
        assert_eq!(root.next_free(), 1);
        assert_eq!(root.leaf_rec(0).unwrap(), rec(0, 10, 100, RecFlags::empty()));
        assert_eq!(tree.total_clusters().unwrap(), 10);
        assert_eq!(
            tree.lookup(7).unwrap(),
            Some(rec(0, 10, 100, RecFlags::empty()))
        );
    }

    #[test]
    fn marking_a_written_range_is_refused() {
        let (mut store, journal, meta, geom, _dir) = harness();
        let mut tree = ExtentTree::file(&mut store, &journal, geom, ROOT).unwrap();

        insert_one(&mut tree, &journal, &meta, rec(0, 10, 100, RecFlags::empty()));

        let mut dealloc = DeallocCtx::new();
        let mut txn = journal.begin(tree.remove_credits().unwrap()).unwrap();
        let res = tree.mark_written(&mut txn, 0, 10, 100, &meta, &mut dealloc);
        assert!(res.is_err());
        journal.abort(txn);

        assert_eq!(tree.total_clusters().unwrap(), 10);
    }
}
