//! Record rotation between adjacent branches.
//!
//! The tree keeps at most one empty record, always in slot 0 of a leaf,
//! and rotation is how that slot travels. Both directions work one
//! subtree at a time: the lowest node shared by two adjacent paths is the
//! subtree root, and every level below it has a rightmost-left record and
//! a leftmost-right record that meet at the boundary between the paths.
//!
//! ## Right rotation
//!
//! An insert that is neither contiguous with an existing record nor an
//! append needs an open slot in its target leaf. Starting from the
//! rightmost leaf, each step moves the last record of the left neighbor
//! into slot 0 of the right leaf and opens the empty slot in the left
//! leaf. The walk stops once the leaf that will take the insert owns the
//! slot. `complete_edge_insert` then rewrites the interior records above
//! both paths so every parent still names the exact range of its child.
//!
//! ## Left rotation
//!
//! Removal leaves an empty slot behind, and left rotation pushes it
//! rightward until it falls off the tree's right edge. Slot 0 of the
//! right leaf moves into the left leaf and the hole advances one leaf. A
//! right branch reduced to a single empty record is unlinked instead, its
//! blocks handed to deferred reclamation. A right leaf that arrives with
//! its own empty head suspends the walk; the pass restarts from that leaf
//! and the original path is retried once the chain settles.
//!
//! Either direction extends the running transaction ahead of each subtree
//! so block accesses never outrun the declared credits.

use tracing::{trace, warn};

use crate::config::rotate_subtree_credits;
use crate::dealloc::DeallocCtx;
use crate::error::{Error, Result};
use crate::journal::{CommitTrigger, Txn};
use crate::ondisk::InteriorRec;
use crate::store::BlockStore;

use super::insert::SplitType;
use super::path::{find_subtree_root, PathNode, TreePath};
use super::tree::ExtentTree;

/// Outcome of one left-rotation pass over the tree.
enum LeftRotation {
    /// The empty record fell off the right edge or its branch was
    /// unlinked.
    Done,
    /// A right leaf showed up with its own empty head. It has to rotate
    /// first; the pass restarts from its path.
    Restart(TreePath),
}

/// Outcome of rotating one subtree left.
enum SubtreeRotation {
    Rotated,
    /// The right branch held nothing but the empty record and was
    /// unlinked.
    Deleted,
    /// The right leaf carries its own empty head and is not rightmost.
    RightHasEmpty,
}

impl<S: BlockStore> ExtentTree<'_, S> {
    /// Rotate records rightward until the leaf that should take an insert
    /// at `insert_cpos` owns the floating empty slot.
    ///
    /// `right_path` arrives pointed at the rightmost leaf and leaves
    /// pointed at the insert leaf. A returned path is the left neighbor
    /// for an edge insert: either the insert lands past the left leaf's
    /// final record, or a split target crossed into the right leaf's head
    /// slot mid-rotation.
    pub(super) fn rotate_tree_right(
        &mut self,
        txn: &mut Txn,
        split: SplitType,
        insert_cpos: u32,
        right_path: &mut TreePath,
    ) -> Result<Option<TreePath>> {
        let orig_credits = txn.remaining_credits();
        trace!(insert_cpos, ?split, "extent_rotate_right");

        let mut left_cpos = self.find_cpos_for_left_leaf(right_path)?;
        while let Some(cpos) = left_cpos {
            if cpos == 0 || insert_cpos > cpos {
                break;
            }
            let left_path = self.path_to(cpos)?;
            if left_path.leaf().blkno == right_path.leaf().blkno {
                return Err(Error::invariant("rotation walked into a single path"));
            }

            if split == SplitType::None
                && self.rotate_requires_path_adjustment(&left_path, insert_cpos)?
            {
                return Ok(Some(left_path));
            }

            let subtree = find_subtree_root(&left_path, right_path)?;
            self.extend_rotate_txn(txn, subtree, orig_credits, right_path)?;
            self.rotate_subtree_right(txn, &left_path, right_path, subtree)?;

            if split != SplitType::None
                && self.leftmost_rec_contains(right_path.leaf(), insert_cpos)?
            {
                return Ok(Some(left_path));
            }

            *right_path = left_path;
            left_cpos = self.find_cpos_for_left_leaf(right_path)?;
        }
        Ok(None)
    }

    /// True when `insert_cpos` lands past the left leaf's final record,
    /// meaning the insert stretches the boundary between the paths
    /// instead of needing more rotation.
    fn rotate_requires_path_adjustment(
        &self,
        left_path: &TreePath,
        insert_cpos: u32,
    ) -> Result<bool> {
        let leaf = self.list_at(left_path.leaf())?;
        let Some(last) = leaf.last_index() else {
            return Err(Error::corrupt(
                left_path.leaf().blkno,
                "empty leaf on the rotation edge",
            ));
        };
        Ok(insert_cpos > leaf.rec_cpos(last)?)
    }

    /// Whether the first live record of `leaf` covers `cpos`.
    fn leftmost_rec_contains(&self, leaf: PathNode, cpos: u32) -> Result<bool> {
        let list = self.list_at(leaf)?;
        if list.next_free() == 0 {
            return Ok(false);
        }
        let mut idx = 0;
        if list.rec_clusters(0)? == 0 {
            if list.next_free() == 1 {
                return Ok(false);
            }
            idx = 1;
        }
        let rec = list.leaf_rec(idx)?;
        Ok(cpos >= rec.cpos && cpos < rec.end())
    }

    /// Top the transaction back up to one subtree rotation below
    /// `subtree` plus the caller's own remaining writes.
    pub(super) fn extend_rotate_txn(
        &self,
        txn: &mut Txn,
        subtree: usize,
        op_credits: u32,
        path: &TreePath,
    ) -> Result<()> {
        let needed = rotate_subtree_credits(path.leaf_level() as u16, subtree as u16) + op_credits;
        let remaining = txn.remaining_credits();
        if remaining < needed {
            self.journal.extend(txn, needed - remaining)?;
        }
        Ok(())
    }

    /// Move the last record of the left leaf into slot 0 of the right
    /// leaf, leaving the floating empty slot in the left leaf, then
    /// rebalance the interior records above both.
    fn rotate_subtree_right(
        &mut self,
        txn: &mut Txn,
        left_path: &TreePath,
        right_path: &TreePath,
        subtree: usize,
    ) -> Result<()> {
        let journal = self.journal;
        let left_leaf = left_path.leaf();
        let right_leaf = right_path.leaf();

        let (moved, left_used) = {
            let list = self.list_at(left_leaf)?;
            if !list.is_full() {
                return Err(Error::corrupt(
                    left_leaf.blkno,
                    "rotation through a leaf that still has room",
                ));
            }
            // An earlier pass may already have left the empty slot here.
            if list.has_empty_head() {
                return Ok(());
            }
            let Some(last) = list.last_index() else {
                return Err(Error::corrupt(
                    left_leaf.blkno,
                    "rotation through an empty leaf",
                ));
            };
            (list.leaf_rec(last)?, list.next_free())
        };

        if left_path.node(subtree).blkno != right_path.node(subtree).blkno {
            return Err(Error::invariant("subtree roots disagree"));
        }

        journal.access(txn, right_path.node(subtree).blkno, CommitTrigger::SealBlock)?;
        for level in subtree + 1..right_path.num_levels() {
            journal.access(txn, right_path.node(level).blkno, CommitTrigger::SealBlock)?;
            journal.access(txn, left_path.node(level).blkno, CommitTrigger::SealBlock)?;
        }

        {
            let mut list = self.list_at_mut(right_leaf)?;
            if list.next_free() == 0 {
                return Err(Error::invariant("rotation into an empty rightmost leaf"));
            }
            list.create_empty_head()?;
            list.set_leaf_rec(0, moved)?;
        }
        journal.dirty(txn, right_leaf.blkno)?;

        {
            // Dropping next_free first lets the shift discard the
            // moved-out tail while opening the empty slot at the head.
            let mut list = self.list_at_mut(left_leaf)?;
            list.set_next_free(left_used - 1)?;
            list.create_empty_head()?;
        }
        journal.dirty(txn, left_leaf.blkno)?;

        self.complete_edge_insert(txn, left_path, right_path, subtree)
    }

    /// After records crossed the boundary between two adjacent paths,
    /// rewrite the interior records above both leaves so every level
    /// splits exactly at the new boundary.
    ///
    /// Interior nodes and the subtree root are dirtied here; the leaves
    /// are the caller's to dirty.
    pub(super) fn complete_edge_insert(
        &mut self,
        txn: &mut Txn,
        left_path: &TreePath,
        right_path: &TreePath,
        subtree: usize,
    ) -> Result<()> {
        let journal = self.journal;

        // Below the subtree root the paths share nothing: the left
        // node's own last record and the right node's first record meet
        // at the boundary.
        let mut right_child = right_path.leaf();
        for level in (subtree + 1..right_path.leaf_level()).rev() {
            let left_node = left_path.node(level);
            let right_node = right_path.node(level);
            let left_idx = self
                .list_at(left_node)?
                .last_index()
                .ok_or_else(|| Error::corrupt(left_node.blkno, "interior node has no records"))?;
            let boundary = self.child_boundary_cpos(right_child)?;
            self.adjust_adjacent_records(left_node, left_idx, right_node, 0, boundary)?;
            journal.dirty(txn, left_node.blkno)?;
            journal.dirty(txn, right_node.blkno)?;
            right_child = right_node;
        }

        // At the subtree root both children sit in one list, in adjacent
        // slots.
        let root_node = right_path.node(subtree);
        let left_idx = self.index_of_child(root_node, left_path.node(subtree + 1).blkno)?;
        if left_idx + 1 >= self.list_at(root_node)?.next_free() as usize {
            return Err(Error::invariant("rotated paths are not adjacent"));
        }
        let boundary = self.child_boundary_cpos(right_child)?;
        self.adjust_adjacent_records(root_node, left_idx, root_node, left_idx + 1, boundary)?;
        journal.dirty(txn, root_node.blkno)
    }

    /// Stretch the left record up to `boundary` and shrink the right
    /// record to start there, keeping the right record's end fixed.
    /// Tolerates both records living in the same list.
    fn adjust_adjacent_records(
        &mut self,
        left_node: PathNode,
        left_idx: usize,
        right_node: PathNode,
        right_idx: usize,
        boundary: u32,
    ) -> Result<()> {
        let left = self.list_at(left_node)?.interior_rec(left_idx)?;
        let right = self.list_at(right_node)?.interior_rec(right_idx)?;

        let left_clusters = boundary
            .checked_sub(left.cpos)
            .ok_or_else(|| Error::invariant("child boundary sits before its parent record"))?;
        let right_clusters = right
            .end()
            .checked_sub(boundary)
            .ok_or_else(|| Error::invariant("rotated record would end before it starts"))?;

        {
            let mut list = self.list_at_mut(left_node)?;
            list.set_interior_rec(
                left_idx,
                InteriorRec {
                    cpos: left.cpos,
                    clusters: left_clusters,
                    blkno: left.blkno,
                },
            )?;
        }
        {
            let mut list = self.list_at_mut(right_node)?;
            list.set_interior_rec(
                right_idx,
                InteriorRec {
                    cpos: boundary,
                    clusters: right_clusters,
                    blkno: right.blkno,
                },
            )?;
        }
        Ok(())
    }

    /// Cluster offset where the subtree under `child` begins, read from
    /// its first live record.
    fn child_boundary_cpos(&self, child: PathNode) -> Result<u32> {
        let list = self.list_at(child)?;
        if list.next_free() == 0 {
            return Err(Error::corrupt(child.blkno, "child list has no records"));
        }
        if list.rec_cpos(0)? == 0 && list.rec_clusters(0)? == 0 {
            if list.next_free() == 1 {
                return Err(Error::corrupt(
                    child.blkno,
                    "child list holds only an empty record",
                ));
            }
            return list.rec_cpos(1);
        }
        list.rec_cpos(0)
    }

    /// Push the floating empty record out of `path`'s leaf, rotating it
    /// rightward until it falls off the tree's right edge or a dead
    /// right branch is unlinked. A no-op when the leaf has no empty
    /// head; flat roots just drop the slot in place.
    pub(super) fn rotate_tree_left(
        &mut self,
        txn: &mut Txn,
        path: &TreePath,
        dealloc: &mut DeallocCtx,
    ) -> Result<()> {
        if !self.list_at(path.leaf())?.has_empty_head() {
            return Ok(());
        }
        trace!(leaf = path.leaf().blkno, "extent_rotate_left");
        if path.leaf_level() == 0 {
            return self.drop_leading_empty(txn, path);
        }

        let (next_leaf, used) = {
            let eb = self.eb_at(path.leaf().blkno)?;
            (eb.next_leaf_blk(), eb.list().next_free())
        };
        if next_leaf == 0 {
            // Rightmost leaf. With records left the slot drops in place;
            // reduced to the bare empty record, the whole branch goes.
            if used > 1 {
                return self.drop_leading_empty(txn, path);
            }
            if used == 0 {
                return Err(Error::corrupt(
                    path.leaf().blkno,
                    "extent block with no records",
                ));
            }
            return self.remove_rightmost_path(txn, path, dealloc);
        }

        let orig_credits = txn.remaining_credits();
        'from_start: loop {
            match self.rotate_left_pass(txn, orig_credits, path, dealloc)? {
                LeftRotation::Done => break 'from_start,
                LeftRotation::Restart(mut restart) => loop {
                    match self.rotate_left_pass(txn, orig_credits, &restart, dealloc)? {
                        LeftRotation::Done => continue 'from_start,
                        LeftRotation::Restart(next) => restart = next,
                    }
                },
            }
        }
        Ok(())
    }

    /// Remove the empty head record from `path`'s leaf in place.
    fn drop_leading_empty(&mut self, txn: &mut Txn, path: &TreePath) -> Result<()> {
        if !self.list_at(path.leaf())?.has_empty_head() {
            return Ok(());
        }
        let journal = self.journal;
        journal.access(txn, path.leaf().blkno, CommitTrigger::SealBlock)?;
        {
            let mut list = self.list_at_mut(path.leaf())?;
            list.remove_empty_head()?;
        }
        journal.dirty(txn, path.leaf().blkno)
    }

    /// One sweep of the empty record toward the right edge. Stops early
    /// when a right leaf needs rotating first or a dead branch was
    /// unlinked.
    fn rotate_left_pass(
        &mut self,
        txn: &mut Txn,
        orig_credits: u32,
        path: &TreePath,
        dealloc: &mut DeallocCtx,
    ) -> Result<LeftRotation> {
        if !self.list_at(path.leaf())?.has_empty_head() {
            return Ok(LeftRotation::Done);
        }

        let mut left_path = path.clone();
        let mut right_cpos = self.find_cpos_for_right_leaf(&left_path)?;
        while let Some(cpos) = right_cpos {
            let right_path = self.path_to(cpos)?;
            let subtree = find_subtree_root(&left_path, &right_path)?;

            self.extend_rotate_txn(txn, 0, orig_credits, &left_path)?;
            self.access_path(txn, &left_path)?;
            self.access_path(txn, &right_path)?;

            match self.rotate_subtree_left(txn, &left_path, &right_path, subtree, dealloc)? {
                SubtreeRotation::RightHasEmpty => return Ok(LeftRotation::Restart(right_path)),
                SubtreeRotation::Deleted => break,
                SubtreeRotation::Rotated => {}
            }

            left_path = right_path;
            right_cpos = self.find_cpos_for_right_leaf(&left_path)?;
        }
        Ok(LeftRotation::Done)
    }

    /// Move slot 0 of the right leaf into the left leaf, advancing the
    /// empty record one leaf rightward. A rightmost right leaf down to
    /// its last record gives that record up and the branch is unlinked.
    fn rotate_subtree_left(
        &mut self,
        txn: &mut Txn,
        left_path: &TreePath,
        right_path: &TreePath,
        subtree: usize,
        dealloc: &mut DeallocCtx,
    ) -> Result<SubtreeRotation> {
        let journal = self.journal;
        let left_leaf = left_path.leaf();
        let right_leaf = right_path.leaf();

        if left_path.node(subtree).blkno != right_path.node(subtree).blkno {
            return Err(Error::invariant("subtree roots disagree"));
        }
        if !self.list_at(left_leaf)?.has_empty_head() {
            return Ok(SubtreeRotation::Rotated);
        }

        let next_leaf = self.eb_at(right_leaf.blkno)?.next_leaf_blk();
        let mut right_has_empty = false;
        if self.list_at(right_leaf)?.has_empty_head() {
            if next_leaf != 0 {
                return Ok(SubtreeRotation::RightHasEmpty);
            }
            if self.list_at(right_leaf)?.next_free() > 1 {
                // Rightmost with records behind the hole: drop the hole
                // up front and rotate as usual.
                journal.access(txn, right_leaf.blkno, CommitTrigger::SealBlock)?;
                let mut list = self.list_at_mut(right_leaf)?;
                list.remove_empty_head()?;
            } else {
                right_has_empty = true;
            }
        }

        let del_right_subtree = next_leaf == 0 && self.list_at(right_leaf)?.next_free() == 1;
        if del_right_subtree {
            self.access_root(txn)?;
        }
        // An empty record survives the checks above only on a branch
        // about to be unlinked.
        if right_has_empty && !del_right_subtree {
            return Err(Error::invariant("interior leaf reduced to an empty record"));
        }

        journal.access(txn, right_path.node(subtree).blkno, CommitTrigger::SealBlock)?;
        for level in subtree + 1..right_path.num_levels() {
            journal.access(txn, right_path.node(level).blkno, CommitTrigger::SealBlock)?;
            journal.access(txn, left_path.node(level).blkno, CommitTrigger::SealBlock)?;
        }

        if !right_has_empty {
            let moved = self.list_at(right_leaf)?.leaf_rec(0)?;
            {
                let mut list = self.list_at_mut(left_leaf)?;
                list.rotate_in(moved)?;
            }
            let mut list = self.list_at_mut(right_leaf)?;
            list.clear_rec(0)?;
        }
        if next_leaf == 0 {
            // Nothing to the right will absorb the zeroed slot, so it
            // comes out now. This may leave the list empty; the delete
            // below expects exactly that.
            let mut list = self.list_at_mut(right_leaf)?;
            list.remove_empty_head()?;
        }

        journal.dirty(txn, left_leaf.blkno)?;
        journal.dirty(txn, right_leaf.blkno)?;

        if del_right_subtree {
            self.unlink_subtree(txn, left_path, right_path, subtree, dealloc)?;
            self.update_edge_lengths(txn, left_path)?;
            self.set_last_leaf_blk(left_leaf.blkno)?;

            // No record moved out of the right branch, so the left
            // leaf's empty head is still there to clean up.
            if right_has_empty {
                {
                    let mut list = self.list_at_mut(left_leaf)?;
                    list.remove_empty_head()?;
                }
                journal.dirty(txn, left_leaf.blkno)?;
            }

            journal.dirty(txn, self.root_blkno)?;
            Ok(SubtreeRotation::Deleted)
        } else {
            self.complete_edge_insert(txn, left_path, right_path, subtree)?;
            Ok(SubtreeRotation::Rotated)
        }
    }

    /// Drop the right path's branch from the subtree root and hand its
    /// blocks to deferred reclamation. The left leaf becomes the new
    /// right edge of the chain.
    fn unlink_subtree(
        &mut self,
        txn: &mut Txn,
        left_path: &TreePath,
        right_path: &TreePath,
        subtree: usize,
        dealloc: &mut DeallocCtx,
    ) -> Result<()> {
        let journal = self.journal;
        let root_node = left_path.node(subtree);
        let removed_blkno = right_path.node(subtree + 1).blkno;

        let (idx, used) = {
            let list = self.list_at(root_node)?;
            let used = list.next_free() as usize;
            let mut found = None;
            for i in 1..used {
                if list.rec_blkno(i)? == removed_blkno {
                    found = Some(i);
                    break;
                }
            }
            let Some(idx) = found else {
                return Err(Error::invariant("unlinked branch is missing from its parent"));
            };
            (idx, used)
        };
        // Clearing without a shift is only sound for the last record.
        if idx != used - 1 {
            return Err(Error::invariant("unlinked branch is not the rightmost child"));
        }

        {
            let mut list = self.list_at_mut(root_node)?;
            list.clear_rec(idx)?;
            list.set_next_free(used as u16 - 1)?;
        }
        self.eb_at_mut(left_path.leaf().blkno)?.set_next_leaf_blk(0);

        journal.dirty(txn, root_node.blkno)?;
        journal.dirty(txn, left_path.leaf().blkno)?;

        self.unlink_path(txn, right_path, subtree + 1, dealloc)
    }

    /// Zero and defer every block of `path` from `from_level` down. A
    /// block still holding records is left allocated and reported; the
    /// levels above were expected to drain it first.
    fn unlink_path(
        &mut self,
        txn: &mut Txn,
        path: &TreePath,
        from_level: usize,
        dealloc: &mut DeallocCtx,
    ) -> Result<()> {
        let journal = self.journal;
        for level in from_level..path.num_levels() {
            let blkno = path.node(level).blkno;
            let (used, slot, bit) = {
                let eb = self.eb_at(blkno)?;
                (eb.list().next_free(), eb.suballoc_slot(), eb.suballoc_bit())
            };
            if used > 1 {
                warn!(blkno, records = used, "unlinked_block_still_populated");
                journal.dirty(txn, blkno)?;
                continue;
            }
            {
                let mut eb = self.eb_at_mut(blkno)?;
                let mut list = eb.list_mut();
                list.clear_rec(0)?;
                list.set_next_free(0)?;
            }
            journal.dirty(txn, blkno)?;
            dealloc.defer(blkno, slot, bit);
        }
        Ok(())
    }

    /// Rewrite the last record of every interior level so it ends where
    /// the rightmost leaf's mapping ends. Run after an unlink shortens
    /// the right edge.
    fn update_edge_lengths(&mut self, txn: &mut Txn, path: &TreePath) -> Result<()> {
        let journal = self.journal;
        self.access_path(txn, path)?;

        let leaf = path.leaf();
        if self.eb_at(leaf.blkno)?.next_leaf_blk() != 0 {
            return Err(Error::invariant("edge update away from the rightmost branch"));
        }
        let range = {
            let list = self.list_at(leaf)?;
            let Some(last) = list.last_index() else {
                return Err(Error::invariant("rightmost leaf has no records"));
            };
            list.rec_end(last)?
        };

        for level in 0..path.leaf_level() {
            let node = path.node(level);
            let (idx, rec) = {
                let list = self.list_at(node)?;
                let Some(idx) = list.last_index() else {
                    return Err(Error::corrupt(node.blkno, "interior node has no records"));
                };
                (idx, list.interior_rec(idx)?)
            };
            let clusters = range
                .checked_sub(rec.cpos)
                .ok_or_else(|| Error::invariant("edge record begins past the mapped range"))?;
            {
                let mut list = self.list_at_mut(node)?;
                list.set_interior_rec(
                    idx,
                    InteriorRec {
                        cpos: rec.cpos,
                        clusters,
                        blkno: rec.blkno,
                    },
                )?;
            }
            journal.dirty(txn, node.blkno)?;
        }
        Ok(())
    }

    /// Unlink the rightmost branch outright. With branches to the left
    /// the nearest one inherits the right edge; a lone branch collapses
    /// the root back to holding records inline.
    pub(super) fn remove_rightmost_path(
        &mut self,
        txn: &mut Txn,
        path: &TreePath,
        dealloc: &mut DeallocCtx,
    ) -> Result<()> {
        let journal = self.journal;
        self.ops
            .sanity_check(self.store.block(self.root_blkno)?, self.root_blkno)?;
        self.access_path(txn, path)?;

        match self.find_cpos_for_left_leaf(path)? {
            Some(cpos) if cpos > 0 => {
                let left_path = self.path_to(cpos)?;
                self.access_path(txn, &left_path)?;
                let subtree = find_subtree_root(&left_path, path)?;
                self.unlink_subtree(txn, &left_path, path, subtree, dealloc)?;
                self.update_edge_lengths(txn, &left_path)?;
                self.set_last_leaf_blk(left_path.leaf().blkno)?;
            }
            _ => {
                // Also the leftmost branch, so it is the only one.
                self.unlink_path(txn, path, 1, dealloc)?;
                {
                    let mut list = self.list_at_mut(self.root_node())?;
                    list.set_tree_depth(0)?;
                    list.clear_rec(0)?;
                    list.set_next_free(0)?;
                }
                self.set_last_leaf_blk(0)?;
            }
        }
        journal.dirty(txn, self.root_blkno)
    }
}

#[cfg(test)]
mod rotate_tests {
    use std::sync::Arc;

    use crate::config::{Geometry, FILE_ROOT_HEADER_SIZE};
    use crate::dealloc::DeallocCtx;
    use crate::error::VolumeHealth;
    use crate::journal::{Journal, SyncMode};
    use crate::ondisk::{EbMut, FileRootHeader, InteriorRec, LeafRec, ListMut, RecFlags};
    use crate::store::{BlockStore, MemStore};
    use crate::tree::ExtentTree;

    const ROOT: u64 = 1;
    const GEN: u32 = 3;

    fn fixture() -> (MemStore, Journal, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::create(
            dir.path().join("journal"),
            SyncMode::Off,
            Arc::new(VolumeHealth::new()),
        )
        .unwrap();
        (MemStore::new(512, 64), journal, dir)
    }

    fn leaf_rec(cpos: u32, clusters: u16, blkno: u64) -> LeafRec {
        LeafRec {
            cpos,
            clusters,
            flags: RecFlags::empty(),
            blkno,
        }
    }

    /// Depth-1 tree over leaves at blocks 2 and 3. The left leaf carries
    /// an empty head in front of [0, 8); the right leaf maps [8, 16).
    fn build_hollow_left_tree(store: &mut MemStore) {
        FileRootHeader::init(store.block_mut(ROOT).unwrap(), ROOT, GEN).unwrap();
        {
            let data = store.block_mut(2).unwrap();
            let mut eb = EbMut::init(data, 2, GEN, 0, 2, 0).unwrap();
            eb.set_next_leaf_blk(3);
            let mut list = eb.list_mut();
            list.push_leaf(leaf_rec(0, 8, 100)).unwrap();
            list.create_empty_head().unwrap();
        }
        {
            let data = store.block_mut(3).unwrap();
            let mut eb = EbMut::init(data, 3, GEN, 0, 3, 0).unwrap();
            eb.list_mut().push_leaf(leaf_rec(8, 8, 108)).unwrap();
        }
        let root_data = store.block_mut(ROOT).unwrap();
        {
            let header = FileRootHeader::from_bytes_mut(root_data, ROOT).unwrap();
            header.set_clusters(16);
            header.set_last_leaf_blk(3);
        }
        let mut list = ListMut::new(&mut root_data[FILE_ROOT_HEADER_SIZE..], ROOT).unwrap();
        list.set_tree_depth(1).unwrap();
        list.push_interior(InteriorRec {
            cpos: 0,
            clusters: 8,
            blkno: 2,
        })
        .unwrap();
        list.push_interior(InteriorRec {
            cpos: 8,
            clusters: 8,
            blkno: 3,
        })
        .unwrap();
    }

    #[test]
    fn left_rotation_absorbs_the_right_branch() {
        let (mut store, journal, _dir) = fixture();
        build_hollow_left_tree(&mut store);
        let geom = Geometry::new(9, 9).unwrap();
        let mut tree = ExtentTree::file(&mut store, &journal, geom, ROOT).unwrap();
        let mut dealloc = DeallocCtx::new();

        let path = tree.path_to(0).unwrap();
        let mut txn = journal.begin(8).unwrap();
        tree.rotate_tree_left(&mut txn, &path, &mut dealloc).unwrap();
        journal.commit(txn, tree.store).unwrap();

        // The lone record of leaf 3 moved left and the branch died.
        let root = tree.list_at(tree.root_node()).unwrap();
        assert_eq!(root.next_free(), 1);
        assert_eq!(
            root.interior_rec(0).unwrap(),
            InteriorRec {
                cpos: 0,
                clusters: 16,
                blkno: 2,
            }
        );
        drop(root);
        assert_eq!(tree.last_leaf_blk().unwrap(), 2);

        let leaf = tree.eb_at(2).unwrap();
        assert_eq!(leaf.next_leaf_blk(), 0);
        assert_eq!(leaf.list().next_free(), 2);
        assert_eq!(leaf.list().leaf_rec(0).unwrap(), leaf_rec(0, 8, 100));
        assert_eq!(leaf.list().leaf_rec(1).unwrap(), leaf_rec(8, 8, 108));
        drop(leaf);

        assert_eq!(dealloc.total(), 1);
        assert_eq!(tree.lookup(12).unwrap(), Some(leaf_rec(8, 8, 108)));
    }

    #[test]
    fn emptying_the_only_branch_reverts_the_root_to_inline() {
        let (mut store, journal, _dir) = fixture();
        FileRootHeader::init(store.block_mut(ROOT).unwrap(), ROOT, GEN).unwrap();
        {
            let data = store.block_mut(2).unwrap();
            let mut eb = EbMut::init(data, 2, GEN, 0, 2, 0).unwrap();
            eb.list_mut().create_empty_head().unwrap();
        }
        let root_data = store.block_mut(ROOT).unwrap();
        FileRootHeader::from_bytes_mut(root_data, ROOT)
            .unwrap()
            .set_last_leaf_blk(2);
        {
            let mut list = ListMut::new(&mut root_data[FILE_ROOT_HEADER_SIZE..], ROOT).unwrap();
            list.set_tree_depth(1).unwrap();
            list.push_interior(InteriorRec {
                cpos: 0,
                clusters: 8,
                blkno: 2,
            })
            .unwrap();
        }

        let geom = Geometry::new(9, 9).unwrap();
        let mut tree = ExtentTree::file(&mut store, &journal, geom, ROOT).unwrap();
        let mut dealloc = DeallocCtx::new();

        let path = tree.path_to(0).unwrap();
        let mut txn = journal.begin(8).unwrap();
        tree.rotate_tree_left(&mut txn, &path, &mut dealloc).unwrap();
        journal.commit(txn, tree.store).unwrap();

        assert_eq!(tree.depth().unwrap(), 0);
        assert_eq!(tree.last_leaf_blk().unwrap(), 0);
        let root = tree.list_at(tree.root_node()).unwrap();
        assert_eq!(root.next_free(), 0);
        drop(root);
        assert_eq!(dealloc.total(), 1);
        assert_eq!(tree.lookup(0).unwrap(), None);
    }
}
