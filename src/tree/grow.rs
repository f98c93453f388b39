//! Tree growth.
//!
//! Two ways to make room. `shift_tree_depth` raises the whole tree one
//! level: the root's records move into a fresh extent block and the root
//! keeps a single record spanning everything. `add_branch` hangs a new
//! rightmost chain of blocks, one per level, off the lowest interior node
//! that still has a free slot, ending in an empty leaf ready for appends.
//! `grow_tree` picks between them.

use tracing::debug;

use crate::config::EXTENT_BLOCK_HEADER_SIZE;
use crate::error::{Error, Result};
use crate::journal::{CommitTrigger, Txn};
use crate::ondisk::record::{InteriorRec, RawExtentRec};
use crate::ondisk::EbMut;
use crate::store::BlockStore;
use crate::suballoc::MetaAlloc;

use super::path::PathNode;
use super::tree::ExtentTree;

impl<S: BlockStore> ExtentTree<'_, S> {
    /// Make room for at least one more record on the rightmost edge.
    ///
    /// Preference order: splice a branch under an existing non-full
    /// interior node, else raise the depth first and branch under the new
    /// top. A shift out of depth 0 is complete by itself because the fresh
    /// block has more record slots than any root list.
    pub(super) fn grow_tree(&mut self, txn: &mut Txn, meta: &MetaAlloc) -> Result<()> {
        let root_depth = self.depth()?;
        let (shift, target) = self.find_branch_target()?;
        if shift {
            let new_eb = self.shift_tree_depth(txn, meta)?;
            if root_depth == 0 {
                return Ok(());
            }
            return self.add_branch(txn, meta, Some(new_eb));
        }
        self.add_branch(txn, meta, target)
    }

    /// Walk the rightmost spine looking for the lowest interior node with
    /// a free record slot. Returns `(true, None)` when nothing has room
    /// and the only way forward is a depth shift.
    fn find_branch_target(&self) -> Result<(bool, Option<u64>)> {
        let mut node = self.root_node();
        let mut lowest: Option<u64> = None;
        loop {
            let (used, depth) = {
                let list = self.list_at(node)?;
                if list.tree_depth() <= 1 {
                    break;
                }
                (list.next_free() as usize, list.tree_depth())
            };
            if used == 0 {
                return Err(Error::corrupt(
                    node.blkno,
                    format!("interior node at depth {} has no records", depth),
                ));
            }
            let child = self.list_at(node)?.rec_blkno(used - 1)?;
            if child == 0 {
                return Err(Error::corrupt(
                    node.blkno,
                    "rightmost record has no block address",
                ));
            }
            node = PathNode {
                blkno: child,
                list_off: EXTENT_BLOCK_HEADER_SIZE,
            };
            let list = self.list_at(node)?;
            if !list.is_full() {
                lowest = Some(child);
            }
        }
        let root = self.list_at(self.root_node())?;
        let shift = lowest.is_none() && root.is_full();
        Ok((shift, lowest))
    }

    /// Move every root record into a fresh extent block and leave the root
    /// with one record covering the block's whole range. Returns the new
    /// block so a following `add_branch` can hang the next chain off it.
    fn shift_tree_depth(&mut self, txn: &mut Txn, meta: &MetaAlloc) -> Result<u64> {
        let journal = self.journal;
        let root_depth = self.depth()?;
        debug!(root = self.root_blkno, depth = root_depth, "tree_depth_shift");

        let eb_blkno = self.new_extent_block(txn, meta, root_depth)?;

        let records: Vec<RawExtentRec> = {
            let root = self.list_at(self.root_node())?;
            (0..root.next_free() as usize)
                .map(|idx| root.raw(idx))
                .collect::<Result<_>>()?
        };
        {
            let mut eb = self.eb_at_mut(eb_blkno)?;
            let mut list = eb.list_mut();
            for raw in &records {
                list.push_raw(*raw)?;
            }
        }
        journal.dirty(txn, eb_blkno)?;

        self.access_root(txn)?;
        let span = self.eb_at(eb_blkno)?.list().range_end()?;
        {
            let mut root = self.list_at_mut(self.root_node())?;
            root.set_tree_depth(root_depth + 1)?;
            root.set_interior_rec(
                0,
                InteriorRec {
                    cpos: 0,
                    clusters: span,
                    blkno: eb_blkno,
                },
            )?;
            for idx in 1..records.len() {
                root.clear_rec(idx)?;
            }
            root.set_next_free(1)?;
        }
        if root_depth == 0 {
            self.set_last_leaf_blk(eb_blkno)?;
        }
        journal.dirty(txn, self.root_blkno)?;
        Ok(eb_blkno)
    }

    /// Splice a fresh rightmost branch into `target` (an interior extent
    /// block) or into the root list. The chain starts one level below the
    /// start list and runs down to a new empty leaf taking over appends.
    fn add_branch(&mut self, txn: &mut Txn, meta: &MetaAlloc, target: Option<u64>) -> Result<()> {
        let journal = self.journal;

        let start_node = match target {
            Some(blkno) => PathNode {
                blkno,
                list_off: EXTENT_BLOCK_HEADER_SIZE,
            },
            None => self.root_node(),
        };
        let chain_len = self.list_at(start_node)?.tree_depth();
        if chain_len == 0 {
            return Err(Error::invariant("branch added to a leaf list"));
        }

        let last_leaf = self.last_leaf_blk()?;
        if last_leaf == 0 {
            return Err(Error::corrupt(
                self.root_blkno,
                "branched tree without a rightmost leaf",
            ));
        }
        let new_cpos = self.eb_at(last_leaf)?.list().range_end()?;
        let root_end = self.list_at(self.root_node())?.range_end()?;

        // Interior spans on the rightmost edge may run past the leaf's real
        // end. The new branch starts at the leaf end, so pull those spans
        // back first or the levels above would overlap it.
        if root_end > new_cpos {
            self.adjust_rightmost_branch(txn)?;
        }

        debug!(
            root = self.root_blkno,
            new_cpos,
            chain = chain_len,
            "tree_add_branch"
        );

        let mut next_blkno = 0u64;
        let mut new_last_leaf = 0u64;
        for depth in 0..chain_len {
            let blkno = self.new_extent_block(txn, meta, depth)?;
            {
                let mut eb = self.eb_at_mut(blkno)?;
                let mut list = eb.list_mut();
                // The bottom block is a leaf, but a zero interior payload
                // reads back as an empty leaf record, so one encoding
                // serves the whole chain.
                list.push_raw(RawExtentRec::from_interior(InteriorRec {
                    cpos: new_cpos,
                    clusters: 0,
                    blkno: next_blkno,
                }))?;
            }
            journal.dirty(txn, blkno)?;
            if depth == 0 {
                new_last_leaf = blkno;
            }
            next_blkno = blkno;
        }

        journal.access(txn, last_leaf, CommitTrigger::SealBlock)?;
        self.access_root(txn)?;
        if let Some(t) = target {
            journal.access(txn, t, CommitTrigger::SealBlock)?;
        }

        {
            let mut list = self.list_at_mut(start_node)?;
            list.push_interior(InteriorRec {
                cpos: new_cpos,
                clusters: 0,
                blkno: next_blkno,
            })?;
        }
        self.set_last_leaf_blk(new_last_leaf)?;
        {
            let mut eb = self.eb_at_mut(last_leaf)?;
            eb.set_next_leaf_blk(new_last_leaf);
        }

        journal.dirty(txn, last_leaf)?;
        journal.dirty(txn, self.root_blkno)?;
        if let Some(t) = target {
            journal.dirty(txn, t)?;
        }
        Ok(())
    }

    /// Claim a metadata block and stamp it as an empty extent block at the
    /// given depth, inside the caller's transaction.
    pub(super) fn new_extent_block(
        &mut self,
        txn: &mut Txn,
        meta: &MetaAlloc,
        depth: u16,
    ) -> Result<u64> {
        let journal = self.journal;
        let generation = self.fs_generation()?;
        let mb = meta.claim_block()?;
        journal.access(txn, mb.blkno, CommitTrigger::SealBlock)?;
        EbMut::init(
            self.store.block_mut(mb.blkno)?,
            mb.blkno,
            generation,
            mb.slot,
            mb.bit,
            depth,
        )?;
        journal.dirty(txn, mb.blkno)?;
        debug!(blkno = mb.blkno, depth, "extent_block_created");
        Ok(mb.blkno)
    }

    /// Shrink the interior spans over the rightmost leaf down to the
    /// leaf's real end.
    fn adjust_rightmost_branch(&mut self, txn: &mut Txn) -> Result<()> {
        let journal = self.journal;
        let path = self.rightmost_path()?;
        journal.extend(txn, path.num_levels() as u32)?;
        self.access_path(txn, &path)?;

        let rec = {
            let leaf = self.list_at(path.leaf())?;
            let idx = leaf.last_index().ok_or_else(|| {
                Error::corrupt(path.leaf().blkno, "rightmost leaf has no records")
            })?;
            leaf.leaf_rec(idx)?
        };
        self.adjust_rightmost_records(txn, &path, &rec)
    }
}
