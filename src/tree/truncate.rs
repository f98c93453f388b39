//! Removal of mapped cluster ranges.
//!
//! A removal works against a single record. The range must share the
//! record's left or right edge; a strictly interior range is first
//! reduced to that shape by splitting the right remainder off into a
//! record of its own. Removing a record whole leaves the empty head
//! behind for left rotation to carry away, and a rightmost branch
//! emptied this way is unlinked into the deferred reclaim context.
//!
//! Freed cluster ranges never go back to the allocator directly. The
//! removing transaction appends them to the on-disk truncate log and a
//! separate flush transaction releases them later, so a crash between
//! the two finds the ranges still logged and releases them at mount.
//! The append also happens before any record changes, which lets a log
//! with no room fail the removal with the tree untouched.
//!
//! [`truncate_to`](ExtentTree::truncate_to) drives whole-tree shrinking
//! from the right edge, one tail record per transaction, so the tree
//! moves through committed consistent states on the way down.

use tracing::trace;

use crate::config::{grow_credits, rotate_subtree_credits, tree_op_credits};
use crate::dealloc::{DeallocCtx, TruncateLog};
use crate::error::{Error, Result};
use crate::journal::Txn;
use crate::ondisk::record::LeafRec;
use crate::store::BlockStore;
use crate::suballoc::{ClusterAlloc, MetaAlloc};

use super::insert::{AppendType, ContigType, InsertType, SplitType};
use super::merge::{cleanup_merge, make_right_split_rec};
use super::path::{find_subtree_root, TreePath};
use super::tree::ExtentTree;

impl<S: BlockStore> ExtentTree<'_, S> {
    /// Carve everything right of `new_range` out of the record at `index`
    /// into a record of its own, so the removal below shares the host's
    /// right edge.
    fn split_tree(
        &mut self,
        txn: &mut Txn,
        path: &TreePath,
        index: usize,
        new_range: u32,
        meta: &MetaAlloc,
    ) -> Result<()> {
        let journal = self.journal;
        let geom = self.geom;

        let rec = self.list_at(path.leaf())?.leaf_rec(index)?;
        let split_rec = make_right_split_rec(geom, new_range, &rec)?;

        let mut depth = self.depth()?;
        // A split can grow the tree on top of the single pass the caller
        // budgeted for.
        journal.extend(txn, tree_op_credits(depth) + grow_credits(depth))?;

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

        let ins = InsertType {
            split: SplitType::Right,
            appending: AppendType::None,
            contig: ContigType::None,
            contig_index: 0,
            tree_depth: depth,
        };
        self.do_insert(txn, &split_rec, &ins)
    }

    /// Remove `len` clusters from one edge of the record at `index`. The
    /// range must share the record's left edge, its right edge, or both;
    /// interior ranges were split by the caller.
    fn truncate_rec(
        &mut self,
        txn: &mut Txn,
        path: &TreePath,
        mut index: usize,
        dealloc: &mut DeallocCtx,
        cpos: u32,
        len: u32,
    ) -> Result<()> {
        let journal = self.journal;
        let geom = self.geom;
        let trunc_range = cpos + len;

        if self.list_at(path.leaf())?.has_empty_head() && index > 0 {
            // Emptying the record would slide it into slot zero, which
            // must not already hold an empty record. Rotate that one off
            // first and follow the slide.
            let op_credits = txn.remaining_credits();
            self.extend_rotate_txn(txn, 0, op_credits, path)?;
            self.rotate_tree_left(txn, path, dealloc)?;
            index -= 1;
        }

        let depth = path.leaf_level();
        let used = self.list_at(path.leaf())?.next_free() as usize;
        let is_rightmost_rec = index + 1 == used
            && depth > 0
            && self.eb_at(path.leaf().blkno)?.next_leaf_blk() == 0;

        let rec = self.list_at(path.leaf())?.leaf_rec(index)?;

        let mut left_path = None;
        if index == 0 && depth > 0 && rec.cpos == cpos {
            // Trimming the first record of a leaf moves the boundary
            // shared with the leaf to its left, so that leaf's parent
            // records need the same edit. Not when the path is leftmost,
            // and not when the leaf ends up empty and the rotation below
            // removes the whole branch.
            if let Some(left_cpos) = self.find_cpos_for_left_leaf(path)?.filter(|c| *c != 0) {
                if used > 1 {
                    left_path = Some(self.path_to(left_cpos)?);
                }
            }
        }

        let op_credits = txn.remaining_credits();
        self.extend_rotate_txn(txn, 0, op_credits, path)?;
        self.access_path(txn, path)?;
        if let Some(left) = &left_path {
            self.access_path(txn, left)?;
        }

        let len16 = u16::try_from(len)
            .map_err(|_| Error::invariant("removal longer than one record"))?;

        if rec.cpos == cpos && rec.end() == trunc_range {
            {
                let mut list = self.list_at_mut(path.leaf())?;
                list.clear_rec(index)?;
                cleanup_merge(&mut list, index)?;
            }
            let used_now = self.list_at(path.leaf())?.next_free() as usize;
            if is_rightmost_rec && used_now > 1 {
                let tail = self.list_at(path.leaf())?.leaf_rec(used_now - 1)?;
                self.adjust_rightmost_records(txn, path, &tail)?;
            }
        } else if rec.cpos == cpos {
            let remaining = rec
                .clusters
                .checked_sub(len16)
                .ok_or_else(|| Error::invariant("removal consumes more than its record"))?;
            let shrunk = LeafRec {
                cpos: rec.cpos + len,
                clusters: remaining,
                flags: rec.flags,
                blkno: rec.blkno + geom.clusters_to_blocks(len),
            };
            let mut list = self.list_at_mut(path.leaf())?;
            list.set_leaf_rec(index, shrunk)?;
        } else if rec.end() == trunc_range {
            let remaining = rec
                .clusters
                .checked_sub(len16)
                .ok_or_else(|| Error::invariant("removal consumes more than its record"))?;
            let shrunk = LeafRec {
                clusters: remaining,
                ..rec
            };
            {
                let mut list = self.list_at_mut(path.leaf())?;
                list.set_leaf_rec(index, shrunk)?;
            }
            if is_rightmost_rec {
                self.adjust_rightmost_records(txn, path, &shrunk)?;
            }
        } else {
            return Err(Error::invariant(
                "truncate range shares no edge with its record",
            ));
        }

        if let Some(left) = &left_path {
            let subtree = find_subtree_root(left, path)?;
            self.complete_edge_insert(txn, left, path, subtree)?;
        }
        journal.dirty(txn, path.leaf().blkno)?;

        self.rotate_tree_left(txn, path, dealloc)
    }

    /// Unmap `len` clusters starting at `cpos` inside the caller's
    /// transaction. The range must lie inside a single record; the freed
    /// clusters are logged before the tree stops mapping them.
    pub(super) fn remove_clusters(
        &mut self,
        txn: &mut Txn,
        cpos: u32,
        len: u32,
        meta: &MetaAlloc,
        dealloc: &mut DeallocCtx,
        tlog: &TruncateLog,
    ) -> Result<()> {
        let journal = self.journal;
        let geom = self.geom;
        self.access_root(txn)?;

        let path = self.path_to(cpos)?;
        let (index, rec) = {
            let leaf = self.list_at(path.leaf())?;
            let index = leaf.search(cpos).ok_or_else(|| {
                Error::corrupt(path.leaf().blkno, "no record maps the removed range")
            })?;
            (index, leaf.leaf_rec(index)?)
        };

        let trunc_range = cpos
            .checked_add(len)
            .ok_or_else(|| Error::invariant("range wraps the cluster space"))?;
        if cpos < rec.cpos || trunc_range > rec.end() {
            return Err(Error::invariant("removal leaves its host record"));
        }
        trace!(
            cpos,
            len,
            index,
            rec_cpos = rec.cpos,
            rec_clusters = rec.clusters,
            "extent_remove_rec"
        );

        // Log first; `LogFull` must surface before any record changes.
        let phys = rec.blkno + geom.clusters_to_blocks(cpos - rec.cpos);
        tlog.append(journal, txn, self.store, geom.blocks_to_clusters(phys), len)?;

        if rec.cpos == cpos || rec.end() == trunc_range {
            self.truncate_rec(txn, &path, index, dealloc, cpos, len)?;
        } else {
            self.split_tree(txn, &path, index, trunc_range, meta)?;

            // The split may have reshaped the tree under the old path;
            // walk to the record again.
            let path = self.path_to(cpos)?;
            let (index, rec) = {
                let leaf = self.list_at(path.leaf())?;
                let index = leaf.search(cpos).ok_or_else(|| {
                    Error::corrupt(path.leaf().blkno, "record lost during a split")
                })?;
                (index, leaf.leaf_rec(index)?)
            };
            if rec.end() != trunc_range {
                return Err(Error::corrupt(
                    path.leaf().blkno,
                    "split left the wrong record boundary",
                ));
            }
            self.truncate_rec(txn, &path, index, dealloc, cpos, len)?;
        }

        self.update_clusters(-i64::from(len))?;
        journal.dirty(txn, self.root_blkno)
    }

    /// Unmap `clusters` starting at `cpos` in a transaction of its own,
    /// flushing the truncate log first when it has no room left.
    ///
    /// Behaves like [`remove`](Self::remove) for callers that do not
    /// carry a transaction.
    pub fn remove_range(
        &mut self,
        cpos: u32,
        clusters: u32,
        meta: &MetaAlloc,
        dealloc: &mut DeallocCtx,
        tlog: &TruncateLog,
        cluster_alloc: &ClusterAlloc,
    ) -> Result<()> {
        let journal = self.journal;
        trace!(root = self.root_blkno, cpos, clusters, "extent_remove_range");
        if clusters == 0 {
            return Err(Error::invariant("zero-length extent remove"));
        }
        let res: Result<()> = (|| {
            if tlog.needs_flush(self.store)? {
                tlog.flush(journal, self.store, cluster_alloc)?;
            }
            let mut txn = journal.begin(self.remove_credits()?)?;
            match self.remove_clusters(&mut txn, cpos, clusters, meta, dealloc, tlog) {
                Ok(()) => journal.commit(txn, self.store),
                Err(err) => {
                    journal.abort(txn);
                    Err(err)
                }
            }
        })();
        self.guard(res)
    }

    /// Shrink the mapped space so no record reaches past `new_clusters`,
    /// removing tail records in as many passes as that takes.
    ///
    /// Every pass commits a transaction of its own before the next
    /// begins, so an interruption leaves a shorter but consistent tree.
    /// Freed cluster ranges land in the truncate log and unlinked
    /// metadata blocks in `dealloc`; running the deferred context
    /// afterwards is the caller's job.
    pub fn truncate_to(
        &mut self,
        new_clusters: u32,
        meta: &MetaAlloc,
        dealloc: &mut DeallocCtx,
        tlog: &TruncateLog,
        cluster_alloc: &ClusterAlloc,
    ) -> Result<()> {
        let journal = self.journal;
        trace!(root = self.root_blkno, new_clusters, "extent_truncate_to");
        let res: Result<()> = (|| {
            loop {
                if self.total_clusters()? == 0 {
                    return Ok(());
                }
                let depth = self.depth()?;
                let path = self.rightmost_path()?;
                let trunc = {
                    let leaf = self.list_at(path.leaf())?;
                    let idx = leaf.last_index().ok_or_else(|| {
                        Error::corrupt(path.leaf().blkno, "rightmost leaf with no records")
                    })?;
                    let rec = leaf.leaf_rec(idx)?;
                    if idx == 0 && rec.is_empty() {
                        None
                    } else if rec.cpos >= new_clusters {
                        Some((rec.cpos, u32::from(rec.clusters)))
                    } else if rec.end() > new_clusters {
                        Some((new_clusters, rec.end() - new_clusters))
                    } else {
                        return Ok(());
                    }
                };
                match trunc {
                    None => {
                        // A bare empty record maps nothing to give back.
                        // Walk it off in a short transaction and look
                        // again.
                        let mut txn = journal.begin(rotate_subtree_credits(depth, 0))?;
                        match self.rotate_tree_left(&mut txn, &path, dealloc) {
                            Ok(()) => journal.commit(txn, self.store)?,
                            Err(err) => {
                                journal.abort(txn);
                                return Err(err);
                            }
                        }
                    }
                    Some((cpos, len)) => {
                        if tlog.needs_flush(self.store)? {
                            tlog.flush(journal, self.store, cluster_alloc)?;
                        }
                        let mut txn = journal.begin(self.remove_credits()?)?;
                        match self.remove_clusters(&mut txn, cpos, len, meta, dealloc, tlog) {
                            Ok(()) => journal.commit(txn, self.store)?,
                            Err(err) => {
                                journal.abort(txn);
                                return Err(err);
                            }
                        }
                    }
                }
            }
        })();
        self.guard(res)
    }
}

#[cfg(test)]
mod truncate_tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Geometry;
    use crate::error::VolumeHealth;
    use crate::journal::{Journal, SyncMode};
    use crate::ondisk::{FileRootHeader, RecFlags};
    use crate::store::{BlockStore, MemStore};

    const ROOT: u64 = 1;
    const TLOG: u64 = 2;

    fn harness() -> (
        MemStore,
        Journal,
        MetaAlloc,
        TruncateLog,
        Geometry,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::create(
            dir.path().join("journal"),
            SyncMode::Off,
            Arc::new(VolumeHealth::new()),
        )
        .unwrap();
        let mut store = MemStore::new(512, 128);
        FileRootHeader::init(store.block_mut(ROOT).unwrap(), ROOT, 1).unwrap();
        let tlog = TruncateLog::format(&mut store, TLOG, 1).unwrap();
        let meta = MetaAlloc::new(0, 64, 64);
        let geom = Geometry::new(9, 9).unwrap();
        (store, journal, meta, tlog, geom, dir)
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

    #[test]
    fn interior_remove_splits_the_record() {
        let (mut store, journal, meta, tlog, geom, _dir) = harness();
        let clusters = ClusterAlloc::new(16);
        let mut tree = ExtentTree::file(&mut store, &journal, geom, ROOT).unwrap();

        insert_one(&mut tree, &journal, &meta, rec(0, 10, 100, RecFlags::empty()));
        let mut dealloc = DeallocCtx::new();
        tree.remove_range(3, 4, &meta, &mut dealloc, &tlog, &clusters)
            .unwrap();

        {
            let root = tree.list_at(tree.root_node()).unwrap();
            assert_eq!(root.next_free(), 2);
            assert_eq!(root.leaf_rec(0).unwrap(), rec(0, 3, 100, RecFlags::empty()));
            assert_eq!(root.leaf_rec(1).unwrap(), rec(7, 3, 107, RecFlags::empty()));
        }
        assert_eq!(tree.total_clusters().unwrap(), 6);
        assert!(tree.lookup(5).unwrap().is_none());
        assert_eq!(tlog.used(tree.store).unwrap(), 1);
        assert!(dealloc.is_empty());
    }

    #[test]
    fn left_edge_remove_advances_the_record() {
        let (mut store, journal, meta, tlog, geom, _dir) = harness();
        let clusters = ClusterAlloc::new(16);
        let mut tree = ExtentTree::file(&mut store, &journal, geom, ROOT).unwrap();

        insert_one(&mut tree, &journal, &meta, rec(0, 8, 200, RecFlags::empty()));
        let mut dealloc = DeallocCtx::new();
        tree.remove_range(0, 3, &meta, &mut dealloc, &tlog, &clusters)
            .unwrap();

        {
            let root = tree.list_at(tree.root_node()).unwrap();
            assert_eq!(root.next_free(), 1);
            assert_eq!(root.leaf_rec(0).unwrap(), rec(3, 5, 203, RecFlags::empty()));
        }
        assert_eq!(tree.total_clusters().unwrap(), 5);
        assert_eq!(tlog.used(tree.store).unwrap(), 1);
    }

    #[test]
    fn whole_record_remove_drops_the_slot() {
        let (mut store, journal, meta, tlog, geom, _dir) = harness();
        let clusters = ClusterAlloc::new(16);
        let mut tree = ExtentTree::file(&mut store, &journal, geom, ROOT).unwrap();

        insert_one(&mut tree, &journal, &meta, rec(0, 4, 100, RecFlags::empty()));
        insert_one(&mut tree, &journal, &meta, rec(10, 4, 110, RecFlags::empty()));
        let mut dealloc = DeallocCtx::new();
        tree.remove_range(10, 4, &meta, &mut dealloc, &tlog, &clusters)
            .unwrap();

        {
            let root = tree.list_at(tree.root_node()).unwrap();
            assert_eq!(root.next_free(), 1);
            assert_eq!(root.leaf_rec(0).unwrap(), rec(0, 4, 100, RecFlags::empty()));
        }
        assert_eq!(tree.total_clusters().unwrap(), 4);
        assert!(tree.lookup(10).unwrap().is_none());
        assert_eq!(
            tree.lookup(2).unwrap(),
            Some(rec(0, 4, 100, RecFlags::empty()))
        );
        assert_eq!(tlog.used(tree.store).unwrap(), 1);
    }

    #[test]
    fn truncate_trims_the_tail_record_in_place() {
        let (mut store, journal, meta, tlog, geom, _dir) = harness();
        let clusters = ClusterAlloc::new(16);
        let mut tree = ExtentTree::file(&mut store, &journal, geom, ROOT).unwrap();

        insert_one(&mut tree, &journal, &meta, rec(0, 10, 100, RecFlags::empty()));
        let mut dealloc = DeallocCtx::new();
        tree.truncate_to(5, &meta, &mut dealloc, &tlog, &clusters)
            .unwrap();

        {
            let root = tree.list_at(tree.root_node()).unwrap();
            assert_eq!(root.next_free(), 1);
            assert_eq!(root.leaf_rec(0).unwrap(), rec(0, 5, 100, RecFlags::empty()));
        }
        assert_eq!(tree.total_clusters().unwrap(), 5);
        assert!(tree.lookup(7).unwrap().is_none());
        assert_eq!(tlog.used(tree.store).unwrap(), 1);
    }

    #[test]
    fn truncate_collapses_a_branched_tree_to_the_root() {
        let (mut store, journal, meta, tlog, geom, _dir) = harness();
        let clusters = ClusterAlloc::new(16);
        let mut tree = ExtentTree::file(&mut store, &journal, geom, ROOT).unwrap();

        // Gapped offsets keep records from merging; gapped physical
        // ranges keep truncate log entries from coalescing.
        for i in 0..30u32 {
            insert_one(
                &mut tree,
                &journal,
                &meta,
                rec(i * 2, 1, 600 + u64::from(i) * 3, RecFlags::empty()),
            );
        }
        assert_eq!(tree.depth().unwrap(), 1);

        let mut dealloc = DeallocCtx::new();
        tree.truncate_to(0, &meta, &mut dealloc, &tlog, &clusters)
            .unwrap();

        assert_eq!(tree.total_clusters().unwrap(), 0);
        assert_eq!(tree.depth().unwrap(), 0);
        assert_eq!(tree.list_at(tree.root_node()).unwrap().next_free(), 0);
        assert_eq!(tree.last_leaf_blk().unwrap(), 0);
        assert_eq!(tlog.used(tree.store).unwrap(), 30);

        // Both extent blocks the growth created come back exactly once.
        assert_eq!(dealloc.total(), 2);
        let released = dealloc.run(&journal, tree.store, &[&meta]).unwrap();
        assert_eq!(released, 2);
        assert_eq!(meta.free_count(), 64);
    }

    #[test]
    fn remove_fails_clean_when_the_log_is_full() {
        let (mut store, journal, meta, tlog, geom, _dir) = harness();
        let mut tree = ExtentTree::file(&mut store, &journal, geom, ROOT).unwrap();

        insert_one(&mut tree, &journal, &meta, rec(0, 6, 100, RecFlags::empty()));
        {
            let mut txn = journal.begin(2).unwrap();
            for i in 0..60u32 {
                tlog.append(&journal, &mut txn, tree.store, 1000 + i * 10, 2)
                    .unwrap();
            }
            journal.commit(txn, tree.store).unwrap();
        }
        assert!(tlog.needs_flush(tree.store).unwrap());

        let mut dealloc = DeallocCtx::new();
        let mut txn = journal.begin(tree.remove_credits().unwrap()).unwrap();
        let err = tree
            .remove(&mut txn, 0, 6, &meta, &mut dealloc, &tlog)
            .unwrap_err();
        assert!(matches!(err, Error::LogFull));
        journal.abort(txn);

        assert_eq!(tree.total_clusters().unwrap(), 6);
        assert_eq!(
            tree.lookup(0).unwrap(),
            Some(rec(0, 6, 100, RecFlags::empty()))
        );
        assert_eq!(tlog.used(tree.store).unwrap(), 60);
    }

    #[test]
    fn remove_flushes_a_full_log_first() {
        let (mut store, journal, meta, tlog, geom, _dir) = harness();
        let clusters = ClusterAlloc::new(256);
        let mut tree = ExtentTree::file(&mut store, &journal, geom, ROOT).unwrap();

        insert_one(&mut tree, &journal, &meta, rec(0, 4, 100, RecFlags::empty()));
        {
            let mut txn = journal.begin(2).unwrap();
            for _ in 0..60 {
                let start = clusters.claim(2).unwrap();
                tlog.append(&journal, &mut txn, tree.store, start, 2).unwrap();
                // A one-cluster spacer keeps the next range from
                // coalescing with this one.
                clusters.claim(1).unwrap();
            }
            journal.commit(txn, tree.store).unwrap();
        }
        assert!(tlog.needs_flush(tree.store).unwrap());
        assert_eq!(clusters.free_count(), 256 - 180);

        let mut dealloc = DeallocCtx::new();
        tree.remove_range(0, 4, &meta, &mut dealloc, &tlog, &clusters)
            .unwrap();

        assert_eq!(tlog.used(tree.store).unwrap(), 1);
        assert_eq!(clusters.free_count(), 256 - 60);
        assert_eq!(tree.total_clusters().unwrap(), 0);
        assert!(tree.lookup(0).unwrap().is_none());
    }

    #[test]
    fn truncating_nothing_is_a_no_op() {
        let (mut store, journal, meta, tlog, geom, _dir) = harness();
        let clusters = ClusterAlloc::new(8);
        let mut tree = ExtentTree::file(&mut store, &journal, geom, ROOT).unwrap();

        let mut dealloc = DeallocCtx::new();
        tree.truncate_to(0, &meta, &mut dealloc, &tlog, &clusters)
            .unwrap();

        assert!(dealloc.is_empty());
        assert_eq!(tlog.used(tree.store).unwrap(), 0);
        assert_eq!(tree.total_clusters().unwrap(), 0);
    }
}
