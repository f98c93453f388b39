//! The owner-facing tree handle.
//!
//! `ExtentTree` bundles everything a mutation needs: the block store, the
//! journal, volume geometry, and the owner operation object picked by the
//! constructor. Engine code in the sibling modules hangs off this struct;
//! this file keeps the handle itself, the node view accessors, and the
//! transaction-scoped operation surface. The self-transacting removal
//! drivers live in `truncate`.

use tracing::{error, trace};

use crate::config::{grow_credits, tree_op_credits, truncate_pass_credits, Geometry};
use crate::dealloc::{DeallocCtx, TruncateLog};
use crate::error::{Error, Result};
use crate::journal::{CommitTrigger, Journal, Txn};
use crate::ondisk::block::verify_block_check;
use crate::ondisk::record::{LeafRec, RecFlags};
use crate::ondisk::{EbMut, EbRef, ListMut, ListRef};
use crate::store::BlockStore;
use crate::suballoc::MetaAlloc;

use super::path::{PathNode, TreePath};
use super::{RootOps, ATTR_TREE_OPS, ATTR_VALUE_OPS, DIR_INDEX_OPS, FILE_OPS};

/// Handle to one owner's extent tree.
///
/// Holds the store mutably for its whole lifetime; one handle maps to one
/// logical writer, which is what the journal's single-transaction rule
/// expects. Reads and writes inside the tree always go through
/// [`list_at`]/[`list_at_mut`] so every touched node is revalidated.
///
/// [`list_at`]: Self::list_at
/// [`list_at_mut`]: Self::list_at_mut
pub struct ExtentTree<'a, S> {
    pub(super) store: &'a mut S,
    pub(super) journal: &'a Journal,
    pub(super) geom: Geometry,
    pub(super) root_blkno: u64,
    pub(super) ops: &'static dyn RootOps,
}

impl<'a, S: BlockStore> ExtentTree<'a, S> {
    /// Tree rooted in a file's cluster map.
    pub fn file(
        store: &'a mut S,
        journal: &'a Journal,
        geom: Geometry,
        root_blkno: u64,
    ) -> Result<Self> {
        Self::with_ops(store, journal, geom, root_blkno, &FILE_OPS)
    }

    /// Tree rooted in an extended attribute value container.
    pub fn attr_value(
        store: &'a mut S,
        journal: &'a Journal,
        geom: Geometry,
        root_blkno: u64,
    ) -> Result<Self> {
        Self::with_ops(store, journal, geom, root_blkno, &ATTR_VALUE_OPS)
    }

    /// Tree rooted in an extended attribute index root.
    pub fn attr_tree(
        store: &'a mut S,
        journal: &'a Journal,
        geom: Geometry,
        root_blkno: u64,
    ) -> Result<Self> {
        Self::with_ops(store, journal, geom, root_blkno, &ATTR_TREE_OPS)
    }

    /// Tree rooted in a directory index root.
    pub fn dir_index(
        store: &'a mut S,
        journal: &'a Journal,
        geom: Geometry,
        root_blkno: u64,
    ) -> Result<Self> {
        Self::with_ops(store, journal, geom, root_blkno, &DIR_INDEX_OPS)
    }

    fn with_ops(
        store: &'a mut S,
        journal: &'a Journal,
        geom: Geometry,
        root_blkno: u64,
        ops: &'static dyn RootOps,
    ) -> Result<Self> {
        {
            let data = store.block(root_blkno)?;
            ops.validate(data, root_blkno)?;
            verify_block_check(data, root_blkno)?;
        }
        Ok(Self {
            store,
            journal,
            geom,
            root_blkno,
            ops,
        })
    }

    pub fn root_blkno(&self) -> u64 {
        self.root_blkno
    }

    pub(super) fn root_node(&self) -> PathNode {
        PathNode {
            blkno: self.root_blkno,
            list_off: self.ops.format().list_offset(),
        }
    }

    /// Read-only list view of a path node. The root's list sits behind the
    /// owner header; every other node is an extent block.
    pub(super) fn list_at(&self, node: PathNode) -> Result<ListRef<'_>> {
        let data = self.store.block(node.blkno)?;
        if node.blkno == self.root_blkno {
            ListRef::new(&data[node.list_off..], node.blkno)
        } else {
            Ok(EbRef::new(data, node.blkno)?.list())
        }
    }

    /// Mutable list view of a path node. Extent blocks get their header
    /// revalidated before the list is handed out.
    pub(super) fn list_at_mut(&mut self, node: PathNode) -> Result<ListMut<'_>> {
        if node.blkno != self.root_blkno {
            EbRef::new(self.store.block(node.blkno)?, node.blkno)?;
        }
        let data = self.store.block_mut(node.blkno)?;
        ListMut::new(&mut data[node.list_off..], node.blkno)
    }

    pub(super) fn eb_at(&self, blkno: u64) -> Result<EbRef<'_>> {
        EbRef::new(self.store.block(blkno)?, blkno)
    }

    pub(super) fn eb_at_mut(&mut self, blkno: u64) -> Result<EbMut<'_>> {
        EbMut::new(self.store.block_mut(blkno)?, blkno)
    }

    pub(super) fn fs_generation(&self) -> Result<u32> {
        self.ops
            .fs_generation(self.store.block(self.root_blkno)?, self.root_blkno)
    }

    /// Block number of the rightmost leaf, 0 while the tree has no
    /// branches.
    pub fn last_leaf_blk(&self) -> Result<u64> {
        let res = self
            .store
            .block(self.root_blkno)
            .and_then(|data| self.ops.last_leaf_blk(data, self.root_blkno));
        self.guard(res)
    }

    pub(super) fn set_last_leaf_blk(&mut self, leaf: u64) -> Result<()> {
        self.ops
            .set_last_leaf_blk(self.store.block_mut(self.root_blkno)?, self.root_blkno, leaf)
    }

    pub(super) fn update_clusters(&mut self, delta: i64) -> Result<()> {
        self.ops
            .update_clusters(self.store.block_mut(self.root_blkno)?, self.root_blkno, delta)
    }

    /// Declare write intent on every node of `path` from `from_level` down.
    pub(super) fn access_path_from(
        &self,
        txn: &mut Txn,
        path: &TreePath,
        from_level: usize,
    ) -> Result<()> {
        for level in from_level..path.num_levels() {
            self.journal
                .access(txn, path.node(level).blkno, CommitTrigger::SealBlock)?;
        }
        Ok(())
    }

    pub(super) fn access_path(&self, txn: &mut Txn, path: &TreePath) -> Result<()> {
        self.access_path_from(txn, path, 0)
    }

    pub(super) fn access_root(&self, txn: &mut Txn) -> Result<()> {
        self.journal
            .access(txn, self.root_blkno, CommitTrigger::SealBlock)
    }

    /// Corruption escalation point: every public operation funnels its
    /// result through here so a `Corrupt` error degrades the volume before
    /// it reaches the caller.
    pub(super) fn guard<T>(&self, res: Result<T>) -> Result<T> {
        if let Err(Error::Corrupt { blkno, reason }) = &res {
            error!(blkno, %reason, "extent_tree_corrupt");
            self.journal.health().degrade();
        }
        res
    }

    /// Depth of the tree: 0 while all records fit in the root list.
    pub fn depth(&self) -> Result<u16> {
        let res = self.list_at(self.root_node()).map(|list| list.tree_depth());
        self.guard(res)
    }

    /// Clusters currently mapped by the owner.
    pub fn total_clusters(&self) -> Result<u32> {
        let res = self
            .store
            .block(self.root_blkno)
            .and_then(|data| self.ops.clusters(data, self.root_blkno));
        self.guard(res)
    }

    /// The backing store, reborrowed. Lets a caller commit a transaction
    /// without giving the handle up first.
    pub fn store(&mut self) -> &mut S {
        self.store
    }

    /// Unused record slots in the list an append would land in: the
    /// rightmost leaf once the tree has branches, the root list before.
    pub fn num_free_records(&self) -> Result<u16> {
        let res: Result<u16> = (|| {
            let last_leaf = self.last_leaf_blk()?;
            if last_leaf != 0 {
                Ok(self.eb_at(last_leaf)?.list().free_records())
            } else {
                Ok(self.list_at(self.root_node())?.free_records())
            }
        })();
        self.guard(res)
    }

    /// Find the record whose cluster range contains `cpos`.
    pub fn lookup(&self, cpos: u32) -> Result<Option<LeafRec>> {
        let res: Result<Option<LeafRec>> = (|| {
            let path = self.path_to(cpos)?;
            let leaf = self.list_at(path.leaf())?;
            match leaf.search(cpos) {
                Some(idx) => Ok(Some(leaf.leaf_rec(idx)?)),
                None => Ok(None),
            }
        })();
        self.guard(res)
    }

    /// Credits a transaction needs for one insert, including a worst-case
    /// depth shift and branch add. Rotations top the handle up themselves.
    pub fn insert_credits(&self) -> Result<u32> {
        let depth = self.depth()?;
        Ok(tree_op_credits(depth) + grow_credits(depth))
    }

    /// Credits for one remove or mark-written pass, including the splits
    /// either may need.
    pub fn remove_credits(&self) -> Result<u32> {
        let depth = self.depth()?;
        Ok(truncate_pass_credits(depth) + tree_op_credits(depth) + grow_credits(depth))
    }

    /// Map `clusters` starting at cluster offset `cpos` to the physical
    /// blocks starting at `phys_blkno`.
    ///
    /// The new range merges with a touching neighbor when offsets, blocks,
    /// and flags all line up; otherwise it takes a record slot, growing the
    /// tree first when the target list is full. The owner's cluster total
    /// moves by `clusters`.
    pub fn insert(
        &mut self,
        txn: &mut Txn,
        cpos: u32,
        phys_blkno: u64,
        clusters: u16,
        flags: RecFlags,
        meta: &MetaAlloc,
    ) -> Result<()> {
        trace!(
            root = self.root_blkno,
            cpos,
            phys = phys_blkno,
            clusters,
            "extent_insert"
        );
        if clusters == 0 {
            return Err(Error::invariant("zero-length extent insert"));
        }
        if phys_blkno == 0 {
            return Err(Error::invariant("extent insert with a zero block address"));
        }
        let rec = LeafRec {
            cpos,
            clusters,
            flags,
            blkno: phys_blkno,
        };
        let res = self.insert_extent(txn, rec, meta);
        self.guard(res)
    }

    /// Unmap `clusters` starting at `cpos` and log the freed cluster range
    /// for deferred release.
    ///
    /// The range must lie inside one mapped record. A strict interior range
    /// splits the record first, which can grow the tree; emptied rightmost
    /// branches land in `dealloc`. Fails `LogFull` without touching the
    /// tree when the truncate log cannot take another range.
    pub fn remove(
        &mut self,
        txn: &mut Txn,
        cpos: u32,
        clusters: u32,
        meta: &MetaAlloc,
        dealloc: &mut DeallocCtx,
        tlog: &TruncateLog,
    ) -> Result<()> {
        trace!(root = self.root_blkno, cpos, clusters, "extent_remove");
        if clusters == 0 {
            return Err(Error::invariant("zero-length extent remove"));
        }
        let res = self.remove_clusters(txn, cpos, clusters, meta, dealloc, tlog);
        self.guard(res)
    }

    /// Clear the unwritten flag on `clusters` starting at `cpos`, splitting
    /// the containing record when the range covers only part of it.
    pub fn mark_written(
        &mut self,
        txn: &mut Txn,
        cpos: u32,
        clusters: u32,
        phys_blkno: u64,
        meta: &MetaAlloc,
        dealloc: &mut DeallocCtx,
    ) -> Result<()> {
        trace!(
            root = self.root_blkno,
            cpos,
            clusters,
            phys = phys_blkno,
            "extent_mark_written"
        );
        if clusters == 0 {
            return Err(Error::invariant("zero-length mark-written range"));
        }
        if phys_blkno == 0 {
            return Err(Error::invariant("mark-written with a zero block address"));
        }
        let res = self.mark_range_written(txn, cpos, clusters, phys_blkno, meta, dealloc);
        self.guard(res)
    }
}

#[cfg(test)]
mod tree_tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::VolumeHealth;
    use crate::journal::SyncMode;
    use crate::ondisk::{FileRootHeader, ListMut, RecFlags};
    use crate::store::MemStore;

    const ROOT: u64 = 1;

    fn harness() -> (MemStore, Journal, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::create(
            dir.path().join("journal"),
            SyncMode::Off,
            Arc::new(VolumeHealth::new()),
        )
        .unwrap();
        let mut store = MemStore::new(512, 32);
        FileRootHeader::init(store.block_mut(ROOT).unwrap(), ROOT, 5).unwrap();
        (store, journal, dir)
    }

    #[test]
    fn constructor_rejects_wrong_owner_format() {
        let (mut store, journal, _dir) = harness();
        let geom = Geometry::new(9, 9).unwrap();
        assert!(matches!(
            ExtentTree::attr_value(&mut store, &journal, geom, ROOT),
            Err(Error::Corrupt { .. })
        ));
        assert!(ExtentTree::file(&mut store, &journal, geom, ROOT).is_ok());
    }

    #[test]
    fn lookup_on_flat_root() {
        let (mut store, journal, _dir) = harness();
        {
            let data = store.block_mut(ROOT).unwrap();
            let off = crate::config::FILE_ROOT_HEADER_SIZE;
            let mut list = ListMut::new(&mut data[off..], ROOT).unwrap();
            list.push_leaf(LeafRec {
                cpos: 4,
                clusters: 8,
                flags: RecFlags::empty(),
                blkno: 200,
            })
            .unwrap();
        }
        let geom = Geometry::new(9, 9).unwrap();
        let tree = ExtentTree::file(&mut store, &journal, geom, ROOT).unwrap();

        assert_eq!(tree.depth().unwrap(), 0);
        let hit = tree.lookup(7).unwrap().unwrap();
        assert_eq!((hit.cpos, hit.clusters, hit.blkno), (4, 8, 200));
        assert!(tree.lookup(3).unwrap().is_none());
        assert!(tree.lookup(12).unwrap().is_none());
    }

    #[test]
    fn free_records_follow_the_root_until_branched() {
        let (mut store, journal, _dir) = harness();
        let geom = Geometry::new(9, 9).unwrap();
        let tree = ExtentTree::file(&mut store, &journal, geom, ROOT).unwrap();
        let capacity = tree.list_at(tree.root_node()).unwrap().count();
        assert_eq!(tree.num_free_records().unwrap(), capacity);
    }
}
