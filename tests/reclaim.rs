//! # Journal Replay and Deferred Reclaim Tests
//!
//! Covers the crash half of the allocation story. A "crash" here means
//! the store image reverts to its freshly formatted state while the
//! journal file survives, which is the worst case replay has to close.
//!
//! ## Coverage
//!
//! 1. **Replay**: committed transactions reapply onto a stale image,
//!    block for block, and a consumed log replays to nothing
//! 2. **Truncate log**: ranges logged before a crash flush exactly once
//!    at mount, and a second flush finds nothing
//! 3. **Resumption**: a replayed image accepts new operations and can
//!    finish the truncate the crash interrupted

use std::sync::Arc;

use tempfile::tempdir;

use rimefs_alloc::config::Geometry;
use rimefs_alloc::dealloc::{DeallocCtx, TruncateLog};
use rimefs_alloc::error::VolumeHealth;
use rimefs_alloc::journal::{Journal, SyncMode};
use rimefs_alloc::ondisk::{FileRootHeader, LeafRec, RecFlags};
use rimefs_alloc::store::{BlockStore, MemStore};
use rimefs_alloc::suballoc::{ClusterAlloc, MetaAlloc};
use rimefs_alloc::tree::ExtentTree;

const ROOT: u64 = 1;
const TLOG: u64 = 2;
const BLOCKS: u64 = 128;

/// A store image in its formatted state, before any journaled history.
/// Both the live volume and the post-crash replay target start here.
fn format_store() -> MemStore {
    let mut store = MemStore::new(512, BLOCKS);
    FileRootHeader::init(store.block_mut(ROOT).unwrap(), ROOT, 1).unwrap();
    TruncateLog::format(&mut store, TLOG, 1).unwrap();
    store
}

mod replay_tests {
    use super::*;

    #[test]
    fn committed_history_replays_onto_a_stale_image() {
        let dir = tempdir().unwrap();
        let jpath = dir.path().join("journal");
        let geom = Geometry::new(9, 9).unwrap();
        let meta = MetaAlloc::new(0, 64, 64);

        let mut live = format_store();
        {
            let journal = Journal::create(
                &jpath,
                SyncMode::Always,
                Arc::new(VolumeHealth::new()),
            )
            .unwrap();
            let mut tree = ExtentTree::file(&mut live, &journal, geom, ROOT).unwrap();
            for (cpos, phys, len) in [(0u32, 100u64, 4u16), (8, 200, 3), (16, 300, 2)] {
                let mut txn = journal.begin(tree.insert_credits().unwrap()).unwrap();
                tree.insert(&mut txn, cpos, phys, len, RecFlags::empty(), &meta)
                    .unwrap();
                journal.commit(txn, tree.store()).unwrap();
            }
        }

        let mut stale = format_store();
        let journal = Journal::open(
            &jpath,
            SyncMode::Always,
            Arc::new(VolumeHealth::new()),
        )
        .unwrap();
        let applied = journal.replay(&mut stale).unwrap();
        assert!(applied > 0, "three commits SHOULD leave frames to apply");

        {
            let tree = ExtentTree::file(&mut stale, &journal, geom, ROOT).unwrap();
            assert_eq!(tree.total_clusters().unwrap(), 9);
            assert_eq!(
                tree.lookup(0).unwrap(),
                Some(LeafRec {
                    cpos: 0,
                    clusters: 4,
                    flags: RecFlags::empty(),
                    blkno: 100,
                })
            );
            assert_eq!(
                tree.lookup(17).unwrap(),
                Some(LeafRec {
                    cpos: 16,
                    clusters: 2,
                    flags: RecFlags::empty(),
                    blkno: 300,
                })
            );
        }

        for b in 0..BLOCKS {
            assert_eq!(
                live.block(b).unwrap(),
                stale.block(b).unwrap(),
                "block {} SHOULD match the live image after replay",
                b
            );
        }

        // Replay consumed the log; running it again applies nothing.
        assert_eq!(journal.replay(&mut stale).unwrap(), 0);
    }
}

mod truncate_log_tests {
    use super::*;

    /// Rebuilds the deterministic allocator occupancy both sides of the
    /// crash use: a 16-cluster guard, then two 4-cluster ranges split by
    /// a single-cluster spacer.
    fn occupy(clusters: &ClusterAlloc) -> (u32, u32) {
        clusters.claim(16).unwrap();
        let a = clusters.claim(4).unwrap();
        clusters.claim(1).unwrap();
        let b = clusters.claim(4).unwrap();
        (a, b)
    }

    #[test]
    fn an_unflushed_log_flushes_exactly_once_at_mount() {
        let dir = tempdir().unwrap();
        let jpath = dir.path().join("journal");
        let geom = Geometry::new(9, 9).unwrap();
        let meta = MetaAlloc::new(0, 64, 64);

        let mut live = format_store();
        {
            let clusters = ClusterAlloc::new(64);
            let (a, b) = occupy(&clusters);
            let journal = Journal::create(
                &jpath,
                SyncMode::Always,
                Arc::new(VolumeHealth::new()),
            )
            .unwrap();
            let tlog = TruncateLog::open(&live, TLOG).unwrap();
            let mut tree = ExtentTree::file(&mut live, &journal, geom, ROOT).unwrap();

            for (cpos, phys) in [(0u32, a), (10, b)] {
                let mut txn = journal.begin(tree.insert_credits().unwrap()).unwrap();
                tree.insert(&mut txn, cpos, u64::from(phys), 4, RecFlags::empty(), &meta)
                    .unwrap();
                journal.commit(txn, tree.store()).unwrap();
            }

            let mut dealloc = DeallocCtx::new();
            tree.remove_range(0, 4, &meta, &mut dealloc, &tlog, &clusters)
                .unwrap();
            tree.remove_range(10, 4, &meta, &mut dealloc, &tlog, &clusters)
                .unwrap();
            assert_eq!(tlog.used(tree.store()).unwrap(), 2);
            // Crash before the deferred flush runs.
        }

        let mut stale = format_store();
        let journal = Journal::open(
            &jpath,
            SyncMode::Always,
            Arc::new(VolumeHealth::new()),
        )
        .unwrap();
        journal.replay(&mut stale).unwrap();

        let clusters = ClusterAlloc::new(64);
        occupy(&clusters);
        let tlog = TruncateLog::open(&stale, TLOG).unwrap();
        assert_eq!(tlog.used(&stale).unwrap(), 2);

        let freed = tlog.replay(&journal, &mut stale, &clusters).unwrap();
        assert_eq!(freed, 8, "both removed ranges SHOULD come back");
        assert_eq!(tlog.used(&stale).unwrap(), 0);
        // Guard and spacer stay claimed; double release would have failed
        // the flush outright.
        assert_eq!(clusters.free_count(), 64 - 17);

        assert_eq!(tlog.replay(&journal, &mut stale, &clusters).unwrap(), 0);
    }

    #[test]
    fn a_replayed_image_finishes_its_truncate() {
        let dir = tempdir().unwrap();
        let jpath = dir.path().join("journal");
        let geom = Geometry::new(9, 9).unwrap();
        let meta = MetaAlloc::new(0, 64, 64);

        // Six two-cluster extents with spacers between their physical
        // ranges. The crash lands after two of them are removed.
        let starts = |clusters: &ClusterAlloc| -> Vec<u32> {
            clusters.claim(16).unwrap();
            (0..6)
                .map(|_| {
                    let s = clusters.claim(2).unwrap();
                    clusters.claim(1).unwrap();
                    s
                })
                .collect()
        };

        let mut live = format_store();
        {
            let clusters = ClusterAlloc::new(64);
            let phys = starts(&clusters);
            let journal = Journal::create(
                &jpath,
                SyncMode::Always,
                Arc::new(VolumeHealth::new()),
            )
            .unwrap();
            let tlog = TruncateLog::open(&live, TLOG).unwrap();
            let mut tree = ExtentTree::file(&mut live, &journal, geom, ROOT).unwrap();

            for (i, s) in phys.iter().enumerate() {
                let mut txn = journal.begin(tree.insert_credits().unwrap()).unwrap();
                tree.insert(
                    &mut txn,
                    i as u32 * 4,
                    u64::from(*s),
                    2,
                    RecFlags::empty(),
                    &meta,
                )
                .unwrap();
                journal.commit(txn, tree.store()).unwrap();
            }

            let mut dealloc = DeallocCtx::new();
            tree.remove_range(4, 2, &meta, &mut dealloc, &tlog, &clusters)
                .unwrap();
            tree.remove_range(12, 2, &meta, &mut dealloc, &tlog, &clusters)
                .unwrap();
        }

        let mut stale = format_store();
        let journal = Journal::open(
            &jpath,
            SyncMode::Always,
            Arc::new(VolumeHealth::new()),
        )
        .unwrap();
        journal.replay(&mut stale).unwrap();

        let clusters = ClusterAlloc::new(64);
        starts(&clusters);
        let tlog = TruncateLog::open(&stale, TLOG).unwrap();
        let mut dealloc = DeallocCtx::new();
        {
            let mut tree = ExtentTree::file(&mut stale, &journal, geom, ROOT).unwrap();
            assert_eq!(tree.total_clusters().unwrap(), 8);
            tree.truncate_to(0, &meta, &mut dealloc, &tlog, &clusters)
                .unwrap();
            assert_eq!(tree.total_clusters().unwrap(), 0);
            assert_eq!(tree.depth().unwrap(), 0);
        }

        let freed = tlog.replay(&journal, &mut stale, &clusters).unwrap();
        assert_eq!(freed, 12, "all six ranges SHOULD come back exactly once");
        assert_eq!(clusters.free_count(), 64 - 16 - 6);
    }
}
