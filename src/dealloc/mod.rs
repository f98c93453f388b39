//! # Deferred Reclamation
//!
//! Space freed by tree mutation is not returned to the allocators inside
//! the transaction that unlinked it. Two mechanisms defer the release:
//!
//! - [`TruncateLog`]: an on-disk log of cluster ranges. Truncation appends
//!   the range it cut inside the removal transaction; a later flush
//!   transaction walks the log from the tail and returns each range to the
//!   cluster allocator. Mount replays the log the same way after journal
//!   recovery, so ranges logged before a crash are still released.
//! - [`DeallocCtx`]: an in-memory list of metadata blocks unlinked from
//!   the tree, keyed by allocator slot. After the removal transaction
//!   commits, `run` releases each block to the allocator that owns it.
//!
//! Ordering is what keeps this safe. A range leaves the log before its
//! clusters are released, and a metadata block leaves the tree before its
//! bit is released, so a crash between the two steps leaks space instead
//! of double-freeing it.

use hashbrown::HashMap;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::journal::{CommitTrigger, Journal, Txn};
use crate::ondisk::tlog::{TlogMut, TlogRef, TruncateRec};
use crate::store::BlockStore;
use crate::suballoc::{ClusterAlloc, MetaAlloc};

/// On-disk truncate log handle. State lives in the block; the handle only
/// remembers where the block is.
#[derive(Debug, Clone, Copy)]
pub struct TruncateLog {
    blkno: u64,
}

impl TruncateLog {
    /// Stamp a fresh, empty log at `blkno`.
    pub fn format<S: BlockStore>(store: &mut S, blkno: u64, fs_generation: u32) -> Result<Self> {
        TlogMut::init(store.block_mut(blkno)?, blkno, fs_generation)?;
        Ok(Self { blkno })
    }

    /// Handle to an existing log. Validates the block once.
    pub fn open<S: BlockStore>(store: &S, blkno: u64) -> Result<Self> {
        TlogRef::new(store.block(blkno)?, blkno)?;
        Ok(Self { blkno })
    }

    pub fn blkno(&self) -> u64 {
        self.blkno
    }

    pub fn used<S: BlockStore>(&self, store: &S) -> Result<u16> {
        Ok(TlogRef::new(store.block(self.blkno)?, self.blkno)?.used())
    }

    /// True when the next append would not fit and the log must be flushed
    /// first. Checked before a removal transaction begins, never inside it.
    pub fn needs_flush<S: BlockStore>(&self, store: &S) -> Result<bool> {
        Ok(TlogRef::new(store.block(self.blkno)?, self.blkno)?.is_full())
    }

    /// Log a cluster range inside the caller's transaction. A range that
    /// starts exactly where the previous tail record ends extends that
    /// record instead of taking a slot.
    pub fn append<S: BlockStore>(
        &self,
        journal: &Journal,
        txn: &mut Txn,
        store: &mut S,
        start: u32,
        clusters: u32,
    ) -> Result<()> {
        if clusters == 0 {
            return Err(Error::invariant("zero-length truncate log append"));
        }
        journal.access(txn, self.blkno, CommitTrigger::SealBlock)?;

        let mut tlog = TlogMut::new(store.block_mut(self.blkno)?, self.blkno)?;
        let used = tlog.used();

        if used > 0 {
            let tail = tlog.rec(used as usize - 1)?;
            if tail.end() == start {
                tlog.set_rec(
                    used as usize - 1,
                    TruncateRec::new(tail.start(), tail.clusters() + clusters),
                )?;
                journal.dirty(txn, self.blkno)?;
                debug!(start, clusters, used, "truncate_log_coalesced");
                return Ok(());
            }
        }

        if tlog.is_full() {
            return Err(Error::LogFull);
        }
        tlog.set_rec(used as usize, TruncateRec::new(start, clusters))?;
        tlog.set_used(used + 1)?;
        journal.dirty(txn, self.blkno)?;
        debug!(start, clusters, used = used + 1, "truncate_log_append");
        Ok(())
    }

    /// Release every logged range to the cluster allocator in its own
    /// transaction, walking from the tail. Each record leaves the log
    /// before its clusters are released. Returns how many clusters went
    /// back.
    pub fn flush<S: BlockStore>(
        &self,
        journal: &Journal,
        store: &mut S,
        clusters: &ClusterAlloc,
    ) -> Result<u32> {
        let used = self.used(store)?;
        if used == 0 {
            return Ok(0);
        }

        let mut txn = journal.begin(1)?;
        let freed = match self.flush_inner(journal, &mut txn, store, clusters, used) {
            Ok(freed) => freed,
            Err(err) => {
                journal.abort(txn);
                return Err(err);
            }
        };
        journal.commit(txn, store)?;
        Ok(freed)
    }

    fn flush_inner<S: BlockStore>(
        &self,
        journal: &Journal,
        txn: &mut Txn,
        store: &mut S,
        clusters: &ClusterAlloc,
        used: u16,
    ) -> Result<u32> {
        journal.access(txn, self.blkno, CommitTrigger::SealBlock)?;

        let mut freed = 0u32;
        for idx in (0..used).rev() {
            let rec = {
                let mut tlog = TlogMut::new(store.block_mut(self.blkno)?, self.blkno)?;
                let rec = tlog.rec(idx as usize)?;
                tlog.set_used(idx)?;
                rec
            };
            journal.dirty(txn, self.blkno)?;
            clusters.release(rec.start(), rec.clusters())?;
            freed += rec.clusters();
        }
        info!(ranges = used, clusters = freed, "truncate_log_flush");
        Ok(freed)
    }

    /// Mount-time replay: identical to a flush, run after journal recovery
    /// so ranges logged before a crash still reach the allocator.
    pub fn replay<S: BlockStore>(
        &self,
        journal: &Journal,
        store: &mut S,
        clusters: &ClusterAlloc,
    ) -> Result<u32> {
        self.flush(journal, store, clusters)
    }
}

/// One metadata block awaiting release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreedMeta {
    pub blkno: u64,
    pub bit: u16,
}

/// Metadata blocks unlinked during one tree operation, grouped by the
/// allocator slot that owns them. Drained exactly once by [`run`].
///
/// [`run`]: DeallocCtx::run
#[derive(Debug, Default)]
pub struct DeallocCtx {
    freed: HashMap<u16, Vec<FreedMeta>>,
}

impl DeallocCtx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.freed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.freed.values().map(Vec::len).sum()
    }

    /// Record an unlinked block for later release.
    pub fn defer(&mut self, blkno: u64, slot: u16, bit: u16) {
        debug!(blkno, slot, bit, "meta_block_deferred");
        self.freed
            .entry(slot)
            .or_default()
            .push(FreedMeta { blkno, bit });
    }

    /// Release every deferred block to its owning allocator, one
    /// transaction per slot. Failures are reported after the remaining
    /// slots have been tried; the context is drained either way.
    pub fn run<S: BlockStore>(
        &mut self,
        journal: &Journal,
        store: &mut S,
        allocs: &[&MetaAlloc],
    ) -> Result<usize> {
        let mut released = 0usize;
        let mut first_err = None;

        let drained: Vec<(u16, Vec<FreedMeta>)> = self.freed.drain().collect();
        for (slot, blocks) in drained {
            let Some(alloc) = allocs.iter().find(|a| a.slot() == slot) else {
                warn!(slot, "no allocator for deferred slot");
                if first_err.is_none() {
                    first_err = Some(Error::invariant(format!(
                        "no metadata allocator registered for slot {}",
                        slot
                    )));
                }
                continue;
            };

            let txn = match journal.begin(1) {
                Ok(txn) => txn,
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                    continue;
                }
            };
            let mut slot_err = None;
            for block in &blocks {
                match alloc.release_bit(block.bit) {
                    Ok(()) => released += 1,
                    Err(err) => {
                        warn!(blkno = block.blkno, slot, bit = block.bit, %err, "meta_release_failed");
                        if slot_err.is_none() {
                            slot_err = Some(err);
                        }
                    }
                }
            }
            journal.commit(txn, store)?;
            if first_err.is_none() {
                first_err = slot_err;
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(released),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VolumeHealth;
    use crate::journal::SyncMode;
    use crate::store::MemStore;
    use std::sync::Arc;
    use tempfile::tempdir;

    const BLOCK: usize = 512;
    const TLOG_BLK: u64 = 3;

    fn setup() -> (tempfile::TempDir, Journal, MemStore, TruncateLog) {
        let dir = tempdir().unwrap();
        let health = Arc::new(VolumeHealth::new());
        let journal = Journal::create(dir.path().join("journal"), SyncMode::Off, health).unwrap();
        let mut store = MemStore::new(BLOCK, 8);
        let tlog = TruncateLog::format(&mut store, TLOG_BLK, 1).unwrap();
        (dir, journal, store, tlog)
    }

    fn append_one(
        journal: &Journal,
        store: &mut MemStore,
        tlog: &TruncateLog,
        start: u32,
        clusters: u32,
    ) -> Result<()> {
        let mut txn = journal.begin(1)?;
        match tlog.append(journal, &mut txn, store, start, clusters) {
            Ok(()) => journal.commit(txn, store),
            Err(err) => {
                journal.abort(txn);
                Err(err)
            }
        }
    }

    mod truncate_log_tests {
        use super::*;

        #[test]
        fn adjacent_tail_ranges_coalesce() {
            let (_dir, journal, mut store, tlog) = setup();

            append_one(&journal, &mut store, &tlog, 100, 8).unwrap();
            append_one(&journal, &mut store, &tlog, 108, 4).unwrap();
            assert_eq!(tlog.used(&store).unwrap(), 1);

            // A gap breaks the run.
            append_one(&journal, &mut store, &tlog, 120, 4).unwrap();
            assert_eq!(tlog.used(&store).unwrap(), 2);

            // Only the tail record coalesces.
            append_one(&journal, &mut store, &tlog, 108, 1).unwrap();
            assert_eq!(tlog.used(&store).unwrap(), 3);
        }

        #[test]
        fn full_log_reports_log_full() {
            let (_dir, journal, mut store, tlog) = setup();
            // 512-byte block: (512 - 32) / 8 = 60 slots. Disjoint ranges
            // never coalesce.
            for i in 0..60u32 {
                append_one(&journal, &mut store, &tlog, i * 10, 2).unwrap();
            }
            assert!(tlog.needs_flush(&store).unwrap());
            let err = append_one(&journal, &mut store, &tlog, 20_000, 2).unwrap_err();
            assert!(matches!(err, Error::LogFull));
            assert!(err.is_retryable());
        }

        #[test]
        fn flush_returns_ranges_to_the_cluster_allocator() {
            let (_dir, journal, mut store, tlog) = setup();
            let clusters = ClusterAlloc::new(256);
            let a = clusters.claim(16).unwrap();
            let spacer = clusters.claim(4).unwrap();
            let b = clusters.claim(8).unwrap();

            append_one(&journal, &mut store, &tlog, a, 16).unwrap();
            append_one(&journal, &mut store, &tlog, b, 8).unwrap();
            assert_eq!(tlog.used(&store).unwrap(), 2);

            let flushed = tlog.flush(&journal, &mut store, &clusters).unwrap();
            assert_eq!(flushed, 24, "16 + 8 clusters SHOULD come back");
            assert_eq!(tlog.used(&store).unwrap(), 0);
            assert_eq!(clusters.free_count(), 256 - 4);
            assert!(clusters.is_claimed(spacer, 4));

            // Empty log: nothing to do.
            assert_eq!(tlog.flush(&journal, &mut store, &clusters).unwrap(), 0);
        }

        #[test]
        fn replay_after_crash_releases_logged_ranges() {
            let dir = tempdir().unwrap();
            let journal_path = dir.path().join("journal");
            let health = Arc::new(VolumeHealth::new());
            let journal = Journal::create(&journal_path, SyncMode::Off, health).unwrap();
            let mut store = MemStore::new(BLOCK, 8);
            let tlog = TruncateLog::format(&mut store, TLOG_BLK, 1).unwrap();

            let clusters = ClusterAlloc::new(64);
            let a = clusters.claim(8).unwrap();
            append_one(&journal, &mut store, &tlog, a, 8).unwrap();

            // Crash: replay the journal onto a scratch volume that only
            // has the formatted log, then replay the truncate log.
            let mut scratch = MemStore::new(BLOCK, 8);
            TruncateLog::format(&mut scratch, TLOG_BLK, 1).unwrap();
            let journal2 =
                Journal::open(&journal_path, SyncMode::Off, Arc::new(VolumeHealth::new()))
                    .unwrap();
            journal2.replay(&mut scratch).unwrap();

            let tlog2 = TruncateLog::open(&scratch, TLOG_BLK).unwrap();
            assert_eq!(tlog2.used(&scratch).unwrap(), 1);

            let clusters2 = ClusterAlloc::new(64);
            clusters2.claim(8).unwrap();
            tlog2.replay(&journal2, &mut scratch, &clusters2).unwrap();
            assert_eq!(clusters2.free_count(), 64);
            assert_eq!(tlog2.used(&scratch).unwrap(), 0);
        }
    }

    mod dealloc_ctx_tests {
        use super::*;

        #[test]
        fn deferred_blocks_release_to_their_slots() {
            let (_dir, journal, mut store, _tlog) = setup();
            let slot0 = MetaAlloc::new(0, 100, 8);
            let slot2 = MetaAlloc::new(2, 200, 8);

            let a = slot0.claim_block().unwrap();
            let b = slot0.claim_block().unwrap();
            let c = slot2.claim_block().unwrap();

            let mut ctx = DeallocCtx::new();
            ctx.defer(a.blkno, a.slot, a.bit);
            ctx.defer(b.blkno, b.slot, b.bit);
            ctx.defer(c.blkno, c.slot, c.bit);
            assert_eq!(ctx.total(), 3);

            let released = ctx.run(&journal, &mut store, &[&slot0, &slot2]).unwrap();
            assert_eq!(released, 3);
            assert_eq!(slot0.free_count(), 8);
            assert_eq!(slot2.free_count(), 8);

            // Drained: a second run has nothing to release.
            assert!(ctx.is_empty());
            assert_eq!(ctx.run(&journal, &mut store, &[&slot0, &slot2]).unwrap(), 0);
        }

        #[test]
        fn unknown_slot_and_double_defer_are_loud() {
            let (_dir, journal, mut store, _tlog) = setup();
            let slot0 = MetaAlloc::new(0, 100, 8);
            let a = slot0.claim_block().unwrap();

            let mut ctx = DeallocCtx::new();
            ctx.defer(a.blkno, a.slot, a.bit);
            ctx.defer(a.blkno, a.slot, a.bit);
            let err = ctx.run(&journal, &mut store, &[&slot0]).unwrap_err();
            assert!(matches!(err, Error::Invariant(_)));

            let mut ctx = DeallocCtx::new();
            ctx.defer(a.blkno, 7, a.bit);
            assert!(matches!(
                ctx.run(&journal, &mut store, &[&slot0]),
                Err(Error::Invariant(_))
            ));
        }
    }
}
