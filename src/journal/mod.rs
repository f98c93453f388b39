//! # Metadata Journal
//!
//! Write-ahead log for metadata blocks. Every tree mutation runs inside a
//! transaction that declares write intent on each block before touching it
//! and marks the block dirty afterwards; commit snapshots the after-image
//! of every dirty block into the log before the volume is trusted to hold
//! it. Replay at mount reapplies committed transactions and discards a
//! torn tail.
//!
//! ## Frame Format
//!
//! The log is a single append-only file of frames:
//!
//! ```text
//! +------------------+------------------+
//! | Frame Header     | Block After-Image|
//! | (32 bytes)       | (block size)     |
//! +------------------+------------------+
//! ```
//!
//! Block frames carry one after-image; a commit frame has no payload and
//! seals every frame of its transaction sequence. The header checksum is
//! CRC64 over the header fields and payload, so a torn write at the tail
//! reads as end-of-log.
//!
//! ## Write Protocol
//!
//! 1. `begin` reserves credits, one per distinct block the transaction may
//!    dirty; a degraded volume refuses new transactions
//! 2. `access` declares intent on a block and consumes a credit before the
//!    first byte of that block changes
//! 3. `dirty` records that the declared block was modified
//! 4. `commit` runs commit triggers (block sealing), appends one frame per
//!    dirty block plus the commit frame, then syncs per [`SyncMode`]
//!
//! Running out of credits mid-operation is the retryable
//! [`Error::NoCredits`]; callers either sized the transaction wrong or
//! must `extend` before continuing. Dirtying a block that was never
//! declared is an invariant violation, not an I/O problem.
//!
//! ## Crash Recovery
//!
//! `replay` scans the log, buffers block frames per transaction sequence,
//! applies them only when the commit frame is seen, then truncates the
//! log. Frames after the last commit frame are discarded.
//!
//! ## Concurrency
//!
//! One transaction runs at a time. The writer side is serialized by the
//! single `&mut` tree handle; the journal still latches an active flag and
//! turns a nested `begin` into an invariant error rather than corruption.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crc::{Crc, CRC_64_ECMA_182};
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, error, info};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::config::JOURNAL_FRAME_HEADER_SIZE;
use crate::error::{Error, Result, VolumeHealth};
use crate::ondisk::seal_block;
use crate::store::BlockStore;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

const FRAME_BLOCK: u32 = 1;
const FRAME_COMMIT: u32 = 2;

/// Durability of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Sync the log file on every commit.
    Always,
    /// Never sync; for tests and scratch volumes.
    Off,
}

/// Work the commit runs on a block before snapshotting its after-image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitTrigger {
    /// Recompute the block's self-check word.
    SealBlock,
    /// Snapshot the bytes as they are.
    Raw,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoBytes, FromBytes, Immutable)]
struct FrameHeader {
    blkno: u64,
    txn_seq: u64,
    kind: u32,
    data_len: u32,
    checksum: u64,
}

const _: () = assert!(std::mem::size_of::<FrameHeader>() == JOURNAL_FRAME_HEADER_SIZE);

fn compute_checksum(header: &FrameHeader, data: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(&header.blkno.to_le_bytes());
    digest.update(&header.txn_seq.to_le_bytes());
    digest.update(&header.kind.to_le_bytes());
    digest.update(&header.data_len.to_le_bytes());
    digest.update(data);
    digest.finalize()
}

/// One open transaction. Created by [`Journal::begin`], consumed by
/// [`Journal::commit`] or [`Journal::abort`].
pub struct Txn {
    seq: u64,
    credits: u32,
    used: u32,
    accessed: HashMap<u64, CommitTrigger>,
    dirty: Vec<u64>,
}

impl Txn {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn remaining_credits(&self) -> u32 {
        self.credits - self.used
    }

    fn has_writes(&self) -> bool {
        !self.dirty.is_empty()
    }
}

struct LogFile {
    file: File,
    offset: u64,
}

impl LogFile {
    fn write_frame(&mut self, mut header: FrameHeader, data: &[u8]) -> Result<()> {
        header.checksum = compute_checksum(&header, data);
        self.file.write_all(header.as_bytes())?;
        self.file.write_all(data)?;
        self.offset += (JOURNAL_FRAME_HEADER_SIZE + data.len()) as u64;
        Ok(())
    }

    /// Read the next frame. `None` marks end-of-log, including a torn or
    /// corrupt tail.
    fn read_frame(&mut self) -> Result<Option<(FrameHeader, Vec<u8>)>> {
        let mut header_bytes = [0u8; JOURNAL_FRAME_HEADER_SIZE];
        match self.file.read_exact(&mut header_bytes) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        let Ok(header) = FrameHeader::read_from_bytes(&header_bytes) else {
            return Ok(None);
        };
        if header.kind != FRAME_BLOCK && header.kind != FRAME_COMMIT {
            return Ok(None);
        }
        // A frame payload is at most one block image; a larger length is a
        // torn or garbage header, not a frame.
        if header.data_len as usize > 1 << crate::config::MAX_BLOCK_SHIFT {
            return Ok(None);
        }

        let mut data = vec![0u8; header.data_len as usize];
        match self.file.read_exact(&mut data) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        if compute_checksum(&header, &data) != header.checksum {
            return Ok(None);
        }

        self.offset += (JOURNAL_FRAME_HEADER_SIZE + data.len()) as u64;
        Ok(Some((header, data)))
    }

    fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.flush()?;
        self.offset = 0;
        Ok(())
    }
}

pub struct Journal {
    log: Mutex<LogFile>,
    sync: SyncMode,
    next_seq: AtomicU64,
    txn_active: AtomicBool,
    health: Arc<VolumeHealth>,
}

impl Journal {
    pub fn create<P: AsRef<Path>>(
        path: P,
        sync: SyncMode,
        health: Arc<VolumeHealth>,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            log: Mutex::new(LogFile { file, offset: 0 }),
            sync,
            next_seq: AtomicU64::new(1),
            txn_active: AtomicBool::new(false),
            health,
        })
    }

    pub fn open<P: AsRef<Path>>(
        path: P,
        sync: SyncMode,
        health: Arc<VolumeHealth>,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        let offset = file.metadata()?.len();
        Ok(Self {
            log: Mutex::new(LogFile { file, offset }),
            sync,
            next_seq: AtomicU64::new(1),
            txn_active: AtomicBool::new(false),
            health,
        })
    }

    pub fn health(&self) -> &VolumeHealth {
        &self.health
    }

    /// Reapply every committed transaction in the log to `store`, then
    /// truncate the log. Returns the number of block frames applied.
    pub fn replay<S: BlockStore>(&self, store: &mut S) -> Result<u32> {
        let mut log = self.log.lock();
        log.file.seek(SeekFrom::Start(0))?;
        log.offset = 0;

        let mut pending: Vec<(u64, Vec<u8>)> = Vec::new();
        let mut pending_seq = 0u64;
        let mut applied = 0u32;

        while let Some((header, data)) = log.read_frame()? {
            match header.kind {
                FRAME_BLOCK => {
                    if header.txn_seq != pending_seq {
                        // A new sequence before the previous commit frame
                        // means that transaction never committed.
                        pending.clear();
                        pending_seq = header.txn_seq;
                    }
                    pending.push((header.blkno, data));
                }
                FRAME_COMMIT => {
                    if header.txn_seq == pending_seq {
                        for (blkno, image) in pending.drain(..) {
                            if image.len() != store.block_size() {
                                return Err(Error::corrupt(
                                    blkno,
                                    format!(
                                        "journal frame holds {} bytes for a {}-byte block",
                                        image.len(),
                                        store.block_size()
                                    ),
                                ));
                            }
                            store.block_mut(blkno)?.copy_from_slice(&image);
                            applied += 1;
                        }
                    }
                    pending.clear();
                }
                _ => break,
            }
        }

        log.truncate()?;
        if applied > 0 {
            store.sync()?;
        }
        info!(frames = applied, "journal_replay");
        Ok(applied)
    }

    /// Open a transaction with `credits` write-intent slots.
    pub fn begin(&self, credits: u32) -> Result<Txn> {
        if self.health.is_degraded() {
            return Err(Error::ReadOnly);
        }
        if self.txn_active.swap(true, Ordering::AcqRel) {
            return Err(Error::invariant("nested journal transaction"));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        debug!(seq, credits, "txn_begin");
        Ok(Txn {
            seq,
            credits,
            used: 0,
            accessed: HashMap::new(),
            dirty: Vec::new(),
        })
    }

    /// Raise the credit limit of a running transaction.
    pub fn extend(&self, txn: &mut Txn, more: u32) -> Result<()> {
        txn.credits += more;
        debug!(seq = txn.seq, credits = txn.credits, "txn_extend");
        Ok(())
    }

    /// Declare write intent on a block. Consumes one credit the first time
    /// a block is named; repeat declarations are free.
    pub fn access(&self, txn: &mut Txn, blkno: u64, trigger: CommitTrigger) -> Result<()> {
        if txn.accessed.contains_key(&blkno) {
            return Ok(());
        }
        if txn.used == txn.credits {
            return Err(Error::NoCredits {
                needed: txn.used + 1,
                available: txn.credits,
            });
        }
        txn.used += 1;
        txn.accessed.insert(blkno, trigger);
        Ok(())
    }

    /// Record that a declared block was modified.
    pub fn dirty(&self, txn: &mut Txn, blkno: u64) -> Result<()> {
        if !txn.accessed.contains_key(&blkno) {
            return Err(Error::invariant(format!(
                "block {} dirtied without declared intent",
                blkno
            )));
        }
        if !txn.dirty.contains(&blkno) {
            txn.dirty.push(blkno);
        }
        Ok(())
    }

    /// Seal and snapshot every dirty block into the log, then write the
    /// commit frame. An empty transaction releases without logging.
    pub fn commit<S: BlockStore>(&self, txn: Txn, store: &mut S) -> Result<()> {
        let outcome = self.commit_inner(&txn, store);
        self.txn_active.store(false, Ordering::Release);
        if let Err(err) = &outcome {
            error!(seq = txn.seq, %err, "txn_commit_failed");
            self.health.degrade();
        }
        outcome
    }

    fn commit_inner<S: BlockStore>(&self, txn: &Txn, store: &mut S) -> Result<()> {
        if !txn.has_writes() {
            debug!(seq = txn.seq, "txn_commit_empty");
            return Ok(());
        }

        let mut log = self.log.lock();
        for &blkno in &txn.dirty {
            if txn.accessed.get(&blkno) == Some(&CommitTrigger::SealBlock) {
                seal_block(store.block_mut(blkno)?);
            }
            let image = store.block(blkno)?;
            let header = FrameHeader {
                blkno,
                txn_seq: txn.seq,
                kind: FRAME_BLOCK,
                data_len: image.len() as u32,
                checksum: 0,
            };
            log.write_frame(header, image)?;
        }
        let commit = FrameHeader {
            blkno: 0,
            txn_seq: txn.seq,
            kind: FRAME_COMMIT,
            data_len: 0,
            checksum: 0,
        };
        log.write_frame(commit, &[])?;
        if self.sync == SyncMode::Always {
            log.file.sync_all()?;
        }
        debug!(seq = txn.seq, frames = txn.dirty.len(), "txn_commit");
        Ok(())
    }

    /// Release a transaction that cannot commit. A transaction that never
    /// dirtied a block releases cleanly; one with writes in flight leaves
    /// the volume inconsistent, so the volume degrades to read-only.
    pub fn abort(&self, txn: Txn) {
        self.txn_active.store(false, Ordering::Release);
        if txn.has_writes() {
            error!(seq = txn.seq, dirty = txn.dirty.len(), "txn_abort_with_writes");
            self.health.degrade();
        } else {
            debug!(seq = txn.seq, "txn_abort_clean");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use tempfile::tempdir;

    const BLOCK: usize = 512;

    fn setup() -> (tempfile::TempDir, Journal, MemStore) {
        let dir = tempdir().unwrap();
        let health = Arc::new(VolumeHealth::new());
        let journal = Journal::create(dir.path().join("journal"), SyncMode::Off, health).unwrap();
        let store = MemStore::new(BLOCK, 16);
        (dir, journal, store)
    }

    #[test]
    fn credits_are_consumed_once_per_block() {
        let (_dir, journal, _store) = setup();
        let mut txn = journal.begin(2).unwrap();

        journal.access(&mut txn, 3, CommitTrigger::Raw).unwrap();
        journal.access(&mut txn, 3, CommitTrigger::Raw).unwrap();
        assert_eq!(txn.remaining_credits(), 1);

        journal.access(&mut txn, 4, CommitTrigger::Raw).unwrap();
        let err = journal.access(&mut txn, 5, CommitTrigger::Raw).unwrap_err();
        assert!(matches!(err, Error::NoCredits { .. }));
        assert!(err.is_retryable());

        journal.extend(&mut txn, 1).unwrap();
        journal.access(&mut txn, 5, CommitTrigger::Raw).unwrap();
        journal.abort(txn);
    }

    #[test]
    fn dirty_requires_declared_intent() {
        let (_dir, journal, _store) = setup();
        let mut txn = journal.begin(1).unwrap();
        assert!(matches!(
            journal.dirty(&mut txn, 9),
            Err(Error::Invariant(_))
        ));
        journal.access(&mut txn, 9, CommitTrigger::Raw).unwrap();
        journal.dirty(&mut txn, 9).unwrap();
        journal.abort(txn);
    }

    #[test]
    fn nested_begin_is_rejected() {
        let (_dir, journal, _store) = setup();
        let txn = journal.begin(1).unwrap();
        assert!(matches!(journal.begin(1), Err(Error::Invariant(_))));
        journal.abort(txn);
        journal.begin(1).map(|t| journal.abort(t)).unwrap();
    }

    #[test]
    fn commit_then_replay_restores_blocks() {
        let dir = tempdir().unwrap();
        let health = Arc::new(VolumeHealth::new());
        let journal =
            Journal::create(dir.path().join("journal"), SyncMode::Off, health.clone()).unwrap();
        let mut store = MemStore::new(BLOCK, 16);

        let mut txn = journal.begin(2).unwrap();
        journal.access(&mut txn, 2, CommitTrigger::Raw).unwrap();
        journal.access(&mut txn, 7, CommitTrigger::Raw).unwrap();
        store.block_mut(2).unwrap()[0] = 0xaa;
        store.block_mut(7).unwrap()[0] = 0xbb;
        journal.dirty(&mut txn, 2).unwrap();
        journal.dirty(&mut txn, 7).unwrap();
        journal.commit(txn, &mut store).unwrap();

        // Crash image: the volume never saw the writes.
        let mut scratch = MemStore::new(BLOCK, 16);
        let journal2 = Journal::open(
            dir.path().join("journal"),
            SyncMode::Off,
            Arc::new(VolumeHealth::new()),
        )
        .unwrap();
        let applied = journal2.replay(&mut scratch).unwrap();
        assert_eq!(applied, 2);
        assert_eq!(scratch.block(2).unwrap()[0], 0xaa);
        assert_eq!(scratch.block(7).unwrap()[0], 0xbb);

        // Replay truncated the log, so a second pass applies nothing.
        assert_eq!(journal2.replay(&mut scratch).unwrap(), 0);
    }

    #[test]
    fn uncommitted_tail_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal");
        let health = Arc::new(VolumeHealth::new());
        let journal = Journal::create(&path, SyncMode::Off, health).unwrap();
        let mut store = MemStore::new(BLOCK, 16);

        let mut txn = journal.begin(1).unwrap();
        journal.access(&mut txn, 2, CommitTrigger::Raw).unwrap();
        store.block_mut(2).unwrap()[0] = 0xaa;
        journal.dirty(&mut txn, 2).unwrap();
        journal.commit(txn, &mut store).unwrap();

        // A block frame with no commit frame after it: simulate a crash
        // mid-commit by appending the frame bytes by hand.
        {
            let mut log = journal.log.lock();
            let image = vec![0xccu8; BLOCK];
            let header = FrameHeader {
                blkno: 5,
                txn_seq: 99,
                kind: FRAME_BLOCK,
                data_len: BLOCK as u32,
                checksum: 0,
            };
            log.write_frame(header, &image).unwrap();
        }

        let mut scratch = MemStore::new(BLOCK, 16);
        let journal2 =
            Journal::open(&path, SyncMode::Off, Arc::new(VolumeHealth::new())).unwrap();
        assert_eq!(journal2.replay(&mut scratch).unwrap(), 1);
        assert_eq!(scratch.block(2).unwrap()[0], 0xaa);
        assert_eq!(scratch.block(5).unwrap()[0], 0);
    }

    #[test]
    fn torn_frame_reads_as_end_of_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal");
        let health = Arc::new(VolumeHealth::new());
        let journal = Journal::create(&path, SyncMode::Off, health).unwrap();
        let mut store = MemStore::new(BLOCK, 16);

        let mut txn = journal.begin(1).unwrap();
        journal.access(&mut txn, 3, CommitTrigger::Raw).unwrap();
        store.block_mut(3).unwrap()[0] = 0x11;
        journal.dirty(&mut txn, 3).unwrap();
        journal.commit(txn, &mut store).unwrap();

        // Chop the last 10 bytes off the commit frame.
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 10).unwrap();

        let mut scratch = MemStore::new(BLOCK, 16);
        let journal2 =
            Journal::open(&path, SyncMode::Off, Arc::new(VolumeHealth::new())).unwrap();
        assert_eq!(journal2.replay(&mut scratch).unwrap(), 0);
    }

    #[test]
    fn abort_with_writes_degrades_the_volume() {
        let dir = tempdir().unwrap();
        let health = Arc::new(VolumeHealth::new());
        let journal =
            Journal::create(dir.path().join("journal"), SyncMode::Off, health.clone()).unwrap();

        let mut txn = journal.begin(1).unwrap();
        journal.access(&mut txn, 2, CommitTrigger::Raw).unwrap();
        journal.dirty(&mut txn, 2).unwrap();
        journal.abort(txn);

        assert!(health.is_degraded());
        assert!(matches!(journal.begin(1), Err(Error::ReadOnly)));
    }

    #[test]
    fn clean_abort_keeps_the_volume_writable() {
        let (_dir, journal, _store) = setup();
        let mut txn = journal.begin(1).unwrap();
        journal.access(&mut txn, 2, CommitTrigger::Raw).unwrap();
        journal.abort(txn);
        assert!(!journal.health().is_degraded());
        journal.begin(1).map(|t| journal.abort(t)).unwrap();
    }

    #[test]
    fn sealed_blocks_carry_a_fresh_check_after_commit() {
        use crate::ondisk::block::EbMut;
        use crate::ondisk::verify_block_check;

        let (_dir, journal, mut store) = setup();
        EbMut::init(store.block_mut(4).unwrap(), 4, 1, 0, 0, 0).unwrap();

        let mut txn = journal.begin(1).unwrap();
        journal.access(&mut txn, 4, CommitTrigger::SealBlock).unwrap();
        store.block_mut(4).unwrap()[60] = 0x5a;
        journal.dirty(&mut txn, 4).unwrap();
        journal.commit(txn, &mut store).unwrap();

        verify_block_check(store.block(4).unwrap(), 4).unwrap();
        let mut check = [0u8; 4];
        check.copy_from_slice(&store.block(4).unwrap()[8..12]);
        assert_ne!(u32::from_le_bytes(check), 0);
    }
}
