//! # Truncate Log Format
//!
//! One block per mounted node holding cluster ranges whose release has been
//! deferred. A 32-byte header shares the sealed prefix of the other block
//! formats, then a dense array of 8-byte range records:
//!
//! ```text
//! +----------------------------+ 0
//! | TruncateLogHeader (32 B)   |   signature, check, generation,
//! |                            |   blkno echo, capacity, used
//! +----------------------------+ 32
//! | TruncateRec[capacity]      |   {start cluster, length} pairs
//! +----------------------------+ block size
//! ```
//!
//! Records are append-ordered, not sorted. The runtime layer in `dealloc`
//! owns the append and coalesce policy and the flush that walks the array
//! from the tail; this module only validates the format and moves slots.

use std::mem::size_of;

use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{TRUNCATE_LOG_HEADER_SIZE, TRUNCATE_LOG_SIG, TRUNCATE_REC_SIZE};
use crate::error::{Error, Result};

/// One deferred cluster range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct TruncateRec {
    start: U32,
    clusters: U32,
}

const _: () = assert!(size_of::<TruncateRec>() == TRUNCATE_REC_SIZE);

impl TruncateRec {
    pub fn new(start: u32, clusters: u32) -> Self {
        Self {
            start: U32::new(start),
            clusters: U32::new(clusters),
        }
    }

    zerocopy_accessors! {
        start: u32,
        clusters: u32,
    }

    /// First cluster past the range.
    pub fn end(&self) -> u32 {
        self.start() + self.clusters()
    }
}

#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct TruncateLogHeader {
    signature: [u8; 8],
    check: U32,
    fs_generation: U32,
    blkno: U64,
    count: U16,
    used: U16,
    pad: U32,
}

const _: () = assert!(size_of::<TruncateLogHeader>() == TRUNCATE_LOG_HEADER_SIZE);

impl TruncateLogHeader {
    zerocopy_accessors! {
        fs_generation: u32,
        blkno: u64,
        count: u16,
        used: u16,
    }
}

fn rec_offset(idx: usize) -> usize {
    TRUNCATE_LOG_HEADER_SIZE + idx * TRUNCATE_REC_SIZE
}

fn validate(data: &[u8], blkno: u64) -> Result<()> {
    if data.len() < TRUNCATE_LOG_HEADER_SIZE {
        return Err(Error::corrupt(blkno, "block too small for a truncate log"));
    }
    let header = TruncateLogHeader::ref_from_bytes(&data[..TRUNCATE_LOG_HEADER_SIZE])
        .map_err(|_| Error::invariant("truncate log header cast failed"))?;
    if &header.signature != TRUNCATE_LOG_SIG {
        return Err(Error::corrupt(blkno, "bad truncate log signature"));
    }
    if header.blkno() != blkno {
        return Err(Error::corrupt(
            blkno,
            format!("truncate log claims address {}", header.blkno()),
        ));
    }
    let count = header.count() as usize;
    if count == 0 {
        return Err(Error::corrupt(blkno, "truncate log has zero capacity"));
    }
    if rec_offset(count) > data.len() {
        return Err(Error::corrupt(
            blkno,
            format!("truncate log capacity {} overruns the block", count),
        ));
    }
    if header.used() > header.count() {
        return Err(Error::corrupt(
            blkno,
            format!(
                "truncate log used {} exceeds capacity {}",
                header.used(),
                header.count()
            ),
        ));
    }
    Ok(())
}

/// Read-only view of a truncate log block.
#[derive(Clone, Copy)]
pub struct TlogRef<'a> {
    data: &'a [u8],
    blkno: u64,
}

impl<'a> TlogRef<'a> {
    pub fn new(data: &'a [u8], blkno: u64) -> Result<Self> {
        validate(data, blkno)?;
        Ok(Self { data, blkno })
    }

    fn header(&self) -> &TruncateLogHeader {
        // Length and signature were validated in new().
        TruncateLogHeader::ref_from_bytes(&self.data[..TRUNCATE_LOG_HEADER_SIZE]).unwrap()
    }

    #[inline]
    pub fn blkno(&self) -> u64 {
        self.blkno
    }

    #[inline]
    pub fn count(&self) -> u16 {
        self.header().count()
    }

    #[inline]
    pub fn used(&self) -> u16 {
        self.header().used()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.used() == self.count()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used() == 0
    }

    pub fn rec(&self, idx: usize) -> Result<TruncateRec> {
        if idx >= self.count() as usize {
            return Err(Error::invariant(format!(
                "truncate record index {} out of bounds for capacity {}",
                idx,
                self.count()
            )));
        }
        let off = rec_offset(idx);
        TruncateRec::ref_from_bytes(&self.data[off..off + TRUNCATE_REC_SIZE])
            .map(|rec| *rec)
            .map_err(|_| Error::invariant("truncate record cast failed"))
    }
}

/// Mutable view of a truncate log block.
pub struct TlogMut<'a> {
    data: &'a mut [u8],
    blkno: u64,
}

impl<'a> TlogMut<'a> {
    pub fn new(data: &'a mut [u8], blkno: u64) -> Result<Self> {
        validate(data, blkno)?;
        Ok(Self { data, blkno })
    }

    /// Stamp an empty truncate log over `data`, capacity sized to the block.
    pub fn init(data: &'a mut [u8], blkno: u64, fs_generation: u32) -> Result<Self> {
        if data.len() < TRUNCATE_LOG_HEADER_SIZE + TRUNCATE_REC_SIZE {
            return Err(Error::invariant(
                "block too small to format as a truncate log",
            ));
        }
        let count = (data.len() - TRUNCATE_LOG_HEADER_SIZE) / TRUNCATE_REC_SIZE;
        let count = count.min(u16::MAX as usize) as u16;
        data.fill(0);
        {
            let header =
                TruncateLogHeader::mut_from_bytes(&mut data[..TRUNCATE_LOG_HEADER_SIZE]).unwrap();
            header.signature = *TRUNCATE_LOG_SIG;
            header.set_fs_generation(fs_generation);
            header.set_blkno(blkno);
            header.set_count(count);
        }
        Ok(Self { data, blkno })
    }

    pub fn as_ref(&self) -> TlogRef<'_> {
        TlogRef {
            data: self.data,
            blkno: self.blkno,
        }
    }

    fn header_mut(&mut self) -> &mut TruncateLogHeader {
        // Length and signature were validated in new()/init().
        TruncateLogHeader::mut_from_bytes(&mut self.data[..TRUNCATE_LOG_HEADER_SIZE]).unwrap()
    }

    #[inline]
    pub fn count(&self) -> u16 {
        self.as_ref().count()
    }

    #[inline]
    pub fn used(&self) -> u16 {
        self.as_ref().used()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.as_ref().is_full()
    }

    pub fn rec(&self, idx: usize) -> Result<TruncateRec> {
        self.as_ref().rec(idx)
    }

    pub fn set_used(&mut self, used: u16) -> Result<()> {
        if used > self.count() {
            return Err(Error::invariant(format!(
                "truncate log used {} exceeds capacity {}",
                used,
                self.count()
            )));
        }
        self.header_mut().set_used(used);
        Ok(())
    }

    pub fn set_rec(&mut self, idx: usize, rec: TruncateRec) -> Result<()> {
        if idx >= self.count() as usize {
            return Err(Error::invariant(format!(
                "truncate record index {} out of bounds for capacity {}",
                idx,
                self.count()
            )));
        }
        let off = rec_offset(idx);
        self.data[off..off + TRUNCATE_REC_SIZE].copy_from_slice(rec.as_bytes());
        Ok(())
    }
}
