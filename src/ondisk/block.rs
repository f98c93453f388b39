//! # Extent Blocks
//!
//! Interior and leaf nodes below the root live in dedicated metadata blocks.
//! A 48-byte header identifies the block and records where its bit lives in
//! the metadata allocator, then an extent list fills the remainder:
//!
//! ```text
//! +----------------------------+ 0
//! | ExtentBlockHeader (48 B)   |   signature, check, generation,
//! |                            |   suballoc slot/bit, blkno echo,
//! |                            |   next_leaf_blk
//! +----------------------------+ 48
//! | ListHeader (16 B)          |
//! +----------------------------+ 64
//! | ExtentRec[capacity]        |
//! +----------------------------+ block size
//! ```
//!
//! The `blkno` field echoes the block's own address so a block written to
//! the wrong place is caught on read. `next_leaf_blk` is only meaningful in
//! leaves and threads them left to right; 0 marks the rightmost leaf.
//!
//! ## Self-check
//!
//! Every sealed metadata block (extent block, root, truncate log) keeps a
//! CRC-32 of its full contents in a 4-byte word at offset 8, computed with
//! that word zeroed. A stored check of 0 means the block was never sealed
//! and is accepted; journal commit triggers call [`seal_block`] so blocks
//! reaching disk through a transaction always carry a fresh check.

use std::mem::size_of;

use crc::{Crc, CRC_32_ISCSI};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{EXTENT_BLOCK_HEADER_SIZE, EXTENT_BLOCK_SIG, LIST_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::ondisk::list::{list_capacity, ListMut, ListRef};

const BLOCK_CHECK: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Byte offset of the check word shared by all sealed block formats.
const CHECK_OFFSET: usize = 8;

fn block_check_value(data: &[u8]) -> u32 {
    let mut digest = BLOCK_CHECK.digest();
    digest.update(&data[..CHECK_OFFSET]);
    digest.update(&[0u8; 4]);
    digest.update(&data[CHECK_OFFSET + 4..]);
    digest.finalize()
}

/// Recompute and store the check word of a sealed block format.
pub fn seal_block(data: &mut [u8]) {
    let check = block_check_value(data);
    data[CHECK_OFFSET..CHECK_OFFSET + 4].copy_from_slice(&check.to_le_bytes());
}

/// Verify the stored check word. A stored 0 means unsealed and passes.
pub fn verify_block_check(data: &[u8], blkno: u64) -> Result<()> {
    if data.len() < CHECK_OFFSET + 4 {
        return Err(Error::corrupt(blkno, "block too small for a check word"));
    }
    let mut stored = [0u8; 4];
    stored.copy_from_slice(&data[CHECK_OFFSET..CHECK_OFFSET + 4]);
    let stored = u32::from_le_bytes(stored);
    if stored == 0 {
        return Ok(());
    }
    let computed = block_check_value(data);
    if stored != computed {
        return Err(Error::corrupt(
            blkno,
            format!("check mismatch, stored {:#010x} computed {:#010x}", stored, computed),
        ));
    }
    Ok(())
}

#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct ExtentBlockHeader {
    signature: [u8; 8],
    check: U32,
    fs_generation: U32,
    suballoc_slot: U16,
    suballoc_bit: U16,
    pad: U32,
    blkno: U64,
    next_leaf_blk: U64,
    reserved: [u8; 8],
}

const _: () = assert!(size_of::<ExtentBlockHeader>() == EXTENT_BLOCK_HEADER_SIZE);

impl ExtentBlockHeader {
    zerocopy_accessors! {
        fs_generation: u32,
        suballoc_slot: u16,
        suballoc_bit: u16,
        blkno: u64,
        next_leaf_blk: u64,
    }
}

fn validate(data: &[u8], blkno: u64) -> Result<()> {
    if data.len() < EXTENT_BLOCK_HEADER_SIZE + LIST_HEADER_SIZE {
        return Err(Error::corrupt(blkno, "block too small for an extent block"));
    }
    let header =
        ExtentBlockHeader::ref_from_bytes(&data[..EXTENT_BLOCK_HEADER_SIZE])
            .map_err(|_| Error::invariant("extent block header cast failed"))?;
    if &header.signature != EXTENT_BLOCK_SIG {
        return Err(Error::corrupt(blkno, "bad extent block signature"));
    }
    if header.blkno() != blkno {
        return Err(Error::corrupt(
            blkno,
            format!("block claims address {}", header.blkno()),
        ));
    }
    ListRef::new(&data[EXTENT_BLOCK_HEADER_SIZE..], blkno)?;
    Ok(())
}

/// Read-only view of an extent block.
#[derive(Clone, Copy)]
pub struct EbRef<'a> {
    data: &'a [u8],
    blkno: u64,
}

impl<'a> EbRef<'a> {
    pub fn new(data: &'a [u8], blkno: u64) -> Result<Self> {
        validate(data, blkno)?;
        Ok(Self { data, blkno })
    }

    fn header(&self) -> &ExtentBlockHeader {
        // Length and signature were validated in new().
        ExtentBlockHeader::ref_from_bytes(&self.data[..EXTENT_BLOCK_HEADER_SIZE]).unwrap()
    }

    #[inline]
    pub fn blkno(&self) -> u64 {
        self.blkno
    }

    #[inline]
    pub fn fs_generation(&self) -> u32 {
        self.header().fs_generation()
    }

    #[inline]
    pub fn suballoc_slot(&self) -> u16 {
        self.header().suballoc_slot()
    }

    #[inline]
    pub fn suballoc_bit(&self) -> u16 {
        self.header().suballoc_bit()
    }

    #[inline]
    pub fn next_leaf_blk(&self) -> u64 {
        self.header().next_leaf_blk()
    }

    pub fn list(&self) -> ListRef<'a> {
        // The list region was validated in new().
        ListRef::new(&self.data[EXTENT_BLOCK_HEADER_SIZE..], self.blkno).unwrap()
    }
}

/// Mutable view of an extent block.
pub struct EbMut<'a> {
    data: &'a mut [u8],
    blkno: u64,
}

impl<'a> EbMut<'a> {
    pub fn new(data: &'a mut [u8], blkno: u64) -> Result<Self> {
        validate(data, blkno)?;
        Ok(Self { data, blkno })
    }

    /// Stamp a fresh extent block: signature, identity, allocator coordinates,
    /// and an empty list at the given depth filling the rest of the block.
    pub fn init(
        data: &'a mut [u8],
        blkno: u64,
        fs_generation: u32,
        suballoc_slot: u16,
        suballoc_bit: u16,
        tree_depth: u16,
    ) -> Result<Self> {
        if data.len() < EXTENT_BLOCK_HEADER_SIZE + LIST_HEADER_SIZE + crate::config::EXTENT_REC_SIZE
        {
            return Err(Error::invariant(
                "block too small to format as an extent block",
            ));
        }
        let capacity = list_capacity(data.len() - EXTENT_BLOCK_HEADER_SIZE);
        data[..EXTENT_BLOCK_HEADER_SIZE].fill(0);
        {
            let header =
                ExtentBlockHeader::mut_from_bytes(&mut data[..EXTENT_BLOCK_HEADER_SIZE]).unwrap();
            header.signature = *EXTENT_BLOCK_SIG;
            header.set_fs_generation(fs_generation);
            header.set_suballoc_slot(suballoc_slot);
            header.set_suballoc_bit(suballoc_bit);
            header.set_blkno(blkno);
        }
        ListMut::init(&mut data[EXTENT_BLOCK_HEADER_SIZE..], blkno, tree_depth, capacity)?;
        Ok(Self { data, blkno })
    }

    pub fn as_ref(&self) -> EbRef<'_> {
        EbRef {
            data: self.data,
            blkno: self.blkno,
        }
    }

    fn header_mut(&mut self) -> &mut ExtentBlockHeader {
        // Length and signature were validated in new()/init().
        ExtentBlockHeader::mut_from_bytes(&mut self.data[..EXTENT_BLOCK_HEADER_SIZE]).unwrap()
    }

    #[inline]
    pub fn blkno(&self) -> u64 {
        self.blkno
    }

    #[inline]
    pub fn next_leaf_blk(&self) -> u64 {
        self.as_ref().next_leaf_blk()
    }

    #[inline]
    pub fn suballoc_slot(&self) -> u16 {
        self.as_ref().suballoc_slot()
    }

    #[inline]
    pub fn suballoc_bit(&self) -> u16 {
        self.as_ref().suballoc_bit()
    }

    pub fn set_next_leaf_blk(&mut self, blkno: u64) {
        self.header_mut().set_next_leaf_blk(blkno);
    }

    pub fn list(&self) -> ListRef<'_> {
        self.as_ref().list()
    }

    pub fn list_mut(&mut self) -> ListMut<'_> {
        let blkno = self.blkno;
        // The list region was validated in new()/init().
        ListMut::new(&mut self.data[EXTENT_BLOCK_HEADER_SIZE..], blkno).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ondisk::record::{LeafRec, RecFlags};

    const BLOCK: usize = 512;

    fn fresh(blkno: u64) -> Vec<u8> {
        let mut data = vec![0u8; BLOCK];
        EbMut::init(&mut data, blkno, 0xfeed_cafe, 2, 31, 0).unwrap();
        data
    }

    #[test]
    fn init_then_reread() {
        let data = fresh(42);
        let eb = EbRef::new(&data, 42).unwrap();
        assert_eq!(eb.fs_generation(), 0xfeed_cafe);
        assert_eq!(eb.suballoc_slot(), 2);
        assert_eq!(eb.suballoc_bit(), 31);
        assert_eq!(eb.next_leaf_blk(), 0);
        let list = eb.list();
        assert_eq!(list.tree_depth(), 0);
        assert_eq!(list.next_free(), 0);
        assert_eq!(
            list.count() as usize,
            (BLOCK - EXTENT_BLOCK_HEADER_SIZE - LIST_HEADER_SIZE) / 16
        );
    }

    #[test]
    fn list_edits_persist_through_the_block() {
        let mut data = fresh(42);
        {
            let mut eb = EbMut::new(&mut data, 42).unwrap();
            eb.list_mut()
                .push_leaf(LeafRec {
                    cpos: 8,
                    clusters: 4,
                    flags: RecFlags::UNWRITTEN,
                    blkno: 640,
                })
                .unwrap();
            eb.set_next_leaf_blk(77);
        }
        let eb = EbRef::new(&data, 42).unwrap();
        assert_eq!(eb.next_leaf_blk(), 77);
        let rec = eb.list().leaf_rec(0).unwrap();
        assert_eq!(rec.cpos, 8);
        assert!(rec.flags.contains(RecFlags::UNWRITTEN));
    }

    #[test]
    fn wrong_address_is_rejected() {
        let data = fresh(42);
        assert!(matches!(
            EbRef::new(&data, 43),
            Err(Error::Corrupt { blkno: 43, .. })
        ));
    }

    #[test]
    fn bad_signature_is_rejected() {
        let mut data = fresh(42);
        data[0] ^= 0xff;
        assert!(matches!(
            EbRef::new(&data, 42),
            Err(Error::Corrupt { .. })
        ));
    }

    #[test]
    fn seal_and_verify() {
        let mut data = fresh(42);

        // Never sealed: stored check is 0 and passes.
        verify_block_check(&data, 42).unwrap();

        seal_block(&mut data);
        verify_block_check(&data, 42).unwrap();

        // Any flipped byte past the check word is caught.
        data[100] ^= 0x01;
        assert!(matches!(
            verify_block_check(&data, 42),
            Err(Error::Corrupt { .. })
        ));
        data[100] ^= 0x01;
        verify_block_check(&data, 42).unwrap();

        // Re-sealing after an edit repairs the check.
        data[100] ^= 0x01;
        seal_block(&mut data);
        verify_block_check(&data, 42).unwrap();
    }
}
