//! # Block Store
//!
//! The volume under the tree engine is a flat array of fixed-size blocks.
//! Everything above this layer addresses metadata by 64-bit block number;
//! nothing above it knows whether the bytes live in a heap buffer or a
//! memory-mapped file.
//!
//! ## Access Model
//!
//! [`BlockStore`] hands out borrowed slices:
//!
//! ```text
//! block(&self, blkno) -> &[u8]          // Borrows the store immutably
//! block_mut(&mut self, blkno) -> &mut [u8]  // Borrows exclusively
//! grow(&mut self)                        // Requires &mut self
//! ```
//!
//! Since `grow()` takes `&mut self`, the borrow checker guarantees no block
//! reference survives a remap. The tree engine therefore never holds two
//! block borrows at once; records are 16-byte `Copy` values, so moving one
//! between blocks is a copy-out followed by a second borrow.
//!
//! ## Implementations
//!
//! - [`MemStore`]: a heap-backed volume, the default for tests and for
//!   replaying a journal against a scratch image.
//! - [`MmapStore`](mmap::MmapStore): a file-backed volume mapped into the
//!   address space, for durable use.

use crate::error::{Error, Result};

pub mod mmap;

pub use mmap::MmapStore;

/// Fixed-size block access by block number.
pub trait BlockStore {
    fn block_size(&self) -> usize;

    fn block_count(&self) -> u64;

    fn block(&self, blkno: u64) -> Result<&[u8]>;

    fn block_mut(&mut self, blkno: u64) -> Result<&mut [u8]>;

    /// Extend the volume to `new_count` blocks. Shrinking is a no-op.
    fn grow(&mut self, new_count: u64) -> Result<()>;

    /// Flush volume contents to stable storage.
    fn sync(&self) -> Result<()>;
}

fn out_of_bounds(blkno: u64, count: u64) -> Error {
    Error::invariant(format!(
        "block {} out of bounds (block_count={})",
        blkno, count
    ))
}

/// Heap-backed volume.
#[derive(Debug)]
pub struct MemStore {
    block_size: usize,
    data: Vec<u8>,
}

impl MemStore {
    pub fn new(block_size: usize, block_count: u64) -> Self {
        Self {
            block_size,
            data: vec![0u8; block_size * block_count as usize],
        }
    }

    fn range(&self, blkno: u64) -> Result<std::ops::Range<usize>> {
        if blkno >= self.block_count() {
            return Err(out_of_bounds(blkno, self.block_count()));
        }
        let start = blkno as usize * self.block_size;
        Ok(start..start + self.block_size)
    }
}

impl BlockStore for MemStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        (self.data.len() / self.block_size) as u64
    }

    fn block(&self, blkno: u64) -> Result<&[u8]> {
        let range = self.range(blkno)?;
        Ok(&self.data[range])
    }

    fn block_mut(&mut self, blkno: u64) -> Result<&mut [u8]> {
        let range = self.range(blkno)?;
        Ok(&mut self.data[range])
    }

    fn grow(&mut self, new_count: u64) -> Result<()> {
        let new_len = new_count as usize * self.block_size;
        if new_len > self.data.len() {
            self.data.resize(new_len, 0);
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_store_round_trips_blocks() {
        let mut store = MemStore::new(512, 4);
        assert_eq!(store.block_size(), 512);
        assert_eq!(store.block_count(), 4);

        store.block_mut(2).unwrap()[0] = 0xab;
        assert_eq!(store.block(2).unwrap()[0], 0xab);
        assert_eq!(store.block(1).unwrap()[0], 0);
    }

    #[test]
    fn mem_store_bounds_check() {
        let store = MemStore::new(512, 4);
        assert!(store.block(3).is_ok());
        assert!(matches!(store.block(4), Err(Error::Invariant(_))));
    }

    #[test]
    fn mem_store_grow_preserves_and_zeroes() {
        let mut store = MemStore::new(512, 2);
        store.block_mut(1).unwrap()[5] = 0x77;
        store.grow(4).unwrap();
        assert_eq!(store.block_count(), 4);
        assert_eq!(store.block(1).unwrap()[5], 0x77);
        assert_eq!(store.block(3).unwrap()[5], 0);

        // Shrink requests leave the volume alone.
        store.grow(1).unwrap();
        assert_eq!(store.block_count(), 4);
    }
}
