//! # Memory-Mapped Volume
//!
//! File-backed [`BlockStore`] mapping the whole volume into the address
//! space. Block access is pointer arithmetic into the map; the OS page
//! cache carries the real I/O.
//!
//! A mapped region becomes invalid when the file is grown and remapped.
//! No runtime guard is needed: `grow()` takes `&mut self`, so the borrow
//! checker rejects any code path that holds a block slice across a remap.

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::MmapMut;

use crate::error::{Error, Result};
use crate::store::BlockStore;

#[derive(Debug)]
pub struct MmapStore {
    file: File,
    mmap: MmapMut,
    block_size: usize,
    block_count: u64,
}

impl MmapStore {
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_size = file.metadata()?.len();

        if file_size == 0 {
            return Err(Error::invariant(format!(
                "cannot open empty volume '{}'",
                path.display()
            )));
        }
        if file_size % block_size as u64 != 0 {
            return Err(Error::invariant(format!(
                "volume '{}' size {} is not a multiple of block size {}",
                path.display(),
                file_size,
                block_size
            )));
        }
        let block_count = file_size / block_size as u64;

        // SAFETY: MmapMut::map_mut is unsafe because externally-modified
        // mappings are undefined behavior. This is safe because:
        // 1. The volume file is opened read+write and owned by this process
        // 2. The mmap lifetime is tied to MmapStore, preventing use-after-unmap
        // 3. All access goes through block()/block_mut() which bounds-check
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            file,
            mmap,
            block_size,
            block_count,
        })
    }

    pub fn create<P: AsRef<Path>>(path: P, block_size: usize, block_count: u64) -> Result<Self> {
        let path = path.as_ref();
        if block_count == 0 {
            return Err(Error::invariant("initial block count must be at least 1"));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(block_count * block_size as u64)?;

        // SAFETY: MmapMut::map_mut is unsafe because externally-modified
        // mappings are undefined behavior. This is safe because:
        // 1. The file was just created with truncate=true and sized above
        // 2. The mmap lifetime is tied to MmapStore, preventing use-after-unmap
        // 3. All access goes through block()/block_mut() which bounds-check
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            file,
            mmap,
            block_size,
            block_count,
        })
    }

    fn range(&self, blkno: u64) -> Result<std::ops::Range<usize>> {
        if blkno >= self.block_count {
            return Err(Error::invariant(format!(
                "block {} out of bounds (block_count={})",
                blkno, self.block_count
            )));
        }
        let start = blkno as usize * self.block_size;
        Ok(start..start + self.block_size)
    }
}

impl BlockStore for MmapStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn block(&self, blkno: u64) -> Result<&[u8]> {
        let range = self.range(blkno)?;
        Ok(&self.mmap[range])
    }

    fn block_mut(&mut self, blkno: u64) -> Result<&mut [u8]> {
        let range = self.range(blkno)?;
        Ok(&mut self.mmap[range])
    }

    fn grow(&mut self, new_count: u64) -> Result<()> {
        if new_count <= self.block_count {
            return Ok(());
        }

        self.mmap.flush()?;
        self.file.set_len(new_count * self.block_size as u64)?;

        // SAFETY: the old mmap becomes invalid on remap. This is safe because:
        // 1. grow() holds &mut self, so no block borrows exist
        // 2. The old map was flushed and the file extended before remapping
        // 3. The old mmap is dropped when the new one is assigned
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        self.block_count = new_count;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}
