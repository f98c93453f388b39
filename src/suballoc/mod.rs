//! # Space Allocators
//!
//! Two bitmap allocators back the tree engine: one for the volume's data
//! clusters and one per slot for metadata blocks. The engine itself never
//! scans a bitmap; it claims and releases through these interfaces, and
//! the deferred-reclaim layer releases through them again at flush time.
//!
//! ## Layering
//!
//! 1. Raw bit manipulation on byte-slice bitmaps (free functions).
//! 2. [`ClusterAlloc`]: first-fit contiguous cluster runs.
//! 3. [`MetaAlloc`]: single-block claims with a slot and bit identity,
//!    echoed into each extent block header so a freed block can be
//!    returned to the allocator that owns it.
//!
//! Allocation state lives in memory behind a `Mutex`; persistence of the
//! bitmaps belongs to the volume layers above this crate. Exhaustion is
//! the retryable [`Error::NoSpace`]. Releasing a bit that is already free
//! is an invariant violation, which is what makes double-release bugs in
//! the reclaim path loud instead of silent.

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{Error, Result};

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let mut free = 0u32;
    for idx in 0..count {
        if !bitmap_get(bitmap, idx) {
            free += 1;
        }
    }
    free
}

/// Find `n` contiguous free bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_find_contiguous(bitmap: &[u8], count: u32, n: u32) -> Option<u32> {
    if n == 0 {
        return Some(0);
    }
    let mut run_start = 0u32;
    let mut run_len = 0u32;

    for idx in 0..count {
        if bitmap_get(bitmap, idx) {
            run_start = idx + 1;
            run_len = 0;
        } else {
            run_len += 1;
            if run_len >= n {
                return Some(run_start);
            }
        }
    }
    None
}

#[derive(Debug)]
struct ClusterMap {
    bitmap: Vec<u8>,
    clusters: u32,
    free: u32,
}

/// Volume cluster allocator. First-fit over a cluster bitmap.
#[derive(Debug)]
pub struct ClusterAlloc {
    inner: Mutex<ClusterMap>,
}

impl ClusterAlloc {
    pub fn new(clusters: u32) -> Self {
        Self {
            inner: Mutex::new(ClusterMap {
                bitmap: vec![0u8; clusters.div_ceil(8) as usize],
                clusters,
                free: clusters,
            }),
        }
    }

    pub fn free_count(&self) -> u32 {
        self.inner.lock().free
    }

    /// Claim a contiguous run of `count` clusters, returning its start.
    pub fn claim(&self, count: u32) -> Result<u32> {
        if count == 0 {
            return Err(Error::invariant("zero-length cluster claim"));
        }
        let mut map = self.inner.lock();
        let Some(start) = bitmap_find_contiguous(&map.bitmap, map.clusters, count) else {
            return Err(Error::NoSpace);
        };
        for idx in start..start + count {
            bitmap_set(&mut map.bitmap, idx);
        }
        map.free -= count;
        trace!(start, count, "clusters_claimed");
        Ok(start)
    }

    /// Release a previously claimed run.
    pub fn release(&self, start: u32, count: u32) -> Result<()> {
        let mut map = self.inner.lock();
        let end = start.checked_add(count).ok_or_else(|| {
            Error::invariant(format!("cluster release at {} wraps the cluster space", start))
        })?;
        if end > map.clusters {
            return Err(Error::invariant(format!(
                "cluster release [{}, {}) past volume end {}",
                start, end, map.clusters
            )));
        }
        for idx in start..start + count {
            if !bitmap_get(&map.bitmap, idx) {
                return Err(Error::invariant(format!(
                    "double release of cluster {}",
                    idx
                )));
            }
        }
        for idx in start..start + count {
            bitmap_clear(&mut map.bitmap, idx);
        }
        map.free += count;
        trace!(start, count, "clusters_released");
        Ok(())
    }

    /// True when every cluster of the run is currently claimed.
    pub fn is_claimed(&self, start: u32, count: u32) -> bool {
        let map = self.inner.lock();
        (start..start + count).all(|idx| bitmap_get(&map.bitmap, idx))
    }
}

/// Identity of one claimed metadata block: its address plus the allocator
/// coordinates stamped into the block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaBlock {
    pub blkno: u64,
    pub slot: u16,
    pub bit: u16,
}

#[derive(Debug)]
struct MetaMap {
    bitmap: Vec<u8>,
    bits: u16,
    free: u16,
}

/// Per-slot metadata block allocator. Blocks are claimed one at a time;
/// `blkno = base + bit` inside the slot's region.
#[derive(Debug)]
pub struct MetaAlloc {
    slot: u16,
    base_blkno: u64,
    inner: Mutex<MetaMap>,
}

impl MetaAlloc {
    pub fn new(slot: u16, base_blkno: u64, bits: u16) -> Self {
        Self {
            slot,
            base_blkno,
            inner: Mutex::new(MetaMap {
                bitmap: vec![0u8; (bits as u32).div_ceil(8) as usize],
                bits,
                free: bits,
            }),
        }
    }

    pub fn slot(&self) -> u16 {
        self.slot
    }

    pub fn free_count(&self) -> u16 {
        self.inner.lock().free
    }

    /// Verify `n` blocks could be claimed before an operation starts
    /// mutating. The check is advisory under the single-writer model.
    pub fn reserve(&self, n: u32) -> Result<()> {
        if u32::from(self.inner.lock().free) < n {
            return Err(Error::NoSpace);
        }
        Ok(())
    }

    pub fn claim_block(&self) -> Result<MetaBlock> {
        let mut map = self.inner.lock();
        let mut found = None;
        for idx in 0..u32::from(map.bits) {
            if !bitmap_get(&map.bitmap, idx) {
                found = Some(idx);
                break;
            }
        }
        let Some(idx) = found else {
            return Err(Error::NoSpace);
        };
        bitmap_set(&mut map.bitmap, idx);
        map.free -= 1;
        let block = MetaBlock {
            blkno: self.base_blkno + u64::from(idx),
            slot: self.slot,
            bit: idx as u16,
        };
        trace!(blkno = block.blkno, slot = block.slot, bit = block.bit, "meta_block_claimed");
        Ok(block)
    }

    pub fn release_bit(&self, bit: u16) -> Result<()> {
        let mut map = self.inner.lock();
        if bit >= map.bits {
            return Err(Error::invariant(format!(
                "metadata bit {} past slot capacity {}",
                bit, map.bits
            )));
        }
        if !bitmap_get(&map.bitmap, u32::from(bit)) {
            return Err(Error::invariant(format!(
                "double release of metadata bit {} in slot {}",
                bit, self.slot
            )));
        }
        bitmap_clear(&mut map.bitmap, u32::from(bit));
        map.free += 1;
        trace!(slot = self.slot, bit, "meta_block_released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod bitmap_tests {
        use super::*;

        #[test]
        fn set_get_clear() {
            let mut bitmap = vec![0u8; 2];
            assert!(!bitmap_get(&bitmap, 9));
            bitmap_set(&mut bitmap, 9);
            assert!(bitmap_get(&bitmap, 9));
            bitmap_clear(&mut bitmap, 9);
            assert!(!bitmap_get(&bitmap, 9));
        }

        #[test]
        fn contiguous_run_crosses_byte_boundary() {
            let mut bitmap = vec![0u8; 2];
            for idx in 0..6 {
                bitmap_set(&mut bitmap, idx);
            }
            assert_eq!(bitmap_find_contiguous(&bitmap, 16, 4), Some(6));
            assert_eq!(bitmap_find_contiguous(&bitmap, 16, 11), None);
            assert_eq!(bitmap_count_free(&bitmap, 16), 10);
        }
    }

    mod cluster_alloc_tests {
        use super::*;

        #[test]
        fn first_fit_skips_claimed_runs() {
            let alloc = ClusterAlloc::new(32);
            assert_eq!(alloc.claim(4).unwrap(), 0);
            assert_eq!(alloc.claim(2).unwrap(), 4);
            alloc.release(0, 4).unwrap();
            assert_eq!(alloc.claim(8).unwrap(), 6);
            assert_eq!(alloc.claim(3).unwrap(), 0);
            assert_eq!(alloc.free_count(), 32 - 2 - 8 - 3);
        }

        #[test]
        fn exhaustion_is_retryable() {
            let alloc = ClusterAlloc::new(8);
            alloc.claim(6).unwrap();
            let err = alloc.claim(4).unwrap_err();
            assert!(matches!(err, Error::NoSpace));
            assert!(err.is_retryable());
        }

        #[test]
        fn double_release_is_an_invariant_error() {
            let alloc = ClusterAlloc::new(16);
            let start = alloc.claim(4).unwrap();
            alloc.release(start, 4).unwrap();
            assert!(matches!(
                alloc.release(start, 4),
                Err(Error::Invariant(_))
            ));
        }
    }

    mod meta_alloc_tests {
        use super::*;

        #[test]
        fn claims_carry_slot_and_bit() {
            let alloc = MetaAlloc::new(3, 1000, 4);
            let a = alloc.claim_block().unwrap();
            let b = alloc.claim_block().unwrap();
            assert_eq!(a, MetaBlock { blkno: 1000, slot: 3, bit: 0 });
            assert_eq!(b, MetaBlock { blkno: 1001, slot: 3, bit: 1 });

            alloc.release_bit(0).unwrap();
            let c = alloc.claim_block().unwrap();
            assert_eq!(c.bit, 0);
        }

        #[test]
        fn reserve_checks_without_claiming() {
            let alloc = MetaAlloc::new(0, 10, 3);
            alloc.reserve(3).unwrap();
            assert_eq!(alloc.free_count(), 3);
            alloc.claim_block().unwrap();
            assert!(matches!(alloc.reserve(3), Err(Error::NoSpace)));
        }

        #[test]
        fn release_of_free_bit_is_an_invariant_error() {
            let alloc = MetaAlloc::new(0, 10, 3);
            assert!(matches!(alloc.release_bit(1), Err(Error::Invariant(_))));
            assert!(matches!(alloc.release_bit(9), Err(Error::Invariant(_))));
        }
    }
}
