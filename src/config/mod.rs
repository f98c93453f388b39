//! # Configuration Module
//!
//! Centralizes the on-disk layout constants and the per-volume [`Geometry`]
//! value. Constants are grouped by functional area in [`constants`] with their
//! interdependencies documented and enforced through compile-time assertions.
//!
//! ## Why Centralization?
//!
//! The record, list, block, root, and truncate-log formats all derive their
//! capacities from the same block size, and the credit formulas derive from
//! the same depth bound. Keeping those values in one place prevents the
//! classic mismatch where one module grows a header and another keeps
//! computing capacity with the old size.
//!
//! ## Module Organization
//!
//! - [`constants`]: layout sizes, signatures, credit formulas
//! - [`Geometry`]: runtime block/cluster shifts with conversion helpers

pub mod constants;
pub use constants::*;

use crate::error::{Error, Result};

/// Per-volume addressing parameters.
///
/// Blocks are the metadata I/O unit; clusters are the data allocation unit
/// and are a power-of-two multiple of the block size. All conversions are
/// shift arithmetic, so a `Geometry` is two bytes and freely `Copy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    block_shift: u8,
    cluster_shift: u8,
}

impl Geometry {
    pub fn new(block_shift: u8, cluster_shift: u8) -> Result<Self> {
        if !(MIN_BLOCK_SHIFT..=MAX_BLOCK_SHIFT).contains(&block_shift) {
            return Err(Error::InvalidGeometry(format!(
                "block shift {} outside supported range {}..={}",
                block_shift, MIN_BLOCK_SHIFT, MAX_BLOCK_SHIFT
            )));
        }
        if cluster_shift < block_shift || cluster_shift > MAX_CLUSTER_SHIFT {
            return Err(Error::InvalidGeometry(format!(
                "cluster shift {} outside supported range {}..={}",
                cluster_shift, block_shift, MAX_CLUSTER_SHIFT
            )));
        }
        Ok(Self {
            block_shift,
            cluster_shift,
        })
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        1usize << self.block_shift
    }

    #[inline]
    pub fn cluster_size(&self) -> usize {
        1usize << self.cluster_shift
    }

    #[inline]
    pub fn blocks_per_cluster(&self) -> u64 {
        1u64 << (self.cluster_shift - self.block_shift)
    }

    /// Width of a cluster range expressed in blocks.
    #[inline]
    pub fn clusters_to_blocks(&self, clusters: u32) -> u64 {
        (clusters as u64) << (self.cluster_shift - self.block_shift)
    }

    /// Cluster index containing the given block.
    #[inline]
    pub fn blocks_to_clusters(&self, blocks: u64) -> u32 {
        (blocks >> (self.cluster_shift - self.block_shift)) as u32
    }

    /// First block of the given cluster.
    #[inline]
    pub fn cluster_to_block(&self, cluster: u32) -> u64 {
        (cluster as u64) << (self.cluster_shift - self.block_shift)
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            block_shift: DEFAULT_BLOCK_SHIFT,
            cluster_shift: DEFAULT_CLUSTER_SHIFT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_geometry_is_one_block_per_cluster() {
        let geom = Geometry::default();
        assert_eq!(geom.block_size(), 4096);
        assert_eq!(geom.cluster_size(), 4096);
        assert_eq!(geom.blocks_per_cluster(), 1);
        assert_eq!(geom.clusters_to_blocks(7), 7);
        assert_eq!(geom.blocks_to_clusters(7), 7);
    }

    #[test]
    fn wide_clusters_convert_by_shift() {
        let geom = Geometry::new(9, 12).unwrap();
        assert_eq!(geom.blocks_per_cluster(), 8);
        assert_eq!(geom.clusters_to_blocks(3), 24);
        assert_eq!(geom.blocks_to_clusters(24), 3);
        assert_eq!(geom.blocks_to_clusters(31), 3);
        assert_eq!(geom.cluster_to_block(4), 32);
    }

    #[test]
    fn rejects_out_of_range_shifts() {
        assert!(Geometry::new(8, 12).is_err());
        assert!(Geometry::new(13, 13).is_err());
        assert!(Geometry::new(12, 11).is_err());
        assert!(Geometry::new(12, 21).is_err());
    }
}
