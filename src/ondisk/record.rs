//! # Extent Records
//!
//! One record maps a logical cluster range of the owning object to a physical
//! block run (leaf) or describes the range theoretically spanned by a child
//! subtree (interior). Both variants occupy the same 16-byte slot on disk:
//!
//! ```text
//! offset  0        4        8                16
//!         ├────────┼────────┼────────────────┤
//! leaf    │ cpos   │ cl │r│f│ blkno          │   cl = clusters (u16)
//!         │ (u32)  │(u16)│ │ │ (u64)         │   r  = reserved, f = flags
//!         ├────────┼────────┼────────────────┤
//! interior│ cpos   │clusters│ blkno          │
//!         │ (u32)  │ (u32)  │ (u64)          │
//!         └────────┴────────┴────────────────┘
//! ```
//!
//! Bytes 4..8 are decoded according to the containing node's depth, never
//! guessed from content. [`RawExtentRec`] is the only place in the crate that
//! touches the raw payload; all algorithm code works with the
//! [`ExtentRec`] sum type or the concrete [`LeafRec`]/[`InteriorRec`] halves.
//!
//! A leaf record with zero clusters is the *empty record*: a placeholder that
//! lets rotation move a slot across leaves without changing record counts.
//! Lists keep at most one, always at index 0.

use std::mem::size_of;

use bitflags::bitflags;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::EXTENT_REC_SIZE;

bitflags! {
    /// Flag byte of a leaf record. Records with different flags never merge.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RecFlags: u8 {
        /// Space is allocated but carries no data yet; reads see zeros and a
        /// first write converts the covered range to written.
        const UNWRITTEN = 0x01;
    }
}

/// Decoded leaf record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeafRec {
    pub cpos: u32,
    pub clusters: u16,
    pub flags: RecFlags,
    pub blkno: u64,
}

impl LeafRec {
    /// First cluster past the mapped range.
    #[inline]
    pub fn end(&self) -> u32 {
        self.cpos + self.clusters as u32
    }

    /// The zero-length placeholder used by rotation.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.clusters == 0
    }
}

/// Decoded interior record. `clusters` covers the full theoretical range of
/// the child subtree, so interior levels never contain gaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InteriorRec {
    pub cpos: u32,
    pub clusters: u32,
    pub blkno: u64,
}

impl InteriorRec {
    #[inline]
    pub fn end(&self) -> u32 {
        self.cpos + self.clusters
    }
}

/// A record decoded against its node's depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentRec {
    Leaf(LeafRec),
    Interior(InteriorRec),
}

impl ExtentRec {
    #[inline]
    pub fn cpos(&self) -> u32 {
        match self {
            ExtentRec::Leaf(rec) => rec.cpos,
            ExtentRec::Interior(rec) => rec.cpos,
        }
    }

    #[inline]
    pub fn blkno(&self) -> u64 {
        match self {
            ExtentRec::Leaf(rec) => rec.blkno,
            ExtentRec::Interior(rec) => rec.blkno,
        }
    }

    #[inline]
    pub fn clusters(&self) -> u32 {
        match self {
            ExtentRec::Leaf(rec) => rec.clusters as u32,
            ExtentRec::Interior(rec) => rec.clusters,
        }
    }

    #[inline]
    pub fn end(&self) -> u32 {
        self.cpos() + self.clusters()
    }
}

/// Wire form of one record slot.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct RawExtentRec {
    cpos: U32,
    payload: [u8; 4],
    blkno: U64,
}

const _: () = assert!(size_of::<RawExtentRec>() == EXTENT_REC_SIZE);

impl RawExtentRec {
    pub fn zeroed() -> Self {
        Self {
            cpos: U32::ZERO,
            payload: [0; 4],
            blkno: U64::ZERO,
        }
    }

    #[inline]
    pub fn cpos(&self) -> u32 {
        self.cpos.get()
    }

    #[inline]
    pub fn blkno(&self) -> u64 {
        self.blkno.get()
    }

    #[inline]
    pub fn is_zeroed(&self) -> bool {
        self.cpos.get() == 0 && self.payload == [0; 4] && self.blkno.get() == 0
    }

    /// Cluster count without a full decode. Interior reads all four payload
    /// bytes; leaf reads the low two.
    #[inline]
    pub fn clusters_at_depth(&self, tree_depth: u16) -> u32 {
        if tree_depth == 0 {
            u16::from_le_bytes([self.payload[0], self.payload[1]]) as u32
        } else {
            u32::from_le_bytes(self.payload)
        }
    }

    pub fn decode(&self, tree_depth: u16) -> ExtentRec {
        if tree_depth == 0 {
            ExtentRec::Leaf(LeafRec {
                cpos: self.cpos.get(),
                clusters: u16::from_le_bytes([self.payload[0], self.payload[1]]),
                flags: RecFlags::from_bits_retain(self.payload[3]),
                blkno: self.blkno.get(),
            })
        } else {
            ExtentRec::Interior(InteriorRec {
                cpos: self.cpos.get(),
                clusters: u32::from_le_bytes(self.payload),
                blkno: self.blkno.get(),
            })
        }
    }

    pub fn from_leaf(rec: LeafRec) -> Self {
        let clusters = rec.clusters.to_le_bytes();
        Self {
            cpos: U32::new(rec.cpos),
            payload: [clusters[0], clusters[1], 0, rec.flags.bits()],
            blkno: U64::new(rec.blkno),
        }
    }

    pub fn from_interior(rec: InteriorRec) -> Self {
        Self {
            cpos: U32::new(rec.cpos),
            payload: rec.clusters.to_le_bytes(),
            blkno: U64::new(rec.blkno),
        }
    }

    pub fn encode(rec: ExtentRec) -> Self {
        match rec {
            ExtentRec::Leaf(leaf) => Self::from_leaf(leaf),
            ExtentRec::Interior(interior) => Self::from_interior(interior),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_roundtrip_preserves_fields() {
        let rec = LeafRec {
            cpos: 1024,
            clusters: 96,
            flags: RecFlags::UNWRITTEN,
            blkno: 0xdead_beef_cafe,
        };
        let raw = RawExtentRec::from_leaf(rec);
        assert_eq!(raw.decode(0), ExtentRec::Leaf(rec));
        assert_eq!(raw.clusters_at_depth(0), 96);
    }

    #[test]
    fn interior_roundtrip_preserves_fields() {
        let rec = InteriorRec {
            cpos: 7,
            clusters: 0x0102_0304,
            blkno: 42,
        };
        let raw = RawExtentRec::from_interior(rec);
        assert_eq!(raw.decode(3), ExtentRec::Interior(rec));
        assert_eq!(raw.clusters_at_depth(3), 0x0102_0304);
    }

    #[test]
    fn payload_bytes_follow_the_wire_layout() {
        let raw = RawExtentRec::from_leaf(LeafRec {
            cpos: 0,
            clusters: 0x0201,
            flags: RecFlags::UNWRITTEN,
            blkno: 0,
        });
        let bytes = raw.as_bytes();
        // LE u16 clusters, reserved zero, flags last.
        assert_eq!(&bytes[4..8], &[0x01, 0x02, 0x00, 0x01]);
    }

    #[test]
    fn same_bytes_decode_differently_by_depth() {
        let raw = RawExtentRec::from_interior(InteriorRec {
            cpos: 5,
            clusters: 0x0001_0000,
            blkno: 9,
        });
        // As an interior record this is 65536 clusters; a leaf decode of the
        // same slot sees the low u16 (zero) and a flag byte of zero.
        assert_eq!(raw.clusters_at_depth(2), 0x0001_0000);
        match raw.decode(0) {
            ExtentRec::Leaf(leaf) => {
                assert_eq!(leaf.clusters, 0);
                assert!(leaf.is_empty());
                assert_eq!(leaf.flags, RecFlags::empty());
            }
            ExtentRec::Interior(_) => panic!("depth 0 must decode as leaf"),
        }
    }

    #[test]
    fn empty_record_detection() {
        let rec = LeafRec::default();
        assert!(rec.is_empty());
        assert!(RawExtentRec::from_leaf(rec).is_zeroed());
        let full = LeafRec {
            cpos: 0,
            clusters: 1,
            flags: RecFlags::empty(),
            blkno: 8,
        };
        assert!(!full.is_empty());
    }
}
