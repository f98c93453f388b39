//! # Root Containers
//!
//! Four owner structures embed an extent tree root. Each keeps its own
//! header format at the start of the root block; the root extent list
//! starts immediately after the header and runs to the end of the block.
//!
//! | format      | header | owner fields                          |
//! |-------------|--------|---------------------------------------|
//! | `File`      | 64 B   | clusters, last_leaf_blk               |
//! | `AttrValue` | 56 B   | clusters, last_leaf_blk               |
//! | `AttrTree`  | 64 B   | clusters, max_leaf_clusters, last_leaf_blk |
//! | `DirIndex`  | 64 B   | clusters, last_leaf_blk               |
//!
//! All four share a 24-byte prefix of signature, check word, filesystem
//! generation, and self-address echo, so the sealed-block check in
//! [`super::block`] applies to roots unchanged. The tree engine itself
//! never touches these headers directly; the per-owner vtable in the tree
//! module reads and writes them on the engine's behalf.

use std::mem::size_of;

use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{
    ATTR_TREE_LEAF_MAX_BYTES, ATTR_TREE_ROOT_HEADER_SIZE, ATTR_TREE_ROOT_SIG,
    ATTR_VALUE_ROOT_HEADER_SIZE, ATTR_VALUE_ROOT_SIG, DIR_INDEX_ROOT_HEADER_SIZE,
    DIR_INDEX_ROOT_SIG, EXTENT_REC_SIZE, FILE_ROOT_HEADER_SIZE, FILE_ROOT_SIG, LIST_HEADER_SIZE,
};
use crate::error::{Error, Result};
use crate::ondisk::list::{list_capacity, ListMut, ListRef};

/// Which owner format a root block carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootFormat {
    File,
    AttrValue,
    AttrTree,
    DirIndex,
}

impl RootFormat {
    pub const fn signature(self) -> &'static [u8; 8] {
        match self {
            RootFormat::File => FILE_ROOT_SIG,
            RootFormat::AttrValue => ATTR_VALUE_ROOT_SIG,
            RootFormat::AttrTree => ATTR_TREE_ROOT_SIG,
            RootFormat::DirIndex => DIR_INDEX_ROOT_SIG,
        }
    }

    pub const fn header_size(self) -> usize {
        match self {
            RootFormat::File => FILE_ROOT_HEADER_SIZE,
            RootFormat::AttrValue => ATTR_VALUE_ROOT_HEADER_SIZE,
            RootFormat::AttrTree => ATTR_TREE_ROOT_HEADER_SIZE,
            RootFormat::DirIndex => DIR_INDEX_ROOT_HEADER_SIZE,
        }
    }

    /// Byte offset of the embedded extent list in the root block.
    pub const fn list_offset(self) -> usize {
        self.header_size()
    }
}

/// Clusters covered by the widest attribute tree leaf under `cluster_shift`.
pub fn max_attr_leaf_clusters(cluster_shift: u8) -> u32 {
    let clusters = (ATTR_TREE_LEAF_MAX_BYTES >> cluster_shift) as u32;
    clusters.max(1)
}

/// Byte offset of the self-address echo in the shared prefix.
const ECHO_OFFSET: usize = 16;

fn validate(data: &[u8], blkno: u64, format: RootFormat) -> Result<()> {
    let header_size = format.header_size();
    if data.len() < header_size + LIST_HEADER_SIZE {
        return Err(Error::corrupt(blkno, "block too small for a root container"));
    }
    if &data[..8] != format.signature() {
        return Err(Error::corrupt(blkno, "bad root container signature"));
    }
    let mut echo = [0u8; 8];
    echo.copy_from_slice(&data[ECHO_OFFSET..ECHO_OFFSET + 8]);
    let echo = u64::from_le_bytes(echo);
    if echo != blkno {
        return Err(Error::corrupt(
            blkno,
            format!("root claims address {}", echo),
        ));
    }
    ListRef::new(&data[header_size..], blkno)?;
    Ok(())
}

/// Zero the header area, stamp signature and self-address, and lay down an
/// empty depth-0 list over the rest of the block.
fn init_root(data: &mut [u8], blkno: u64, format: RootFormat) -> Result<()> {
    let header_size = format.header_size();
    if data.len() < header_size + LIST_HEADER_SIZE + EXTENT_REC_SIZE {
        return Err(Error::invariant(
            "block too small to format as a root container",
        ));
    }
    data[..header_size].fill(0);
    data[..8].copy_from_slice(format.signature());
    data[ECHO_OFFSET..ECHO_OFFSET + 8].copy_from_slice(&blkno.to_le_bytes());
    let capacity = list_capacity(data.len() - header_size);
    ListMut::init(&mut data[header_size..], blkno, 0, capacity)?;
    Ok(())
}

macro_rules! root_constructors {
    ($format:expr, $size:expr) => {
        pub fn from_bytes(data: &[u8], blkno: u64) -> Result<&Self> {
            validate(data, blkno, $format)?;
            Self::ref_from_bytes(&data[..$size])
                .map_err(|_| Error::invariant("root header cast failed"))
        }

        pub fn from_bytes_mut(data: &mut [u8], blkno: u64) -> Result<&mut Self> {
            validate(data, blkno, $format)?;
            Self::mut_from_bytes(&mut data[..$size])
                .map_err(|_| Error::invariant("root header cast failed"))
        }
    };
}

/// Root header of a file's cluster map.
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct FileRootHeader {
    signature: [u8; 8],
    check: U32,
    fs_generation: U32,
    blkno: U64,
    clusters: U32,
    pad: U32,
    last_leaf_blk: U64,
    reserved: [u8; 24],
}

const _: () = assert!(size_of::<FileRootHeader>() == FILE_ROOT_HEADER_SIZE);

impl FileRootHeader {
    zerocopy_accessors! {
        fs_generation: u32,
        blkno: u64,
        clusters: u32,
        last_leaf_blk: u64,
    }

    root_constructors!(RootFormat::File, FILE_ROOT_HEADER_SIZE);

    pub fn init(data: &mut [u8], blkno: u64, fs_generation: u32) -> Result<()> {
        init_root(data, blkno, RootFormat::File)?;
        let header = Self::from_bytes_mut(data, blkno)?;
        header.set_fs_generation(fs_generation);
        Ok(())
    }
}

/// Root header of an attribute value's cluster map. The shortest of the
/// four root formats; values rarely grow past a handful of extents.
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct AttrValueRootHeader {
    signature: [u8; 8],
    check: U32,
    fs_generation: U32,
    blkno: U64,
    clusters: U32,
    pad: U32,
    last_leaf_blk: U64,
    reserved: [u8; 16],
}

const _: () = assert!(size_of::<AttrValueRootHeader>() == ATTR_VALUE_ROOT_HEADER_SIZE);

impl AttrValueRootHeader {
    zerocopy_accessors! {
        fs_generation: u32,
        blkno: u64,
        clusters: u32,
        last_leaf_blk: u64,
    }

    root_constructors!(RootFormat::AttrValue, ATTR_VALUE_ROOT_HEADER_SIZE);

    pub fn init(data: &mut [u8], blkno: u64, fs_generation: u32) -> Result<()> {
        init_root(data, blkno, RootFormat::AttrValue)?;
        let header = Self::from_bytes_mut(data, blkno)?;
        header.set_fs_generation(fs_generation);
        Ok(())
    }
}

/// Root header of the attribute index tree. Carries the cap on how many
/// clusters one leaf may cover, fixed at initialization from the cluster
/// size.
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct AttrTreeRootHeader {
    signature: [u8; 8],
    check: U32,
    fs_generation: U32,
    blkno: U64,
    clusters: U32,
    max_leaf_clusters: U32,
    last_leaf_blk: U64,
    reserved: [u8; 24],
}

const _: () = assert!(size_of::<AttrTreeRootHeader>() == ATTR_TREE_ROOT_HEADER_SIZE);

impl AttrTreeRootHeader {
    zerocopy_accessors! {
        fs_generation: u32,
        blkno: u64,
        clusters: u32,
        max_leaf_clusters: u32,
        last_leaf_blk: u64,
    }

    root_constructors!(RootFormat::AttrTree, ATTR_TREE_ROOT_HEADER_SIZE);

    pub fn init(data: &mut [u8], blkno: u64, fs_generation: u32, cluster_shift: u8) -> Result<()> {
        init_root(data, blkno, RootFormat::AttrTree)?;
        let header = Self::from_bytes_mut(data, blkno)?;
        header.set_fs_generation(fs_generation);
        header.set_max_leaf_clusters(max_attr_leaf_clusters(cluster_shift));
        Ok(())
    }
}

/// Root header of a directory's lookup index.
#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct DirIndexRootHeader {
    signature: [u8; 8],
    check: U32,
    fs_generation: U32,
    blkno: U64,
    clusters: U32,
    pad: U32,
    last_leaf_blk: U64,
    reserved: [u8; 24],
}

const _: () = assert!(size_of::<DirIndexRootHeader>() == DIR_INDEX_ROOT_HEADER_SIZE);

impl DirIndexRootHeader {
    zerocopy_accessors! {
        fs_generation: u32,
        blkno: u64,
        clusters: u32,
        last_leaf_blk: u64,
    }

    root_constructors!(RootFormat::DirIndex, DIR_INDEX_ROOT_HEADER_SIZE);

    pub fn init(data: &mut [u8], blkno: u64, fs_generation: u32) -> Result<()> {
        init_root(data, blkno, RootFormat::DirIndex)?;
        let header = Self::from_bytes_mut(data, blkno)?;
        header.set_fs_generation(fs_generation);
        Ok(())
    }
}
