//! # Extent Lists
//!
//! The record array inside every tree node, root or extent block. A 16-byte
//! header carries the node's depth tag, the slot capacity, and the used
//! count; the records follow densely to the end of the region.
//!
//! Two borrowed views wrap a list region: [`ListRef`] for reads and
//! [`ListMut`] for mutation. Construction validates the header against the
//! region size once; accessors after that only bounds-check indexes. The
//! views carry the block number they were read from purely for error
//! reporting.
//!
//! ## Ordering and the empty record
//!
//! Records are sorted ascending by `cpos`. Leaf lists may additionally hold
//! one zero-length record, always at index 0, which rotation uses as a
//! movable slot; [`ListMut::create_empty_head`] and
//! [`ListMut::remove_empty_head`] maintain that invariant, and
//! [`ListMut::rotate_in`] places a record into sorted position by consuming
//! the empty slot (or tail capacity) and shifting neighbors.

use std::mem::size_of;

use zerocopy::little_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{EXTENT_REC_SIZE, LIST_HEADER_SIZE, MAX_TREE_DEPTH};
use crate::error::{Error, Result};
use crate::ondisk::record::{ExtentRec, InteriorRec, LeafRec, RawExtentRec};

/// Number of record slots that fit in `space` bytes of list region.
pub fn list_capacity(space: usize) -> u16 {
    let slots = space.saturating_sub(LIST_HEADER_SIZE) / EXTENT_REC_SIZE;
    slots.min(u16::MAX as usize) as u16
}

#[derive(Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct ListHeader {
    tree_depth: U16,
    count: U16,
    next_free: U16,
    pad: U16,
    reserved: [u8; 8],
}

const _: () = assert!(size_of::<ListHeader>() == LIST_HEADER_SIZE);

impl ListHeader {
    zerocopy_accessors! {
        tree_depth: u16,
        count: u16,
        next_free: u16,
    }
}

fn rec_offset(idx: usize) -> usize {
    LIST_HEADER_SIZE + idx * EXTENT_REC_SIZE
}

fn validate(data: &[u8], blkno: u64) -> Result<()> {
    if data.len() < LIST_HEADER_SIZE {
        return Err(Error::corrupt(blkno, "block too small for an extent list"));
    }
    let header = ListHeader::ref_from_bytes(&data[..LIST_HEADER_SIZE])
        .map_err(|_| Error::invariant("extent list header cast failed"))?;
    let depth = header.tree_depth();
    let count = header.count() as usize;
    let next_free = header.next_free() as usize;
    if depth as usize > MAX_TREE_DEPTH {
        return Err(Error::corrupt(
            blkno,
            format!("depth tag {} exceeds maximum {}", depth, MAX_TREE_DEPTH),
        ));
    }
    if count == 0 {
        return Err(Error::corrupt(blkno, "extent list has zero capacity"));
    }
    if rec_offset(count) > data.len() {
        return Err(Error::corrupt(
            blkno,
            format!("record capacity {} overruns the node", count),
        ));
    }
    if next_free > count {
        return Err(Error::corrupt(
            blkno,
            format!("used count {} exceeds capacity {}", next_free, count),
        ));
    }
    Ok(())
}

/// Read-only view of a list region.
#[derive(Clone, Copy)]
pub struct ListRef<'a> {
    data: &'a [u8],
    blkno: u64,
}

impl<'a> ListRef<'a> {
    pub fn new(data: &'a [u8], blkno: u64) -> Result<Self> {
        validate(data, blkno)?;
        Ok(Self { data, blkno })
    }

    fn header(&self) -> &ListHeader {
        // Length was validated in new().
        ListHeader::ref_from_bytes(&self.data[..LIST_HEADER_SIZE]).unwrap()
    }

    #[inline]
    pub fn blkno(&self) -> u64 {
        self.blkno
    }

    #[inline]
    pub fn tree_depth(&self) -> u16 {
        self.header().tree_depth()
    }

    #[inline]
    pub fn count(&self) -> u16 {
        self.header().count()
    }

    #[inline]
    pub fn next_free(&self) -> u16 {
        self.header().next_free()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.next_free() == self.count()
    }

    #[inline]
    pub fn free_records(&self) -> u16 {
        self.count() - self.next_free()
    }

    /// Index of the last used slot, if any.
    pub fn last_index(&self) -> Option<usize> {
        match self.next_free() {
            0 => None,
            n => Some(n as usize - 1),
        }
    }

    pub fn raw(&self, idx: usize) -> Result<RawExtentRec> {
        if idx >= self.count() as usize {
            return Err(Error::invariant(format!(
                "record index {} out of bounds for capacity {}",
                idx,
                self.count()
            )));
        }
        let off = rec_offset(idx);
        RawExtentRec::ref_from_bytes(&self.data[off..off + EXTENT_REC_SIZE])
            .map(|raw| *raw)
            .map_err(|_| Error::invariant("extent record cast failed"))
    }

    pub fn rec(&self, idx: usize) -> Result<ExtentRec> {
        Ok(self.raw(idx)?.decode(self.tree_depth()))
    }

    pub fn leaf_rec(&self, idx: usize) -> Result<LeafRec> {
        match self.rec(idx)? {
            ExtentRec::Leaf(rec) => Ok(rec),
            ExtentRec::Interior(_) => Err(Error::invariant(
                "leaf record requested from an interior list",
            )),
        }
    }

    pub fn interior_rec(&self, idx: usize) -> Result<InteriorRec> {
        match self.rec(idx)? {
            ExtentRec::Interior(rec) => Ok(rec),
            ExtentRec::Leaf(_) => Err(Error::invariant(
                "interior record requested from a leaf list",
            )),
        }
    }

    pub fn rec_cpos(&self, idx: usize) -> Result<u32> {
        Ok(self.raw(idx)?.cpos())
    }

    pub fn rec_blkno(&self, idx: usize) -> Result<u64> {
        Ok(self.raw(idx)?.blkno())
    }

    pub fn rec_clusters(&self, idx: usize) -> Result<u32> {
        Ok(self.raw(idx)?.clusters_at_depth(self.tree_depth()))
    }

    /// First cluster past the range of the record at `idx`.
    pub fn rec_end(&self, idx: usize) -> Result<u32> {
        let raw = self.raw(idx)?;
        Ok(raw.cpos() + raw.clusters_at_depth(self.tree_depth()))
    }

    /// True when a leaf list's slot 0 holds the empty placeholder record.
    pub fn has_empty_head(&self) -> bool {
        if self.tree_depth() != 0 || self.next_free() == 0 {
            return false;
        }
        match self.raw(0) {
            Ok(raw) => raw.clusters_at_depth(0) == 0,
            Err(_) => false,
        }
    }

    /// End of the range covered by the rightmost used record.
    pub fn range_end(&self) -> Result<u32> {
        match self.last_index() {
            Some(idx) => self.rec_end(idx),
            None => Err(Error::corrupt(self.blkno, "extent list has no records")),
        }
    }

    /// Leaf search: index of the used record whose range contains `cpos`.
    /// Empty records contain nothing.
    pub fn search(&self, cpos: u32) -> Option<usize> {
        for idx in 0..self.next_free() as usize {
            let Ok(raw) = self.raw(idx) else {
                return None;
            };
            let start = raw.cpos();
            let clusters = raw.clusters_at_depth(self.tree_depth());
            if cpos >= start && cpos < start + clusters {
                return Some(idx);
            }
        }
        None
    }
}

/// Mutable view of a list region.
pub struct ListMut<'a> {
    data: &'a mut [u8],
    blkno: u64,
}

impl<'a> ListMut<'a> {
    pub fn new(data: &'a mut [u8], blkno: u64) -> Result<Self> {
        validate(data, blkno)?;
        Ok(Self { data, blkno })
    }

    /// Stamp a fresh list over `data`: zero the whole region and write a
    /// header with the given depth and capacity.
    pub fn init(data: &'a mut [u8], blkno: u64, tree_depth: u16, capacity: u16) -> Result<Self> {
        if capacity == 0 || rec_offset(capacity as usize) > data.len() {
            return Err(Error::invariant(format!(
                "list capacity {} does not fit a {}-byte region",
                capacity,
                data.len()
            )));
        }
        if tree_depth as usize > MAX_TREE_DEPTH {
            return Err(Error::invariant(format!(
                "list depth {} exceeds maximum {}",
                tree_depth, MAX_TREE_DEPTH
            )));
        }
        data.fill(0);
        let mut list = Self { data, blkno };
        let header = list.header_mut();
        header.set_tree_depth(tree_depth);
        header.set_count(capacity);
        header.set_next_free(0);
        Ok(list)
    }

    pub fn as_ref(&self) -> ListRef<'_> {
        ListRef {
            data: self.data,
            blkno: self.blkno,
        }
    }

    fn header_mut(&mut self) -> &mut ListHeader {
        // Length was validated in new()/init().
        ListHeader::mut_from_bytes(&mut self.data[..LIST_HEADER_SIZE]).unwrap()
    }

    #[inline]
    pub fn tree_depth(&self) -> u16 {
        self.as_ref().tree_depth()
    }

    #[inline]
    pub fn count(&self) -> u16 {
        self.as_ref().count()
    }

    #[inline]
    pub fn next_free(&self) -> u16 {
        self.as_ref().next_free()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.as_ref().is_full()
    }

    pub fn raw(&self, idx: usize) -> Result<RawExtentRec> {
        self.as_ref().raw(idx)
    }

    pub fn rec(&self, idx: usize) -> Result<ExtentRec> {
        self.as_ref().rec(idx)
    }

    pub fn leaf_rec(&self, idx: usize) -> Result<LeafRec> {
        self.as_ref().leaf_rec(idx)
    }

    pub fn interior_rec(&self, idx: usize) -> Result<InteriorRec> {
        self.as_ref().interior_rec(idx)
    }

    pub fn has_empty_head(&self) -> bool {
        self.as_ref().has_empty_head()
    }

    pub fn set_tree_depth(&mut self, depth: u16) -> Result<()> {
        if depth as usize > MAX_TREE_DEPTH {
            return Err(Error::invariant(format!(
                "list depth {} exceeds maximum {}",
                depth, MAX_TREE_DEPTH
            )));
        }
        self.header_mut().set_tree_depth(depth);
        Ok(())
    }

    pub fn set_next_free(&mut self, next_free: u16) -> Result<()> {
        if next_free > self.count() {
            return Err(Error::invariant(format!(
                "used count {} exceeds capacity {}",
                next_free,
                self.count()
            )));
        }
        self.header_mut().set_next_free(next_free);
        Ok(())
    }

    pub fn set_raw(&mut self, idx: usize, raw: RawExtentRec) -> Result<()> {
        if idx >= self.count() as usize {
            return Err(Error::invariant(format!(
                "record index {} out of bounds for capacity {}",
                idx,
                self.count()
            )));
        }
        let off = rec_offset(idx);
        self.data[off..off + EXTENT_REC_SIZE].copy_from_slice(raw.as_bytes());
        Ok(())
    }

    pub fn set_leaf_rec(&mut self, idx: usize, rec: LeafRec) -> Result<()> {
        if self.tree_depth() != 0 {
            return Err(Error::invariant("leaf record written to an interior list"));
        }
        self.set_raw(idx, RawExtentRec::from_leaf(rec))
    }

    pub fn set_interior_rec(&mut self, idx: usize, rec: InteriorRec) -> Result<()> {
        if self.tree_depth() == 0 {
            return Err(Error::invariant("interior record written to a leaf list"));
        }
        self.set_raw(idx, RawExtentRec::from_interior(rec))
    }

    pub fn clear_rec(&mut self, idx: usize) -> Result<()> {
        self.set_raw(idx, RawExtentRec::zeroed())
    }

    /// Append a raw record at the next free slot.
    pub fn push_raw(&mut self, raw: RawExtentRec) -> Result<usize> {
        if self.is_full() {
            return Err(Error::invariant("append to a full extent list"));
        }
        let idx = self.next_free() as usize;
        self.set_raw(idx, raw)?;
        self.set_next_free(idx as u16 + 1)?;
        Ok(idx)
    }

    pub fn push_leaf(&mut self, rec: LeafRec) -> Result<usize> {
        if self.tree_depth() != 0 {
            return Err(Error::invariant("leaf record written to an interior list"));
        }
        self.push_raw(RawExtentRec::from_leaf(rec))
    }

    pub fn push_interior(&mut self, rec: InteriorRec) -> Result<usize> {
        if self.tree_depth() == 0 {
            return Err(Error::invariant("interior record written to a leaf list"));
        }
        self.push_raw(RawExtentRec::from_interior(rec))
    }

    fn copy_rec(&mut self, from: usize, to: usize) {
        let src = rec_offset(from);
        let dst = rec_offset(to);
        self.data
            .copy_within(src..src + EXTENT_REC_SIZE, dst);
    }

    /// Open the empty placeholder at slot 0 of a leaf, shifting used records
    /// right. No-op when the head is already empty.
    pub fn create_empty_head(&mut self) -> Result<()> {
        if self.tree_depth() != 0 {
            return Err(Error::invariant(
                "empty record creation on an interior list",
            ));
        }
        let next_free = self.next_free() as usize;
        if next_free == 0 {
            self.clear_rec(0)?;
            return self.set_next_free(1);
        }
        if self.has_empty_head() {
            return Ok(());
        }
        if self.is_full() {
            return Err(Error::invariant(
                "empty record creation in a full extent list",
            ));
        }
        for idx in (0..next_free).rev() {
            self.copy_rec(idx, idx + 1);
        }
        self.clear_rec(0)?;
        self.set_next_free(next_free as u16 + 1)
    }

    /// Drop the empty placeholder from slot 0 of a leaf, shifting used
    /// records left. No-op when the head is not empty.
    pub fn remove_empty_head(&mut self) -> Result<()> {
        if self.next_free() == 0 {
            return Err(Error::invariant(
                "empty record removal from a list with no records",
            ));
        }
        if !self.has_empty_head() {
            return Ok(());
        }
        let remaining = self.next_free() as usize - 1;
        for idx in 0..remaining {
            self.copy_rec(idx + 1, idx);
        }
        self.clear_rec(remaining)?;
        self.set_next_free(remaining as u16)
    }

    /// Place `rec` into sorted position in a leaf that has room, either from
    /// the empty head slot or from tail capacity. Neighbors shift as needed.
    pub fn rotate_in(&mut self, rec: LeafRec) -> Result<()> {
        if self.tree_depth() != 0 {
            return Err(Error::invariant("sorted insert into an interior list"));
        }
        let mut next_free = self.next_free() as usize;
        if next_free == 0 {
            return Err(Error::invariant("sorted insert into an empty leaf"));
        }
        let has_empty = self.has_empty_head();
        if self.is_full() && !has_empty {
            return Err(Error::invariant("sorted insert into a full leaf"));
        }

        // Consuming the empty head first makes the index math uniform.
        if has_empty {
            for idx in 0..next_free - 1 {
                self.copy_rec(idx + 1, idx);
            }
            next_free -= 1;
        }

        let mut insert_index = next_free;
        for idx in 0..next_free {
            if rec.cpos < self.as_ref().rec_cpos(idx)? {
                insert_index = idx;
                break;
            }
        }

        if insert_index != next_free {
            for idx in (insert_index..next_free).rev() {
                self.copy_rec(idx, idx + 1);
            }
        }

        self.set_next_free(next_free as u16 + 1)?;
        self.set_leaf_rec(insert_index, rec)
    }
}
