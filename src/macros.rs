//! # Internal Macros
//!
//! Accessor generation for the on-disk structures in `ondisk/`. Every header
//! stored in a block keeps its multi-byte fields as little-endian wrapper
//! types (U16, U32, U64), and the hand-written `.get()`/`U32::new()` pairs add
//! up quickly across the record, list, extent-block, root, and truncate-log
//! formats.
//!
//! ## zerocopy_accessors!
//!
//! ```ignore
//! use zerocopy::little_endian::{U16, U64};
//!
//! #[repr(C)]
//! struct ListHeader {
//!     tree_depth: U16,
//!     next_free: U16,
//! }
//!
//! impl ListHeader {
//!     zerocopy_accessors! {
//!         tree_depth: u16,
//!         next_free: u16,
//!     }
//! }
//!
//! // Generates:
//! // pub fn tree_depth(&self) -> u16 { self.tree_depth.get() }
//! // pub fn set_tree_depth(&mut self, val: u16) { self.tree_depth = U16::new(val); }
//! // pub fn next_free(&self) -> u16 { self.next_free.get() }
//! // pub fn set_next_free(&mut self, val: u16) { self.next_free = U16::new(val); }
//! ```

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u16) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u16 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u16) {
                self.$field = ::zerocopy::little_endian::U16::new(val);
            }
        }
    };
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::little_endian::U32::new(val);
            }
        }
    };
    (@impl $field:ident, u64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u64) {
                self.$field = ::zerocopy::little_endian::U64::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}
