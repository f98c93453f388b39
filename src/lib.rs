//! # rimefs-alloc - Journaled Extent Allocation Trees
//!
//! rimefs-alloc is the allocation engine of a clustered volume: B-trees
//! of extent records map an owner's logical clusters to physical blocks,
//! every mutation runs inside a write-ahead journal transaction, and
//! freed space is reclaimed through deferred structures that survive a
//! crash. The implementation prioritizes:
//!
//! - **Journaled mutation**: every block is declared to the transaction
//!   before it changes and marked dirty after
//! - **Bounded structures**: fixed-capacity record lists, stack-held
//!   tree paths, no allocation on the mutation path
//! - **Corruption containment**: an invalid block degrades the volume to
//!   read-only instead of panicking
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use rimefs_alloc::config::Geometry;
//! use rimefs_alloc::error::VolumeHealth;
//! use rimefs_alloc::journal::{Journal, SyncMode};
//! use rimefs_alloc::ondisk::RecFlags;
//! use rimefs_alloc::store::MemStore;
//! use rimefs_alloc::tree::ExtentTree;
//!
//! let journal = Journal::create(
//!     "vol/journal",
//!     SyncMode::Data,
//!     Arc::new(VolumeHealth::new()),
//! )?;
//! let geom = Geometry::new(12, 15)?;
//! let mut store = MemStore::new(4096, 4096);
//!
//! let mut tree = ExtentTree::file(&mut store, &journal, geom, inode_blkno)?;
//! let mut txn = journal.begin(tree.insert_credits()?)?;
//! tree.insert(&mut txn, 0, first_blkno, 8, RecFlags::empty(), &meta)?;
//! journal.commit(txn, tree.store())?;
//! ```
//!
//! ## Architecture
//!
//! The crate is layered from the owner-facing handle down to raw blocks:
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │      ExtentTree (per-owner ops)      │
//! ├──────────────────────────────────────┤
//! │ Insert │ Merge │ Rotate │ Grow │ Cut │
//! ├──────────────────────────────────────┤
//! │    Path walking and record layout    │
//! ├──────────────────────────────────────┤
//! │ Journal (WAL) │ Suballoc │  Dealloc  │
//! ├──────────────────────────────────────┤
//! │      Block store (mmap/memory)       │
//! └──────────────────────────────────────┘
//! ```
//!
//! ## Volume Layout
//!
//! A mounted volume pairs one block image with one journal file:
//!
//! ```text
//! vol/
//! ├── volume.img   # Root headers, extent blocks, truncate log
//! └── journal      # Write-ahead journal, replayed at mount
//! ```
//!
//! ## Design Limits
//!
//! - Tree depth: at most five levels of extent blocks below the root
//! - Record: 16 bytes; one leaf record maps up to `u16::MAX` clusters
//! - Truncate log: one block, flushed before a removal would overflow it
//!
//! ## Module Overview
//!
//! - [`config`]: volume geometry and transaction credit formulas
//! - [`dealloc`]: truncate log and deferred metadata reclaim
//! - [`error`]: error taxonomy and volume health
//! - [`journal`]: block-level write-ahead journal
//! - [`ondisk`]: zero-copy on-disk structures
//! - [`store`]: block store trait with mmap and in-memory backends
//! - [`suballoc`]: cluster and metadata bitmap allocators
//! - [`tree`]: the extent tree engine

#[macro_use]
mod macros;

pub mod config;
pub mod dealloc;
pub mod error;
pub mod journal;
pub mod ondisk;
pub mod store;
pub mod suballoc;
pub mod tree;

pub use error::{Error, Result};
pub use tree::ExtentTree;
