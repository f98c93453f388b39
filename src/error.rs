//! # Error Types
//!
//! Every fallible path in the crate returns [`Error`] through the [`Result`]
//! alias. The variants fall into three classes with different caller
//! contracts:
//!
//! - **Corruption** ([`Error::Corrupt`]): the bytes on disk are wrong (bad
//!   signature, zero physical pointer, depth or count mismatch, checksum
//!   failure). The volume is flagged degraded (see [`VolumeHealth`]) and the
//!   caller should treat the filesystem as read-only from then on.
//! - **Invariant violations** ([`Error::Invariant`]): states that are
//!   impossible given correct construction, such as a full interior list
//!   receiving another record or two paths that do not share a root. These
//!   indicate a bug in the calling sequence, never a disk problem, and are
//!   not retryable.
//! - **Resource exhaustion** ([`Error::NoSpace`], [`Error::NoCredits`],
//!   [`Error::LogFull`]): retryable after the caller frees space, extends or
//!   restarts the transaction, or flushes the truncate log.

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk bytes failed validation. The volume gets flagged degraded by
    /// the operation that hit this.
    #[error("corruption at block {blkno}: {reason}")]
    Corrupt { blkno: u64, reason: String },

    /// A state that correct callers can never produce.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// The relevant suballocator has no free clusters or metadata bits left.
    #[error("out of space")]
    NoSpace,

    /// The open transaction cannot cover another block without extending.
    #[error("transaction credits exhausted: needed {needed}, available {available}")]
    NoCredits { needed: u32, available: u32 },

    /// The on-disk truncate log is at capacity; flush it and retry.
    #[error("truncate log is full")]
    LogFull,

    /// The volume was degraded by an earlier corruption report; mutating
    /// operations are refused.
    #[error("volume is read-only after a corruption report")]
    ReadOnly,

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
}

impl Error {
    pub fn corrupt(blkno: u64, reason: impl Into<String>) -> Self {
        Error::Corrupt {
            blkno,
            reason: reason.into(),
        }
    }

    pub fn invariant(reason: impl Into<String>) -> Self {
        Error::Invariant(reason.into())
    }

    /// True for the exhaustion class: the same call can succeed after the
    /// caller releases or acquires resources.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NoSpace | Error::NoCredits { .. } | Error::LogFull
        )
    }
}

/// Volume-wide degrade signal.
///
/// Corruption detected anywhere in the tree trips this flag; the journal
/// refuses to open new transactions on a degraded volume. The flag is a plain
/// atomic so it can be shared between the tree, the journal, and recovery
/// code without locking.
#[derive(Debug, Default)]
pub struct VolumeHealth {
    degraded: AtomicBool,
}

impl VolumeHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn degrade(&self) {
        self.degraded.store(true, Ordering::Release);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::NoSpace.is_retryable());
        assert!(Error::LogFull.is_retryable());
        assert!(Error::NoCredits {
            needed: 4,
            available: 1
        }
        .is_retryable());
        assert!(!Error::corrupt(9, "bad signature").is_retryable());
        assert!(!Error::invariant("full list").is_retryable());
        assert!(!Error::ReadOnly.is_retryable());
    }

    #[test]
    fn health_flag_latches() {
        let health = VolumeHealth::new();
        assert!(!health.is_degraded());
        health.degrade();
        assert!(health.is_degraded());
        health.degrade();
        assert!(health.is_degraded());
    }
}
