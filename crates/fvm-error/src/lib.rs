#![forbid(unsafe_code)]
//! Error types for the FVM volume manager.
//!
//! # Error Taxonomy
//!
//! | Class | Variant(s) | Detected | State touched |
//! |-------|------------|----------|---------------|
//! | Invalid argument | `InvalidArgs`, `OutOfRange` | synchronously, before mutation | none |
//! | Resource exhaustion | `NoSpace`, `NoMemory` | mid-operation | rolled back per call |
//! | Bad state | `BadState` | synchronously | none |
//! | I/O | `Io` | device read/write | load aborts; persist rolls back |
//! | Corruption | `Corruption`, `Format` | metadata validation | load fails |
//!
//! Parse-layer failures (`fvm_types::ParseError`) convert into `FvmError` at
//! the crate boundary in `fvm-ondisk`/`fvm-core`; `fvm-error` stays free of
//! format dependencies to avoid cycles.
//!
//! All failures propagate as synchronous `Result` returns up through the
//! request-dispatch boundary — nothing unwinds, nothing silently retries.
//! The external driver glue translates them via [`FvmError::to_errno`].

use thiserror::Error;

/// Unified error type for all FVM operations.
#[derive(Debug, Error)]
pub enum FvmError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Caller-supplied slice or block range violates a documented bound,
    /// or a data-path request touches an unallocated virtual slice.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// Caller-supplied arguments are structurally invalid (zero counts,
    /// overflowing ranges, oversized names).
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    /// No free physical slice or partition-table entry remains.
    #[error("no space left on device")]
    NoSpace,

    /// Growing an in-memory extent failed (`try_reserve`).
    ///
    /// Any partial progress made by the same call has been rolled back.
    #[error("out of memory")]
    NoMemory,

    /// Operation attempted against a killed partition or an unloaded manager.
    #[error("bad state: {0}")]
    BadState(String),

    /// Both metadata copies failed validation, or live metadata is
    /// internally inconsistent (double-mapped slice, table out of bounds).
    #[error("metadata corruption: {0}")]
    Corruption(String),

    /// The superblock is structurally wrong for this build (bad magic,
    /// unsupported version, slice size not a multiple of the block size).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Invariant violation that indicates a bug in FVM itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl FvmError {
    /// Convert this error into a POSIX errno for the dispatch boundary.
    ///
    /// The mapping is exhaustive — adding a variant without an arm here is
    /// a compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::OutOfRange(_) => libc::ERANGE,
            Self::InvalidArgs(_) => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NoMemory => libc::ENOMEM,
            Self::BadState(_) => libc::EBADF,
            Self::Corruption(_) | Self::Internal(_) => libc::EIO,
            Self::Format(_) => libc::EINVAL,
        }
    }
}

/// Result alias using `FvmError`.
pub type Result<T> = std::result::Result<T, FvmError>;
