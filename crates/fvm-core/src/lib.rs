#![forbid(unsafe_code)]
//! Core of the FVM slice-based volume manager.
//!
//! A physical device is divided into fixed-size slices; virtual partitions
//! are sparse sequences of virtual slices, each backed by some physical
//! slice. Three layers build that up:
//!
//! - [`extent`] — run-length-encoded per-partition slice maps;
//! - [`partition`] — [`VPartition`]: identity, slice bookkeeping, and
//!   translation of logical block I/O onto physical sub-requests;
//! - [`manager`] — [`VPartitionManager`]: the allocation tables, the
//!   partition table, and crash-atomic metadata persistence over two
//!   ping-ponging on-disk copies.

pub mod extent;
pub mod manager;
pub mod partition;

pub use extent::{SliceExtent, SliceMap};
pub use manager::VPartitionManager;
pub use partition::{PartitionIdentity, VPartition};
