//! Virtual partitions.
//!
//! A [`VPartition`] owns one partition's identity and slice map and
//! translates the partition's contiguous logical block space onto the
//! possibly-discontiguous physical slices backing it. Translation happens
//! under the partition lock; the produced physical sub-requests are handed
//! to the block transport with no lock held, and the partition lock is
//! never held across a completion callback.
//!
//! Lock ordering: the manager lock is always acquired before a partition
//! lock. Methods here that the manager calls during allocate/free run with
//! the manager lock already held and only take the partition's own lock.

use crate::extent::SliceMap;
use fvm_block::{BlockInfo, BlockOp, BlockRequest, BlockTransport, Completion};
use fvm_error::{FvmError, Result};
use fvm_ondisk::Geometry;
use fvm_types::{Guid, PartitionIndex, Pslice, Vslice};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Identity snapshot returned by the GUID/name queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionIdentity {
    pub index: PartitionIndex,
    pub type_guid: Guid,
    pub guid: Guid,
    pub name: String,
}

struct PartitionInner {
    /// 0 once the partition has been killed; one-way.
    entry_index: PartitionIndex,
    type_guid: Guid,
    guid: Guid,
    name: String,
    map: SliceMap,
    /// Committed size in device blocks, mirrored for `info()`.
    block_count: u64,
}

/// One virtual partition.
pub struct VPartition {
    transport: Arc<dyn BlockTransport>,
    slice_size: u64,
    block_size: u32,
    blocks_per_slice: u64,
    /// First data-region block (past both metadata copies).
    data_start_block: u64,
    vslice_max: u64,
    inner: Mutex<PartitionInner>,
}

impl std::fmt::Debug for VPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("VPartition")
            .field("entry_index", &inner.entry_index)
            .field("name", &inner.name)
            .field("slices", &inner.map.slice_count())
            .finish_non_exhaustive()
    }
}

impl VPartition {
    /// Construct a live partition from its table entry identity.
    pub fn new(
        geometry: &Geometry,
        transport: Arc<dyn BlockTransport>,
        index: PartitionIndex,
        type_guid: Guid,
        guid: Guid,
        name: String,
    ) -> Result<Arc<Self>> {
        if index.is_reserved() {
            return Err(FvmError::InvalidArgs(
                "partition index 0 is reserved".into(),
            ));
        }
        let blocks_per_slice = geometry.slice_size / u64::from(geometry.block_size);
        Ok(Arc::new(Self {
            transport,
            slice_size: geometry.slice_size,
            block_size: geometry.block_size,
            blocks_per_slice,
            data_start_block: (geometry.metadata_size * 2) / u64::from(geometry.block_size),
            vslice_max: geometry.vslice_max(),
            inner: Mutex::new(PartitionInner {
                entry_index: index,
                type_guid,
                guid,
                name,
                map: SliceMap::new(),
                block_count: 0,
            }),
        }))
    }

    /// Maximum virtual slice index (exclusive).
    #[must_use]
    pub fn vslice_max(&self) -> u64 {
        self.vslice_max
    }

    /// Maximum size this partition could grow to, in bytes.
    ///
    /// This is potential, not committed: callers wanting the currently
    /// backed size use [`VPartition::info`].
    #[must_use]
    pub fn max_size_bytes(&self) -> u64 {
        self.vslice_max * self.slice_size
    }

    /// Committed geometry (`GET_INFO`): block size and currently backed
    /// block count.
    #[must_use]
    pub fn info(&self) -> BlockInfo {
        let inner = self.inner.lock();
        BlockInfo {
            block_size: self.block_size,
            block_count: inner.block_count,
        }
    }

    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.inner.lock().entry_index.is_reserved()
    }

    /// Identity queries (`GET_TYPE_GUID` / `GET_PARTITION_GUID` / `GET_NAME`).
    pub fn identity(&self) -> Result<PartitionIdentity> {
        let inner = self.inner.lock();
        if inner.entry_index.is_reserved() {
            return Err(FvmError::BadState("partition has been killed".into()));
        }
        Ok(PartitionIdentity {
            index: inner.entry_index,
            type_guid: inner.type_guid,
            guid: inner.guid,
            name: inner.name.clone(),
        })
    }

    /// Table index while live.
    pub fn entry_index(&self) -> Result<PartitionIndex> {
        let inner = self.inner.lock();
        if inner.entry_index.is_reserved() {
            return Err(FvmError::BadState("partition has been killed".into()));
        }
        Ok(inner.entry_index)
    }

    /// Report how many consecutive virtual slices starting at
    /// `vslice_start` share its allocation status, and that status.
    pub fn check_slices(&self, vslice_start: Vslice) -> Result<(u64, bool)> {
        if vslice_start.0 >= self.vslice_max {
            return Err(FvmError::OutOfRange(format!(
                "vslice {vslice_start} >= vslice_max {}",
                self.vslice_max
            )));
        }
        let inner = self.inner.lock();
        if inner.entry_index.is_reserved() {
            return Err(FvmError::BadState("partition has been killed".into()));
        }
        Ok(inner.map.range_status(vslice_start, self.vslice_max))
    }

    /// Physical slice backing `vslice`, or the free sentinel.
    pub fn slice_get(&self, vslice: Vslice) -> Result<Pslice> {
        let inner = self.inner.lock();
        if inner.entry_index.is_reserved() {
            return Err(FvmError::BadState("partition has been killed".into()));
        }
        Ok(inner.map.get(vslice))
    }

    /// Record a newly allocated mapping and grow the committed size.
    ///
    /// Caller (the manager, holding its own lock) has already verified the
    /// vslice is unallocated.
    pub fn slice_set(&self, vslice: Vslice, pslice: Pslice) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.entry_index.is_reserved() {
            return Err(FvmError::BadState("partition has been killed".into()));
        }
        inner.map.slice_set(vslice, pslice)?;
        inner.block_count += self.blocks_per_slice;
        Ok(())
    }

    /// Free one virtual slice and shrink the committed size.
    ///
    /// A mid-extent free can fail with `NoMemory`; the slice then remains
    /// allocated and the committed size is untouched.
    pub fn slice_free(&self, vslice: Vslice) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.entry_index.is_reserved() {
            return Err(FvmError::BadState("partition has been killed".into()));
        }
        inner.map.slice_free(vslice)?;
        inner.block_count -= self.blocks_per_slice;
        Ok(())
    }

    /// Remove the entire extent containing `vslice`, adjusting the
    /// committed size in one step instead of slice-by-slice. Returns how
    /// many slices it covered.
    pub fn extent_destroy(&self, vslice: Vslice) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.entry_index.is_reserved() {
            return Err(FvmError::BadState("partition has been killed".into()));
        }
        let released = inner.map.extent_destroy(vslice).ok_or_else(|| {
            FvmError::OutOfRange(format!("no extent contains vslice {vslice}"))
        })?;
        inner.block_count -= released * self.blocks_per_slice;
        Ok(released)
    }

    /// Every current `(vslice, pslice)` mapping, ascending.
    pub fn mappings(&self) -> Result<Vec<(Vslice, Pslice)>> {
        let inner = self.inner.lock();
        if inner.entry_index.is_reserved() {
            return Err(FvmError::BadState("partition has been killed".into()));
        }
        Ok(inner.map.mappings().collect())
    }

    /// Number of allocated slices.
    #[must_use]
    pub fn slice_count(&self) -> u64 {
        self.inner.lock().map.slice_count()
    }

    /// Kill the partition: drop every mapping, zero the committed size,
    /// and clear the entry index. One-way; all later operations fail with
    /// bad-state.
    pub fn kill(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.block_count = 0;
        inner.entry_index = PartitionIndex::RESERVED;
    }

    // ── I/O translation ─────────────────────────────────────────────────

    fn physical_block(&self, pslice: Pslice, block_in_slice: u64) -> u64 {
        self.data_start_block + (pslice.0 - 1) * self.blocks_per_slice + block_in_slice
    }

    fn plan_io(&self, request: &BlockRequest) -> Result<IoPlan> {
        let inner = self.inner.lock();
        if inner.entry_index.is_reserved() {
            return Err(FvmError::BadState("partition has been killed".into()));
        }

        if request.op == BlockOp::Flush {
            return Ok(IoPlan::Passthrough);
        }
        if request.length == 0 {
            return Err(FvmError::InvalidArgs("zero-length transfer".into()));
        }
        if request.buf.is_none() {
            return Err(FvmError::InvalidArgs("transfer request without buffer".into()));
        }

        let bps = self.blocks_per_slice;
        let dev_offset = request.dev_offset;
        let end = dev_offset
            .checked_add(request.length)
            .ok_or_else(|| FvmError::OutOfRange("block range overflows u64".into()))?;
        let vslice_start = dev_offset / bps;
        let vslice_end = (end - 1) / bps;
        if vslice_end >= self.vslice_max {
            return Err(FvmError::OutOfRange(format!(
                "request ends in vslice {vslice_end}, past vslice_max {}",
                self.vslice_max
            )));
        }

        // Single-slice fast path.
        if vslice_start == vslice_end {
            let pslice = inner.map.get(Vslice(vslice_start));
            if pslice.is_free() {
                return Err(FvmError::OutOfRange(format!(
                    "vslice {vslice_start} is not allocated"
                )));
            }
            return Ok(IoPlan::Single {
                dev_offset: self.physical_block(pslice, dev_offset % bps),
            });
        }

        // Verify the whole range before issuing anything: a gap anywhere
        // fails the request with no partial I/O.
        let count = usize::try_from(vslice_end - vslice_start + 1)
            .map_err(|_| FvmError::OutOfRange("request touches too many slices".into()))?;
        let mut pslices = Vec::new();
        pslices
            .try_reserve_exact(count)
            .map_err(|_| FvmError::NoMemory)?;
        for vslice in vslice_start..=vslice_end {
            let pslice = inner.map.get(Vslice(vslice));
            if pslice.is_free() {
                return Err(FvmError::OutOfRange(format!(
                    "request spans unallocated vslice {vslice}"
                )));
            }
            pslices.push(pslice);
        }

        // Physically contiguous backing collapses to one forwarded request.
        if pslices.windows(2).all(|pair| pair[0].0 + 1 == pair[1].0) {
            return Ok(IoPlan::Single {
                dev_offset: self.physical_block(pslices[0], dev_offset % bps),
            });
        }

        let mut segments = Vec::new();
        segments
            .try_reserve_exact(count)
            .map_err(|_| FvmError::NoMemory)?;
        for (i, pslice) in pslices.iter().enumerate() {
            let vslice = vslice_start + i as u64;
            let seg_start = dev_offset.max(vslice * bps);
            let seg_end = end.min((vslice + 1) * bps);
            segments.push(IoSegment {
                buf_offset: request.buf_offset + (seg_start - dev_offset),
                dev_offset: self.physical_block(*pslice, seg_start % bps),
                length: seg_end - seg_start,
            });
        }
        trace!(
            vslice_start,
            vslice_end,
            segments = segments.len(),
            "splitting request across non-contiguous slices"
        );
        Ok(IoPlan::Split(segments))
    }

    /// Queue a logical block request against this partition.
    ///
    /// The request's offsets are in virtual partition blocks; the partition
    /// translates them (splitting across non-contiguous physical slices as
    /// needed) and forwards physical sub-requests to the transport. All
    /// failures are reported through the request's completion callback.
    pub fn queue(&self, request: BlockRequest) {
        let plan = self.plan_io(&request);

        match plan {
            Err(err) => (request.complete)(Err(err)),
            Ok(IoPlan::Passthrough) => self.transport.queue(request),
            Ok(IoPlan::Single { dev_offset }) => {
                let BlockRequest {
                    op,
                    buf,
                    buf_offset,
                    length,
                    complete,
                    ..
                } = request;
                self.transport.queue(BlockRequest {
                    op,
                    buf,
                    buf_offset,
                    dev_offset,
                    length,
                    complete,
                });
            }
            Ok(IoPlan::Split(segments)) => {
                let BlockRequest {
                    op, buf, complete, ..
                } = request;
                // plan_io only returns Split for buffer-carrying transfers.
                let Some(buf) = buf else {
                    complete(Err(FvmError::Internal(
                        "split plan without a buffer".into(),
                    )));
                    return;
                };
                let tracker = IoTracker::new(segments.len(), complete);
                for segment in segments {
                    let tracker = Arc::clone(&tracker);
                    self.transport.queue(BlockRequest {
                        op,
                        buf: Some(Arc::clone(&buf)),
                        buf_offset: segment.buf_offset,
                        dev_offset: segment.dev_offset,
                        length: segment.length,
                        complete: Box::new(move |status| tracker.finish_one(status)),
                    });
                }
            }
        }
    }
}

enum IoPlan {
    /// Flush: forwarded untouched.
    Passthrough,
    /// Single physical sub-request (single-slice or contiguous fast path).
    Single { dev_offset: u64 },
    /// One physical sub-request per touched virtual slice.
    Split(Vec<IoSegment>),
}

struct IoSegment {
    buf_offset: u64,
    dev_offset: u64,
    length: u64,
}

/// Completion aggregation for split requests: the caller's callback fires
/// once every sub-request has completed, with the first non-OK status
/// winning. Siblings are never cancelled — they run to completion even
/// after a failure, so physical state stays consistent.
struct IoTracker {
    remaining: AtomicUsize,
    first_error: Mutex<Option<FvmError>>,
    complete: Mutex<Option<Completion>>,
}

impl IoTracker {
    fn new(count: usize, complete: Completion) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(count),
            first_error: Mutex::new(None),
            complete: Mutex::new(Some(complete)),
        })
    }

    fn finish_one(&self, status: Result<()>) {
        if let Err(err) = status {
            let mut slot = self.first_error.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(complete) = self.complete.lock().take() {
                let status = self.first_error.lock().take().map_or(Ok(()), Err);
                complete(status);
            }
        }
    }
}
