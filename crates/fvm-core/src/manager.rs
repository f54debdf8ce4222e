//! The volume manager.
//!
//! [`VPartitionManager`] owns the authoritative in-memory image of the
//! current metadata copy, the slice allocation hint, and the live
//! [`VPartition`] objects. Every mutation follows the same shape: mutate
//! the in-memory state, persist via [`VPartitionManager::write_metadata`]
//! (generation bump, checksum, write to the stale copy, flip currency),
//! and on persistence failure roll the in-memory state back so callers
//! observe all-or-nothing semantics.
//!
//! The manager lock is strictly outer to any partition lock and is never
//! held across an I/O completion callback.

use crate::partition::VPartition;
use fvm_block::{BlockTransport, ByteDevice, VolumeDevice};
use fvm_error::{FvmError, Result};
use fvm_ondisk::{
    format_copy, pick_current, stamp_checksum, Geometry, MetadataCopy, PartitionEntry, SliceEntry,
    Superblock,
};
use fvm_types::{
    encode_name, u64_to_u32, Generation, Guid, ParseError, PartitionIndex, Pslice, Vslice,
    PARTITION_TABLE_ENTRIES, SUPERBLOCK_SIZE,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Mutable state guarded by the manager lock.
struct ManagerInner {
    /// In-memory image of the current metadata copy.
    metadata: Vec<u8>,
    /// Which on-disk copy `metadata` mirrors.
    current: MetadataCopy,
    generation: Generation,
    /// Next physical slice to try; always in `1..=pslice_count`.
    hint: u64,
    partitions: BTreeMap<u16, Arc<VPartition>>,
}

/// Slice-based volume manager over one formatted device.
pub struct VPartitionManager {
    device: Arc<dyn ByteDevice>,
    transport: Arc<dyn BlockTransport>,
    geometry: Geometry,
    inner: Mutex<ManagerInner>,
}

fn table_err(err: ParseError) -> FvmError {
    FvmError::Internal(format!("metadata table access: {err}"))
}

impl VPartitionManager {
    // ── Format and load ─────────────────────────────────────────────────

    /// Write a fresh, empty volume manager onto `device`.
    ///
    /// Both metadata copies are written valid, primary at generation 1 and
    /// secondary at generation 0, so the primary is current after a load.
    pub fn format(device: &dyn ByteDevice, slice_size: u64) -> Result<Geometry> {
        let geometry = Geometry::compute(device.len_bytes(), device.block_size(), slice_size)
            .map_err(|err| FvmError::InvalidArgs(format!("cannot format device: {err}")))?;

        let primary = format_copy(&geometry, Generation(1)).map_err(table_err)?;
        let secondary = format_copy(&geometry, Generation(0)).map_err(table_err)?;
        device.write_all_at(geometry.copy_offset(MetadataCopy::Primary), &primary)?;
        device.write_all_at(geometry.copy_offset(MetadataCopy::Secondary), &secondary)?;
        device.sync()?;
        debug!(
            slice_size,
            pslice_count = geometry.pslice_count,
            "formatted device"
        );
        Ok(geometry)
    }

    /// Load an existing volume manager from `device`.
    ///
    /// Reads the primary superblock to learn the slice size, derives the
    /// geometry, reads both full metadata copies, picks the current one,
    /// and replays the partition and allocation tables into live
    /// [`VPartition`] objects.
    pub fn load<D: VolumeDevice + 'static>(device: Arc<D>) -> Result<Arc<Self>> {
        let byte_dev: Arc<dyn ByteDevice> = Arc::clone(&device) as Arc<dyn ByteDevice>;
        let transport: Arc<dyn BlockTransport> = device;
        Self::load_parts(byte_dev, transport)
    }

    /// Load on a worker thread, delivering the result through `on_done`.
    ///
    /// The replay over the allocation table is linear in the slice count,
    /// which on large devices is worth keeping off the caller's thread.
    pub fn load_background<D, F>(device: Arc<D>, on_done: F) -> std::thread::JoinHandle<()>
    where
        D: VolumeDevice + 'static,
        F: FnOnce(Result<Arc<Self>>) + Send + 'static,
    {
        std::thread::spawn(move || on_done(Self::load(device)))
    }

    fn load_parts(
        device: Arc<dyn ByteDevice>,
        transport: Arc<dyn BlockTransport>,
    ) -> Result<Arc<Self>> {
        // Bootstrap: the primary superblock names the slice size, and
        // without the slice size the secondary copy cannot be located.
        let mut header = vec![0_u8; SUPERBLOCK_SIZE];
        device.read_exact_at(0, &mut header)?;
        let sb = Superblock::parse(&header)
            .map_err(|err| FvmError::Format(format!("primary superblock: {err}")))?;

        let geometry = Geometry::compute(device.len_bytes(), device.block_size(), sb.slice_size)
            .map_err(|err| FvmError::Format(format!("device geometry: {err}")))?;
        geometry
            .check_superblock(&sb)
            .map_err(|err| FvmError::BadState(format!("superblock mismatch: {err}")))?;

        let copy_len = geometry.metadata_usize().map_err(table_err)?;
        let mut primary = vec![0_u8; copy_len];
        let mut secondary = vec![0_u8; copy_len];
        device.read_exact_at(geometry.copy_offset(MetadataCopy::Primary), &mut primary)?;
        device.read_exact_at(geometry.copy_offset(MetadataCopy::Secondary), &mut secondary)?;

        let current = pick_current(&primary, &secondary).ok_or_else(|| {
            FvmError::Corruption("neither metadata copy passes validation".into())
        })?;
        let metadata = match current {
            MetadataCopy::Primary => primary,
            MetadataCopy::Secondary => secondary,
        };
        // The chosen copy's header must also match the device, in case the
        // primary parsed but currency went to the secondary.
        let sb = Superblock::parse(&metadata)
            .map_err(|err| FvmError::Corruption(format!("current superblock: {err}")))?;
        geometry
            .check_superblock(&sb)
            .map_err(|err| FvmError::BadState(format!("superblock mismatch: {err}")))?;

        let mut partitions = BTreeMap::new();
        for i in 1..PARTITION_TABLE_ENTRIES {
            let index = PartitionIndex(u16::try_from(i).map_err(|_| {
                FvmError::Internal("partition table index overflows u16".into())
            })?);
            let offset = geometry.partition_entry_offset(index).map_err(table_err)?;
            let entry = PartitionEntry::parse_at(&metadata, offset).map_err(table_err)?;
            if entry.is_free() {
                continue;
            }
            let vp = VPartition::new(
                &geometry,
                Arc::clone(&transport),
                index,
                entry.type_guid,
                entry.guid,
                entry.name(),
            )?;
            partitions.insert(index.0, vp);
        }

        // Replay the allocation table into the per-partition slice maps.
        for p in 1..=geometry.pslice_count {
            let pslice = Pslice(p);
            let offset = geometry.slice_entry_offset(pslice).map_err(table_err)?;
            let entry = SliceEntry::parse_at(&metadata, offset).map_err(table_err)?;
            if entry.is_free() {
                continue;
            }
            let vp = partitions.get(&entry.vpart.0).ok_or_else(|| {
                FvmError::Corruption(format!(
                    "pslice {pslice} owned by free partition entry {}",
                    entry.vpart
                ))
            })?;
            // The packed vslice field is wider than the addressable range.
            if entry.vslice.0 >= geometry.vslice_max() {
                return Err(FvmError::Corruption(format!(
                    "pslice {pslice} maps vslice {} past the limit {}",
                    entry.vslice,
                    geometry.vslice_max()
                )));
            }
            if !vp.slice_get(entry.vslice)?.is_free() {
                return Err(FvmError::Corruption(format!(
                    "vslice {} of partition {} mapped twice",
                    entry.vslice, entry.vpart
                )));
            }
            vp.slice_set(entry.vslice, pslice)?;
        }

        // Each entry's committed count must agree with the replayed map.
        for (raw_index, vp) in &partitions {
            let index = PartitionIndex(*raw_index);
            let offset = geometry.partition_entry_offset(index).map_err(table_err)?;
            let entry = PartitionEntry::parse_at(&metadata, offset).map_err(table_err)?;
            if u64::from(entry.slices) != vp.slice_count() {
                return Err(FvmError::Corruption(format!(
                    "partition {index} declares {} slices but the allocation table grants {}",
                    entry.slices,
                    vp.slice_count()
                )));
            }
        }

        debug!(
            partitions = partitions.len(),
            generation = sb.generation.0,
            ?current,
            "loaded volume manager"
        );
        Ok(Arc::new(Self {
            device,
            transport,
            geometry,
            inner: Mutex::new(ManagerInner {
                metadata,
                current,
                generation: sb.generation,
                hint: 1,
                partitions,
            }),
        }))
    }

    // ── Queries ─────────────────────────────────────────────────────────

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[must_use]
    pub fn slice_size(&self) -> u64 {
        self.geometry.slice_size
    }

    #[must_use]
    pub fn vslice_max(&self) -> u64 {
        self.geometry.vslice_max()
    }

    #[must_use]
    pub fn generation(&self) -> Generation {
        self.inner.lock().generation
    }

    #[must_use]
    pub fn current_copy(&self) -> MetadataCopy {
        self.inner.lock().current
    }

    /// Number of unallocated physical slices.
    pub fn free_slice_count(&self) -> Result<u64> {
        let inner = self.inner.lock();
        let mut free = 0;
        for p in 1..=self.geometry.pslice_count {
            let offset = self
                .geometry
                .slice_entry_offset(Pslice(p))
                .map_err(table_err)?;
            if SliceEntry::parse_at(&inner.metadata, offset)
                .map_err(table_err)?
                .is_free()
            {
                free += 1;
            }
        }
        Ok(free)
    }

    #[must_use]
    pub fn partition_by_index(&self, index: PartitionIndex) -> Option<Arc<VPartition>> {
        self.inner.lock().partitions.get(&index.0).cloned()
    }

    /// Live partitions in table order.
    #[must_use]
    pub fn partitions(&self) -> Vec<Arc<VPartition>> {
        self.inner.lock().partitions.values().cloned().collect()
    }

    /// Batched range query: `(run_length, allocated)` for each start.
    pub fn query_slices(
        &self,
        vp: &VPartition,
        starts: &[Vslice],
    ) -> Result<Vec<(u64, bool)>> {
        starts.iter().map(|start| vp.check_slices(*start)).collect()
    }

    // ── Allocation ──────────────────────────────────────────────────────

    /// Create a partition with `slice_count` initial slices at vslice 0.
    ///
    /// The new partition only becomes visible once its entry and slices
    /// have been persisted; any failure leaves the manager unchanged.
    pub fn allocate_partition(
        &self,
        type_guid: Guid,
        guid: Guid,
        name: &str,
        slice_count: u64,
    ) -> Result<Arc<VPartition>> {
        if slice_count == 0 {
            return Err(FvmError::InvalidArgs(
                "partition needs at least one slice".into(),
            ));
        }
        if slice_count > self.geometry.vslice_max() {
            return Err(FvmError::OutOfRange(format!(
                "slice_count {slice_count} exceeds vslice_max {}",
                self.geometry.vslice_max()
            )));
        }
        let encoded_name = encode_name(name)
            .map_err(|err| FvmError::InvalidArgs(format!("partition name: {err}")))?;

        let mut inner = self.inner.lock();
        let index = self.find_free_entry(&inner)?;
        let saved = inner.metadata.clone();

        let entry = PartitionEntry {
            type_guid,
            guid,
            slices: 0,
            flags: 0,
            name: encoded_name,
        };
        let offset = self.geometry.partition_entry_offset(index).map_err(table_err)?;
        entry
            .write_at(&mut inner.metadata, offset)
            .map_err(table_err)?;

        let vp = VPartition::new(
            &self.geometry,
            Arc::clone(&self.transport),
            index,
            type_guid,
            guid,
            name.to_string(),
        )?;

        let mut granted = Vec::new();
        let outcome = self
            .grant_slices(&mut inner, &vp, index, Vslice(0), slice_count, &mut granted)
            .and_then(|()| self.write_metadata(&mut inner));
        if let Err(err) = outcome {
            // The partition was never published; dropping it discards the
            // half-built slice map.
            inner.metadata = saved;
            return Err(err);
        }

        inner.partitions.insert(index.0, Arc::clone(&vp));
        debug!(%index, name, slice_count, "allocated partition");
        Ok(vp)
    }

    /// Grow `vp` by `count` slices at `[vslice_start, vslice_start+count)`.
    ///
    /// All-or-nothing: exhaustion, an already-allocated vslice, or a failed
    /// persist all roll back every slice granted by this call.
    pub fn allocate_slices(&self, vp: &VPartition, vslice_start: Vslice, count: u64) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        let index = vp.entry_index()?;
        let saved = inner.metadata.clone();

        let mut granted = Vec::new();
        let outcome = self
            .grant_slices(&mut inner, vp, index, vslice_start, count, &mut granted)
            .and_then(|()| self.write_metadata(&mut inner));
        if let Err(err) = outcome {
            inner.metadata = saved;
            self.retract_grants(vp, &granted);
            return Err(err);
        }
        debug!(%index, start = vslice_start.0, count, "allocated slices");
        Ok(())
    }

    /// Mutate the in-memory state for one allocation. No persistence;
    /// callers roll back `granted` and the metadata buffer on failure.
    fn grant_slices(
        &self,
        inner: &mut ManagerInner,
        vp: &VPartition,
        index: PartitionIndex,
        vslice_start: Vslice,
        count: u64,
        granted: &mut Vec<(Vslice, Pslice)>,
    ) -> Result<()> {
        let end = vslice_start
            .checked_add(count)
            .ok_or_else(|| FvmError::OutOfRange("vslice range overflows u64".into()))?;
        if end.0 > self.geometry.vslice_max() {
            return Err(FvmError::OutOfRange(format!(
                "vslice range ends at {end}, past vslice_max {}",
                self.geometry.vslice_max()
            )));
        }
        granted
            .try_reserve_exact(usize::try_from(count).map_err(|_| FvmError::NoMemory)?)
            .map_err(|_| FvmError::NoMemory)?;

        for v in vslice_start.0..end.0 {
            let vslice = Vslice(v);
            if !vp.slice_get(vslice)?.is_free() {
                return Err(FvmError::InvalidArgs(format!(
                    "vslice {vslice} is already allocated"
                )));
            }
            let pslice = self.find_free_slice(inner)?;
            let entry = SliceEntry::new(index, vslice).map_err(table_err)?;
            let offset = self.geometry.slice_entry_offset(pslice).map_err(table_err)?;
            entry
                .write_at(&mut inner.metadata, offset)
                .map_err(table_err)?;
            vp.slice_set(vslice, pslice)?;
            granted.push((vslice, pslice));
            inner.hint = if pslice.0 >= self.geometry.pslice_count {
                1
            } else {
                pslice.0 + 1
            };
        }

        // Keep the table entry's committed count in step.
        let offset = self.geometry.partition_entry_offset(index).map_err(table_err)?;
        let mut entry = PartitionEntry::parse_at(&inner.metadata, offset).map_err(table_err)?;
        entry.slices = entry
            .slices
            .checked_add(u64_to_u32(count, "slice_count").map_err(table_err)?)
            .ok_or_else(|| {
                FvmError::OutOfRange("partition slice count overflows u32".into())
            })?;
        entry
            .write_at(&mut inner.metadata, offset)
            .map_err(table_err)?;
        Ok(())
    }

    /// Undo the slice-map half of a failed allocation, newest grant first
    /// so every undo is an infallible tail free.
    fn retract_grants(&self, vp: &VPartition, granted: &[(Vslice, Pslice)]) {
        for (vslice, _) in granted.iter().rev() {
            if let Err(err) = vp.slice_free(*vslice) {
                warn!(vslice = vslice.0, %err, "rollback free failed");
            }
        }
    }

    fn find_free_entry(&self, inner: &ManagerInner) -> Result<PartitionIndex> {
        for i in 1..PARTITION_TABLE_ENTRIES {
            let index = PartitionIndex(u16::try_from(i).map_err(|_| {
                FvmError::Internal("partition table index overflows u16".into())
            })?);
            if inner.partitions.contains_key(&index.0) {
                continue;
            }
            let offset = self.geometry.partition_entry_offset(index).map_err(table_err)?;
            if PartitionEntry::parse_at(&inner.metadata, offset)
                .map_err(table_err)?
                .is_free()
            {
                return Ok(index);
            }
        }
        Err(FvmError::NoSpace)
    }

    /// Linear scan for a free physical slice, starting at the hint and
    /// wrapping once around the table.
    fn find_free_slice(&self, inner: &ManagerInner) -> Result<Pslice> {
        let n = self.geometry.pslice_count;
        for step in 0..n {
            let pslice = Pslice((inner.hint - 1 + step) % n + 1);
            let offset = self.geometry.slice_entry_offset(pslice).map_err(table_err)?;
            if SliceEntry::parse_at(&inner.metadata, offset)
                .map_err(table_err)?
                .is_free()
            {
                return Ok(pslice);
            }
        }
        Err(FvmError::NoSpace)
    }

    // ── Resize dispatch surface ─────────────────────────────────────────

    /// Bounds checks shared by the external extend/shrink entry points.
    ///
    /// Offset 0 is never addressable from outside: the slices a partition
    /// was created with can only be released by destroying it.
    fn check_resize_range(&self, offset: Vslice, length: u64) -> Result<()> {
        let max = self.geometry.vslice_max();
        if offset.0 == 0 || offset.0 >= max {
            return Err(FvmError::OutOfRange(format!(
                "offset {offset} outside 1..{max}"
            )));
        }
        let end = offset
            .checked_add(length)
            .ok_or_else(|| FvmError::OutOfRange("vslice range overflows u64".into()))?;
        if end.0 > max {
            return Err(FvmError::OutOfRange(format!(
                "range ends at {end}, past vslice_max {max}"
            )));
        }
        Ok(())
    }

    /// External grow request (`EXTEND`): length 0 is a no-op success.
    pub fn extend(&self, vp: &VPartition, offset: Vslice, length: u64) -> Result<()> {
        self.check_resize_range(offset, length)?;
        if length == 0 {
            return Ok(());
        }
        self.allocate_slices(vp, offset, length)
    }

    /// External shrink request (`SHRINK`): length 0 is a no-op success.
    pub fn shrink(&self, vp: &VPartition, offset: Vslice, length: u64) -> Result<()> {
        self.check_resize_range(offset, length)?;
        if length == 0 {
            return Ok(());
        }
        self.free_slices(vp, offset, length)
    }

    /// External whole-partition teardown (`DESTROY`).
    pub fn destroy(&self, vp: &VPartition) -> Result<()> {
        self.free_slices(vp, Vslice(0), 0)
    }

    // ── Freeing ─────────────────────────────────────────────────────────

    /// Free slices from `vp`.
    ///
    /// `vslice_start == 0` frees the whole partition: every mapping is
    /// released, the table entry is zeroed, and the partition is killed.
    /// Otherwise frees `[vslice_start, vslice_start+count)` tail-first;
    /// only the first free (a possible mid-extent split) can fail, and it
    /// fails with nothing freed.
    ///
    /// A device sync barrier is issued before any mapping is dropped, so
    /// in-flight writes never land on a recycled physical slice.
    pub fn free_slices(&self, vp: &VPartition, vslice_start: Vslice, count: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let index = vp.entry_index()?;
        self.device.sync()?;

        if vslice_start.0 == 0 {
            return self.free_whole_partition(&mut inner, vp, index);
        }
        if count == 0 {
            return Ok(());
        }
        let end = vslice_start
            .checked_add(count)
            .ok_or_else(|| FvmError::OutOfRange("vslice range overflows u64".into()))?;
        if end.0 > self.geometry.vslice_max() {
            return Err(FvmError::OutOfRange(format!(
                "vslice range ends at {end}, past vslice_max {}",
                self.geometry.vslice_max()
            )));
        }

        // Tail-first: after the first free, every remaining target is the
        // tail of its extent and cannot need a split.
        let mut freed: Vec<(Vslice, Pslice)> = Vec::new();
        for v in (vslice_start.0..end.0).rev() {
            let vslice = Vslice(v);
            let pslice = vp.slice_get(vslice)?;
            if pslice.is_free() {
                self.reinstate_frees(vp, &freed);
                return Err(FvmError::OutOfRange(format!(
                    "vslice {vslice} is not allocated"
                )));
            }
            if let Err(err) = vp.slice_free(vslice) {
                self.reinstate_frees(vp, &freed);
                return Err(err);
            }
            freed.push((vslice, pslice));
        }

        let saved = inner.metadata.clone();
        let outcome = self
            .release_table_entries(&mut inner, index, &freed)
            .and_then(|()| self.write_metadata(&mut inner));
        if let Err(err) = outcome {
            inner.metadata = saved;
            self.reinstate_frees(vp, &freed);
            return Err(err);
        }
        debug!(%index, start = vslice_start.0, count, "freed slices");
        Ok(())
    }

    fn free_whole_partition(
        &self,
        inner: &mut ManagerInner,
        vp: &VPartition,
        index: PartitionIndex,
    ) -> Result<()> {
        let mappings = vp.mappings()?;
        let saved = inner.metadata.clone();

        let outcome = self
            .zero_partition_tables(inner, index, &mappings)
            .and_then(|()| self.write_metadata(inner));
        if let Err(err) = outcome {
            inner.metadata = saved;
            return Err(err);
        }
        // Persisted; only now does the partition stop existing.
        vp.kill();
        inner.partitions.remove(&index.0);
        debug!(%index, slices = mappings.len(), "destroyed partition");
        Ok(())
    }

    /// Zero every table entry belonging to a partition being destroyed.
    /// Buffer-only; caller persists.
    fn zero_partition_tables(
        &self,
        inner: &mut ManagerInner,
        index: PartitionIndex,
        mappings: &[(Vslice, Pslice)],
    ) -> Result<()> {
        for (_, pslice) in mappings {
            let offset = self
                .geometry
                .slice_entry_offset(*pslice)
                .map_err(table_err)?;
            SliceEntry::FREE
                .write_at(&mut inner.metadata, offset)
                .map_err(table_err)?;
        }
        let offset = self.geometry.partition_entry_offset(index).map_err(table_err)?;
        PartitionEntry::FREE
            .write_at(&mut inner.metadata, offset)
            .map_err(table_err)?;
        Ok(())
    }

    /// Zero the freed allocation-table entries and shrink the partition
    /// entry's committed count. Buffer-only; caller persists.
    fn release_table_entries(
        &self,
        inner: &mut ManagerInner,
        index: PartitionIndex,
        freed: &[(Vslice, Pslice)],
    ) -> Result<()> {
        for (_, pslice) in freed {
            let offset = self
                .geometry
                .slice_entry_offset(*pslice)
                .map_err(table_err)?;
            SliceEntry::FREE
                .write_at(&mut inner.metadata, offset)
                .map_err(table_err)?;
        }
        let offset = self.geometry.partition_entry_offset(index).map_err(table_err)?;
        let mut entry = PartitionEntry::parse_at(&inner.metadata, offset).map_err(table_err)?;
        let count =
            u64_to_u32(freed.len() as u64, "freed_count").map_err(table_err)?;
        entry.slices = entry.slices.checked_sub(count).ok_or_else(|| {
            FvmError::Internal("partition slice count underflow".into())
        })?;
        entry
            .write_at(&mut inner.metadata, offset)
            .map_err(table_err)?;
        Ok(())
    }

    /// Undo the slice-map half of a failed free: re-set in ascending
    /// order, restoring the exact prior extents.
    fn reinstate_frees(&self, vp: &VPartition, freed: &[(Vslice, Pslice)]) {
        for (vslice, pslice) in freed.iter().rev() {
            if let Err(err) = vp.slice_set(*vslice, *pslice) {
                warn!(vslice = vslice.0, %err, "rollback re-set failed");
            }
        }
    }

    // ── Persistence ─────────────────────────────────────────────────────

    /// Persist the in-memory metadata to the stale on-disk copy.
    ///
    /// Bumps the generation, restamps the checksum, writes, syncs, and
    /// flips currency only once the write has landed. On failure the
    /// buffer's header is restored to the still-current generation, so the
    /// on-disk current copy remains authoritative.
    fn write_metadata(&self, inner: &mut ManagerInner) -> Result<()> {
        let next = inner.generation.next();
        self.geometry
            .superblock(next)
            .write_to(&mut inner.metadata)
            .map_err(table_err)?;
        stamp_checksum(&mut inner.metadata).map_err(table_err)?;

        let target = inner.current.other();
        let offset = self.geometry.copy_offset(target);
        let outcome = self
            .device
            .write_all_at(offset, &inner.metadata)
            .and_then(|()| self.device.sync());
        match outcome {
            Ok(()) => {
                inner.current = target;
                inner.generation = next;
                debug!(generation = next.0, ?target, "persisted metadata");
                Ok(())
            }
            Err(err) => {
                self.geometry
                    .superblock(inner.generation)
                    .write_to(&mut inner.metadata)
                    .map_err(table_err)?;
                stamp_checksum(&mut inner.metadata).map_err(table_err)?;
                warn!(%err, ?target, "metadata write failed; currency unchanged");
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for VPartitionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("VPartitionManager")
            .field("geometry", &self.geometry)
            .field("current", &inner.current)
            .field("generation", &inner.generation)
            .field("partitions", &inner.partitions.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fvm_block::{ByteTransport, MemByteDevice};

    const DISK: u64 = 8 << 20;
    const BLOCK: u32 = 512;
    const SLICE: u64 = 64 << 10;

    fn fresh_device() -> Arc<ByteTransport<MemByteDevice>> {
        let dev = MemByteDevice::new(DISK as usize, BLOCK);
        VPartitionManager::format(&dev, SLICE).expect("format");
        Arc::new(ByteTransport::new(dev).expect("transport"))
    }

    fn load(device: &Arc<ByteTransport<MemByteDevice>>) -> Arc<VPartitionManager> {
        VPartitionManager::load(Arc::clone(device)).expect("load")
    }

    #[test]
    fn format_then_load_is_empty() {
        let device = fresh_device();
        let fvm = load(&device);
        assert_eq!(fvm.slice_size(), SLICE);
        assert_eq!(fvm.current_copy(), MetadataCopy::Primary);
        assert_eq!(fvm.generation(), Generation(1));
        assert!(fvm.partitions().is_empty());
        assert_eq!(
            fvm.free_slice_count().expect("count"),
            fvm.geometry().pslice_count
        );
    }

    #[test]
    fn load_rejects_unformatted_device() {
        let dev = Arc::new(
            ByteTransport::new(MemByteDevice::new(DISK as usize, BLOCK)).expect("transport"),
        );
        assert!(matches!(
            VPartitionManager::load(dev),
            Err(FvmError::Format(_))
        ));
    }

    #[test]
    fn allocate_partition_survives_reload() {
        let device = fresh_device();
        let fvm = load(&device);

        let vp = fvm
            .allocate_partition(Guid([1; 16]), Guid([2; 16]), "blobfs", 3)
            .expect("allocate");
        assert_eq!(vp.slice_count(), 3);
        assert_eq!(fvm.generation(), Generation(2));
        assert_eq!(fvm.current_copy(), MetadataCopy::Secondary);

        let reloaded = load(&device);
        let partitions = reloaded.partitions();
        assert_eq!(partitions.len(), 1);
        let back = &partitions[0];
        let identity = back.identity().expect("identity");
        assert_eq!(identity.name, "blobfs");
        assert_eq!(identity.type_guid, Guid([1; 16]));
        assert_eq!(back.slice_count(), 3);
        assert_eq!(
            back.mappings().expect("mappings"),
            vp.mappings().expect("mappings")
        );
    }

    #[test]
    fn allocation_is_atomic_under_exhaustion() {
        let device = fresh_device();
        let fvm = load(&device);
        let total = fvm.geometry().pslice_count;

        let vp = fvm
            .allocate_partition(Guid([1; 16]), Guid([2; 16]), "data", 1)
            .expect("allocate");
        let free_before = fvm.free_slice_count().expect("count");
        assert_eq!(free_before, total - 1);

        // Ask for one more slice than exists.
        let err = fvm
            .allocate_slices(&vp, Vslice(1), free_before + 1)
            .expect_err("must exhaust");
        assert!(matches!(err, FvmError::NoSpace));

        // Nothing was granted, in memory or on disk.
        assert_eq!(vp.slice_count(), 1);
        assert_eq!(fvm.free_slice_count().expect("count"), free_before);
        assert_eq!(fvm.generation(), Generation(2));
        let reloaded = load(&device);
        assert_eq!(reloaded.partitions()[0].slice_count(), 1);
    }

    #[test]
    fn allocating_an_allocated_vslice_fails_cleanly() {
        let device = fresh_device();
        let fvm = load(&device);
        let vp = fvm
            .allocate_partition(Guid([1; 16]), Guid([2; 16]), "data", 2)
            .expect("allocate");

        // [1, 4) collides with the existing vslice 1.
        let err = fvm
            .allocate_slices(&vp, Vslice(1), 3)
            .expect_err("collision");
        assert!(matches!(err, FvmError::InvalidArgs(_)));
        assert_eq!(vp.slice_count(), 2);
        assert_eq!(
            fvm.free_slice_count().expect("count"),
            fvm.geometry().pslice_count - 2
        );
    }

    #[test]
    fn hint_scan_reuses_freed_slices() {
        let device = fresh_device();
        let fvm = load(&device);
        let vp = fvm
            .allocate_partition(Guid([1; 16]), Guid([2; 16]), "data", 4)
            .expect("allocate");

        // Free vslices 1..3 and reallocate: the scan must find the holes.
        fvm.free_slices(&vp, Vslice(1), 2).expect("free");
        assert_eq!(vp.slice_count(), 2);
        fvm.allocate_slices(&vp, Vslice(1), 2).expect("refill");
        assert_eq!(vp.slice_count(), 4);
        assert_eq!(
            fvm.free_slice_count().expect("count"),
            fvm.geometry().pslice_count - 4
        );
    }

    #[test]
    fn allocation_fills_the_whole_pool() {
        let device = fresh_device();
        let fvm = load(&device);
        let total = fvm.geometry().pslice_count;
        let vp = fvm
            .allocate_partition(Guid([1; 16]), Guid([2; 16]), "data", total)
            .expect("fill pool");
        assert_eq!(vp.slice_count(), total);
        assert_eq!(fvm.free_slice_count().expect("count"), 0);

        let err = fvm.allocate_slices(&vp, Vslice(total), 1).expect_err("full");
        assert!(matches!(err, FvmError::NoSpace));
    }

    #[test]
    fn partial_free_is_tail_first() {
        let device = fresh_device();
        let fvm = load(&device);
        let vp = fvm
            .allocate_partition(Guid([1; 16]), Guid([2; 16]), "data", 6)
            .expect("allocate");

        // Free the middle: [2, 5). Survivors stay mapped.
        fvm.free_slices(&vp, Vslice(2), 3).expect("free");
        assert_eq!(vp.slice_count(), 3);
        assert!(!vp.slice_get(Vslice(0)).expect("get").is_free());
        assert!(vp.slice_get(Vslice(3)).expect("get").is_free());
        assert!(!vp.slice_get(Vslice(5)).expect("get").is_free());

        let reloaded = load(&device);
        assert_eq!(reloaded.partitions()[0].slice_count(), 3);
    }

    #[test]
    fn freeing_an_unallocated_vslice_frees_nothing() {
        let device = fresh_device();
        let fvm = load(&device);
        let vp = fvm
            .allocate_partition(Guid([1; 16]), Guid([2; 16]), "data", 2)
            .expect("allocate");

        // [1, 4) includes unallocated vslices 2 and 3.
        let err = fvm.free_slices(&vp, Vslice(1), 3).expect_err("hole");
        assert!(matches!(err, FvmError::OutOfRange(_)));
        assert_eq!(vp.slice_count(), 2);
    }

    #[test]
    fn whole_partition_free_kills_and_reclaims() {
        let device = fresh_device();
        let fvm = load(&device);
        let total = fvm.geometry().pslice_count;
        let vp = fvm
            .allocate_partition(Guid([1; 16]), Guid([2; 16]), "doomed", 3)
            .expect("allocate");
        // A second, disjoint extent at vslice 10.
        fvm.allocate_slices(&vp, Vslice(10), 2).expect("extend");
        assert_eq!(vp.slice_count(), 5);
        let index = vp.entry_index().expect("index");

        fvm.free_slices(&vp, Vslice(0), 0).expect("destroy");
        assert!(vp.is_killed());
        assert!(fvm.partition_by_index(index).is_none());
        assert_eq!(fvm.free_slice_count().expect("count"), total);

        let reloaded = load(&device);
        assert!(reloaded.partitions().is_empty());
    }

    #[test]
    fn partition_table_entries_are_reused_after_destroy() {
        let device = fresh_device();
        let fvm = load(&device);
        let first = fvm
            .allocate_partition(Guid([1; 16]), Guid([2; 16]), "a", 1)
            .expect("allocate");
        let index = first.entry_index().expect("index");
        fvm.free_slices(&first, Vslice(0), 0).expect("destroy");

        let second = fvm
            .allocate_partition(Guid([3; 16]), Guid([4; 16]), "b", 1)
            .expect("allocate");
        assert_eq!(second.entry_index().expect("index"), index);
    }

    #[test]
    fn partition_count_limit_yields_no_space() {
        let device = fresh_device();
        let fvm = load(&device);
        assert!(matches!(
            fvm.allocate_partition(Guid([1; 16]), Guid([2; 16]), "z", 0),
            Err(FvmError::InvalidArgs(_))
        ));
        assert!(matches!(
            fvm.allocate_partition(
                Guid([1; 16]),
                Guid([2; 16]),
                "z",
                fvm.vslice_max() + 1
            ),
            Err(FvmError::OutOfRange(_))
        ));
    }

    #[test]
    fn resize_surface_checks_bounds() {
        let device = fresh_device();
        let fvm = load(&device);
        let vp = fvm
            .allocate_partition(Guid([1; 16]), Guid([2; 16]), "data", 1)
            .expect("allocate");
        let max = fvm.vslice_max();

        // Offset 0 and out-of-range offsets never reach the tables.
        assert!(matches!(
            fvm.extend(&vp, Vslice(0), 1),
            Err(FvmError::OutOfRange(_))
        ));
        assert!(matches!(
            fvm.shrink(&vp, Vslice(0), 1),
            Err(FvmError::OutOfRange(_))
        ));
        assert!(matches!(
            fvm.extend(&vp, Vslice(max), 1),
            Err(FvmError::OutOfRange(_))
        ));
        assert!(matches!(
            fvm.extend(&vp, Vslice(max - 1), 2),
            Err(FvmError::OutOfRange(_))
        ));

        // Zero-length requests succeed without touching anything.
        fvm.extend(&vp, Vslice(1), 0).expect("no-op extend");
        fvm.shrink(&vp, Vslice(1), 0).expect("no-op shrink");
        assert_eq!(vp.slice_count(), 1);
        assert_eq!(fvm.generation(), Generation(2));

        fvm.extend(&vp, Vslice(1), 2).expect("extend");
        fvm.shrink(&vp, Vslice(2), 1).expect("shrink");
        assert_eq!(vp.slice_count(), 2);

        fvm.destroy(&vp).expect("destroy");
        assert!(vp.is_killed());
    }

    #[test]
    fn generation_alternates_copies() {
        let device = fresh_device();
        let fvm = load(&device);
        let vp = fvm
            .allocate_partition(Guid([1; 16]), Guid([2; 16]), "data", 1)
            .expect("allocate");
        assert_eq!(fvm.current_copy(), MetadataCopy::Secondary);
        fvm.allocate_slices(&vp, Vslice(1), 1).expect("extend");
        assert_eq!(fvm.current_copy(), MetadataCopy::Primary);
        assert_eq!(fvm.generation(), Generation(3));
    }

    #[test]
    fn query_slices_batches_range_status() {
        let device = fresh_device();
        let fvm = load(&device);
        let vp = fvm
            .allocate_partition(Guid([1; 16]), Guid([2; 16]), "data", 3)
            .expect("allocate");

        let report = fvm
            .query_slices(&vp, &[Vslice(0), Vslice(3)])
            .expect("query");
        assert_eq!(report[0], (3, true));
        assert_eq!(report[1].1, false);
    }

    #[test]
    fn corrupt_double_mapping_fails_load() {
        let device = fresh_device();
        {
            let fvm = load(&device);
            fvm.allocate_partition(Guid([1; 16]), Guid([2; 16]), "data", 1)
                .expect("allocate");
        }

        // Point a second pslice at the same (vpart, vslice) in the current
        // (secondary) copy and restamp it.
        let geo = Geometry::compute(DISK, BLOCK, SLICE).expect("geometry");
        let base = geo.copy_offset(MetadataCopy::Secondary);
        let mut copy = vec![0_u8; geo.metadata_usize().expect("len")];
        device.device().read_exact_at(base, &mut copy).expect("read");

        let dup = SliceEntry::new(PartitionIndex(1), Vslice(0)).expect("entry");
        let offset = geo.slice_entry_offset(Pslice(5)).expect("offset");
        dup.write_at(&mut copy, offset).expect("write");
        stamp_checksum(&mut copy).expect("stamp");
        device.device().write_all_at(base, &copy).expect("write back");

        assert!(matches!(
            VPartitionManager::load(Arc::clone(&device)),
            Err(FvmError::Corruption(_))
        ));
    }

    #[test]
    fn corrupt_out_of_range_vslice_fails_load() {
        let device = fresh_device();
        {
            let fvm = load(&device);
            fvm.allocate_partition(Guid([1; 16]), Guid([2; 16]), "data", 1)
                .expect("allocate");
        }

        // Map a pslice to a vslice past the addressable range in the
        // current (secondary) copy and restamp it. The packed field holds
        // 48 bits, so the entry itself encodes fine.
        let geo = Geometry::compute(DISK, BLOCK, SLICE).expect("geometry");
        let base = geo.copy_offset(MetadataCopy::Secondary);
        let mut copy = vec![0_u8; geo.metadata_usize().expect("len")];
        device.device().read_exact_at(base, &mut copy).expect("read");

        let wild = SliceEntry::new(PartitionIndex(1), Vslice(geo.vslice_max() + 5))
            .expect("entry");
        let offset = geo.slice_entry_offset(Pslice(7)).expect("offset");
        wild.write_at(&mut copy, offset).expect("write");
        stamp_checksum(&mut copy).expect("stamp");
        device.device().write_all_at(base, &copy).expect("write back");

        assert!(matches!(
            VPartitionManager::load(Arc::clone(&device)),
            Err(FvmError::Corruption(_))
        ));
    }

    #[test]
    fn load_background_delivers_result() {
        let device = fresh_device();
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = VPartitionManager::load_background(device, move |result| {
            tx.send(result.map(|fvm| fvm.slice_size())).expect("send");
        });
        let loaded = rx.recv().expect("recv").expect("load");
        assert_eq!(loaded, SLICE);
        handle.join().expect("join");
    }
}
