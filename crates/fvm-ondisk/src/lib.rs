#![forbid(unsafe_code)]
//! On-disk metadata format for FVM.
//!
//! The device carries two equally-sized metadata copies back to back at
//! byte offsets 0 and `metadata_size`, followed by the slice data region.
//! Each copy is:
//!
//! ```text
//! [ superblock (512 B) | partition table | slice allocation table ]
//! ```
//!
//! A crc32c over the whole copy (checksum field zeroed) plus a monotonic
//! generation counter decide which copy is current. Writers always target
//! the stale copy and flip currency only after the write succeeds, so a
//! crash mid-write leaves the old copy intact and valid.
//!
//! All fields are little-endian; parsing and serialization use the explicit
//! field codecs from `fvm-types`, never derived serialization.

use fvm_types::{
    ensure_slice, read_fixed, read_le_u32, read_le_u64, trim_nul_padded, u64_to_usize,
    write_fixed, write_le_u32, write_le_u64, Generation, Guid, ParseError, PartitionIndex, Pslice,
    Vslice, FVM_MAGIC, FVM_VERSION, GUID_LEN, MAX_PARTITION_BYTES, NAME_LEN,
    PARTITION_ENTRY_SIZE, PARTITION_TABLE_ENTRIES, SLICE_ENTRY_SIZE, SUPERBLOCK_SIZE,
};
use serde::{Deserialize, Serialize};

// Superblock field offsets.
const SB_MAGIC: usize = 0;
const SB_VERSION: usize = 8;
const SB_PSLICE_COUNT: usize = 16;
const SB_SLICE_SIZE: usize = 24;
const SB_PARTITION_TABLE_SIZE: usize = 32;
const SB_ALLOCATION_TABLE_SIZE: usize = 40;
const SB_GENERATION: usize = 48;
const SB_CHECKSUM: usize = 56;

// Partition entry field offsets.
const PE_TYPE_GUID: usize = 0;
const PE_GUID: usize = 16;
const PE_SLICES: usize = 32;
const PE_FLAGS: usize = 36;
const PE_NAME: usize = 40;

/// Slice entries pack the owning partition into the low 16 bits and the
/// virtual slice index into the upper 48.
const SLICE_VSLICE_SHIFT: u32 = 16;
const SLICE_VSLICE_MAX: u64 = (1 << (64 - SLICE_VSLICE_SHIFT)) - 1;

// ── Superblock ──────────────────────────────────────────────────────────────

/// Parsed superblock header of one metadata copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub pslice_count: u64,
    pub slice_size: u64,
    /// Partition table length in bytes.
    pub partition_table_size: u64,
    /// Slice allocation table length in bytes.
    pub allocation_table_size: u64,
    pub generation: Generation,
    pub checksum: u32,
}

impl Superblock {
    /// Parse from the first [`SUPERBLOCK_SIZE`] bytes of a metadata copy.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, SUPERBLOCK_SIZE)?;

        let magic = read_le_u64(data, SB_MAGIC)?;
        if magic != FVM_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: FVM_MAGIC,
                actual: magic,
            });
        }
        let version = read_le_u64(data, SB_VERSION)?;
        if version != FVM_VERSION {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unsupported format version",
            });
        }

        Ok(Self {
            pslice_count: read_le_u64(data, SB_PSLICE_COUNT)?,
            slice_size: read_le_u64(data, SB_SLICE_SIZE)?,
            partition_table_size: read_le_u64(data, SB_PARTITION_TABLE_SIZE)?,
            allocation_table_size: read_le_u64(data, SB_ALLOCATION_TABLE_SIZE)?,
            generation: Generation(read_le_u64(data, SB_GENERATION)?),
            checksum: read_le_u32(data, SB_CHECKSUM)?,
        })
    }

    /// Serialize into the first [`SUPERBLOCK_SIZE`] bytes of a metadata copy.
    ///
    /// The checksum field is written as stored in `self`; callers stamping a
    /// fresh copy should zero it and use [`stamp_checksum`] afterwards.
    pub fn write_to(&self, data: &mut [u8]) -> Result<(), ParseError> {
        ensure_slice(data, 0, SUPERBLOCK_SIZE)?;
        data[..SUPERBLOCK_SIZE].fill(0);

        write_le_u64(data, SB_MAGIC, FVM_MAGIC)?;
        write_le_u64(data, SB_VERSION, FVM_VERSION)?;
        write_le_u64(data, SB_PSLICE_COUNT, self.pslice_count)?;
        write_le_u64(data, SB_SLICE_SIZE, self.slice_size)?;
        write_le_u64(data, SB_PARTITION_TABLE_SIZE, self.partition_table_size)?;
        write_le_u64(data, SB_ALLOCATION_TABLE_SIZE, self.allocation_table_size)?;
        write_le_u64(data, SB_GENERATION, self.generation.0)?;
        write_le_u32(data, SB_CHECKSUM, self.checksum)?;
        Ok(())
    }
}

// ── Checksum over a metadata copy ───────────────────────────────────────────

/// Compute the crc32c of a full metadata copy with the checksum field zeroed.
pub fn metadata_checksum(copy: &[u8]) -> Result<u32, ParseError> {
    ensure_slice(copy, 0, SB_CHECKSUM + 4)?;
    let mut crc = crc32c::crc32c(&copy[..SB_CHECKSUM]);
    crc = crc32c::crc32c_append(crc, &[0_u8; 4]);
    crc = crc32c::crc32c_append(crc, &copy[SB_CHECKSUM + 4..]);
    Ok(crc)
}

/// Recompute and store the checksum of a full metadata copy in place.
pub fn stamp_checksum(copy: &mut [u8]) -> Result<(), ParseError> {
    let crc = metadata_checksum(copy)?;
    write_le_u32(copy, SB_CHECKSUM, crc)
}

/// Whether a metadata copy parses and its stored checksum matches.
#[must_use]
pub fn copy_is_valid(copy: &[u8]) -> bool {
    match Superblock::parse(copy) {
        Ok(sb) => metadata_checksum(copy).is_ok_and(|crc| crc == sb.checksum),
        Err(_) => false,
    }
}

/// Which of the two on-disk metadata copies is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataCopy {
    Primary,
    Secondary,
}

impl MetadataCopy {
    /// The copy a write should target: always the stale one.
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Primary => Self::Secondary,
            Self::Secondary => Self::Primary,
        }
    }
}

/// Pick the current copy: valid beats invalid, then higher generation wins.
///
/// Ties go to the primary. Returns `None` when neither copy validates,
/// which the loader reports as unrecoverable corruption.
#[must_use]
pub fn pick_current(primary: &[u8], secondary: &[u8]) -> Option<MetadataCopy> {
    let p_ok = copy_is_valid(primary);
    let s_ok = copy_is_valid(secondary);
    match (p_ok, s_ok) {
        (false, false) => None,
        (true, false) => Some(MetadataCopy::Primary),
        (false, true) => Some(MetadataCopy::Secondary),
        (true, true) => {
            // Both parse and checksum; unwraps cannot fire.
            let p_gen = Superblock::parse(primary).map(|sb| sb.generation.0).unwrap_or(0);
            let s_gen = Superblock::parse(secondary).map(|sb| sb.generation.0).unwrap_or(0);
            if s_gen > p_gen {
                Some(MetadataCopy::Secondary)
            } else {
                Some(MetadataCopy::Primary)
            }
        }
    }
}

// ── Partition table entries ─────────────────────────────────────────────────

/// One entry of the on-disk virtual-partition table.
///
/// An entry with `slices == 0` is free and its index may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEntry {
    pub type_guid: Guid,
    pub guid: Guid,
    /// Number of virtual slices currently committed to this partition.
    pub slices: u32,
    pub flags: u32,
    pub name: [u8; NAME_LEN],
}

impl PartitionEntry {
    pub const FREE: Self = Self {
        type_guid: Guid::ZERO,
        guid: Guid::ZERO,
        slices: 0,
        flags: 0,
        name: [0; NAME_LEN],
    };

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.slices == 0
    }

    #[must_use]
    pub fn name(&self) -> String {
        trim_nul_padded(&self.name)
    }

    /// Parse the entry at `offset` within a metadata copy.
    pub fn parse_at(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        let raw = ensure_slice(data, offset, PARTITION_ENTRY_SIZE)?;
        Ok(Self {
            type_guid: Guid(read_fixed::<GUID_LEN>(raw, PE_TYPE_GUID)?),
            guid: Guid(read_fixed::<GUID_LEN>(raw, PE_GUID)?),
            slices: read_le_u32(raw, PE_SLICES)?,
            flags: read_le_u32(raw, PE_FLAGS)?,
            name: read_fixed::<NAME_LEN>(raw, PE_NAME)?,
        })
    }

    /// Serialize the entry at `offset` within a metadata copy.
    pub fn write_at(&self, data: &mut [u8], offset: usize) -> Result<(), ParseError> {
        ensure_slice(data, offset, PARTITION_ENTRY_SIZE)?;
        let raw = &mut data[offset..offset + PARTITION_ENTRY_SIZE];
        write_fixed(raw, PE_TYPE_GUID, self.type_guid.as_bytes())?;
        write_fixed(raw, PE_GUID, self.guid.as_bytes())?;
        write_le_u32(raw, PE_SLICES, self.slices)?;
        write_le_u32(raw, PE_FLAGS, self.flags)?;
        write_fixed(raw, PE_NAME, &self.name)?;
        Ok(())
    }
}

// ── Slice allocation table entries ──────────────────────────────────────────

/// One entry of the global slice allocation table, packed into a u64.
///
/// `vpart == 0` means the physical slice is free; `vslice` is only
/// meaningful for allocated entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceEntry {
    pub vpart: PartitionIndex,
    pub vslice: Vslice,
}

impl SliceEntry {
    pub const FREE: Self = Self {
        vpart: PartitionIndex::RESERVED,
        vslice: Vslice(0),
    };

    pub fn new(vpart: PartitionIndex, vslice: Vslice) -> Result<Self, ParseError> {
        if vslice.0 > SLICE_VSLICE_MAX {
            return Err(ParseError::InvalidField {
                field: "vslice",
                reason: "exceeds 48-bit slice entry field",
            });
        }
        Ok(Self { vpart, vslice })
    }

    #[must_use]
    pub fn is_free(&self) -> bool {
        self.vpart.is_reserved()
    }

    #[must_use]
    pub fn to_raw(self) -> u64 {
        u64::from(self.vpart.0) | (self.vslice.0 << SLICE_VSLICE_SHIFT)
    }

    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self {
            // Masked to 16 bits, cannot truncate.
            #[allow(clippy::cast_possible_truncation)]
            vpart: PartitionIndex((raw & 0xFFFF) as u16),
            vslice: Vslice(raw >> SLICE_VSLICE_SHIFT),
        }
    }

    /// Parse the entry at `offset` within a metadata copy.
    pub fn parse_at(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self::from_raw(read_le_u64(data, offset)?))
    }

    /// Serialize the entry at `offset` within a metadata copy.
    pub fn write_at(&self, data: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_le_u64(data, offset, self.to_raw())
    }
}

// ── Geometry ────────────────────────────────────────────────────────────────

/// Derived layout of an FVM-formatted device.
///
/// Everything here is immutable after format/load; the manager reads it
/// without locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub disk_size: u64,
    pub block_size: u32,
    pub slice_size: u64,
    /// Size in bytes of one full metadata copy, block-aligned.
    pub metadata_size: u64,
    /// Number of usable physical slices, indexed `1..=pslice_count`.
    pub pslice_count: u64,
    pub partition_table_size: u64,
    pub allocation_table_size: u64,
}

impl Geometry {
    /// Compute the layout for a device of `disk_size` bytes.
    ///
    /// The allocation table is sized for the upper-bound slice count
    /// (`disk_size / slice_size`) so that the metadata region never needs
    /// to move; the usable count is then whatever fits after both copies.
    pub fn compute(disk_size: u64, block_size: u32, slice_size: u64) -> Result<Self, ParseError> {
        if slice_size == 0 || block_size == 0 || slice_size % u64::from(block_size) != 0 {
            return Err(ParseError::InvalidField {
                field: "slice_size",
                reason: "must be a nonzero multiple of the device block size",
            });
        }

        let max_slices = disk_size / slice_size;
        if max_slices == 0 {
            return Err(ParseError::InvalidField {
                field: "disk_size",
                reason: "smaller than one slice",
            });
        }

        let partition_table_size = (PARTITION_TABLE_ENTRIES * PARTITION_ENTRY_SIZE) as u64;
        // Entry 0 of the allocation table is reserved, like partition entry 0.
        let allocation_table_size = max_slices
            .checked_add(1)
            .and_then(|entries| entries.checked_mul(SLICE_ENTRY_SIZE as u64))
            .ok_or(ParseError::IntegerConversion {
                field: "allocation_table_size",
            })?;

        let raw = (SUPERBLOCK_SIZE as u64)
            .checked_add(partition_table_size)
            .and_then(|v| v.checked_add(allocation_table_size))
            .ok_or(ParseError::IntegerConversion {
                field: "metadata_size",
            })?;
        let metadata_size = fvm_types::align_up(raw, u64::from(block_size)).ok_or(
            ParseError::InvalidField {
                field: "block_size",
                reason: "must be a power of two",
            },
        )?;

        let data_bytes = disk_size
            .checked_sub(metadata_size.checked_mul(2).ok_or(
                ParseError::IntegerConversion {
                    field: "metadata_size",
                },
            )?)
            .ok_or(ParseError::InvalidField {
                field: "disk_size",
                reason: "too small for two metadata copies",
            })?;
        let pslice_count = data_bytes / slice_size;
        if pslice_count == 0 {
            return Err(ParseError::InvalidField {
                field: "disk_size",
                reason: "no room for data slices after metadata",
            });
        }

        Ok(Self {
            disk_size,
            block_size,
            slice_size,
            metadata_size,
            pslice_count,
            partition_table_size,
            allocation_table_size,
        })
    }

    /// Check that a parsed superblock matches this device's derived layout.
    pub fn check_superblock(&self, sb: &Superblock) -> Result<(), ParseError> {
        if sb.slice_size != self.slice_size {
            return Err(ParseError::InvalidField {
                field: "slice_size",
                reason: "does not match computed geometry",
            });
        }
        if sb.partition_table_size != self.partition_table_size {
            return Err(ParseError::InvalidField {
                field: "partition_table_size",
                reason: "does not match computed geometry",
            });
        }
        if sb.allocation_table_size != self.allocation_table_size {
            return Err(ParseError::InvalidField {
                field: "allocation_table_size",
                reason: "does not match computed geometry",
            });
        }
        if sb.pslice_count != self.pslice_count {
            return Err(ParseError::InvalidField {
                field: "pslice_count",
                reason: "does not match computed geometry",
            });
        }
        Ok(())
    }

    /// Maximum virtual slice index (exclusive) for any partition.
    #[must_use]
    pub fn vslice_max(&self) -> u64 {
        MAX_PARTITION_BYTES / self.slice_size
    }

    /// Device byte offset of a metadata copy.
    #[must_use]
    pub fn copy_offset(&self, copy: MetadataCopy) -> u64 {
        match copy {
            MetadataCopy::Primary => 0,
            MetadataCopy::Secondary => self.metadata_size,
        }
    }

    /// Offset of a partition-table entry within one metadata copy.
    pub fn partition_entry_offset(&self, index: PartitionIndex) -> Result<usize, ParseError> {
        let index = usize::from(index.0);
        if index == 0 || index >= PARTITION_TABLE_ENTRIES {
            return Err(ParseError::InvalidField {
                field: "partition_index",
                reason: "outside 1..PARTITION_TABLE_ENTRIES",
            });
        }
        Ok(SUPERBLOCK_SIZE + index * PARTITION_ENTRY_SIZE)
    }

    /// Offset of a slice-allocation-table entry within one metadata copy.
    pub fn slice_entry_offset(&self, pslice: Pslice) -> Result<usize, ParseError> {
        if pslice.is_free() || pslice.0 > self.pslice_count {
            return Err(ParseError::InvalidField {
                field: "pslice",
                reason: "outside 1..=pslice_count",
            });
        }
        let table_base = (SUPERBLOCK_SIZE as u64) + self.partition_table_size;
        let offset = table_base + pslice.0 * SLICE_ENTRY_SIZE as u64;
        u64_to_usize(offset, "slice_entry_offset")
    }

    /// Device byte offset of the start of a physical slice's data.
    pub fn slice_data_offset(&self, pslice: Pslice) -> Result<u64, ParseError> {
        if pslice.is_free() || pslice.0 > self.pslice_count {
            return Err(ParseError::InvalidField {
                field: "pslice",
                reason: "outside 1..=pslice_count",
            });
        }
        (self.metadata_size * 2)
            .checked_add((pslice.0 - 1) * self.slice_size)
            .ok_or(ParseError::IntegerConversion {
                field: "slice_data_offset",
            })
    }

    /// Build the superblock describing this geometry.
    #[must_use]
    pub fn superblock(&self, generation: Generation) -> Superblock {
        Superblock {
            pslice_count: self.pslice_count,
            slice_size: self.slice_size,
            partition_table_size: self.partition_table_size,
            allocation_table_size: self.allocation_table_size,
            generation,
            checksum: 0,
        }
    }

    /// Size in bytes of one metadata copy as a `usize`.
    pub fn metadata_usize(&self) -> Result<usize, ParseError> {
        u64_to_usize(self.metadata_size, "metadata_size")
    }
}

/// Build one freshly formatted metadata copy (all partitions and slices free).
pub fn format_copy(geometry: &Geometry, generation: Generation) -> Result<Vec<u8>, ParseError> {
    let mut copy = vec![0_u8; geometry.metadata_usize()?];
    geometry.superblock(generation).write_to(&mut copy)?;
    stamp_checksum(&mut copy)?;
    Ok(copy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_geometry() -> Geometry {
        // 64 MiB disk, 512-byte blocks, 1 MiB slices.
        Geometry::compute(64 << 20, 512, 1 << 20).expect("geometry")
    }

    #[test]
    fn geometry_layout_is_consistent() {
        let geo = test_geometry();
        assert_eq!(geo.partition_table_size, 64 * 1024);
        assert_eq!(geo.metadata_size % 512, 0);
        // Two copies plus the data region fit the disk.
        assert!(2 * geo.metadata_size + geo.pslice_count * geo.slice_size <= geo.disk_size);
        // One more slice would not fit.
        assert!(2 * geo.metadata_size + (geo.pslice_count + 1) * geo.slice_size > geo.disk_size);
        assert_eq!(geo.vslice_max(), (4_u64 << 40) / (1 << 20));
    }

    #[test]
    fn geometry_rejects_bad_parameters() {
        assert!(Geometry::compute(64 << 20, 512, 0).is_err());
        assert!(Geometry::compute(64 << 20, 512, 1000).is_err()); // not block multiple
        assert!(Geometry::compute(1 << 20, 512, 64 << 20).is_err()); // slice > disk
        assert!(Geometry::compute(2 << 20, 512, 1 << 20).is_err()); // metadata leaves no slices
    }

    #[test]
    fn superblock_round_trips() {
        let geo = test_geometry();
        let sb = geo.superblock(Generation(7));
        let mut buf = vec![0_u8; SUPERBLOCK_SIZE];
        sb.write_to(&mut buf).expect("write");
        let back = Superblock::parse(&buf).expect("parse");
        assert_eq!(back, sb);
        geo.check_superblock(&back).expect("matches geometry");
    }

    #[test]
    fn superblock_rejects_bad_magic_and_version() {
        let geo = test_geometry();
        let mut buf = vec![0_u8; SUPERBLOCK_SIZE];
        geo.superblock(Generation(0)).write_to(&mut buf).expect("write");

        let mut bad_magic = buf.clone();
        bad_magic[0] ^= 0xFF;
        assert!(matches!(
            Superblock::parse(&bad_magic),
            Err(ParseError::InvalidMagic { .. })
        ));

        let mut bad_version = buf;
        write_le_u64(&mut bad_version, SB_VERSION, 99).expect("poke");
        assert!(Superblock::parse(&bad_version).is_err());
    }

    #[test]
    fn check_superblock_detects_mismatched_tables() {
        let geo = test_geometry();
        let mut sb = geo.superblock(Generation(0));
        sb.allocation_table_size += 8;
        assert!(geo.check_superblock(&sb).is_err());

        let mut sb = geo.superblock(Generation(0));
        sb.pslice_count += 1;
        assert!(geo.check_superblock(&sb).is_err());
    }

    #[test]
    fn partition_entry_round_trips() {
        let geo = test_geometry();
        let mut copy = format_copy(&geo, Generation(0)).expect("format");

        let entry = PartitionEntry {
            type_guid: Guid([1; 16]),
            guid: Guid([2; 16]),
            slices: 12,
            flags: 0,
            name: fvm_types::encode_name("blobby").expect("name"),
        };
        let offset = geo
            .partition_entry_offset(PartitionIndex(3))
            .expect("offset");
        entry.write_at(&mut copy, offset).expect("write");

        let back = PartitionEntry::parse_at(&copy, offset).expect("parse");
        assert_eq!(back, entry);
        assert_eq!(back.name(), "blobby");
        assert!(!back.is_free());
        assert!(PartitionEntry::FREE.is_free());
    }

    #[test]
    fn partition_entry_offset_bounds() {
        let geo = test_geometry();
        assert!(geo.partition_entry_offset(PartitionIndex(0)).is_err());
        assert!(geo.partition_entry_offset(PartitionIndex(1)).is_ok());
        assert!(geo
            .partition_entry_offset(PartitionIndex(
                u16::try_from(PARTITION_TABLE_ENTRIES - 1).expect("fits")
            ))
            .is_ok());
        assert!(geo
            .partition_entry_offset(PartitionIndex(
                u16::try_from(PARTITION_TABLE_ENTRIES).expect("fits")
            ))
            .is_err());
    }

    #[test]
    fn slice_entry_packing_round_trips() {
        let entry = SliceEntry::new(PartitionIndex(5), Vslice(0x1234_5678)).expect("entry");
        let raw = entry.to_raw();
        assert_eq!(SliceEntry::from_raw(raw), entry);
        assert!(!entry.is_free());
        assert!(SliceEntry::FREE.is_free());
        assert_eq!(SliceEntry::from_raw(0), SliceEntry::FREE);

        // vslice too wide for the packed field
        assert!(SliceEntry::new(PartitionIndex(1), Vslice(1 << 50)).is_err());
    }

    #[test]
    fn slice_entry_table_round_trips() {
        let geo = test_geometry();
        let mut copy = format_copy(&geo, Generation(0)).expect("format");

        let entry = SliceEntry::new(PartitionIndex(2), Vslice(9)).expect("entry");
        let offset = geo.slice_entry_offset(Pslice(1)).expect("offset");
        entry.write_at(&mut copy, offset).expect("write");
        assert_eq!(SliceEntry::parse_at(&copy, offset).expect("parse"), entry);

        assert!(geo.slice_entry_offset(Pslice(0)).is_err());
        assert!(geo.slice_entry_offset(Pslice(geo.pslice_count)).is_ok());
        assert!(geo.slice_entry_offset(Pslice(geo.pslice_count + 1)).is_err());
    }

    #[test]
    fn slice_data_offsets_follow_metadata() {
        let geo = test_geometry();
        let first = geo.slice_data_offset(Pslice(1)).expect("offset");
        assert_eq!(first, geo.metadata_size * 2);
        let second = geo.slice_data_offset(Pslice(2)).expect("offset");
        assert_eq!(second, first + geo.slice_size);
        assert!(geo.slice_data_offset(Pslice(0)).is_err());
    }

    #[test]
    fn checksum_validates_and_detects_corruption() {
        let geo = test_geometry();
        let copy = format_copy(&geo, Generation(1)).expect("format");
        assert!(copy_is_valid(&copy));

        // Flip one byte in the allocation table.
        let mut corrupt = copy.clone();
        let tail = corrupt.len() - 1;
        corrupt[tail] ^= 0x01;
        assert!(!copy_is_valid(&corrupt));

        // Flip a byte in the stored checksum itself.
        let mut corrupt = copy;
        corrupt[SB_CHECKSUM] ^= 0x01;
        assert!(!copy_is_valid(&corrupt));
    }

    #[test]
    fn checksum_rejects_short_buffers() {
        assert!(matches!(
            metadata_checksum(&[0_u8; 16]),
            Err(ParseError::InsufficientData { .. })
        ));
        let mut short = vec![0_u8; 32];
        assert!(stamp_checksum(&mut short).is_err());
        assert!(!copy_is_valid(&short));
    }

    #[test]
    fn pick_current_prefers_validity_then_generation() {
        let geo = test_geometry();
        let gen1 = format_copy(&geo, Generation(1)).expect("format");
        let gen2 = format_copy(&geo, Generation(2)).expect("format");
        let mut broken = gen1.clone();
        broken[0] ^= 0xFF;

        assert_eq!(pick_current(&gen1, &gen2), Some(MetadataCopy::Secondary));
        assert_eq!(pick_current(&gen2, &gen1), Some(MetadataCopy::Primary));
        // Equal generations tie toward primary.
        assert_eq!(
            pick_current(&gen1, &gen1.clone()),
            Some(MetadataCopy::Primary)
        );
        assert_eq!(pick_current(&broken, &gen1), Some(MetadataCopy::Secondary));
        assert_eq!(pick_current(&gen2, &broken), Some(MetadataCopy::Primary));
        assert_eq!(pick_current(&broken, &broken.clone()), None);
    }

    #[test]
    fn metadata_copy_other_alternates() {
        assert_eq!(MetadataCopy::Primary.other(), MetadataCopy::Secondary);
        assert_eq!(MetadataCopy::Secondary.other(), MetadataCopy::Primary);
    }
}
