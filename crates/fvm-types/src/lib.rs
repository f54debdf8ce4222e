#![forbid(unsafe_code)]
//! Shared index types, format constants, and little-endian parse helpers
//! for the FVM slice-based volume manager.
//!
//! The unit-carrying wrappers ([`Vslice`], [`Pslice`], [`PartitionIndex`])
//! exist to keep the two slice address spaces apart: a virtual slice is an
//! offset inside one partition's logical address space, a physical slice is
//! a unit of the real device. Mixing them is the classic volume-manager bug,
//! so conversions are explicit everywhere.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Magic value in the first superblock field.
pub const FVM_MAGIC: u64 = 0x0053_4c49_4345_4d56; // "VMESLIC\0" little-endian

/// On-disk format version understood by this build.
pub const FVM_VERSION: u64 = 1;

/// Size of the fixed superblock header region in bytes.
pub const SUPERBLOCK_SIZE: usize = 512;

/// Number of entries in the on-disk partition table, index 0 included.
///
/// Index 0 is reserved/invalid, so at most `PARTITION_TABLE_ENTRIES - 1`
/// partitions can exist at once.
pub const PARTITION_TABLE_ENTRIES: usize = 1024;

/// Serialized size of one partition-table entry.
pub const PARTITION_ENTRY_SIZE: usize = 64;

/// Serialized size of one slice-allocation-table entry.
pub const SLICE_ENTRY_SIZE: usize = 8;

/// Maximum byte size any single virtual partition may grow to.
///
/// `vslice_max = MAX_PARTITION_BYTES / slice_size`, independent of how much
/// physical storage actually backs the partition.
pub const MAX_PARTITION_BYTES: u64 = 4 << 40; // 4 TiB

/// Length of the GUID fields in a partition-table entry.
pub const GUID_LEN: usize = 16;

/// Length of the name field in a partition-table entry.
pub const NAME_LEN: usize = 24;

// ── Index newtypes ──────────────────────────────────────────────────────────

/// Virtual slice index within one partition's logical address space.
///
/// Valid range is `0..vslice_max`; unlike physical slices there is no
/// reserved sentinel value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Vslice(pub u64);

/// Physical slice index on the underlying device.
///
/// Physical slices are numbered `1..=pslice_count`; the value 0 means
/// "free / unmapped" and never appears inside a live extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pslice(pub u64);

impl Pslice {
    /// The "unallocated" sentinel.
    pub const FREE: Self = Self(0);

    #[must_use]
    pub fn is_free(self) -> bool {
        self.0 == 0
    }
}

/// Index into the on-disk partition table.
///
/// Index 0 is reserved: a slice-allocation-table entry pointing at
/// partition 0 is free, and a `VPartition` whose entry index has been
/// zeroed is killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionIndex(pub u16);

impl PartitionIndex {
    pub const RESERVED: Self = Self(0);

    #[must_use]
    pub fn is_reserved(self) -> bool {
        self.0 == 0
    }
}

/// Metadata generation counter (monotonic, bumped on every persist).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(pub u64);

impl Generation {
    /// The generation written to the copy that loses the ping-pong
    /// comparison when both copies are valid must be strictly lower.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl Vslice {
    /// Add a slice count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

impl fmt::Display for Vslice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Pslice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PartitionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── GUID ────────────────────────────────────────────────────────────────────

/// A 16-byte GUID as stored in partition-table entries.
///
/// FVM treats GUIDs as opaque byte strings; the canonical textual form is
/// only used for display and CLI output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Guid(pub [u8; GUID_LEN]);

impl Guid {
    pub const ZERO: Self = Self([0; GUID_LEN]);

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; GUID_LEN]
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; GUID_LEN] {
        &self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12],
            b[13], b[14], b[15]
        )
    }
}

// ── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Little-endian codec helpers ─────────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(
    data: &mut [u8],
    offset: usize,
    len: usize,
) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_fixed<const N: usize>(
    data: &mut [u8],
    offset: usize,
    value: &[u8; N],
) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, N)?.copy_from_slice(value);
    Ok(())
}

/// Decode a NUL-padded fixed-size name field.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).to_string()
}

/// Encode a name into a NUL-padded fixed-size field.
///
/// Fails if the name (in bytes) does not fit.
pub fn encode_name(name: &str) -> Result<[u8; NAME_LEN], ParseError> {
    let raw = name.as_bytes();
    if raw.len() > NAME_LEN {
        return Err(ParseError::InvalidField {
            field: "name",
            reason: "longer than NAME_LEN bytes",
        });
    }
    let mut out = [0_u8; NAME_LEN];
    out[..raw.len()].copy_from_slice(raw);
    Ok(out)
}

// ── Checked narrowing ───────────────────────────────────────────────────────

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `u64` to `u32` with an explicit error path.
pub fn u64_to_u32(value: u64, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` on overflow
/// or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_helpers_round_trip() {
        let mut buf = [0_u8; 16];
        write_le_u16(&mut buf, 0, 0x1234).expect("u16");
        write_le_u32(&mut buf, 2, 0x5678_9ABC).expect("u32");
        write_le_u64(&mut buf, 6, 0xDEAD_BEEF_CAFE_F00D).expect("u64");

        assert_eq!(read_le_u16(&buf, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&buf, 2).expect("u32"), 0x5678_9ABC);
        assert_eq!(read_le_u64(&buf, 6).expect("u64"), 0xDEAD_BEEF_CAFE_F00D);
    }

    #[test]
    fn read_past_end_reports_insufficient_data() {
        let buf = [0_u8; 4];
        assert_eq!(
            read_le_u64(&buf, 0),
            Err(ParseError::InsufficientData {
                needed: 8,
                offset: 0,
                actual: 4,
            })
        );
        assert!(read_le_u32(&buf, 2).is_err());
    }

    #[test]
    fn name_encoding_round_trips() {
        let raw = encode_name("data").expect("fits");
        assert_eq!(trim_nul_padded(&raw), "data");

        let full = "x".repeat(NAME_LEN);
        let raw = encode_name(&full).expect("exactly NAME_LEN fits");
        assert_eq!(trim_nul_padded(&raw), full);

        assert!(encode_name(&"x".repeat(NAME_LEN + 1)).is_err());
    }

    #[test]
    fn pslice_free_sentinel() {
        assert!(Pslice::FREE.is_free());
        assert!(!Pslice(1).is_free());
        assert!(PartitionIndex::RESERVED.is_reserved());
        assert!(!PartitionIndex(3).is_reserved());
    }

    #[test]
    fn guid_display_is_canonical() {
        let guid = Guid([
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E,
            0x0F, 0x10,
        ]);
        assert_eq!(guid.to_string(), "01020304-0506-0708-090a-0b0c0d0e0f10");
        assert!(Guid::ZERO.is_zero());
        assert!(!guid.is_zero());
    }

    #[test]
    fn vslice_checked_add() {
        assert_eq!(Vslice(10).checked_add(5), Some(Vslice(15)));
        assert_eq!(Vslice(u64::MAX).checked_add(1), None);
    }

    #[test]
    fn generation_next_wraps() {
        assert_eq!(Generation(4).next(), Generation(5));
        assert_eq!(Generation(u64::MAX).next(), Generation(0));
    }

    #[test]
    fn align_up_behaviour() {
        assert_eq!(align_up(4097, 4096), Some(8192));
        assert_eq!(align_up(4096, 4096), Some(4096));
        assert_eq!(align_up(0, 4096), Some(0));
        assert_eq!(align_up(u64::MAX, 4096), None);
        assert_eq!(align_up(100, 3), None);
        assert_eq!(align_up(100, 0), None);
    }

    #[test]
    fn narrowing_helpers() {
        assert_eq!(u64_to_u32(7, "x"), Ok(7));
        assert!(u64_to_u32(u64::from(u32::MAX) + 1, "x").is_err());
        assert_eq!(u64_to_usize(42, "x"), Ok(42));
    }
}
