#![forbid(unsafe_code)]
//! Device access layer for FVM.
//!
//! Two capabilities are exposed, matching what the volume manager core
//! actually needs from the hardware below it:
//!
//! - [`ByteDevice`] — synchronous byte-addressed reads and writes, used only
//!   for metadata load/persist (a few kilobytes at a time).
//! - [`BlockTransport`] — an asynchronous block-request queue with per-request
//!   completion callbacks and a device-wide `sync` barrier, used on the data
//!   path. The core produces one queued request per physical sub-range it
//!   maps a virtual request onto.
//!
//! [`ByteTransport`] adapts any `ByteDevice` into a transport that executes
//! requests synchronously at queue time; tests and the CLI run on it, while
//! a real driver binding would supply its own queue-backed implementation.

use fvm_error::{FvmError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

// ── Byte-addressed devices ──────────────────────────────────────────────────

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Intrinsic block size of the device in bytes.
    fn block_size(&self) -> u32;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_range(offset: u64, len: usize, device_len: u64, what: &str) -> Result<()> {
    let len = u64::try_from(len)
        .map_err(|_| FvmError::InvalidArgs(format!("{what} length overflows u64")))?;
    let end = offset
        .checked_add(len)
        .ok_or_else(|| FvmError::InvalidArgs(format!("{what} range overflows u64")))?;
    if end > device_len {
        return Err(FvmError::OutOfRange(format!(
            "{what} out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(())
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not require a shared
/// seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    block_size: u32,
    writable: bool,
}

impl FileByteDevice {
    /// Open `path` read-write, falling back to read-only.
    pub fn open(path: impl AsRef<Path>, block_size: u32) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(FvmError::InvalidArgs(format!(
                "invalid block_size={block_size} (must be a nonzero power of two)"
            )));
        }
        Ok(Self {
            file: Arc::new(file),
            len,
            block_size,
            writable,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(FvmError::BadState("device opened read-only".into()));
        }
        check_range(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device.
///
/// Backs unit and end-to-end tests; also handy for formatting scratch images
/// before copying them out.
#[derive(Debug)]
pub struct MemByteDevice {
    bytes: Mutex<Vec<u8>>,
    block_size: u32,
}

impl MemByteDevice {
    /// Create a zero-filled device of `len` bytes.
    #[must_use]
    pub fn new(len: usize, block_size: u32) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
            block_size,
        }
    }

    /// Snapshot the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    /// Replace the contents wholesale (for crash-simulation tests).
    pub fn restore(&self, image: Vec<u8>) {
        *self.bytes.lock() = image;
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(u64::MAX)
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_range(offset, buf.len(), bytes.len() as u64, "read")?;
        let offset = usize::try_from(offset)
            .map_err(|_| FvmError::InvalidArgs("offset overflows usize".into()))?;
        buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        check_range(offset, buf.len(), bytes.len() as u64, "write")?;
        let offset = usize::try_from(offset)
            .map_err(|_| FvmError::InvalidArgs("offset overflows usize".into()))?;
        bytes[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

// ── Block transport ─────────────────────────────────────────────────────────

/// Static geometry reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub block_size: u32,
    pub block_count: u64,
}

/// Operation carried by a [`BlockRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    Read,
    Write,
    Flush,
}

/// The caller's transfer buffer, addressed in bytes.
///
/// A request references a shared buffer handle plus an offset, so that one
/// logical request split into several physical sub-requests can target
/// disjoint windows of the same buffer.
pub trait RequestBuf: Send + Sync {
    /// Length of the buffer in bytes.
    fn len_bytes(&self) -> u64;

    /// Copy `dst.len()` bytes out of the buffer starting at `offset`.
    fn copy_out(&self, offset: u64, dst: &mut [u8]) -> Result<()>;

    /// Copy `src` into the buffer starting at `offset`.
    fn copy_in(&self, offset: u64, src: &[u8]) -> Result<()>;
}

/// Heap-backed request buffer.
#[derive(Debug)]
pub struct VecBuf {
    bytes: Mutex<Vec<u8>>,
}

impl VecBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(bytes),
        })
    }

    #[must_use]
    pub fn zeroed(len: usize) -> Arc<Self> {
        Self::new(vec![0_u8; len])
    }

    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl RequestBuf for VecBuf {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(u64::MAX)
    }

    fn copy_out(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_range(offset, dst.len(), bytes.len() as u64, "buffer read")?;
        let offset = usize::try_from(offset)
            .map_err(|_| FvmError::InvalidArgs("buffer offset overflows usize".into()))?;
        dst.copy_from_slice(&bytes[offset..offset + dst.len()]);
        Ok(())
    }

    fn copy_in(&self, offset: u64, src: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        check_range(offset, src.len(), bytes.len() as u64, "buffer write")?;
        let offset = usize::try_from(offset)
            .map_err(|_| FvmError::InvalidArgs("buffer offset overflows usize".into()))?;
        bytes[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }
}

/// Completion callback for a queued request. Receives the request status.
pub type Completion = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// One queued block request. Offsets and length are in device blocks.
pub struct BlockRequest {
    pub op: BlockOp,
    /// Transfer buffer; unused for `Flush`.
    pub buf: Option<Arc<dyn RequestBuf>>,
    /// Offset into `buf`, in blocks.
    pub buf_offset: u64,
    /// Offset on the device, in blocks.
    pub dev_offset: u64,
    /// Transfer length in blocks (0 for `Flush`).
    pub length: u64,
    /// Invoked exactly once when the request finishes.
    pub complete: Completion,
}

impl std::fmt::Debug for BlockRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRequest")
            .field("op", &self.op)
            .field("buf_offset", &self.buf_offset)
            .field("dev_offset", &self.dev_offset)
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

/// Asynchronous block-request queue plus barrier.
///
/// `queue` never returns an error: failures are reported through the
/// request's completion callback, mirroring hardware queue semantics.
pub trait BlockTransport: Send + Sync {
    fn info(&self) -> BlockInfo;

    fn queue(&self, request: BlockRequest);

    /// Block until every previously queued request has completed.
    fn sync(&self) -> Result<()>;
}

/// Synchronous [`BlockTransport`] over any [`ByteDevice`].
///
/// Requests execute inline at `queue` time, so `sync` only needs to flush
/// the underlying device.
#[derive(Debug)]
pub struct ByteTransport<D: ByteDevice> {
    dev: D,
}

impl<D: ByteDevice> ByteTransport<D> {
    pub fn new(dev: D) -> Result<Self> {
        let block_size = dev.block_size();
        if block_size == 0 {
            return Err(FvmError::InvalidArgs("device block_size is zero".into()));
        }
        if dev.len_bytes() % u64::from(block_size) != 0 {
            return Err(FvmError::Format(format!(
                "device length {} is not a multiple of block_size {block_size}",
                dev.len_bytes()
            )));
        }
        Ok(Self { dev })
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.dev
    }

    fn execute(&self, request: &BlockRequest) -> Result<()> {
        let info = self.info();
        let bs = u64::from(info.block_size);

        match request.op {
            BlockOp::Flush => self.dev.sync(),
            BlockOp::Read | BlockOp::Write => {
                let buf = request
                    .buf
                    .as_ref()
                    .ok_or_else(|| FvmError::InvalidArgs("transfer request without buffer".into()))?;
                let end = request
                    .dev_offset
                    .checked_add(request.length)
                    .ok_or_else(|| FvmError::OutOfRange("device range overflow".into()))?;
                if end > info.block_count {
                    return Err(FvmError::OutOfRange(format!(
                        "request past end of device: dev_offset={} length={} block_count={}",
                        request.dev_offset, request.length, info.block_count
                    )));
                }

                let byte_len = request
                    .length
                    .checked_mul(bs)
                    .ok_or_else(|| FvmError::OutOfRange("byte length overflow".into()))?;
                let byte_len = usize::try_from(byte_len)
                    .map_err(|_| FvmError::InvalidArgs("request too large for memory".into()))?;
                let dev_byte = request.dev_offset * bs;
                let buf_byte = request
                    .buf_offset
                    .checked_mul(bs)
                    .ok_or_else(|| FvmError::OutOfRange("buffer offset overflow".into()))?;

                let mut scratch = vec![0_u8; byte_len];
                if request.op == BlockOp::Read {
                    self.dev.read_exact_at(dev_byte, &mut scratch)?;
                    buf.copy_in(buf_byte, &scratch)
                } else {
                    buf.copy_out(buf_byte, &mut scratch)?;
                    self.dev.write_all_at(dev_byte, &scratch)
                }
            }
        }
    }
}

impl<D: ByteDevice> BlockTransport for ByteTransport<D> {
    fn info(&self) -> BlockInfo {
        let block_size = self.dev.block_size();
        BlockInfo {
            block_size,
            block_count: self.dev.len_bytes() / u64::from(block_size),
        }
    }

    fn queue(&self, request: BlockRequest) {
        let status = self.execute(&request);
        (request.complete)(status);
    }

    fn sync(&self) -> Result<()> {
        self.dev.sync()
    }
}

impl<D: ByteDevice> ByteDevice for ByteTransport<D> {
    fn len_bytes(&self) -> u64 {
        self.dev.len_bytes()
    }

    fn block_size(&self) -> u32 {
        self.dev.block_size()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.dev.read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.dev.write_all_at(offset, buf)
    }

    fn sync(&self) -> Result<()> {
        self.dev.sync()
    }
}

/// Everything the volume manager needs from the device below it.
pub trait VolumeDevice: ByteDevice + BlockTransport {}

impl<T: ByteDevice + BlockTransport> VolumeDevice for T {}
