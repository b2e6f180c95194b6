//! Raw device access.
//!
//! Everything above this layer talks to a device through [`RawDevice`]; the
//! concrete handle is injected so the engine never depends on one operating
//! system.

use std::fs::{File, OpenOptions, TryLockError};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use log::debug;

use super::error::{DiskError, Result};

pub const DEFAULT_SECTOR_SIZE: u32 = 512;

pub trait RawDevice: Send + Sync {
    fn path(&self) -> &str;
    fn size(&self) -> u64;
    fn sector_size(&self) -> u32;
    fn is_writable(&self) -> bool;
    /// Fills `buf` from `offset`; short reads are errors.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()>;
    fn flush(&self) -> io::Result<()>;
}

fn check_extent(size: u64, offset: u64, len: usize) -> io::Result<()> {
    let end = offset.checked_add(len as u64);
    match end {
        Some(end) if end <= size => Ok(()),
        _ => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("range {offset}+{len} is past the end of the device ({size} bytes)"),
        )),
    }
}

/// Device or image file opened through the host filesystem.
pub struct FileDevice {
    path: String,
    file: Mutex<File>,
    size: u64,
    sector_size: u32,
    writable: bool,
}

impl FileDevice {
    fn open_file(path: &Path, writable: bool, sector_size: u32) -> io::Result<Self> {
        let mut file = OpenOptions::new().read(true).write(writable).open(path)?;
        // A writer holds the device exclusively until the handle is dropped.
        if writable {
            file.try_lock().map_err(|e| match e {
                TryLockError::WouldBlock => io::Error::new(
                    io::ErrorKind::ResourceBusy,
                    "device is already opened for writing",
                ),
                TryLockError::Error(e) => e,
            })?;
        }
        // Block devices report a zero length through metadata; seeking works
        // for both regular files and devices.
        let size = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            path: path.display().to_string(),
            file: Mutex::new(file),
            size,
            sector_size,
            writable,
        })
    }
}

impl RawDevice for FileDevice {
    fn path(&self) -> &str {
        &self.path
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_extent(self.size, offset, buf.len())?;
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is opened read-only", self.path),
            ));
        }
        check_extent(self.size, offset, data.len())?;
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)
    }

    fn flush(&self) -> io::Result<()> {
        let file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if self.writable {
            file.sync_all()?;
        }
        Ok(())
    }
}

/// Opens `path` as a raw device.
pub fn open_device(path: &Path, writable: bool, sector_size: u32) -> Result<Arc<dyn RawDevice>> {
    let mode = if writable { "read-write" } else { "read" };
    if !platform_supported() {
        return Err(DiskError::PlatformNotSupported(std::env::consts::OS));
    }
    if sector_size == 0 || !sector_size.is_power_of_two() {
        return Err(DiskError::DiskInitializeFailed {
            path: path.display().to_string(),
            mode,
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid sector size {sector_size}"),
            ),
        });
    }
    let device = FileDevice::open_file(path, writable, sector_size).map_err(|source| {
        DiskError::DiskInitializeFailed {
            path: path.display().to_string(),
            mode,
            source,
        }
    })?;
    debug!(
        "opened {} ({mode}, {} bytes, sector {})",
        device.path, device.size, device.sector_size
    );
    Ok(Arc::new(device))
}

fn platform_supported() -> bool {
    cfg!(any(target_os = "linux", target_os = "macos", target_os = "windows"))
}

/// Fixed-size device held in memory.
pub struct MemoryDevice {
    name: String,
    data: Mutex<Vec<u8>>,
    sector_size: u32,
}

impl MemoryDevice {
    pub fn new(size: usize, sector_size: u32) -> Self {
        Self::from_bytes(vec![0u8; size], sector_size)
    }

    pub fn from_bytes(data: Vec<u8>, sector_size: u32) -> Self {
        Self {
            name: "memory".to_string(),
            data: Mutex::new(data),
            sector_size,
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl RawDevice for MemoryDevice {
    fn path(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).len() as u64
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn is_writable(&self) -> bool {
        true
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        check_extent(data.len() as u64, offset, buf.len())?;
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        check_extent(data.len() as u64, offset, bytes.len())?;
        let start = offset as usize;
        data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}
