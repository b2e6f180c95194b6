use anyhow::Result;
use log::debug;
use std::collections::HashMap;
use std::io::{Read, Seek, Write};
use std::sync::{Arc, Mutex, PoisonError};

mod ext4;

use super::device::RawDevice;
use super::geometry::{FilesystemGeometry, PartitionGeometry};
use super::layout::partition_extent;
use super::types::{DirEntry, Extent, FilesystemType};

pub use ext4::{mkfs_ext4, Ext4Capability};

/// Writable stream handed out by a filesystem backend. Content reaches the
/// filesystem no later than [`FsStream::finish`].
pub trait FsStream: Read + Write + Seek + Send {
    fn finish(self: Box<Self>) -> Result<()>;
}

/// File-level access to one filesystem on one partition.
///
/// Paths are relative to the filesystem root, `/`-separated.
pub trait FilesystemCapability: Send + Sync {
    fn fs_type(&self) -> FilesystemType;
    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>>;
    fn open_read(&self, path: &str) -> Result<Box<dyn Read + Send>>;
    fn open_write(&self, path: &str) -> Result<Box<dyn FsStream>>;
    fn open_read_write(&self, path: &str) -> Result<Box<dyn FsStream>>;
    fn length(&self, path: &str) -> Result<u64>;
    fn exists(&self, path: &str) -> Result<bool>;
    fn create_dir_all(&self, path: &str) -> Result<()>;
}

/// Opens filesystem backends. `Ok(None)` means the type has no backend.
pub trait FilesystemProvider: Send + Sync {
    fn open(
        &self,
        device: Arc<dyn RawDevice>,
        partition: &PartitionGeometry,
        filesystem: &FilesystemGeometry,
    ) -> Result<Option<Arc<dyn FilesystemCapability>>>;
}

/// Backends shipped with the crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeFilesystems;

impl FilesystemProvider for NativeFilesystems {
    fn open(
        &self,
        device: Arc<dyn RawDevice>,
        partition: &PartitionGeometry,
        filesystem: &FilesystemGeometry,
    ) -> Result<Option<Arc<dyn FilesystemCapability>>> {
        match filesystem.fs_type {
            FilesystemType::Ext4 => Ok(Some(Arc::new(Ext4Capability::new(
                device,
                partition_extent(partition),
            )))),
            _ => Ok(None),
        }
    }
}

type FsKey = (u32, FilesystemType);

/// Live filesystem handles keyed by `(partition number, type)`.
pub struct FilesystemTable {
    provider: Arc<dyn FilesystemProvider>,
    device: Arc<dyn RawDevice>,
    open: Mutex<HashMap<FsKey, Option<Arc<dyn FilesystemCapability>>>>,
}

impl FilesystemTable {
    pub fn new(provider: Arc<dyn FilesystemProvider>, device: Arc<dyn RawDevice>) -> Self {
        Self {
            provider,
            device,
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(
        &self,
        partition: &PartitionGeometry,
        filesystem: &FilesystemGeometry,
    ) -> Result<Option<Arc<dyn FilesystemCapability>>> {
        let key = (partition.number, filesystem.fs_type);
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = open.get(&key) {
            return Ok(entry.clone());
        }
        let handle = self
            .provider
            .open(self.device.clone(), partition, filesystem)?;
        debug!(
            "partition {} {}: backend {}",
            partition.number,
            filesystem.fs_type,
            if handle.is_some() { "opened" } else { "unavailable" }
        );
        open.insert(key, handle.clone());
        Ok(handle)
    }

    /// Drops every handle; used when the geometry they were opened for is
    /// replaced.
    pub fn clear(&self) {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

fn le16(buf: &[u8], at: usize) -> u32 {
    u16::from_le_bytes([buf[at], buf[at + 1]]) as u32
}

fn le32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn cluster_size(bytes_per_sector: u32, sectors_per_cluster: u8) -> u32 {
    // NTFS stores large cluster counts as a negative power of two.
    let sectors = if sectors_per_cluster > 0x80 {
        1u32 << (256 - sectors_per_cluster as u32).min(31)
    } else {
        sectors_per_cluster as u32
    };
    bytes_per_sector.saturating_mul(sectors)
}

/// Identifies the filesystem at the start of `extent` by its on-disk magic,
/// returning its type and block size.
pub fn detect_filesystem(device: &dyn RawDevice, extent: Extent) -> Option<(FilesystemType, u32)> {
    if extent.len >= 2048 {
        let mut sb = [0u8; 1024];
        if device.read_at(extent.offset + 1024, &mut sb).is_ok() && le16(&sb, 56) == 0xEF53 {
            let block_size = 1024u32 << le32(&sb, 24).min(16);
            let compat = le32(&sb, 92);
            let incompat = le32(&sb, 96);
            let fs_type = if incompat & (0x40 | 0x200) != 0 {
                FilesystemType::Ext4
            } else if compat & 0x4 != 0 {
                FilesystemType::Ext3
            } else {
                FilesystemType::Ext2
            };
            return Some((fs_type, block_size));
        }
    }

    if extent.len < 512 {
        return None;
    }
    let mut boot = [0u8; 512];
    if let Err(e) = device.read_at(extent.offset, &mut boot) {
        debug!("boot sector read at {} failed: {e}", extent.offset);
        return None;
    }

    let bytes_per_sector = le16(&boot, 11);
    if &boot[3..11] == b"NTFS    " {
        return Some((FilesystemType::Ntfs, cluster_size(bytes_per_sector, boot[13])));
    }
    if &boot[3..11] == b"EXFAT   " {
        let shift = (boot[108] as u32 + boot[109] as u32).min(31);
        return Some((FilesystemType::ExFat, 1u32 << shift));
    }
    if boot[510] == 0x55 && boot[511] == 0xAA {
        let fs_type = if boot.get(82..87) == Some(b"FAT32") {
            Some(FilesystemType::Fat32)
        } else if boot.get(54..59) == Some(b"FAT16") {
            Some(FilesystemType::Fat16)
        } else if boot.get(54..59) == Some(b"FAT12") {
            Some(FilesystemType::Fat12)
        } else {
            None
        };
        return fs_type.map(|t| (t, cluster_size(bytes_per_sector, boot[13])));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::device::MemoryDevice;

    #[test]
    fn detects_ntfs_boot_sector() {
        let mut image = vec![0u8; 1 << 16];
        let base = 4096;
        image[base + 3..base + 11].copy_from_slice(b"NTFS    ");
        image[base + 11..base + 13].copy_from_slice(&512u16.to_le_bytes());
        image[base + 13] = 8;
        let device = MemoryDevice::from_bytes(image, 512);
        let found = detect_filesystem(
            &device,
            Extent {
                offset: base as u64,
                len: 8192,
            },
        );
        assert_eq!(found, Some((FilesystemType::Ntfs, 4096)));
    }

    #[test]
    fn detects_ext4_superblock() {
        let mut image = vec![0u8; 1 << 16];
        let sb = 1024;
        image[sb + 56..sb + 58].copy_from_slice(&0xEF53u16.to_le_bytes());
        image[sb + 24..sb + 28].copy_from_slice(&2u32.to_le_bytes());
        image[sb + 96..sb + 100].copy_from_slice(&0x40u32.to_le_bytes());
        let device = MemoryDevice::from_bytes(image, 512);
        let found = detect_filesystem(&device, Extent { offset: 0, len: 1 << 16 });
        assert_eq!(found, Some((FilesystemType::Ext4, 4096)));
    }

    #[test]
    fn detects_fat32_label() {
        let mut image = vec![0u8; 4096];
        image[11..13].copy_from_slice(&512u16.to_le_bytes());
        image[13] = 1;
        image[82..87].copy_from_slice(b"FAT32");
        image[510] = 0x55;
        image[511] = 0xAA;
        let device = MemoryDevice::from_bytes(image, 512);
        let found = detect_filesystem(&device, Extent { offset: 0, len: 4096 });
        assert_eq!(found, Some((FilesystemType::Fat32, 512)));
    }

    #[test]
    fn blank_extent_has_no_filesystem() {
        let device = MemoryDevice::new(8192, 512);
        assert_eq!(detect_filesystem(&device, Extent { offset: 0, len: 8192 }), None);
    }
}
