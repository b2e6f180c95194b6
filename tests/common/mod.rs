#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use diskstage::disk::fs::{FilesystemCapability, FilesystemProvider, FsStream};
use diskstage::disk::geometry::{
    DiskGeometry, FilesystemGeometry, GeometryMetadata, PartitionGeometry, PartitionTableGeometry,
};
use diskstage::disk::types::{DirEntry, FilesystemType, TableType};
use diskstage::{MemoryDevice, RawDevice};

pub const MIB: u64 = 1024 * 1024;
pub const SECTOR: u32 = 512;
/// Protective MBR, GPT header and 32 sectors of entries.
pub const GPT_TABLE_SIZE: u64 = 34 * SECTOR as u64;

/// Memory device counting `write_at` calls, optionally failing from the
/// n-th write on.
pub struct RecordingDevice {
    inner: MemoryDevice,
    writes: AtomicUsize,
    fail_from: Option<usize>,
}

impl RecordingDevice {
    pub fn new(size: u64) -> Self {
        Self::from_bytes(vec![0u8; size as usize])
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            inner: MemoryDevice::from_bytes(data, SECTOR),
            writes: AtomicUsize::new(0),
            fail_from: None,
        }
    }

    pub fn failing_from(size: u64, write: usize) -> Self {
        Self {
            fail_from: Some(write),
            ..Self::new(size)
        }
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.snapshot()
    }
}

impl RawDevice for RecordingDevice {
    fn path(&self) -> &str {
        "recording"
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn sector_size(&self) -> u32 {
        SECTOR
    }

    fn is_writable(&self) -> bool {
        true
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_at(offset, buf)
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        let n = self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_from.is_some_and(|from| n >= from) {
            return Err(io::Error::other("injected write failure"));
        }
        self.inner.write_at(offset, bytes)
    }

    fn flush(&self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// File tree kept in memory, standing in for a filesystem backend.
#[derive(Default)]
pub struct MemoryFs {
    pub files: Mutex<BTreeMap<String, Vec<u8>>>,
    pub dirs: Mutex<BTreeSet<String>>,
    pub broken_dirs: Mutex<BTreeSet<String>>,
}

fn key(path: &str) -> String {
    path.trim_matches('/').to_string()
}

impl MemoryFs {
    pub fn insert(&self, path: &str, data: &[u8]) {
        let path = key(path);
        let mut dirs = self.dirs.lock().unwrap();
        let mut parent = path.as_str();
        while let Some((p, _)) = parent.rsplit_once('/') {
            dirs.insert(p.to_string());
            parent = p;
        }
        self.files.lock().unwrap().insert(path, data.to_vec());
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(&key(path)).cloned()
    }

    pub fn break_dir(&self, path: &str) {
        self.broken_dirs.lock().unwrap().insert(key(path));
    }
}

pub struct MemoryCapability {
    pub fs_type: FilesystemType,
    pub fs: Arc<MemoryFs>,
}

impl FilesystemCapability for MemoryCapability {
    fn fs_type(&self) -> FilesystemType {
        self.fs_type
    }

    fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let dir = key(path);
        if self.fs.broken_dirs.lock().unwrap().contains(&dir) {
            return Err(anyhow!("cannot read directory {dir}"));
        }
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };
        let direct_child = |p: &String| {
            p.strip_prefix(&prefix)
                .filter(|rest| !rest.is_empty() && !rest.contains('/'))
                .map(str::to_string)
        };
        let mut out: Vec<DirEntry> = self
            .fs
            .dirs
            .lock()
            .unwrap()
            .iter()
            .filter_map(|d| direct_child(d))
            .map(|name| DirEntry {
                name,
                is_dir: true,
                size: None,
            })
            .collect();
        for (path, data) in self.fs.files.lock().unwrap().iter() {
            if let Some(name) = direct_child(path) {
                out.push(DirEntry {
                    name,
                    is_dir: false,
                    size: Some(data.len() as u64),
                });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn open_read(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let data = self.fs.get(path).ok_or_else(|| anyhow!("{path} not found"))?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn open_write(&self, path: &str) -> Result<Box<dyn FsStream>> {
        Ok(Box::new(MemoryStream {
            fs: self.fs.clone(),
            path: key(path),
            buf: Cursor::new(Vec::new()),
        }))
    }

    fn open_read_write(&self, path: &str) -> Result<Box<dyn FsStream>> {
        Ok(Box::new(MemoryStream {
            fs: self.fs.clone(),
            path: key(path),
            buf: Cursor::new(self.fs.get(path).unwrap_or_default()),
        }))
    }

    fn length(&self, path: &str) -> Result<u64> {
        self.fs
            .get(path)
            .map(|d| d.len() as u64)
            .ok_or_else(|| anyhow!("{path} not found"))
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let path = key(path);
        Ok(self.fs.files.lock().unwrap().contains_key(&path)
            || self.fs.dirs.lock().unwrap().contains(&path))
    }

    fn create_dir_all(&self, path: &str) -> Result<()> {
        let path = key(path);
        let mut dirs = self.fs.dirs.lock().unwrap();
        let mut current = String::new();
        for part in path.split('/').filter(|s| !s.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);
            dirs.insert(current.clone());
        }
        Ok(())
    }
}

struct MemoryStream {
    fs: Arc<MemoryFs>,
    path: String,
    buf: Cursor<Vec<u8>>,
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.buf.read(buf)
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.buf.seek(pos)
    }
}

impl FsStream for MemoryStream {
    fn finish(self: Box<Self>) -> Result<()> {
        let MemoryStream { fs, path, buf } = *self;
        fs.insert(&path, &buf.into_inner());
        Ok(())
    }
}

/// Serves NTFS filesystems from one shared [`MemoryFs`] per partition.
#[derive(Default)]
pub struct MemoryProvider {
    pub volumes: Mutex<BTreeMap<u32, Arc<MemoryFs>>>,
    pub opens: AtomicUsize,
}

impl MemoryProvider {
    pub fn volume(&self, partition: u32) -> Arc<MemoryFs> {
        self.volumes
            .lock()
            .unwrap()
            .entry(partition)
            .or_default()
            .clone()
    }
}

impl FilesystemProvider for MemoryProvider {
    fn open(
        &self,
        _device: Arc<dyn RawDevice>,
        partition: &PartitionGeometry,
        filesystem: &FilesystemGeometry,
    ) -> Result<Option<Arc<dyn FilesystemCapability>>> {
        if filesystem.fs_type != FilesystemType::Ntfs {
            return Ok(None);
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Arc::new(MemoryCapability {
            fs_type: FilesystemType::Ntfs,
            fs: self.volume(partition.number),
        })))
    }
}

fn partition(number: u32, start: u64, size: u64, fs: FilesystemType) -> PartitionGeometry {
    PartitionGeometry {
        number,
        partition_type: "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7".to_string(),
        start_offset: start,
        size,
        name: None,
        filesystem_type: fs,
        volume_guid: None,
        table_type: TableType::Gpt,
    }
}

/// 4 MiB GPT disk: partition 1 carries NTFS, partitions 2 and 3 have no
/// recognized filesystem.
pub fn gpt_geometry(disk_size: u64) -> GeometryMetadata {
    GeometryMetadata {
        disk: Some(DiskGeometry {
            device_path: "/dev/test".to_string(),
            size: disk_size,
            sector_size: SECTOR,
            sector_count: disk_size / SECTOR as u64,
            table_type: TableType::Gpt,
        }),
        partition_table: Some(PartitionTableGeometry {
            table_type: TableType::Gpt,
            size: GPT_TABLE_SIZE,
            sector_size: SECTOR,
            has_protective_mbr: Some(true),
            header_size: Some(92),
            entry_count: Some(128),
            entry_size: Some(128),
            disk_guid: None,
            mbr_size: Some(SECTOR),
        }),
        partitions: vec![
            partition(1, MIB, MIB, FilesystemType::Ntfs),
            partition(2, 2 * MIB, 512 * 1024, FilesystemType::Unknown),
            partition(3, 2 * MIB + 512 * 1024, 512 * 1024, FilesystemType::Unknown),
        ],
        filesystems: vec![FilesystemGeometry {
            partition_number: 1,
            fs_type: FilesystemType::Ntfs,
            partition_start_offset: MIB,
            block_size: 4096,
            metadata: None,
        }],
        ..GeometryMetadata::default()
    }
}
