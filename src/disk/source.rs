//! Backup side: presents a live device as a lazily expanded tree of entries.
//!
//! Walk order is depth-first with the geometry first, then the root folder
//! and its disk items, then each partition followed by its filesystems and
//! files. Folders are expanded only when the walk reaches them.

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;

use super::device::{open_device, RawDevice};
use super::error::{DiskError, Result};
use super::fs::{FilesystemCapability, FilesystemProvider, FilesystemTable};
use super::geometry::GeometryMetadata;
use super::gpt::scan_geometry;
use super::io::PartitionIo;
use super::layout::{disk_items, partition_extent, DiskItem, PARTITION_RAW_ITEM};
use super::path::{self, GEOMETRY_PATH};
use super::types::{Extent, FilesystemType};

#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryKind {
    Geometry,
    Root,
    DiskItem(DiskItem, Extent),
    Partition(u32),
    PartitionRaw(u32, Extent),
    Filesystem(u32, FilesystemType),
    Folder(u32, FilesystemType, String),
    File(u32, FilesystemType, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryClass {
    Geometry,
    Disk,
    Partition,
    Filesystem,
    Folder,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    pub class: EntryClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

impl EntryMetadata {
    fn new(class: EntryClass) -> Self {
        Self {
            class,
            size: None,
            type_name: None,
            modified: None,
        }
    }

    fn size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    fn type_name(mut self, name: impl Into<String>) -> Self {
        self.type_name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub path: String,
    pub is_folder: bool,
    pub metadata: EntryMetadata,
    kind: EntryKind,
}

impl SourceEntry {
    fn item(path: String, kind: EntryKind, metadata: EntryMetadata) -> Self {
        Self {
            path,
            is_folder: false,
            metadata,
            kind,
        }
    }

    fn folder(path: String, kind: EntryKind, metadata: EntryMetadata) -> Self {
        Self {
            path,
            is_folder: true,
            metadata,
            kind,
        }
    }
}

/// A device opened for backup together with its scanned geometry.
pub struct SourceDisk {
    device: Arc<dyn RawDevice>,
    geometry: GeometryMetadata,
    geometry_bytes: Vec<u8>,
    scanned_at: DateTime<Utc>,
    filesystems: FilesystemTable,
}

impl SourceDisk {
    /// Opens the device read-only and scans it. Failing to open or scan the
    /// device is fatal.
    pub fn open(
        disk: &Path,
        sector_size: u32,
        provider: Arc<dyn FilesystemProvider>,
    ) -> Result<Self> {
        let device = open_device(disk, false, sector_size)?;
        let geometry = scan_geometry(disk, device.as_ref())?;
        Self::from_parts(device, geometry, provider)
    }

    /// Uses an already known geometry instead of scanning.
    pub fn from_parts(
        device: Arc<dyn RawDevice>,
        geometry: GeometryMetadata,
        provider: Arc<dyn FilesystemProvider>,
    ) -> Result<Self> {
        geometry.validate()?;
        let geometry_bytes = geometry.serialize()?;
        let filesystems = FilesystemTable::new(provider, device.clone());
        info!(
            "source {}: {} partitions, {} filesystems",
            device.path(),
            geometry.partitions.len(),
            geometry.filesystems.len()
        );
        Ok(Self {
            device,
            geometry,
            geometry_bytes,
            scanned_at: Utc::now(),
            filesystems,
        })
    }

    pub fn geometry(&self) -> &GeometryMetadata {
        &self.geometry
    }

    pub fn walk(&self) -> SourceWalk<'_> {
        let geometry = SourceEntry::item(
            GEOMETRY_PATH.to_string(),
            EntryKind::Geometry,
            EntryMetadata {
                modified: Some(self.scanned_at),
                ..EntryMetadata::new(EntryClass::Geometry).size(self.geometry_bytes.len() as u64)
            },
        );
        let mut root_meta = EntryMetadata::new(EntryClass::Disk)
            .type_name(self.geometry.table_type().as_str());
        if let Some(disk) = &self.geometry.disk {
            root_meta = root_meta.size(disk.size);
        }
        let root = SourceEntry::folder(path::disk_item_path(""), EntryKind::Root, root_meta);
        SourceWalk {
            disk: self,
            stack: vec![root, geometry],
        }
    }

    pub fn open_read(&self, entry: &SourceEntry) -> Result<Box<dyn Read + Send>> {
        match &entry.kind {
            EntryKind::Geometry => Ok(Box::new(Cursor::new(self.geometry_bytes.clone()))),
            EntryKind::DiskItem(_, extent) | EntryKind::PartitionRaw(_, extent) => {
                Ok(Box::new(PartitionIo::new(self.device.clone(), *extent)))
            }
            EntryKind::File(number, fs_type, fs_path) => {
                let fs = self.capability(*number, *fs_type)?;
                Ok(fs.open_read(fs_path)?)
            }
            _ => Err(DiskError::UnsupportedOperation(format!(
                "{} is a folder",
                entry.path
            ))),
        }
    }

    fn capability(&self, number: u32, fs_type: FilesystemType) -> Result<Arc<dyn FilesystemCapability>> {
        let missing = || DiskError::NoMatchingFilesystem {
            partition: number,
            fs_type,
        };
        let partition = self.geometry.partition(number).ok_or_else(missing)?;
        let filesystem = self.geometry.filesystem(number, fs_type).ok_or_else(missing)?;
        self.filesystems
            .get(partition, filesystem)?
            .ok_or_else(missing)
    }

    fn children(&self, entry: &SourceEntry) -> Result<Vec<SourceEntry>> {
        match &entry.kind {
            EntryKind::Root => Ok(self.root_children()),
            EntryKind::Partition(number) => self.partition_children(*number),
            EntryKind::Filesystem(number, fs_type) => self.fs_children(*number, *fs_type, ""),
            EntryKind::Folder(number, fs_type, dir) => self.fs_children(*number, *fs_type, dir),
            _ => Ok(Vec::new()),
        }
    }

    fn root_children(&self) -> Vec<SourceEntry> {
        let mut out: Vec<SourceEntry> = disk_items(&self.geometry)
            .into_iter()
            .map(|(item, extent)| {
                SourceEntry::item(
                    path::disk_item_path(item.file_name()),
                    EntryKind::DiskItem(item, extent),
                    EntryMetadata::new(EntryClass::Disk).size(extent.len),
                )
            })
            .collect();

        for part in &self.geometry.partitions {
            let meta = EntryMetadata::new(EntryClass::Partition)
                .size(part.size)
                .type_name(part.partition_type.clone());
            out.push(SourceEntry::folder(
                path::partition_path(part),
                EntryKind::Partition(part.number),
                meta,
            ));
        }
        out
    }

    fn partition_children(&self, number: u32) -> Result<Vec<SourceEntry>> {
        let partition = self
            .geometry
            .partition(number)
            .ok_or(DiskError::PartitionNotFound {
                table_type: self.geometry.table_type(),
                number,
            })?;

        let mut out = Vec::new();
        for filesystem in self.geometry.filesystems_on(number) {
            match self.filesystems.get(partition, filesystem) {
                Ok(Some(_)) => out.push(SourceEntry::folder(
                    path::filesystem_path(partition, filesystem.fs_type),
                    EntryKind::Filesystem(number, filesystem.fs_type),
                    EntryMetadata::new(EntryClass::Filesystem)
                        .type_name(filesystem.fs_type.as_str()),
                )),
                Ok(None) => {}
                Err(e) => warn!(
                    "cannot open {} on partition {number}: {e}",
                    filesystem.fs_type
                ),
            }
        }

        if out.is_empty() {
            // No readable filesystem: keep the partition content as one blob.
            let extent = partition_extent(partition);
            out.push(SourceEntry::item(
                path::partition_item_path(partition, PARTITION_RAW_ITEM),
                EntryKind::PartitionRaw(number, extent),
                EntryMetadata::new(EntryClass::Partition).size(extent.len),
            ));
        }
        Ok(out)
    }

    fn fs_children(&self, number: u32, fs_type: FilesystemType, dir: &str) -> Result<Vec<SourceEntry>> {
        let fs = self.capability(number, fs_type)?;
        let partition = self
            .geometry
            .partition(number)
            .ok_or(DiskError::NoMatchingFilesystem {
                partition: number,
                fs_type,
            })?;

        let entries = fs.list_dir(dir)?;
        Ok(entries
            .into_iter()
            .map(|e| {
                let child = if dir.is_empty() {
                    e.name.clone()
                } else {
                    format!("{}/{}", dir.trim_end_matches('/'), e.name)
                };
                let virtual_path = path::file_path(partition, fs_type, &child);
                if e.is_dir {
                    SourceEntry::folder(
                        virtual_path,
                        EntryKind::Folder(number, fs_type, child),
                        EntryMetadata::new(EntryClass::Folder),
                    )
                } else {
                    let mut meta = EntryMetadata::new(EntryClass::File);
                    meta.size = e.size;
                    SourceEntry::item(virtual_path, EntryKind::File(number, fs_type, child), meta)
                }
            })
            .collect())
    }
}

/// Depth-first walk over a [`SourceDisk`]. Subtrees that cannot be listed
/// are logged and skipped; their siblings are still visited.
pub struct SourceWalk<'a> {
    disk: &'a SourceDisk,
    stack: Vec<SourceEntry>,
}

impl Iterator for SourceWalk<'_> {
    type Item = SourceEntry;

    fn next(&mut self) -> Option<SourceEntry> {
        let entry = self.stack.pop()?;
        if entry.is_folder {
            match self.disk.children(&entry) {
                Ok(children) => self.stack.extend(children.into_iter().rev()),
                Err(e) => warn!("skipping contents of {}: {e}", entry.path),
            }
        }
        Some(entry)
    }
}
