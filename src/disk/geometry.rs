//! Serializable description of a device: disk, partition table, partitions
//! and the filesystems living on them.
//!
//! The geometry is written once per backup as `geometry.json` and restored
//! before any other item, because every partition or filesystem path is
//! resolved against it.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::error::{DiskError, Result};
use super::types::{FilesystemType, TableType};

pub const GEOMETRY_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeometryMetadata {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskGeometry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_table: Option<PartitionTableGeometry>,
    #[serde(default)]
    pub partitions: Vec<PartitionGeometry>,
    #[serde(default)]
    pub filesystems: Vec<FilesystemGeometry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskGeometry {
    pub device_path: String,
    pub size: u64,
    pub sector_size: u32,
    pub sector_count: u64,
    pub table_type: TableType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionTableGeometry {
    #[serde(rename = "type")]
    pub table_type: TableType,
    /// Bytes occupied by the primary table structures, counted from offset 0.
    pub size: u64,
    pub sector_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_protective_mbr: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mbr_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionGeometry {
    /// 1-based, unique per table type.
    pub number: u32,
    #[serde(rename = "type")]
    pub partition_type: String,
    pub start_offset: u64,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub filesystem_type: FilesystemType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_guid: Option<String>,
    pub table_type: TableType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemGeometry {
    pub partition_number: u32,
    #[serde(rename = "type")]
    pub fs_type: FilesystemType,
    pub partition_start_offset: u64,
    pub block_size: u32,
    /// Opaque blob owned by the filesystem backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

impl Default for GeometryMetadata {
    fn default() -> Self {
        Self {
            version: GEOMETRY_VERSION,
            disk: None,
            partition_table: None,
            partitions: Vec::new(),
            filesystems: Vec::new(),
        }
    }
}

impl GeometryMetadata {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let geometry: GeometryMetadata = serde_json::from_slice(bytes)?;
        geometry.validate()?;
        Ok(geometry)
    }

    pub fn table_type(&self) -> TableType {
        self.partition_table
            .as_ref()
            .map(|t| t.table_type)
            .or_else(|| self.disk.as_ref().map(|d| d.table_type))
            .unwrap_or(TableType::None)
    }

    pub fn sector_size(&self) -> u32 {
        self.disk
            .as_ref()
            .map(|d| d.sector_size)
            .or_else(|| self.partition_table.as_ref().map(|t| t.sector_size))
            .unwrap_or(512)
    }

    pub fn partition(&self, number: u32) -> Option<&PartitionGeometry> {
        self.partitions.iter().find(|p| p.number == number)
    }

    pub fn filesystem(&self, partition: u32, fs_type: FilesystemType) -> Option<&FilesystemGeometry> {
        self.filesystems
            .iter()
            .find(|f| f.partition_number == partition && f.fs_type == fs_type)
    }

    /// Smallest device that holds the recorded disk and every partition.
    pub fn required_size(&self) -> u64 {
        let disk = self.disk.as_ref().map(|d| d.size).unwrap_or(0);
        self.partitions
            .iter()
            .map(|p| p.start_offset.saturating_add(p.size))
            .fold(disk, u64::max)
    }

    pub fn filesystems_on(&self, partition: u32) -> impl Iterator<Item = &FilesystemGeometry> {
        self.filesystems
            .iter()
            .filter(move |f| f.partition_number == partition)
    }

    /// Checks the cross-references the path resolver relies on.
    pub fn validate(&self) -> Result<()> {
        if self.version == 0 || self.version > GEOMETRY_VERSION {
            return Err(DiskError::InvalidGeometry(format!(
                "unsupported version {}",
                self.version
            )));
        }
        if let Some(disk) = &self.disk
            && disk.sector_size == 0
        {
            return Err(DiskError::InvalidGeometry("sector size is zero".into()));
        }
        if let Some(table) = &self.partition_table
            && table.sector_size == 0
        {
            return Err(DiskError::InvalidGeometry(
                "partition table sector size is zero".into(),
            ));
        }

        let mut seen = HashSet::new();
        for part in &self.partitions {
            if part.number == 0 {
                return Err(DiskError::InvalidGeometry(
                    "partition numbers are 1-based".into(),
                ));
            }
            // Paths and filesystems address a partition by number alone.
            if !seen.insert(part.number) {
                return Err(DiskError::InvalidGeometry(format!(
                    "duplicate partition number {} ({})",
                    part.number, part.table_type
                )));
            }
        }
        for fs in &self.filesystems {
            if self.partition(fs.partition_number).is_none() {
                return Err(DiskError::InvalidGeometry(format!(
                    "{} filesystem references missing partition {}",
                    fs.fs_type, fs.partition_number
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> GeometryMetadata {
        GeometryMetadata {
            version: 1,
            disk: Some(DiskGeometry {
                device_path: "/dev/sdb".into(),
                size: 64 * 1024 * 1024,
                sector_size: 512,
                sector_count: 131072,
                table_type: TableType::Gpt,
            }),
            partition_table: Some(PartitionTableGeometry {
                table_type: TableType::Gpt,
                size: 512 * 34,
                sector_size: 512,
                has_protective_mbr: Some(true),
                header_size: Some(92),
                entry_count: Some(128),
                entry_size: Some(128),
                disk_guid: None,
                mbr_size: None,
            }),
            partitions: vec![PartitionGeometry {
                number: 1,
                partition_type: "0FC63DAF-8483-4772-8E79-3D69D8477DE4".into(),
                start_offset: 1024 * 1024,
                size: 32 * 1024 * 1024,
                name: None,
                filesystem_type: FilesystemType::Ext4,
                volume_guid: Some("5d2a6e0a-7f1c-4f07-9d0c-1c2b3a4d5e6f".into()),
                table_type: TableType::Gpt,
            }],
            filesystems: vec![FilesystemGeometry {
                partition_number: 1,
                fs_type: FilesystemType::Ext4,
                partition_start_offset: 1024 * 1024,
                block_size: 4096,
                metadata: None,
            }],
        }
    }

    #[test]
    fn absent_optionals_are_omitted() {
        let bytes = sample().serialize().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(!text.contains("null"));
        assert!(!text.contains("mbrSize"));
        assert!(!text.contains("\"name\""));
        assert!(text.contains("\"sectorSize\": 512"));
        assert!(text.contains("\"type\": \"GPT\""));

        let back = GeometryMetadata::deserialize(&bytes).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn rejects_filesystem_without_partition() {
        let mut geometry = sample();
        geometry.filesystems[0].partition_number = 7;
        let bytes = serde_json::to_vec(&geometry).unwrap();
        assert!(matches!(
            GeometryMetadata::deserialize(&bytes),
            Err(DiskError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn rejects_duplicate_partition_numbers() {
        let mut geometry = sample();
        let dup = geometry.partitions[0].clone();
        geometry.partitions.push(dup);
        let bytes = serde_json::to_vec(&geometry).unwrap();
        assert!(GeometryMetadata::deserialize(&bytes).is_err());
    }

    #[test]
    fn rejects_number_shared_across_table_types() {
        let mut geometry = sample();
        let mut mbr = geometry.partitions[0].clone();
        mbr.table_type = TableType::Mbr;
        mbr.partition_type = "0x83".into();
        geometry.partitions.insert(0, mbr);
        let bytes = serde_json::to_vec(&geometry).unwrap();
        assert!(matches!(
            GeometryMetadata::deserialize(&bytes),
            Err(DiskError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn required_size_covers_partitions_without_disk() {
        let mut geometry = sample();
        assert_eq!(geometry.required_size(), 64 * 1024 * 1024);
        geometry.disk = None;
        assert_eq!(geometry.required_size(), 33 * 1024 * 1024);
    }

    #[test]
    fn minimal_document_parses() {
        let geometry = GeometryMetadata::deserialize(br#"{"version":1}"#).unwrap();
        assert_eq!(geometry, GeometryMetadata::default());
        assert_eq!(geometry.table_type(), TableType::None);
    }
}
