use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Partition table flavour of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TableType {
    None,
    #[serde(rename = "MBR")]
    Mbr,
    #[serde(rename = "GPT")]
    Gpt,
}

impl TableType {
    const NAMES: [(TableType, &'static str); 3] = [
        (TableType::None, "None"),
        (TableType::Mbr, "MBR"),
        (TableType::Gpt, "GPT"),
    ];

    pub fn as_str(self) -> &'static str {
        Self::NAMES
            .iter()
            .find(|(t, _)| *t == self)
            .map(|(_, name)| *name)
            .unwrap_or("None")
    }
}

impl fmt::Display for TableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TableType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::NAMES
            .iter()
            .find(|(_, name)| name.eq_ignore_ascii_case(s))
            .map(|(t, _)| *t)
            .ok_or_else(|| format!("unknown partition table type '{s}'"))
    }
}

/// Filesystem found on a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FilesystemType {
    Unknown,
    #[serde(rename = "FAT12")]
    Fat12,
    #[serde(rename = "FAT16")]
    Fat16,
    #[serde(rename = "FAT32")]
    Fat32,
    #[serde(rename = "exFAT")]
    ExFat,
    #[serde(rename = "NTFS")]
    Ntfs,
    #[serde(rename = "ext2")]
    Ext2,
    #[serde(rename = "ext3")]
    Ext3,
    #[serde(rename = "ext4")]
    Ext4,
}

impl FilesystemType {
    const NAMES: [(FilesystemType, &'static str); 9] = [
        (FilesystemType::Unknown, "Unknown"),
        (FilesystemType::Fat12, "FAT12"),
        (FilesystemType::Fat16, "FAT16"),
        (FilesystemType::Fat32, "FAT32"),
        (FilesystemType::ExFat, "exFAT"),
        (FilesystemType::Ntfs, "NTFS"),
        (FilesystemType::Ext2, "ext2"),
        (FilesystemType::Ext3, "ext3"),
        (FilesystemType::Ext4, "ext4"),
    ];

    pub fn as_str(self) -> &'static str {
        Self::NAMES
            .iter()
            .find(|(t, _)| *t == self)
            .map(|(_, name)| *name)
            .unwrap_or("Unknown")
    }

    pub fn is_known(self) -> bool {
        self != FilesystemType::Unknown
    }
}

impl fmt::Display for FilesystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilesystemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::NAMES
            .iter()
            .find(|(_, name)| name.eq_ignore_ascii_case(s))
            .map(|(t, _)| *t)
            .ok_or_else(|| format!("unknown filesystem type '{s}'"))
    }
}

/// Byte window of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub len: u64,
}

impl Extent {
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.len)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: Option<u64>,
}
