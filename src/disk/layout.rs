//! Well-known disk- and partition-level payload items and where they live
//! on the device.

use super::geometry::{GeometryMetadata, PartitionGeometry};
use super::types::{Extent, TableType};

/// Whole-partition payload for partitions without a filesystem backend.
pub const PARTITION_RAW_ITEM: &str = "raw.bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DiskItem {
    /// Sector 0: boot code and MBR (or protective MBR).
    Mbr,
    /// GPT header and entry array following sector 0.
    GptPrimary,
    /// Backup entry array and header at the end of the disk.
    GptBackup,
    /// Whole device, for devices without a partition table.
    Image,
}

impl DiskItem {
    pub const ALL: [DiskItem; 4] = [
        DiskItem::Mbr,
        DiskItem::GptPrimary,
        DiskItem::GptBackup,
        DiskItem::Image,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            DiskItem::Mbr => "mbr.bin",
            DiskItem::GptPrimary => "gpt_primary.bin",
            DiskItem::GptBackup => "gpt_backup.bin",
            DiskItem::Image => "disk.bin",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|item| item.file_name().eq_ignore_ascii_case(name))
    }

    /// Location of this item on a device described by `geometry`, or `None`
    /// when the item does not exist for that layout.
    pub fn extent(self, geometry: &GeometryMetadata) -> Option<Extent> {
        let sector = geometry.sector_size() as u64;
        let table_type = geometry.table_type();
        match self {
            DiskItem::Mbr if table_type != TableType::None => Some(Extent {
                offset: 0,
                len: sector,
            }),
            DiskItem::GptPrimary if table_type == TableType::Gpt => {
                let table = geometry.partition_table.as_ref()?;
                let len = table.size.checked_sub(sector).filter(|l| *l > 0)?;
                Some(Extent {
                    offset: sector,
                    len,
                })
            }
            DiskItem::GptBackup if table_type == TableType::Gpt => {
                let table = geometry.partition_table.as_ref()?;
                let disk = geometry.disk.as_ref()?;
                // Same size as the primary copy, ending on the last sector.
                let len = table.size.checked_sub(sector).filter(|l| *l > 0)?;
                let end = disk.sector_count.checked_mul(sector)?;
                let offset = end.checked_sub(len)?;
                if offset < table.size {
                    return None;
                }
                Some(Extent { offset, len })
            }
            DiskItem::Image if table_type == TableType::None => {
                let disk = geometry.disk.as_ref().filter(|d| d.size > 0)?;
                Some(Extent {
                    offset: 0,
                    len: disk.size,
                })
            }
            _ => None,
        }
    }
}

/// Disk-level items present for `geometry`, in device order.
pub fn disk_items(geometry: &GeometryMetadata) -> Vec<(DiskItem, Extent)> {
    DiskItem::ALL
        .into_iter()
        .filter_map(|item| item.extent(geometry).map(|extent| (item, extent)))
        .collect()
}

pub fn partition_extent(partition: &PartitionGeometry) -> Extent {
    Extent {
        offset: partition.start_offset,
        len: partition.size,
    }
}
