use anyhow::{anyhow, Result};
use gpt::{disk::LogicalBlockSize, GptConfig};
use log::{debug, info};
use std::{fs::File, path::Path};

use super::device::RawDevice;
use super::fs::detect_filesystem;
use super::geometry::{
    DiskGeometry, FilesystemGeometry, GeometryMetadata, PartitionGeometry, PartitionTableGeometry,
    GEOMETRY_VERSION,
};
use super::layout::partition_extent;
use super::types::{Extent, FilesystemType, TableType};

const MBR_SIZE: usize = 512;
const MBR_ENTRY_OFFSET: usize = 446;
const MBR_ENTRY_SIZE: usize = 16;
const MBR_PROTECTIVE_TYPE: u8 = 0xEE;
const MBR_EXTENDED_TYPES: [u8; 3] = [0x05, 0x0F, 0x85];

fn logical_block_size(sector_size: u32) -> Result<LogicalBlockSize> {
    match sector_size {
        512 => Ok(LogicalBlockSize::Lb512),
        4096 => Ok(LogicalBlockSize::Lb4096),
        other => Err(anyhow!("unsupported logical block size {other}")),
    }
}

pub fn open_gpt(disk: &Path, sector_size: u32) -> Result<gpt::GptDisk<File>> {
    GptConfig::new()
        .writable(false)
        .logical_block_size(logical_block_size(sector_size)?)
        .open(disk)
        .map_err(|e| anyhow!("failed to open GPT: {e}"))
}

/// Builds the full geometry of the device at `disk`.
///
/// `device` must be the already opened handle of the same path; the GPT
/// parser opens the path on its own.
pub fn scan_geometry(disk: &Path, device: &dyn RawDevice) -> Result<GeometryMetadata> {
    let sector_size = device.sector_size();
    let size = device.size();

    let (partition_table, partitions) = match open_gpt(disk, sector_size) {
        Ok(gdisk) => {
            let (table, parts) = map_gpt(&gdisk, device)?;
            (Some(table), parts)
        }
        Err(e) => {
            debug!("no GPT on {}: {e}", disk.display());
            scan_mbr(device)?
        }
    };

    let table_type = partition_table
        .as_ref()
        .map(|t| t.table_type)
        .unwrap_or(TableType::None);

    let mut partitions = partitions;
    let mut filesystems = Vec::new();
    for part in partitions.iter_mut() {
        let Some((fs_type, block_size)) = detect_filesystem(device, partition_extent(part)) else {
            continue;
        };
        part.filesystem_type = fs_type;
        filesystems.push(FilesystemGeometry {
            partition_number: part.number,
            fs_type,
            partition_start_offset: part.start_offset,
            block_size,
            metadata: None,
        });
    }

    info!(
        "{}: {} bytes, {} table, {} partitions, {} filesystems",
        disk.display(),
        size,
        table_type,
        partitions.len(),
        filesystems.len()
    );

    let geometry = GeometryMetadata {
        version: GEOMETRY_VERSION,
        disk: Some(DiskGeometry {
            device_path: disk.display().to_string(),
            size,
            sector_size,
            sector_count: size / sector_size as u64,
            table_type,
        }),
        partition_table,
        partitions,
        filesystems,
    };
    geometry.validate()?;
    Ok(geometry)
}

fn map_gpt(
    gdisk: &gpt::GptDisk<File>,
    device: &dyn RawDevice,
) -> Result<(PartitionTableGeometry, Vec<PartitionGeometry>)> {
    let sector_size = device.sector_size();
    let lb = logical_block_size(sector_size)?;
    let header = gdisk.header();

    let entry_bytes = header.num_parts as u64 * header.part_size as u64;
    let entry_sectors = entry_bytes.div_ceil(sector_size as u64);
    // Protective MBR, header sector, entry array.
    let table_size = (2 + entry_sectors) * sector_size as u64;

    let mut partitions = Vec::new();
    for (idx, part) in gdisk.partitions().iter() {
        if !part.is_used() {
            continue;
        }
        let start = part
            .bytes_start(lb)
            .map_err(|e| anyhow!("invalid partition start: {e}"))?;
        let size = part
            .bytes_len(lb)
            .map_err(|e| anyhow!("invalid partition size: {e}"))?;
        partitions.push(PartitionGeometry {
            number: *idx,
            partition_type: part.part_type_guid.guid.to_string().to_uppercase(),
            start_offset: start,
            size,
            name: Some(part.name.clone()).filter(|n| !n.is_empty()),
            filesystem_type: FilesystemType::Unknown,
            volume_guid: Some(part.part_guid.to_string()),
            table_type: TableType::Gpt,
        });
    }
    partitions.sort_by_key(|p| p.number);

    let table = PartitionTableGeometry {
        table_type: TableType::Gpt,
        size: table_size,
        sector_size,
        has_protective_mbr: Some(has_protective_mbr(device)),
        header_size: Some(header.header_size_le),
        entry_count: Some(header.num_parts),
        entry_size: Some(header.part_size),
        disk_guid: Some(header.disk_guid.to_string()),
        mbr_size: None,
    };
    Ok((table, partitions))
}

fn read_boot_sector(device: &dyn RawDevice) -> Option<[u8; MBR_SIZE]> {
    let mut sector = [0u8; MBR_SIZE];
    device.read_at(0, &mut sector).ok()?;
    (sector[510] == 0x55 && sector[511] == 0xAA).then_some(sector)
}

fn has_protective_mbr(device: &dyn RawDevice) -> bool {
    read_boot_sector(device)
        .is_some_and(|sector| sector[MBR_ENTRY_OFFSET + 4] == MBR_PROTECTIVE_TYPE)
}

fn scan_mbr(
    device: &dyn RawDevice,
) -> Result<(Option<PartitionTableGeometry>, Vec<PartitionGeometry>)> {
    let Some(sector) = read_boot_sector(device) else {
        return Ok((None, Vec::new()));
    };

    // A filesystem boot sector carries the same signature.
    let whole = Extent {
        offset: 0,
        len: device.size(),
    };
    if let Some((fs_type, _)) = detect_filesystem(device, whole) {
        debug!("{} holds a bare {fs_type} filesystem", device.path());
        return Ok((None, Vec::new()));
    }

    let sector_size = device.sector_size() as u64;
    let mut partitions = Vec::new();
    for i in 0..4 {
        let entry = &sector[MBR_ENTRY_OFFSET + i * MBR_ENTRY_SIZE..][..MBR_ENTRY_SIZE];
        let status = entry[0];
        if status != 0x00 && status != 0x80 {
            debug!("invalid MBR status byte {status:#04x}, not an MBR");
            return Ok((None, Vec::new()));
        }
        let kind = entry[4];
        if kind == 0 {
            continue;
        }
        if MBR_EXTENDED_TYPES.contains(&kind) {
            debug!("skipping extended partition container #{}", i + 1);
            continue;
        }
        let first_lba = u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]]) as u64;
        let sectors = u32::from_le_bytes([entry[12], entry[13], entry[14], entry[15]]) as u64;
        if sectors == 0 {
            continue;
        }
        partitions.push(PartitionGeometry {
            number: i as u32 + 1,
            partition_type: format!("0x{kind:02X}"),
            start_offset: first_lba * sector_size,
            size: sectors * sector_size,
            name: None,
            filesystem_type: FilesystemType::Unknown,
            volume_guid: None,
            table_type: TableType::Mbr,
        });
    }

    let table = PartitionTableGeometry {
        table_type: TableType::Mbr,
        size: sector_size,
        sector_size: sector_size as u32,
        has_protective_mbr: None,
        header_size: None,
        entry_count: None,
        entry_size: None,
        disk_guid: None,
        mbr_size: Some(MBR_SIZE as u32),
    };
    Ok((Some(table), partitions))
}
