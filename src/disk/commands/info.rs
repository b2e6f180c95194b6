use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use super::super::fs::FilesystemProvider;
use super::super::source::SourceDisk;
use super::super::utils::format_mib;

pub fn info(
    disk: &Path,
    sector_size: u32,
    provider: Arc<dyn FilesystemProvider>,
    json: bool,
) -> Result<()> {
    let source = SourceDisk::open(disk, sector_size, provider)?;
    let geometry = source.geometry();

    if json {
        println!("{}", String::from_utf8(geometry.serialize()?)?);
        return Ok(());
    }

    if let Some(d) = &geometry.disk {
        println!(
            "Disk: {} ({} M, {} bytes, sector {})",
            d.device_path,
            format_mib(d.size),
            d.size,
            d.sector_size
        );
    }
    println!("Partition table: {}", geometry.table_type());
    if geometry.partitions.is_empty() {
        println!("No partitions found.");
        return Ok(());
    }

    for p in &geometry.partitions {
        println!(
            "{:>3} {:<16} start={} M size={} M fs={} type={}",
            p.number,
            p.name.as_deref().unwrap_or("-"),
            format_mib(p.start_offset),
            format_mib(p.size),
            p.filesystem_type,
            p.partition_type
        );
    }
    Ok(())
}
