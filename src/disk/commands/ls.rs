use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use super::super::fs::FilesystemProvider;
use super::super::source::SourceDisk;

pub fn ls(disk: &Path, sector_size: u32, provider: Arc<dyn FilesystemProvider>) -> Result<()> {
    let source = SourceDisk::open(disk, sector_size, provider)?;

    for entry in source.walk() {
        match (entry.is_folder, entry.metadata.size) {
            (true, _) => println!("{}/", entry.path),
            (false, Some(size)) => println!("{} ({size} bytes)", entry.path),
            (false, None) => println!("{}", entry.path),
        }
    }
    Ok(())
}
