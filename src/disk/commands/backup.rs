use anyhow::{bail, Context, Result};
use log::{info, warn};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use super::super::fs::FilesystemProvider;
use super::super::source::{SourceDisk, SourceEntry};
use super::super::utils::host_path;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackupSummary {
    pub items: usize,
    pub bytes: u64,
    pub skipped: usize,
}

/// Copies every virtual item of `disk` below `out`, mirroring the virtual
/// tree as host directories.
pub fn backup(
    disk: &Path,
    sector_size: u32,
    provider: Arc<dyn FilesystemProvider>,
    out: &Path,
    overwrite: bool,
) -> Result<BackupSummary> {
    if out.exists() && !overwrite && fs::read_dir(out)?.next().is_some() {
        bail!(
            "{} is not empty. Use --overwrite to write into it.",
            out.display()
        );
    }
    fs::create_dir_all(out).with_context(|| format!("create {}", out.display()))?;

    let source = SourceDisk::open(disk, sector_size, provider)?;
    backup_source(&source, out)
}

pub fn backup_source(source: &SourceDisk, out: &Path) -> Result<BackupSummary> {
    let mut summary = BackupSummary::default();
    for entry in source.walk() {
        let host = host_path(out, &entry.path);
        if entry.is_folder {
            fs::create_dir_all(&host).with_context(|| format!("create {}", host.display()))?;
            continue;
        }
        match copy_entry(source, &entry, &host) {
            Ok(n) => {
                summary.items += 1;
                summary.bytes += n;
            }
            Err(e) => {
                warn!("skipping {}: {e:#}", entry.path);
                summary.skipped += 1;
            }
        }
    }
    info!(
        "backup complete: {} items, {} bytes, {} skipped",
        summary.items, summary.bytes, summary.skipped
    );
    Ok(summary)
}

fn copy_entry(source: &SourceDisk, entry: &SourceEntry, host: &Path) -> Result<u64> {
    if let Some(parent) = host.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut reader = source.open_read(entry)?;
    let mut file = fs::File::create(host).with_context(|| format!("create {}", host.display()))?;
    Ok(io::copy(&mut reader, &mut file)?)
}
