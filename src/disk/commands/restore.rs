use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use walkdir::WalkDir;

use super::super::config::RestoreConfig;
use super::super::error::DiskError;
use super::super::fs::FilesystemProvider;
use super::super::path::{normalize_path, ROOT};
use super::super::provider::DiskImageTarget;
use super::super::stage::CancelToken;
use super::super::utils::{confirm_or_yes, format_mib, host_path, virtual_path};

pub fn restore(
    disk: &Path,
    from: &Path,
    config: &RestoreConfig,
    provider: Arc<dyn FilesystemProvider>,
    yes: bool,
) -> Result<()> {
    confirm_or_yes(
        yes,
        &format!(
            "Restore {} onto {}? Existing data will be overwritten",
            from.display(),
            disk.display()
        ),
    )?;

    let mut target =
        DiskImageTarget::new(disk, config.sector_size(), config.options(), provider);
    target.initialize()?;
    let result = restore_into(&target, from, &CancelToken::new());
    target.dispose();
    result
}

/// Streams a backup directory into an initialized target and finalizes it.
pub fn restore_into(target: &DiskImageTarget, from: &Path, cancel: &CancelToken) -> Result<()> {
    target.test()?;

    let priority = target.get_priority_files();
    for path in &priority {
        let host = host_path(from, path);
        check_cancel(cancel)?;
        if host.is_file() {
            restore_file(target, &host, path)?;
        }
    }
    let priority: HashSet<String> = priority.iter().map(|p| normalize_path(p)).collect();

    let root = from.join(ROOT);
    let mut files = 0usize;
    let mut bytes = 0u64;
    for entry in WalkDir::new(&root).sort_by_file_name() {
        let entry = entry?;
        let vpath = virtual_path(from, entry.path())?;
        if priority.contains(&vpath) {
            continue;
        }
        check_cancel(cancel)?;
        if entry.file_type().is_dir() {
            target.create_folder_if_not_exists(&vpath)?;
        } else if entry.file_type().is_file() {
            bytes += restore_file(target, entry.path(), &vpath)?;
            files += 1;
        }
    }
    info!("{files} files ({} M) handed to the target", format_mib(bytes));

    let pb = ProgressBar::new(100);
    if let Ok(style) = ProgressStyle::with_template("finalize [{bar:40.cyan/blue}] {pos}%") {
        pb.set_style(style.progress_chars("=>-"));
    }
    let result = target.finalize(&mut |p| pb.set_position((p * 100.0) as u64), cancel);
    pb.finish_and_clear();
    result?;
    info!("restore of {} complete", target.device_path().display());
    Ok(())
}

fn check_cancel(cancel: &CancelToken) -> Result<()> {
    if cancel.is_cancelled() {
        info!("restore cancelled before finalize");
        return Err(DiskError::Cancelled.into());
    }
    Ok(())
}

fn restore_file(target: &DiskImageTarget, host: &Path, vpath: &str) -> Result<u64> {
    debug!("restoring {vpath}");
    let mut file = fs::File::open(host).with_context(|| format!("open {}", host.display()))?;
    let mut stream = target.open_write(vpath)?;
    let n = io::copy(&mut file, &mut stream).with_context(|| format!("write {vpath}"))?;
    target.close(stream)?;
    Ok(n)
}
