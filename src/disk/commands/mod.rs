use anyhow::Result;
use std::sync::Arc;

use super::cli::DiskAction;
use super::config::{BackupConfig, RestoreConfig};
use super::fs::{FilesystemProvider, NativeFilesystems};

pub mod backup;
mod info;
mod ls;
pub mod restore;

pub fn run(
    action: DiskAction,
    backup_config: Option<BackupConfig>,
    restore_config: Option<RestoreConfig>,
) -> Result<()> {
    let provider: Arc<dyn FilesystemProvider> = Arc::new(NativeFilesystems);
    match action {
        DiskAction::Info { device, json } => {
            let config = backup_config.unwrap_or_default().merge_cli(device.sector_size);
            info::info(&device.device, config.sector_size(), provider, json)
        }
        DiskAction::Ls { device } => {
            let config = backup_config.unwrap_or_default().merge_cli(device.sector_size);
            ls::ls(&device.device, config.sector_size(), provider)
        }
        DiskAction::Backup {
            device,
            out,
            overwrite,
        } => {
            let config = backup_config.unwrap_or_default().merge_cli(device.sector_size);
            let summary =
                backup::backup(&device.device, config.sector_size(), provider, &out, overwrite)?;
            println!(
                "{} items, {} bytes written to {}",
                summary.items,
                summary.bytes,
                out.display()
            );
            Ok(())
        }
        DiskAction::Restore {
            device,
            from,
            skip_partition_table,
            validate_target_size,
            yes,
        } => {
            let config = restore_config.unwrap_or_default().merge_cli(
                skip_partition_table,
                validate_target_size,
                device.sector_size,
            );
            restore::restore(&device.device, &from, &config, provider, yes)
        }
    }
}
