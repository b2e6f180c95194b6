use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Args, Debug, Clone)]
pub struct DeviceArgs {
    /// Device or disk image path
    #[arg(long, value_name = "PATH")]
    pub device: PathBuf,

    /// Logical sector size of the device (default 512)
    #[arg(long, value_name = "BYTES")]
    pub sector_size: Option<u32>,
}

#[derive(Subcommand, Debug)]
pub enum DiskAction {
    /// Show disk geometry
    Info {
        #[command(flatten)]
        device: DeviceArgs,

        /// JSON output (the geometry.json document)
        #[arg(long)]
        json: bool,
    },

    /// List the virtual tree of a device
    Ls {
        #[command(flatten)]
        device: DeviceArgs,
    },

    /// Copy every virtual item of a device into a directory
    Backup {
        #[command(flatten)]
        device: DeviceArgs,

        /// Output directory
        #[arg(long, value_name = "DIR")]
        out: PathBuf,

        /// Allow writing into a non-empty directory
        #[arg(long)]
        overwrite: bool,
    },

    /// Restore a directory produced by `backup` onto a device
    Restore {
        #[command(flatten)]
        device: DeviceArgs,

        /// Directory holding the backed up items
        #[arg(long = "from", value_name = "DIR")]
        from: PathBuf,

        /// Do not write partition table, disk or raw partition items
        #[arg(long)]
        skip_partition_table: bool,

        /// Fail when the device is smaller than the backed up disk
        #[arg(long)]
        validate_target_size: bool,

        /// Skip confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },
}
