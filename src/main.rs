use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info};

use diskstage::config::{self, CONFIG_FILE};
use diskstage::disk::{self, DiskAction};

#[derive(Parser)]
#[command(name = "diskstage")]
#[command(about = "Disk image virtualization and staged restore", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Disk(DiskAction),

    /// Generate configuration file (.diskstage.toml) in current directory
    Genconfig {
        /// Force overwrite existing configuration file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    // Initialize logger, default info level, display file line number and time
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            let level_style = buf.default_level_style(record.level());
            writeln!(
                buf,
                "[{} {level_style}{}{level_style:#} {}:{}] {level_style}{}{level_style:#}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .init();

    let cli = Cli::parse();

    let app_config = if std::path::Path::new(CONFIG_FILE).exists() {
        match config::AppConfig::load_from_file(CONFIG_FILE) {
            Ok(cfg) => {
                let abs_path = std::fs::canonicalize(CONFIG_FILE)
                    .unwrap_or_else(|_| std::path::PathBuf::from(CONFIG_FILE));
                info!("Using configuration file: {}", abs_path.display());
                Some(cfg)
            }
            Err(e) => {
                error!("Failed to load configuration file: {}, using defaults", e);
                None
            }
        }
    } else {
        None
    };

    match cli.command {
        Commands::Disk(action) => {
            disk::run(
                action,
                app_config.as_ref().and_then(|c| c.backup.clone()),
                app_config.as_ref().and_then(|c| c.restore.clone()),
            )?;
        }

        Commands::Genconfig { force } => {
            if let Err(e) = config::AppConfig::generate_config_file(force) {
                error!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
