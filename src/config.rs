use log::info;
use serde::{Deserialize, Serialize};
use std::fs;

use crate::disk::config::{BackupConfig, RestoreConfig};

pub const CONFIG_FILE: &str = ".diskstage.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<RestoreConfig>,
}

impl AppConfig {
    pub fn load_from_file(path: &str) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn generate_config_file(force: bool) -> anyhow::Result<()> {
        if std::path::Path::new(CONFIG_FILE).exists() && !force {
            anyhow::bail!(
                "Configuration file {} already exists. Use --force to overwrite.",
                CONFIG_FILE
            );
        }

        fs::write(CONFIG_FILE, Self::generate_full_config()?)?;

        info!("Configuration file generated: {}", CONFIG_FILE);
        info!("Please edit this file to customize configuration");
        Ok(())
    }

    pub fn generate_full_config() -> anyhow::Result<String> {
        let config = AppConfig {
            backup: Some(BackupConfig::with_defaults()),
            restore: Some(RestoreConfig::with_defaults()),
        };
        let toml_content = toml::to_string_pretty(&config)?;
        Ok(format!(
            "# diskstage configuration file\n# All fields are optional, command line arguments override config file values\n\n{}",
            toml_content
        ))
    }
}
