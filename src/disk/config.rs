use serde::{Deserialize, Serialize};

use super::device::DEFAULT_SECTOR_SIZE;
use super::stage::RestoreOptions;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackupConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sector_size: Option<u32>,
}

impl BackupConfig {
    pub fn with_defaults() -> Self {
        Self {
            sector_size: Some(DEFAULT_SECTOR_SIZE),
        }
    }

    pub fn merge_cli(mut self, cli_sector_size: Option<u32>) -> Self {
        if cli_sector_size.is_some() {
            self.sector_size = cli_sector_size;
        }
        if self.sector_size.is_none() {
            self.sector_size = Some(DEFAULT_SECTOR_SIZE);
        }
        self
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size.unwrap_or(DEFAULT_SECTOR_SIZE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RestoreConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_partition_table: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validate_target_size: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sector_size: Option<u32>,
}

impl RestoreConfig {
    pub fn with_defaults() -> Self {
        Self {
            skip_partition_table: Some(false),
            validate_target_size: Some(true),
            sector_size: Some(DEFAULT_SECTOR_SIZE),
        }
    }

    /// Flags given on the command line win; otherwise the file value, then
    /// the default.
    pub fn merge_cli(
        mut self,
        cli_skip_partition_table: bool,
        cli_validate_target_size: bool,
        cli_sector_size: Option<u32>,
    ) -> Self {
        if cli_skip_partition_table {
            self.skip_partition_table = Some(true);
        }
        if cli_validate_target_size {
            self.validate_target_size = Some(true);
        }
        if cli_sector_size.is_some() {
            self.sector_size = cli_sector_size;
        }
        self
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size.unwrap_or(DEFAULT_SECTOR_SIZE)
    }

    pub fn options(&self) -> RestoreOptions {
        RestoreOptions {
            skip_partition_table: self.skip_partition_table.unwrap_or(false),
            validate_target_size: self.validate_target_size.unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_override_file() {
        let file: RestoreConfig = toml::from_str("skip_partition_table = false\n").unwrap();
        let merged = file.merge_cli(true, false, None);
        assert_eq!(
            merged.options(),
            RestoreOptions {
                skip_partition_table: true,
                validate_target_size: false,
            }
        );
        assert_eq!(merged.sector_size(), 512);
    }

    #[test]
    fn file_values_survive_unset_flags() {
        let file: RestoreConfig =
            toml::from_str("validate_target_size = true\nsector_size = 4096\n").unwrap();
        let merged = file.merge_cli(false, false, None);
        assert!(merged.options().validate_target_size);
        assert_eq!(merged.sector_size(), 4096);
    }
}
