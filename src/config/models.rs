use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::collections::DEFAULT_IMPORT_BATCH_SIZE;

pub const DEFAULT_CONFIG_FILE: &str = "auditkeep_config.json";
const DEFAULT_BACKUP_ROOT: &str = "backups";
const DEFAULT_DATA_DIRECTORY: &str = "data";
const DEFAULT_LOG_LEVEL: &str = "info";

#[inline]
fn default_backup_root() -> PathBuf {
    PathBuf::from(DEFAULT_BACKUP_ROOT)
}

#[inline]
fn default_data_directory() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIRECTORY)
}

#[inline]
fn default_import_batch_size() -> usize {
    DEFAULT_IMPORT_BATCH_SIZE
}

#[inline]
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

/// Main service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Directory holding finished archives, scratch space and the state record
    #[serde(default = "default_backup_root")]
    pub backup_root: PathBuf,

    /// Directory of the collection files
    #[serde(default = "default_data_directory")]
    pub data_directory: PathBuf,

    /// Report template files carried alongside the Templates collection
    #[serde(default)]
    pub template_directory: Option<PathBuf>,

    /// Records per bulk write during restore
    #[serde(default = "default_import_batch_size")]
    pub import_batch_size: usize,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional log file directory (if None, only console logging)
    #[serde(default)]
    pub log_directory: Option<PathBuf>,

    /// Log file rotation strategy
    #[serde(default)]
    pub log_rotation: LogRotation,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            backup_root: default_backup_root(),
            data_directory: default_data_directory(),
            template_directory: None,
            import_batch_size: default_import_batch_size(),
            log_level: default_log_level(),
            log_directory: None,
            log_rotation: LogRotation::default(),
        }
    }
}

impl ServiceConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path).await? {
            anyhow::bail!(
                "Configuration file not found: {}\n\nCreate a config file first. Example:\n{}",
                path.display(),
                example_config()
            );
        }

        let content = tokio::fs::read_to_string(path).await
            .context("Failed to read config file")?;

        let config: ServiceConfig = serde_json::from_str(&content)
            .context("Failed to parse config file")?;

        if config.import_batch_size == 0 {
            anyhow::bail!("import_batch_size must be at least 1");
        }

        Ok(config)
    }
}

/// Log file rotation strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogRotation {
    /// Rotate daily
    #[default]
    Daily,
    /// Rotate hourly
    Hourly,
    /// Never rotate (single file)
    Never,
}

pub fn example_config() -> &'static str {
    r#"{
  "backup_root": "/var/lib/auditkeep/backups",
  "data_directory": "/var/lib/auditkeep/data",
  "template_directory": "/var/lib/auditkeep/report-templates",
  "import_batch_size": 100,
  "log_level": "info",
  "log_directory": "./logs",
  "log_rotation": {
    "type": "daily"
  }
}"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_empty_object_takes_defaults() {
        let config: ServiceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.backup_root, PathBuf::from("backups"));
        assert_eq!(config.data_directory, PathBuf::from("data"));
        assert_eq!(config.import_batch_size, 100);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_rotation, LogRotation::Daily);
        assert!(config.template_directory.is_none());
    }

    #[test]
    fn test_example_config_parses() {
        let config: ServiceConfig = serde_json::from_str(example_config()).unwrap();
        assert_eq!(config.log_directory, Some(PathBuf::from("./logs")));
        assert!(config.template_directory.is_some());
    }

    #[test]
    fn test_rotation_is_tagged() {
        let config: ServiceConfig = serde_json::from_str(r#"{"log_rotation":{"type":"never"}}"#).unwrap();
        assert_eq!(config.log_rotation, LogRotation::Never);
        assert!(serde_json::from_str::<ServiceConfig>(r#"{"log_rotation":{"type":"weekly"}}"#).is_err());
    }

    #[tokio::test]
    async fn test_load_missing_file_shows_example() {
        let dir = tempdir().unwrap();
        let err = ServiceConfig::load(&dir.path().join("nope.json")).await.unwrap_err();
        assert!(err.to_string().contains("\"backup_root\""), "{}", err);
    }

    #[tokio::test]
    async fn test_load_rejects_zero_batch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"import_batch_size":0}"#).unwrap();
        assert!(ServiceConfig::load(&path).await.is_err());
    }
}
