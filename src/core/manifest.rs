use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::collections::Category;
use crate::error::{BackupError, BackupResult};

/// Name of the manifest entry, always first in the outer archive
pub const MANIFEST_ENTRY: &str = "backup.json";
pub const PAYLOAD_ENTRY: &str = "data.tar.gz";
pub const ENCRYPTED_PAYLOAD_ENTRY: &str = "data.tar.gz.enc";
/// Extension of finished archives in the backup root
pub const ARCHIVE_EXTENSION: &str = "tar";

const REQUIRED_KEYS: [&str; 6] = ["name", "date", "slug", "type", "protected", "data"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
}

/// Metadata describing one archive, serialized as `backup.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub name: String,
    pub date: DateTime<Utc>,
    pub slug: String,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub protected: bool,
    pub data: Vec<Category>,
}

impl BackupManifest {
    pub fn new(name: String, slug: String, protected: bool, data: Vec<Category>) -> Self {
        Self {
            name,
            date: Utc::now(),
            slug,
            backup_type: BackupType::Full,
            protected,
            data,
        }
    }

    pub fn payload_entry(&self) -> &'static str {
        if self.protected {
            ENCRYPTED_PAYLOAD_ENTRY
        } else {
            PAYLOAD_ENTRY
        }
    }

    pub fn archive_file_name(&self) -> String {
        archive_file_name(&self.slug)
    }

    pub fn to_json(&self) -> BackupResult<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| BackupError::Internal(anyhow::anyhow!("Failed to serialize manifest: {}", e)))
    }

    /// Parse and validate manifest bytes, reporting the first missing key
    pub fn from_json(bytes: &[u8]) -> BackupResult<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| BackupError::corrupt(format!("{} is not valid JSON: {}", MANIFEST_ENTRY, e)))?;

        let object = value
            .as_object()
            .ok_or_else(|| BackupError::corrupt(format!("{} is not a JSON object", MANIFEST_ENTRY)))?;

        if let Some(missing) = REQUIRED_KEYS.iter().find(|k| !object.contains_key(**k)) {
            return Err(BackupError::corrupt(format!("{} is missing '{}'", MANIFEST_ENTRY, missing)));
        }

        let manifest: BackupManifest = serde_json::from_value(value)
            .map_err(|e| BackupError::corrupt(format!("Invalid {}: {}", MANIFEST_ENTRY, e)))?;

        if manifest.slug.is_empty() || !is_valid_slug(&manifest.slug) {
            return Err(BackupError::corrupt(format!("Invalid slug in {}", MANIFEST_ENTRY)));
        }

        Ok(manifest)
    }
}

pub fn archive_file_name(slug: &str) -> String {
    format!("{}.{}", slug, ARCHIVE_EXTENSION)
}

/// Slugs double as file stems, so only a conservative alphabet is accepted
pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= 128
        && slug.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub fn generate_slug() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
