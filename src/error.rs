use serde::Serialize;
use thiserror::Error;

use crate::collections::Category;

pub type BackupResult<T> = std::result::Result<T, BackupError>;

/// Stable error classification exposed to collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    BadParameters,
    Conflict,
    #[serde(rename = "corrupt_or_wrong_password")]
    Corrupt,
    PartialImportFailure,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::BadParameters => "bad_parameters",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Corrupt => "corrupt_or_wrong_password",
            ErrorKind::PartialImportFailure => "partial_import_failure",
            ErrorKind::Internal => "internal",
        }
    }
}

/// One failed category importer
#[derive(Debug, Clone, Serialize)]
pub struct CategoryFailure {
    pub category: Category,
    pub error: String,
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadParameters(String),

    #[error("{0}")]
    Conflict(String),

    #[error("wrong password or corrupt archive: {0}")]
    Corrupt(String),

    #[error("restore failed for {}", describe_failures(.0))]
    PartialImport(Vec<CategoryFailure>),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BackupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::NotFound(_) => ErrorKind::NotFound,
            BackupError::BadParameters(_) => ErrorKind::BadParameters,
            BackupError::Conflict(_) => ErrorKind::Conflict,
            BackupError::Corrupt(_) => ErrorKind::Corrupt,
            BackupError::PartialImport(_) => ErrorKind::PartialImportFailure,
            BackupError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Message safe to surface to end users; internal detail stays in the logs
    pub fn public_message(&self) -> String {
        match self {
            BackupError::Internal(_) => "internal error during backup operation".to_string(),
            BackupError::Corrupt(_) => "wrong password or corrupt archive".to_string(),
            BackupError::PartialImport(failures) => {
                let categories: Vec<String> = failures.iter().map(|f| f.category.to_string()).collect();
                format!("restore failed for {}", categories.join(", "))
            }
            other => other.to_string(),
        }
    }

    pub fn corrupt(reason: impl Into<String>) -> Self {
        BackupError::Corrupt(reason.into())
    }
}

impl From<std::io::Error> for BackupError {
    fn from(e: std::io::Error) -> Self {
        BackupError::Internal(e.into())
    }
}

fn describe_failures(failures: &[CategoryFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.category, f.error))
        .collect::<Vec<_>>()
        .join(", ")
}
