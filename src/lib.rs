pub mod collections;
pub mod config;
pub mod core;
pub mod error;
pub mod observability;
pub mod service;
pub mod state;

pub use anyhow::{Context, Result};
pub use error::{BackupError, BackupResult, ErrorKind};
pub use service::BackupService;
