pub mod archive;
pub mod backup;
pub mod catalog;
pub mod copy_engine;
pub mod crypto;
pub mod manifest;
pub mod restore;

use std::path::{Path, PathBuf};

pub use backup::{BackupOrchestrator, CreateBackupRequest, CreatedBackup};
pub use catalog::{BackupCatalog, BackupEntry, BackupListing, CatalogWarning};
pub use copy_engine::{CopyEngine, CopyProgress};
pub use manifest::{BackupManifest, BackupType};
pub use restore::{RestoreOrchestrator, RestoreRequest, RestoreSummary};

/// Hidden working directory for in-flight operations, inside the backup root
pub const SCRATCH_DIR: &str = ".scratch";

pub fn scratch_root(backup_root: &Path) -> PathBuf {
    backup_root.join(SCRATCH_DIR)
}
