use anyhow::Context;
use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::error::{BackupError, BackupResult};

/// Lock file inside the backup root; hidden so the catalog never lists it
pub const LOCK_FILE_NAME: &str = ".operation.lock";

pub const CONFLICT_MESSAGE: &str = "Another backup or restore is already running";

/// Exclusive claim on a backup root, held across processes.
///
/// Released when dropped. The lock file itself is left in place.
#[derive(Debug)]
pub struct RootLock {
    _file: File,
}

impl RootLock {
    /// Take the lock without waiting; `Conflict` if anyone else holds it
    pub fn try_acquire(backup_root: &Path) -> BackupResult<Self> {
        let lock_path = backup_root.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to open lock file {}", lock_path.display()))?;

        match fs2::FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Self { _file: file }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(BackupError::Conflict(CONFLICT_MESSAGE.to_string()))
            }
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("Failed to lock {}", lock_path.display()))
                .into()),
        }
    }
}
