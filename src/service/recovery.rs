use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::scratch_root;
use crate::state::{Phase, StateManager};

/// Detail recorded for an operation the process did not live to finish
pub const INTERRUPTED_DETAIL: &str = "interrupted by service restart";

/// What startup recovery found and cleaned
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub scratch_removed: usize,
    pub partials_removed: usize,
    /// Phase the previous process was in when it stopped, if it was mid-operation
    pub interrupted: Option<Phase>,
}

pub struct RecoveryManager {
    backup_root: PathBuf,
    state: Arc<StateManager>,
}

impl RecoveryManager {
    pub fn new(backup_root: PathBuf, state: Arc<StateManager>) -> Self {
        Self { backup_root, state }
    }

    /// Clean leftovers of an interrupted operation and close out its record.
    ///
    /// Only safe while holding the root's [`RootLock`](super::RootLock):
    /// anything in flight at that point belongs to a process that is gone.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        debug!("Checking for interrupted operations...");

        let mut report = RecoveryReport {
            scratch_removed: self.remove_scratch().await?,
            partials_removed: self.remove_partial_archives().await?,
            interrupted: None,
        };

        let persisted = self.state.reload().await;
        if persisted.phase.is_in_flight() {
            warn!(
                "Previous {:?} operation stopped during {:?}",
                persisted.phase.operation(),
                persisted.phase
            );

            self.state
                .set_state(persisted.phase.error_phase(), Some(INTERRUPTED_DETAIL.to_string()))
                .await?;
            report.interrupted = Some(persisted.phase);
        }

        if report.scratch_removed > 0 || report.partials_removed > 0 {
            info!(
                "Recovery removed {} scratch directories and {} partial archives",
                report.scratch_removed, report.partials_removed
            );
        }

        Ok(report)
    }

    async fn remove_scratch(&self) -> Result<usize> {
        let scratch = scratch_root(&self.backup_root);
        if !tokio::fs::try_exists(&scratch).await? {
            return Ok(0);
        }

        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&scratch).await
            .context("Failed to read scratch directory")?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            warn!("Removing orphaned scratch: {}", path.display());

            let result = if entry.file_type().await?.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };

            match result {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }

        Ok(removed)
    }

    async fn remove_partial_archives(&self) -> Result<usize> {
        if !tokio::fs::try_exists(&self.backup_root).await? {
            return Ok(0);
        }

        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.backup_root).await
            .context("Failed to read backup directory")?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_partial_archive(&path) {
                continue;
            }

            warn!("Removing partial archive: {}", path.display());
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }

        Ok(removed)
    }
}

fn is_partial_archive(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') && n.ends_with(".partial"))
        .unwrap_or(false)
}
