use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use super::models::{OperationState, OperationStatus, Phase};

/// File name of the state record inside the backup root
pub const STATE_FILE_NAME: &str = ".backup_state.json";

/// Owns the single persisted operation record
pub struct StateManager {
    state: Arc<RwLock<OperationState>>,
    state_path: PathBuf,
    save_mutex: Arc<Mutex<()>>,
}

impl StateManager {
    /// Load the record, or start from `idle` if none was ever written
    pub async fn new(state_path: PathBuf) -> Result<Self> {
        let state = if tokio::fs::try_exists(&state_path).await? {
            match Self::load_state(&state_path).await {
                Ok(state) => state,
                Err(e) => {
                    warn!("Discarding unreadable state record {}: {:#}", state_path.display(), e);
                    OperationState::idle()
                }
            }
        } else {
            debug!("No existing state found, starting idle");
            OperationState::idle()
        };

        Ok(Self {
            state: Arc::new(RwLock::new(state)),
            state_path,
            save_mutex: Arc::new(Mutex::new(())),
        })
    }

    async fn load_state(path: &Path) -> Result<OperationState> {
        debug!("Loading state from: {}", path.display());

        let content = tokio::fs::read_to_string(path).await
            .context("Failed to read state file")?;

        let state: OperationState = serde_json::from_str(&content)
            .context("Failed to parse state file")?;

        Ok(state)
    }

    /// Snapshot of the current record
    pub async fn get_state(&self) -> OperationState {
        self.state.read().await.clone()
    }

    /// Re-read the record from disk to pick up transitions written by
    /// another process. A missing or unreadable file keeps the cached record.
    pub async fn reload(&self) -> OperationState {
        let _save_guard = self.save_mutex.lock().await;

        if !tokio::fs::try_exists(&self.state_path).await.unwrap_or(false) {
            return self.state.read().await.clone();
        }

        match Self::load_state(&self.state_path).await {
            Ok(loaded) => {
                let mut state = self.state.write().await;
                *state = loaded;
                state.clone()
            }
            Err(e) => {
                warn!("Keeping cached state, reload failed: {:#}", e);
                self.state.read().await.clone()
            }
        }
    }

    /// Coarse status for progress polling, as last persisted
    pub async fn status(&self) -> OperationStatus {
        OperationStatus::from(&self.reload().await)
    }

    /// Overwrite the record and persist it
    pub async fn set_state(&self, phase: Phase, detail: Option<String>) -> Result<()> {
        // Serialize update+save so the file always matches the latest transition
        let _save_guard = self.save_mutex.lock().await;

        let snapshot = {
            let mut state = self.state.write().await;
            *state = OperationState::new(phase, detail);
            state.clone()
        };

        debug!("State -> {:?}", snapshot.phase);
        self.save_state_atomic(&snapshot).await
    }

    /// Atomic state persistence with fsync
    async fn save_state_atomic(&self, state: &OperationState) -> Result<()> {
        let temp_path = self.state_path.with_extension("tmp");

        if let Some(parent) = self.state_path.parent() {
            tokio::fs::create_dir_all(parent).await
                .context("Failed to create state directory")?;
        }

        // 1. Write to temporary file
        let json = serde_json::to_string_pretty(state)
            .context("Failed to serialize state")?;

        tokio::fs::write(&temp_path, &json).await
            .context("Failed to write temporary state file")?;

        // 2. fsync temporary file
        let temp_file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&temp_path)
            .await?;

        temp_file.sync_all().await
            .context("Failed to sync temporary state file")?;

        drop(temp_file);

        // 3. Atomic rename
        tokio::fs::rename(&temp_path, &self.state_path).await
            .context("Failed to rename temporary state file")?;

        Ok(())
    }
}
