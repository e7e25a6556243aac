use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::manifest::{
    BackupManifest, ENCRYPTED_PAYLOAD_ENTRY, PAYLOAD_ENTRY, archive_file_name, generate_slug,
};
use super::{archive, crypto, scratch_root};
use crate::collections::{Category, CollectionRegistry};
use crate::error::{BackupError, BackupResult};
use crate::state::{Phase, StateManager};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateBackupRequest {
    pub name: String,
    #[serde(default)]
    pub password: Option<String>,
    pub categories: Vec<Category>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedBackup {
    pub slug: String,
    pub filename: String,
}

/// Export -> archive -> encrypt -> finalize
pub struct BackupOrchestrator {
    backup_root: PathBuf,
    registry: CollectionRegistry,
    state: Arc<StateManager>,
}

impl BackupOrchestrator {
    pub fn new(backup_root: PathBuf, registry: CollectionRegistry, state: Arc<StateManager>) -> Self {
        Self {
            backup_root,
            registry,
            state,
        }
    }

    /// Check a request without touching state or disk.
    ///
    /// Returns the selected categories deduplicated, in request order.
    pub fn validate(&self, request: &CreateBackupRequest) -> BackupResult<Vec<Category>> {
        if request.name.trim().is_empty() {
            return Err(BackupError::BadParameters("Backup name is required".to_string()));
        }

        let mut categories = Vec::new();
        for category in &request.categories {
            if !category.is_selectable() {
                debug!("Ignoring explicit {} selection, always included", category);
                continue;
            }
            if !self.registry.contains(*category) {
                return Err(BackupError::NotFound(format!("No exporter for category {}", category)));
            }
            if !categories.contains(category) {
                categories.push(*category);
            }
        }

        if categories.is_empty() {
            return Err(BackupError::BadParameters("Select at least one category to back up".to_string()));
        }

        Ok(categories)
    }

    pub async fn execute_backup(&self, request: CreateBackupRequest) -> BackupResult<CreatedBackup> {
        let categories = self.validate(&request)?;
        let slug = generate_slug();

        info!("Starting backup '{}' ({}) of {:?}", request.name, slug, categories);

        let scratch = scratch_root(&self.backup_root).join(format!("backup-{}", slug));
        let partial = self.backup_root.join(format!(".{}.partial", archive_file_name(&slug)));

        let result = self.run(&request, categories, &slug, &scratch, &partial).await;

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove scratch directory {}: {}", scratch.display(), e);
            }
        }

        match result {
            Ok(created) => {
                self.state.set_state(Phase::Idle, None).await?;
                info!("Backup completed: {}", created.filename);
                Ok(created)
            }
            Err(e) => {
                error!("Backup {} failed: {}", slug, e);
                if let Err(remove_err) = tokio::fs::remove_file(&partial).await {
                    if remove_err.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to remove partial archive {}: {}", partial.display(), remove_err);
                    }
                }

                if let Err(state_err) = self.state.set_state(Phase::BackupError, Some(e.public_message())).await {
                    warn!("Failed to record backup error state: {:#}", state_err);
                }
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        request: &CreateBackupRequest,
        categories: Vec<Category>,
        slug: &str,
        scratch: &Path,
        partial: &Path,
    ) -> BackupResult<CreatedBackup> {
        self.state.set_state(Phase::BackupStarted, Some(request.name.clone())).await?;

        let data_dir = scratch.join("data");
        tokio::fs::create_dir_all(&data_dir).await
            .context("Failed to create scratch directory")?;

        // Dump every collection into the scratch directory
        self.state.set_state(Phase::Dumping, None).await?;
        self.export_all(&categories, &data_dir).await?;

        // Pack the dumps into the payload
        self.state.set_state(Phase::Building, None).await?;
        let mut payload = scratch.join(PAYLOAD_ENTRY);
        {
            let data_dir = data_dir.clone();
            let payload = payload.clone();
            let size = tokio::task::spawn_blocking(move || archive::build_tar_gz_file(&data_dir, &payload))
                .await
                .context("Archive task panicked")??;
            debug!("Payload built: {} bytes", size);
        }

        let password = request.password.clone().filter(|p| !p.is_empty());
        let protected = password.is_some();

        if let Some(password) = password {
            self.state.set_state(Phase::Encrypting, None).await?;

            let encrypted = scratch.join(ENCRYPTED_PAYLOAD_ENTRY);
            let (plain, enc) = (payload.clone(), encrypted.clone());
            tokio::task::spawn_blocking(move || crypto::encrypt_file(&plain, &enc, &password))
                .await
                .context("Encryption task panicked")??;

            tokio::fs::remove_file(&payload).await
                .context("Failed to remove plaintext payload")?;
            payload = encrypted;
        }

        // Outer archive is written under a hidden name and renamed last
        self.state.set_state(Phase::Archiving, None).await?;

        let manifest = BackupManifest::new(request.name.trim().to_string(), slug.to_string(), protected, categories);
        let manifest_json = manifest.to_json()?;
        let entry_name = manifest.payload_entry();
        {
            let partial = partial.to_path_buf();
            tokio::task::spawn_blocking(move || {
                archive::build_outer_archive_file(&manifest_json, &payload, entry_name, &partial)
            })
            .await
            .context("Archive task panicked")??;
        }

        let filename = manifest.archive_file_name();
        tokio::fs::rename(partial, self.backup_root.join(&filename)).await
            .context("Failed to finalize archive")?;

        Ok(CreatedBackup {
            slug: slug.to_string(),
            filename,
        })
    }

    /// Run every exporter concurrently and wait for all of them
    async fn export_all(&self, categories: &[Category], data_dir: &Path) -> BackupResult<()> {
        let mut exports = JoinSet::new();

        let languages = self.registry.get(Category::Languages);
        if languages.is_none() {
            warn!("No exporter registered for {}, archive will not carry it", Category::Languages);
        }

        let stores = categories
            .iter()
            .filter_map(|c| self.registry.get(*c))
            .chain(languages);

        for store in stores {
            let dir = data_dir.to_path_buf();
            exports.spawn(async move {
                let category = store.category();
                (category, store.export(&dir).await)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = exports.join_next().await {
            match joined {
                Ok((category, Ok(()))) => debug!("Exported {}", category),
                Ok((category, Err(e))) => {
                    error!("Export of {} failed: {:#}", category, e);
                    failures.push(format!("{}: {:#}", category, e));
                }
                Err(e) => failures.push(format!("exporter task failed: {}", e)),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            failures.sort();
            Err(BackupError::Internal(anyhow!("Export failed: {}", failures.join("; "))))
        }
    }
}
