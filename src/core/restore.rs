use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::catalog::BackupCatalog;
use super::manifest::{ENCRYPTED_PAYLOAD_ENTRY, PAYLOAD_ENTRY};
use super::{archive, crypto, scratch_root};
use crate::collections::{Category, CollectionRegistry, RestoreMode};
use crate::error::{BackupError, BackupResult, CategoryFailure};
use crate::state::{Phase, StateManager};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RestoreRequest {
    pub slug: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Empty means every category the archive holds
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub mode: RestoreMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreSummary {
    pub slug: String,
    pub mode: RestoreMode,
    pub restored: Vec<Category>,
    /// Requested categories the archive does not contain
    pub skipped: Vec<Category>,
}

/// Extract -> decrypt -> extract -> bulk-load
pub struct RestoreOrchestrator {
    catalog: BackupCatalog,
    registry: CollectionRegistry,
    state: Arc<StateManager>,
}

impl RestoreOrchestrator {
    pub fn new(catalog: BackupCatalog, registry: CollectionRegistry, state: Arc<StateManager>) -> Self {
        Self {
            catalog,
            registry,
            state,
        }
    }

    /// Check a request without touching state or disk
    pub fn validate(&self, request: &RestoreRequest) -> BackupResult<()> {
        if request.slug.trim().is_empty() {
            return Err(BackupError::BadParameters("Backup slug is required".to_string()));
        }

        if let Some(missing) = request.categories.iter().find(|c| !self.registry.contains(**c)) {
            return Err(BackupError::NotFound(format!("No importer for category {}", missing)));
        }

        Ok(())
    }

    pub async fn execute_restore(&self, request: RestoreRequest) -> BackupResult<RestoreSummary> {
        self.validate(&request)?;

        info!("Starting restore of {} ({:?})", request.slug, request.mode);

        let scratch = scratch_root(self.catalog.root()).join(format!("restore-{}", uuid::Uuid::new_v4().simple()));

        let result = self.run(&request, &scratch).await;

        // Scratch is removed whatever happened
        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove scratch directory {}: {}", scratch.display(), e);
            }
        }

        match result {
            Ok(summary) => {
                self.state.set_state(Phase::Idle, None).await?;
                info!("Restore of {} completed: {:?}", request.slug, summary.restored);
                Ok(summary)
            }
            Err(e) => {
                error!("Restore of {} failed: {}", request.slug, e);
                if let Err(state_err) = self.state.set_state(Phase::RestoreError, Some(e.public_message())).await {
                    warn!("Failed to record restore error state: {:#}", state_err);
                }
                Err(e)
            }
        }
    }

    async fn run(&self, request: &RestoreRequest, scratch: &Path) -> BackupResult<RestoreSummary> {
        self.state.set_state(Phase::RestoreStarted, Some(request.slug.clone())).await?;

        self.state.set_state(Phase::ExtractingInfo, None).await?;
        let archive_path = self.catalog.path_of(&request.slug).await?;
        let manifest = BackupCatalog::read_manifest(archive_path.clone()).await?;

        let password = request.password.clone().filter(|p| !p.is_empty());
        if manifest.protected && password.is_none() {
            return Err(BackupError::BadParameters(
                "Backup is password protected, a password is required".to_string(),
            ));
        }

        tokio::fs::create_dir_all(scratch).await
            .context("Failed to create scratch directory")?;

        let entry_name = manifest.payload_entry();
        {
            let (archive_path, scratch) = (archive_path.clone(), scratch.to_path_buf());
            tokio::task::spawn_blocking(move || archive::extract_file(&archive_path, &scratch, Some(entry_name)))
                .await
                .context("Extraction task panicked")?
                .map_err(|e| BackupError::corrupt(format!("cannot extract payload: {:#}", e)))?;
        }

        let extracted = scratch.join(entry_name);
        if !tokio::fs::try_exists(&extracted).await? {
            return Err(BackupError::corrupt(format!("archive has no {}", entry_name)));
        }

        let payload = scratch.join(PAYLOAD_ENTRY);
        if manifest.protected {
            self.state.set_state(Phase::Decrypting, None).await?;

            let password = password.unwrap_or_default();
            let (enc, plain) = (scratch.join(ENCRYPTED_PAYLOAD_ENTRY), payload.clone());
            tokio::task::spawn_blocking(move || crypto::decrypt_file(&enc, &plain, &password))
                .await
                .context("Decryption task panicked")??;

            tokio::fs::remove_file(&extracted).await
                .context("Failed to remove encrypted payload")?;
        }

        self.state.set_state(Phase::ExtractingData, None).await?;
        let data_dir = scratch.join("data");
        {
            let (payload, data_dir) = (payload.clone(), data_dir.clone());
            tokio::task::spawn_blocking(move || archive::extract_file(&payload, &data_dir, None))
                .await
                .context("Extraction task panicked")?
                .map_err(|e| BackupError::corrupt(format!("cannot extract data: {:#}", e)))?;
        }

        let (selected, skipped) = Self::select_categories(&manifest.data, &request.categories);
        for category in &skipped {
            warn!("Backup {} does not contain {}, skipping", request.slug, category);
        }

        self.state.set_state(Phase::Restoring, None).await?;
        self.import_all(&selected, &data_dir, request.mode).await?;

        Ok(RestoreSummary {
            slug: request.slug.clone(),
            mode: request.mode,
            restored: selected,
            skipped,
        })
    }

    /// Categories present both in the archive and in the request
    fn select_categories(available: &[Category], requested: &[Category]) -> (Vec<Category>, Vec<Category>) {
        if requested.is_empty() {
            let selected = available.iter().copied().filter(|c| c.is_selectable()).collect();
            return (selected, Vec::new());
        }

        let mut selected = Vec::new();
        let mut skipped = Vec::new();
        for category in requested.iter().filter(|c| c.is_selectable()) {
            if selected.contains(category) || skipped.contains(category) {
                continue;
            }
            if available.contains(category) {
                selected.push(*category);
            } else {
                skipped.push(*category);
            }
        }

        (selected, skipped)
    }

    /// Languages first and to completion, then everything else concurrently.
    ///
    /// Every importer runs; failures are collected and reported together.
    /// Importers that succeeded are not rolled back.
    async fn import_all(&self, categories: &[Category], data_dir: &Path, mode: RestoreMode) -> BackupResult<()> {
        let mut failures = Vec::new();

        match self.registry.get(Category::Languages) {
            // Reference data is merged, never wiped
            Some(languages) => {
                if let Err(e) = languages.import(data_dir, RestoreMode::Upsert).await {
                    error!("Import of {} failed: {:#}", Category::Languages, e);
                    failures.push(CategoryFailure {
                        category: Category::Languages,
                        error: format!("{:#}", e),
                    });
                }
            }
            None => warn!("No importer registered for {}", Category::Languages),
        }

        let mut imports = Vec::with_capacity(categories.len());
        for category in categories {
            let Some(store) = self.registry.get(*category) else {
                failures.push(CategoryFailure {
                    category: *category,
                    error: "no importer registered".to_string(),
                });
                continue;
            };

            let dir = data_dir.to_path_buf();
            let handle = tokio::spawn(async move { store.import(&dir, mode).await });
            imports.push((*category, handle));
        }

        for (category, handle) in imports {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("importer task failed: {}", e)),
            };

            match outcome {
                Ok(()) => debug!("Imported {}", category),
                Err(e) => {
                    error!("Import of {} failed: {:#}", category, e);
                    failures.push(CategoryFailure {
                        category,
                        error: format!("{:#}", e),
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            failures.sort_by_key(|f| f.category);
            Err(BackupError::PartialImport(failures))
        }
    }
}
