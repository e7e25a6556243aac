use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::collections::{CollectionRegistry, json_file_registry};
use crate::config::ServiceConfig;
use crate::core::{
    BackupCatalog, BackupEntry, BackupListing, BackupOrchestrator, CreateBackupRequest,
    CreatedBackup, RestoreOrchestrator, RestoreRequest, RestoreSummary,
};
use crate::error::{BackupError, BackupResult, ErrorKind};
use crate::service::lock::CONFLICT_MESSAGE;
use crate::service::{RecoveryManager, RecoveryReport, RootLock};
use crate::state::{OperationStatus, STATE_FILE_NAME, StateManager};

/// Held for the whole of a mutating operation
struct OperationGuard {
    _local: OwnedMutexGuard<()>,
    _root: RootLock,
}

/// The long-lived owner of the backup root and its state machine.
///
/// At most one backup, restore or delete runs against a backup root at a
/// time, across processes; an overlapping request fails with
/// [`BackupError::Conflict`] instead of waiting. Read-only calls never touch
/// the disk beyond reading.
pub struct BackupService {
    catalog: BackupCatalog,
    state: Arc<StateManager>,
    recovery: RecoveryManager,
    backups: BackupOrchestrator,
    restores: RestoreOrchestrator,
    operation_lock: Arc<Mutex<()>>,
}

impl BackupService {
    /// Open the backup root, creating it if needed.
    ///
    /// Leftovers of an interrupted operation are cleaned by the next
    /// operation that claims the root, or by [`BackupService::recover`].
    pub async fn new(backup_root: PathBuf, registry: CollectionRegistry) -> Result<Self> {
        tokio::fs::create_dir_all(&backup_root).await
            .with_context(|| format!("Failed to create backup root {}", backup_root.display()))?;

        if registry.is_empty() {
            warn!("No collection stores registered, backups will carry no data");
        }

        let state = Arc::new(
            StateManager::new(backup_root.join(STATE_FILE_NAME)).await
                .context("Failed to initialize state manager")?
        );

        let catalog = BackupCatalog::new(backup_root.clone());
        let recovery = RecoveryManager::new(backup_root.clone(), state.clone());
        let backups = BackupOrchestrator::new(backup_root, registry.clone(), state.clone());
        let restores = RestoreOrchestrator::new(catalog.clone(), registry, state.clone());

        info!("Backup service ready at {}", catalog.root().display());

        Ok(Self {
            catalog,
            state,
            recovery,
            backups,
            restores,
            operation_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Service over JSON file stores in the configured data directory
    pub async fn from_config(config: &ServiceConfig) -> Result<Self> {
        let registry = json_file_registry(
            &config.data_directory,
            config.template_directory.as_deref(),
            config.import_batch_size,
        );
        Self::new(config.backup_root.clone(), registry).await
    }

    pub async fn list_backups(&self) -> BackupResult<BackupListing> {
        self.catalog.list().await
    }

    pub async fn backup_info(&self, slug: &str) -> BackupResult<BackupEntry> {
        self.catalog.info(slug).await
    }

    /// Progress as last persisted, including by another process
    pub async fn status(&self) -> OperationStatus {
        self.state.status().await
    }

    /// Clean up after an operation whose process died
    pub async fn recover(&self) -> BackupResult<RecoveryReport> {
        let guard = self.claim()?;
        self.recover_claimed(&guard).await
    }

    pub async fn delete_backup(&self, slug: &str) -> BackupResult<()> {
        let guard = self.claim()?;
        self.recover_claimed(&guard).await?;
        self.catalog.delete(slug).await
    }

    /// Run a backup to completion
    pub async fn create_backup(&self, request: CreateBackupRequest) -> BackupResult<CreatedBackup> {
        let guard = self.claim()?;
        self.recover_claimed(&guard).await?;
        self.backups.execute_backup(request).await
    }

    /// Run a restore to completion
    pub async fn restore_backup(&self, request: RestoreRequest) -> BackupResult<RestoreSummary> {
        let guard = self.claim()?;
        self.recover_claimed(&guard).await?;
        self.restores.execute_restore(request).await
    }

    /// Validate and claim the root, then run the backup on a spawned task.
    ///
    /// Returns once the operation is accepted; progress is observable through
    /// [`BackupService::status`].
    pub fn start_backup(
        self: &Arc<Self>,
        request: CreateBackupRequest,
    ) -> BackupResult<JoinHandle<BackupResult<CreatedBackup>>> {
        self.backups.validate(&request)?;
        let guard = self.claim()?;

        let service = Arc::clone(self);
        Ok(tokio::spawn(async move {
            service.recover_claimed(&guard).await?;
            service.backups.execute_backup(request).await
        }))
    }

    /// Restore counterpart of [`BackupService::start_backup`]
    pub fn start_restore(
        self: &Arc<Self>,
        request: RestoreRequest,
    ) -> BackupResult<JoinHandle<BackupResult<RestoreSummary>>> {
        self.restores.validate(&request)?;
        let guard = self.claim()?;

        let service = Arc::clone(self);
        Ok(tokio::spawn(async move {
            service.recover_claimed(&guard).await?;
            service.restores.execute_restore(request).await
        }))
    }

    /// In-process guard first, then the cross-process root lock
    fn claim(&self) -> BackupResult<OperationGuard> {
        let Ok(local) = Arc::clone(&self.operation_lock).try_lock_owned() else {
            warn!("Rejected operation, another one is running in this process");
            return Err(BackupError::Conflict(CONFLICT_MESSAGE.to_string()));
        };

        let root = RootLock::try_acquire(self.catalog.root()).inspect_err(|e| {
            if e.kind() == ErrorKind::Conflict {
                warn!("Rejected operation, {} is held by another process", self.catalog.root().display());
            }
        })?;

        Ok(OperationGuard {
            _local: local,
            _root: root,
        })
    }

    async fn recover_claimed(&self, _guard: &OperationGuard) -> BackupResult<RecoveryReport> {
        Ok(self.recovery.recover().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::{Category, CollectionStore, JsonFileStore, RestoreMode};
    use crate::core::manifest::{BackupManifest, PAYLOAD_ENTRY, generate_slug};
    use crate::core::{archive, scratch_root};
    use crate::state::{OperationKind, Phase};
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};
    use tokio::sync::Notify;

    struct Fixture {
        _dir: TempDir,
        root: PathBuf,
        data: PathBuf,
        service: Arc<BackupService>,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = tempdir().unwrap();
            let root = dir.path().join("backups");
            let data = dir.path().join("data");
            let registry = json_file_registry(&data, None, 100);
            let service = Arc::new(BackupService::new(root.clone(), registry).await.unwrap());
            Self {
                _dir: dir,
                root,
                data,
                service,
            }
        }

        fn store(&self, category: Category) -> JsonFileStore {
            JsonFileStore::new(category, &self.data, 100)
        }

        async fn seed(&self) {
            self.store(Category::Users)
                .upsert(vec![
                    json!({"username": "alice", "role": "admin"}),
                    json!({"username": "bob", "role": "user"}),
                ])
                .await
                .unwrap();
            self.store(Category::Clients)
                .upsert(vec![json!({"email": "c@acme.test", "company": "Acme"})])
                .await
                .unwrap();
            self.store(Category::Languages)
                .upsert(vec![json!({"locale": "en", "language": "English"})])
                .await
                .unwrap();
        }

        async fn records(&self, category: Category) -> Vec<Value> {
            self.store(category).records().await.unwrap()
        }

        fn scratch_is_empty(&self) -> bool {
            std::fs::read_dir(scratch_root(&self.root))
                .map(|d| d.count() == 0)
                .unwrap_or(true)
        }
    }

    fn create(categories: Vec<Category>, password: Option<&str>) -> CreateBackupRequest {
        CreateBackupRequest {
            name: "Nightly".to_string(),
            password: password.map(str::to_string),
            categories,
        }
    }

    fn restore(slug: &str, password: Option<&str>, mode: RestoreMode) -> RestoreRequest {
        RestoreRequest {
            slug: slug.to_string(),
            password: password.map(str::to_string),
            categories: Vec::new(),
            mode,
        }
    }

    fn usernames(records: &[Value]) -> Vec<String> {
        let mut names: Vec<String> = records
            .iter()
            .map(|r| r["username"].as_str().unwrap().to_string())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_unprotected_backup_is_listed() {
        let fx = Fixture::new().await;
        fx.seed().await;

        let created = fx
            .service
            .create_backup(create(vec![Category::Users, Category::Clients], None))
            .await
            .unwrap();

        let listing = fx.service.list_backups().await.unwrap();
        assert_eq!(listing.backups.len(), 1);
        assert!(listing.warnings.is_empty());

        let entry = &listing.backups[0];
        assert_eq!(entry.manifest.slug, created.slug);
        assert!(!entry.manifest.protected);
        assert_eq!(entry.manifest.data, vec![Category::Users, Category::Clients]);
        assert_eq!(
            archive::entry_names(&fx.root.join(&created.filename)).unwrap(),
            vec!["backup.json", "data.tar.gz"]
        );
    }

    #[tokio::test]
    async fn test_protected_backup_requires_the_right_password() {
        let fx = Fixture::new().await;
        fx.seed().await;

        let created = fx
            .service
            .create_backup(create(vec![Category::Users, Category::Clients], Some("secret123")))
            .await
            .unwrap();

        let info = fx.service.backup_info(&created.slug).await.unwrap();
        assert!(info.manifest.protected);

        let err = fx
            .service
            .restore_backup(restore(&created.slug, None, RestoreMode::Upsert))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadParameters);
        assert!(fx.scratch_is_empty());

        let err = fx
            .service
            .restore_backup(restore(&created.slug, Some("wrong"), RestoreMode::Upsert))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert_eq!(fx.service.status().await.phase, Phase::RestoreError);

        let summary = fx
            .service
            .restore_backup(restore(&created.slug, Some("secret123"), RestoreMode::Upsert))
            .await
            .unwrap();
        assert_eq!(summary.restored, vec![Category::Users, Category::Clients]);
        assert_eq!(fx.service.status().await.phase, Phase::Idle);
        assert!(fx.scratch_is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_restores_after_data_loss() {
        for password in [None, Some("pw")] {
            let fx = Fixture::new().await;
            fx.seed().await;
            let before_users = fx.records(Category::Users).await;
            let before_clients = fx.records(Category::Clients).await;

            let created = fx
                .service
                .create_backup(create(vec![Category::Users, Category::Clients], password))
                .await
                .unwrap();

            std::fs::remove_dir_all(&fx.data).unwrap();

            fx.service
                .restore_backup(restore(&created.slug, password, RestoreMode::Upsert))
                .await
                .unwrap();

            assert_eq!(usernames(&fx.records(Category::Users).await), usernames(&before_users));
            assert_eq!(fx.records(Category::Clients).await, before_clients);
            assert_eq!(fx.records(Category::Languages).await.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_double_upsert_restore_is_idempotent() {
        let fx = Fixture::new().await;
        fx.seed().await;

        let created = fx
            .service
            .create_backup(create(vec![Category::Users], None))
            .await
            .unwrap();

        for _ in 0..2 {
            fx.service
                .restore_backup(restore(&created.slug, None, RestoreMode::Upsert))
                .await
                .unwrap();
        }

        assert_eq!(usernames(&fx.records(Category::Users).await), vec!["alice", "bob"]);
        assert_eq!(fx.records(Category::Languages).await.len(), 1);
    }

    #[tokio::test]
    async fn test_revert_drops_records_created_after_backup() {
        let fx = Fixture::new().await;
        fx.seed().await;

        let created = fx
            .service
            .create_backup(create(vec![Category::Users], None))
            .await
            .unwrap();

        fx.store(Category::Users)
            .upsert(vec![json!({"username": "mallory"})])
            .await
            .unwrap();
        fx.store(Category::Clients)
            .upsert(vec![json!({"email": "new@acme.test"})])
            .await
            .unwrap();

        fx.service
            .restore_backup(restore(&created.slug, None, RestoreMode::Revert))
            .await
            .unwrap();

        assert_eq!(usernames(&fx.records(Category::Users).await), vec!["alice", "bob"]);
        // Not in the archive, left alone
        assert_eq!(fx.records(Category::Clients).await.len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_category_fails_without_rollback() {
        let fx = Fixture::new().await;

        // Hand-built archive: users is fine, clients is broken
        let staging = fx.root.parent().unwrap().join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("users.json"), r#"[{"username":"carol"}]"#).unwrap();
        std::fs::write(staging.join("clients.json"), r#"[{"email":"x@y.test"},"#).unwrap();

        let payload = fx.root.parent().unwrap().join(PAYLOAD_ENTRY);
        archive::build_tar_gz_file(&staging, &payload).unwrap();

        let slug = generate_slug();
        let manifest = BackupManifest::new(
            "Broken".into(),
            slug.clone(),
            false,
            vec![Category::Users, Category::Clients],
        );
        archive::build_outer_archive_file(
            &manifest.to_json().unwrap(),
            &payload,
            PAYLOAD_ENTRY,
            &fx.root.join(manifest.archive_file_name()),
        )
        .unwrap();

        let err = fx
            .service
            .restore_backup(restore(&slug, None, RestoreMode::Upsert))
            .await
            .unwrap_err();

        match &err {
            BackupError::PartialImport(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].category, Category::Clients);
            }
            other => panic!("expected partial import failure, got {:?}", other),
        }

        assert_eq!(usernames(&fx.records(Category::Users).await), vec!["carol"]);
        assert_eq!(fx.service.status().await.phase, Phase::RestoreError);
    }

    #[tokio::test]
    async fn test_unknown_slug_and_delete() {
        let fx = Fixture::new().await;
        fx.seed().await;

        let err = fx.service.backup_info("missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let created = fx
            .service
            .create_backup(create(vec![Category::Users], None))
            .await
            .unwrap();
        fx.service.delete_backup(&created.slug).await.unwrap();

        assert!(fx.service.list_backups().await.unwrap().backups.is_empty());
        assert_eq!(
            fx.service.delete_backup(&created.slug).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    struct BlockingStore {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl CollectionStore for BlockingStore {
        fn category(&self) -> Category {
            Category::Audits
        }

        async fn export(&self, dest_dir: &Path) -> anyhow::Result<()> {
            self.release.notified().await;
            tokio::fs::write(dest_dir.join(Category::Audits.file_name()), "[]").await?;
            Ok(())
        }

        async fn import(&self, _source_dir: &Path, _mode: RestoreMode) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_overlapping_operations_conflict() {
        let dir = tempdir().unwrap();
        let release = Arc::new(Notify::new());
        let registry = json_file_registry(&dir.path().join("data"), None, 100)
            .with(Arc::new(BlockingStore { release: release.clone() }));
        let service = Arc::new(
            BackupService::new(dir.path().join("backups"), registry).await.unwrap(),
        );

        let running = service.start_backup(create(vec![Category::Audits], None)).unwrap();

        let err = service.start_backup(create(vec![Category::Users], None)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err = service
            .restore_backup(restore("whatever", None, RestoreMode::Upsert))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        // notify_one stores a permit if the exporter has not parked yet
        release.notify_one();
        let created = running.await.unwrap().unwrap();

        let status = service.status().await;
        assert_eq!(status.operation, OperationKind::Idle);
        service.delete_backup(&created.slug).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_rejects_bad_request_without_claiming() {
        let fx = Fixture::new().await;

        let err = fx.service.start_backup(create(vec![], None)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadParameters);

        let handle = fx
            .service
            .start_backup(create(vec![Category::Settings], None))
            .unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_second_service_leaves_running_backup_alone() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("backups");
        let data = dir.path().join("data");
        let release = Arc::new(Notify::new());

        let registry = json_file_registry(&data, None, 100)
            .with(Arc::new(BlockingStore { release: release.clone() }));
        let running_service = Arc::new(BackupService::new(root.clone(), registry).await.unwrap());
        let running = running_service
            .start_backup(create(vec![Category::Audits], None))
            .unwrap();

        while running_service.status().await.phase != Phase::Dumping {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Same root, separate service: what a second CLI invocation builds
        let poller = BackupService::new(root.clone(), json_file_registry(&data, None, 100))
            .await
            .unwrap();

        let status = poller.status().await;
        assert_eq!(status.operation, OperationKind::Backup);
        assert_eq!(status.phase, Phase::Dumping);
        assert!(poller.list_backups().await.unwrap().backups.is_empty());
        assert_eq!(std::fs::read_dir(scratch_root(&root)).unwrap().count(), 1);

        let err = poller.create_backup(create(vec![Category::Users], None)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(poller.recover().await.unwrap_err().kind(), ErrorKind::Conflict);
        assert_eq!(poller.status().await.phase, Phase::Dumping);

        release.notify_one();
        let created = running.await.unwrap().unwrap();

        assert_eq!(poller.status().await.phase, Phase::Idle);
        assert_eq!(poller.backup_info(&created.slug).await.unwrap().manifest.data, vec![Category::Audits]);
        poller.create_backup(create(vec![Category::Users], None)).await.unwrap();
    }

    #[tokio::test]
    async fn test_interrupted_backup_is_recovered_on_next_claim() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("backups");
        std::fs::create_dir_all(scratch_root(&root).join("backup-dead")).unwrap();
        std::fs::write(root.join(".dead.tar.partial"), b"half").unwrap();
        {
            let state = StateManager::new(root.join(STATE_FILE_NAME)).await.unwrap();
            state.set_state(Phase::Building, None).await.unwrap();
        }

        let service = BackupService::new(root.clone(), CollectionRegistry::new()).await.unwrap();

        // Opening and polling change nothing
        assert_eq!(service.status().await.phase, Phase::Building);
        assert!(root.join(".dead.tar.partial").exists());

        let report = service.recover().await.unwrap();
        assert_eq!(report.interrupted, Some(Phase::Building));

        let status = service.status().await;
        assert_eq!(status.operation, OperationKind::Backup);
        assert_eq!(status.phase, Phase::BackupError);
        assert!(!root.join(".dead.tar.partial").exists());
        assert!(!scratch_root(&root).join("backup-dead").exists());
    }

    #[tokio::test]
    async fn test_template_files_survive_backup_and_restore() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("backups");
        let data = dir.path().join("data");
        let templates = dir.path().join("report-templates");
        std::fs::create_dir_all(templates.join("client")).unwrap();
        std::fs::write(templates.join("default.docx"), b"PK\x03\x04default").unwrap();
        std::fs::write(templates.join("client/acme.docx"), b"acme").unwrap();

        let service = BackupService::new(root, json_file_registry(&data, Some(&templates), 100))
            .await
            .unwrap();
        JsonFileStore::new(Category::Templates, &data, 100)
            .upsert(vec![json!({"name": "Default", "ext": "docx"})])
            .await
            .unwrap();

        let created = service
            .create_backup(create(vec![Category::Templates], Some("pw")))
            .await
            .unwrap();

        std::fs::remove_dir_all(&templates).unwrap();
        std::fs::remove_dir_all(&data).unwrap();

        service
            .restore_backup(restore(&created.slug, Some("pw"), RestoreMode::Revert))
            .await
            .unwrap();

        assert_eq!(std::fs::read(templates.join("default.docx")).unwrap(), b"PK\x03\x04default");
        assert_eq!(std::fs::read(templates.join("client/acme.docx")).unwrap(), b"acme");
        let records = JsonFileStore::new(Category::Templates, &data, 100).records().await.unwrap();
        assert_eq!(records, vec![json!({"name": "Default", "ext": "docx"})]);
    }
}
