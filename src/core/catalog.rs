use anyhow::Context;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::archive;
use super::manifest::{ARCHIVE_EXTENSION, BackupManifest, archive_file_name, is_valid_slug};
use crate::error::{BackupError, BackupResult};

/// One archive in the backup root
#[derive(Debug, Clone, Serialize)]
pub struct BackupEntry {
    #[serde(flatten)]
    pub manifest: BackupManifest,
    pub filename: String,
    pub size: u64,
}

/// An archive that could not be listed
#[derive(Debug, Clone, Serialize)]
pub struct CatalogWarning {
    pub filename: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackupListing {
    pub backups: Vec<BackupEntry>,
    pub warnings: Vec<CatalogWarning>,
}

/// Enumerates and manages finished archives in the backup root
#[derive(Debug, Clone)]
pub struct BackupCatalog {
    root: PathBuf,
}

impl BackupCatalog {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// List every readable archive, newest first.
    ///
    /// Unreadable archives are reported in `warnings` instead of failing the listing.
    pub async fn list(&self) -> BackupResult<BackupListing> {
        let mut listing = BackupListing::default();

        if !tokio::fs::try_exists(&self.root).await? {
            return Ok(listing);
        }

        let mut entries = tokio::fs::read_dir(&self.root).await
            .context("Failed to read backup directory")?;

        while let Some(entry) = entries.next_entry().await? {
            let Some(filename) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };

            // Hidden files are scratch space, partial archives and the state record
            if filename.starts_with('.') || !is_archive_name(&filename) {
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    listing.warnings.push(CatalogWarning { filename, reason: e.to_string() });
                    continue;
                }
            };

            match Self::read_manifest(entry.path()).await {
                Ok(manifest) => listing.backups.push(BackupEntry {
                    manifest,
                    filename,
                    size: metadata.len(),
                }),
                Err(e) => {
                    warn!("Skipping unreadable backup {}: {}", filename, e);
                    listing.warnings.push(CatalogWarning { filename, reason: e.to_string() });
                }
            }
        }

        listing.backups.sort_by(|a, b| b.manifest.date.cmp(&a.manifest.date));
        listing.warnings.sort_by(|a, b| a.filename.cmp(&b.filename));

        debug!(
            "Listed {} backups ({} skipped) in {}",
            listing.backups.len(),
            listing.warnings.len(),
            self.root.display()
        );

        Ok(listing)
    }

    /// Map a slug to its archive file name
    pub async fn resolve_slug(&self, slug: &str) -> BackupResult<String> {
        if !is_valid_slug(slug) {
            return Err(BackupError::BadParameters(format!("Invalid backup slug: {:?}", slug)));
        }

        let filename = archive_file_name(slug);
        if tokio::fs::try_exists(self.root.join(&filename)).await? {
            Ok(filename)
        } else {
            Err(BackupError::NotFound(format!("Backup not found: {}", slug)))
        }
    }

    pub async fn path_of(&self, slug: &str) -> BackupResult<PathBuf> {
        let filename = self.resolve_slug(slug).await?;
        Ok(self.root.join(filename))
    }

    /// Manifest and size of one archive
    pub async fn info(&self, slug: &str) -> BackupResult<BackupEntry> {
        let filename = self.resolve_slug(slug).await?;
        let path = self.root.join(&filename);

        let size = tokio::fs::metadata(&path).await?.len();
        let manifest = Self::read_manifest(path).await?;

        Ok(BackupEntry { manifest, filename, size })
    }

    pub async fn delete(&self, slug: &str) -> BackupResult<()> {
        let path = self.path_of(slug).await?;

        tokio::fs::remove_file(&path).await
            .with_context(|| format!("Failed to delete {}", path.display()))?;

        info!("Deleted backup: {}", slug);
        Ok(())
    }

    pub async fn read_manifest(path: PathBuf) -> BackupResult<BackupManifest> {
        tokio::task::spawn_blocking(move || archive::read_manifest(&path))
            .await
            .context("Manifest read task panicked")?
    }
}

fn is_archive_name(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .is_some_and(|ext| ext == ARCHIVE_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::Category;
    use crate::core::manifest::{PAYLOAD_ENTRY, generate_slug};
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    fn write_archive(root: &Path, name: &str, protected: bool) -> BackupManifest {
        let manifest = BackupManifest::new(name.to_string(), generate_slug(), protected, vec![Category::Users]);
        let payload = root.join(".payload");
        std::fs::write(&payload, b"payload").unwrap();
        archive::build_outer_archive_file(
            &manifest.to_json().unwrap(),
            &payload,
            PAYLOAD_ENTRY,
            &root.join(manifest.archive_file_name()),
        )
        .unwrap();
        std::fs::remove_file(payload).unwrap();
        manifest
    }

    #[tokio::test]
    async fn test_list_reports_size_and_skips_garbage_with_warning() {
        let dir = tempdir().unwrap();
        let manifest = write_archive(dir.path(), "Nightly", true);
        std::fs::write(dir.path().join("broken.tar"), b"garbage").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        std::fs::write(dir.path().join(".backup_state.json"), b"{}").unwrap();

        let catalog = BackupCatalog::new(dir.path().to_path_buf());
        let listing = catalog.list().await.unwrap();

        assert_eq!(listing.backups.len(), 1);
        let entry = &listing.backups[0];
        assert_eq!(entry.manifest, manifest);
        assert!(entry.manifest.protected);
        assert!(entry.size > 0);

        assert_eq!(listing.warnings.len(), 1);
        assert_eq!(listing.warnings[0].filename, "broken.tar");
    }

    #[tokio::test]
    async fn test_list_is_newest_first() {
        let dir = tempdir().unwrap();
        let older = write_archive(dir.path(), "older", false);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let newer = write_archive(dir.path(), "newer", false);

        let listing = BackupCatalog::new(dir.path().to_path_buf()).list().await.unwrap();
        let slugs: Vec<_> = listing.backups.iter().map(|b| b.manifest.slug.clone()).collect();
        assert_eq!(slugs, vec![newer.slug, older.slug]);
    }

    #[tokio::test]
    async fn test_missing_root_lists_nothing() {
        let dir = tempdir().unwrap();
        let catalog = BackupCatalog::new(dir.path().join("absent"));
        assert!(catalog.list().await.unwrap().backups.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_info_and_delete() {
        let dir = tempdir().unwrap();
        let manifest = write_archive(dir.path(), "Nightly", false);
        let catalog = BackupCatalog::new(dir.path().to_path_buf());

        assert_eq!(catalog.resolve_slug(&manifest.slug).await.unwrap(), manifest.archive_file_name());
        assert_eq!(catalog.info(&manifest.slug).await.unwrap().manifest.name, "Nightly");

        catalog.delete(&manifest.slug).await.unwrap();
        let err = catalog.delete(&manifest.slug).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(catalog.info(&manifest.slug).await.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_traversal_slug_is_bad_parameters() {
        let dir = tempdir().unwrap();
        let catalog = BackupCatalog::new(dir.path().to_path_buf());
        let err = catalog.resolve_slug("../escape").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadParameters);
    }
}
