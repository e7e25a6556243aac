use anyhow::{Context, Result};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct CopyProgress {
    pub bytes_copied: u64,
    pub files_copied: u64,
}

/// Recursive directory copier used for template asset trees
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyEngine;

impl CopyEngine {
    pub fn new() -> Self {
        Self
    }

    /// Copy entire directory tree, creating `target` if needed.
    /// Any unreadable file aborts the copy.
    pub async fn copy_directory(&self, source: &Path, target: &Path) -> Result<CopyProgress> {
        let mut progress = CopyProgress::default();

        tokio::fs::create_dir_all(target).await
            .with_context(|| format!("Failed to create directory {}", target.display()))?;

        self.copy_dir_recursive(source, target, source, &mut progress).await?;

        debug!(
            "Copied {} files ({} bytes) from {} to {}",
            progress.files_copied,
            progress.bytes_copied,
            source.display(),
            target.display()
        );

        Ok(progress)
    }

    fn copy_dir_recursive<'a>(
        &'a self,
        source_root: &'a Path,
        target_root: &'a Path,
        current_source: &'a Path,
        progress: &'a mut CopyProgress,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut entries = tokio::fs::read_dir(current_source).await
                .with_context(|| format!("Failed to read directory {}", current_source.display()))?;

            while let Some(entry) = entries.next_entry().await? {
                let source_path = entry.path();

                let relative_path = source_path.strip_prefix(source_root)
                    .context("Failed to calculate relative path")?;
                let target_path = target_root.join(relative_path);

                let file_type = entry.file_type().await
                    .with_context(|| format!("Cannot access {}", source_path.display()))?;

                if file_type.is_dir() {
                    tokio::fs::create_dir_all(&target_path).await
                        .context("Failed to create target directory")?;

                    self.copy_dir_recursive(source_root, target_root, &source_path, progress)
                        .await?;
                } else if file_type.is_file() {
                    let bytes = tokio::fs::copy(&source_path, &target_path).await
                        .with_context(|| format!("Failed to copy {}", source_path.display()))?;

                    progress.bytes_copied += bytes;
                    progress.files_copied += 1;
                }
            }

            Ok(())
        })
    }
}
