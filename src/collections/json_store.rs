//! Collection backend keeping each category in a JSON array file under the
//! data directory. Records are upserted by natural key in batches.
//!
//! A collection is held in memory while it is imported and the file is
//! rewritten once per import, so this backend suits reference-sized data
//! rather than large production collections.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::stream::{JsonArrayWriter, for_each_element};
use super::{Category, CollectionRegistry, CollectionStore, RestoreMode, TEMPLATE_ASSETS_DIR};
use crate::core::CopyEngine;

pub const DEFAULT_IMPORT_BATCH_SIZE: usize = 100;

pub struct JsonFileStore {
    category: Category,
    path: PathBuf,
    assets_dir: Option<PathBuf>,
    batch_size: usize,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(category: Category, data_dir: &Path, batch_size: usize) -> Self {
        Self {
            category,
            path: data_dir.join(category.file_name()),
            assets_dir: None,
            batch_size: batch_size.max(1),
            write_lock: Mutex::new(()),
        }
    }

    /// Attach a binary asset directory exported alongside the records
    pub fn with_assets(mut self, assets_dir: PathBuf) -> Self {
        self.assets_dir = Some(assets_dir);
        self
    }

    /// Read every stored record
    pub async fn records(&self) -> Result<Vec<Value>> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Value>> {
            let mut records = Vec::new();
            if path.exists() {
                let reader = BufReader::new(File::open(&path)?);
                for_each_element(reader, |v| {
                    records.push(v);
                    Ok(())
                })?;
            }
            Ok(records)
        })
        .await
        .context("Record read task panicked")?
    }

    /// Upsert records by natural key and persist
    pub async fn upsert(&self, records: Vec<Value>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let category = self.category;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut set = RecordSet::load(category, &path)?;
            set.apply(records)?;
            set.save(&path)
        })
        .await
        .context("Upsert task panicked")?
    }

    fn import_blocking(
        category: Category,
        path: &Path,
        source: &Path,
        mode: RestoreMode,
        batch_size: usize,
    ) -> Result<u64> {
        let mut set = match mode {
            RestoreMode::Revert => {
                let empty = RecordSet::empty(category);
                empty.save(path)?;
                empty
            }
            RestoreMode::Upsert => RecordSet::load(category, path)?,
        };

        let reader = BufReader::new(
            File::open(source).with_context(|| format!("Failed to open {}", source.display()))?,
        );

        let mut batch = Vec::with_capacity(batch_size);
        let count = for_each_element(reader, |record| {
            batch.push(record);
            if batch.len() >= batch_size {
                set.apply(batch.drain(..).collect())?;
            }
            Ok(())
        })
        .with_context(|| format!("Failed to import {}", category.file_name()))?;

        if !batch.is_empty() {
            set.apply(batch)?;
        }

        set.save(path)?;
        Ok(count)
    }

    async fn import_assets(&self, source_dir: &Path, mode: RestoreMode) -> Result<()> {
        let Some(assets_dir) = &self.assets_dir else {
            return Ok(());
        };

        if mode == RestoreMode::Revert && tokio::fs::try_exists(assets_dir).await? {
            tokio::fs::remove_dir_all(assets_dir).await
                .context("Failed to clear template assets")?;
        }

        let source = source_dir.join(TEMPLATE_ASSETS_DIR);
        if tokio::fs::try_exists(&source).await? {
            CopyEngine::new().copy_directory(&source, assets_dir).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl CollectionStore for JsonFileStore {
    fn category(&self) -> Category {
        self.category
    }

    async fn export(&self, dest_dir: &Path) -> Result<()> {
        let source = self.path.clone();
        let dest = dest_dir.join(self.category.file_name());

        let count = tokio::task::spawn_blocking(move || -> Result<u64> {
            let out = BufWriter::new(
                File::create(&dest).with_context(|| format!("Failed to create {}", dest.display()))?,
            );
            let mut writer = JsonArrayWriter::new(out)?;

            if source.exists() {
                let reader = BufReader::new(File::open(&source)?);
                for_each_element(reader, |record| writer.push(&record))?;
            }

            let (_, count) = writer.finish()?;
            Ok(count)
        })
        .await
        .context("Export task panicked")??;

        if let Some(assets_dir) = &self.assets_dir {
            if tokio::fs::try_exists(assets_dir).await? {
                CopyEngine::new()
                    .copy_directory(assets_dir, &dest_dir.join(TEMPLATE_ASSETS_DIR))
                    .await?;
            }
        }

        debug!("Exported {} {} records", count, self.category);
        Ok(())
    }

    async fn import(&self, source_dir: &Path, mode: RestoreMode) -> Result<()> {
        let source = source_dir.join(self.category.file_name());

        if !tokio::fs::try_exists(&source).await? {
            debug!("No {} in archive, nothing to import", self.category.file_name());
            return Ok(());
        }

        let _guard = self.write_lock.lock().await;

        let category = self.category;
        let path = self.path.clone();
        let batch_size = self.batch_size;

        let count = tokio::task::spawn_blocking(move || {
            Self::import_blocking(category, &path, &source, mode, batch_size)
        })
        .await
        .context("Import task panicked")??;

        self.import_assets(source_dir, mode).await?;

        info!("Imported {} {} records ({:?})", count, self.category, mode);
        Ok(())
    }
}

/// In-memory view of one collection file, indexed by natural key
struct RecordSet {
    category: Category,
    records: Vec<Value>,
    index: HashMap<String, usize>,
}

impl RecordSet {
    fn empty(category: Category) -> Self {
        Self {
            category,
            records: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn load(category: Category, path: &Path) -> Result<Self> {
        let mut set = Self::empty(category);
        if !path.exists() {
            return Ok(set);
        }

        let reader = BufReader::new(File::open(path)?);
        let mut existing = Vec::new();
        for_each_element(reader, |v| {
            existing.push(v);
            Ok(())
        })
        .with_context(|| format!("Corrupt collection file {}", path.display()))?;

        set.apply(existing)?;
        Ok(set)
    }

    /// Apply one bulk write. Every key is validated before anything changes.
    fn apply(&mut self, batch: Vec<Value>) -> Result<()> {
        let Some(key_field) = self.category.natural_key() else {
            if let Some(last) = batch.into_iter().last() {
                self.records = vec![last];
            }
            return Ok(());
        };

        let keys = batch
            .iter()
            .map(|record| natural_key(record, key_field))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("Invalid {} record", self.category))?;

        for (key, record) in keys.into_iter().zip(batch) {
            match self.index.get(&key) {
                Some(&pos) => self.records[pos] = record,
                None => {
                    self.index.insert(key, self.records.len());
                    self.records.push(record);
                }
            }
        }

        Ok(())
    }

    /// Atomic write: temp file, fsync, rename
    fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension("json.tmp");
        {
            let file = File::create(&temp_path)
                .with_context(|| format!("Failed to create {}", temp_path.display()))?;
            let mut writer = JsonArrayWriter::new(BufWriter::new(file))?;
            for record in &self.records {
                writer.push(record)?;
            }
            let (out, _) = writer.finish()?;
            out.into_inner()
                .map_err(|e| anyhow!("Failed to flush {}: {}", temp_path.display(), e))?
                .sync_all()?;
        }

        std::fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

fn natural_key(record: &Value, field: &str) -> Result<String> {
    match record.get(field) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Null) | None => bail!("record has no '{}' field", field),
        Some(Value::String(_)) => bail!("record has an empty '{}' field", field),
        Some(other) => Ok(other.to_string()),
    }
}

/// Registry with a [`JsonFileStore`] for every category, Templates carrying
/// the asset directory when one is configured
pub fn json_file_registry(
    data_dir: &Path,
    template_dir: Option<&Path>,
    batch_size: usize,
) -> CollectionRegistry {
    let mut registry = CollectionRegistry::new();

    for category in Category::all() {
        let mut store = JsonFileStore::new(category, data_dir, batch_size);
        if category == Category::Templates {
            if let Some(dir) = template_dir {
                store = store.with_assets(dir.to_path_buf());
            }
        }
        registry.register(Arc::new(store));
    }

    registry
}
