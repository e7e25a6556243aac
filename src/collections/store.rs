use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use super::Category;

/// How an importer treats records already present in the target store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestoreMode {
    /// Merge by natural key
    #[default]
    Upsert,
    /// Delete every existing record of the category before loading
    Revert,
}

impl std::str::FromStr for RestoreMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "upsert" => Ok(RestoreMode::Upsert),
            "revert" => Ok(RestoreMode::Revert),
            other => Err(format!("Unknown restore mode: {}", other)),
        }
    }
}

/// Exporter/importer pair for one category.
///
/// `export` must write `category().file_name()` into `dest_dir` as a JSON
/// array, `[]` when the collection is empty. `import` must treat a missing
/// source file as success, parse the array incrementally and upsert by the
/// category's natural key.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    fn category(&self) -> Category;

    async fn export(&self, dest_dir: &Path) -> Result<()>;

    async fn import(&self, source_dir: &Path, mode: RestoreMode) -> Result<()>;
}

/// Binds each category to its store
#[derive(Clone, Default)]
pub struct CollectionRegistry {
    stores: HashMap<Category, Arc<dyn CollectionStore>>,
}

impl CollectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a store under the category it reports, replacing any previous one
    pub fn register(&mut self, store: Arc<dyn CollectionStore>) {
        self.stores.insert(store.category(), store);
    }

    pub fn with(mut self, store: Arc<dyn CollectionStore>) -> Self {
        self.register(store);
        self
    }

    pub fn get(&self, category: Category) -> Option<Arc<dyn CollectionStore>> {
        self.stores.get(&category).cloned()
    }

    pub fn contains(&self, category: Category) -> bool {
        self.stores.contains_key(&category)
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}
