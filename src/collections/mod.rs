pub mod category;
pub mod json_store;
pub mod store;
pub mod stream;

pub use category::{Category, TEMPLATE_ASSETS_DIR};
pub use json_store::{json_file_registry, JsonFileStore, DEFAULT_IMPORT_BATCH_SIZE};
pub use store::{CollectionRegistry, CollectionStore, RestoreMode};
