pub mod models;

pub use models::{example_config, LogRotation, ServiceConfig, DEFAULT_CONFIG_FILE};
