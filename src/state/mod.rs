pub mod manager;
pub mod models;

pub use manager::{StateManager, STATE_FILE_NAME};
pub use models::{OperationKind, OperationState, OperationStatus, Phase};
