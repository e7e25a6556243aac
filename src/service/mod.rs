pub mod engine;
pub mod lock;
pub mod recovery;

pub use engine::BackupService;
pub use lock::{RootLock, LOCK_FILE_NAME};
pub use recovery::{RecoveryManager, RecoveryReport, INTERRUPTED_DETAIL};
