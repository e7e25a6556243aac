use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current state schema version for migrations
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// One discrete step of the backup/restore state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,

    BackupStarted,
    Dumping,
    Building,
    Encrypting,
    Archiving,
    BackupError,

    RestoreStarted,
    ExtractingInfo,
    Decrypting,
    ExtractingData,
    Restoring,
    RestoreError,
}

/// Coarse operation kind derived from a phase, for progress polling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Idle,
    Backup,
    Restore,
}

impl Phase {
    pub fn operation(&self) -> OperationKind {
        match self {
            Phase::Idle => OperationKind::Idle,
            Phase::BackupStarted
            | Phase::Dumping
            | Phase::Building
            | Phase::Encrypting
            | Phase::Archiving
            | Phase::BackupError => OperationKind::Backup,
            Phase::RestoreStarted
            | Phase::ExtractingInfo
            | Phase::Decrypting
            | Phase::ExtractingData
            | Phase::Restoring
            | Phase::RestoreError => OperationKind::Restore,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Phase::BackupError | Phase::RestoreError)
    }

    /// A phase that only makes sense while an operation is running
    pub fn is_in_flight(&self) -> bool {
        !matches!(self, Phase::Idle) && !self.is_error()
    }

    /// The error phase for the operation this phase belongs to
    pub fn error_phase(&self) -> Phase {
        match self.operation() {
            OperationKind::Restore => Phase::RestoreError,
            _ => Phase::BackupError,
        }
    }
}

/// The single persisted operation record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationState {
    /// Schema version for future migrations
    pub version: u32,

    pub phase: Phase,

    /// Free-text detail, carries the failure message in error phases
    #[serde(default)]
    pub detail: Option<String>,

    pub updated_at: DateTime<Utc>,
}

impl OperationState {
    pub fn idle() -> Self {
        Self::new(Phase::Idle, None)
    }

    pub fn new(phase: Phase, detail: Option<String>) -> Self {
        Self {
            version: STATE_SCHEMA_VERSION,
            phase,
            detail,
            updated_at: Utc::now(),
        }
    }
}

impl Default for OperationState {
    fn default() -> Self {
        Self::idle()
    }
}

/// Status view returned to pollers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationStatus {
    pub operation: OperationKind,
    pub phase: Phase,
    pub detail: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&OperationState> for OperationStatus {
    fn from(state: &OperationState) -> Self {
        Self {
            operation: state.phase.operation(),
            phase: state.phase,
            detail: state.detail.clone(),
            updated_at: state.updated_at,
        }
    }
}
