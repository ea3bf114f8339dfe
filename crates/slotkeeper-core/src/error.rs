use crate::model::{SlotKey, SlotStatus};
use crate::store::StoreError;
use std::fmt;

/// Machine-readable error codes for operator and client decision making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    SlotUnavailable,
    WorkerLimitExceeded,
    TransientConflict,
    Unauthorized,
    AlreadyCompleted,
    InvalidTransition,
    NotFound,
    StoreUnavailable,
    MissingWorker,
    SlotCountMismatch,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::MissingWorker => "E1002",
            Self::SlotCountMismatch => "E1003",
            Self::SlotUnavailable => "E2001",
            Self::WorkerLimitExceeded => "E2002",
            Self::TransientConflict => "E2003",
            Self::Unauthorized => "E3001",
            Self::AlreadyCompleted => "E3002",
            Self::InvalidTransition => "E3003",
            Self::NotFound => "E3004",
            Self::StoreUnavailable => "E5001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::MissingWorker => "Worker identity required",
            Self::SlotCountMismatch => "Slot count differs from existing task",
            Self::SlotUnavailable => "No eligible slot available",
            Self::WorkerLimitExceeded => "Worker task limit reached",
            Self::TransientConflict => "Claim lost to contention",
            Self::Unauthorized => "Slot held by another worker",
            Self::AlreadyCompleted => "Slot already completed",
            Self::InvalidTransition => "Invalid slot transition",
            Self::NotFound => "Task or slot not found",
            Self::StoreUnavailable => "Slot store unavailable",
        }
    }

    /// Optional remediation hint that can be surfaced to operators and clients.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in .slotkeeper/config.toml and retry."),
            Self::MissingWorker => Some("Set --worker, SLOTKEEPER_WORKER, or WORKER."),
            Self::SlotCountMismatch => {
                Some("Re-run init with the task's existing slot count or use new task ids.")
            }
            Self::SlotUnavailable => Some("Wait and poll again; all eligible slots are taken."),
            Self::WorkerLimitExceeded => {
                Some("Raise allocation.max_tasks_per_worker to allow more work per worker.")
            }
            Self::TransientConflict => Some("Retry the claim after a short backoff."),
            Self::Unauthorized => {
                Some("The claim was reclaimed or taken by someone else; claim a new slot.")
            }
            Self::AlreadyCompleted => None,
            Self::InvalidTransition => {
                Some("Follow valid transitions: available -> in_progress -> completed.")
            }
            Self::NotFound => Some("Run `sk list` to see known tasks and slots."),
            Self::StoreUnavailable => Some("Check the store path, permissions, and disk space."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Failures of the allocation protocol.
///
/// Only [`SlotError::TransientConflict`] is retried inside the core, and only
/// by `claim_slot`; everything else reaches the caller untouched.
#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    #[error("no eligible slot available{}", .task_id.map_or_else(String::new, |id| format!(" in task {id}")))]
    SlotUnavailable { task_id: Option<i64> },

    #[error("worker '{worker_id}' may not take more work: {reason}")]
    WorkerLimitExceeded {
        worker_id: String,
        reason: LimitReason,
    },

    #[error("claim lost to contention after {attempts} attempts")]
    TransientConflict { attempts: u32 },

    #[error("{key} is not held by worker '{worker_id}' (holder: {})", .holder.as_deref().unwrap_or("none"))]
    Unauthorized {
        key: SlotKey,
        worker_id: String,
        holder: Option<String>,
    },

    #[error("cannot {action} {key}: slot is {status}")]
    InvalidTransition {
        key: SlotKey,
        status: SlotStatus,
        action: &'static str,
    },

    #[error("task {task_id} not found")]
    TaskNotFound { task_id: i64 },

    #[error("{0} not found")]
    SlotNotFound(SlotKey),

    #[error("worker id must not be empty")]
    EmptyWorkerId,

    #[error("task {task_id} already has {existing} slots, refusing to set {requested}")]
    SlotCountMismatch {
        task_id: i64,
        existing: usize,
        requested: u32,
    },

    #[error("slot store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Which per-worker policy boundary was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitReason {
    /// Already holds or completed a slot in the requested task.
    AlreadyInTask(i64),
    /// Reached the deployment-wide task cap.
    TaskCap(u32),
}

impl fmt::Display for LimitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyInTask(task_id) => write!(f, "already assigned to task {task_id}"),
            Self::TaskCap(cap) => write!(f, "reached the cap of {cap} tasks"),
        }
    }
}

impl SlotError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::SlotUnavailable { .. } => ErrorCode::SlotUnavailable,
            Self::WorkerLimitExceeded { .. } => ErrorCode::WorkerLimitExceeded,
            Self::TransientConflict { .. } => ErrorCode::TransientConflict,
            Self::Unauthorized { .. } => ErrorCode::Unauthorized,
            Self::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            Self::TaskNotFound { .. } | Self::SlotNotFound(_) => ErrorCode::NotFound,
            Self::EmptyWorkerId => ErrorCode::MissingWorker,
            Self::SlotCountMismatch { .. } => ErrorCode::SlotCountMismatch,
            Self::StoreUnavailable(_) => ErrorCode::StoreUnavailable,
        }
    }

    /// Optional remediation hint for operators and clients.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }

    /// Whether the caller may reasonably retry the same request later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SlotUnavailable { .. } | Self::TransientConflict { .. }
        )
    }
}

impl From<StoreError> for SlotError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => Self::SlotNotFound(key),
            StoreError::IllegalTransition {
                key,
                from,
                mutation,
            } => Self::InvalidTransition {
                key,
                status: from,
                action: mutation,
            },
            StoreError::SlotCountMismatch {
                task_id,
                existing,
                requested,
            } => Self::SlotCountMismatch {
                task_id,
                existing,
                requested,
            },
            StoreError::Unavailable(reason) => Self::StoreUnavailable(reason),
        }
    }
}
