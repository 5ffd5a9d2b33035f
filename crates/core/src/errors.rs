use thiserror::Error;

/// Failures reported by the coordination store client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("path already exists: {0}")]
    PathExists(String),

    #[error("no such path: {0}")]
    NoNode(String),

    #[error("path has children: {0}")]
    NotEmpty(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("connection to coordination store lost")]
    ConnectionLoss,

    #[error("coordination store session expired")]
    SessionExpired,

    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Claim contention and idempotent setup both surface as `PathExists`.
    pub fn is_path_exists(&self) -> bool {
        matches!(self, StoreError::PathExists(_))
    }

    pub fn is_no_node(&self) -> bool {
        matches!(self, StoreError::NoNode(_))
    }
}

/// Scheduler error taxonomy
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown task group: {0}")]
    UnknownTaskGroup(String),

    #[error("task group already exists: {0}")]
    TaskGroupExists(String),

    #[error("task {task} is still releasing its previous booking after {waited_ms}ms")]
    CancellationPending { task: String, waited_ms: u64 },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// Store failures other than contention are worth retrying at a higher level.
    /// Everything else is a programmer error.
    pub fn is_retryable(&self) -> bool {
        match self {
            SchedulerError::Store(err) => !err.is_path_exists(),
            SchedulerError::CancellationPending { .. } => true,
            _ => false,
        }
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        SchedulerError::IllegalState(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        SchedulerError::InvalidArgument(msg.into())
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
