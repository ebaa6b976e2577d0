use thiserror::Error;

/// Convenience alias for engine results.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum StorageError {
    /// Low-level I/O error.
    /// Maps to **HTTP 500 Internal Server Error**.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    /// Maps to **HTTP 500 Internal Server Error**.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The requested record was not found.
    /// Maps to **HTTP 404 Not Found**.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Generic system or backend-specific failure.
    /// Maps to **HTTP 500 Internal Server Error**.
    #[error("Storage system failure: {0}")]
    System(String),
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The adapter rejected the arguments (e.g., unknown template, bad resource limits).
    /// Maps to **HTTP 400 Bad Request**.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The container does not exist (anymore).
    /// Maps to **HTTP 404 Not Found**.
    #[error("Container {0} not found")]
    NotFound(String),

    /// Host or hypervisor failure.
    /// Maps to **HTTP 500 Internal Server Error**.
    #[error("Runtime system failure: {0}")]
    System(String),

    /// The operation observed the cancellation token and stopped.
    #[error("Operation cancelled")]
    Cancelled,

    /// The adapter does not support this feature.
    /// Maps to **HTTP 501 Not Implemented**.
    #[error("Feature not supported: {0}")]
    Unsupported(String),
}

/// Another operation already owns the requested target.
///
/// Carries whichever conflicting references are known so callers can point at them.
#[derive(Debug, Clone, Default, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct Duplicate {
    pub message: String,
    pub install_id: Option<String>,
    pub stack_id: Option<String>,
    pub job_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Request rejected at admission (unknown app, malformed value). No job was created.
    /// Maps to **HTTP 400 Bad Request**.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// An operation for the same target is already in flight, or the target is already installed.
    /// Maps to **HTTP 409 Conflict**.
    #[error(transparent)]
    Duplicate(#[from] Duplicate),

    /// Maps to **HTTP 404 Not Found**.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// The entity or job exists but is not in a state that allows the operation.
    /// Maps to **HTTP 409 Conflict**.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A synchronous operation failed while executing against the runtime.
    /// Maps to **HTTP 500 Internal Server Error**.
    #[error("Execution failed: {0}")]
    Execution(String),

    /// Maps to the status of the wrapped [`RuntimeError`].
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// Maps to **HTTP 500 Internal Server Error**.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }
}
