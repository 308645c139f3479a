//! Error type definitions for the BatchOps engine

use thiserror::Error;

/// Top-level engine error type
///
/// Represents every failure the engine can surface to its caller. Uses
/// `thiserror` for automatic trait implementations and error chaining.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Repository layer errors
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Queue / schedule registry errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Pipeline stage failures
    #[error("Pipeline error: {0}")]
    Stage(#[from] StageError),

    /// Malformed cron schedule
    #[error("Malformed schedule '{expression}': {message}")]
    MalformedSchedule { expression: String, message: String },

    /// Callable identifier could not be resolved
    #[error("Unknown callable: {identifier}")]
    UnknownCallable { identifier: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// File storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Repository layer specific errors
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// Database connection failures
    #[error("Database connection failed: {message}")]
    ConnectionFailed { message: String },

    /// Database errors from sqlx
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// UUID parsing errors
    #[error("UUID parsing error: {0}")]
    UuidParse(#[from] uuid::Error),

    /// Stored timestamp could not be parsed
    #[error("DateTime parsing error: {value}")]
    DateTimeParse { value: String },

    /// Data serialization/deserialization failures
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Constraint violations (unique, foreign key, etc.)
    #[error("Constraint violation: {constraint} - {message}")]
    ConstraintViolation { constraint: String, message: String },

    /// Record not found
    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    /// An entity transition that the lifecycle forbids
    #[error("Invalid transition for {resource} {id}: {message}")]
    InvalidTransition {
        resource: String,
        id: String,
        message: String,
    },
}

/// Queue and schedule registry errors
///
/// The queue and the schedule registry share a key/value backing store;
/// a store outage is a transient condition the scheduler loop backs off on.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The backing key/value store is unreachable
    #[error("Key/value store unavailable: {message}")]
    StoreUnavailable { message: String },

    /// Payload could not be encoded or decoded
    #[error("Queue payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Lease operations against an entry this worker does not hold
    #[error("Worker '{worker}' does not hold a lease on job {job_id}")]
    LeaseNotHeld { worker: String, job_id: String },
}

impl QueueError {
    /// Whether the scheduler loop should back off and retry
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::StoreUnavailable { .. })
    }
}

/// A pipeline stage failure
///
/// Variants map onto the incident taxonomy: each failure kind carries an
/// incident category and a default severity, and transient variants are
/// retried locally inside the stage before surfacing.
#[derive(Error, Debug, Clone)]
pub enum StageError {
    #[error("Unsupported file type: {extension}")]
    UnsupportedFormat { extension: String },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("No table found in first PDF page")]
    NoPdfTable,

    #[error("{message}")]
    Validation { message: String },

    #[error("Invalid processing plan: {message}")]
    InvalidPlan { message: String },

    #[error("Stage timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Transient I/O failure: {message}")]
    TransientIo { message: String },

    #[error("Internal failure: {message}")]
    Internal { message: String },
}

impl StageError {
    /// Incident category recorded when this failure opens an incident
    pub fn category(&self) -> &'static str {
        match self {
            StageError::UnsupportedFormat { .. }
            | StageError::FileNotFound { .. }
            | StageError::Parse { .. }
            | StageError::NoPdfTable => "ingest",
            StageError::Validation { .. } => "validation",
            StageError::InvalidPlan { .. } => "transform",
            StageError::Timeout { .. } => "runtime",
            StageError::TransientIo { .. } => "infrastructure",
            StageError::Internal { .. } => "internal",
        }
    }

    /// Default severity before any known-error match refines it
    pub fn default_severity(&self) -> crate::models::Severity {
        match self {
            StageError::Internal { .. } => crate::models::Severity::High,
            StageError::FileNotFound { .. } => crate::models::Severity::Critical,
            _ => crate::models::Severity::Medium,
        }
    }

    /// Transient failures are retried inside the stage with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, StageError::TransientIo { .. })
    }
}

impl EngineError {
    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}
