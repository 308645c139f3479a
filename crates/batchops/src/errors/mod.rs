//! Centralized error handling for the BatchOps engine
//!
//! The engine keeps a small hierarchy of error types, one per layer:
//! repository access, the queue/schedule key-value layer, and pipeline
//! stage execution. `EngineError` unifies them at the service boundary.

pub mod types;

pub use types::*;

/// Convenience type alias for Results using EngineError
pub type EngineResult<T> = Result<T, EngineError>;

/// Convenience type alias for Repository Results
pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Convenience type alias for Queue Results
pub type QueueResult<T> = Result<T, QueueError>;

/// Convenience type alias for pipeline stage Results
pub type StageResult<T> = Result<T, StageError>;
