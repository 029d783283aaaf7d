//! Error types for the scheduler.

use thiserror::Error;

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors returned by scheduler operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// No entity with the given name.
    #[error("entity not registered: {0}")]
    NotRegistered(String),

    /// An entity with the given name already exists.
    #[error("entity already registered: {0}")]
    AlreadyRegistered(String),

    /// The entity is paused.
    #[error("entity is paused: {0}")]
    Paused(String),
}
