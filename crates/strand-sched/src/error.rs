//! Scheduler Errors
//!
//! Only environmental failures surface here. Capacity exhaustion and
//! scheduling logic errors are panics.

use std::io;

/// Scheduler error
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    #[error("failed to spawn thread {name}: {source}")]
    Spawn { name: String, source: io::Error },

    #[error("invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    #[error("{0} already started")]
    AlreadyStarted(&'static str),

    #[error("{0} not started")]
    NotStarted(&'static str),
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, SchedError>;
