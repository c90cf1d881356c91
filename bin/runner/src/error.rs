//! Error types for the runner process.
//!
//! Startup failures surface as `Report<RunnerError>` from `run`; request
//! failures map engine errors onto HTTP status codes in the intake.

use conveyor_engine::{EngineError, StoreError};
use std::fmt;

/// Errors that stop the runner.
#[derive(Debug)]
pub enum RunnerError {
    /// Configuration could not be loaded.
    Configuration { details: String },
    /// The database could not be reached.
    Database { details: String },
    /// Schema migrations failed.
    Migration { details: String },
    /// The queue transport could not be set up.
    Transport { details: String },
    /// The HTTP intake failed to bind or serve.
    Server { details: String },
    /// A background loop failed.
    Engine { details: String },
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration { details } => write!(f, "invalid configuration: {details}"),
            Self::Database { details } => write!(f, "database error: {details}"),
            Self::Migration { details } => write!(f, "migration failed: {details}"),
            Self::Transport { details } => write!(f, "transport error: {details}"),
            Self::Server { details } => write!(f, "server error: {details}"),
            Self::Engine { details } => write!(f, "engine error: {details}"),
        }
    }
}

impl std::error::Error for RunnerError {}

impl From<EngineError> for RunnerError {
    fn from(e: EngineError) -> Self {
        Self::Engine {
            details: e.to_string(),
        }
    }
}

/// Maps a sqlx error onto the engine's store error.
///
/// Decode failures mean a corrupt row and will not go away on retry;
/// everything else is treated as the database being unavailable.
pub(crate) fn store_error(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::Decode(source) => StoreError::Decode {
            message: source.to_string(),
        },
        sqlx::Error::ColumnDecode { index, source } => StoreError::Decode {
            message: format!("column {index}: {source}"),
        },
        other => StoreError::Unavailable {
            message: other.to_string(),
        },
    }
}
