//! PostgreSQL store for the conveyor engine.
//!
//! `PgStore` implements every engine store trait over one connection pool:
//! - Workflows (read-only graph lookups)
//! - Events, with lease-based claiming and the atomic routing write
//! - Queue items and the publish outbox
//! - Executions, with compare-and-set transitions
//! - Trigger node metadata
//!
//! IDs are stored as their prefixed text form.

mod event;
mod execution;
mod node_metadata;
mod queue_item;
mod workflow;

use sqlx::PgPool;
use std::fmt::Display;
use std::str::FromStr;

/// Durable store backed by PostgreSQL.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Creates a new store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Parses a stored text column, reporting failures as decode errors.
fn parse_column<T>(kind: &str, value: &str) -> Result<T, sqlx::Error>
where
    T: FromStr,
    T::Err: Display,
{
    T::from_str(value).map_err(|e| {
        sqlx::Error::Decode(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid {kind} '{value}': {e}"),
        )))
    })
}

/// Converts a row limit for binding.
fn limit(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
