//! Error type for the knowledge graph store.
//!
//! [`StoreError`] distinguishes caller mistakes (missing entity, invalid
//! input) from storage faults so the tool layer can map them to the right
//! MCP error codes.

use thiserror::Error;

/// Errors produced by knowledge graph store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A referenced entity does not exist. Fatal only for
    /// `add_observations`; every other operation tolerates missing
    /// targets by skipping them.
    #[error("entity '{0}' does not exist")]
    EntityNotFound(String),

    /// Input rejected at the validation boundary, before any
    /// transaction opened.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Connection acquisition from the pool failed or timed out.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Constraint violation or any other SQLite-level failure.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}
