//! Error types for projection and queries.

use sorosave_events::{DecodeError, StoreError};
use sorosave_types::GroupStatus;

/// Errors that abort an ingestion pass.
///
/// These are storage-level failures. The transaction of the event being
/// processed is rolled back, nothing after it is attempted, and the caller
/// must not advance its cursor.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// The event log rejected a write.
    #[error("event store error: {0}")]
    Store(#[from] StoreError),

    /// A projection read or write failed.
    #[error("projection database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No connection could be checked out of the pool.
    #[error("projection pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

/// A projection invariant that an event would break.
///
/// The offending event stays in the event log; its projection effects are
/// rolled back and the batch continues.
#[derive(Debug, thiserror::Error)]
pub enum Violation {
    /// The event type is known but its payload does not match the schema.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// A status change that is not an edge of the group lifecycle.
    #[error("group {group_id}: illegal status transition {from} -> {to}")]
    IllegalTransition {
        group_id: String,
        from: GroupStatus,
        to: GroupStatus,
    },

    /// A contribution with a negative amount.
    #[error("contribution {contribution_id}: negative amount {amount}")]
    NegativeAmount { contribution_id: String, amount: i64 },

    /// An accumulator would exceed the integer range.
    #[error("group {group_id}: {field} overflow")]
    Overflow {
        group_id: String,
        field: &'static str,
    },
}

/// Errors returned by the query service.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// A read failed.
    #[error("query database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No connection could be checked out of the pool.
    #[error("query pool error: {0}")]
    Pool(#[from] r2d2::Error),
}

/// Outcome of a failed handler: either the event breaks an invariant, or
/// storage failed underneath it.
#[derive(Debug)]
pub(crate) enum HandlerError {
    Violation(Violation),
    Database(rusqlite::Error),
}

impl From<rusqlite::Error> for HandlerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e)
    }
}

impl From<Violation> for HandlerError {
    fn from(v: Violation) -> Self {
        Self::Violation(v)
    }
}
