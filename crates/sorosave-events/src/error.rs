//! Error types for the event log.

/// Errors that can occur during event store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A database operation failed.
    #[error("event store database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization or deserialization of a payload failed.
    #[error("event store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A known event type whose payload does not match its schema.
#[derive(Debug, thiserror::Error)]
#[error("cannot decode {event_type} event {event_id}: {reason}")]
pub struct DecodeError {
    /// The raw event id.
    pub event_id: String,
    /// The declared event type.
    pub event_type: String,
    /// What was wrong with the payload.
    pub reason: String,
}
