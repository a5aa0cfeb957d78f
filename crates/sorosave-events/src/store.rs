//! Persistence operations for the raw event log.
//!
//! All writes go through [`append_event`], an idempotent insert keyed by the
//! ledger-assigned event id. Reads go through [`get_event`], [`count_events`],
//! and [`query_events`], the latter supporting filtering by type, group, and
//! starting ledger.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::StoreError;
use crate::event::RawEvent;

/// Result of [`append_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// `false` when an event with the same id was already stored.
    pub inserted: bool,
}

/// Appends a raw event to the log unless its id is already present.
///
/// The `group_id` column is filled from the event's explicit group or, when
/// absent, from the payload so that per-group audit reads can use the index.
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure or
/// `StoreError::Serialization` if the payload cannot be serialised.
pub fn append_event(conn: &Connection, event: &RawEvent) -> Result<AppendOutcome, StoreError> {
    let payload_json = serde_json::to_string(&event.payload)?;

    let changed = conn.execute(
        "INSERT OR IGNORE INTO events (id, type, group_id, payload_json, ledger_sequence, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.id,
            event.event_type,
            event.group_ref(),
            payload_json,
            event.ledger_sequence,
            event.timestamp,
        ],
    )?;

    Ok(AppendOutcome {
        inserted: changed > 0,
    })
}

/// Highest ledger sequence in the log, or 0 when the log is empty.
///
/// This is the ingestion cursor recovered on restart.
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure.
pub fn max_ledger_sequence(conn: &Connection) -> Result<i64, StoreError> {
    let max: Option<i64> =
        conn.query_row("SELECT MAX(ledger_sequence) FROM events", [], |row| {
            row.get(0)
        })?;
    Ok(max.unwrap_or(0))
}

/// Fetches a single stored event by id.
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure or
/// `StoreError::Serialization` if the stored payload is not valid JSON.
pub fn get_event(conn: &Connection, id: &str) -> Result<Option<RawEvent>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, type, group_id, payload_json, ledger_sequence, timestamp
             FROM events WHERE id = ?1",
            [id],
            stored_row,
        )
        .optional()?;

    row.map(StoredRow::into_event).transpose()
}

/// Number of events in the log.
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure.
pub fn count_events(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?)
}

/// Filter criteria for reading the event log.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Filter by event type string.
    pub event_type: Option<String>,
    /// Filter by group id.
    pub group_id: Option<String>,
    /// Return events at or after this ledger sequence.
    pub from_ledger: Option<i64>,
    /// Maximum number of events to return (default: 100).
    pub limit: Option<i64>,
}

/// Reads the event log with optional filters.
///
/// Results are in ascending ledger order; events within one ledger keep
/// insertion order.
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure or
/// `StoreError::Serialization` if a stored payload is not valid JSON.
pub fn query_events(conn: &Connection, filter: &EventFilter) -> Result<Vec<RawEvent>, StoreError> {
    let mut clauses = vec!["1 = 1".to_string()];
    let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
    let mut idx = 1u32;

    if let Some(ref et) = filter.event_type {
        clauses.push(format!("type = ?{idx}"));
        param_values.push(Box::new(et.clone()));
        idx += 1;
    }

    if let Some(ref gid) = filter.group_id {
        clauses.push(format!("group_id = ?{idx}"));
        param_values.push(Box::new(gid.clone()));
        idx += 1;
    }

    if let Some(from) = filter.from_ledger {
        clauses.push(format!("ledger_sequence >= ?{idx}"));
        param_values.push(Box::new(from));
        idx += 1;
    }

    let limit = filter.limit.unwrap_or(100);
    let where_clause = clauses.join(" AND ");
    let sql = format!(
        "SELECT id, type, group_id, payload_json, ledger_sequence, timestamp
         FROM events
         WHERE {where_clause}
         ORDER BY ledger_sequence ASC, rowid ASC
         LIMIT ?{idx}"
    );

    param_values.push(Box::new(limit));

    let params_refs: Vec<&dyn rusqlite::types::ToSql> =
        param_values.iter().map(|p| &**p).collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_refs.as_slice(), stored_row)?;

    let mut events = Vec::new();
    for row in rows {
        events.push(row?.into_event()?);
    }

    Ok(events)
}

struct StoredRow {
    id: String,
    event_type: String,
    group_id: Option<String>,
    payload_json: String,
    ledger_sequence: i64,
    timestamp: String,
}

impl StoredRow {
    fn into_event(self) -> Result<RawEvent, StoreError> {
        Ok(RawEvent {
            id: self.id,
            event_type: self.event_type,
            group_id: self.group_id,
            payload: serde_json::from_str(&self.payload_json)?,
            ledger_sequence: self.ledger_sequence,
            timestamp: self.timestamp,
        })
    }
}

fn stored_row(row: &Row<'_>) -> rusqlite::Result<StoredRow> {
    Ok(StoredRow {
        id: row.get(0)?,
        event_type: row.get(1)?,
        group_id: row.get(2)?,
        payload_json: row.get(3)?,
        ledger_sequence: row.get(4)?,
        timestamp: row.get(5)?,
    })
}
