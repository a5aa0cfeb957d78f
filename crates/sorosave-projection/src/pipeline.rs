//! The single-writer ingestion pipeline.
//!
//! [`Projector::ingest`] takes a batch of raw events in ledger order and,
//! for each one, opens a transaction, appends the event to the log, and, if
//! it was new, decodes it and runs its handler inside a savepoint. A handler
//! that breaks a projection invariant is rolled back to the savepoint while
//! the raw event itself still commits. Storage failures abort the batch.

use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::Connection;
use serde_json::Value;
use sorosave_db::DbPool;
use sorosave_events::{append_event, max_ledger_sequence, ContractEvent, RawEvent};
use sorosave_types::normalize_timestamp_str;

use crate::error::{HandlerError, ProjectionError, Violation};
use crate::handlers::{self, Effect, SkipReason};
use crate::index::MemberIndex;

/// What happened to one event of a batch.
#[derive(Debug)]
pub enum Disposition {
    /// The event id was already in the log.
    Duplicate,
    /// Stored for audit; the type drives no projection.
    Recorded,
    /// Stored and projected.
    Applied,
    /// Stored; the handler made no change.
    Skipped(SkipReason),
    /// Stored; the projection change was rolled back.
    Rejected(Violation),
}

/// Per-event result of [`Projector::ingest`].
#[derive(Debug)]
pub struct EventOutcome {
    pub event_id: String,
    pub event_type: String,
    pub ledger_sequence: i64,
    pub payload: Value,
    pub disposition: Disposition,
}

impl EventOutcome {
    /// Whether this event was newly added to the log.
    pub fn is_new(&self) -> bool {
        !matches!(self.disposition, Disposition::Duplicate)
    }
}

/// Result of ingesting one batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<EventOutcome>,
}

impl BatchReport {
    /// Number of events newly added to the log.
    pub fn inserted(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_new()).count()
    }

    /// Highest ledger sequence in the batch, if any.
    pub fn last_ledger(&self) -> Option<i64> {
        self.outcomes.iter().map(|o| o.ledger_sequence).max()
    }

    /// Events whose projection was rolled back.
    pub fn violations(&self) -> impl Iterator<Item = (&EventOutcome, &Violation)> {
        self.outcomes.iter().filter_map(|o| match &o.disposition {
            Disposition::Rejected(v) => Some((o, v)),
            _ => None,
        })
    }
}

/// Owns every write to the event log, the projections, and the member index.
pub struct Projector {
    pool: DbPool,
    index: Arc<MemberIndex>,
    /// Serializes writers. Guards no data, so a poisoned lock is reused.
    pub(crate) writer: Mutex<()>,
}

impl Projector {
    pub fn new(pool: DbPool, index: Arc<MemberIndex>) -> Self {
        Self {
            pool,
            index,
            writer: Mutex::new(()),
        }
    }

    /// The member index this projector keeps current.
    pub fn index(&self) -> &Arc<MemberIndex> {
        &self.index
    }

    /// Highest ledger sequence in the event log; 0 when empty.
    ///
    /// # Errors
    ///
    /// Returns `ProjectionError` if the pool or the log cannot be read.
    pub fn cursor(&self) -> Result<i64, ProjectionError> {
        let conn = self.pool.get()?;
        Ok(max_ledger_sequence(&conn)?)
    }

    /// Rebuilds the member index from the `members` table.
    ///
    /// # Errors
    ///
    /// Returns `ProjectionError` if the pool or `members` cannot be read.
    pub fn rebuild_index(&self) -> Result<usize, ProjectionError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let conn = self.pool.get()?;
        Ok(self.index.rebuild(&conn)?)
    }

    /// Ingests a batch of events in the order given.
    ///
    /// Events before a storage failure stay committed; the failure itself is
    /// returned and nothing after it is attempted.
    ///
    /// # Errors
    ///
    /// Returns `ProjectionError` on any storage failure.
    pub fn ingest(&self, events: &[RawEvent]) -> Result<BatchReport, ProjectionError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut conn = self.pool.get()?;
        let mut report = BatchReport::default();

        for raw in events {
            let (disposition, membership) = ingest_one(&mut conn, raw)?;

            match &disposition {
                Disposition::Duplicate => {
                    tracing::debug!(event_id = %raw.id, "duplicate event ignored")
                }
                Disposition::Recorded => {
                    tracing::debug!(event_id = %raw.id, event_type = %raw.event_type, "event recorded without projection")
                }
                Disposition::Rejected(v) => {
                    tracing::error!(event_id = %raw.id, event_type = %raw.event_type, error = %v, "projection rejected event")
                }
                Disposition::Applied | Disposition::Skipped(_) => {}
            }

            // The index follows the committed state only.
            if let Some((group_id, address)) = membership {
                self.index.record(&group_id, &address);
            }
            report.outcomes.push(outcome(raw, disposition));
        }

        tracing::debug!(
            received = events.len(),
            inserted = report.inserted(),
            "batch ingested"
        );
        Ok(report)
    }
}

/// Appends and projects one event in its own transaction.
///
/// Returns the membership to add to the index once committed.
fn ingest_one(
    conn: &mut Connection,
    raw: &RawEvent,
) -> Result<(Disposition, Option<(String, String)>), ProjectionError> {
    let mut tx = conn.transaction()?;

    if !append_event(&tx, raw)?.inserted {
        return Ok((Disposition::Duplicate, None));
    }

    let mut membership = None;
    let disposition = match ContractEvent::decode(raw) {
        Ok(None) => Disposition::Recorded,
        Err(e) => Disposition::Rejected(Violation::Decode(e)),
        Ok(Some(event)) => {
            let timestamp =
                normalize_timestamp_str(&raw.timestamp).unwrap_or_else(|| raw.timestamp.clone());
            let sp = tx.savepoint()?;
            match handlers::apply(&sp, &event, raw.ledger_sequence, &timestamp) {
                Ok(effect) => {
                    sp.commit()?;
                    match effect {
                        Effect::Applied => Disposition::Applied,
                        Effect::MemberRecorded { group_id, address } => {
                            membership = Some((group_id, address));
                            Disposition::Applied
                        }
                        Effect::Skipped(reason) => Disposition::Skipped(reason),
                    }
                }
                // Dropping the savepoint rolls back to it.
                Err(HandlerError::Violation(v)) => Disposition::Rejected(v),
                Err(HandlerError::Database(e)) => return Err(e.into()),
            }
        }
    };

    tx.commit()?;
    Ok((disposition, membership))
}

fn outcome(raw: &RawEvent, disposition: Disposition) -> EventOutcome {
    EventOutcome {
        event_id: raw.id.clone(),
        event_type: raw.event_type.clone(),
        ledger_sequence: raw.ledger_sequence,
        payload: raw.payload.clone(),
        disposition,
    }
}
