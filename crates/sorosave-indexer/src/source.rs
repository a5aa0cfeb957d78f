//! The boundary to whatever physically fetches ledger events.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sorosave_events::RawEvent;

/// One page of raw events returned by an [`EventSource`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPage {
    /// Events newer than the requested cursor, in ascending ledger order;
    /// events within one ledger keep source order.
    pub events: Vec<RawEvent>,
    /// Cursor to request the following page with.
    pub next_cursor: i64,
}

/// Failure to fetch a page. The poll is abandoned and retried next cycle
/// with the same cursor.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The source could not be reached or refused the request.
    #[error("event source unavailable: {0}")]
    Unavailable(String),

    /// The source answered with something that is not an event page.
    #[error("malformed event page: {0}")]
    Malformed(String),
}

/// A source of raw ledger events, consumed by the poll scheduler.
///
/// Implementations wrap the actual transport (an RPC client, a replay file,
/// a test script). An empty page means the source is caught up.
pub trait EventSource: Send + Sync + 'static {
    /// Fetches up to `limit` events newer than `cursor`.
    fn fetch_since(
        &self,
        cursor: i64,
        limit: usize,
    ) -> impl Future<Output = Result<EventPage, FetchError>> + Send;
}

impl<S: EventSource> EventSource for Arc<S> {
    fn fetch_since(
        &self,
        cursor: i64,
        limit: usize,
    ) -> impl Future<Output = Result<EventPage, FetchError>> + Send {
        (**self).fetch_since(cursor, limit)
    }
}
