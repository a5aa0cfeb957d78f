//! Projection engine, member index, and query service for the SoroSave
//! group indexer.
//!
//! The [`Projector`] is the single writer: it appends raw events to the log
//! and folds each new one into the `groups`, `members`, and `contributions`
//! tables, one SQLite transaction per event. The [`MemberIndex`] mirrors the
//! `members` table as an address-to-groups map for fast membership lookups.
//! The [`QueryService`] reads the projections on its own pooled connections
//! and never writes.
//!
//! # Consistency
//!
//! - Redelivering an event is a no-op: the log insert is keyed by event id
//!   and the projection only runs for newly inserted events.
//! - `member_count` is recomputed from the member set and contribution totals
//!   move only when the contribution row is new, so both stay exact under
//!   redelivery.
//! - A handler that would break an invariant (negative or overflowing totals,
//!   an illegal status transition, an undecodable payload) is rolled back to
//!   a savepoint; the raw event still commits and the batch goes on.
//!
//! # Usage
//!
//! ```rust,ignore
//! let index = Arc::new(MemberIndex::new());
//! let projector = Projector::new(pool.clone(), Arc::clone(&index));
//! projector.rebuild_index()?;
//!
//! let report = projector.ingest(&events)?;
//! let queries = QueryService::new(pool, index);
//! let page = queries.list_groups(&GroupFilter::default(), 20, 0)?;
//! ```

mod error;
mod handlers;
mod index;
mod pipeline;
mod query;
mod rows;

pub use error::{ProjectionError, QueryError, Violation};
pub use handlers::SkipReason;
pub use index::{IndexDrift, MemberIndex};
pub use pipeline::{BatchReport, Disposition, EventOutcome, Projector};
pub use query::{
    ConsistencyReport, GroupFilter, MemberGroup, Page, QueryService, Stats, MAX_PAGE_SIZE,
};
