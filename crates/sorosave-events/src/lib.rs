//! Raw contract events and the append-only event log.
//!
//! Every event fetched from the ledger is stored verbatim in the `events`
//! table, keyed by its globally unique id. Storage is idempotent: a
//! redelivered event is reported as `inserted = false` and has no effect.
//!
//! Before projection, a raw event is decoded into a [`ContractEvent`], a
//! tagged union over the event types the indexer models:
//!
//! | Type | Effect on projections |
//! |------|-----------------------|
//! | `group_created` | inserts a group in `forming` status |
//! | `member_joined` | upserts a member, recounts the group |
//! | `contribution_made` | records a contribution, bumps totals |
//! | `group_started` | `forming -> active` |
//! | `group_completed` | `active -> completed` |
//! | `group_cancelled` | `forming -> cancelled` |
//!
//! Any other type (for example `leave_group`) decodes to `None`: it is kept
//! in the log for audit but drives no mutation.
//!
//! # Usage
//!
//! ```rust,ignore
//! use sorosave_events::{append_event, ContractEvent};
//!
//! if append_event(&tx, &raw)?.inserted {
//!     if let Some(event) = ContractEvent::decode(&raw)? {
//!         apply(&tx, &event)?;
//!     }
//! }
//! ```

mod error;
mod event;
mod store;

pub use error::{DecodeError, StoreError};
pub use event::{
    ContractEvent, ContributionMade, EventKind, GroupCreated, MemberJoined, ParseEventKindError,
    RawEvent,
};
pub use store::{
    append_event, count_events, get_event, max_ledger_sequence, query_events, AppendOutcome,
    EventFilter,
};
