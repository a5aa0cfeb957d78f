//! Poll scheduler and runtime wiring for the SoroSave group indexer.
//!
//! The scheduler pulls pages of raw ledger events from an [`EventSource`]
//! at a fixed interval and hands them to the single-writer
//! [`Projector`](sorosave_projection::Projector). Progress and failures are
//! broadcast as [`IndexerSignal`]s; nothing requires a subscriber to be
//! present.
//!
//! How events are physically fetched (RPC, HTTP, replay) is up to the
//! [`EventSource`] implementation supplied by the embedding application.

pub mod config;
mod scheduler;
mod source;

pub use scheduler::{IndexerSignal, IngestError, PollScheduler, SchedulerConfig, SchedulerState};
pub use source::{EventPage, EventSource, FetchError};
