//! The poll scheduler: a fixed-interval fetch-and-ingest loop.
//!
//! The scheduler is an explicit state machine:
//!
//! ```text
//! Idle --start--> Polling --pass done--> Sleeping --tick--> Polling
//!   \                |                       |
//!    \--stop-->  Stopped <--stop (deferred)--/
//! ```
//!
//! A stop request made while a pass is running takes effect once the pass
//! has finished. Passes never overlap: the loop runs them one at a time and
//! [`PollScheduler::poll_once`] takes the same lock.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use sorosave_projection::{Disposition, ProjectionError, Projector};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::MissedTickBehavior;

use crate::source::{EventSource, FetchError};

/// Observable scheduler state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Polling,
    Sleeping,
    Stopped,
}

/// Lifecycle and observability signals, broadcast to any subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum IndexerSignal {
    Started,
    Stopped,
    /// A non-empty page was ingested and the cursor advanced.
    Synced { count: usize, cursor: i64 },
    /// A pass failed, or an event was rejected by the projection.
    Error { cause: String },
    /// A new event was added to the log.
    Event {
        #[serde(rename = "type")]
        event_type: String,
        data: Value,
    },
}

/// Errors that abort a single pass.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The event source failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Storage failed while ingesting.
    #[error(transparent)]
    Projection(#[from] ProjectionError),

    /// The blocking ingestion task panicked or was cancelled.
    #[error("ingestion task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Scheduler tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Time between the starts of two consecutive passes.
    pub poll_interval: Duration,
    /// Maximum number of events requested per pass.
    pub batch_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_limit: 100,
        }
    }
}

const SIGNAL_CAPACITY: usize = 256;

/// Drives periodic fetch-and-ingest passes against an [`EventSource`].
pub struct PollScheduler<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for PollScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<S> {
    source: S,
    projector: Arc<Projector>,
    config: SchedulerConfig,
    state: watch::Sender<SchedulerState>,
    stop: watch::Sender<bool>,
    signals: broadcast::Sender<IndexerSignal>,
    /// Ingestion cursor; `None` until recovered from the event log. Holding
    /// the lock is what makes a pass exclusive.
    cursor: Mutex<Option<i64>>,
}

impl<S: EventSource> PollScheduler<S> {
    pub fn new(source: S, projector: Arc<Projector>, config: SchedulerConfig) -> Self {
        let (state, _) = watch::channel(SchedulerState::Idle);
        let (stop, _) = watch::channel(false);
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                source,
                projector,
                config,
                state,
                stop,
                signals,
                cursor: Mutex::new(None),
            }),
        }
    }

    /// Subscribes to scheduler signals. Signals sent before subscribing are
    /// not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<IndexerSignal> {
        self.inner.signals.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> SchedulerState {
        *self.inner.state.borrow()
    }

    /// Current cursor, or `None` before the first pass recovered it.
    pub async fn cursor(&self) -> Option<i64> {
        *self.inner.cursor.lock().await
    }

    /// Starts the polling loop on the current tokio runtime.
    ///
    /// Returns `false`, doing nothing, unless the scheduler is `Idle`.
    pub fn start(&self) -> bool {
        let started = self.inner.state.send_if_modified(|state| {
            if *state == SchedulerState::Idle {
                *state = SchedulerState::Polling;
                true
            } else {
                false
            }
        });
        if !started {
            tracing::debug!(state = ?self.state(), "start ignored, scheduler not idle");
            return false;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run().await });
        true
    }

    /// Requests the loop to stop. A running pass completes first; await
    /// [`stopped`](Self::stopped) to observe the end.
    pub fn stop(&self) {
        self.inner.stop.send_replace(true);

        let never_started = self.inner.state.send_if_modified(|state| {
            if *state == SchedulerState::Idle {
                *state = SchedulerState::Stopped;
                true
            } else {
                false
            }
        });
        if never_started {
            let _ = self.inner.signals.send(IndexerSignal::Stopped);
        }
    }

    /// Resolves once the scheduler is `Stopped` and no pass is in flight.
    pub async fn stopped(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state
            .wait_for(|state| *state == SchedulerState::Stopped)
            .await;
    }

    /// Runs one fetch-and-ingest pass and returns the number of new events.
    ///
    /// Waits for a pass already in flight to finish first.
    ///
    /// # Errors
    ///
    /// Returns `IngestError` if the fetch or the ingestion fails; the cursor
    /// is left unchanged.
    pub async fn poll_once(&self) -> Result<usize, IngestError> {
        self.inner.poll_once().await
    }
}

impl<S: EventSource> Inner<S> {
    async fn run(self: Arc<Self>) {
        tracing::info!(
            poll_interval = ?self.config.poll_interval,
            batch_limit = self.config.batch_limit,
            "poll scheduler started"
        );
        let _ = self.signals.send(IndexerSignal::Started);

        let mut stop = self.stop.subscribe();
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => {}
            }
            if *stop.borrow() {
                break;
            }

            self.state.send_replace(SchedulerState::Polling);
            if let Err(e) = self.poll_once().await {
                tracing::error!(error = %e, "poll failed, retrying next cycle");
                let _ = self.signals.send(IndexerSignal::Error {
                    cause: e.to_string(),
                });
            }

            if *stop.borrow() {
                break;
            }
            self.state.send_replace(SchedulerState::Sleeping);
        }

        self.state.send_replace(SchedulerState::Stopped);
        let _ = self.signals.send(IndexerSignal::Stopped);
        tracing::info!("poll scheduler stopped");
    }

    async fn poll_once(&self) -> Result<usize, IngestError> {
        let mut slot = self.cursor.lock().await;

        let cursor = match *slot {
            Some(cursor) => cursor,
            None => {
                let projector = Arc::clone(&self.projector);
                let recovered = tokio::task::spawn_blocking(move || projector.cursor()).await??;
                tracing::info!(cursor = recovered, "recovered ingestion cursor");
                *slot = Some(recovered);
                recovered
            }
        };

        let page = self
            .source
            .fetch_since(cursor, self.config.batch_limit)
            .await?;

        if page.events.is_empty() {
            tracing::debug!(cursor, "caught up, no new events");
            return Ok(0);
        }

        let received = page.events.len();
        let events = page.events;
        let projector = Arc::clone(&self.projector);
        let report = tokio::task::spawn_blocking(move || projector.ingest(&events)).await??;

        for outcome in &report.outcomes {
            if let Disposition::Rejected(violation) = &outcome.disposition {
                let _ = self.signals.send(IndexerSignal::Error {
                    cause: format!("event {}: {violation}", outcome.event_id),
                });
            }
            if outcome.is_new() {
                let _ = self.signals.send(IndexerSignal::Event {
                    event_type: outcome.event_type.clone(),
                    data: outcome.payload.clone(),
                });
            }
        }

        // The cursor covers every ingested ledger and never moves backwards,
        // whatever the source reports.
        let next = page
            .next_cursor
            .max(report.last_ledger().unwrap_or(cursor))
            .max(cursor);
        *slot = Some(next);

        let count = report.inserted();
        let _ = self.signals.send(IndexerSignal::Synced {
            count,
            cursor: next,
        });
        tracing::info!(received, inserted = count, cursor = next, "synced event page");
        Ok(count)
    }
}
