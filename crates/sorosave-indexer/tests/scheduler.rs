//! Poll scheduler behaviour against a scripted in-memory event source.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use sorosave_db::{create_pool, run_migrations, DbRuntimeSettings};
use sorosave_events::RawEvent;
use sorosave_indexer::{
    EventPage, EventSource, FetchError, IndexerSignal, IngestError, PollScheduler,
    SchedulerConfig, SchedulerState,
};
use sorosave_projection::{MemberIndex, Projector};
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;

/// Replays a fixed script of fetch results, then reports "caught up".
struct ScriptedSource {
    script: Mutex<VecDeque<Result<EventPage, FetchError>>>,
    cursors: Mutex<Vec<i64>>,
}

impl ScriptedSource {
    fn new(script: Vec<Result<EventPage, FetchError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            cursors: Mutex::new(Vec::new()),
        })
    }

    fn cursors(&self) -> Vec<i64> {
        self.cursors.lock().expect("cursor log").clone()
    }
}

impl EventSource for ScriptedSource {
    fn fetch_since(
        &self,
        cursor: i64,
        _limit: usize,
    ) -> impl Future<Output = Result<EventPage, FetchError>> + Send {
        self.cursors.lock().expect("cursor log").push(cursor);
        let next = self
            .script
            .lock()
            .expect("script")
            .pop_front()
            .unwrap_or_else(|| {
                Ok(EventPage {
                    events: Vec::new(),
                    next_cursor: cursor,
                })
            });
        async move { next }
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    projector: Arc<Projector>,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("scheduler.db");
    let pool = create_pool(
        path.to_str().expect("utf-8 path"),
        DbRuntimeSettings::default(),
    )
    .expect("pool creation should succeed");
    run_migrations(&pool.get().expect("should get a connection"))
        .expect("migrations should succeed");

    Harness {
        projector: Arc::new(Projector::new(pool, Arc::new(MemberIndex::new()))),
        _dir: dir,
    }
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval: Duration::from_millis(20),
        batch_limit: 10,
    }
}

fn raw(id: &str, event_type: &str, ledger: i64, payload: serde_json::Value) -> RawEvent {
    RawEvent {
        id: id.to_string(),
        event_type: event_type.to_string(),
        group_id: None,
        payload,
        ledger_sequence: ledger,
        timestamp: "2024-07-01T00:00:00Z".to_string(),
    }
}

fn created(id: &str, ledger: i64) -> RawEvent {
    raw(
        id,
        "group_created",
        ledger,
        json!({
            "group_id": "1",
            "name": "Circle",
            "creator": "GADMIN",
            "token": "CUSDC",
            "contribution_amount": 100,
            "contribution_period": 3600,
            "max_members": 4
        }),
    )
}

fn page(events: Vec<RawEvent>, next_cursor: i64) -> Result<EventPage, FetchError> {
    Ok(EventPage {
        events,
        next_cursor,
    })
}

/// Drains already-delivered signals without waiting.
fn drain(rx: &mut broadcast::Receiver<IndexerSignal>) -> Vec<IndexerSignal> {
    let mut out = Vec::new();
    while let Ok(signal) = rx.try_recv() {
        out.push(signal);
    }
    out
}

/// Waits for the first signal matching `pred`, within a generous deadline.
async fn wait_for_signal(
    rx: &mut broadcast::Receiver<IndexerSignal>,
    pred: impl Fn(&IndexerSignal) -> bool,
) -> IndexerSignal {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(signal) if pred(&signal) => return signal,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("signal channel closed"),
            }
        }
    })
    .await
    .expect("signal should arrive in time")
}

// ── single pass ──────────────────────────────────────────────────────

#[tokio::test]
async fn empty_fetch_leaves_cursor_and_emits_no_sync() {
    let h = harness();
    let source = ScriptedSource::new(vec![]);
    let scheduler = PollScheduler::new(Arc::clone(&source), Arc::clone(&h.projector), config());
    let mut signals = scheduler.subscribe();

    assert_eq!(scheduler.poll_once().await.expect("poll"), 0);
    assert_eq!(scheduler.poll_once().await.expect("poll"), 0);

    assert_eq!(source.cursors(), vec![0, 0]);
    assert_eq!(scheduler.cursor().await, Some(0));
    assert!(drain(&mut signals).is_empty());
}

#[tokio::test]
async fn successful_pass_advances_cursor_and_signals() {
    let h = harness();
    let source = ScriptedSource::new(vec![page(
        vec![
            created("e1", 3),
            raw("e2", "group_started", 4, json!({"group_id": "1"})),
        ],
        4,
    )]);
    let scheduler = PollScheduler::new(Arc::clone(&source), Arc::clone(&h.projector), config());
    let mut signals = scheduler.subscribe();

    assert_eq!(scheduler.poll_once().await.expect("poll"), 2);
    scheduler.poll_once().await.expect("poll");

    assert_eq!(source.cursors(), vec![0, 4]);
    assert_eq!(
        drain(&mut signals),
        vec![
            IndexerSignal::Event {
                event_type: "group_created".to_string(),
                data: created("e1", 3).payload,
            },
            IndexerSignal::Event {
                event_type: "group_started".to_string(),
                data: json!({"group_id": "1"}),
            },
            IndexerSignal::Synced {
                count: 2,
                cursor: 4
            },
        ]
    );
}

#[tokio::test]
async fn fetch_failure_keeps_cursor_for_retry() {
    let h = harness();
    let source = ScriptedSource::new(vec![
        page(vec![created("e1", 5)], 5),
        Err(FetchError::Unavailable("rpc timeout".to_string())),
        page(vec![raw("e2", "group_started", 6, json!({"group_id": "1"}))], 6),
    ]);
    let scheduler = PollScheduler::new(Arc::clone(&source), Arc::clone(&h.projector), config());

    scheduler.poll_once().await.expect("first poll");
    let err = scheduler
        .poll_once()
        .await
        .expect_err("second poll should fail");
    assert!(matches!(err, IngestError::Fetch(FetchError::Unavailable(_))));
    assert_eq!(scheduler.cursor().await, Some(5));

    scheduler.poll_once().await.expect("third poll");
    assert_eq!(source.cursors(), vec![0, 5, 5]);
    assert_eq!(scheduler.cursor().await, Some(6));
}

#[tokio::test]
async fn cursor_is_recovered_from_the_event_log() {
    let h = harness();
    h.projector
        .ingest(&[created("e1", 41)])
        .expect("seed ingest should succeed");

    let source = ScriptedSource::new(vec![]);
    let scheduler = PollScheduler::new(Arc::clone(&source), Arc::clone(&h.projector), config());
    assert_eq!(scheduler.cursor().await, None);

    scheduler.poll_once().await.expect("poll");
    assert_eq!(source.cursors(), vec![41]);
}

#[tokio::test]
async fn cursor_never_moves_backwards() {
    let h = harness();
    let source = ScriptedSource::new(vec![
        page(vec![created("e1", 9)], 9),
        page(vec![raw("e2", "group_started", 10, json!({"group_id": "1"}))], 2),
    ]);
    let scheduler = PollScheduler::new(Arc::clone(&source), Arc::clone(&h.projector), config());

    scheduler.poll_once().await.expect("poll");
    scheduler.poll_once().await.expect("poll");
    assert_eq!(scheduler.cursor().await, Some(10));
}

#[tokio::test]
async fn cursor_covers_ingested_ledgers_when_source_lags() {
    let h = harness();
    let source = ScriptedSource::new(vec![page(vec![created("e1", 3)], 0)]);
    let scheduler = PollScheduler::new(Arc::clone(&source), Arc::clone(&h.projector), config());
    let mut signals = scheduler.subscribe();

    scheduler.poll_once().await.expect("poll");
    scheduler.poll_once().await.expect("poll");

    assert_eq!(source.cursors(), vec![0, 3]);
    assert_eq!(scheduler.cursor().await, Some(3));
    assert_eq!(
        h.projector.cursor().expect("cursor"),
        3,
        "live cursor agrees with the one recovered on restart"
    );
    assert!(drain(&mut signals).contains(&IndexerSignal::Synced { count: 1, cursor: 3 }));
}

#[tokio::test]
async fn rejected_event_is_signalled_as_error() {
    let h = harness();
    let source = ScriptedSource::new(vec![page(
        vec![
            created("e1", 1),
            raw("e2", "group_completed", 2, json!({"group_id": "1"})),
        ],
        2,
    )]);
    let scheduler = PollScheduler::new(Arc::clone(&source), Arc::clone(&h.projector), config());
    let mut signals = scheduler.subscribe();

    scheduler.poll_once().await.expect("poll");

    let errors: Vec<_> = drain(&mut signals)
        .into_iter()
        .filter_map(|s| match s {
            IndexerSignal::Error { cause } => Some(cause),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("e2"), "cause names the event: {}", errors[0]);
    assert!(errors[0].contains("illegal status transition"));
}

// ── loop lifecycle ───────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_is_not_reentrant_and_stop_is_observable() {
    let h = harness();
    let source = ScriptedSource::new(vec![page(vec![created("e1", 1)], 1)]);
    let scheduler = PollScheduler::new(Arc::clone(&source), Arc::clone(&h.projector), config());
    let mut signals = scheduler.subscribe();

    assert_eq!(scheduler.state(), SchedulerState::Idle);
    assert!(scheduler.start());
    assert!(!scheduler.start(), "second start is a no-op");

    assert_eq!(
        wait_for_signal(&mut signals, |_| true).await,
        IndexerSignal::Started
    );
    wait_for_signal(&mut signals, |s| matches!(s, IndexerSignal::Synced { .. })).await;

    // Let a few empty passes go by; none of them may emit a sync.
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(matches!(
        scheduler.state(),
        SchedulerState::Polling | SchedulerState::Sleeping
    ));

    scheduler.stop();
    tokio::time::timeout(Duration::from_secs(5), scheduler.stopped())
        .await
        .expect("scheduler should stop");
    assert_eq!(scheduler.state(), SchedulerState::Stopped);

    let rest = drain(&mut signals);
    assert!(rest
        .iter()
        .all(|s| !matches!(s, IndexerSignal::Synced { .. })));
    assert_eq!(rest.last(), Some(&IndexerSignal::Stopped));
    assert!(source.cursors().len() >= 2, "loop kept polling");
    assert!(source.cursors()[1..].iter().all(|&c| c == 1));

    assert!(!scheduler.start(), "a stopped scheduler does not restart");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn loop_surfaces_failures_and_keeps_polling() {
    let h = harness();
    let source = ScriptedSource::new(vec![
        Err(FetchError::Malformed("truncated page".to_string())),
        page(vec![created("e1", 2)], 2),
    ]);
    let scheduler = PollScheduler::new(Arc::clone(&source), Arc::clone(&h.projector), config());
    let mut signals = scheduler.subscribe();

    scheduler.start();

    let error = wait_for_signal(&mut signals, |s| matches!(s, IndexerSignal::Error { .. })).await;
    assert_eq!(
        error,
        IndexerSignal::Error {
            cause: "malformed event page: truncated page".to_string()
        }
    );
    let synced = wait_for_signal(&mut signals, |s| matches!(s, IndexerSignal::Synced { .. })).await;
    assert_eq!(synced, IndexerSignal::Synced { count: 1, cursor: 2 });
    assert_eq!(&source.cursors()[..2], &[0, 0]);

    scheduler.stop();
    tokio::time::timeout(Duration::from_secs(5), scheduler.stopped())
        .await
        .expect("scheduler should stop");
}

#[tokio::test]
async fn stop_before_start_goes_straight_to_stopped() {
    let h = harness();
    let scheduler = PollScheduler::new(ScriptedSource::new(vec![]), Arc::clone(&h.projector), config());
    let mut signals = scheduler.subscribe();

    scheduler.stop();
    scheduler.stopped().await;

    assert_eq!(scheduler.state(), SchedulerState::Stopped);
    assert!(!scheduler.start());
    assert_eq!(drain(&mut signals), vec![IndexerSignal::Stopped]);
}

/// Serves one page, but only after the test releases it.
struct GatedSource {
    entered: Notify,
    release: Notify,
    page: Mutex<Option<EventPage>>,
}

impl EventSource for GatedSource {
    fn fetch_since(
        &self,
        cursor: i64,
        _limit: usize,
    ) -> impl Future<Output = Result<EventPage, FetchError>> + Send {
        async move {
            self.entered.notify_one();
            self.release.notified().await;
            let page = self.page.lock().expect("page").take();
            Ok(page.unwrap_or(EventPage {
                events: Vec::new(),
                next_cursor: cursor,
            }))
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_waits_for_the_pass_in_flight() {
    let h = harness();
    let source = Arc::new(GatedSource {
        entered: Notify::new(),
        release: Notify::new(),
        page: Mutex::new(Some(EventPage {
            events: vec![created("e1", 7)],
            next_cursor: 7,
        })),
    });
    let scheduler = PollScheduler::new(Arc::clone(&source), Arc::clone(&h.projector), config());
    let mut signals = scheduler.subscribe();

    scheduler.start();
    tokio::time::timeout(Duration::from_secs(5), source.entered.notified())
        .await
        .expect("first fetch should begin");
    assert_eq!(scheduler.state(), SchedulerState::Polling);

    scheduler.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        scheduler.state(),
        SchedulerState::Polling,
        "stop is deferred while the fetch is pending"
    );

    source.release.notify_one();
    tokio::time::timeout(Duration::from_secs(5), scheduler.stopped())
        .await
        .expect("scheduler should stop after the pass");

    assert_eq!(h.projector.cursor().expect("cursor"), 7, "the pass committed");
    assert_eq!(scheduler.cursor().await, Some(7));
    let tail = drain(&mut signals);
    let synced = tail
        .iter()
        .position(|s| matches!(s, IndexerSignal::Synced { count: 1, cursor: 7 }))
        .expect("the interrupted pass still synced");
    assert_eq!(tail.last(), Some(&IndexerSignal::Stopped));
    assert!(synced < tail.len() - 1);
}

/// Empty pages whose fetch takes a scripted (virtual) time; records when
/// each fetch began.
struct TimedSource {
    delays: Mutex<VecDeque<Duration>>,
    starts: Mutex<Vec<Instant>>,
}

impl EventSource for TimedSource {
    fn fetch_since(
        &self,
        cursor: i64,
        _limit: usize,
    ) -> impl Future<Output = Result<EventPage, FetchError>> + Send {
        self.starts.lock().expect("starts").push(Instant::now());
        let delay = self
            .delays
            .lock()
            .expect("delays")
            .pop_front()
            .unwrap_or_default();
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(EventPage {
                events: Vec::new(),
                next_cursor: cursor,
            })
        }
    }
}

#[tokio::test(start_paused = true)]
async fn slow_pass_skips_missed_ticks_instead_of_bursting() {
    let h = harness();
    let source = Arc::new(TimedSource {
        // A fast warm-up fetch, then one pass that overruns three ticks.
        delays: Mutex::new(VecDeque::from([Duration::ZERO, Duration::from_millis(350)])),
        starts: Mutex::new(Vec::new()),
    });
    let scheduler = PollScheduler::new(
        Arc::clone(&source),
        Arc::clone(&h.projector),
        SchedulerConfig {
            poll_interval: Duration::from_millis(100),
            batch_limit: 10,
        },
    );

    // Recover the cursor up front so the loop itself never blocks on SQLite.
    scheduler.poll_once().await.expect("warm-up poll");
    source.starts.lock().expect("starts").clear();

    let origin = Instant::now();
    scheduler.start();
    tokio::time::sleep(Duration::from_millis(950)).await;
    scheduler.stop();
    scheduler.stopped().await;

    let offsets: Vec<u128> = source
        .starts
        .lock()
        .expect("starts")
        .iter()
        .map(|start| start.duration_since(origin).as_millis())
        .collect();

    // One catch-up pass right after the overrun, then back on the 100ms
    // grid; the ticks missed at 100, 200 and 300 are never replayed.
    assert_eq!(offsets, vec![0, 350, 400, 500, 600, 700, 800, 900]);
}
