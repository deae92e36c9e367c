use chrono::{DateTime, Duration, TimeZone, Utc};
use msgtrack_core::{
    Clock, DeliveryStatus, EventSource, ExecutionBatch, ManualClock, RawStatusEvent,
    ReconcileOutcome, SourceError, SourceFilter, StatusStore, StoreError,
};
use msgtrack_storage::{MessageStore, StoreOptions};
use msgtrack_sync::{run_pass, track_message, PassConfig, PassError, TrackRequest};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Barrier, Mutex};
use tempfile::NamedTempFile;

fn ts(offset_secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_771_855_200 + offset_secs, 0)
        .single()
        .expect("valid timestamp")
}

fn riyadh() -> chrono_tz::Tz {
    "Asia/Riyadh".parse().expect("zone")
}

fn raw(id: &str, status: &str, timestamp: i64, recipient: &str) -> RawStatusEvent {
    RawStatusEvent {
        id: Some(id.to_string()),
        status: Some(status.to_string()),
        timestamp: Some(json!(timestamp)),
        recipient_id: Some(recipient.to_string()),
    }
}

fn execution(id: &str, statuses: Vec<RawStatusEvent>) -> ExecutionBatch {
    ExecutionBatch {
        execution_id: id.to_string(),
        statuses,
    }
}

/// Hands out one scripted response per fetch; the last one repeats.
struct ScriptedSource {
    responses: Mutex<Vec<Result<Vec<ExecutionBatch>, SourceError>>>,
    filters: Mutex<Vec<SourceFilter>>,
}

impl ScriptedSource {
    fn new(responses: Vec<Result<Vec<ExecutionBatch>, SourceError>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            filters: Mutex::new(Vec::new()),
        }
    }

    fn always(batches: Vec<ExecutionBatch>) -> Self {
        Self::new(vec![Ok(batches)])
    }
}

impl EventSource for ScriptedSource {
    fn fetch(&self, filter: &SourceFilter) -> Result<Vec<ExecutionBatch>, SourceError> {
        self.filters.lock().expect("filters").push(filter.clone());
        let mut responses = self.responses.lock().expect("responses");
        if responses.len() > 1 {
            responses.remove(0)
        } else {
            responses
                .first()
                .cloned()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }
}

fn opener(path: &Path) -> impl Fn() -> Result<MessageStore, StoreError> + Sync + '_ {
    move || MessageStore::open(path, StoreOptions::default()).map_err(StoreError::from)
}

fn config() -> PassConfig {
    let mut config = PassConfig::new("wf-whatsapp");
    config.workers = 3;
    config
}

fn pass(
    source: &ScriptedSource,
    path: &Path,
    clock: &dyn Clock,
) -> Result<msgtrack_sync::PassReport, PassError> {
    run_pass(source, opener(path), clock, &config(), &AtomicBool::new(false))
}

#[test]
fn first_sighting_creates_record() {
    let db = NamedTempFile::new().expect("temp db");
    let clock = ManualClock::new(ts(0), riyadh());
    let source = ScriptedSource::always(vec![execution(
        "1",
        vec![raw("wamid.1", "sent", 100, "966500000001")],
    )]);

    let report = pass(&source, db.path(), &clock).expect("pass");
    assert_eq!((report.new, report.changed, report.unchanged, report.failed), (1, 0, 0, 0));

    let store = MessageStore::open(db.path(), StoreOptions::default()).expect("open");
    let record = store.find("wamid.1").expect("find").expect("record");
    assert_eq!(record.status_count, 1);
    assert_eq!(record.latest_status, DeliveryStatus::Sent);
    assert_eq!(record.conversation_id, "966500000001");
    assert_eq!(record.workflow_id, "wf-whatsapp");
    assert_eq!(record.last_updated_at, clock.local_now());
    assert_eq!(record.first_seen_at, record.last_scanned_at);
    assert!(record.is_consistent());
}

#[test]
fn new_status_extends_history_and_advances_last_updated() {
    let db = NamedTempFile::new().expect("temp db");
    let clock = ManualClock::new(ts(0), riyadh());
    let source = ScriptedSource::new(vec![
        Ok(vec![execution("1", vec![raw("wamid.1", "sent", 100, "c")])]),
        Ok(vec![
            execution("2", vec![raw("wamid.1", "delivered", 105, "c")]),
            execution("1", vec![raw("wamid.1", "sent", 100, "c")]),
        ]),
    ]);

    pass(&source, db.path(), &clock).expect("first pass");
    clock.advance(Duration::minutes(5));
    let report = pass(&source, db.path(), &clock).expect("second pass");
    assert_eq!(report.changed, 1);
    assert_eq!(report.messages[0].outcome, Some(ReconcileOutcome::Changed));

    let store = MessageStore::open(db.path(), StoreOptions::default()).expect("open");
    let record = store.find("wamid.1").expect("find").expect("record");
    assert_eq!(record.status_count, 2);
    assert_eq!(record.latest_status, DeliveryStatus::Delivered);
    assert_eq!(record.latest_timestamp, 105);
    assert_eq!(record.last_updated_at, clock.local_now());
    assert!(record.first_seen_at < record.last_updated_at);
}

#[test]
fn rescan_without_new_information_only_touches_scan_time() {
    let db = NamedTempFile::new().expect("temp db");
    let clock = ManualClock::new(ts(0), riyadh());
    let source = ScriptedSource::new(vec![
        Ok(vec![
            execution("2", vec![raw("wamid.1", "delivered", 105, "c")]),
            execution("1", vec![raw("wamid.1", "sent", 100, "c")]),
        ]),
        Ok(vec![execution("2", vec![raw("wamid.1", "delivered", 105, "c")])]),
    ]);

    pass(&source, db.path(), &clock).expect("first pass");
    let store = MessageStore::open(db.path(), StoreOptions::default()).expect("open");
    let before = store.find("wamid.1").expect("find").expect("record");

    clock.advance(Duration::minutes(10));
    let report = pass(&source, db.path(), &clock).expect("rescan");
    assert_eq!(report.unchanged, 1);

    let after = store.find("wamid.1").expect("find").expect("record");
    assert_eq!(after.status_history, before.status_history);
    assert_eq!(after.last_updated_at, before.last_updated_at);
    assert_eq!(after.last_scanned_at, clock.local_now());
}

#[test]
fn concurrent_first_sightings_merge_into_one_record() {
    let db = NamedTempFile::new().expect("temp db");
    // create the schema before both passes race on it
    drop(MessageStore::open(db.path(), StoreOptions::default()).expect("migrate"));

    let left = ScriptedSource::always(vec![execution("1", vec![raw("wamid.1", "sent", 100, "c")])]);
    let right = ScriptedSource::always(vec![execution(
        "2",
        vec![raw("wamid.1", "delivered", 105, "c")],
    )]);
    let clock = ManualClock::new(ts(0), riyadh());
    let barrier = Barrier::new(2);

    let reports: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = [&left, &right]
            .into_iter()
            .map(|source| {
                let barrier = &barrier;
                let clock = &clock;
                let path = db.path();
                scope.spawn(move || {
                    barrier.wait();
                    pass(source, path, clock)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("pass thread"))
            .collect()
    });

    let mut outcomes = Vec::new();
    for report in reports {
        let report = report.expect("pass");
        assert_eq!(report.failed, 0);
        outcomes.extend(report.messages.iter().filter_map(|message| message.outcome));
    }
    outcomes.sort_by_key(|outcome| outcome.as_str());
    assert_eq!(outcomes, vec![ReconcileOutcome::Changed, ReconcileOutcome::New]);

    let store = MessageStore::open(db.path(), StoreOptions::default()).expect("open");
    assert_eq!(store.record_count().expect("count"), 1);
    let record = store.find("wamid.1").expect("find").expect("record");
    assert_eq!(record.status_count, 2);
    assert_eq!(record.latest_status, DeliveryStatus::Delivered);
    assert!(record.is_consistent());
}

#[test]
fn repeated_pass_is_idempotent() {
    let db = NamedTempFile::new().expect("temp db");
    let clock = ManualClock::new(ts(0), riyadh());
    let source = ScriptedSource::always(vec![
        execution(
            "7",
            vec![
                raw("wamid.a", "read", 130, "c1"),
                raw("wamid.b", "delivered", 125, "c2"),
            ],
        ),
        execution(
            "6",
            vec![
                raw("wamid.a", "delivered", 110, "c1"),
                raw("wamid.a", "delivered", 110, "c1"),
                raw("wamid.b", "sent", 120, "c2"),
            ],
        ),
    ]);

    let first = pass(&source, db.path(), &clock).expect("first");
    assert_eq!(first.new, 2);

    let store = MessageStore::open(db.path(), StoreOptions::default()).expect("open");
    let snapshot_a = store.find("wamid.a").expect("find").expect("record");
    assert_eq!(snapshot_a.status_count, 2);

    clock.advance(Duration::minutes(1));
    let second = pass(&source, db.path(), &clock).expect("second");
    assert_eq!((second.new, second.changed, second.unchanged), (0, 0, 2));

    let again = store.find("wamid.a").expect("find").expect("record");
    assert_eq!(again.status_history, snapshot_a.status_history);
    assert_eq!(again.last_updated_at, snapshot_a.last_updated_at);
    assert!(again.last_scanned_at > snapshot_a.last_scanned_at);
}

#[test]
fn malformed_events_are_skipped_and_counted() {
    let db = NamedTempFile::new().expect("temp db");
    let clock = ManualClock::new(ts(0), riyadh());
    let mut no_timestamp = raw("wamid.1", "delivered", 0, "c");
    no_timestamp.timestamp = None;
    let source = ScriptedSource::always(vec![execution(
        "1",
        vec![
            raw("wamid.1", "sent", 100, "c"),
            no_timestamp,
            RawStatusEvent::default(),
        ],
    )]);

    let report = pass(&source, db.path(), &clock).expect("pass");
    assert_eq!(report.events_observed, 3);
    assert_eq!(report.malformed_events, 2);
    assert_eq!(report.new, 1);
    assert!(!report.is_total_store_failure());
}

#[test]
fn source_failure_aborts_before_writing() {
    let db = NamedTempFile::new().expect("temp db");
    let clock = ManualClock::new(ts(0), riyadh());
    let source = ScriptedSource::new(vec![Err(SourceError::Unavailable(
        "connect timeout".to_string(),
    ))]);

    let err = pass(&source, db.path(), &clock).expect_err("source down");
    assert!(matches!(err, PassError::Source(SourceError::Unavailable(_))));

    let store = MessageStore::open(db.path(), StoreOptions::default()).expect("open");
    assert_eq!(store.record_count().expect("count"), 0);
}

#[test]
fn unreachable_store_is_a_total_store_failure() {
    let clock = ManualClock::new(ts(0), riyadh());
    let source = ScriptedSource::always(vec![execution(
        "1",
        vec![raw("wamid.1", "sent", 100, "c"), raw("wamid.2", "sent", 101, "c")],
    )]);

    let report = run_pass(
        &source,
        || -> Result<MessageStore, StoreError> {
            Err(StoreError::Unavailable("database is locked".to_string()))
        },
        &clock,
        &config(),
        &AtomicBool::new(false),
    )
    .expect("pass completes");

    assert_eq!(report.failed, 2);
    assert_eq!(report.store_unavailable, 2);
    assert!(report.is_total_store_failure());
    assert!(report.messages.iter().all(|message| message.error.is_some()));
}

#[test]
fn panicking_worker_fails_the_pass() {
    let clock = ManualClock::new(ts(0), riyadh());
    let source = ScriptedSource::always(vec![execution(
        "1",
        vec![raw("wamid.1", "sent", 100, "c1")],
    )]);
    let open = || -> Result<MessageStore, StoreError> { panic!("store driver crashed") };

    let err = run_pass(&source, open, &clock, &config(), &AtomicBool::new(false))
        .expect_err("worker panic surfaces");
    assert!(matches!(err, PassError::WorkerPanicked(0)));
}

#[test]
fn cancelled_pass_writes_nothing_further() {
    let db = NamedTempFile::new().expect("temp db");
    let clock = ManualClock::new(ts(0), riyadh());
    let source = ScriptedSource::always(vec![execution(
        "1",
        vec![raw("wamid.1", "sent", 100, "c"), raw("wamid.2", "sent", 101, "c")],
    )]);

    let report = run_pass(
        &source,
        opener(db.path()),
        &clock,
        &config(),
        &AtomicBool::new(true),
    )
    .expect("pass");
    assert_eq!(report.cancelled, 2);
    assert_eq!(report.attempted(), 0);

    let store = MessageStore::open(db.path(), StoreOptions::default()).expect("open");
    assert_eq!(store.record_count().expect("count"), 0);
}

#[test]
fn filters_and_max_messages_reach_the_plan() {
    let db = NamedTempFile::new().expect("temp db");
    let clock = ManualClock::new(ts(0), riyadh());
    let source = ScriptedSource::always(vec![execution(
        "1",
        vec![
            raw("wamid.1", "sent", 100, "c1"),
            raw("wamid.2", "sent", 300, "c1"),
            raw("wamid.3", "sent", 200, "c1"),
            raw("wamid.4", "sent", 400, "c2"),
        ],
    )]);
    let mut config = config();
    config.filter.conversation_id = Some("c1".to_string());
    config.filter.max_executions = 25;
    config.max_messages = Some(2);

    let report = run_pass(
        &source,
        opener(db.path()),
        &clock,
        &config,
        &AtomicBool::new(false),
    )
    .expect("pass");
    assert_eq!(report.filtered_events, 1);
    let ids: Vec<&str> = report
        .messages
        .iter()
        .map(|message| message.message_id.as_str())
        .collect();
    assert_eq!(ids, vec!["wamid.2", "wamid.3"]);

    let seen = source.filters.lock().expect("filters");
    assert_eq!(seen[0].max_executions, 25);
}

#[test]
fn track_stops_at_terminal_status_and_reports_mismatches() {
    let db = NamedTempFile::new().expect("temp db");
    let store = MessageStore::open(db.path(), StoreOptions::default()).expect("open");
    let clock = ManualClock::new(ts(0), riyadh());
    let source = ScriptedSource::always(vec![
        execution("9", vec![raw("wamid.other", "sent", 900, "c1")]),
        execution(
            "8",
            vec![
                raw("wamid.1", "read", 300, "c1"),
                raw("wamid.1", "read", 301, "c-wrong"),
            ],
        ),
        execution("7", vec![raw("wamid.1", "delivered", 200, "c1")]),
        execution("6", vec![raw("wamid.1", "sent", 100, "c1")]),
    ]);
    let request = TrackRequest {
        conversation_id: "c1".to_string(),
        message_id: "wamid.1".to_string(),
        since: None,
        max_executions: 200,
    };

    let report = track_message(&source, &store, &clock, "wf-whatsapp", &request).expect("track");
    assert_eq!(report.executions_scanned, 2);
    assert_eq!(report.matching_executions, 1);
    assert_eq!(report.events_found, 2);
    assert_eq!(report.recipient_mismatches, 1);
    assert!(report.terminal_reached);
    assert_eq!(report.outcome, Some(ReconcileOutcome::New));

    let record = report.record.expect("record");
    assert_eq!(record.latest_status, DeliveryStatus::Read);
    assert_eq!(record.status_count, 1);
    assert_eq!(record.latest_timestamp_formatted.as_deref(), Some("1970-01-01 03:05"));
}

#[test]
fn track_without_sightings_returns_stored_view() {
    let db = NamedTempFile::new().expect("temp db");
    let store = MessageStore::open(db.path(), StoreOptions::default()).expect("open");
    let clock = ManualClock::new(ts(0), riyadh());
    let source = ScriptedSource::always(vec![execution(
        "1",
        vec![raw("wamid.1", "sent", 100, "c1")],
    )]);
    let request = TrackRequest {
        conversation_id: "c1".to_string(),
        message_id: "wamid.1".to_string(),
        since: None,
        max_executions: 200,
    };
    track_message(&source, &store, &clock, "wf-whatsapp", &request).expect("seed");

    let missing = TrackRequest {
        message_id: "wamid.unknown".to_string(),
        ..request.clone()
    };
    let report = track_message(&source, &store, &clock, "wf-whatsapp", &missing).expect("track");
    assert_eq!(report.outcome, None);
    assert!(report.record.is_none());
    assert_eq!(report.executions_scanned, 1);

    let known = track_message(&source, &store, &clock, "wf-whatsapp", &request).expect("track");
    assert_eq!(known.outcome, Some(ReconcileOutcome::Unchanged));
    assert_eq!(known.record.map(|record| record.status_count), Some(1));
}

#[test]
fn track_counts_malformed_events_for_the_message_only() {
    let db = NamedTempFile::new().expect("temp db");
    let store = MessageStore::open(db.path(), StoreOptions::default()).expect("open");
    let clock = ManualClock::new(ts(0), riyadh());
    let mut unaddressed = raw("wamid.1", "delivered", 210, "c1");
    unaddressed.recipient_id = None;
    let mut undated = raw("wamid.1", "delivered", 200, "c1");
    undated.timestamp = Some(json!("soon"));
    let mut other_broken = raw("wamid.2", "sent", 150, "c1");
    other_broken.status = None;
    let source = ScriptedSource::always(vec![
        execution("3", vec![unaddressed, undated]),
        execution("2", vec![other_broken, raw("wamid.1", "sent", 100, "c1")]),
    ]);
    let request = TrackRequest {
        conversation_id: "c1".to_string(),
        message_id: "wamid.1".to_string(),
        since: None,
        max_executions: 200,
    };

    let report = track_message(&source, &store, &clock, "wf-whatsapp", &request).expect("track");
    assert_eq!(report.malformed_events, 2);
    assert_eq!(report.events_found, 1);
    assert_eq!(report.matching_executions, 1);
    assert!(!report.terminal_reached);
    assert_eq!(report.outcome, Some(ReconcileOutcome::New));
    assert_eq!(report.record.map(|record| record.status_count), Some(1));
}
