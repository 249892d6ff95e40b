//! Integration tests for the callpulse ingestion pipeline
//!
//! These tests drive raw event JSON through [`Ingestor`] against real SQLite
//! databases (in-memory, or file-backed via `tempfile` where several
//! connections are needed) and check the resulting aggregate rows and alerts.

use callpulse_core::aggregate::{ActiveCall, AssistantUpdate, RowWrite};
use callpulse_core::alerts::{AlertType, Notifier};
use callpulse_core::config::Config;
use callpulse_core::db::Database;
use callpulse_core::error::{Error, Result};
use callpulse_core::{
    AggregateStore, AssistantAggregate, CommitOutcome, Disposition, Ingestor, Period,
    TemplateAggregate,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// ============================================
// Helpers
// ============================================

/// Captures every published alert subject.
#[derive(Default)]
struct RecordingNotifier {
    subjects: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    fn subjects(&self) -> Vec<String> {
        self.subjects.lock().unwrap().clone()
    }

    fn count(&self, alert_type: AlertType) -> usize {
        let suffix = format!(".{}", alert_type);
        self.subjects()
            .iter()
            .filter(|s| s.ends_with(&suffix))
            .count()
    }
}

impl Notifier for RecordingNotifier {
    fn publish(&self, subject: &str, _message: &str) -> Result<()> {
        self.subjects.lock().unwrap().push(subject.to_string());
        Ok(())
    }
}

/// Rejects every publish, like an unreachable webhook.
struct UnreachableNotifier;

impl Notifier for UnreachableNotifier {
    fn publish(&self, _subject: &str, _message: &str) -> Result<()> {
        Err(Error::Notification("connection refused".to_string()))
    }
}

/// Which part of an [`OutageStore`] is unavailable.
#[derive(Clone, Copy)]
enum Outage {
    /// The month/hour transaction.
    Commit,
    /// The assistant table.
    Assistant,
}

/// SQLite store with one part failing every write.
struct OutageStore {
    inner: Database,
    outage: Outage,
}

impl OutageStore {
    fn new(outage: Outage) -> Self {
        let inner = Database::open_in_memory().expect("open in-memory db");
        inner.migrate().expect("migrate");
        Self { inner, outage }
    }
}

impl AggregateStore for OutageStore {
    fn commit(&self, key: Option<&str>, writes: &[RowWrite]) -> Result<CommitOutcome> {
        match self.outage {
            Outage::Commit => Err(Error::Store("template_aggregates unavailable".to_string())),
            Outage::Assistant => self.inner.commit(key, writes),
        }
    }

    fn template_aggregate(
        &self,
        template_id: &str,
        period: &Period,
    ) -> Result<Option<TemplateAggregate>> {
        self.inner.template_aggregate(template_id, period)
    }

    fn update_assistant(&self, assistant_id: &str, update: &AssistantUpdate) -> Result<()> {
        match self.outage {
            Outage::Assistant => Err(Error::Store("assistant_aggregates unavailable".to_string())),
            Outage::Commit => self.inner.update_assistant(assistant_id, update),
        }
    }

    fn assistant_aggregate(&self, assistant_id: &str) -> Result<Option<AssistantAggregate>> {
        self.inner.assistant_aggregate(assistant_id)
    }

    fn open_call(&self, call: &ActiveCall) -> Result<()> {
        self.inner.open_call(call)
    }

    fn close_call(&self, call_id: &str) -> Result<bool> {
        self.inner.close_call(call_id)
    }

    fn concurrent_calls(&self, template_id: &str, at: DateTime<Utc>) -> Result<i64> {
        self.inner.concurrent_calls(template_id, at)
    }
}

fn memory_db() -> Arc<Database> {
    let db = Database::open_in_memory().expect("open in-memory db");
    db.migrate().expect("migrate");
    Arc::new(db)
}

fn pipeline() -> (Ingestor, Arc<Database>, Arc<RecordingNotifier>) {
    let db = memory_db();
    let notifier = Arc::new(RecordingNotifier::default());
    let ingestor = Ingestor::new(&Config::default(), db.clone(), notifier.clone())
        .with_directory(db.clone());
    (ingestor, db, notifier)
}

fn march() -> Period {
    Period::Month {
        year: 2024,
        month: 3,
    }
}

fn month_row(db: &Database, template_id: &str) -> TemplateAggregate {
    db.template_aggregate(template_id, &march())
        .expect("read month row")
        .expect("month row exists")
}

/// Row with `computed_at` pinned so rows written at different instants compare equal.
fn normalized(mut row: TemplateAggregate) -> TemplateAggregate {
    row.computed_at = Utc.timestamp_opt(0, 0).unwrap();
    row
}

fn call_ended(call_id: &str, duration: u32, status: &str) -> String {
    json!({
        "eventType": "call_ended",
        "callId": call_id,
        "assistantId": "asst-1",
        "templateId": "tmpl-1",
        "userId": format!("user-{call_id}"),
        "timestamp": "2024-03-15T14:30:00Z",
        "duration": duration,
        "status": status,
    })
    .to_string()
}

fn call_failed(call_id: &str) -> String {
    json!({
        "eventType": "call_failed",
        "callId": call_id,
        "assistantId": "asst-1",
        "templateId": "tmpl-1",
        "timestamp": "2024-03-15T15:00:00Z",
        "metadata": {"failureReason": "no-answer"},
    })
    .to_string()
}

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures/events")
        .join(name)
}

// ============================================
// Aggregation
// ============================================

#[test]
fn test_deltas_commute() {
    let events = vec![
        call_ended("c1", 60, "completed"),
        call_ended("c2", 90, "busy"),
        call_failed("c3"),
        json!({"eventType": "template_rated", "templateId": "tmpl-1", "eventId": "r1",
               "timestamp": "2024-03-15T10:00:00Z", "metadata": {"rating": 4}})
        .to_string(),
        json!({"eventType": "template_used", "templateId": "tmpl-1", "userId": "user-c1",
               "eventId": "u1", "timestamp": "2024-03-15T11:00:00Z"})
        .to_string(),
        json!({"eventType": "escalation_triggered", "callId": "c2", "templateId": "tmpl-1",
               "timestamp": "2024-03-15T14:31:00Z", "metadata": {"reason": "wants a human"}})
        .to_string(),
    ];

    let (forward, forward_db, _) = pipeline();
    for raw in &events {
        forward.handle(raw).unwrap();
    }
    let (backward, backward_db, _) = pipeline();
    for raw in events.iter().rev() {
        backward.handle(raw).unwrap();
    }

    assert_eq!(
        normalized(month_row(&forward_db, "tmpl-1")),
        normalized(month_row(&backward_db, "tmpl-1"))
    );

    let hour = Period::parse("2024-03-15T14").unwrap();
    let forward_hour = forward_db.template_aggregate("tmpl-1", &hour).unwrap().unwrap();
    let backward_hour = backward_db.template_aggregate("tmpl-1", &hour).unwrap().unwrap();
    assert_eq!(normalized(forward_hour), normalized(backward_hour));
}

#[test]
fn test_unknown_type_leaves_aggregates_unchanged() {
    let (ingestor, db, notifier) = pipeline();
    ingestor.handle(&call_ended("c1", 60, "completed")).unwrap();
    let before = month_row(&db, "tmpl-1");

    let report = ingestor
        .handle(r#"{"eventType":"voicemail_left","templateId":"tmpl-1","timestamp":"2024-03-15T16:00:00Z"}"#)
        .unwrap();

    assert_eq!(report.disposition, Disposition::Ignored);
    assert_eq!(month_row(&db, "tmpl-1"), before);
    assert!(notifier.subjects().is_empty());
}

#[test]
fn test_rating_maps_to_distribution_bucket() {
    let (ingestor, db, _) = pipeline();
    for (id, rating) in [("r1", 1), ("r2", 5), ("r3", 5), ("r4", 3), ("r5", 0)] {
        ingestor
            .handle(
                &json!({"eventType": "template_rated", "eventId": id, "templateId": "tmpl-1",
                        "timestamp": "2024-03-15T10:00:00Z", "metadata": {"rating": rating}})
                .to_string(),
            )
            .unwrap();
    }

    let row = month_row(&db, "tmpl-1");
    assert_eq!(row.rating_distribution, [1, 0, 1, 0, 2]);
    assert_eq!(row.total_ratings, 4);
    assert_eq!(row.rating_sum, 14);
    assert_eq!(row.average_rating(), Some(3.5));
}

#[test]
fn test_call_ended_updates_month_hour_and_assistant() {
    let (ingestor, db, _) = pipeline();
    ingestor
        .handle(
            &json!({
                "eventType": "call_ended", "callId": "c1", "assistantId": "asst-1",
                "templateId": "tmpl-1", "userId": "user-1",
                "timestamp": "2024-03-15T14:30:00Z", "duration": 120,
                "status": "completed", "qualityScore": 4.0,
                "objectivesAchieved": ["budget_discussed", "need_identified"]
            })
            .to_string(),
        )
        .unwrap();

    let row = month_row(&db, "tmpl-1");
    assert_eq!(row.total_calls, 1);
    assert_eq!(row.successful_calls, 1);
    assert_eq!(row.total_duration, 120.0);
    assert_eq!(row.quality_score_sum, 4.0);
    assert_eq!(row.quality_score_count, 1);
    assert_eq!(row.objective_counts.get("budget_discussed"), Some(&1));
    assert!(row.unique_users.contains("user-1"));

    let hour = db
        .template_aggregate("tmpl-1", &Period::parse("2024-03-15T14").unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(hour.total_calls, 1);
    assert_eq!(hour.total_duration, 120.0);

    let assistant = db.assistant_aggregate("asst-1").unwrap().unwrap();
    assert_eq!(assistant.total_calls, 1);
    assert_eq!(assistant.successful_calls, 1);
    assert_eq!(
        assistant.last_call_at,
        Some(Utc.with_ymd_and_hms(2024, 3, 15, 14, 30, 0).unwrap())
    );
}

#[test]
fn test_performance_update_overwrites_snapshot() {
    let (ingestor, db, _) = pipeline();
    for latency in [500, 420] {
        ingestor
            .handle(
                &json!({"eventType": "assistant_performance_update", "assistantId": "asst-1",
                        "timestamp": "2024-03-15T10:00:00Z",
                        "metadata": {"performanceMetrics": {"avgLatencyMs": latency}}})
                .to_string(),
            )
            .unwrap();
    }

    let assistant = db.assistant_aggregate("asst-1").unwrap().unwrap();
    assert_eq!(assistant.total_calls, 0);
    assert_eq!(
        assistant.performance_metrics,
        Some(json!({"avgLatencyMs": 420}))
    );
}

// ============================================
// Alerts
// ============================================

fn run_failure_scenario(successes: usize, failures: usize) -> Arc<RecordingNotifier> {
    let (ingestor, _db, notifier) = pipeline();
    for i in 0..successes {
        ingestor
            .handle(&call_ended(&format!("ok-{i}"), 30, "completed"))
            .unwrap();
    }
    for i in 0..failures {
        ingestor.handle(&call_failed(&format!("fail-{i}"))).unwrap();
    }
    notifier
}

#[test]
fn test_failure_rate_needs_more_than_ten_calls() {
    let notifier = run_failure_scenario(0, 9);
    assert_eq!(notifier.count(AlertType::HighFailureRate), 0);
}

#[test]
fn test_failure_rate_fires_above_twenty_percent() {
    let notifier = run_failure_scenario(8, 3);
    assert_eq!(notifier.count(AlertType::HighFailureRate), 1);
}

#[test]
fn test_failure_rate_at_eighteen_percent_is_quiet() {
    let notifier = run_failure_scenario(9, 2);
    assert_eq!(notifier.count(AlertType::HighFailureRate), 0);
}

#[test]
fn test_escalation_always_alerts_once() {
    let (ingestor, db, notifier) = pipeline();
    let report = ingestor
        .handle(
            &json!({"eventType": "escalation_triggered", "callId": "c1", "templateId": "tmpl-1",
                    "timestamp": "2024-03-15T14:31:00Z",
                    "metadata": {"escalationReason": "caller asked for a manager"}})
            .to_string(),
        )
        .unwrap();

    assert_eq!(report.alerts.len(), 1);
    assert_eq!(notifier.subjects(), vec!["callpulse.alerts.escalation_triggered"]);

    let row = month_row(&db, "tmpl-1");
    assert_eq!(row.escalations_triggered, 1);
    assert!(row.escalation_reasons.contains("caller asked for a manager"));
}

#[test]
fn test_low_quality_and_high_performance_alerts() {
    let (ingestor, _db, notifier) = pipeline();
    ingestor
        .handle(
            &json!({"eventType": "call_ended", "callId": "c1", "assistantId": "asst-1",
                    "templateId": "tmpl-1", "timestamp": "2024-03-15T14:30:00Z",
                    "status": "completed", "qualityScore": 1.5,
                    "objectivesAchieved": ["a", "b", "c", "d"]})
            .to_string(),
        )
        .unwrap();

    assert_eq!(notifier.count(AlertType::QualityDegradation), 1);
    assert_eq!(notifier.count(AlertType::HighPerformanceCall), 1);
}

// ============================================
// Failure isolation and idempotency
// ============================================

#[test]
fn test_assistant_write_failure_is_isolated() {
    let store = Arc::new(OutageStore::new(Outage::Assistant));
    let notifier = Arc::new(RecordingNotifier::default());
    let ingestor = Ingestor::new(&Config::default(), store.clone(), notifier.clone());

    let report = ingestor
        .handle(
            &json!({"eventType": "call_ended", "callId": "c1", "assistantId": "asst-1",
                    "templateId": "tmpl-1", "timestamp": "2024-03-15T14:30:00Z",
                    "duration": 45, "status": "completed", "qualityScore": 1.0})
            .to_string(),
        )
        .expect("secondary failure must not fail the event");

    assert_eq!(report.disposition, Disposition::Applied);
    assert_eq!(report.secondary_failures.len(), 1);
    assert_eq!(notifier.count(AlertType::QualityDegradation), 1);

    let row = store.template_aggregate("tmpl-1", &march()).unwrap().unwrap();
    assert_eq!(row.total_calls, 1);
    assert_eq!(row.total_duration, 45.0);
    assert!(store.assistant_aggregate("asst-1").unwrap().is_none());
}

#[test]
fn test_primary_write_failure_is_returned() {
    let store = Arc::new(OutageStore::new(Outage::Commit));
    let notifier = Arc::new(RecordingNotifier::default());
    let ingestor = Ingestor::new(&Config::default(), store.clone(), notifier.clone());

    let ts = Utc::now().to_rfc3339();
    let started = json!({"eventType": "call_started", "callId": "c1", "templateId": "tmpl-1",
                         "timestamp": ts})
    .to_string();
    let err = ingestor.handle(&started).unwrap_err();
    assert!(matches!(err, Error::Store(_)), "got {err:?}");
    assert_eq!(store.concurrent_calls("tmpl-1", Utc::now()).unwrap(), 0);

    let escalation = json!({"eventType": "escalation_triggered", "callId": "c1",
                            "templateId": "tmpl-1", "timestamp": "2024-03-15T14:30:00Z",
                            "metadata": {"reason": "angry caller"}})
    .to_string();
    assert!(matches!(ingestor.handle(&escalation), Err(Error::Store(_))));
    assert!(notifier.subjects().is_empty());

    let ended = json!({"eventType": "call_ended", "callId": "c1", "assistantId": "asst-1",
                       "templateId": "tmpl-1", "timestamp": "2024-03-15T14:30:00Z",
                       "duration": 30, "status": "completed"})
    .to_string();
    assert!(ingestor.handle(&ended).is_err());
    assert!(store.assistant_aggregate("asst-1").unwrap().is_none());
}

#[test]
fn test_alert_delivery_failure_keeps_event_applied() {
    let db = memory_db();
    let ingestor = Ingestor::new(&Config::default(), db.clone(), Arc::new(UnreachableNotifier));

    let report = ingestor
        .handle(
            &json!({"eventType": "escalation_triggered", "callId": "c1",
                    "templateId": "tmpl-1", "timestamp": "2024-03-15T14:30:00Z",
                    "metadata": {"reason": "angry caller"}})
            .to_string(),
        )
        .expect("delivery failure must not fail the event");

    assert_eq!(report.disposition, Disposition::Applied);
    assert_eq!(report.alerts.len(), 1);
    assert_eq!(report.alerts_failed, 1);
    assert_eq!(month_row(&db, "tmpl-1").escalations_triggered, 1);
}

#[test]
fn test_out_of_scale_quality_leaves_average_intact() {
    let (ingestor, db, _) = pipeline();
    let call = |call_id: &str, quality: f64| {
        json!({"eventType": "call_ended", "callId": call_id, "assistantId": "asst-1",
               "templateId": "tmpl-1", "timestamp": "2024-03-15T14:30:00Z",
               "duration": 60, "status": "completed", "qualityScore": quality})
        .to_string()
    };

    assert!(ingestor.handle(&call("c1", 4.0)).is_ok());
    for (call_id, quality) in [("c2", 42.0), ("c3", 0.0), ("c4", -3.0)] {
        let err = ingestor.handle(&call(call_id, quality)).unwrap_err();
        assert!(
            matches!(err, Error::InvalidEvent { ref field, .. } if field == "qualityScore"),
            "quality {quality}"
        );
    }

    let row = month_row(&db, "tmpl-1");
    assert_eq!(row.total_calls, 1);
    assert_eq!(row.quality_score_count, 1);
    assert_eq!(row.quality_score_sum, 4.0);
    assert_eq!(row.average_quality(), Some(4.0));
}

#[test]
fn test_redelivery_does_not_change_aggregates() {
    let (ingestor, db, notifier) = pipeline();
    let raw = json!({"eventType": "call_ended", "callId": "c1", "assistantId": "asst-1",
                     "templateId": "tmpl-1", "timestamp": "2024-03-15T14:30:00Z",
                     "duration": 60, "status": "completed", "qualityScore": 1.0})
    .to_string();

    assert_eq!(ingestor.handle(&raw).unwrap().disposition, Disposition::Applied);
    let row = month_row(&db, "tmpl-1");
    let assistant = db.assistant_aggregate("asst-1").unwrap().unwrap();
    let alerts = notifier.subjects().len();

    let report = ingestor.handle(&raw).unwrap();
    assert_eq!(report.disposition, Disposition::Duplicate);
    assert!(report.alerts.is_empty());
    assert_eq!(normalized(month_row(&db, "tmpl-1")), normalized(row));
    assert_eq!(
        db.assistant_aggregate("asst-1").unwrap().unwrap().total_calls,
        assistant.total_calls
    );
    assert_eq!(notifier.subjects().len(), alerts);
}

#[test]
fn test_concurrent_calls_gauge_tracks_open_calls() {
    let (ingestor, db, _) = pipeline();
    let now = Utc::now();
    for call_id in ["c1", "c2"] {
        ingestor
            .handle(
                &json!({"eventType": "call_started", "callId": call_id, "templateId": "tmpl-1",
                        "timestamp": now.to_rfc3339()})
                .to_string(),
            )
            .unwrap();
    }
    assert_eq!(db.concurrent_calls("tmpl-1", now).unwrap(), 2);

    ingestor
        .handle(
            &json!({"eventType": "call_ended", "callId": "c1", "assistantId": "asst-1",
                    "templateId": "tmpl-1", "timestamp": (now + Duration::seconds(30)).to_rfc3339(),
                    "status": "completed"})
            .to_string(),
        )
        .unwrap();
    assert_eq!(db.concurrent_calls("tmpl-1", now).unwrap(), 1);

    let far_future = now + Duration::hours(5);
    assert_eq!(db.concurrent_calls("tmpl-1", far_future).unwrap(), 0);
}

// ============================================
// Concurrency
// ============================================

#[test]
fn test_concurrent_call_ended_events_sum_correctly() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("aggregates.db");
    Database::open(&db_path).unwrap().migrate().unwrap();

    let events = [
        call_ended("c1", 60, "completed"),
        call_ended("c2", 120, "completed"),
        call_ended("c3", 180, "failed"),
    ];

    // One connection per invocation, as separate workers would have
    std::thread::scope(|scope| {
        for raw in &events {
            let db_path = db_path.clone();
            scope.spawn(move || {
                let db = Arc::new(Database::open(&db_path).unwrap());
                let ingestor =
                    Ingestor::new(&Config::default(), db, Arc::new(RecordingNotifier::default()));
                let report = ingestor.handle(raw).unwrap();
                assert_eq!(report.disposition, Disposition::Applied);
            });
        }
    });

    let db = Database::open(&db_path).unwrap();
    let row = month_row(&db, "tmpl-1");
    assert_eq!(row.total_calls, 3);
    assert_eq!(row.successful_calls, 2);
    assert_eq!(row.failed_calls, 1);
    assert_eq!(row.total_duration, 360.0);
    assert_eq!(row.unique_users.len(), 3);

    let assistant = db.assistant_aggregate("asst-1").unwrap().unwrap();
    assert_eq!(assistant.total_calls, 3);
    assert_eq!(assistant.successful_calls, 2);
}

#[test]
fn test_shared_ingestor_across_threads() {
    let (ingestor, db, _) = pipeline();

    std::thread::scope(|scope| {
        for t in 0..4 {
            let ingestor = &ingestor;
            scope.spawn(move || {
                for i in 0..25 {
                    ingestor
                        .handle(&call_ended(&format!("t{t}-c{i}"), 10, "completed"))
                        .unwrap();
                }
            });
        }
    });

    let row = month_row(&db, "tmpl-1");
    assert_eq!(row.total_calls, 100);
    assert_eq!(row.successful_calls, 100);
    assert_eq!(row.total_duration, 1000.0);
    assert_eq!(db.processed_event_count().unwrap(), 100);
}

// ============================================
// Fixture replay
// ============================================

#[test]
fn test_replay_march_day_fixture() {
    let (ingestor, db, notifier) = pipeline();
    let content = std::fs::read_to_string(fixture_path("march-day.jsonl")).unwrap();

    let dispositions: Vec<Disposition> = content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| ingestor.handle(line).unwrap().disposition)
        .collect();

    assert_eq!(dispositions.len(), 12);
    assert_eq!(
        dispositions.iter().filter(|d| **d == Disposition::Applied).count(),
        10
    );
    assert_eq!(dispositions[10], Disposition::Ignored);
    assert_eq!(dispositions[11], Disposition::Duplicate);

    let row = month_row(&db, "tmpl-sales");
    assert_eq!(row.total_calls, 2);
    assert_eq!(row.successful_calls, 1);
    assert_eq!(row.failed_calls, 1);
    assert_eq!(row.escalations_triggered, 1);
    assert_eq!(row.total_duration, 240.0);
    assert_eq!(row.quality_score_count, 1);
    assert_eq!(row.quality_score_sum, 5.0);
    assert_eq!(row.total_usages, 1);
    assert_eq!(row.template_views, 1);
    assert_eq!(row.rating_distribution, [0, 0, 0, 0, 1]);
    assert_eq!(row.active_assistants, 1);
    assert_eq!(row.deployed_assistants, 1);
    assert_eq!(row.function_calls, 1);
    assert_eq!(row.calls_started, 0);
    assert_eq!(row.objective_counts.len(), 4);
    assert!(row.functions_invoked.contains("book_meeting"));
    assert!(row.failure_reasons.contains("no-answer"));
    assert_eq!(
        row.unique_users.iter().cloned().collect::<Vec<_>>(),
        vec!["caller-1".to_string(), "user-1".to_string()]
    );

    let hour = db
        .template_aggregate("tmpl-sales", &Period::parse("2024-03-15T14").unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(hour.calls_started, 1);
    assert_eq!(hour.total_calls, 1);

    assert_eq!(notifier.count(AlertType::HighPerformanceCall), 1);
    assert_eq!(notifier.count(AlertType::EscalationTriggered), 1);
    assert_eq!(notifier.subjects().len(), 2);
}
