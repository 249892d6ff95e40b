//! Alert evaluation and publishing
//!
//! Two kinds of checks run after an event's deltas are committed:
//!
//! - **Read-back checks** re-read the template's month row (failure rate after
//!   `call_failed`).
//! - **Per-event checks** look only at the event and its derived signals
//!   (quality and objectives on `call_ended`, every `escalation_triggered`).
//!
//! Publishing is best-effort: delivery failures are logged and never reach
//! the caller.

pub mod notifier;
pub mod webhook;

pub use notifier::{build_notifier, LogNotifier, Notifier};
pub use webhook::WebhookNotifier;

use crate::aggregate::{AggregateStore, Period, TemplateAggregate};
use crate::config::AlertThresholds;
use crate::types::{CallLifecycleEvent, EventType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    HighFailureRate,
    QualityDegradation,
    HighPerformanceCall,
    EscalationTriggered,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::HighFailureRate => "high_failure_rate",
            AlertType::QualityDegradation => "quality_degradation",
            AlertType::HighPerformanceCall => "high_performance_call",
            AlertType::EscalationTriggered => "escalation_triggered",
        }
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transient alert, published once and not stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub alert_id: String,
    pub alert_type: AlertType,
    pub timestamp: DateTime<Utc>,
    pub template_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    pub payload: Value,
}

impl Alert {
    fn for_event(alert_type: AlertType, event: &CallLifecycleEvent, payload: Value) -> Self {
        Self {
            alert_id: uuid::Uuid::new_v4().to_string(),
            alert_type,
            timestamp: Utc::now(),
            template_id: event.template_id().to_string(),
            assistant_id: event.assistant_id.clone(),
            call_id: event.call_id.clone(),
            payload,
        }
    }
}

/// Signals of the event being processed that per-event checks use.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CallSignals {
    /// Effective quality score (event's own, else analyzed)
    pub quality: Option<f64>,
    /// Number of distinct objectives achieved
    pub objectives: usize,
}

/// Delivery summary of one [`AlertEvaluator::emit`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitReport {
    pub published: usize,
    pub failed: usize,
}

pub struct AlertEvaluator {
    thresholds: AlertThresholds,
    notifier: Arc<dyn Notifier>,
    subject_prefix: String,
}

impl AlertEvaluator {
    pub fn new(
        thresholds: AlertThresholds,
        notifier: Arc<dyn Notifier>,
        subject_prefix: impl Into<String>,
    ) -> Self {
        Self {
            thresholds,
            notifier,
            subject_prefix: subject_prefix.into(),
        }
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    /// Failure ratio of `row` when it crosses the threshold.
    ///
    /// Both bounds are strict: more than `min_calls_for_failure_rate` calls
    /// and a ratio above `failure_rate`.
    pub fn check_failure_rate(&self, row: &TemplateAggregate) -> Option<f64> {
        if row.total_calls <= self.thresholds.min_calls_for_failure_rate {
            return None;
        }
        row.failure_rate()
            .filter(|rate| *rate > self.thresholds.failure_rate)
    }

    /// Per-event checks for a finished call.
    pub fn call_ended_alerts(&self, event: &CallLifecycleEvent, signals: &CallSignals) -> Vec<Alert> {
        let mut alerts = Vec::new();

        if let Some(quality) = signals.quality {
            if quality < self.thresholds.low_quality_score {
                alerts.push(Alert::for_event(
                    AlertType::QualityDegradation,
                    event,
                    json!({
                        "qualityScore": quality,
                        "threshold": self.thresholds.low_quality_score,
                    }),
                ));
            }
        }

        if signals.objectives > self.thresholds.high_performance_objectives {
            alerts.push(Alert::for_event(
                AlertType::HighPerformanceCall,
                event,
                json!({ "objectivesAchieved": signals.objectives }),
            ));
        }

        alerts
    }

    /// Read-back check after a failed call.
    pub fn failure_rate_alert(
        &self,
        event: &CallLifecycleEvent,
        row: &TemplateAggregate,
    ) -> Option<Alert> {
        let rate = self.check_failure_rate(row)?;
        let percentage = (rate * 1000.0).round() / 10.0;
        Some(Alert::for_event(
            AlertType::HighFailureRate,
            event,
            json!({
                "failureRate": percentage,
                "totalCalls": row.total_calls,
                "failedCalls": row.failed_calls,
                "period": row.period,
                "message": format!(
                    "Failure rate {percentage}% over {} calls in {}",
                    row.total_calls, row.period
                ),
            }),
        ))
    }

    pub fn escalation_alert(&self, event: &CallLifecycleEvent) -> Alert {
        Alert::for_event(
            AlertType::EscalationTriggered,
            event,
            json!({ "reason": event.escalation_reason() }),
        )
    }

    /// Run every check that applies to `event`.
    ///
    /// Store read failures are logged and yield no alert.
    pub fn evaluate(
        &self,
        event: &CallLifecycleEvent,
        signals: &CallSignals,
        store: &dyn AggregateStore,
    ) -> Vec<Alert> {
        match event.event_type {
            EventType::CallEnded => self.call_ended_alerts(event, signals),
            EventType::EscalationTriggered => vec![self.escalation_alert(event)],
            EventType::CallFailed => {
                let period = Period::month_of(event.timestamp);
                match store.template_aggregate(event.template_id(), &period) {
                    Ok(Some(row)) => self.failure_rate_alert(event, &row).into_iter().collect(),
                    Ok(None) => Vec::new(),
                    Err(e) => {
                        tracing::warn!(
                            template_id = event.template_id(),
                            error = %e,
                            "Failure-rate read-back failed, skipping check"
                        );
                        Vec::new()
                    }
                }
            }
            _ => Vec::new(),
        }
    }

    /// Publish alerts, swallowing delivery failures.
    pub fn emit(&self, alerts: &[Alert]) -> EmitReport {
        let mut report = EmitReport::default();

        for alert in alerts {
            let subject = format!("{}.{}", self.subject_prefix, alert.alert_type);
            let result = serde_json::to_string(alert)
                .map_err(crate::error::Error::from)
                .and_then(|message| self.notifier.publish(&subject, &message));

            match result {
                Ok(()) => {
                    tracing::info!(
                        alert_id = %alert.alert_id,
                        alert_type = %alert.alert_type,
                        template_id = %alert.template_id,
                        "Alert published"
                    );
                    report.published += 1;
                }
                Err(e) => {
                    tracing::error!(
                        alert_id = %alert.alert_id,
                        alert_type = %alert.alert_type,
                        error = %e,
                        "Failed to publish alert"
                    );
                    report.failed += 1;
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        published: Mutex<Vec<(String, String)>>,
    }

    impl Notifier for Recorder {
        fn publish(&self, subject: &str, message: &str) -> Result<()> {
            self.published
                .lock()
                .unwrap()
                .push((subject.to_string(), message.to_string()));
            Ok(())
        }
    }

    struct Broken;

    impl Notifier for Broken {
        fn publish(&self, _subject: &str, _message: &str) -> Result<()> {
            Err(Error::Notification("channel down".to_string()))
        }
    }

    fn evaluator(notifier: Arc<dyn Notifier>) -> AlertEvaluator {
        AlertEvaluator::new(AlertThresholds::default(), notifier, "callpulse.alerts")
    }

    fn event(event_type: &str) -> CallLifecycleEvent {
        CallLifecycleEvent::from_json(
            &json!({
                "eventType": event_type, "callId": "c1", "assistantId": "a1",
                "templateId": "t1", "timestamp": "2024-03-15T14:30:00Z",
                "metadata": {"escalationReason": "caller asked for a human"}
            })
            .to_string(),
        )
        .unwrap()
    }

    fn row(total: i64, failed: i64) -> TemplateAggregate {
        TemplateAggregate {
            template_id: "t1".to_string(),
            period: "2024-03".to_string(),
            total_calls: total,
            successful_calls: total - failed,
            failed_calls: failed,
            escalations_triggered: 0,
            total_duration: 0.0,
            quality_score_sum: 0.0,
            quality_score_count: 0,
            total_usages: 0,
            template_views: 0,
            total_ratings: 0,
            rating_sum: 0,
            active_assistants: 0,
            deployed_assistants: 0,
            calls_started: 0,
            function_calls: 0,
            rating_distribution: [0; 5],
            objective_counts: BTreeMap::new(),
            unique_users: BTreeSet::new(),
            failure_reasons: BTreeSet::new(),
            escalation_reasons: BTreeSet::new(),
            functions_invoked: BTreeSet::new(),
            computed_at: Utc::now(),
        }
    }

    #[test]
    fn test_failure_rate_gating() {
        let eval = evaluator(Arc::new(LogNotifier));
        assert_eq!(eval.check_failure_rate(&row(9, 9)), None);
        assert_eq!(eval.check_failure_rate(&row(10, 10)), None);
        assert!(eval.check_failure_rate(&row(11, 3)).is_some());
        assert_eq!(eval.check_failure_rate(&row(11, 2)), None);
    }

    #[test]
    fn test_failure_rate_payload_percentage() {
        let eval = evaluator(Arc::new(LogNotifier));
        let alert = eval
            .failure_rate_alert(&event("call_failed"), &row(11, 3))
            .unwrap();
        assert_eq!(alert.alert_type, AlertType::HighFailureRate);
        assert_eq!(alert.payload["failureRate"], json!(27.3));
        assert_eq!(alert.payload["totalCalls"], json!(11));
    }

    #[test]
    fn test_call_ended_checks() {
        let eval = evaluator(Arc::new(LogNotifier));
        let ev = event("call_ended");

        let alerts = eval.call_ended_alerts(
            &ev,
            &CallSignals {
                quality: Some(1.5),
                objectives: 4,
            },
        );
        let types: Vec<_> = alerts.iter().map(|a| a.alert_type).collect();
        assert_eq!(
            types,
            vec![AlertType::QualityDegradation, AlertType::HighPerformanceCall]
        );

        let alerts = eval.call_ended_alerts(
            &ev,
            &CallSignals {
                quality: Some(2.0),
                objectives: 3,
            },
        );
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_emit_publishes_with_subject() {
        let recorder = Arc::new(Recorder::default());
        let eval = evaluator(recorder.clone());
        let alert = eval.escalation_alert(&event("escalation_triggered"));

        let report = eval.emit(&[alert]);
        assert_eq!(report, EmitReport { published: 1, failed: 0 });

        let published = recorder.published.lock().unwrap();
        assert_eq!(published[0].0, "callpulse.alerts.escalation_triggered");
        let body: Value = serde_json::from_str(&published[0].1).unwrap();
        assert_eq!(body["alertType"], "escalation_triggered");
        assert_eq!(body["payload"]["reason"], "caller asked for a human");
    }

    #[test]
    fn test_emit_swallows_failures() {
        let eval = evaluator(Arc::new(Broken));
        let alert = eval.escalation_alert(&event("escalation_triggered"));
        let report = eval.emit(&[alert.clone(), alert]);
        assert_eq!(report, EmitReport { published: 0, failed: 2 });
    }
}
