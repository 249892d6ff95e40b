//! Ingestion entry point
//!
//! Receives one call-lifecycle event per invocation and drives it through the
//! pipeline:
//!
//! ```text
//! ┌──────────┐   ┌────────┐   ┌──────────┐   ┌────────────┐   ┌───────────────┐
//! │ Received │ ► │ Routed │ ► │ Analyzed │ ► │ Aggregated │ ► │ AlertsChecked │ ► Done
//! └──────────┘   └────────┘   └──────────┘   └────────────┘   └───────────────┘
//!      │                     (call_ended with       │
//!      ▼                      a transcript only)    ▼
//!    Failed  ◄──────── malformed input / primary write failure
//! ```
//!
//! Malformed input and primary write failures are returned so the invoking
//! infrastructure can retry or dead-letter the event. Everything else
//! (assistant row, in-flight markers, directory lookups, alert delivery) is
//! logged and skipped. There is no internal retry.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use callpulse_core::{Config, Database, Ingestor};
//!
//! let config = Config::load()?;
//! let db = Arc::new(Database::open(&Config::database_path())?);
//! db.migrate()?;
//!
//! let ingestor = Ingestor::from_database(&config, db)?;
//! let report = ingestor.handle(r#"{"eventType":"template_viewed","templateId":"t1","timestamp":"2024-03-15T14:30:00Z"}"#)?;
//! println!("{:?}", report.disposition);
//! # Ok::<(), callpulse_core::Error>(())
//! ```

pub mod ledger;
pub mod router;

pub use ledger::idempotency_key;
pub use router::{route, Route};

use crate::aggregate::updater::{effective_objectives, effective_quality};
use crate::aggregate::{AggregateStore, AggregationUpdater, CommitOutcome};
use crate::alerts::{build_notifier, Alert, AlertEvaluator, CallSignals, Notifier};
use crate::analyzer::{AnalysisInput, ConversationAnalyzer};
use crate::config::Config;
use crate::db::Database;
use crate::directory::TemplateDirectory;
use crate::error::Result;
use crate::types::{AssistantProfile, CallLifecycleEvent, ConversationAnalysis, Sentiment};
use std::sync::Arc;

/// Pipeline states an event passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Received,
    Routed,
    Analyzed,
    Aggregated,
    AlertsChecked,
    Done,
    Failed,
}

/// What happened to the event's deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Deltas committed
    Applied,
    /// Idempotency key already claimed; nothing written, no alerts
    Duplicate,
    /// Unknown event type
    Ignored,
    /// Known type, but nothing to write
    NoOp,
}

/// Outcome of one successful invocation.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub event_type: String,
    pub route: Route,
    pub idempotency_key: Option<String>,
    pub stages: Vec<IngestStage>,
    pub disposition: Disposition,
    pub analysis: Option<ConversationAnalysis>,
    pub alerts: Vec<Alert>,
    pub alerts_failed: usize,
    /// Best-effort steps that failed and were skipped
    pub secondary_failures: Vec<String>,
}

impl IngestReport {
    fn new(event: &CallLifecycleEvent, route: Route) -> Self {
        Self {
            event_type: event.event_type.to_string(),
            route,
            idempotency_key: None,
            stages: vec![IngestStage::Received, IngestStage::Routed],
            disposition: Disposition::NoOp,
            analysis: None,
            alerts: Vec::new(),
            alerts_failed: 0,
            secondary_failures: Vec::new(),
        }
    }

    fn finish(mut self, disposition: Disposition) -> Self {
        self.disposition = disposition;
        self.stages.push(IngestStage::Done);
        self
    }
}

pub struct Ingestor {
    analyzer: ConversationAnalyzer,
    updater: AggregationUpdater,
    alerts: AlertEvaluator,
    directory: Option<Arc<dyn TemplateDirectory>>,
    dedupe: bool,
}

impl Ingestor {
    pub fn new(
        config: &Config,
        store: Arc<dyn AggregateStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            analyzer: ConversationAnalyzer::new(config.analyzer.clone()),
            updater: AggregationUpdater::new(store, config.ingest.active_call_ttl_secs),
            alerts: AlertEvaluator::new(
                config.alerts.clone(),
                notifier,
                config.notifications.subject_prefix.clone(),
            ),
            directory: None,
            dedupe: config.ingest.dedupe,
        }
    }

    /// Wire everything to one SQLite database, which also serves as the
    /// assistant directory. The notifier comes from `[notifications]`.
    pub fn from_database(config: &Config, db: Arc<Database>) -> Result<Self> {
        let notifier = build_notifier(&config.notifications)?;
        let directory: Arc<dyn TemplateDirectory> = db.clone();
        Ok(Self::new(config, db, notifier).with_directory(directory))
    }

    pub fn with_directory(mut self, directory: Arc<dyn TemplateDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn store(&self) -> &Arc<dyn AggregateStore> {
        self.updater.store()
    }

    /// Parse, validate and process one raw event body.
    pub fn handle(&self, raw: &str) -> Result<IngestReport> {
        let event = CallLifecycleEvent::from_json(raw).map_err(|e| {
            tracing::error!(stage = ?IngestStage::Failed, error = %e, "Rejected malformed event");
            e
        })?;
        self.handle_event(event)
    }

    /// Process one already-parsed event.
    pub fn handle_event(&self, mut event: CallLifecycleEvent) -> Result<IngestReport> {
        if let Err(e) = event.validate() {
            tracing::error!(stage = ?IngestStage::Failed, error = %e, "Rejected invalid event");
            return Err(e);
        }

        let route = route(&event.event_type);
        let report = IngestReport::new(&event, route);
        tracing::debug!(
            event_type = %event.event_type,
            call_id = ?event.call_id,
            template_id = ?event.template_id,
            route = route.as_str(),
            "Event routed"
        );

        let result = match route {
            Route::Ignore => {
                tracing::warn!(event_type = %event.event_type, "Unknown event type, dropping");
                Ok(report.finish(Disposition::Ignored))
            }
            Route::CallEnded => self.process_call_ended(&mut event, report),
            Route::CallFailed | Route::Escalation | Route::Aggregate | Route::AssistantSnapshot => {
                self.process(&event, None, report)
            }
        };

        if let Err(e) = &result {
            tracing::error!(
                stage = ?IngestStage::Failed,
                event_type = %event.event_type,
                call_id = ?event.call_id,
                error = %e,
                "Event processing failed"
            );
        }
        result
    }

    /// call_ended: enrich from the directory, analyze the transcript, then
    /// aggregate.
    fn process_call_ended(
        &self,
        event: &mut CallLifecycleEvent,
        mut report: IngestReport,
    ) -> Result<IngestReport> {
        let profile = self.lookup_assistant(event, &mut report);
        if let Some(profile) = &profile {
            if event.user_id.is_none() {
                event.user_id = profile.user_id.clone();
            }
        }

        let analysis = event.transcript().map(|transcript| {
            let category = profile
                .as_ref()
                .and_then(|p| p.category.as_deref())
                .or_else(|| event.template_category());
            let artifact = event.artifact.as_ref();
            let sentiment = artifact
                .and_then(|a| a.sentiment.as_deref())
                .and_then(|s| s.parse::<Sentiment>().ok());
            let score = artifact.and_then(|a| a.sentiment_score);

            let input = AnalysisInput::new(transcript)
                .with_category(category)
                .with_external_sentiment(sentiment, score);
            self.analyzer.analyze(&input)
        });

        if let Some(analysis) = &analysis {
            tracing::debug!(
                call_id = event.call_id(),
                sentiment = analysis.sentiment.as_str(),
                objectives = analysis.objectives_achieved.len(),
                lead_score = analysis.lead_score,
                "Transcript analyzed"
            );
            report.stages.push(IngestStage::Analyzed);
        }
        report.analysis = analysis;

        let analysis = report.analysis.clone();
        self.process(event, analysis.as_ref(), report)
    }

    fn lookup_assistant(
        &self,
        event: &CallLifecycleEvent,
        report: &mut IngestReport,
    ) -> Option<AssistantProfile> {
        let directory = self.directory.as_ref()?;
        let assistant_id = event.assistant_id.as_deref()?;

        match directory.lookup(assistant_id) {
            Ok(profile) => {
                if profile.is_none() {
                    tracing::debug!(assistant_id, "Assistant not in directory");
                }
                profile
            }
            Err(e) => {
                tracing::warn!(assistant_id, error = %e, "Directory lookup failed, continuing");
                report
                    .secondary_failures
                    .push(format!("directory lookup: {e}"));
                None
            }
        }
    }

    /// Plan and apply deltas, then run the alert checks.
    fn process(
        &self,
        event: &CallLifecycleEvent,
        analysis: Option<&ConversationAnalysis>,
        mut report: IngestReport,
    ) -> Result<IngestReport> {
        let plan = self.updater.plan(event, analysis);
        if plan.is_empty() {
            tracing::warn!(
                event_type = %event.event_type,
                template_id = ?event.template_id,
                "Event produced no updates"
            );
            return Ok(report.finish(Disposition::NoOp));
        }

        let key = if self.dedupe {
            idempotency_key(event)?
        } else {
            None
        };
        report.idempotency_key = key.clone();

        let applied = self.updater.apply(key.as_deref(), &plan)?;
        report.stages.push(IngestStage::Aggregated);
        report.secondary_failures.extend(applied.secondary_failures);

        if applied.commit == CommitOutcome::Duplicate {
            return Ok(report.finish(Disposition::Duplicate));
        }

        let signals = CallSignals {
            quality: effective_quality(event, analysis),
            objectives: effective_objectives(event, analysis).len(),
        };
        let alerts = self
            .alerts
            .evaluate(event, &signals, self.updater.store().as_ref());
        let emitted = self.alerts.emit(&alerts);
        report.alerts = alerts;
        report.alerts_failed = emitted.failed;
        report.stages.push(IngestStage::AlertsChecked);

        tracing::info!(
            event_type = %event.event_type,
            call_id = ?event.call_id,
            template_id = ?event.template_id,
            alerts = report.alerts.len(),
            secondary_failures = report.secondary_failures.len(),
            "Event processed"
        );
        Ok(report.finish(Disposition::Applied))
    }
}
