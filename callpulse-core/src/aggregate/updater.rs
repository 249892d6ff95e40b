//! Aggregation updater
//!
//! Turns one event (plus the optional transcript analysis) into an
//! [`UpdatePlan`] of typed deltas, then applies the plan to an
//! [`AggregateStore`]. Planning is pure; all I/O happens in [`AggregationUpdater::apply`].

use super::{
    ActiveCall, AggregateStore, AssistantUpdate, Bucket, CommitOutcome, Counter, Delta, Period,
    RowWrite, SetField,
};
use crate::error::Result;
use crate::types::{CallLifecycleEvent, ConversationAnalysis, EventType};
use chrono::Duration;
use std::sync::Arc;

/// Assistant-row part of a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantWrite {
    pub assistant_id: String,
    pub update: AssistantUpdate,
    /// Set when the assistant row is the only fact the event carries; a
    /// failure then fails the event instead of being logged.
    pub primary: bool,
}

/// Everything one event changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdatePlan {
    /// Template rows, committed together with the idempotency claim
    pub writes: Vec<RowWrite>,
    pub assistant: Option<AssistantWrite>,
    pub open_call: Option<ActiveCall>,
    pub close_call: Option<String>,
}

impl UpdatePlan {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
            && self.assistant.is_none()
            && self.open_call.is_none()
            && self.close_call.is_none()
    }

    /// Deltas planned for one row, if any.
    pub fn row(&self, period: &Period) -> Option<&RowWrite> {
        self.writes.iter().find(|w| &w.period == period)
    }
}

/// Result of applying a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOutcome {
    pub commit: CommitOutcome,
    /// Secondary writes that failed and were skipped
    pub secondary_failures: Vec<String>,
}

/// Collects the deltas of one row, dropping ones that would change nothing.
struct RowBuilder {
    template_id: String,
    period: Period,
    deltas: Vec<Delta>,
}

impl RowBuilder {
    fn new(template_id: &str, period: Period) -> Self {
        Self {
            template_id: template_id.to_string(),
            period,
            deltas: Vec::new(),
        }
    }

    fn push(&mut self, delta: Delta) -> &mut Self {
        if delta.is_effective() {
            self.deltas.push(delta);
        } else if let Delta::Counter { counter, amount } = &delta {
            if *amount < 0.0 || !amount.is_finite() {
                tracing::warn!(
                    template_id = %self.template_id,
                    counter = counter.column(),
                    amount = *amount,
                    "Ignoring non-monotonic counter delta"
                );
            }
        }
        self
    }

    fn build(self) -> Option<RowWrite> {
        (!self.deltas.is_empty()).then_some(RowWrite {
            template_id: self.template_id,
            period: self.period,
            deltas: self.deltas,
        })
    }
}

pub struct AggregationUpdater {
    store: Arc<dyn AggregateStore>,
    active_call_ttl: Duration,
}

impl AggregationUpdater {
    pub fn new(store: Arc<dyn AggregateStore>, active_call_ttl_secs: i64) -> Self {
        Self {
            store,
            active_call_ttl: Duration::seconds(active_call_ttl_secs.max(1)),
        }
    }

    pub fn store(&self) -> &Arc<dyn AggregateStore> {
        &self.store
    }

    /// Build the delta plan for one event.
    ///
    /// The effective quality score is the event's own `qualityScore`, falling
    /// back to the analysis; objectives are the union of both sources.
    pub fn plan(
        &self,
        event: &CallLifecycleEvent,
        analysis: Option<&ConversationAnalysis>,
    ) -> UpdatePlan {
        let template_id = event.template_id();
        let mut month = RowBuilder::new(template_id, Period::month_of(event.timestamp));
        let mut hour = RowBuilder::new(template_id, Period::hour_of(event.timestamp));
        let mut plan = UpdatePlan::default();

        match &event.event_type {
            EventType::CallStarted => {
                hour.push(Delta::increment(Counter::CallsStarted));
                plan.open_call = Some(ActiveCall {
                    call_id: event.call_id().to_string(),
                    template_id: template_id.to_string(),
                    started_at: event.timestamp,
                    expires_at: event.timestamp + self.active_call_ttl,
                });
            }
            EventType::CallEnded => {
                let outcome = event.is_success();
                let duration = event.duration.unwrap_or(0.0);

                for row in [&mut month, &mut hour] {
                    row.push(Delta::increment(Counter::TotalCalls))
                        .push(Delta::add(Counter::TotalDuration, duration));
                    match outcome {
                        Some(true) => {
                            row.push(Delta::increment(Counter::SuccessfulCalls));
                        }
                        Some(false) => {
                            row.push(Delta::increment(Counter::FailedCalls));
                        }
                        None => {}
                    }
                }

                if let Some(quality) = effective_quality(event, analysis) {
                    month
                        .push(Delta::add(Counter::QualityScoreSum, quality))
                        .push(Delta::increment(Counter::QualityScoreCount));
                }
                for tag in effective_objectives(event, analysis) {
                    month.push(Delta::bucket(Bucket::Objective(tag)));
                }
                if let Some(user_id) = &event.user_id {
                    month.push(Delta::set_add(SetField::UniqueUsers, user_id.as_str()));
                }

                if let Some(assistant_id) = &event.assistant_id {
                    plan.assistant = Some(AssistantWrite {
                        assistant_id: assistant_id.clone(),
                        update: AssistantUpdate {
                            total_calls: 1,
                            successful_calls: i64::from(outcome == Some(true)),
                            last_call_at: Some(event.timestamp),
                            performance_metrics: None,
                        },
                        primary: false,
                    });
                }
                plan.close_call = Some(event.call_id().to_string());
            }
            EventType::CallFailed => {
                for row in [&mut month, &mut hour] {
                    row.push(Delta::increment(Counter::TotalCalls))
                        .push(Delta::increment(Counter::FailedCalls));
                }
                if let Some(reason) = event.failure_reason() {
                    month.push(Delta::set_add(SetField::FailureReasons, reason));
                }
                plan.close_call = Some(event.call_id().to_string());
            }
            EventType::EscalationTriggered => {
                month.push(Delta::increment(Counter::EscalationsTriggered));
                if let Some(reason) = event.escalation_reason() {
                    month.push(Delta::set_add(SetField::EscalationReasons, reason));
                }
            }
            EventType::FunctionCall => {
                month.push(Delta::increment(Counter::FunctionCalls));
                if let Some(name) = event.function_name() {
                    month.push(Delta::set_add(SetField::FunctionsInvoked, name));
                }
            }
            EventType::TemplateUsed => {
                month.push(Delta::increment(Counter::TotalUsages));
                if let Some(user_id) = &event.user_id {
                    month.push(Delta::set_add(SetField::UniqueUsers, user_id.as_str()));
                }
            }
            EventType::TemplateViewed => {
                month.push(Delta::increment(Counter::TemplateViews));
            }
            EventType::TemplateRated => match event.rating() {
                Some(rating) => {
                    month
                        .push(Delta::increment(Counter::TotalRatings))
                        .push(Delta::add(Counter::RatingSum, f64::from(rating)))
                        .push(Delta::bucket(Bucket::Rating(rating)));
                }
                None => {
                    tracing::warn!(
                        template_id,
                        rating = ?event.metadata.get("rating"),
                        "Ignoring rating outside 1..=5"
                    );
                }
            },
            EventType::AssistantCreated => {
                month.push(Delta::increment(Counter::ActiveAssistants));
            }
            EventType::AssistantDeployed => {
                month.push(Delta::increment(Counter::DeployedAssistants));
            }
            EventType::AssistantPerformanceUpdate => {
                if let (Some(assistant_id), Some(metrics)) =
                    (&event.assistant_id, event.performance_metrics())
                {
                    plan.assistant = Some(AssistantWrite {
                        assistant_id: assistant_id.clone(),
                        update: AssistantUpdate {
                            performance_metrics: Some(metrics.clone()),
                            ..AssistantUpdate::default()
                        },
                        primary: true,
                    });
                }
            }
            EventType::Unknown(_) => {}
        }

        plan.writes.extend(month.build());
        plan.writes.extend(hour.build());
        plan
    }

    /// Apply a plan.
    ///
    /// The template rows and the idempotency claim commit first; a failure
    /// there is returned. The assistant row and the in-flight markers are
    /// applied afterwards and their failures are only recorded, unless the
    /// assistant write is the plan's primary fact.
    pub fn apply(&self, idempotency_key: Option<&str>, plan: &UpdatePlan) -> Result<ApplyOutcome> {
        let commit = if plan.writes.is_empty() && idempotency_key.is_none() {
            CommitOutcome::Applied
        } else {
            self.store.commit(idempotency_key, &plan.writes)?
        };

        let mut outcome = ApplyOutcome {
            commit,
            secondary_failures: Vec::new(),
        };
        if commit == CommitOutcome::Duplicate {
            return Ok(outcome);
        }

        if let Some(write) = &plan.assistant {
            match self.store.update_assistant(&write.assistant_id, &write.update) {
                Ok(()) => {}
                Err(e) if write.primary => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        assistant_id = %write.assistant_id,
                        error = %e,
                        "Assistant aggregate update failed, continuing"
                    );
                    outcome
                        .secondary_failures
                        .push(format!("assistant aggregate: {e}"));
                }
            }
        }

        if let Some(call) = &plan.open_call {
            if let Err(e) = self.store.open_call(call) {
                tracing::warn!(call_id = %call.call_id, error = %e, "Failed to open in-flight call marker");
                outcome.secondary_failures.push(format!("open call marker: {e}"));
            }
        }

        if let Some(call_id) = &plan.close_call {
            match self.store.close_call(call_id) {
                Ok(true) => {}
                Ok(false) => tracing::debug!(call_id = %call_id, "No in-flight marker to close"),
                Err(e) => {
                    tracing::warn!(call_id = %call_id, error = %e, "Failed to close in-flight call marker");
                    outcome.secondary_failures.push(format!("close call marker: {e}"));
                }
            }
        }

        Ok(outcome)
    }
}

/// Quality to fold into the month row.
pub fn effective_quality(
    event: &CallLifecycleEvent,
    analysis: Option<&ConversationAnalysis>,
) -> Option<f64> {
    event
        .quality_score
        .or_else(|| analysis.map(|a| a.call_quality_score))
}

/// Union of reported and detected objectives, in first-seen order.
pub fn effective_objectives(
    event: &CallLifecycleEvent,
    analysis: Option<&ConversationAnalysis>,
) -> Vec<String> {
    let detected = analysis.map(|a| a.objectives_achieved.as_slice()).unwrap_or_default();
    let mut tags: Vec<String> = Vec::new();
    for tag in event.objectives_achieved.iter().chain(detected) {
        let tag = tag.trim();
        if !tag.is_empty() && !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
    }
    tags
}
