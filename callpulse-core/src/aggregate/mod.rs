//! Aggregate rows and the typed delta operations that build them
//!
//! Every mutation of a [`TemplateAggregate`] is expressed as a [`Delta`]: a
//! counter increment, a bucket increment or a set insertion. Deltas never
//! carry computed totals, so any two of them commute and concurrent writers
//! cannot lose each other's updates. The store applies them through
//! [`AggregateStore::commit`].
//!
//! ```text
//! CallLifecycleEvent ──► AggregationUpdater::plan ──► UpdatePlan
//!                                                      ├─ RowWrite (template, month)
//!                                                      ├─ RowWrite (template, date+hour)
//!                                                      └─ AssistantUpdate (best-effort)
//! ```

pub mod updater;

pub use updater::{AggregationUpdater, UpdatePlan};

use crate::error::{Error, Result};
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

// ============================================
// Periods
// ============================================

/// Time bucket of a template aggregate row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Period {
    /// Calendar month, key `2024-03`
    Month { year: i32, month: u32 },
    /// Hour of a day for capacity planning, key `2024-03-15T14`
    Hour { date: NaiveDate, hour: u32 },
}

impl Period {
    pub fn month_of(ts: DateTime<Utc>) -> Self {
        Period::Month {
            year: ts.year(),
            month: ts.month(),
        }
    }

    pub fn hour_of(ts: DateTime<Utc>) -> Self {
        Period::Hour {
            date: ts.date_naive(),
            hour: ts.hour(),
        }
    }

    pub fn key(&self) -> String {
        match self {
            Period::Month { year, month } => format!("{:04}-{:02}", year, month),
            Period::Hour { date, hour } => format!("{}T{:02}", date.format("%Y-%m-%d"), hour),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Period::Month { .. } => "month",
            Period::Hour { .. } => "hour",
        }
    }

    /// Parse a key produced by [`Period::key`].
    pub fn parse(key: &str) -> Result<Self> {
        let invalid = || Error::Config(format!("invalid period key: {key}"));

        if let Some((date, hour)) = key.split_once('T') {
            let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| invalid())?;
            let hour: u32 = hour.parse().map_err(|_| invalid())?;
            if hour > 23 {
                return Err(invalid());
            }
            return Ok(Period::Hour { date, hour });
        }

        let (year, month) = key.split_once('-').ok_or_else(invalid)?;
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u32 = month.parse().map_err(|_| invalid())?;
        if !(1..=12).contains(&month) {
            return Err(invalid());
        }
        Ok(Period::Month { year, month })
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

// ============================================
// Delta operations
// ============================================

/// Monotonic numeric fields of a template aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    TotalCalls,
    SuccessfulCalls,
    FailedCalls,
    EscalationsTriggered,
    /// Seconds
    TotalDuration,
    QualityScoreSum,
    QualityScoreCount,
    TotalUsages,
    TemplateViews,
    TotalRatings,
    RatingSum,
    ActiveAssistants,
    DeployedAssistants,
    CallsStarted,
    FunctionCalls,
}

impl Counter {
    pub const ALL: [Counter; 15] = [
        Counter::TotalCalls,
        Counter::SuccessfulCalls,
        Counter::FailedCalls,
        Counter::EscalationsTriggered,
        Counter::TotalDuration,
        Counter::QualityScoreSum,
        Counter::QualityScoreCount,
        Counter::TotalUsages,
        Counter::TemplateViews,
        Counter::TotalRatings,
        Counter::RatingSum,
        Counter::ActiveAssistants,
        Counter::DeployedAssistants,
        Counter::CallsStarted,
        Counter::FunctionCalls,
    ];

    /// Column name in `template_aggregates`.
    pub fn column(&self) -> &'static str {
        match self {
            Counter::TotalCalls => "total_calls",
            Counter::SuccessfulCalls => "successful_calls",
            Counter::FailedCalls => "failed_calls",
            Counter::EscalationsTriggered => "escalations_triggered",
            Counter::TotalDuration => "total_duration",
            Counter::QualityScoreSum => "quality_score_sum",
            Counter::QualityScoreCount => "quality_score_count",
            Counter::TotalUsages => "total_usages",
            Counter::TemplateViews => "template_views",
            Counter::TotalRatings => "total_ratings",
            Counter::RatingSum => "rating_sum",
            Counter::ActiveAssistants => "active_assistants",
            Counter::DeployedAssistants => "deployed_assistants",
            Counter::CallsStarted => "calls_started",
            Counter::FunctionCalls => "function_calls",
        }
    }

    /// Counters stored as REAL rather than INTEGER.
    pub fn is_fractional(&self) -> bool {
        matches!(self, Counter::TotalDuration | Counter::QualityScoreSum)
    }
}

/// Keyed counters inside a row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Bucket {
    /// Rating distribution slot for a 1..=5 rating (stored at index `rating - 1`)
    Rating(u8),
    /// Per-objective-tag counter
    Objective(String),
}

impl Bucket {
    pub fn kind(&self) -> &'static str {
        match self {
            Bucket::Rating(_) => "rating",
            Bucket::Objective(_) => "objective",
        }
    }

    pub fn key(&self) -> String {
        match self {
            Bucket::Rating(rating) => rating.to_string(),
            Bucket::Objective(tag) => tag.clone(),
        }
    }
}

/// Denormalized string sets of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetField {
    UniqueUsers,
    FailureReasons,
    EscalationReasons,
    FunctionsInvoked,
}

impl SetField {
    pub fn name(&self) -> &'static str {
        match self {
            SetField::UniqueUsers => "unique_users",
            SetField::FailureReasons => "failure_reasons",
            SetField::EscalationReasons => "escalation_reasons",
            SetField::FunctionsInvoked => "functions_invoked",
        }
    }
}

/// One commutative mutation of a template aggregate row.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Counter { counter: Counter, amount: f64 },
    Bucket { bucket: Bucket, amount: i64 },
    SetAdd { set: SetField, member: String },
    SetUnion { set: SetField, members: Vec<String> },
}

impl Delta {
    pub fn increment(counter: Counter) -> Self {
        Delta::Counter {
            counter,
            amount: 1.0,
        }
    }

    pub fn add(counter: Counter, amount: f64) -> Self {
        Delta::Counter { counter, amount }
    }

    pub fn bucket(bucket: Bucket) -> Self {
        Delta::Bucket { bucket, amount: 1 }
    }

    pub fn set_add(set: SetField, member: impl Into<String>) -> Self {
        Delta::SetAdd {
            set,
            member: member.into(),
        }
    }

    pub fn set_union(set: SetField, members: Vec<String>) -> Self {
        Delta::SetUnion { set, members }
    }

    /// Whether applying the delta would change anything.
    ///
    /// Zero, negative and non-finite amounts are never applied, which keeps
    /// every counter monotonic.
    pub fn is_effective(&self) -> bool {
        match self {
            Delta::Counter { amount, .. } => amount.is_finite() && *amount > 0.0,
            Delta::Bucket { amount, .. } => *amount > 0,
            Delta::SetAdd { member, .. } => !member.trim().is_empty(),
            Delta::SetUnion { members, .. } => members.iter().any(|m| !m.trim().is_empty()),
        }
    }
}

/// Deltas for one (template, period) row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowWrite {
    pub template_id: String,
    pub period: Period,
    pub deltas: Vec<Delta>,
}

// ============================================
// Rows
// ============================================

/// Accumulated statistics for one template in one period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateAggregate {
    pub template_id: String,
    pub period: String,
    pub total_calls: i64,
    pub successful_calls: i64,
    pub failed_calls: i64,
    pub escalations_triggered: i64,
    pub total_duration: f64,
    pub quality_score_sum: f64,
    pub quality_score_count: i64,
    pub total_usages: i64,
    pub template_views: i64,
    pub total_ratings: i64,
    pub rating_sum: i64,
    pub active_assistants: i64,
    pub deployed_assistants: i64,
    pub calls_started: i64,
    pub function_calls: i64,
    /// Index `i` counts ratings of `i + 1`
    pub rating_distribution: [i64; 5],
    pub objective_counts: BTreeMap<String, i64>,
    pub unique_users: BTreeSet<String>,
    pub failure_reasons: BTreeSet<String>,
    pub escalation_reasons: BTreeSet<String>,
    pub functions_invoked: BTreeSet<String>,
    pub computed_at: DateTime<Utc>,
}

impl TemplateAggregate {
    /// `failed / total`, `None` before the first call.
    pub fn failure_rate(&self) -> Option<f64> {
        ratio(self.failed_calls as f64, self.total_calls)
    }

    pub fn success_rate(&self) -> Option<f64> {
        ratio(self.successful_calls as f64, self.total_calls)
    }

    pub fn average_duration(&self) -> Option<f64> {
        ratio(self.total_duration, self.total_calls)
    }

    pub fn average_quality(&self) -> Option<f64> {
        ratio(self.quality_score_sum, self.quality_score_count)
    }

    pub fn average_rating(&self) -> Option<f64> {
        ratio(self.rating_sum as f64, self.total_ratings)
    }
}

fn ratio(numerator: f64, denominator: i64) -> Option<f64> {
    (denominator > 0).then(|| numerator / denominator as f64)
}

/// Per-assistant running totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssistantAggregate {
    pub assistant_id: String,
    pub total_calls: i64,
    pub successful_calls: i64,
    /// Last write wins
    pub last_call_at: Option<DateTime<Utc>>,
    /// Last supplied snapshot
    pub performance_metrics: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

/// Best-effort write to an [`AssistantAggregate`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssistantUpdate {
    pub total_calls: i64,
    pub successful_calls: i64,
    pub last_call_at: Option<DateTime<Utc>>,
    pub performance_metrics: Option<Map<String, Value>>,
}

impl AssistantUpdate {
    pub fn is_empty(&self) -> bool {
        self.total_calls == 0
            && self.successful_calls == 0
            && self.last_call_at.is_none()
            && self.performance_metrics.is_none()
    }
}

/// In-flight call marker backing the concurrent-calls gauge.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveCall {
    pub call_id: String,
    pub template_id: String,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Result of a primary commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied,
    /// The idempotency key was already claimed; nothing was written
    Duplicate,
}

// ============================================
// Store trait
// ============================================

/// Key-value backend holding the aggregate rows.
///
/// Implementations must apply each [`Delta`] as an indivisible accumulation
/// so that concurrent commits against the same row always sum correctly.
pub trait AggregateStore: Send + Sync {
    /// Apply `writes` as one unit. When `idempotency_key` is given it is
    /// claimed first with a conditional insert; an existing claim turns the
    /// whole commit into [`CommitOutcome::Duplicate`].
    fn commit(&self, idempotency_key: Option<&str>, writes: &[RowWrite]) -> Result<CommitOutcome>;

    fn template_aggregate(
        &self,
        template_id: &str,
        period: &Period,
    ) -> Result<Option<TemplateAggregate>>;

    /// Accumulate totals and overwrite last-write-wins fields.
    fn update_assistant(&self, assistant_id: &str, update: &AssistantUpdate) -> Result<()>;

    fn assistant_aggregate(&self, assistant_id: &str) -> Result<Option<AssistantAggregate>>;

    /// Record an in-flight call. Re-opening an open call is a no-op.
    fn open_call(&self, call: &ActiveCall) -> Result<()>;

    /// Remove an in-flight marker, returning whether one existed.
    fn close_call(&self, call_id: &str) -> Result<bool>;

    /// Unexpired in-flight calls for a template at `at`.
    fn concurrent_calls(&self, template_id: &str, at: DateTime<Utc>) -> Result<i64>;
}
