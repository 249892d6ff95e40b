//! Core domain types for callpulse
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Call-lifecycle event** | A discrete fact about a call's progress, delivered at least once |
//! | **Template** | A reusable assistant configuration; aggregates are grouped by template |
//! | **Assistant** | A deployed voice assistant built from a template |
//! | **Artifact** | The voice provider's end-of-call payload (transcript, summary, sentiment) |
//! | **Analysis** | Signals derived from a transcript; folded into aggregates, never stored alone |

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================
// Event type
// ============================================

/// Declared type of a call-lifecycle event.
///
/// Unrecognized strings are preserved in [`EventType::Unknown`] so the router
/// can log and drop them instead of failing the delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    CallStarted,
    /// `call_ended`, also accepted as `call_completed`
    CallEnded,
    CallFailed,
    EscalationTriggered,
    FunctionCall,
    TemplateUsed,
    TemplateViewed,
    TemplateRated,
    AssistantCreated,
    AssistantDeployed,
    AssistantPerformanceUpdate,
    Unknown(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::CallStarted => "call_started",
            EventType::CallEnded => "call_ended",
            EventType::CallFailed => "call_failed",
            EventType::EscalationTriggered => "escalation_triggered",
            EventType::FunctionCall => "function_call",
            EventType::TemplateUsed => "template_used",
            EventType::TemplateViewed => "template_viewed",
            EventType::TemplateRated => "template_rated",
            EventType::AssistantCreated => "assistant_created",
            EventType::AssistantDeployed => "assistant_deployed",
            EventType::AssistantPerformanceUpdate => "assistant_performance_update",
            EventType::Unknown(other) => other,
        }
    }

    /// Events that happen at most once per call.
    ///
    /// Their idempotency key is `(call_id, event_type)`.
    pub fn is_once_per_call(&self) -> bool {
        matches!(
            self,
            EventType::CallStarted
                | EventType::CallEnded
                | EventType::CallFailed
                | EventType::EscalationTriggered
        )
    }

    /// Whether the event must carry a `callId`.
    pub fn requires_call_id(&self) -> bool {
        self.is_once_per_call() || matches!(self, EventType::FunctionCall)
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "call_started" => EventType::CallStarted,
            "call_ended" | "call_completed" => EventType::CallEnded,
            "call_failed" => EventType::CallFailed,
            "escalation_triggered" => EventType::EscalationTriggered,
            "function_call" => EventType::FunctionCall,
            "template_used" => EventType::TemplateUsed,
            "template_viewed" => EventType::TemplateViewed,
            "template_rated" => EventType::TemplateRated,
            "assistant_created" => EventType::AssistantCreated,
            "assistant_deployed" => EventType::AssistantDeployed,
            "assistant_performance_update" => EventType::AssistantPerformanceUpdate,
            _ => EventType::Unknown(s),
        }
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        match t {
            EventType::Unknown(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================
// Event
// ============================================

/// End-of-call artifact supplied by the voice provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallArtifact {
    pub transcript: Option<String>,
    pub summary: Option<String>,
    /// Provider-computed label ("positive", "neutral", "negative")
    pub sentiment: Option<String>,
    /// Provider-computed score in [-1, 1]
    pub sentiment_score: Option<f64>,
}

/// One call-lifecycle event: the unit of work of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallLifecycleEvent {
    pub event_type: EventType,
    /// Publisher-supplied idempotency id
    pub event_id: Option<String>,
    pub call_id: Option<String>,
    pub assistant_id: Option<String>,
    pub template_id: Option<String>,
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Call duration in seconds
    pub duration: Option<f64>,
    pub status: Option<String>,
    pub quality_score: Option<f64>,
    #[serde(default)]
    pub objectives_achieved: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub artifact: Option<CallArtifact>,
}

const SUCCESS_STATUSES: &[&str] = &["completed", "success", "successful", "answered"];

/// Bounds of the call quality scale.
pub const QUALITY_MIN: f64 = 1.0;
pub const QUALITY_MAX: f64 = 5.0;

impl CallLifecycleEvent {
    /// Parse and validate one raw event body.
    pub fn from_json(raw: &str) -> Result<Self> {
        let event: CallLifecycleEvent = serde_json::from_str(raw)
            .map_err(|e| Error::invalid_event("body", e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    /// Check the identifiers the event's type needs.
    ///
    /// Unknown event types only need a timestamp; they are dropped by the router.
    pub fn validate(&self) -> Result<()> {
        if let EventType::Unknown(name) = &self.event_type {
            if name.trim().is_empty() {
                return Err(Error::invalid_event("eventType", "must not be empty"));
            }
            return Ok(());
        }

        if self.event_type.requires_call_id() {
            require(&self.call_id, "callId")?;
        }
        match self.event_type {
            EventType::AssistantPerformanceUpdate => require(&self.assistant_id, "assistantId")?,
            _ => require(&self.template_id, "templateId")?,
        }
        if matches!(self.event_type, EventType::CallEnded) {
            require(&self.assistant_id, "assistantId")?;
        }

        if let Some(duration) = self.duration {
            if !duration.is_finite() || duration < 0.0 {
                return Err(Error::invalid_event(
                    "duration",
                    format!("must be a non-negative number of seconds, got {duration}"),
                ));
            }
        }
        if let Some(score) = self.quality_score {
            if !(QUALITY_MIN..=QUALITY_MAX).contains(&score) {
                return Err(Error::invalid_event(
                    "qualityScore",
                    format!("must be between {QUALITY_MIN} and {QUALITY_MAX}, got {score}"),
                ));
            }
        }
        Ok(())
    }

    pub fn call_id(&self) -> &str {
        self.call_id.as_deref().unwrap_or_default()
    }

    pub fn template_id(&self) -> &str {
        self.template_id.as_deref().unwrap_or_default()
    }

    /// Whether the status reports a successful call.
    pub fn is_success(&self) -> Option<bool> {
        self.status.as_deref().map(|status| {
            let status = status.trim().to_ascii_lowercase();
            SUCCESS_STATUSES.contains(&status.as_str())
        })
    }

    /// Transcript from the artifact, falling back to `metadata.transcript`.
    pub fn transcript(&self) -> Option<&str> {
        self.artifact
            .as_ref()
            .and_then(|a| a.transcript.as_deref())
            .or_else(|| self.metadata_str("transcript"))
            .filter(|t| !t.trim().is_empty())
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn metadata_f64(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(Value::as_f64)
    }

    /// First present metadata string among `keys`.
    fn first_metadata_str(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .find_map(|k| self.metadata_str(k))
            .filter(|s| !s.trim().is_empty())
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.first_metadata_str(&["failureReason", "endedReason", "reason"])
            .or(self.status.as_deref())
    }

    pub fn escalation_reason(&self) -> Option<&str> {
        self.first_metadata_str(&["escalationReason", "reason"])
    }

    pub fn function_name(&self) -> Option<&str> {
        self.first_metadata_str(&["functionName", "function"])
    }

    /// Template category hint carried on the event itself.
    pub fn template_category(&self) -> Option<&str> {
        self.first_metadata_str(&["templateCategory", "category"])
    }

    /// Rating in 1..=5, `None` for anything else.
    pub fn rating(&self) -> Option<u8> {
        let rating = self.metadata_f64("rating")?;
        if rating.fract() != 0.0 || !(1.0..=5.0).contains(&rating) {
            return None;
        }
        Some(rating as u8)
    }

    pub fn performance_metrics(&self) -> Option<&Map<String, Value>> {
        self.metadata
            .get("performanceMetrics")
            .and_then(Value::as_object)
    }
}

fn require(value: &Option<String>, field: &str) -> Result<()> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(()),
        _ => Err(Error::invalid_event(field, "is required")),
    }
}

// ============================================
// Analysis
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Neutral => "neutral",
            Sentiment::Negative => "negative",
        }
    }

    /// Label for a provider score: the sign decides.
    pub fn from_score(score: f64) -> Self {
        if score > 0.0 {
            Sentiment::Positive
        } else if score < 0.0 {
            Sentiment::Negative
        } else {
            Sentiment::Neutral
        }
    }
}

impl std::str::FromStr for Sentiment {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "positive" => Ok(Sentiment::Positive),
            "neutral" => Ok(Sentiment::Neutral),
            "negative" => Ok(Sentiment::Negative),
            other => Err(format!("unknown sentiment: {}", other)),
        }
    }
}

/// Signals derived from one call transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationAnalysis {
    pub sentiment: Sentiment,
    /// In [-1.0, 1.0]
    pub sentiment_score: f64,
    pub objectives_achieved: Vec<String>,
    /// In [0, 100]
    pub lead_score: u32,
    pub keywords_mentioned: Vec<String>,
    /// In [1.0, 5.0]
    pub call_quality_score: f64,
    pub escalation_triggered: bool,
    pub next_steps: Vec<String>,
}

/// Directory entry for an assistant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantProfile {
    pub assistant_id: String,
    pub template_id: String,
    pub user_id: Option<String>,
    /// Template category, e.g. `lead_qualification`
    pub category: Option<String>,
}
