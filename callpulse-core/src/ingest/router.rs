//! Event routing by declared type

use crate::types::EventType;

/// Processing routine an event is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Transcript analysis, deltas, quality and objective alerts
    CallEnded,
    /// Deltas, then the failure-rate read-back
    CallFailed,
    /// Deltas, then an unconditional alert
    Escalation,
    /// Deltas only
    Aggregate,
    /// Assistant-row snapshot only
    AssistantSnapshot,
    /// Unknown type: logged and dropped
    Ignore,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::CallEnded => "call_ended",
            Route::CallFailed => "call_failed",
            Route::Escalation => "escalation",
            Route::Aggregate => "aggregate",
            Route::AssistantSnapshot => "assistant_snapshot",
            Route::Ignore => "ignore",
        }
    }
}

pub fn route(event_type: &EventType) -> Route {
    match event_type {
        EventType::CallEnded => Route::CallEnded,
        EventType::CallFailed => Route::CallFailed,
        EventType::EscalationTriggered => Route::Escalation,
        EventType::CallStarted
        | EventType::FunctionCall
        | EventType::TemplateUsed
        | EventType::TemplateViewed
        | EventType::TemplateRated
        | EventType::AssistantCreated
        | EventType::AssistantDeployed => Route::Aggregate,
        EventType::AssistantPerformanceUpdate => Route::AssistantSnapshot,
        EventType::Unknown(_) => Route::Ignore,
    }
}
