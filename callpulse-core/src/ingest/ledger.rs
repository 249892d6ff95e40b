//! Idempotency keys for the processed-events ledger

use crate::error::Result;
use crate::types::{CallLifecycleEvent, EventType};
use sha2::{Digest, Sha256};

/// Key under which an event is claimed in `processed_events`.
///
/// Once-per-call events are keyed by call and type, so a redelivery with a
/// different publisher id is still a duplicate. Other events use the
/// publisher's `eventId`, falling back to a digest of the event's content.
/// Performance snapshots overwrite rather than accumulate and get no key.
pub fn idempotency_key(event: &CallLifecycleEvent) -> Result<Option<String>> {
    match &event.event_type {
        EventType::AssistantPerformanceUpdate | EventType::Unknown(_) => return Ok(None),
        t if t.is_once_per_call() => {
            return Ok(Some(format!("call:{}:{}", event.call_id(), t)));
        }
        _ => {}
    }

    if let Some(event_id) = event.event_id.as_deref().filter(|id| !id.trim().is_empty()) {
        return Ok(Some(format!("event:{}", event_id)));
    }

    Ok(Some(format!("sha256:{}", content_digest(event)?)))
}

/// SHA-256 of the event's canonical JSON form.
///
/// Metadata maps serialize with sorted keys, so two deliveries of the same
/// event digest identically regardless of the publisher's key order.
pub fn content_digest(event: &CallLifecycleEvent) -> Result<String> {
    let canonical = serde_json::to_vec(event)?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(raw: &str) -> CallLifecycleEvent {
        CallLifecycleEvent::from_json(raw).unwrap()
    }

    #[test]
    fn test_once_per_call_key_ignores_event_id() {
        let ev = event(
            r#"{"eventType":"call_failed","eventId":"evt-9","callId":"c1","templateId":"t",
                "timestamp":"2024-03-15T14:30:00Z"}"#,
        );
        assert_eq!(idempotency_key(&ev).unwrap().as_deref(), Some("call:c1:call_failed"));
    }

    #[test]
    fn test_call_completed_alias_shares_key() {
        let ended = event(
            r#"{"eventType":"call_ended","callId":"c1","assistantId":"a","templateId":"t",
                "timestamp":"2024-03-15T14:30:00Z"}"#,
        );
        let completed = event(
            r#"{"eventType":"call_completed","callId":"c1","assistantId":"a","templateId":"t",
                "timestamp":"2024-03-15T14:31:00Z"}"#,
        );
        assert_eq!(idempotency_key(&ended).unwrap(), idempotency_key(&completed).unwrap());
    }

    #[test]
    fn test_event_id_key() {
        let ev = event(
            r#"{"eventType":"template_viewed","eventId":"evt-1","templateId":"t",
                "timestamp":"2024-03-15T14:30:00Z"}"#,
        );
        assert_eq!(idempotency_key(&ev).unwrap().as_deref(), Some("event:evt-1"));
    }

    #[test]
    fn test_digest_ignores_metadata_key_order() {
        let a = event(
            r#"{"eventType":"template_used","templateId":"t","timestamp":"2024-03-15T14:30:00Z",
                "metadata":{"a":1,"b":2}}"#,
        );
        let b = event(
            r#"{"metadata":{"b":2,"a":1},"timestamp":"2024-03-15T14:30:00Z",
                "templateId":"t","eventType":"template_used"}"#,
        );
        let c = event(
            r#"{"eventType":"template_used","templateId":"t","timestamp":"2024-03-15T14:30:01Z"}"#,
        );

        let key = idempotency_key(&a).unwrap().unwrap();
        assert!(key.starts_with("sha256:"));
        assert_eq!(key.len(), "sha256:".len() + 64);
        assert_eq!(Some(key.clone()), idempotency_key(&b).unwrap());
        assert_ne!(Some(key), idempotency_key(&c).unwrap());
    }

    #[test]
    fn test_performance_update_has_no_key() {
        let ev = event(
            r#"{"eventType":"assistant_performance_update","assistantId":"a",
                "timestamp":"2024-03-15T14:30:00Z"}"#,
        );
        assert_eq!(idempotency_key(&ev).unwrap(), None);
    }
}
