//! Subscription scopes and client request validation.
//!
//! A subscription is keyed by scope: the global scope (dispatch-class events
//! only) or a single patient. Requests are checked in a fixed order and the
//! first failing rule produces the error sent back to the client.

use crate::events::EventType;
use crate::protocol::{ServerMessage, SubscriptionRequest};
use serde_json::Value;
use std::fmt;
use uuid::{Uuid, Variant};

/// Subscription key: `"global"` or `"patient:<id>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionKey {
    Global,
    Patient(String),
}

impl SubscriptionKey {
    pub fn new(patient_id: Option<&str>) -> Self {
        match patient_id {
            Some(id) => SubscriptionKey::Patient(id.to_string()),
            None => SubscriptionKey::Global,
        }
    }

    /// Whether an event of `event_type` carrying `event_patient` is
    /// deliverable under this scope.
    ///
    /// Global scope takes dispatch-class events only. Patient scope needs an
    /// equal patient id and never takes global-only events.
    pub fn admits(&self, event_type: EventType, event_patient: Option<&str>) -> bool {
        match self {
            SubscriptionKey::Global => event_type.is_dispatch(),
            SubscriptionKey::Patient(id) => {
                !event_type.is_global_only() && event_patient == Some(id.as_str())
            }
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionKey::Global => f.write_str("global"),
            SubscriptionKey::Patient(id) => write!(f, "patient:{}", id),
        }
    }
}

/// A rejected client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolViolation {
    pub message: String,
    /// Offending event names, when the rejection is about specific events.
    pub invalid: Option<Vec<String>>,
}

impl ProtocolViolation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            invalid: None,
        }
    }

    fn with_invalid(mut self, invalid: Vec<String>) -> Self {
        self.invalid = Some(invalid);
        self
    }
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<ProtocolViolation> for ServerMessage {
    fn from(v: ProtocolViolation) -> Self {
        ServerMessage::Error {
            message: v.message,
            invalid: v.invalid,
        }
    }
}

/// A request that passed every rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedRequest {
    pub patient_id: Option<String>,
    /// Recognized events, deduplicated, in request order.
    pub events: Vec<EventType>,
}

/// Check a subscribe/unsubscribe request.
///
/// Rules, in order: `events` present as a non-empty list; at least one
/// recognized event; `patient_id` null or a UUID; scope rules.
pub fn validate_request(request: SubscriptionRequest) -> Result<ScopedRequest, ProtocolViolation> {
    let requested = match request.events {
        Some(Value::Array(items)) if !items.is_empty() => items,
        _ => return Err(ProtocolViolation::new("events is required")),
    };

    let mut events: Vec<EventType> = Vec::with_capacity(requested.len());
    for name in requested.iter().filter_map(Value::as_str) {
        if let Ok(event) = name.parse::<EventType>() {
            if !events.contains(&event) {
                events.push(event);
            }
        }
    }
    if events.is_empty() {
        return Err(ProtocolViolation::new("No valid events requested"));
    }

    let patient_id = match request.patient_id {
        None => None,
        Some(Value::String(id)) if is_canonical_uuid(&id) => Some(id),
        Some(_) => return Err(ProtocolViolation::new("patient_id must be UUID or null")),
    };

    match patient_id.as_deref() {
        None => {
            let invalid: Vec<String> = events
                .iter()
                .filter(|e| !e.is_dispatch())
                .map(|e| e.as_str().to_string())
                .collect();
            if !invalid.is_empty() {
                return Err(ProtocolViolation::new(
                    "global subscriptions (patient_id=null) may only include dispatch.* events",
                )
                .with_invalid(invalid));
            }
        }
        Some(_) => {
            let global_only: Vec<String> = events
                .iter()
                .filter(|e| e.is_global_only())
                .map(|e| e.as_str().to_string())
                .collect();
            if !global_only.is_empty() {
                return Err(ProtocolViolation::new(
                    "dispatch.assigned is global only (no patient_id in current contract)",
                )
                .with_invalid(global_only));
            }
        }
    }

    Ok(ScopedRequest { patient_id, events })
}

/// Hyphenated UUID, version 1-5, RFC 4122 variant.
pub fn is_canonical_uuid(s: &str) -> bool {
    if s.len() != 36 {
        return false;
    }
    match Uuid::try_parse(s) {
        Ok(uuid) => {
            matches!(uuid.get_version_num(), 1..=5) && uuid.get_variant() == Variant::RFC4122
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PATIENT: &str = "550e8400-e29b-41d4-a716-446655440001";

    fn request(patient_id: Option<&str>, events: Value) -> SubscriptionRequest {
        SubscriptionRequest {
            patient_id: patient_id.map(|id| json!(id)),
            events: Some(events),
        }
    }

    #[test]
    fn test_key_display() {
        assert_eq!(SubscriptionKey::new(None).to_string(), "global");
        assert_eq!(
            SubscriptionKey::new(Some(PATIENT)).to_string(),
            format!("patient:{}", PATIENT)
        );
    }

    #[test]
    fn test_global_scope_admits_dispatch_only() {
        let global = SubscriptionKey::Global;
        assert!(global.admits(EventType::DispatchCreated, Some(PATIENT)));
        assert!(global.admits(EventType::DispatchAssigned, None));
        assert!(!global.admits(EventType::VitalsRecorded, Some(PATIENT)));
        assert!(!global.admits(EventType::PatientAlertRaised, None));
    }

    #[test]
    fn test_patient_scope_requires_match() {
        let scoped = SubscriptionKey::new(Some(PATIENT));
        assert!(scoped.admits(EventType::VitalsRecorded, Some(PATIENT)));
        assert!(scoped.admits(EventType::DispatchCreated, Some(PATIENT)));
        assert!(!scoped.admits(EventType::VitalsRecorded, Some("other")));
        assert!(!scoped.admits(EventType::VitalsRecorded, None));
        assert!(!scoped.admits(EventType::DispatchAssigned, Some(PATIENT)));
    }

    #[test]
    fn test_events_required() {
        let missing = SubscriptionRequest::default();
        assert_eq!(validate_request(missing).unwrap_err().message, "events is required");

        let not_list = request(None, json!("dispatch.created"));
        assert_eq!(validate_request(not_list).unwrap_err().message, "events is required");

        let empty = request(None, json!([]));
        assert_eq!(validate_request(empty).unwrap_err().message, "events is required");
    }

    #[test]
    fn test_unknown_events_filtered() {
        let none_valid = request(None, json!(["foo.bar", 7]));
        assert_eq!(
            validate_request(none_valid).unwrap_err().message,
            "No valid events requested"
        );

        let some_valid = request(None, json!(["foo.bar", "dispatch.created", "dispatch.created"]));
        assert_eq!(
            validate_request(some_valid).unwrap().events,
            vec![EventType::DispatchCreated]
        );
    }

    #[test]
    fn test_patient_id_format() {
        let bad = request(Some("patient-42"), json!(["vitals.recorded"]));
        assert_eq!(
            validate_request(bad).unwrap_err().message,
            "patient_id must be UUID or null"
        );

        // Event filtering is checked before the patient id.
        let bad_both = request(Some("patient-42"), json!(["nope"]));
        assert_eq!(
            validate_request(bad_both).unwrap_err().message,
            "No valid events requested"
        );
    }

    #[test]
    fn test_non_string_patient_id() {
        let numeric = SubscriptionRequest {
            patient_id: Some(json!(5)),
            events: Some(json!(["dispatch.created"])),
        };
        assert_eq!(
            validate_request(numeric).unwrap_err().message,
            "patient_id must be UUID or null"
        );

        // Events are still checked first.
        let numeric_no_events = SubscriptionRequest {
            patient_id: Some(json!(5)),
            events: None,
        };
        assert_eq!(
            validate_request(numeric_no_events).unwrap_err().message,
            "events is required"
        );
    }

    #[test]
    fn test_global_scope_rejects_clinical_events() {
        let req = request(None, json!(["vitals.recorded", "dispatch.created"]));
        let err = validate_request(req).unwrap_err();
        assert_eq!(err.invalid, Some(vec!["vitals.recorded".to_string()]));
    }

    #[test]
    fn test_patient_scope_rejects_assignment() {
        let req = request(Some(PATIENT), json!(["dispatch.assigned", "vitals.recorded"]));
        let err = validate_request(req).unwrap_err();
        assert!(err.message.contains("dispatch.assigned"));
    }

    #[test]
    fn test_valid_patient_request() {
        let req = request(Some(PATIENT), json!(["vitals.recorded", "patient.alert.raised"]));
        let ok = validate_request(req).unwrap();
        assert_eq!(ok.patient_id.as_deref(), Some(PATIENT));
        assert_eq!(
            ok.events,
            vec![EventType::VitalsRecorded, EventType::PatientAlertRaised]
        );
    }

    #[test]
    fn test_canonical_uuid() {
        assert!(is_canonical_uuid(PATIENT));
        assert!(is_canonical_uuid("550E8400-E29B-41D4-A716-446655440001"));
        // Simple form, wrong variant, version 0.
        assert!(!is_canonical_uuid("550e8400e29b41d4a716446655440001"));
        assert!(!is_canonical_uuid("550e8400-e29b-41d4-c716-446655440001"));
        assert!(!is_canonical_uuid("550e8400-e29b-01d4-a716-446655440001"));
        assert!(!is_canonical_uuid("{550e8400-e29b-41d4-a716-4466554400}"));
    }
}
