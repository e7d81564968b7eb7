//! Closed catalogue of recognized event types.
//!
//! Every per-type property (wire name, schema document, family, patient id
//! location) is an exhaustive `match`, so a new variant does not compile
//! until all of them are declared.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Recognized event types. The wire name doubles as the NATS subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "vitals.recorded")]
    VitalsRecorded,
    #[serde(rename = "patient.alert.raised")]
    PatientAlertRaised,
    #[serde(rename = "dispatch.created")]
    DispatchCreated,
    #[serde(rename = "dispatch.assigned")]
    DispatchAssigned,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::VitalsRecorded,
        EventType::PatientAlertRaised,
        EventType::DispatchCreated,
        EventType::DispatchAssigned,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::VitalsRecorded => "vitals.recorded",
            EventType::PatientAlertRaised => "patient.alert.raised",
            EventType::DispatchCreated => "dispatch.created",
            EventType::DispatchAssigned => "dispatch.assigned",
        }
    }

    /// Schema document path, relative to the contracts root.
    pub fn schema_path(self) -> &'static str {
        match self {
            EventType::VitalsRecorded => "events/vitals-recorded.json",
            EventType::PatientAlertRaised => "events/patient-alert-raised.json",
            EventType::DispatchCreated => "events/dispatch-created.json",
            EventType::DispatchAssigned => "events/dispatch-assigned.json",
        }
    }

    /// Dispatch-class events are the only ones allowed on global subscriptions.
    pub fn is_dispatch(self) -> bool {
        match self {
            EventType::DispatchCreated | EventType::DispatchAssigned => true,
            EventType::VitalsRecorded | EventType::PatientAlertRaised => false,
        }
    }

    /// Events that carry no patient id and can never be patient-scoped.
    pub fn is_global_only(self) -> bool {
        self.patient_id_path().is_none()
    }

    /// Location of the patient id within the event.
    fn patient_id_path(self) -> Option<&'static [&'static str]> {
        let path: &'static [&'static str] = match self {
            EventType::VitalsRecorded => &["payload", "patient_id"],
            EventType::PatientAlertRaised => &["payload", "alert", "patient_id"],
            EventType::DispatchCreated => &["payload", "dispatch", "patient_id"],
            EventType::DispatchAssigned => return None,
        };
        Some(path)
    }

    /// Extract the patient id carried by `event`, if this type defines one.
    pub fn patient_id(self, event: &Value) -> Option<&str> {
        self.patient_id_path()?
            .iter()
            .try_fold(event, |node, key| node.get(key))
            .and_then(Value::as_str)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}

/// Name outside the recognized set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownEventType(pub String);

impl fmt::Display for UnknownEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event type: {}", self.0)
    }
}

impl std::error::Error for UnknownEventType {}
