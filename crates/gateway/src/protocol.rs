//! WebSocket protocol message types.
//!
//! Defines the JSON message format for client-server communication.

use crate::events::EventType;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message text of the throttled overflow notice.
pub const OVERFLOW_NOTICE: &str = "client queue overflow, dropping messages";

/// Greeting carried by the `connected` envelope.
pub const CONNECTED_MESSAGE: &str = "Connected to real-time event gateway";

// ============================================================================
// Client → Server Messages
// ============================================================================

/// Message sent from client to server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Add event types to the subscription for one scope.
    Subscribe(SubscriptionRequest),
    /// Remove event types from the subscription for one scope.
    Unsubscribe(SubscriptionRequest),
    /// Application-level keepalive.
    Ping,
    /// Any other `type`.
    #[serde(other)]
    Unknown,
}

/// Body of a subscribe/unsubscribe request.
///
/// Both fields stay untyped so that a missing, ill-typed or partially
/// unrecognized value gets a precise error instead of a parse failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionRequest {
    /// `null` (or absent) means the global scope.
    #[serde(default)]
    pub patient_id: Option<Value>,
    #[serde(default)]
    pub events: Option<Value>,
}

// ============================================================================
// Server → Client Messages
// ============================================================================

/// Message sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message on every connection.
    Connected { session_id: String, message: String },
    /// Confirmation of subscription.
    Subscribed {
        patient_id: Option<String>,
        events: Vec<EventType>,
    },
    /// Confirmation of unsubscription.
    Unsubscribed {
        patient_id: Option<String>,
        events: Vec<EventType>,
    },
    /// A validated event, forwarded unchanged in `data`.
    Event {
        event_name: String,
        data: Value,
        received_at: String,
    },
    /// Out-of-band information such as dropped messages.
    Notice { message: String },
    /// Rejected client request.
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        invalid: Option<Vec<String>>,
    },
    /// Pong response to ping.
    Pong { received_at: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            invalid: None,
        }
    }

    pub fn pong() -> Self {
        ServerMessage::Pong {
            received_at: now_rfc3339(),
        }
    }

    pub fn overflow_notice() -> Self {
        ServerMessage::Notice {
            message: OVERFLOW_NOTICE.to_string(),
        }
    }
}

/// Current time as RFC 3339 with millisecond precision.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_subscribe() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"subscribe","patient_id":null,"events":["dispatch.created"]}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::Subscribe(req) => {
                assert!(req.patient_id.is_none());
                assert_eq!(req.events, Some(json!(["dispatch.created"])));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_missing_fields_default() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"unsubscribe"}"#).unwrap();
        match msg {
            ClientMessage::Unsubscribe(req) => {
                assert!(req.patient_id.is_none());
                assert!(req.events.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_ping_and_unknown() {
        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(ping, ClientMessage::Ping));

        let other: ClientMessage = serde_json::from_str(r#"{"type":"replay"}"#).unwrap();
        assert!(matches!(other, ClientMessage::Unknown));
    }

    #[test]
    fn test_serialize_envelopes() {
        let subscribed = ServerMessage::Subscribed {
            patient_id: None,
            events: vec![EventType::DispatchCreated],
        };
        assert_eq!(
            serde_json::to_value(&subscribed).unwrap(),
            json!({ "type": "subscribed", "patient_id": null, "events": ["dispatch.created"] })
        );

        let error = ServerMessage::error("events is required");
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({ "type": "error", "message": "events is required" })
        );

        let notice = serde_json::to_value(ServerMessage::overflow_notice()).unwrap();
        assert_eq!(notice["type"], "notice");
        assert_eq!(notice["message"], OVERFLOW_NOTICE);
    }

    #[test]
    fn test_pong_has_timestamp() {
        let pong = serde_json::to_value(ServerMessage::pong()).unwrap();
        assert_eq!(pong["type"], "pong");
        assert!(chrono::DateTime::parse_from_rfc3339(pong["received_at"].as_str().unwrap()).is_ok());
    }
}
