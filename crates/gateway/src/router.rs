//! Event router: JetStream → WebSocket fan-out.
//!
//! Validates each delivered event against its contract and routes the
//! survivors to subscribed sessions.

use crate::consumer::EventHandler;
use crate::error::Result;
use crate::events::EventType;
use crate::session::SessionRegistry;
use crate::validation::SchemaGate;
use async_trait::async_trait;
use metrics::counter;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Routes validated events to WebSocket sessions.
pub struct EventRouter {
    gate: Arc<SchemaGate>,
    registry: Arc<SessionRegistry>,
}

impl EventRouter {
    pub fn new(gate: Arc<SchemaGate>, registry: Arc<SessionRegistry>) -> Self {
        Self { gate, registry }
    }

    /// Validate and broadcast one event. Returns the number of sessions reached.
    ///
    /// Invalid events are dropped here; redelivering them would not help.
    pub fn route(&self, event_type: EventType, event: Value) -> usize {
        if !self.gate.validate(event_type.as_str(), &event) {
            counter!("gateway_events_invalid_total").increment(1);
            return 0;
        }

        let delivered = self.registry.broadcast(event_type, event);
        if delivered > 0 {
            counter!("gateway_events_routed_total").increment(1);
            debug!(event = %event_type, sessions = delivered, "Routed event");
        }
        delivered
    }
}

#[async_trait]
impl EventHandler for EventRouter {
    async fn on_event(&self, event_type: EventType, event: Value) -> Result<()> {
        self.route(event_type, event);
        Ok(())
    }
}
