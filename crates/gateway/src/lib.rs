//! Real-time clinical event gateway.
//!
//! This service:
//! - Consumes clinical and dispatch events from durable NATS JetStream consumers
//! - Validates every event against its JSON Schema contract
//! - Accepts WebSocket connections and manages per-patient or global subscriptions
//! - Routes validated events to subscribed clients through bounded per-client queues
//!
//! ## Architecture
//!
//! ```text
//! NATS JetStream: vitals.recorded, patient.alert.raised, dispatch.*
//!         ↓
//! EventConsumer (one durable consumer per event type)
//!         ↓
//! EventRouter → SchemaGate (fail-closed validation)
//!         ↓
//! SessionRegistry (DashMap, bounded outbox per session)
//!         ↓
//! WebSocket clients
//! ```
//!
//! ## Delivery
//!
//! - Pre-serialized messages for broadcast
//! - Drop-oldest queues so a slow client never blocks the broker loops
//! - Heartbeat eviction of clients that stop answering pings
//! - At-least-once from the broker, best-effort to clients

pub mod config;
pub mod consumer;
pub mod error;
pub mod events;
pub mod protocol;
pub mod router;
pub mod session;
pub mod subscription;
pub mod validation;
pub mod ws_server;

pub use config::GatewayConfig;
pub use consumer::{ConsumerConfig, ConsumerState, Delivery, EventConsumer, EventHandler};
pub use error::{GatewayError, Result};
pub use events::EventType;
pub use protocol::{ClientMessage, ServerMessage};
pub use router::EventRouter;
pub use session::{QueueLimits, Session, SessionId, SessionRegistry};
pub use validation::SchemaGate;
pub use ws_server::{create_router, run_heartbeat, AppState};
