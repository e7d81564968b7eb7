//! NATS JetStream plumbing for the realtime gateway.
//!
//! - Connection with bounded exponential-backoff retry
//! - Idempotent stream provisioning
//! - Durable, explicitly-acknowledged pull consumers

pub mod client;
pub mod error;
pub mod retry;

pub use client::{durable_name, NatsClient, ProvisionPolicy, Provisioned, StreamConfig};
pub use error::{Error, Result};
pub use retry::{retry_with_backoff, RetryPolicy};

/// Re-exported so callers can name consumer and message types without
/// depending on `async-nats` directly.
pub use async_nats::jetstream;
