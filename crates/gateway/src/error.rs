//! Gateway error types.

use crate::events::EventType;
use std::path::PathBuf;
use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Contracts root does not exist.
    #[error("contracts path not found: {0}")]
    MissingContracts(PathBuf),

    /// A schema document has no `$id`.
    #[error("missing $id in schema: {0}")]
    MissingSchemaId(PathBuf),

    /// Two documents share an `$id` but differ in content.
    #[error("conflicting schema documents for $id '{id}': {first} and {second}")]
    ConflictingSchema {
        id: String,
        first: PathBuf,
        second: PathBuf,
    },

    /// A recognized event type has no schema document.
    #[error("no schema document for event type '{event}' (expected {path})")]
    MissingEventSchema { event: EventType, path: PathBuf },

    /// A schema document could not be read or parsed.
    #[error("failed to read schema {path}: {reason}")]
    SchemaParse { path: PathBuf, reason: String },

    /// An event schema failed to compile.
    #[error("invalid schema for event type '{event}': {reason}")]
    InvalidSchema { event: EventType, reason: String },

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Broker connection, provisioning or consumer setup failure.
    #[error(transparent)]
    Broker(#[from] nats_client::Error),

    /// Consumer used before the required lifecycle step.
    #[error("event consumer is {0}")]
    NotReady(&'static str),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
