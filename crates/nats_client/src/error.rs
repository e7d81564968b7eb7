//! Error types for the NATS client.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Broker unreachable after every retry attempt.
    #[error("failed to connect to NATS after {attempts} attempts: {reason}")]
    Connect { attempts: u32, reason: String },

    #[error("failed to provision stream '{stream}' after {attempts} attempts: {reason}")]
    Provision {
        stream: String,
        attempts: u32,
        reason: String,
    },

    #[error("failed to set up durable consumer '{durable}': {reason}")]
    Consumer { durable: String, reason: String },

    #[error("NATS error: {0}")]
    Nats(#[from] async_nats::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
