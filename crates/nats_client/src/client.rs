//! NATS client implementation with JetStream support.

use crate::error::{Error, Result};
use crate::retry::{retry_with_backoff, RetryPolicy};
use async_nats::connection::State;
use async_nats::jetstream::{self, consumer::pull, consumer::PullConsumer};
use async_nats::{Client, ConnectOptions, Event};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default retention period for streams (7 days).
pub const DEFAULT_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;

/// Default max messages per stream.
pub const DEFAULT_MAX_MESSAGES: i64 = 1_000_000;

/// Default max bytes per stream (1GB).
pub const DEFAULT_MAX_BYTES: i64 = 1_073_741_824;

/// Configuration for creating a stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Stream name.
    pub name: String,
    /// Subjects captured by the stream.
    pub subjects: Vec<String>,
    /// Retention period in seconds.
    pub max_age_secs: u64,
    /// Maximum number of messages.
    pub max_messages: i64,
    /// Maximum bytes.
    pub max_bytes: i64,
}

impl StreamConfig {
    /// Limits-retention stream capturing exactly `subjects`.
    pub fn for_subjects<I, S>(name: impl Into<String>, subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            subjects: subjects.into_iter().map(Into::into).collect(),
            max_age_secs: DEFAULT_RETENTION_SECS,
            max_messages: DEFAULT_MAX_MESSAGES,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }

    fn to_jetstream(&self) -> jetstream::stream::Config {
        jetstream::stream::Config {
            name: self.name.clone(),
            subjects: self.subjects.clone(),
            retention: jetstream::stream::RetentionPolicy::Limits,
            num_replicas: 1,
            max_messages: self.max_messages,
            max_bytes: self.max_bytes,
            max_age: Duration::from_secs(self.max_age_secs),
            storage: jetstream::stream::StorageType::File,
            ..Default::default()
        }
    }
}

/// Retry policy for stream creation, which can race with another instance
/// provisioning the same stream.
#[derive(Debug, Clone)]
pub struct ProvisionPolicy {
    pub attempts: u32,
    /// Multiplied by the attempt number (linear backoff).
    pub backoff: Duration,
}

impl Default for ProvisionPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

/// Outcome of [`NatsClient::ensure_stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    Existing,
    Created,
}

/// Durable consumer name for a subject: `<base>-<subject with dots as dashes>`.
///
/// Stable across restarts so the gateway reattaches to the same position.
pub fn durable_name(base: &str, subject: &str) -> String {
    format!("{}-{}", base, subject.replace('.', "-"))
}

/// Wrapper around the NATS client with JetStream context.
#[derive(Clone)]
pub struct NatsClient {
    client: Client,
    jetstream: jetstream::Context,
}

impl NatsClient {
    /// Connect to a NATS server, retrying per `policy`.
    ///
    /// Connection events are logged only; they never feed back into caller state.
    pub async fn connect_with_retry(url: &str, name: &str, policy: &RetryPolicy) -> Result<Self> {
        info!("Connecting to NATS at {}", url);

        let client = retry_with_backoff(policy, "NATS connect", |attempt| {
            debug!(attempt, "Opening NATS connection");
            ConnectOptions::new()
                .name(name)
                .connection_timeout(policy.attempt_timeout)
                .event_callback(|event| async move { log_connection_event(event) })
                .connect(url)
        })
        .await?;

        let jetstream = jetstream::new(client.clone());
        info!("Connected to NATS JetStream");
        Ok(Self { client, jetstream })
    }

    /// Whether the underlying connection is currently up.
    pub fn is_connected(&self) -> bool {
        matches!(self.client.connection_state(), State::Connected)
    }

    /// Create the stream if it does not exist yet.
    ///
    /// Existence is re-checked before every create attempt so that losing a
    /// creation race to another instance still counts as success.
    pub async fn ensure_stream(
        &self,
        config: &StreamConfig,
        policy: &ProvisionPolicy,
    ) -> Result<Provisioned> {
        let attempts = policy.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if self.jetstream.get_stream(&config.name).await.is_ok() {
                info!(stream = %config.name, "Stream already exists");
                return Ok(Provisioned::Existing);
            }

            info!(
                stream = %config.name,
                subjects = ?config.subjects,
                attempt,
                "Creating stream"
            );
            match self.jetstream.create_stream(config.to_jetstream()).await {
                Ok(_) => {
                    info!(stream = %config.name, "Stream created");
                    return Ok(Provisioned::Created);
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(stream = %config.name, attempt, error = %e, "Stream creation failed");
                    if attempt < attempts {
                        tokio::time::sleep(policy.backoff * attempt).await;
                    }
                }
            }
        }

        Err(Error::Provision {
            stream: config.name.clone(),
            attempts,
            reason: last_error,
        })
    }

    /// Get or create a durable pull consumer that only sees messages
    /// published from now on and requires explicit acks.
    pub async fn durable_consumer(
        &self,
        stream: &str,
        durable: &str,
        subject: &str,
        ack_wait: Duration,
    ) -> Result<PullConsumer> {
        let consumer_error = |reason: String| Error::Consumer {
            durable: durable.to_string(),
            reason,
        };

        let stream = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(|e| consumer_error(e.to_string()))?;

        let consumer = stream
            .get_or_create_consumer(
                durable,
                pull::Config {
                    durable_name: Some(durable.to_string()),
                    filter_subject: subject.to_string(),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    deliver_policy: jetstream::consumer::DeliverPolicy::New,
                    ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| consumer_error(e.to_string()))?;

        info!(durable, subject, "Durable consumer ready");
        Ok(consumer)
    }

    /// Flush pending outbound data before the connection is dropped.
    pub async fn flush(&self) -> Result<()> {
        self.client.flush().await.map_err(|e| Error::Nats(e.into()))
    }
}

fn log_connection_event(event: Event) {
    match event {
        Event::Connected => info!("NATS status: connected"),
        Event::Disconnected => warn!("NATS status: disconnected"),
        other => info!(status = ?other, "NATS status"),
    }
}
