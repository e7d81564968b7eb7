//! Durable JetStream consumption.
//!
//! One durable pull consumer per event type, each drained by its own task.
//! Every delivery is handed to an [`EventHandler`] and then acked or naked
//! based on the outcome.

use crate::error::{GatewayError, Result};
use crate::events::EventType;
use async_trait::async_trait;
use futures::StreamExt;
use metrics::counter;
use nats_client::jetstream::consumer::{pull, PullConsumer};
use nats_client::jetstream::{AckKind, Message};
use nats_client::{durable_name, NatsClient, ProvisionPolicy, RetryPolicy, StreamConfig};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// First delay before reopening a failed message stream.
const RESTART_BASE_DELAY: Duration = Duration::from_millis(500);

/// Upper bound on the reopen delay.
const RESTART_MAX_DELAY: Duration = Duration::from_secs(30);

/// Receives every delivered event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// An error leaves the message unacknowledged for redelivery.
    async fn on_event(&self, event_type: EventType, event: Value) -> Result<()>;
}

/// Acknowledgement decision for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Ack,
    Nak,
}

/// Consumer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConsumerState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Provisioned = 3,
    Consuming = 4,
}

impl ConsumerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConsumerState::Connecting,
            2 => ConsumerState::Connected,
            3 => ConsumerState::Provisioned,
            4 => ConsumerState::Consuming,
            _ => ConsumerState::Disconnected,
        }
    }
}

/// Broker settings for the consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub nats_url: String,
    /// Connection name reported to the server.
    pub client_name: String,
    pub stream: String,
    /// Prefix of every durable consumer name.
    pub durable_base: String,
    pub ack_wait: Duration,
    pub connect: RetryPolicy,
    pub provision: ProvisionPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            nats_url: "nats://localhost:4222".to_string(),
            client_name: "realtime-gateway".to_string(),
            stream: "events".to_string(),
            durable_base: "realtime-gateway".to_string(),
            ack_wait: Duration::from_secs(30),
            connect: RetryPolicy::default(),
            provision: ProvisionPolicy::default(),
        }
    }
}

/// Owns the broker connection and the per-event-type consumption loops.
pub struct EventConsumer {
    config: ConsumerConfig,
    client: OnceLock<NatsClient>,
    state: AtomicU8,
    live: Arc<AtomicUsize>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EventConsumer {
    pub fn new(config: ConsumerConfig) -> Self {
        Self {
            config,
            client: OnceLock::new(),
            state: AtomicU8::new(ConsumerState::Disconnected as u8),
            live: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn require(&self, expected: ConsumerState, reason: &'static str) -> Result<&NatsClient> {
        match self.client.get() {
            Some(client) if self.state() == expected => Ok(client),
            _ => Err(GatewayError::NotReady(reason)),
        }
    }

    /// Connect to the broker with bounded retry.
    pub async fn connect(&self) -> Result<()> {
        if self.client.get().is_some() {
            return Ok(());
        }

        self.set_state(ConsumerState::Connecting);
        match NatsClient::connect_with_retry(
            &self.config.nats_url,
            &self.config.client_name,
            &self.config.connect,
        )
        .await
        {
            Ok(client) => {
                let _ = self.client.set(client);
                self.set_state(ConsumerState::Connected);
                Ok(())
            }
            Err(e) => {
                self.set_state(ConsumerState::Disconnected);
                error!(url = %self.config.nats_url, error = %e, "Could not connect to NATS");
                Err(e.into())
            }
        }
    }

    /// Make sure the stream carrying every recognized subject exists.
    pub async fn ensure_topology(&self) -> Result<()> {
        let client = self.require(ConsumerState::Connected, "not connected")?;

        let stream = StreamConfig::for_subjects(
            self.config.stream.clone(),
            EventType::ALL.iter().map(|e| e.as_str()),
        );
        let outcome = client.ensure_stream(&stream, &self.config.provision).await?;
        info!(stream = %self.config.stream, outcome = ?outcome, "Stream topology ready");

        self.set_state(ConsumerState::Provisioned);
        Ok(())
    }

    /// Open one durable subscription per event type and start consuming.
    ///
    /// Every consumer and message stream is opened before any loop starts,
    /// so a setup failure leaves nothing running.
    pub async fn subscribe(
        &self,
        event_types: &[EventType],
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        let client = self.require(ConsumerState::Provisioned, "not provisioned")?;

        let mut opened = Vec::with_capacity(event_types.len());
        for &event_type in event_types {
            let durable = durable_name(&self.config.durable_base, event_type.as_str());
            let consumer = client
                .durable_consumer(
                    &self.config.stream,
                    &durable,
                    event_type.as_str(),
                    self.config.ack_wait,
                )
                .await?;
            let messages = open_messages(&consumer, &durable).await?;
            opened.push((event_type, durable, consumer, messages));
        }

        let mut tasks = self.tasks.lock();
        for (event_type, durable, consumer, messages) in opened {
            info!(event = %event_type, durable = %durable, "Subscribed to event stream");
            tasks.push(tokio::spawn(consume(
                event_type,
                consumer,
                messages,
                handler.clone(),
                self.live.clone(),
                self.cancel.child_token(),
            )));
        }

        self.set_state(ConsumerState::Consuming);
        Ok(())
    }

    /// Whether the broker connection is currently up.
    pub fn is_connected(&self) -> bool {
        self.client.get().map_or(false, NatsClient::is_connected)
    }

    pub fn is_consuming(&self) -> bool {
        self.state() == ConsumerState::Consuming
    }

    /// Number of message streams currently open.
    pub fn live_subscriptions(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Stop all loops, flush the connection and return to `Disconnected`.
    pub async fn shutdown(&self) {
        info!("Shutting down event consumer");
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in futures::future::join_all(tasks).await {
            if let Err(e) = task {
                warn!("Consumer task ended abnormally: {}", e);
            }
        }

        if let Some(client) = self.client.get() {
            if let Err(e) = client.flush().await {
                warn!("Failed to flush NATS connection: {}", e);
            }
        }

        self.set_state(ConsumerState::Disconnected);
        info!("Event consumer stopped");
    }
}

async fn open_messages(consumer: &PullConsumer, durable: &str) -> Result<pull::Stream> {
    consumer.messages().await.map_err(|e| {
        GatewayError::Broker(nats_client::Error::Consumer {
            durable: durable.to_string(),
            reason: e.to_string(),
        })
    })
}

/// Parse one delivery and hand it to the handler.
pub async fn process_delivery(
    handler: &dyn EventHandler,
    event_type: EventType,
    payload: &[u8],
) -> Delivery {
    counter!("gateway_events_received_total").increment(1);

    let event: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => {
            warn!(event = %event_type, error = %e, "Failed to parse event payload");
            return Delivery::Nak;
        }
    };

    match handler.on_event(event_type, event).await {
        Ok(()) => Delivery::Ack,
        Err(e) => {
            warn!(event = %event_type, error = %e, "Event handler failed");
            Delivery::Nak
        }
    }
}

/// Supervised consumption loop for one event type.
///
/// The message stream is reopened with capped backoff whenever it ends or
/// fails, until cancelled.
async fn consume(
    event_type: EventType,
    consumer: PullConsumer,
    first: pull::Stream,
    handler: Arc<dyn EventHandler>,
    live: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let mut pending = Some(first);
    let mut delay = RESTART_BASE_DELAY;

    loop {
        let mut messages = match pending.take() {
            Some(messages) => messages,
            None => match consumer.messages().await {
                Ok(messages) => {
                    info!(event = %event_type, "Event stream reopened");
                    messages
                }
                Err(e) => {
                    warn!(event = %event_type, error = %e, "Failed to reopen event stream");
                    if !backoff(&cancel, &mut delay).await {
                        break;
                    }
                    continue;
                }
            },
        };

        live.fetch_add(1, Ordering::Relaxed);
        let cancelled = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break true,

                next = messages.next() => match next {
                    Some(Ok(message)) => {
                        delay = RESTART_BASE_DELAY;
                        handle_message(handler.as_ref(), event_type, message).await;
                    }
                    Some(Err(e)) => {
                        warn!(event = %event_type, error = %e, "Event stream failed");
                        break false;
                    }
                    None => {
                        warn!(event = %event_type, "Event stream ended unexpectedly");
                        break false;
                    }
                }
            }
        };
        live.fetch_sub(1, Ordering::Relaxed);

        if cancelled || !backoff(&cancel, &mut delay).await {
            break;
        }
    }

    debug!(event = %event_type, "Consumption loop stopped");
}

/// Sleep for `delay` and double it. Returns `false` if cancelled meanwhile.
async fn backoff(cancel: &CancellationToken, delay: &mut Duration) -> bool {
    let wait = *delay;
    *delay = (*delay * 2).min(RESTART_MAX_DELAY);
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(wait) => true,
    }
}

async fn handle_message(handler: &dyn EventHandler, event_type: EventType, message: Message) {
    let reply = match process_delivery(handler, event_type, &message.payload).await {
        Delivery::Ack => message.ack().await,
        Delivery::Nak => {
            counter!("gateway_deliveries_nak_total").increment(1);
            message.ack_with(AckKind::Nak(None)).await
        }
    };
    if let Err(e) = reply {
        warn!(event = %event_type, error = %e, "Failed to acknowledge message");
    }
}
