//! Client sessions and the session registry.
//!
//! Uses DashMap for concurrent access from broker deliveries, client control
//! messages, the heartbeat and disconnect handlers.
//!
//! Each session owns a bounded outbox. Enqueueing never blocks: at capacity
//! the oldest frame is dropped and a throttled overflow notice is raised.
//! A per-session writer task drains the outbox onto the socket in FIFO order.

use crate::events::EventType;
use crate::protocol::{now_rfc3339, ServerMessage};
use crate::subscription::SubscriptionKey;
use axum::extract::ws::{Message, Utf8Bytes};
use dashmap::DashMap;
use futures::{Sink, SinkExt};
use metrics::counter;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique session identifier.
pub type SessionId = Uuid;

/// Default outbox capacity per session.
pub const DEFAULT_QUEUE_CAPACITY: usize = 200;

/// Default minimum spacing between overflow notices for one session.
pub const DEFAULT_OVERFLOW_NOTICE_INTERVAL: Duration = Duration::from_secs(3);

/// Backpressure budget applied to every session.
#[derive(Debug, Clone)]
pub struct QueueLimits {
    pub capacity: usize,
    pub notice_interval: Duration,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            notice_interval: DEFAULT_OVERFLOW_NOTICE_INTERVAL,
        }
    }
}

/// Pending outbound frames for one session.
#[derive(Default)]
struct Outbox {
    queue: VecDeque<Utf8Bytes>,
    /// Overflow notice waiting to go out ahead of the queue.
    notice: Option<Utf8Bytes>,
    last_notice_at: Option<Instant>,
    ping_requested: bool,
    flush_scheduled: bool,
}

/// Everything the writer must send on one wake-up, in order.
#[derive(Debug, Default)]
pub struct Batch {
    pub ping: bool,
    pub notice: Option<Utf8Bytes>,
    pub messages: Vec<Utf8Bytes>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        !self.ping && self.notice.is_none() && self.messages.is_empty()
    }
}

/// State for a single connected client.
pub struct Session {
    /// Unique session identifier.
    pub id: SessionId,
    /// Event types per scope. Empty sets are pruned.
    subscriptions: DashMap<SubscriptionKey, HashSet<EventType>>,
    outbox: Mutex<Outbox>,
    limits: QueueLimits,
    flush: Notify,
    /// Cleared by the heartbeat, set again by a pong.
    alive: AtomicBool,
    cancel: CancellationToken,
}

impl Session {
    fn new(limits: QueueLimits) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscriptions: DashMap::new(),
            outbox: Mutex::new(Outbox::default()),
            limits,
            flush: Notify::new(),
            alive: AtomicBool::new(true),
            cancel: CancellationToken::new(),
        }
    }

    /// Serialize and queue a message for this client.
    pub fn send(&self, msg: &ServerMessage) {
        match serde_json::to_string(msg) {
            Ok(json) => self.enqueue(Utf8Bytes::from(json)),
            Err(e) => warn!("Failed to serialize message for {}: {}", self.id, e),
        }
    }

    /// Queue a pre-serialized frame, dropping the oldest one at capacity.
    pub fn enqueue(&self, frame: Utf8Bytes) {
        let wake = {
            let mut outbox = self.outbox.lock();

            if outbox.queue.len() >= self.limits.capacity {
                outbox.queue.pop_front();
                counter!("gateway_queue_overflow_total").increment(1);

                let now = Instant::now();
                let notice_due = outbox
                    .last_notice_at
                    .map_or(true, |at| now.duration_since(at) > self.limits.notice_interval);
                if notice_due {
                    outbox.last_notice_at = Some(now);
                    if let Ok(json) = serde_json::to_string(&ServerMessage::overflow_notice()) {
                        outbox.notice = Some(Utf8Bytes::from(json));
                    }
                    debug!("Session {} outbox overflow, notice queued", self.id);
                }
            }

            if self.limits.capacity > 0 {
                outbox.queue.push_back(frame);
            }
            !std::mem::replace(&mut outbox.flush_scheduled, true)
        };

        if wake {
            self.flush.notify_one();
        }
    }

    /// Ask the writer to send a WebSocket ping.
    pub fn request_ping(&self) {
        let wake = {
            let mut outbox = self.outbox.lock();
            outbox.ping_requested = true;
            !std::mem::replace(&mut outbox.flush_scheduled, true)
        };
        if wake {
            self.flush.notify_one();
        }
    }

    /// Take everything pending and clear the flush flag.
    pub fn take_batch(&self) -> Batch {
        let mut outbox = self.outbox.lock();
        outbox.flush_scheduled = false;
        Batch {
            ping: std::mem::take(&mut outbox.ping_requested),
            notice: outbox.notice.take(),
            messages: outbox.queue.drain(..).collect(),
        }
    }

    /// Number of frames currently queued (notice excluded).
    pub fn queue_len(&self) -> usize {
        self.outbox.lock().queue.len()
    }

    /// Wait until a flush has been scheduled.
    pub async fn flush_requested(&self) {
        self.flush.notified().await
    }

    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Resolves once the session has been terminated.
    pub async fn terminated(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether any subscription on this session admits the event.
    pub fn wants(&self, event_type: EventType, event_patient: Option<&str>) -> bool {
        self.subscriptions.iter().any(|entry| {
            entry.value().contains(&event_type) && entry.key().admits(event_type, event_patient)
        })
    }

    /// Current subscriptions, for diagnostics and tests.
    pub fn subscriptions(&self) -> Vec<(SubscriptionKey, HashSet<EventType>)> {
        self.subscriptions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    fn close(&self) {
        self.cancel.cancel();
        self.subscriptions.clear();
        let mut outbox = self.outbox.lock();
        outbox.queue.clear();
        outbox.notice = None;
        outbox.ping_requested = false;
    }
}

/// Registry of connected sessions.
///
/// Passed explicitly to every component that needs it.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    limits: QueueLimits,
}

impl SessionRegistry {
    /// Create a new empty registry.
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            sessions: DashMap::new(),
            limits,
        }
    }

    /// Register a new session with no subscriptions.
    pub fn add_session(&self) -> Arc<Session> {
        let session = Arc::new(Session::new(self.limits.clone()));
        self.sessions.insert(session.id, session.clone());
        info!("Client {} connected", session.id);
        session
    }

    /// Remove a session and release its state. Idempotent.
    pub fn remove_session(&self, id: &SessionId) -> bool {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                session.close();
                info!("Client {} disconnected", id);
                true
            }
            None => false,
        }
    }

    /// Get a session by ID.
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| s.clone())
    }

    /// Get the total number of connected sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Total subscription entries across all sessions.
    pub fn subscription_count(&self) -> usize {
        self.sessions
            .iter()
            .map(|s| s.value().subscription_count())
            .sum()
    }

    /// Merge `events` into the subscription for `patient_id` (or global).
    /// No-op if the session is gone.
    pub fn upsert_subscription(
        &self,
        id: &SessionId,
        patient_id: Option<&str>,
        events: &[EventType],
    ) {
        if events.is_empty() {
            return;
        }
        let Some(session) = self.get(id) else {
            return;
        };
        let key = SubscriptionKey::new(patient_id);
        session
            .subscriptions
            .entry(key.clone())
            .or_default()
            .extend(events.iter().copied());
        info!(session = %id, key = %key, events = ?events, "Subscribed");
    }

    /// Remove `events` from the subscription, pruning it once empty.
    pub fn remove_from_subscription(
        &self,
        id: &SessionId,
        patient_id: Option<&str>,
        events: &[EventType],
    ) {
        let Some(session) = self.get(id) else {
            return;
        };
        let key = SubscriptionKey::new(patient_id);
        if let Some(mut entry) = session.subscriptions.get_mut(&key) {
            for event in events {
                entry.remove(event);
            }
        }
        session
            .subscriptions
            .remove_if(&key, |_, events| events.is_empty());
        info!(session = %id, key = %key, events = ?events, "Unsubscribed");
    }

    /// Get all sessions that should receive this event.
    pub fn matching_sessions(
        &self,
        event_type: EventType,
        event_patient: Option<&str>,
    ) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().wants(event_type, event_patient))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Fan a validated event out to every matching session.
    ///
    /// Returns the number of sessions the event was queued for.
    pub fn broadcast(&self, event_type: EventType, event: Value) -> usize {
        let patient_id = event_type.patient_id(&event).map(str::to_string);
        let sessions = self.matching_sessions(event_type, patient_id.as_deref());
        if sessions.is_empty() {
            debug!(event = %event_type, "No sessions subscribed");
            return 0;
        }

        let envelope = ServerMessage::Event {
            event_name: event_type.as_str().to_string(),
            data: event,
            received_at: now_rfc3339(),
        };

        // Pre-serialize the message once
        let frame = match serde_json::to_string(&envelope) {
            Ok(json) => Utf8Bytes::from(json),
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return 0;
            }
        };

        for session in &sessions {
            session.enqueue(frame.clone());
        }
        sessions.len()
    }

    /// One heartbeat round.
    ///
    /// Sessions that did not answer the previous ping are removed and
    /// returned; every other session is marked pending and pinged.
    pub fn heartbeat(&self) -> Vec<SessionId> {
        let mut dead = Vec::new();
        for entry in self.sessions.iter() {
            let session = entry.value();
            if session.alive.swap(false, Ordering::Relaxed) {
                session.request_ping();
            } else {
                dead.push(session.id);
            }
        }

        for id in &dead {
            warn!("Removing unresponsive client {}", id);
            self.remove_session(id);
            counter!("gateway_sessions_evicted_total").increment(1);
        }
        dead
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(QueueLimits::default())
    }
}

/// Drain a session's outbox onto `sink` until the session ends.
///
/// A failed write removes the session; a client that cannot receive is not
/// kept around. Termination interrupts a write that is stuck on a peer that
/// stopped reading, and the sink is dropped without a close handshake.
pub async fn run_writer<S>(session: Arc<Session>, registry: Arc<SessionRegistry>, mut sink: S)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    loop {
        tokio::select! {
            biased;

            _ = session.terminated() => break,

            _ = session.flush_requested() => {
                let batch = session.take_batch();
                tokio::select! {
                    biased;

                    _ = session.terminated() => break,

                    result = write_batch(&mut sink, batch) => {
                        if let Err(e) = result {
                            warn!("Send to client {} failed: {}; dropping session", session.id, e);
                            counter!("gateway_send_failures_total").increment(1);
                            registry.remove_session(&session.id);
                            break;
                        }
                    }
                }
            }
        }
    }

    debug!("Writer for {} stopped", session.id);
}

async fn write_batch<S>(sink: &mut S, batch: Batch) -> Result<(), S::Error>
where
    S: Sink<Message> + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }
    if batch.ping {
        sink.feed(Message::Ping(Default::default())).await?;
    }
    if let Some(notice) = batch.notice {
        sink.feed(Message::Text(notice)).await?;
    }
    for frame in batch.messages {
        sink.feed(Message::Text(frame)).await?;
    }
    sink.flush().await
}
