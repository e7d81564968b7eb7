//! WebSocket server handler using Axum.

use crate::consumer::EventConsumer;
use crate::protocol::{now_rfc3339, ClientMessage, ServerMessage, CONNECTED_MESSAGE};
use crate::session::{run_writer, SessionId, SessionRegistry};
use crate::subscription::validate_request;
use crate::validation::SchemaGate;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::StreamExt;
use metrics::{counter, gauge};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Shared application state.
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub consumer: Arc<EventConsumer>,
    pub gate: Arc<SchemaGate>,
}

/// Create the HTTP router: `/ws`, `/health` and `/ready`.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (status, body) = health_report(&state);
    (status, Json(body))
}

async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (status, body) = readiness(&state);
    (status, Json(body))
}

/// Health body and status code. Degraded (503) unless the broker is
/// connected and every subscription is consuming.
pub fn health_report(state: &AppState) -> (StatusCode, Value) {
    let connected = state.consumer.is_connected();
    let consuming = state.consumer.is_consuming();
    let healthy = connected && consuming;

    let body = json!({
        "status": if healthy { "ok" } else { "degraded" },
        "timestamp": now_rfc3339(),
        "dependencies": {
            "nats": {
                "connected": connected,
                "consuming": consuming,
                "live_subscriptions": state.consumer.live_subscriptions(),
            }
        },
        "schemas": {
            "loaded": state.gate.schema_count(),
        },
        "metrics": {
            "active_sessions": state.registry.session_count(),
            "subscriptions": state.registry.subscription_count(),
        }
    });

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, body)
}

pub fn readiness(state: &AppState) -> (StatusCode, Value) {
    if state.consumer.is_connected() && state.consumer.is_consuming() {
        (StatusCode::OK, json!({ "status": "ready" }))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            json!({ "status": "not ready" }),
        )
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (ws_tx, mut ws_rx) = socket.split();

    let session = state.registry.add_session();
    let session_id = session.id;

    counter!("gateway_connections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.session_count() as f64);

    session.send(&ServerMessage::Connected {
        session_id: session_id.to_string(),
        message: CONNECTED_MESSAGE.to_string(),
    });

    let writer = tokio::spawn(run_writer(session.clone(), state.registry.clone(), ws_tx));

    loop {
        tokio::select! {
            biased;

            // Removed by the heartbeat or after a failed write
            _ = session.terminated() => break,

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = process_client_message(&state.registry, &session_id, text.as_str());
                        session.send(&reply);
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let reply = match std::str::from_utf8(&data) {
                            Ok(text) => process_client_message(&state.registry, &session_id, text),
                            Err(_) => ServerMessage::error("Invalid JSON"),
                        };
                        session.send(&reply);
                    }
                    Some(Ok(Message::Pong(_))) => session.mark_alive(),
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", session_id, e);
                        break;
                    }
                }
            }
        }
    }

    // Cleanup
    state.registry.remove_session(&session_id);
    let _ = writer.await;

    gauge!("gateway_active_connections").set(state.registry.session_count() as f64);
}

/// Handle one inbound control frame and build the reply.
///
/// Failed requests leave subscription state untouched.
pub fn process_client_message(
    registry: &SessionRegistry,
    session_id: &SessionId,
    raw: &str,
) -> ServerMessage {
    let Ok(value) = serde_json::from_str::<Value>(raw) else {
        return ServerMessage::error("Invalid JSON");
    };
    if value.get("type").and_then(Value::as_str).is_none() {
        return ServerMessage::error("Unknown message type");
    }
    let Ok(msg) = serde_json::from_value::<ClientMessage>(value) else {
        return ServerMessage::error("Invalid JSON");
    };

    match msg {
        ClientMessage::Ping => {
            if let Some(session) = registry.get(session_id) {
                session.mark_alive();
            }
            ServerMessage::pong()
        }
        ClientMessage::Subscribe(request) => match validate_request(request) {
            Ok(scoped) => {
                registry.upsert_subscription(session_id, scoped.patient_id.as_deref(), &scoped.events);
                counter!("gateway_subscriptions_total").increment(scoped.events.len() as u64);
                ServerMessage::Subscribed {
                    patient_id: scoped.patient_id,
                    events: scoped.events,
                }
            }
            Err(violation) => {
                debug!("Client {} subscribe rejected: {}", session_id, violation);
                violation.into()
            }
        },
        ClientMessage::Unsubscribe(request) => match validate_request(request) {
            Ok(scoped) => {
                registry.remove_from_subscription(
                    session_id,
                    scoped.patient_id.as_deref(),
                    &scoped.events,
                );
                ServerMessage::Unsubscribed {
                    patient_id: scoped.patient_id,
                    events: scoped.events,
                }
            }
            Err(violation) => {
                debug!("Client {} unsubscribe rejected: {}", session_id, violation);
                violation.into()
            }
        },
        ClientMessage::Unknown => ServerMessage::error("Unknown message type"),
    }
}

/// Periodic liveness sweep over every session until cancelled.
pub async fn run_heartbeat(
    registry: Arc<SessionRegistry>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately
    ticker.tick().await;

    info!("Heartbeat running every {:?}", period);
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = ticker.tick() => {
                let evicted = registry.heartbeat();
                if !evicted.is_empty() {
                    info!(count = evicted.len(), "Evicted unresponsive sessions");
                    gauge!("gateway_active_connections").set(registry.session_count() as f64);
                }
            }
        }
    }
    info!("Heartbeat stopped");
}
