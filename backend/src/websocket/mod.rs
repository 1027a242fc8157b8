//! # WebSocket Module
//!
//! Pushes dispatch activity to connected clients (coordinator consoles,
//! volunteer apps, guardians' devices).
//!
//! ## Connection Flow
//!
//! ```text
//! 1. Client connects to /ws/{target}
//!              ↓
//! 2. Registry stores one channel per connection under `target`
//!              ↓
//! 3. Messages arrive as they happen:
//!    - alerts addressed to `target` (notification contract)
//!    - area alerts (broadcast contract)
//!    - engine events (geofence / case / matching), via the event bridge
//! ```
//!
//! ## Message Format
//!
//! ```json
//! {
//!     "event": "assignment_accepted",
//!     "data": { "matchId": "...", "caseId": "...", "volunteerId": "v-17" },
//!     "timestamp": "2024-01-15T12:00:00Z"
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::Message;
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::events::EventBus;
use crate::AppState;

/// Message envelope sent to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WsMessage<T> {
    pub event: String,
    pub data: T,
    pub timestamp: chrono::DateTime<Utc>,
}

impl<T: Serialize> WsMessage<T> {
    pub fn new(event: impl Into<String>, data: T) -> Self {
        Self {
            event: event.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// WebSocket connection registry.
///
/// Tracks live sessions per target id. A target can hold several
/// connections (multiple devices).
#[derive(Clone, Default)]
pub struct WsRegistry {
    sessions: Arc<Mutex<HashMap<String, Vec<broadcast::Sender<String>>>>>,
}

impl WsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection for `target`.
    /// Returns a receiver that will receive messages for this target.
    pub async fn register(&self, target: String) -> broadcast::Receiver<String> {
        let mut sessions = self.sessions.lock().await;
        let (tx, rx) = broadcast::channel(100);

        let senders = sessions.entry(target.clone()).or_default();
        senders.push(tx);

        info!(
            "Registered WebSocket for {} (connections: {})",
            target,
            senders.len()
        );

        rx
    }

    /// Drop connections of `target` whose receivers are gone.
    pub async fn unregister(&self, target: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(senders) = sessions.get_mut(target) {
            senders.retain(|tx| tx.receiver_count() > 0);
            if senders.is_empty() {
                sessions.remove(target);
                info!("Unregistered all WebSocket connections for {}", target);
            }
        }
    }

    /// Send to every connection of `target`.
    ///
    /// A target without connections is not an error.
    pub async fn send_to(&self, target: &str, event: &str, data: impl Serialize) -> Result<usize, String> {
        let json = WsMessage::new(event, data)
            .to_json()
            .map_err(|e| format!("Failed to serialize message: {}", e))?;

        let mut sessions = self.sessions.lock().await;
        let Some(senders) = sessions.get_mut(target) else {
            debug!("No active WebSocket connections for {}", target);
            return Ok(0);
        };

        senders.retain(|tx| tx.receiver_count() > 0);
        let sent = senders
            .iter()
            .filter(|tx| tx.send(json.clone()).is_ok())
            .count();
        if senders.is_empty() {
            sessions.remove(target);
        }

        Ok(sent)
    }

    /// Send to every connection.
    pub async fn broadcast(&self, event: &str, data: impl Serialize) -> Result<usize, String> {
        let json = WsMessage::new(event, data)
            .to_json()
            .map_err(|e| format!("Failed to serialize message: {}", e))?;

        let sessions = self.sessions.lock().await;
        let sent = sessions
            .values()
            .flatten()
            .filter(|tx| tx.send(json.clone()).is_ok())
            .count();

        debug!("Broadcast {} to {} connections", event, sent);
        Ok(sent)
    }

    pub async fn total_connections(&self) -> usize {
        let sessions = self.sessions.lock().await;
        sessions.values().map(|v| v.len()).sum()
    }
}

/// Forward engine events to WebSocket clients until shutdown.
///
/// Every event goes to all connections; matching events are additionally
/// addressed to the volunteer they concern.
pub async fn run_event_bridge(bus: EventBus, registry: WsRegistry, mut shutdown: watch::Receiver<bool>) {
    let mut geofence = bus.subscribe_geofence();
    let mut cases = bus.subscribe_cases();
    let mut matching = bus.subscribe_matching();

    info!("WebSocket event bridge started");

    loop {
        tokio::select! {
            event = geofence.recv() => match event {
                Ok(event) => forward(&registry, event.name(), &event, None).await,
                Err(RecvError::Lagged(n)) => warn!("Event bridge skipped {} geofence events", n),
                Err(RecvError::Closed) => break,
            },
            event = cases.recv() => match event {
                Ok(event) => forward(&registry, event.name(), &event, None).await,
                Err(RecvError::Lagged(n)) => warn!("Event bridge skipped {} case events", n),
                Err(RecvError::Closed) => break,
            },
            event = matching.recv() => match event {
                Ok(event) => forward(&registry, event.name(), &event, event.volunteer_id()).await,
                Err(RecvError::Lagged(n)) => warn!("Event bridge skipped {} matching events", n),
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }

    info!("WebSocket event bridge stopped");
}

async fn forward<T: Serialize>(registry: &WsRegistry, name: &str, event: &T, target: Option<&str>) {
    // Events are serialized as {"event": ..., "data": ...}; clients get the inner data.
    let data = match serde_json::to_value(event) {
        Ok(mut value) => value.get_mut("data").map(Value::take).unwrap_or(value),
        Err(e) => {
            error!("Failed to serialize {}: {}", name, e);
            return;
        }
    };

    if let Some(target) = target {
        if let Err(e) = registry.send_to(target, name, &data).await {
            warn!("Failed to deliver {} to {}: {}", name, target, e);
        }
    }
    if let Err(e) = registry.broadcast(name, &data).await {
        warn!("Failed to broadcast {}: {}", name, e);
    }
}

/// Configure WebSocket routes.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/ws/{target}", web::get().to(websocket_handler));
}

/// WebSocket connection handler.
///
/// ## Endpoint
///
/// `GET /ws/{target}` where `target` is a volunteer id, an emergency
/// contact id or a console name.
pub async fn websocket_handler(
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Payload,
    state: web::Data<Arc<AppState>>,
) -> Result<HttpResponse, actix_web::Error> {
    let target = path.into_inner();
    info!("WebSocket connection request for {}", target);

    let (response, mut session, mut msg_stream) = actix_ws::handle(&req, body)?;

    let registry = state.ws_registry.clone();
    let mut rx = registry.register(target.clone()).await;

    actix_rt::spawn(async move {
        let welcome = WsMessage::new(
            "connected",
            serde_json::json!({ "target": target }),
        );
        if let Ok(json) = welcome.to_json() {
            if let Err(e) = session.text(json).await {
                error!("Failed to send welcome message: {}", e);
            }
        }

        // Registry -> socket
        let mut outbound = session.clone();
        let forward_target = target.clone();
        let forward_registry = registry.clone();
        actix_rt::spawn(async move {
            while let Ok(msg) = rx.recv().await {
                if let Err(e) = outbound.text(msg).await {
                    debug!("WebSocket session closed for {}: {}", forward_target, e);
                    forward_registry.unregister(&forward_target).await;
                    break;
                }
            }
        });

        // Socket -> server (keepalive only)
        while let Some(Ok(msg)) = msg_stream.next().await {
            match msg {
                Message::Ping(bytes) => {
                    let _ = session.pong(&bytes).await;
                }
                Message::Text(text) => {
                    debug!("Ignoring client text from {}: {}", target, text);
                }
                Message::Binary(_) => {
                    warn!("Received unexpected binary message from {}", target);
                }
                Message::Close(reason) => {
                    info!("WebSocket closed for {}: {:?}", target, reason);
                    break;
                }
                _ => {}
            }
        }

        registry.unregister(&target).await;
        info!("WebSocket disconnected for {}", target);
    });

    Ok(response)
}
