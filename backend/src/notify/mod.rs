//! # Notification Module
//!
//! Outbound contracts of the engine: per-target alerts and area
//! broadcasts. Delivery is fire-and-forget; a failed send is logged and
//! never fails the operation that triggered it.
//!
//! ## Alert Types
//!
//! | Type | Raised when |
//! |------|-------------|
//! | `SOS_EMERGENCY` | A subject pressed SOS |
//! | `EXIT_GEOFENCE` | Subject left a zone with exit alerts |
//! | `ENTER_GEOFENCE` | Subject entered a zone with enter alerts |
//! | `NO_MOVEMENT` | Subject stationary past the anomaly window |
//! | `GENERAL` | Anything else |

pub mod audit;

pub use audit::{AuditSink, Auditor, StoreAuditSink};

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::{CasePriority, GeoPoint};
use crate::websocket::WsRegistry;

/// Only message ever sent with an area broadcast. Carries no personal data.
pub const GENERIC_SAFETY_MESSAGE: &str =
    "A person in your area needs help. Open the app to see if you can assist.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    SosEmergency,
    ExitGeofence,
    EnterGeofence,
    NoMovement,
    General,
}

/// An alert addressed to one target (emergency contact, volunteer).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub message: String,
    pub data: Value,
}

impl Alert {
    pub fn new(alert_type: AlertType, message: impl Into<String>, data: Value) -> Self {
        Self {
            alert_type,
            message: message.into(),
            data,
        }
    }
}

/// A PII-free alert for everyone inside a circle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaBroadcast {
    pub center: GeoPoint,
    pub radius_meters: f64,
    pub priority: CasePriority,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Delivery channel for alerts and broadcasts.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, target: &str, alert: &Alert) -> Result<(), NotifyError>;

    async fn broadcast(&self, area: &AreaBroadcast) -> Result<(), NotifyError>;
}

pub type SharedNotifier = Arc<dyn Notifier>;

/// Send an alert, logging instead of failing.
pub async fn notify_best_effort(notifier: &dyn Notifier, target: &str, alert: &Alert) {
    if let Err(e) = notifier.notify(target, alert).await {
        warn!("Failed to notify {} ({:?}): {}", target, alert.alert_type, e);
    }
}

/// Broadcast to an area, logging instead of failing.
pub async fn broadcast_best_effort(notifier: &dyn Notifier, area: &AreaBroadcast) {
    if let Err(e) = notifier.broadcast(area).await {
        warn!(
            "Failed to broadcast to {:.0} m around ({}, {}): {}",
            area.radius_meters, area.center.lat, area.center.lng, e
        );
    }
}

// ============================================
// IMPLEMENTATIONS
// ============================================

/// Pushes alerts to WebSocket sessions.
#[derive(Clone)]
pub struct WsNotifier {
    registry: WsRegistry,
}

impl WsNotifier {
    pub fn new(registry: WsRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Notifier for WsNotifier {
    async fn notify(&self, target: &str, alert: &Alert) -> Result<(), NotifyError> {
        let sent = self
            .registry
            .send_to(target, "alert", alert)
            .await
            .map_err(NotifyError::Delivery)?;
        info!("Alert {:?} for {} reached {} sessions", alert.alert_type, target, sent);
        Ok(())
    }

    async fn broadcast(&self, area: &AreaBroadcast) -> Result<(), NotifyError> {
        let sent = self
            .registry
            .broadcast("area_alert", area)
            .await
            .map_err(NotifyError::Delivery)?;
        info!(
            "Area alert ({} priority, {:.0} m) reached {} sessions",
            area.priority, area.radius_meters, sent
        );
        Ok(())
    }
}

/// Captures everything sent, for assertions.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    pub alerts: Arc<std::sync::Mutex<Vec<(String, Alert)>>>,
    pub broadcasts: Arc<std::sync::Mutex<Vec<AreaBroadcast>>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub fn alerts_of(&self, alert_type: AlertType) -> Vec<(String, Alert)> {
        self.alerts
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, a)| a.alert_type == alert_type)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, target: &str, alert: &Alert) -> Result<(), NotifyError> {
        self.alerts
            .lock()
            .unwrap()
            .push((target.to_string(), alert.clone()));
        Ok(())
    }

    async fn broadcast(&self, area: &AreaBroadcast) -> Result<(), NotifyError> {
        self.broadcasts.lock().unwrap().push(area.clone());
        Ok(())
    }
}
