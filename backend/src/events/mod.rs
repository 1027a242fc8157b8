//! # Events Module
//!
//! Typed events the dispatch engine emits. Each component publishes on its
//! own `tokio::sync::broadcast` channel; consumers (the orchestrator, the
//! WebSocket bridge) subscribe without the publisher knowing about them.
//!
//! ## Event Families
//!
//! | Channel | Events |
//! |---------|--------|
//! | geofence | `geofence_enter`, `geofence_exit`, `anomaly_detected` |
//! | cases | `case_created`, `case_updated`, `case_closed` |
//! | matching | `volunteer_assigned`, `assignment_accepted`, `assignment_rejected`, `assignment_completed`, `matching_round` |
//!
//! ## Delivery
//!
//! Publishing is fire-and-forget. With no subscriber the event is dropped;
//! a subscriber that falls behind sees `RecvError::Lagged` and skips ahead.
//! Publishers always publish after releasing their entity locks.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::db::{CasePriority, CaseStatus, GeoPoint, WorkflowStage};

/// Default buffer for each channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

// ============================================
// GEOFENCE EVENTS
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CrossingKind {
    Enter,
    Exit,
}

/// A subject crossed a zone boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceCrossing {
    pub kind: CrossingKind,
    pub subject_id: String,
    pub zone_id: Uuid,
    pub zone_name: String,
    pub location: GeoPoint,
    pub distance_meters: f64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyKind {
    NoMovement,
}

/// A subject stayed put for longer than the configured window.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub subject_id: String,
    /// Largest displacement from the latest fix seen inside the window.
    pub max_distance_meters: f64,
    pub window_minutes: i64,
    pub samples_examined: usize,
    pub last_seen: Option<GeoPoint>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum GeofenceEvent {
    #[serde(rename = "geofence_enter")]
    Enter(GeofenceCrossing),
    #[serde(rename = "geofence_exit")]
    Exit(GeofenceCrossing),
    #[serde(rename = "anomaly_detected")]
    AnomalyDetected(Anomaly),
}

impl GeofenceEvent {
    pub fn from_crossing(crossing: GeofenceCrossing) -> Self {
        match crossing.kind {
            CrossingKind::Enter => GeofenceEvent::Enter(crossing),
            CrossingKind::Exit => GeofenceEvent::Exit(crossing),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            GeofenceEvent::Enter(_) => "geofence_enter",
            GeofenceEvent::Exit(_) => "geofence_exit",
            GeofenceEvent::AnomalyDetected(_) => "anomaly_detected",
        }
    }
}

// ============================================
// CASE EVENTS
// ============================================

/// What changed on a case.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CaseChange {
    Status { from: CaseStatus, to: CaseStatus },
    Escalated { from: CasePriority, to: CasePriority },
    Workflow { from: WorkflowStage, to: WorkflowStage },
    Purged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum CaseEvent {
    #[serde(rename = "case_created", rename_all = "camelCase")]
    Created {
        case_id: Uuid,
        priority: CasePriority,
        subject_id: Option<String>,
        actor: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "case_updated", rename_all = "camelCase")]
    Updated {
        case_id: Uuid,
        change: CaseChange,
        actor: String,
        timestamp: DateTime<Utc>,
    },
    /// Reached a terminal state (`closed` or `cancelled`).
    #[serde(rename = "case_closed", rename_all = "camelCase")]
    Closed {
        case_id: Uuid,
        status: CaseStatus,
        actor: String,
        timestamp: DateTime<Utc>,
    },
}

impl CaseEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CaseEvent::Created { .. } => "case_created",
            CaseEvent::Updated { .. } => "case_updated",
            CaseEvent::Closed { .. } => "case_closed",
        }
    }

    pub fn case_id(&self) -> Uuid {
        match self {
            CaseEvent::Created { case_id, .. }
            | CaseEvent::Updated { case_id, .. }
            | CaseEvent::Closed { case_id, .. } => *case_id,
        }
    }
}

// ============================================
// MATCHING EVENTS
// ============================================

/// Why a matching round ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundTrigger {
    CaseCreated,
    CaseDispatched,
    AssignmentRejected,
    Periodic,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum MatchingEvent {
    #[serde(rename = "volunteer_assigned", rename_all = "camelCase")]
    VolunteerAssigned {
        match_id: Uuid,
        case_id: Uuid,
        volunteer_id: String,
    },
    #[serde(rename = "assignment_accepted", rename_all = "camelCase")]
    AssignmentAccepted {
        match_id: Uuid,
        case_id: Uuid,
        volunteer_id: String,
    },
    #[serde(rename = "assignment_rejected", rename_all = "camelCase")]
    AssignmentRejected {
        match_id: Uuid,
        case_id: Uuid,
        volunteer_id: String,
        reason: Option<String>,
    },
    #[serde(rename = "assignment_completed", rename_all = "camelCase")]
    AssignmentCompleted {
        match_id: Uuid,
        case_id: Uuid,
        volunteer_id: String,
        found: bool,
    },
    #[serde(rename = "matching_round", rename_all = "camelCase")]
    RoundCompleted {
        case_id: Uuid,
        trigger: RoundTrigger,
        candidates: usize,
        assigned: Vec<String>,
    },
}

impl MatchingEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MatchingEvent::VolunteerAssigned { .. } => "volunteer_assigned",
            MatchingEvent::AssignmentAccepted { .. } => "assignment_accepted",
            MatchingEvent::AssignmentRejected { .. } => "assignment_rejected",
            MatchingEvent::AssignmentCompleted { .. } => "assignment_completed",
            MatchingEvent::RoundCompleted { .. } => "matching_round",
        }
    }

    /// Volunteer the event concerns, if any.
    pub fn volunteer_id(&self) -> Option<&str> {
        match self {
            MatchingEvent::VolunteerAssigned { volunteer_id, .. }
            | MatchingEvent::AssignmentAccepted { volunteer_id, .. }
            | MatchingEvent::AssignmentRejected { volunteer_id, .. }
            | MatchingEvent::AssignmentCompleted { volunteer_id, .. } => Some(volunteer_id),
            MatchingEvent::RoundCompleted { .. } => None,
        }
    }
}

// ============================================
// BUS
// ============================================

/// One broadcast channel per event family.
#[derive(Clone)]
pub struct EventBus {
    geofence: broadcast::Sender<GeofenceEvent>,
    cases: broadcast::Sender<CaseEvent>,
    matching: broadcast::Sender<MatchingEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (geofence, _) = broadcast::channel(capacity);
        let (cases, _) = broadcast::channel(capacity);
        let (matching, _) = broadcast::channel(capacity);
        Self {
            geofence,
            cases,
            matching,
        }
    }

    pub fn subscribe_geofence(&self) -> broadcast::Receiver<GeofenceEvent> {
        self.geofence.subscribe()
    }

    pub fn subscribe_cases(&self) -> broadcast::Receiver<CaseEvent> {
        self.cases.subscribe()
    }

    pub fn subscribe_matching(&self) -> broadcast::Receiver<MatchingEvent> {
        self.matching.subscribe()
    }

    pub fn publish_geofence(&self, event: GeofenceEvent) {
        let name = event.name();
        if self.geofence.send(event).is_err() {
            debug!("No subscribers for {}", name);
        }
    }

    pub fn publish_case(&self, event: CaseEvent) {
        let name = event.name();
        if self.cases.send(event).is_err() {
            debug!("No subscribers for {}", name);
        }
    }

    pub fn publish_matching(&self, event: MatchingEvent) {
        let name = event.name();
        if self.matching.send(event).is_err() {
            debug!("No subscribers for {}", name);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}
