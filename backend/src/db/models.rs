//! # Database Models
//!
//! This module defines the records the dispatch engine persists. Each
//! struct is stored as one JSON document under the key layout described
//! in the parent module.
//!
//! ## Record Overview
//!
//! | Record | Key | Description |
//! |--------|-----|-------------|
//! | [`Case`] | `case:{id}` | Tracked incident and its lifecycle |
//! | [`GeofenceZone`] | `zone:{id}` | Circular zone monitored for one subject |
//! | [`GeofenceStatus`] | `geostatus:{subject}:{zone}` | Last inside/outside evaluation |
//! | [`Volunteer`] | `volunteer:{id}` | Responder profile and availability |
//! | [`Match`] | `match:{id}` | One volunteer assigned to one case |
//! | [`AuditRecord`] | `audit:{id}` | Best-effort audit trail |
//!
//! ## Relationship Diagram
//!
//! ```text
//! ┌─────────────┐        ┌──────────────┐        ┌─────────────┐
//! │    Case     │───────<│    Match     │>───────│  Volunteer  │
//! │             │        │              │        │             │
//! │ id (v7)     │        │ case_id      │        │ id          │
//! │ subject_id ─┼──┐     │ volunteer_id │        │ status      │
//! │ status      │  │     │ status       │        │ matches     │
//! └─────────────┘  │     └──────────────┘        └─────────────┘
//!                  │
//!                  ▼
//!          ┌──────────────┐       ┌────────────────┐
//!          │ GeofenceZone │──────<│ GeofenceStatus │
//!          │ subject_id   │       │ inside         │
//!          └──────────────┘       └────────────────┘
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ============================================
// SHARED VALUE TYPES
// ============================================

/// A WGS84 coordinate pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// One entry of an append-only transition log.
///
/// `from` is `None` only for the entry that seeds the log at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition<S> {
    pub from: Option<S>,
    pub to: S,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub reason: Option<String>,
}

// ============================================
// CASE
// ============================================

/// Case urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CasePriority {
    Low,
    Medium,
    High,
    Critical,
}

impl CasePriority {
    /// Weighting factor applied to matching scores.
    pub fn multiplier(self) -> f64 {
        match self {
            CasePriority::Low => 1.0,
            CasePriority::Medium => 1.2,
            CasePriority::High => 1.5,
            CasePriority::Critical => 2.0,
        }
    }

    /// Search-area radius in meters. Used as the default matching distance
    /// and as the broadcast radius on dispatch.
    pub fn search_radius_meters(self) -> f64 {
        match self {
            CasePriority::Low => 1000.0,
            CasePriority::Medium => 2000.0,
            CasePriority::High => 3000.0,
            CasePriority::Critical => 5000.0,
        }
    }

    /// Urgent cases get a matching round as soon as they are created.
    pub fn is_urgent(self) -> bool {
        matches!(self, CasePriority::High | CasePriority::Critical)
    }

    /// The next priority up; `Critical` saturates.
    pub fn escalated(self) -> Self {
        match self {
            CasePriority::Low => CasePriority::Medium,
            CasePriority::Medium => CasePriority::High,
            CasePriority::High | CasePriority::Critical => CasePriority::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CasePriority::Low => "low",
            CasePriority::Medium => "medium",
            CasePriority::High => "high",
            CasePriority::Critical => "critical",
        }
    }
}

impl Default for CasePriority {
    fn default() -> Self {
        CasePriority::Medium
    }
}

impl fmt::Display for CasePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Case lifecycle state.
///
/// ```text
/// created ──> assigned ──> dispatched ──> in_progress ──> resolved ──> closed
///    │           │             │  └──────────────────────────┘
///    └───────────┴─────────────┴──────────┴──> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Created,
    Assigned,
    Dispatched,
    InProgress,
    Resolved,
    Closed,
    Cancelled,
}

impl CaseStatus {
    pub const ALL: [CaseStatus; 7] = [
        CaseStatus::Created,
        CaseStatus::Assigned,
        CaseStatus::Dispatched,
        CaseStatus::InProgress,
        CaseStatus::Resolved,
        CaseStatus::Closed,
        CaseStatus::Cancelled,
    ];

    /// States reachable from `self` in one step.
    pub fn allowed_transitions(self) -> &'static [CaseStatus] {
        use CaseStatus::*;
        match self {
            Created => &[Assigned, Cancelled],
            Assigned => &[Dispatched, Cancelled],
            Dispatched => &[InProgress, Resolved, Cancelled],
            InProgress => &[Resolved, Cancelled],
            Resolved => &[Closed],
            Closed | Cancelled => &[],
        }
    }

    pub fn can_transition_to(self, to: CaseStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CaseStatus::Closed | CaseStatus::Cancelled)
    }

    /// Alerts are live only while responders are in the field.
    pub fn alerts_active(self) -> bool {
        matches!(self, CaseStatus::Dispatched | CaseStatus::InProgress)
    }

    /// Still needs responders.
    pub fn is_open(self) -> bool {
        !matches!(
            self,
            CaseStatus::Resolved | CaseStatus::Closed | CaseStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CaseStatus::Created => "created",
            CaseStatus::Assigned => "assigned",
            CaseStatus::Dispatched => "dispatched",
            CaseStatus::InProgress => "in_progress",
            CaseStatus::Resolved => "resolved",
            CaseStatus::Closed => "closed",
            CaseStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaseStatus {
    type Err = String;

    /// Accepts the legacy `active` label as an alias for `dispatched`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "created" => Ok(CaseStatus::Created),
            "assigned" => Ok(CaseStatus::Assigned),
            "dispatched" | "active" => Ok(CaseStatus::Dispatched),
            "in_progress" | "in-progress" => Ok(CaseStatus::InProgress),
            "resolved" => Ok(CaseStatus::Resolved),
            "closed" => Ok(CaseStatus::Closed),
            "cancelled" | "canceled" => Ok(CaseStatus::Cancelled),
            other => Err(format!("unknown case status '{}'", other)),
        }
    }
}

/// Internal search workflow, tracked alongside [`CaseStatus`] and validated
/// against its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    Reported,
    Verifying,
    Searching,
    Suspended,
    Found,
    Reunited,
    Archived,
}

impl WorkflowStage {
    pub fn allowed_transitions(self) -> &'static [WorkflowStage] {
        use WorkflowStage::*;
        match self {
            Reported => &[Verifying],
            Verifying => &[Searching, Archived],
            Searching => &[Found, Suspended],
            Suspended => &[Searching, Archived],
            Found => &[Reunited],
            Reunited => &[Archived],
            Archived => &[],
        }
    }

    pub fn can_transition_to(self, to: WorkflowStage) -> bool {
        self.allowed_transitions().contains(&to)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStage::Archived)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStage::Reported => "reported",
            WorkflowStage::Verifying => "verifying",
            WorkflowStage::Searching => "searching",
            WorkflowStage::Suspended => "suspended",
            WorkflowStage::Found => "found",
            WorkflowStage::Reunited => "reunited",
            WorkflowStage::Archived => "archived",
        }
    }
}

impl Default for WorkflowStage {
    fn default() -> Self {
        WorkflowStage::Reported
    }
}

impl fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reported" => Ok(WorkflowStage::Reported),
            "verifying" => Ok(WorkflowStage::Verifying),
            "searching" => Ok(WorkflowStage::Searching),
            "suspended" => Ok(WorkflowStage::Suspended),
            "found" => Ok(WorkflowStage::Found),
            "reunited" => Ok(WorkflowStage::Reunited),
            "archived" => Ok(WorkflowStage::Archived),
            other => Err(format!("unknown workflow stage '{}'", other)),
        }
    }
}

/// Where the case is centred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseLocation {
    pub lat: f64,
    pub lng: f64,
    pub address: Option<String>,
    pub area: Option<String>,
    pub radius: Option<f64>,
}

impl CaseLocation {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lng)
    }
}

/// Reporter / guardian contact details. Purged by retention cleanup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactInfo {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub relationship: Option<String>,
}

/// Area alert settings for a case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertConfig {
    /// True only while the case is dispatched or in progress.
    pub enabled: bool,
    /// Broadcast radius in meters.
    pub radius: f64,
    pub priority: CasePriority,
}

/// A tracked incident, e.g. a missing-person report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Case {
    /// Time-ordered UUID (v7), so key order is creation order.
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub priority: CasePriority,
    pub status: CaseStatus,
    pub location: CaseLocation,
    pub contact_info: Option<ContactInfo>,
    pub subject_description: Option<String>,

    /// Monitored subject this case concerns, if any. Links geofence
    /// breaches to the case.
    pub subject_id: Option<String>,

    pub alert_config: AlertConfig,

    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,

    /// Case worker responsible for the case.
    pub assigned_to: Option<String>,
    pub assigned_by: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,

    pub dispatched_by: Option<String>,
    pub dispatched_at: Option<DateTime<Utc>>,

    /// Volunteers holding an unresolved match, in assignment order.
    pub assigned_volunteers: Vec<String>,

    /// Volunteers that turned this case down; skipped by later rounds.
    #[serde(default)]
    pub declined_volunteers: Vec<String>,

    pub state_history: Vec<Transition<CaseStatus>>,

    #[serde(default)]
    pub workflow_stage: WorkflowStage,
    #[serde(default)]
    pub workflow_history: Vec<Transition<WorkflowStage>>,

    /// When the retention sweep may purge personal data.
    pub cleanup_after: Option<DateTime<Utc>>,
    pub purged_at: Option<DateTime<Utc>>,
}

impl Case {
    pub fn has_capacity(&self, cap: usize) -> bool {
        self.assigned_volunteers.len() < cap
    }
}

// ============================================
// GEOFENCE
// ============================================

/// A named circular zone monitored for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceZone {
    pub id: Uuid,
    pub subject_id: String,
    pub name: String,
    pub center: GeoPoint,
    /// Always > 0.
    pub radius_meters: f64,
    pub alert_on_enter: bool,
    pub alert_on_exit: bool,
    pub active: bool,
    /// Notification targets for this zone's alerts.
    pub emergency_contacts: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Last evaluation of one subject against one zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceStatus {
    pub subject_id: String,
    pub zone_id: Uuid,
    pub inside: bool,
    /// Last boundary crossing.
    pub last_event: Option<DateTime<Utc>>,
    pub last_check: DateTime<Utc>,
    /// Rounded to whole meters. `None` until the first evaluation.
    pub distance_meters: Option<f64>,
}

/// A timestamped position report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub lat: f64,
    pub lng: f64,
    pub timestamp: DateTime<Utc>,
}

// ============================================
// VOLUNTEER
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolunteerStatus {
    /// No unresolved matches.
    Available,
    /// Holds a match awaiting the volunteer's answer.
    Assigned,
    /// Accepted a match and is responding.
    Active,
}

impl fmt::Display for VolunteerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VolunteerStatus::Available => "available",
            VolunteerStatus::Assigned => "assigned",
            VolunteerStatus::Active => "active",
        };
        f.write_str(s)
    }
}

/// A weekly availability window, hours in local 24h time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityWindow {
    /// 0 = Monday .. 6 = Sunday.
    pub weekday: u8,
    pub start_hour: u8,
    pub end_hour: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolunteerPreferences {
    /// Furthest the volunteer will travel, meters. Falls back to the case's
    /// search radius when unset.
    pub max_distance: Option<f64>,
    #[serde(default)]
    pub case_types: Vec<String>,
    #[serde(default)]
    pub availability: Vec<AvailabilityWindow>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub has_vehicle: bool,
    pub first_aid: bool,
    #[serde(default)]
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volunteer {
    pub id: String,
    pub display_name: Option<String>,
    pub location: Option<GeoPoint>,
    pub location_updated_at: Option<DateTime<Utc>>,
    pub preferences: VolunteerPreferences,
    pub capabilities: Capabilities,
    pub status: VolunteerStatus,
    /// 0.0 ..= 5.0
    pub rating: f64,
    pub total_cases: u32,
    pub successful_cases: u32,
    /// Unresolved matches. Empty if and only if `status` is `Available`.
    pub current_matches: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Volunteer {
    /// Share of completed cases where the subject was found. New
    /// volunteers get the benefit of the doubt (0.5).
    pub fn success_rate(&self) -> f64 {
        if self.total_cases == 0 {
            0.5
        } else {
            self.successful_cases as f64 / self.total_cases as f64
        }
    }

    /// Recompute `status` from the match list after it changed.
    ///
    /// `accepted` tells whether any remaining match has been accepted.
    pub fn settle_status(&mut self, accepted: bool) {
        self.status = if self.current_matches.is_empty() {
            VolunteerStatus::Available
        } else if accepted {
            VolunteerStatus::Active
        } else {
            VolunteerStatus::Assigned
        };
    }
}

// ============================================
// MATCH
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Assigned,
    Accepted,
    Rejected,
    Completed,
}

impl MatchStatus {
    pub fn is_unresolved(self) -> bool {
        matches!(self, MatchStatus::Assigned | MatchStatus::Accepted)
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MatchStatus::Assigned => "assigned",
            MatchStatus::Accepted => "accepted",
            MatchStatus::Rejected => "rejected",
            MatchStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// How a completed assignment ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionOutcome {
    pub found: bool,
    pub notes: Option<String>,
}

/// The assignment of one volunteer to one case.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    pub id: Uuid,
    pub case_id: Uuid,
    pub volunteer_id: String,
    pub status: MatchStatus,
    pub role: String,
    /// Score at assignment time, when assigned by a matching round.
    pub score: Option<f64>,
    pub distance_meters: Option<f64>,
    pub assigned_by: String,
    pub assigned_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_arrival: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub outcome: Option<CompletionOutcome>,
}

// ============================================
// AUDIT
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: Uuid,
    pub actor: String,
    pub action: String,
    pub entity_id: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_exits() {
        for status in CaseStatus::ALL {
            assert_eq!(
                status.is_terminal(),
                status.allowed_transitions().is_empty(),
                "{status}"
            );
        }
    }

    #[test]
    fn test_active_alias_parses_to_dispatched() {
        assert_eq!("active".parse::<CaseStatus>(), Ok(CaseStatus::Dispatched));
        assert_eq!("IN_PROGRESS".parse::<CaseStatus>(), Ok(CaseStatus::InProgress));
        assert!("paused".parse::<CaseStatus>().is_err());
    }

    #[test]
    fn test_priority_tables() {
        assert_eq!(CasePriority::Critical.search_radius_meters(), 5000.0);
        assert_eq!(CasePriority::Low.multiplier(), 1.0);
        assert_eq!(CasePriority::High.escalated(), CasePriority::Critical);
        assert_eq!(CasePriority::Critical.escalated(), CasePriority::Critical);
        assert!(!CasePriority::Medium.is_urgent());
    }

    #[test]
    fn test_workflow_table_has_no_way_back_from_archive() {
        assert!(WorkflowStage::Searching.can_transition_to(WorkflowStage::Suspended));
        assert!(WorkflowStage::Suspended.can_transition_to(WorkflowStage::Searching));
        assert!(!WorkflowStage::Archived.can_transition_to(WorkflowStage::Reported));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&CaseStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }
}
