//! # API Request Models
//!
//! Structures for incoming API request bodies.
//! Each struct represents the expected JSON body for an endpoint.
//!
//! Required case fields are `Option` here so the service can report every
//! missing one in a single `VALIDATION_ERROR`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{
    Capabilities, CaseLocation, CasePriority, CompletionOutcome, ContactInfo, GeoPoint,
    LocationSample, VolunteerPreferences,
};
use crate::services::{NewCase, NewVolunteer, NewZone};

/// Request to open a case.
///
/// ## Example JSON
///
/// ```json
/// {
///     "title": "Missing: Mr. Chen",
///     "description": "Left the day center at 14:00",
///     "priority": "high",
///     "location": { "lat": 24.8067, "lng": 120.9687, "area": "East District" },
///     "subjectId": "p-1"
/// }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCaseRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<CasePriority>,
    pub location: Option<CaseLocation>,
    pub contact_info: Option<ContactInfo>,
    pub subject_description: Option<String>,
    pub subject_id: Option<String>,
    /// Who is filing the case. Defaults to `api`.
    pub actor: Option<String>,
}

impl From<CreateCaseRequest> for NewCase {
    fn from(req: CreateCaseRequest) -> Self {
        NewCase {
            title: req.title,
            description: req.description,
            priority: req.priority,
            location: req.location,
            contact_info: req.contact_info,
            subject_description: req.subject_description,
            subject_id: req.subject_id,
        }
    }
}

/// Request to move a case to another status.
///
/// ## Example JSON
///
/// ```json
/// { "status": "dispatched", "actor": "coordinator-3", "reason": "search party ready" }
/// ```
///
/// `status` also accepts the legacy label `active` (= `dispatched`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRequest {
    pub status: String,
    pub actor: Option<String>,
    pub reason: Option<String>,
}

/// Request to hand a case to a case worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignCaseRequest {
    pub assignee_id: String,
    pub actor: Option<String>,
}

/// Request to advance the workflow stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRequest {
    pub stage: String,
    pub actor: Option<String>,
    pub reason: Option<String>,
}

/// Optional filter for `GET /cases`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CaseListQuery {
    pub status: Option<String>,
}

/// SOS raised by a subject's device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SosRequest {
    pub subject_id: String,
    pub lat: f64,
    pub lng: f64,
}

/// Request to monitor a circular zone for a subject.
///
/// ## Example JSON
///
/// ```json
/// {
///     "subjectId": "p-1",
///     "name": "Home",
///     "center": { "lat": 24.8067, "lng": 120.9687 },
///     "radiusMeters": 300,
///     "alertOnExit": true,
///     "emergencyContacts": ["guardian-7"]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterZoneRequest {
    pub subject_id: String,
    pub name: String,
    pub center: GeoPoint,
    pub radius_meters: f64,
    #[serde(default)]
    pub alert_on_enter: bool,
    #[serde(default = "default_true")]
    pub alert_on_exit: bool,
    #[serde(default)]
    pub emergency_contacts: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl From<RegisterZoneRequest> for NewZone {
    fn from(req: RegisterZoneRequest) -> Self {
        NewZone {
            subject_id: req.subject_id,
            name: req.name,
            center: req.center,
            radius_meters: req.radius_meters,
            alert_on_enter: req.alert_on_enter,
            alert_on_exit: req.alert_on_exit,
            emergency_contacts: req.emergency_contacts,
        }
    }
}

/// A subject's position report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationReportRequest {
    pub subject_id: String,
    pub lat: f64,
    pub lng: f64,
}

/// Recent fixes to check for prolonged non-movement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyCheckRequest {
    pub subject_id: String,
    pub history: Vec<LocationSample>,
    /// Overrides `ANOMALY_THRESHOLD_MINUTES`.
    pub threshold_minutes: Option<i64>,
}

/// Register a volunteer or update their profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterVolunteerRequest {
    pub id: String,
    pub display_name: Option<String>,
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub preferences: VolunteerPreferences,
    #[serde(default)]
    pub capabilities: Capabilities,
    pub rating: Option<f64>,
}

impl From<RegisterVolunteerRequest> for NewVolunteer {
    fn from(req: RegisterVolunteerRequest) -> Self {
        NewVolunteer {
            id: req.id,
            display_name: req.display_name,
            location: req.location,
            preferences: req.preferences,
            capabilities: req.capabilities,
            rating: req.rating,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolunteerLocationRequest {
    pub lat: f64,
    pub lng: f64,
}

/// Query for `GET /cases/{id}/matches/candidates`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FindMatchesQuery {
    pub limit: Option<usize>,
    /// Comma-separated volunteer ids to skip.
    pub exclude: Option<String>,
}

/// Manual assignment of a volunteer to a case.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignVolunteerRequest {
    pub volunteer_id: String,
    pub role: Option<String>,
    pub estimated_arrival: Option<DateTime<Utc>>,
    pub actor: Option<String>,
}

/// A volunteer's answer to an assignment.
///
/// ```json
/// { "accepted": false, "reason": "too_far" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondRequest {
    pub accepted: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub found: bool,
    pub notes: Option<String>,
}

impl From<CompleteRequest> for CompletionOutcome {
    fn from(req: CompleteRequest) -> Self {
        CompletionOutcome {
            found: req.found,
            notes: req.notes,
        }
    }
}
