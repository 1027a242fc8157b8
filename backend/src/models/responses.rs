//! # API Response Models
//!
//! Structures for outgoing API response bodies.
//! All responses are wrapped in a standard format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{Case, GeofenceStatus, GeofenceZone, Match};
use crate::events::GeofenceCrossing;
use crate::services::case_manager::WorkflowOutcome;
use crate::services::geofence_monitor::Evaluation;
use crate::services::orchestrator::{CaseIntake, SosOutcome};
use crate::services::volunteer_matcher::{Candidate, RoundOutcome};

/// Standard API response wrapper.
///
/// All API responses follow this format:
///
/// ## Success Response
///
/// ```json
/// {
///     "success": true,
///     "data": { ... },
///     "error": null
/// }
/// ```
///
/// ## Error Response
///
/// ```json
/// {
///     "success": false,
///     "data": null,
///     "error": {
///         "code": "CAPACITY_EXCEEDED",
///         "message": "Case ... already holds the maximum of 10 volunteers"
///     }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    /// Whether the request was successful.
    pub success: bool,

    /// Response data (null on error).
    pub data: Option<T>,

    /// Error information (null on success).
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    /// Create a successful response with data.
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(code: &str, message: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError {
                code: code.to_string(),
                message: message.to_string(),
            }),
        }
    }
}

/// API error information.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    /// Error code (e.g., "INVALID_TRANSITION").
    pub code: String,

    /// Human-readable error message.
    pub message: String,
}

/// A scored candidate.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateResponse {
    pub volunteer_id: String,
    pub score: f64,
    pub distance_meters: f64,
}

impl From<Candidate> for CandidateResponse {
    fn from(c: Candidate) -> Self {
        Self {
            volunteer_id: c.volunteer_id,
            score: c.score,
            distance_meters: c.distance_meters,
        }
    }
}

/// Outcome of a matching round.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundResponse {
    pub case_id: Uuid,
    pub candidates: Vec<CandidateResponse>,
    pub assigned: Vec<Match>,
}

impl From<RoundOutcome> for RoundResponse {
    fn from(round: RoundOutcome) -> Self {
        Self {
            case_id: round.case_id,
            candidates: round.candidates.into_iter().map(Into::into).collect(),
            assigned: round.assigned,
        }
    }
}

/// Returned by `POST /cases` and `POST /sos`.
///
/// ```json
/// {
///     "case": { "id": "0190...", "status": "created", ... },
///     "round": { "caseId": "0190...", "candidates": [...], "assigned": [...] }
/// }
/// ```
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseCreatedResponse {
    pub case: Case,
    /// Present for `high` / `critical` cases.
    pub round: Option<RoundResponse>,
    /// Emergency contacts alerted (SOS only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contacts_notified: Option<usize>,
}

impl From<CaseIntake> for CaseCreatedResponse {
    fn from(intake: CaseIntake) -> Self {
        Self {
            case: intake.case,
            round: intake.round.map(Into::into),
            contacts_notified: None,
        }
    }
}

impl From<SosOutcome> for CaseCreatedResponse {
    fn from(sos: SosOutcome) -> Self {
        Self {
            case: sos.case,
            round: sos.round.map(Into::into),
            contacts_notified: Some(sos.contacts_notified),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResponse {
    pub case: Case,
    /// Workflow stage disagrees with the case status.
    pub divergent: bool,
}

impl From<WorkflowOutcome> for WorkflowResponse {
    fn from(outcome: WorkflowOutcome) -> Self {
        Self {
            case: outcome.case,
            divergent: outcome.divergent,
        }
    }
}

/// Result of a location report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResponse {
    pub statuses: Vec<GeofenceStatus>,
    pub events: Vec<GeofenceCrossing>,
}

impl From<Evaluation> for EvaluationResponse {
    fn from(evaluation: Evaluation) -> Self {
        Self {
            statuses: evaluation.statuses,
            events: evaluation.events,
        }
    }
}

/// Zones registered for a subject plus their last evaluation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectGeofencesResponse {
    pub subject_id: String,
    pub zones: Vec<GeofenceZone>,
    pub statuses: Vec<GeofenceStatus>,
}

/// Health check response.
///
/// ```json
/// {
///     "status": "healthy",
///     "version": "0.1.0",
///     "store": "memory",
///     "websocketConnections": 3,
///     "timestamp": "2024-01-15T12:00:00Z"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub store: String,
    pub websocket_connections: usize,
    pub timestamp: DateTime<Utc>,
}
