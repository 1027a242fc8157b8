//! # API Request Handlers
//!
//! This module contains the handler functions for each API endpoint.
//! Each handler:
//! 1. Extracts request data
//! 2. Calls the appropriate service
//! 3. Returns a formatted response
//!
//! Validation lives in the services so the API and background tasks share
//! it.
//!
//! ## Error Handling
//!
//! All errors are returned as JSON with the service error's code:
//!
//! ```json
//! {
//!     "success": false,
//!     "error": {
//!         "code": "CAPACITY_EXCEEDED",
//!         "message": "Case ... already holds the maximum of 10 volunteers"
//!     }
//! }
//! ```

use std::str::FromStr;
use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::{CaseStatus, WorkflowStage};
use crate::errors::DispatchError;
use crate::events::RoundTrigger;
use crate::models::{
    AnomalyCheckRequest, ApiResponse, AssignCaseRequest, AssignVolunteerRequest,
    CandidateResponse, CaseCreatedResponse, CaseListQuery, CompleteRequest, CreateCaseRequest,
    EvaluationResponse, FindMatchesQuery, HealthResponse, LocationReportRequest,
    RegisterVolunteerRequest, RegisterZoneRequest, RespondRequest, RoundResponse, SosRequest,
    SubjectGeofencesResponse, TransitionRequest, VolunteerLocationRequest, WorkflowRequest,
    WorkflowResponse,
};
use crate::services::{AssignmentRequest, FindOptions};
use crate::AppState;

/// Actor recorded when a request does not name one.
const DEFAULT_ACTOR: &str = "api";

// ============================================
// RESPONSE HELPERS
// ============================================

/// HTTP status for a service error.
pub fn error_status(err: &DispatchError) -> StatusCode {
    match err {
        DispatchError::Validation { .. } => StatusCode::BAD_REQUEST,
        DispatchError::NotFound { .. } => StatusCode::NOT_FOUND,
        DispatchError::InvalidTransition { .. }
        | DispatchError::InvalidState { .. }
        | DispatchError::CapacityExceeded { .. }
        | DispatchError::Unavailable { .. } => StatusCode::CONFLICT,
        DispatchError::DependencyFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn error_response(err: DispatchError) -> HttpResponse {
    let status = error_status(&err);
    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        warn!("Request rejected: {}", err);
    }
    HttpResponse::build(status).json(ApiResponse::<()>::error(err.code(), &err.to_string()))
}

fn respond<T: Serialize>(result: Result<T, DispatchError>) -> HttpResponse {
    match result {
        Ok(data) => HttpResponse::Ok().json(ApiResponse::success(data)),
        Err(e) => error_response(e),
    }
}

fn created<T: Serialize>(result: Result<T, DispatchError>) -> HttpResponse {
    match result {
        Ok(data) => HttpResponse::Created().json(ApiResponse::success(data)),
        Err(e) => error_response(e),
    }
}

fn actor_or_default(actor: Option<String>) -> String {
    actor
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ACTOR.to_string())
}

fn parse_label<T: FromStr<Err = String>>(field: &str, value: &str) -> Result<T, DispatchError> {
    value
        .parse()
        .map_err(|e: String| DispatchError::validation(vec![field.to_string()], e))
}

// ============================================
// SERVICE INFO
// ============================================

/// API information endpoint (root).
///
/// `GET /`
pub async fn api_info() -> HttpResponse {
    let info = json!({
        "name": "Dispatch API",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Case-volunteer dispatch and geofence alerting",
        "websocket": "/ws/{target}",
        "resources": ["/cases", "/sos", "/geofences", "/locations", "/volunteers", "/matches"],
    });

    HttpResponse::Ok().json(ApiResponse::success(info))
}

/// Health check endpoint.
///
/// `GET /health`
///
/// ```bash
/// curl http://127.0.0.1:8080/health
/// ```
///
/// Returns 503 when the store cannot be reached.
pub async fn health_check(state: web::Data<Arc<AppState>>) -> HttpResponse {
    let store_healthy = state.store.get("health:probe").await.is_ok();

    let response = HealthResponse {
        status: if store_healthy { "healthy" } else { "unhealthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store: state.store_kind.to_string(),
        websocket_connections: state.ws_registry.total_connections().await,
        timestamp: Utc::now(),
    };

    let status_code = if store_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    HttpResponse::build(status_code).json(ApiResponse::success(response))
}

// ============================================
// CASES
// ============================================

/// Open a case.
///
/// `POST /cases`
///
/// ```bash
/// curl -X POST http://127.0.0.1:8080/cases \
///   -H "Content-Type: application/json" \
///   -d '{
///     "title": "Missing: Mr. Chen",
///     "description": "Left the day center at 14:00",
///     "priority": "critical",
///     "location": { "lat": 24.8067, "lng": 120.9687 }
///   }'
/// ```
///
/// `high` and `critical` cases come back with the matching round that ran
/// for them.
pub async fn create_case(
    state: web::Data<Arc<AppState>>,
    body: web::Json<CreateCaseRequest>,
) -> HttpResponse {
    let req = body.into_inner();
    let actor = actor_or_default(req.actor.clone());

    let result = state
        .orchestrator
        .create_case(req.into(), &actor)
        .await
        .map(CaseCreatedResponse::from);
    if let Ok(response) = &result {
        info!("Case {} opened via API", response.case.id);
    }
    created(result)
}

/// `GET /cases?status=dispatched`
pub async fn list_cases(
    state: web::Data<Arc<AppState>>,
    query: web::Query<CaseListQuery>,
) -> HttpResponse {
    let status = match query.status.as_deref() {
        Some(label) => match parse_label::<CaseStatus>("status", label) {
            Ok(status) => Some(status),
            Err(e) => return error_response(e),
        },
        None => None,
    };
    respond(state.cases.list(status).await)
}

/// `GET /cases/{id}`
pub async fn get_case(state: web::Data<Arc<AppState>>, path: web::Path<Uuid>) -> HttpResponse {
    respond(state.cases.get(path.into_inner()).await)
}

/// Move a case to another status.
///
/// `POST /cases/{id}/transition`
///
/// Illegal moves answer 409 with the allowed targets in the message.
pub async fn transition_case(
    state: web::Data<Arc<AppState>>,
    path: web::Path<Uuid>,
    body: web::Json<TransitionRequest>,
) -> HttpResponse {
    let req = body.into_inner();
    let to = match parse_label::<CaseStatus>("status", &req.status) {
        Ok(to) => to,
        Err(e) => return error_response(e),
    };
    let actor = actor_or_default(req.actor);
    respond(
        state
            .orchestrator
            .transition_case(path.into_inner(), to, &actor, req.reason)
            .await,
    )
}

/// `POST /cases/{id}/assign`
pub async fn assign_case(
    state: web::Data<Arc<AppState>>,
    path: web::Path<Uuid>,
    body: web::Json<AssignCaseRequest>,
) -> HttpResponse {
    let req = body.into_inner();
    let actor = actor_or_default(req.actor);
    respond(
        state
            .cases
            .assign(path.into_inner(), &req.assignee_id, &actor)
            .await,
    )
}

/// `POST /cases/{id}/workflow`
pub async fn advance_workflow(
    state: web::Data<Arc<AppState>>,
    path: web::Path<Uuid>,
    body: web::Json<WorkflowRequest>,
) -> HttpResponse {
    let req = body.into_inner();
    let stage = match parse_label::<WorkflowStage>("stage", &req.stage) {
        Ok(stage) => stage,
        Err(e) => return error_response(e),
    };
    let actor = actor_or_default(req.actor);
    respond(
        state
            .cases
            .advance_workflow(path.into_inner(), stage, &actor, req.reason)
            .await
            .map(WorkflowResponse::from),
    )
}

/// Subject pressed the emergency button.
///
/// `POST /sos`
///
/// ```json
/// { "subjectId": "p-1", "lat": 24.8067, "lng": 120.9687 }
/// ```
pub async fn raise_sos(
    state: web::Data<Arc<AppState>>,
    body: web::Json<SosRequest>,
) -> HttpResponse {
    let req = body.into_inner();
    warn!("SOS from subject {}", req.subject_id);
    created(
        state
            .orchestrator
            .raise_sos(&req.subject_id, req.lat, req.lng, &req.subject_id)
            .await
            .map(CaseCreatedResponse::from),
    )
}

// ============================================
// MATCHING
// ============================================

/// Ranked candidates without assigning anyone.
///
/// `GET /cases/{id}/candidates?limit=5&exclude=v-1,v-2`
pub async fn find_candidates(
    state: web::Data<Arc<AppState>>,
    path: web::Path<Uuid>,
    query: web::Query<FindMatchesQuery>,
) -> HttpResponse {
    let query = query.into_inner();
    let options = FindOptions {
        limit: query.limit,
        exclude: query
            .exclude
            .map(|ids| {
                ids.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
    };

    respond(
        state
            .matcher
            .find_matches(path.into_inner(), options)
            .await
            .map(|candidates| {
                candidates
                    .into_iter()
                    .map(CandidateResponse::from)
                    .collect::<Vec<_>>()
            }),
    )
}

/// `GET /cases/{id}/matches`
pub async fn list_case_matches(
    state: web::Data<Arc<AppState>>,
    path: web::Path<Uuid>,
) -> HttpResponse {
    respond(state.matcher.matches_for_case(path.into_inner()).await)
}

/// Assign a volunteer by hand.
///
/// `POST /cases/{id}/matches`
///
/// ```json
/// { "volunteerId": "v-17", "role": "driver", "actor": "coordinator-3" }
/// ```
pub async fn assign_volunteer(
    state: web::Data<Arc<AppState>>,
    path: web::Path<Uuid>,
    body: web::Json<AssignVolunteerRequest>,
) -> HttpResponse {
    let req = body.into_inner();
    let mut request = AssignmentRequest::by(actor_or_default(req.actor));
    request.role = req.role;
    request.estimated_arrival = req.estimated_arrival;

    created(
        state
            .matcher
            .assign_volunteer(path.into_inner(), &req.volunteer_id, request)
            .await,
    )
}

/// Run a matching round for a case right away.
///
/// `POST /cases/{id}/round`
pub async fn run_round(state: web::Data<Arc<AppState>>, path: web::Path<Uuid>) -> HttpResponse {
    respond(
        state
            .matcher
            .run_round(path.into_inner(), RoundTrigger::Manual)
            .await
            .map(RoundResponse::from),
    )
}

/// `GET /matches/{id}`
pub async fn get_match(state: web::Data<Arc<AppState>>, path: web::Path<Uuid>) -> HttpResponse {
    respond(state.matcher.get_match(path.into_inner()).await)
}

/// Volunteer accepts or rejects an assignment.
///
/// `POST /matches/{id}/respond`
///
/// A rejection starts a new matching round for the case.
pub async fn respond_to_match(
    state: web::Data<Arc<AppState>>,
    path: web::Path<Uuid>,
    body: web::Json<RespondRequest>,
) -> HttpResponse {
    let req = body.into_inner();
    respond(
        state
            .matcher
            .respond_to_assignment(path.into_inner(), req.accepted, req.reason)
            .await,
    )
}

/// `POST /matches/{id}/complete`
pub async fn complete_match(
    state: web::Data<Arc<AppState>>,
    path: web::Path<Uuid>,
    body: web::Json<CompleteRequest>,
) -> HttpResponse {
    respond(
        state
            .matcher
            .complete_assignment(path.into_inner(), body.into_inner().into())
            .await,
    )
}

// ============================================
// VOLUNTEERS
// ============================================

/// Register a volunteer or update their profile.
///
/// `POST /volunteers`
pub async fn register_volunteer(
    state: web::Data<Arc<AppState>>,
    body: web::Json<RegisterVolunteerRequest>,
) -> HttpResponse {
    respond(
        state
            .matcher
            .register_volunteer(body.into_inner().into())
            .await,
    )
}

/// `GET /volunteers/{id}`
pub async fn get_volunteer(
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> HttpResponse {
    respond(state.matcher.get_volunteer(&path.into_inner()).await)
}

/// `POST /volunteers/{id}/location`
pub async fn update_volunteer_location(
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
    body: web::Json<VolunteerLocationRequest>,
) -> HttpResponse {
    respond(
        state
            .matcher
            .update_location(&path.into_inner(), body.lat, body.lng)
            .await,
    )
}

// ============================================
// GEOFENCES
// ============================================

/// Register a zone for a subject.
///
/// `POST /geofences`
pub async fn register_zone(
    state: web::Data<Arc<AppState>>,
    body: web::Json<RegisterZoneRequest>,
) -> HttpResponse {
    created(state.geofence.register_zone(body.into_inner().into()).await)
}

/// `GET /geofences/{id}`
pub async fn get_zone(state: web::Data<Arc<AppState>>, path: web::Path<Uuid>) -> HttpResponse {
    respond(state.geofence.get_zone(path.into_inner()).await)
}

/// `POST /geofences/{id}/deactivate`
pub async fn deactivate_zone(
    state: web::Data<Arc<AppState>>,
    path: web::Path<Uuid>,
) -> HttpResponse {
    respond(state.geofence.deactivate_zone(path.into_inner()).await)
}

/// `GET /subjects/{id}/geofences`
pub async fn subject_geofences(
    state: web::Data<Arc<AppState>>,
    path: web::Path<String>,
) -> HttpResponse {
    let subject_id = path.into_inner();
    let result = async {
        let zones = state.geofence.zones_for_subject(&subject_id).await?;
        let statuses = state.geofence.statuses_for_subject(&subject_id).await?;
        Ok::<_, DispatchError>(SubjectGeofencesResponse {
            subject_id: subject_id.clone(),
            zones,
            statuses,
        })
    }
    .await;
    respond(result)
}

/// Report a subject's position.
///
/// `POST /locations`
///
/// ```json
/// { "subjectId": "p-1", "lat": 24.8167, "lng": 120.9687 }
/// ```
///
/// Returns the updated zone statuses and any crossing that fired.
pub async fn report_location(
    state: web::Data<Arc<AppState>>,
    body: web::Json<LocationReportRequest>,
) -> HttpResponse {
    let req = body.into_inner();
    respond(
        state
            .orchestrator
            .report_location(&req.subject_id, req.lat, req.lng)
            .await
            .map(EvaluationResponse::from),
    )
}

/// No-movement check over a subject's recent fixes.
///
/// `POST /locations/anomaly-check`
///
/// `data` is `null` when the subject moved.
pub async fn anomaly_check(
    state: web::Data<Arc<AppState>>,
    body: web::Json<AnomalyCheckRequest>,
) -> HttpResponse {
    let req = body.into_inner();
    respond(
        state
            .orchestrator
            .check_movement(&req.subject_id, &req.history, req.threshold_minutes)
            .await,
    )
}

#[cfg(test)]
mod tests {
    use actix_web::{test as actix_test, App};
    use serde_json::Value;

    use super::*;
    use crate::api::configure_routes;
    use crate::services::testkit::Harness;
    use crate::websocket::WsRegistry;

    fn app_state(h: &Harness) -> Arc<AppState> {
        Arc::new(AppState {
            config: h.config.clone(),
            store: h.store.clone(),
            store_kind: "memory",
            events: h.events.clone(),
            ws_registry: WsRegistry::new(),
            cases: h.cases.clone(),
            matcher: h.matcher.clone(),
            geofence: h.geofence.clone(),
            orchestrator: h.orchestrator.clone(),
        })
    }

    fn case_body() -> Value {
        json!({
            "title": "Missing: Mr. Chen",
            "description": "Left the day center at 14:00",
            "priority": "medium",
            "location": { "lat": 24.8067, "lng": 120.9687 }
        })
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_status(&DispatchError::validation(vec!["title".into()], "missing")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&DispatchError::not_found("case", "x")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&DispatchError::CapacityExceeded {
                case_id: Uuid::nil(),
                cap: 10
            }),
            StatusCode::CONFLICT
        );
    }

    #[actix_rt::test]
    async fn test_create_case_reports_missing_fields() {
        let h = Harness::new();
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(app_state(&h)))
                .configure(configure_routes),
        )
        .await;

        let req = actix_test::TestRequest::post()
            .uri("/cases")
            .set_json(json!({ "title": "Missing" }))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let body: Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        let message = body["error"]["message"].as_str().unwrap();
        assert!(message.contains("description"));
        assert!(message.contains("location"));
    }

    #[actix_rt::test]
    async fn test_illegal_transition_is_conflict() {
        let h = Harness::new();
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(app_state(&h)))
                .configure(configure_routes),
        )
        .await;

        let req = actix_test::TestRequest::post()
            .uri("/cases")
            .set_json(case_body())
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: Value = actix_test::read_body_json(resp).await;
        let id = body["data"]["case"]["id"].as_str().unwrap().to_string();
        assert_eq!(body["data"]["case"]["status"], "created");

        let req = actix_test::TestRequest::post()
            .uri(&format!("/cases/{}/transition", id))
            .set_json(json!({ "status": "resolved" }))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body: Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["error"]["code"], "INVALID_TRANSITION");

        let req = actix_test::TestRequest::post()
            .uri(&format!("/cases/{}/transition", id))
            .set_json(json!({ "status": "sideways" }))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_rt::test]
    async fn test_unknown_case_is_not_found() {
        let h = Harness::new();
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(app_state(&h)))
                .configure(configure_routes),
        )
        .await;

        let req = actix_test::TestRequest::get()
            .uri(&format!("/cases/{}", Uuid::new_v4()))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_rt::test]
    async fn test_health_reports_memory_store() {
        let h = Harness::new();
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(app_state(&h)))
                .configure(configure_routes),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/health").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["data"]["status"], "healthy");
        assert_eq!(body["data"]["store"], "memory");
        assert_eq!(body["data"]["websocketConnections"], 0);
    }

    #[actix_rt::test]
    async fn test_cancel_frees_volunteers_without_listener() {
        let h = Harness::new();
        h.volunteer_at("v-1", 24.8067, 120.9687, 4.5).await;
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(app_state(&h)))
                .configure(configure_routes),
        )
        .await;

        let mut body = case_body();
        body["priority"] = json!("high");
        let req = actix_test::TestRequest::post()
            .uri("/cases")
            .set_json(body)
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        let body: Value = actix_test::read_body_json(resp).await;
        let id = body["data"]["case"]["id"].as_str().unwrap().to_string();
        assert_eq!(body["data"]["round"]["assigned"].as_array().unwrap().len(), 1);

        let req = actix_test::TestRequest::post()
            .uri(&format!("/cases/{}/transition", id))
            .set_json(json!({ "status": "cancelled" }))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        // No orchestrator listener runs here; the request path itself releases.
        let v = h.matcher.get_volunteer("v-1").await.unwrap();
        assert_eq!(v.status, crate::db::VolunteerStatus::Available);
        assert!(v.current_matches.is_empty());
    }
}
