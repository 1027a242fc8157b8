//! # REST API Module
//!
//! This module defines all HTTP endpoints for the dispatch service. The
//! handlers are thin: they parse input, call one service and wrap the
//! result.
//!
//! ## Endpoint Overview
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | POST | `/cases` | Open a case |
//! | GET | `/cases` | List cases (`?status=`) |
//! | GET | `/cases/:id` | Get a case |
//! | POST | `/cases/:id/transition` | Change case status |
//! | POST | `/cases/:id/assign` | Hand a case to a case worker |
//! | POST | `/cases/:id/workflow` | Advance the workflow stage |
//! | GET | `/cases/:id/candidates` | Ranked volunteers for a case |
//! | GET | `/cases/:id/matches` | Assignments on a case |
//! | POST | `/cases/:id/matches` | Assign a volunteer by hand |
//! | POST | `/cases/:id/round` | Run a matching round now |
//! | POST | `/sos` | Subject pressed SOS |
//! | POST | `/geofences` | Register a zone |
//! | GET | `/geofences/:id` | Get a zone |
//! | POST | `/geofences/:id/deactivate` | Stop monitoring a zone |
//! | GET | `/subjects/:id/geofences` | Zones and statuses of a subject |
//! | POST | `/locations` | Report a subject's position |
//! | POST | `/locations/anomaly-check` | No-movement check |
//! | POST | `/volunteers` | Register a volunteer |
//! | GET | `/volunteers/:id` | Get a volunteer |
//! | POST | `/volunteers/:id/location` | Update a volunteer's position |
//! | GET | `/matches/:id` | Get an assignment |
//! | POST | `/matches/:id/respond` | Accept or reject |
//! | POST | `/matches/:id/complete` | Close an accepted assignment |
//! | GET | `/health` | Health check |
//!
//! ## Request/Response Format
//!
//! All requests and responses use JSON:
//!
//! ```json
//! // Success response
//! {
//!     "success": true,
//!     "data": { ... }
//! }
//!
//! // Error response
//! {
//!     "success": false,
//!     "error": {
//!         "code": "INVALID_TRANSITION",
//!         "message": "Invalid transition from dispatched to assigned (allowed: [in_progress, resolved, cancelled])"
//!     }
//! }
//! ```
//!
//! ## Status Codes
//!
//! | Error code | HTTP |
//! |------------|------|
//! | `VALIDATION_ERROR` | 400 |
//! | `NOT_FOUND` | 404 |
//! | `INVALID_TRANSITION`, `INVALID_STATE`, `CAPACITY_EXCEEDED`, `UNAVAILABLE` | 409 |
//! | `DEPENDENCY_FAILURE` | 503 |

pub mod routes;
pub mod handlers;

pub use routes::configure_routes;
