//! # API Route Configuration
//!
//! This module sets up all the HTTP routes for the API.

use actix_web::web;

use super::handlers;

/// Configure all API routes.
///
/// ## Route Structure
///
/// ```text
/// /
/// ├── /health                        GET
/// ├── /sos                           POST
/// ├── /cases                         GET, POST
/// │   └── /{id}                      GET
/// │       ├── /transition            POST
/// │       ├── /assign                POST
/// │       ├── /workflow              POST
/// │       ├── /candidates            GET
/// │       ├── /matches               GET, POST
/// │       └── /round                 POST
/// ├── /geofences                     POST
/// │   └── /{id}                      GET
/// │       └── /deactivate            POST
/// ├── /subjects/{id}/geofences       GET
/// ├── /locations                     POST
/// │   └── /anomaly-check             POST
/// ├── /volunteers                    POST
/// │   └── /{id}                      GET
/// │       └── /location              POST
/// └── /matches/{id}                  GET
///     ├── /respond                   POST
///     └── /complete                  POST
/// ```
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg
        .route("/", web::get().to(handlers::api_info))
        .route("/health", web::get().to(handlers::health_check))

        // Subject-side emergency button
        .route("/sos", web::post().to(handlers::raise_sos))

        .service(
            web::scope("/cases")
                .route("", web::post().to(handlers::create_case))
                .route("", web::get().to(handlers::list_cases))
                .route("/{id}", web::get().to(handlers::get_case))
                .route("/{id}/transition", web::post().to(handlers::transition_case))
                .route("/{id}/assign", web::post().to(handlers::assign_case))
                .route("/{id}/workflow", web::post().to(handlers::advance_workflow))
                .route("/{id}/candidates", web::get().to(handlers::find_candidates))
                .route("/{id}/matches", web::get().to(handlers::list_case_matches))
                .route("/{id}/matches", web::post().to(handlers::assign_volunteer))
                .route("/{id}/round", web::post().to(handlers::run_round)),
        )

        .service(
            web::scope("/geofences")
                .route("", web::post().to(handlers::register_zone))
                .route("/{id}", web::get().to(handlers::get_zone))
                .route("/{id}/deactivate", web::post().to(handlers::deactivate_zone)),
        )
        .route(
            "/subjects/{id}/geofences",
            web::get().to(handlers::subject_geofences),
        )

        .service(
            web::scope("/locations")
                .route("", web::post().to(handlers::report_location))
                .route("/anomaly-check", web::post().to(handlers::anomaly_check)),
        )

        .service(
            web::scope("/volunteers")
                .route("", web::post().to(handlers::register_volunteer))
                .route("/{id}", web::get().to(handlers::get_volunteer))
                .route("/{id}/location", web::post().to(handlers::update_volunteer_location)),
        )

        .service(
            web::scope("/matches")
                .route("/{id}", web::get().to(handlers::get_match))
                .route("/{id}/respond", web::post().to(handlers::respond_to_match))
                .route("/{id}/complete", web::post().to(handlers::complete_match)),
        );
}
