//! # Dispatch Backend Service
//!
//! This is the main entry point for the case-volunteer dispatch and
//! geofence alerting service. It provides:
//!
//! - REST API for cases, zones, volunteers and assignments
//! - WebSocket connections for alerts and live events
//! - Background services for matching sweeps, assignment timeouts and
//!   retention purges
//! - PostgreSQL or in-memory storage for every record
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        BACKEND SERVICE                           │
//! │                                                                  │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │  REST API   │  │  WebSocket  │  │   Background Services   │  │
//! │  │  (Actix)    │  │  Server     │  │  • Dispatch Monitor     │  │
//! │  │             │  │             │  │  • Orchestrator         │  │
//! │  │  /cases     │  │  /ws/{id}   │  │  • Event bridge         │  │
//! │  │  /sos       │  │             │  │                         │  │
//! │  │  /locations │  │             │  │                         │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘  │
//! │         │                ▲                     │                 │
//! │         └────────────────┼─────────────────────┘                 │
//! │                          │ events                                │
//! │  ┌───────────────────────┴───────────────────────────────────┐  │
//! │  │                    SERVICE LAYER                           │  │
//! │  │  ┌────────────┐ ┌────────────┐ ┌────────────┐             │  │
//! │  │  │CaseManager │ │Matching    │ │Geofence    │             │  │
//! │  │  │            │ │Engine      │ │Monitor     │             │  │
//! │  │  └────────────┘ └────────────┘ └────────────┘             │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                          │                                       │
//! │                   ┌──────┴──────┐                                │
//! │                   │  PostgreSQL │  (or in-memory)                │
//! │                   └─────────────┘                                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! 1. Optionally set `DATABASE_URL`; without it records live in memory
//! 2. Start the server: `cargo run`
//! 3. Connect a console: `ws://127.0.0.1:8080/ws/console`
//!
//! ## Environment Variables
//!
//! See [`config::AppConfig`] for every variable and its default.

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod api;
mod config;
mod db;
mod errors;
mod events;
mod models;
mod notify;
mod services;
mod utils;
mod websocket;

use config::AppConfig;
use db::{MemoryStore, PgStore, SharedStore};
use events::EventBus;
use notify::{Auditor, SharedNotifier, StoreAuditSink, WsNotifier};
use services::{
    CaseManager, DispatchMonitor, DispatchOrchestrator, GeofenceMonitor, MatchingEngine,
};
use utils::KeyedLocks;
use websocket::WsRegistry;

/// Application state shared across all handlers.
///
/// Every service is cheap to clone; they share the store, the lock
/// registry and the event bus underneath.
pub struct AppState {
    /// Application configuration
    pub config: AppConfig,

    /// Persistence backend
    pub store: SharedStore,

    /// `postgres` or `memory`, reported by `/health`
    pub store_kind: &'static str,

    /// Typed event channels
    pub events: EventBus,

    /// WebSocket connection registry for alerts and live events
    pub ws_registry: WsRegistry,

    pub cases: CaseManager,
    pub matcher: MatchingEngine,
    pub geofence: GeofenceMonitor,
    pub orchestrator: DispatchOrchestrator,
}

/// Main entry point for the backend service.
///
/// This function:
/// 1. Loads configuration from environment
/// 2. Connects the store
/// 3. Wires the services together
/// 4. Starts background tasks
/// 5. Launches the HTTP server
#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // =========================================
    // STEP 1: Initialize Logging
    // =========================================
    // RUST_LOG overrides the default level, e.g. RUST_LOG=debug,audit=info
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    info!("🚀 Starting Dispatch Backend Service");

    // =========================================
    // STEP 2: Load Configuration
    // =========================================
    dotenvy::dotenv().ok(); // It's okay if .env doesn't exist

    let config = AppConfig::from_env().expect("Failed to load configuration");

    info!("📋 Configuration loaded");
    info!("   Max volunteers per case: {}", config.max_volunteers_per_case);
    info!("   Auto-assign: {}", config.auto_assign);
    match config.assignment_timeout {
        Some(secs) => info!("   Assignment timeout: {}s", secs),
        None => info!("   Assignment timeout: disabled"),
    }

    // =========================================
    // STEP 3: Initialize Store
    // =========================================
    let (store, store_kind): (SharedStore, &'static str) = match &config.database_url {
        Some(url) => {
            let pg = PgStore::connect(url)
                .await
                .expect("Failed to connect to database");
            info!("🗄️  Database connected");

            pg.run_migrations()
                .await
                .expect("Failed to run migrations");
            info!("📦 Database migrations complete");

            (Arc::new(pg), "postgres")
        }
        None => {
            info!("🗄️  DATABASE_URL not set, keeping records in memory");
            (Arc::new(MemoryStore::new()), "memory")
        }
    };

    // =========================================
    // STEP 4: Initialize WebSocket Registry and Event Bus
    // =========================================
    let ws_registry = WsRegistry::new();
    let events = EventBus::default();
    info!("🔌 WebSocket registry and event bus initialized");

    // =========================================
    // STEP 5: Initialize Services
    // =========================================
    let locks = KeyedLocks::new();
    let notifier: SharedNotifier = Arc::new(WsNotifier::new(ws_registry.clone()));
    let auditor = Auditor::new(Arc::new(StoreAuditSink::new(store.clone())));

    let cases = CaseManager::new(
        store.clone(),
        locks.clone(),
        events.clone(),
        notifier.clone(),
        auditor.clone(),
        &config,
    );
    let matcher = MatchingEngine::new(
        store.clone(),
        locks.clone(),
        events.clone(),
        auditor,
        cases.clone(),
        &config,
    );
    let geofence = GeofenceMonitor::new(store.clone(), events.clone(), locks, &config);
    let orchestrator = DispatchOrchestrator::new(
        store.clone(),
        events.clone(),
        notifier,
        cases.clone(),
        matcher.clone(),
        geofence.clone(),
        &config,
    );

    info!("🔧 Services initialized");

    // =========================================
    // STEP 6: Create Application State
    // =========================================
    let app_state = Arc::new(AppState {
        config: config.clone(),
        store,
        store_kind,
        events,
        ws_registry,
        cases,
        matcher,
        geofence,
        orchestrator,
    });

    // =========================================
    // STEP 7: Start Background Services
    // =========================================
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = app_state.orchestrator.clone();
    let listener_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        listener.run(listener_shutdown).await;
    });
    info!("🧭 Dispatch orchestrator started");

    let monitor = DispatchMonitor::new(
        app_state.matcher.clone(),
        app_state.cases.clone(),
        &app_state.config,
    );
    let monitor_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        monitor.start(monitor_shutdown).await;
    });
    info!("👁️  Dispatch monitor started");

    tokio::spawn(websocket::run_event_bridge(
        app_state.events.clone(),
        app_state.ws_registry.clone(),
        shutdown_rx,
    ));
    info!("📡 Event bridge started");

    // =========================================
    // STEP 8: Start HTTP Server
    // =========================================
    let server_host = config.server_host.clone();
    let server_port = config.server_port;

    info!("🌐 Starting HTTP server on {}:{}", server_host, server_port);

    let server_state = app_state.clone();
    let result = HttpServer::new(move || {
        App::new()
            // Attach shared application state
            .app_data(web::Data::new(server_state.clone()))

            // Browser consoles run on another origin
            .wrap(Cors::permissive())

            // Add logging middleware
            .wrap(middleware::Logger::default())

            // Configure API routes
            .configure(api::configure_routes)

            // Configure WebSocket routes
            .configure(websocket::configure_routes)
    })
    .bind(format!("{}:{}", server_host, server_port))?
    .run()
    .await;

    // =========================================
    // STEP 9: Stop Background Services
    // =========================================
    info!("🛑 HTTP server stopped, shutting down background services");
    let _ = shutdown_tx.send(true);

    result
}
