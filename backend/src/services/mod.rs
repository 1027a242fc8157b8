//! # Services Module
//!
//! This module contains the dispatch engine itself. Each service handles
//! a specific domain; the orchestrator and the monitor tie them together.
//!
//! ## Services Overview
//!
//! | Service | Responsibility |
//! |---------|---------------|
//! | `GeofenceMonitor` | Zone evaluation, enter/exit events, no-movement detection |
//! | `CaseManager` | Case state machine, workflow stage, retention purge |
//! | `MatchingEngine` | Volunteer scoring, assignment lifecycle, matching rounds |
//! | `DispatchOrchestrator` | Event wiring, SOS, case intake |
//! | `DispatchMonitor` | Periodic sweeps |
//!
//! ## Service Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        SERVICES LAYER                            │
//! │                                                                  │
//! │  ┌──────────────────────────────────────────────────────────┐   │
//! │  │                 DispatchOrchestrator                      │   │
//! │  │  • create_case()  • raise_sos()  • report_location()     │   │
//! │  │  • run(): geofence + case event listener                  │   │
//! │  │  • transition_case(): frees volunteers on close           │   │
//! │  └──────────────────────────────────────────────────────────┘   │
//! │                              │                                   │
//! │         ┌────────────────────┼────────────────────┐             │
//! │         ▼                    ▼                    ▼             │
//! │  ┌────────────┐      ┌────────────┐       ┌────────────┐       │
//! │  │ Geofence   │      │   Case     │<──────│  Matching  │       │
//! │  │ Monitor    │      │  Manager   │       │  Engine    │       │
//! │  │            │      │            │       │            │       │
//! │  │ Enter/Exit │      │ Transitions│       │ Score      │       │
//! │  │ Anomalies  │      │ Retention  │       │ Assign     │       │
//! │  └────────────┘      └────────────┘       └────────────┘       │
//! │                              ▲                    ▲             │
//! │                              └─── DispatchMonitor ┘             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod case_manager;
pub mod dispatch_monitor;
pub mod geofence_monitor;
pub mod orchestrator;
pub mod volunteer_matcher;

pub use case_manager::{CaseManager, NewCase};
pub use dispatch_monitor::DispatchMonitor;
pub use geofence_monitor::{GeofenceMonitor, NewZone};
pub use orchestrator::DispatchOrchestrator;
pub use volunteer_matcher::{AssignmentRequest, FindOptions, MatchingEngine, NewVolunteer};

/// Fully wired services over an in-memory store, for tests.
#[cfg(test)]
pub(crate) mod testkit {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::config::AppConfig;
    use crate::db::{
        Case, CaseLocation, CasePriority, CaseStatus, ContactInfo, GeoPoint, MemoryStore,
        SharedStore, Store, StoreError, Volunteer,
    };
    use crate::events::EventBus;
    use crate::notify::{Auditor, RecordingNotifier, StoreAuditSink};
    use crate::utils::KeyedLocks;

    pub struct Harness {
        pub config: AppConfig,
        pub store: SharedStore,
        pub events: EventBus,
        pub notifier: RecordingNotifier,
        pub cases: CaseManager,
        pub matcher: MatchingEngine,
        pub geofence: GeofenceMonitor,
        pub orchestrator: DispatchOrchestrator,
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_config(AppConfig::default())
        }

        pub fn with_config(config: AppConfig) -> Self {
            Self::with_store(config, Arc::new(MemoryStore::new()))
        }

        pub fn with_store(config: AppConfig, store: SharedStore) -> Self {
            let events = EventBus::default();
            let locks = KeyedLocks::new();
            let notifier = RecordingNotifier::default();
            let auditor = Auditor::new(Arc::new(StoreAuditSink::new(store.clone())));

            let cases = CaseManager::new(
                store.clone(),
                locks.clone(),
                events.clone(),
                Arc::new(notifier.clone()),
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
                Arc::new(notifier.clone()),
                cases.clone(),
                matcher.clone(),
                geofence.clone(),
                &config,
            );

            Self {
                config,
                store,
                events,
                notifier,
                cases,
                matcher,
                geofence,
                orchestrator,
            }
        }

        pub async fn volunteer_at(&self, id: &str, lat: f64, lng: f64, rating: f64) -> Volunteer {
            self.matcher
                .register_volunteer(NewVolunteer {
                    id: id.to_string(),
                    location: Some(GeoPoint::new(lat, lng)),
                    rating: Some(rating),
                    ..Default::default()
                })
                .await
                .unwrap()
        }

        /// A case walked through created -> assigned -> dispatched.
        pub async fn dispatched_case(&self, priority: CasePriority) -> Case {
            let case = self
                .cases
                .create(case_data(Some(priority), 24.8, 120.9), "worker")
                .await
                .unwrap();
            self.cases.assign(case.id, "worker", "worker").await.unwrap();
            self.cases
                .transition(case.id, CaseStatus::Dispatched, "worker", None)
                .await
                .unwrap()
        }

        /// An in-memory case already in `status`, never persisted.
        pub fn bare_case(status: CaseStatus) -> Case {
            let mut case = futures::executor::block_on(async {
                Harness::new()
                    .cases
                    .create(case_data(None, 24.8, 120.9), "worker")
                    .await
                    .unwrap()
            });
            case.status = status;
            case
        }
    }

    /// In-memory store whose writes can be slowed down or failed by key
    /// prefix.
    #[derive(Default)]
    pub struct FaultyStore {
        inner: MemoryStore,
        slow_puts: Mutex<Option<(String, Duration)>>,
        /// Prefix plus the number of matching writes still let through.
        failing_puts: Mutex<Option<(String, usize)>>,
    }

    impl FaultyStore {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Delay every `put` whose key starts with `prefix`.
        pub fn slow_puts(&self, prefix: &str, delay: Duration) {
            *self.slow_puts.lock().unwrap() = Some((prefix.to_string(), delay));
        }

        /// Fail every `put` whose key starts with `prefix`.
        pub fn fail_puts(&self, prefix: &str) {
            self.fail_puts_after(prefix, 0);
        }

        /// Let `allowed` more writes under `prefix` through, then fail the
        /// rest.
        pub fn fail_puts_after(&self, prefix: &str, allowed: usize) {
            *self.failing_puts.lock().unwrap() = Some((prefix.to_string(), allowed));
        }

        pub fn heal(&self) {
            *self.slow_puts.lock().unwrap() = None;
            *self.failing_puts.lock().unwrap() = None;
        }
    }

    #[async_trait]
    impl Store for FaultyStore {
        async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: Value) -> Result<(), StoreError> {
            let delay = self
                .slow_puts
                .lock()
                .unwrap()
                .as_ref()
                .filter(|(prefix, _)| key.starts_with(prefix.as_str()))
                .map(|(_, delay)| *delay);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let failing = match self.failing_puts.lock().unwrap().as_mut() {
                Some((prefix, allowed)) if key.starts_with(prefix.as_str()) => {
                    if *allowed == 0 {
                        true
                    } else {
                        *allowed -= 1;
                        false
                    }
                }
                _ => false,
            };
            if failing {
                return Err(StoreError::ConnectionError(format!("write to {} refused", key)));
            }
            self.inner.put(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }

        async fn scan(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
            self.inner.scan(prefix).await
        }
    }

    pub fn case_data(priority: Option<CasePriority>, lat: f64, lng: f64) -> NewCase {
        NewCase {
            title: Some("Missing: elderly man".to_string()),
            description: Some("Left home this morning, may be confused".to_string()),
            priority,
            location: Some(CaseLocation {
                lat,
                lng,
                address: Some("12 Elm St".to_string()),
                area: Some("East District".to_string()),
                radius: None,
            }),
            contact_info: Some(ContactInfo {
                name: Some("Jane".to_string()),
                phone: Some("+1-555-0100".to_string()),
                email: None,
                relationship: Some("daughter".to_string()),
            }),
            subject_description: Some("Grey coat, walks with a cane".to_string()),
            subject_id: None,
        }
    }
}
