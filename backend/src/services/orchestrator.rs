//! # Dispatch Orchestrator
//!
//! Wires the components together:
//!
//! ```text
//! GeofenceMonitor ──geofence_exit──────> notify contacts, escalate / open case
//!                 ──geofence_enter─────> notify contacts
//!                 ──anomaly_detected───> notify contacts
//!
//! CaseManager ─────case dispatched─────> MatchingEngine::run_round
//!             ─────case_closed─────────> MatchingEngine::release_case
//! ```
//!
//! It also owns the entry points that span several components (case
//! intake with an immediate round, status changes, SOS, location reports).
//!
//! Closing a case releases its volunteers on the calling path; the
//! `case_closed` listener and the monitor's reconcile pass only catch what
//! that path missed.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::{queries, Case, CaseLocation, CasePriority, CaseStatus, LocationSample, SharedStore};
use crate::errors::DispatchError;
use crate::events::{Anomaly, CaseChange, CaseEvent, EventBus, GeofenceCrossing, GeofenceEvent, RoundTrigger};
use crate::notify::{notify_best_effort, Alert, AlertType, SharedNotifier};
use crate::services::case_manager::{CaseManager, NewCase};
use crate::services::geofence_monitor::{Evaluation, GeofenceMonitor};
use crate::services::volunteer_matcher::{MatchingEngine, RoundOutcome};
use crate::utils::validate_coordinates;

/// Actor recorded for actions the orchestrator takes on its own.
pub const ORCHESTRATOR_ACTOR: &str = "dispatch-orchestrator";

/// A new case plus the round run for it, if any.
#[derive(Debug, Clone)]
pub struct CaseIntake {
    pub case: Case,
    pub round: Option<RoundOutcome>,
}

#[derive(Debug, Clone)]
pub struct SosOutcome {
    pub case: Case,
    pub round: Option<RoundOutcome>,
    pub contacts_notified: usize,
}

#[derive(Clone)]
pub struct DispatchOrchestrator {
    store: SharedStore,
    events: EventBus,
    notifier: SharedNotifier,
    cases: CaseManager,
    matcher: MatchingEngine,
    geofence: GeofenceMonitor,
    /// How long intake waits on its round before answering without it.
    round_timeout: Duration,
}

impl DispatchOrchestrator {
    pub fn new(
        store: SharedStore,
        events: EventBus,
        notifier: SharedNotifier,
        cases: CaseManager,
        matcher: MatchingEngine,
        geofence: GeofenceMonitor,
        config: &AppConfig,
    ) -> Self {
        Self {
            store,
            events,
            notifier,
            cases,
            matcher,
            geofence,
            round_timeout: Duration::from_millis(config.round_timeout_ms.max(1)),
        }
    }

    // ============================================
    // ENTRY POINTS
    // ============================================

    /// Create a case; `high` and `critical` cases get a matching round
    /// right away.
    ///
    /// A failed round does not fail the intake.
    pub async fn create_case(&self, data: NewCase, actor: &str) -> Result<CaseIntake, DispatchError> {
        let case = self.cases.create(data, actor).await?;
        let round = if case.priority.is_urgent() {
            self.bounded_round(&case, RoundTrigger::CaseCreated).await
        } else {
            None
        };
        Ok(CaseIntake { case, round })
    }

    /// Move a case to `to`; closing or cancelling it frees its volunteers
    /// before returning.
    ///
    /// A failed release is logged, the status change stands.
    pub async fn transition_case(
        &self,
        id: Uuid,
        to: CaseStatus,
        actor: &str,
        reason: Option<String>,
    ) -> Result<Case, DispatchError> {
        let case = self.cases.transition(id, to, actor, reason).await?;
        if to.is_terminal() {
            if let Err(e) = self.matcher.release_case(id).await {
                error!("Failed to release volunteers of case {}: {}", id, e);
            }
        }
        Ok(case)
    }

    /// Open a critical case for a subject who pressed SOS and alert their
    /// emergency contacts.
    pub async fn raise_sos(&self, subject_id: &str, lat: f64, lng: f64, actor: &str) -> Result<SosOutcome, DispatchError> {
        if subject_id.trim().is_empty() {
            return Err(DispatchError::validation(
                vec!["subjectId".to_string()],
                "subject id is required",
            ));
        }
        validate_coordinates(lat, lng)
            .map_err(|fields| DispatchError::validation(fields, "invalid coordinates"))?;

        let intake = self
            .create_case(
                NewCase {
                    title: Some(format!("SOS from {}", subject_id)),
                    description: Some("Emergency button pressed by monitored subject".to_string()),
                    priority: Some(CasePriority::Critical),
                    location: Some(point_location(lat, lng)),
                    subject_id: Some(subject_id.to_string()),
                    ..Default::default()
                },
                actor,
            )
            .await?;

        let contacts = self.geofence.emergency_contacts(subject_id).await?;
        let alert = Alert::new(
            AlertType::SosEmergency,
            format!("{} needs help now", subject_id),
            json!({
                "caseId": intake.case.id,
                "subjectId": subject_id,
                "location": { "lat": lat, "lng": lng },
                "timestamp": Utc::now(),
            }),
        );
        for contact in &contacts {
            notify_best_effort(self.notifier.as_ref(), contact, &alert).await;
        }

        warn!(
            "SOS from subject {}: case {} opened, {} contacts alerted",
            subject_id,
            intake.case.id,
            contacts.len()
        );
        Ok(SosOutcome {
            case: intake.case,
            round: intake.round,
            contacts_notified: contacts.len(),
        })
    }

    /// Evaluate a subject's location report against their zones.
    pub async fn report_location(&self, subject_id: &str, lat: f64, lng: f64) -> Result<Evaluation, DispatchError> {
        self.geofence.evaluate_subject(subject_id, lat, lng).await
    }

    /// Run no-movement detection over a subject's recent fixes.
    pub async fn check_movement(
        &self,
        subject_id: &str,
        history: &[LocationSample],
        threshold_minutes: Option<i64>,
    ) -> Result<Option<Anomaly>, DispatchError> {
        self.geofence
            .detect_anomaly(subject_id, history, threshold_minutes)
            .await
    }

    /// Run a round on its own task and wait at most `round_timeout` for it.
    ///
    /// Assignment writes must not be cut short, so the timeout only drops
    /// the wait; the round itself always runs to completion.
    async fn bounded_round(&self, case: &Case, trigger: RoundTrigger) -> Option<RoundOutcome> {
        let matcher = self.matcher.clone();
        let case_id = case.id;
        let round = tokio::spawn(async move { matcher.run_round(case_id, trigger).await });

        match timeout(self.round_timeout, round).await {
            Ok(Ok(Ok(outcome))) => Some(outcome),
            Ok(Ok(Err(e))) => {
                warn!("Matching round for case {} failed: {}", case_id, e);
                None
            }
            Ok(Err(e)) => {
                error!("Matching round for case {} panicked: {}", case_id, e);
                None
            }
            Err(_) => {
                warn!(
                    "Matching round for case {} still running after {:?}",
                    case_id, self.round_timeout
                );
                None
            }
        }
    }

    /// Release volunteers still held by closed or cancelled cases.
    async fn reconcile_closed_cases(&self) {
        match self.matcher.release_closed_cases().await {
            Ok(0) => {}
            Ok(n) => info!("Reconciled {} assignments on closed cases", n),
            Err(e) => error!("Closed-case reconcile failed: {}", e),
        }
    }

    // ============================================
    // LISTENER
    // ============================================

    /// React to geofence and case events until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut geofence = self.events.subscribe_geofence();
        let mut cases = self.events.subscribe_cases();

        info!("Dispatch orchestrator listening");

        loop {
            tokio::select! {
                event = geofence.recv() => match event {
                    Ok(event) => self.handle_geofence_event(event).await,
                    Err(RecvError::Lagged(n)) => warn!("Orchestrator skipped {} geofence events", n),
                    Err(RecvError::Closed) => break,
                },
                event = cases.recv() => match event {
                    Ok(event) => self.handle_case_event(event).await,
                    Err(RecvError::Lagged(n)) => {
                        warn!("Orchestrator skipped {} case events", n);
                        self.reconcile_closed_cases().await;
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }

        info!("Dispatch orchestrator stopped");
    }

    pub(crate) async fn handle_geofence_event(&self, event: GeofenceEvent) {
        let result = match event {
            GeofenceEvent::Exit(crossing) => self.on_exit(crossing).await,
            GeofenceEvent::Enter(crossing) => {
                self.alert_zone_contacts(&crossing, AlertType::EnterGeofence).await
            }
            GeofenceEvent::AnomalyDetected(anomaly) => self.on_anomaly(anomaly).await,
        };
        if let Err(e) = result {
            error!("Failed to handle geofence event: {}", e);
        }
    }

    pub(crate) async fn handle_case_event(&self, event: CaseEvent) {
        let result = match event {
            CaseEvent::Updated {
                case_id,
                change: CaseChange::Status {
                    to: CaseStatus::Dispatched,
                    ..
                },
                ..
            } => match self.cases.get(case_id).await {
                Ok(case) => {
                    self.bounded_round(&case, RoundTrigger::CaseDispatched).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            CaseEvent::Closed { case_id, .. } => {
                self.matcher.release_case(case_id).await.map(|_| ())
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            error!("Failed to handle case event: {}", e);
        }
    }

    /// Alert contacts, then escalate the subject's open case or open a
    /// `high` one at the breach location.
    async fn on_exit(&self, crossing: GeofenceCrossing) -> Result<(), DispatchError> {
        self.alert_zone_contacts(&crossing, AlertType::ExitGeofence)
            .await?;

        let open = queries::find_open_case_for_subject(self.store.as_ref(), &crossing.subject_id).await?;
        match open {
            Some(case) => {
                let case = self
                    .cases
                    .escalate(case.id, Some(crossing.location), ORCHESTRATOR_ACTOR)
                    .await?;
                info!(
                    "Geofence exit escalated case {} to {}",
                    case.id, case.priority
                );
            }
            None => {
                let intake = self
                    .create_case(
                        NewCase {
                            title: Some(format!("{} left {}", crossing.subject_id, crossing.zone_name)),
                            description: Some(format!(
                                "Monitored subject left zone '{}' and is {} m from its center",
                                crossing.zone_name, crossing.distance_meters
                            )),
                            priority: Some(CasePriority::High),
                            location: Some(point_location(crossing.location.lat, crossing.location.lng)),
                            subject_id: Some(crossing.subject_id.clone()),
                            ..Default::default()
                        },
                        ORCHESTRATOR_ACTOR,
                    )
                    .await?;
                info!("Geofence exit opened case {}", intake.case.id);
            }
        }
        Ok(())
    }

    async fn on_anomaly(&self, anomaly: Anomaly) -> Result<(), DispatchError> {
        let contacts = self.geofence.emergency_contacts(&anomaly.subject_id).await?;
        let alert = Alert::new(
            AlertType::NoMovement,
            format!(
                "{} has not moved in {} minutes",
                anomaly.subject_id, anomaly.window_minutes
            ),
            json!({
                "subjectId": anomaly.subject_id,
                "maxDistanceMeters": anomaly.max_distance_meters,
                "lastSeen": anomaly.last_seen,
                "detectedAt": anomaly.detected_at,
            }),
        );
        for contact in &contacts {
            notify_best_effort(self.notifier.as_ref(), contact, &alert).await;
        }
        debug!("NO_MOVEMENT sent to {} contacts", contacts.len());
        Ok(())
    }

    async fn alert_zone_contacts(&self, crossing: &GeofenceCrossing, alert_type: AlertType) -> Result<(), DispatchError> {
        let zone = self.geofence.get_zone(crossing.zone_id).await?;
        let verb = match alert_type {
            AlertType::EnterGeofence => "entered",
            _ => "left",
        };
        let alert = Alert::new(
            alert_type,
            format!("{} {} {}", crossing.subject_id, verb, crossing.zone_name),
            json!({
                "subjectId": crossing.subject_id,
                "zoneId": crossing.zone_id,
                "zoneName": crossing.zone_name,
                "location": crossing.location,
                "distanceMeters": crossing.distance_meters,
                "timestamp": crossing.occurred_at,
            }),
        );
        for contact in &zone.emergency_contacts {
            notify_best_effort(self.notifier.as_ref(), contact, &alert).await;
        }
        Ok(())
    }
}

fn point_location(lat: f64, lng: f64) -> CaseLocation {
    CaseLocation {
        lat,
        lng,
        address: None,
        area: None,
        radius: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{GeoPoint, VolunteerStatus};
    use crate::services::geofence_monitor::NewZone;
    use crate::services::testkit::{case_data, FaultyStore, Harness};

    const HOME: (f64, f64) = (24.8067, 120.9687);

    async fn home_zone(h: &Harness, subject: &str) {
        h.geofence
            .register_zone(NewZone {
                subject_id: subject.to_string(),
                name: "Home".to_string(),
                center: GeoPoint::new(HOME.0, HOME.1),
                radius_meters: 500.0,
                alert_on_enter: true,
                alert_on_exit: true,
                emergency_contacts: vec!["daughter".to_string(), "son".to_string()],
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_critical_case_gets_immediate_round() {
        let h = Harness::new();
        h.volunteer_at("v-1", HOME.0 + 0.002, HOME.1, 4.5).await;

        let intake = h
            .orchestrator
            .create_case(case_data(Some(CasePriority::Critical), HOME.0, HOME.1), "w")
            .await
            .unwrap();
        let round = intake.round.expect("critical cases are matched at intake");
        assert!(!round.candidates.is_empty());
        assert_eq!(round.trigger, RoundTrigger::CaseCreated);
    }

    #[tokio::test]
    async fn test_medium_case_waits_for_sweep() {
        let h = Harness::new();
        h.volunteer_at("v-1", HOME.0, HOME.1, 4.5).await;

        let intake = h
            .orchestrator
            .create_case(case_data(Some(CasePriority::Medium), HOME.0, HOME.1), "w")
            .await
            .unwrap();
        assert!(intake.round.is_none());
    }

    #[tokio::test]
    async fn test_sos_opens_critical_case_and_alerts_contacts() {
        let h = Harness::new();
        home_zone(&h, "p-1").await;

        let outcome = h.orchestrator.raise_sos("p-1", HOME.0, HOME.1, "device").await.unwrap();
        assert_eq!(outcome.case.priority, CasePriority::Critical);
        assert_eq!(outcome.case.subject_id.as_deref(), Some("p-1"));
        assert_eq!(outcome.contacts_notified, 2);

        let alerts = h.notifier.alerts_of(AlertType::SosEmergency);
        let targets: Vec<&str> = alerts.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(targets, vec!["daughter", "son"]);
    }

    #[tokio::test]
    async fn test_exit_opens_high_case_then_escalates_it() {
        let h = Harness::new();
        home_zone(&h, "p-1").await;

        h.orchestrator.report_location("p-1", HOME.0, HOME.1).await.unwrap();
        let eval = h.orchestrator.report_location("p-1", 24.8167, 120.9687).await.unwrap();
        let exit = eval.events[0].clone();

        h.orchestrator
            .handle_geofence_event(GeofenceEvent::Exit(exit.clone()))
            .await;
        assert_eq!(h.notifier.alerts_of(AlertType::ExitGeofence).len(), 2);

        let cases = h.cases.list(None).await.unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].priority, CasePriority::High);
        assert_eq!(cases[0].subject_id.as_deref(), Some("p-1"));

        h.orchestrator
            .handle_geofence_event(GeofenceEvent::Exit(exit))
            .await;
        let cases = h.cases.list(None).await.unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].priority, CasePriority::Critical);
    }

    #[tokio::test]
    async fn test_enter_and_anomaly_alert_contacts() {
        let h = Harness::new();
        home_zone(&h, "p-1").await;

        let eval = h.orchestrator.report_location("p-1", HOME.0, HOME.1).await.unwrap();
        h.orchestrator
            .handle_geofence_event(GeofenceEvent::Enter(eval.events[0].clone()))
            .await;
        assert_eq!(h.notifier.alerts_of(AlertType::EnterGeofence).len(), 2);

        let now = Utc::now();
        let history = vec![
            LocationSample { lat: HOME.0, lng: HOME.1, timestamp: now },
            LocationSample {
                lat: HOME.0,
                lng: HOME.1,
                timestamp: now - chrono::Duration::minutes(35),
            },
        ];
        let anomaly = h
            .orchestrator
            .check_movement("p-1", &history, Some(40))
            .await
            .unwrap()
            .unwrap();
        h.orchestrator
            .handle_geofence_event(GeofenceEvent::AnomalyDetected(anomaly))
            .await;
        assert_eq!(h.notifier.alerts_of(AlertType::NoMovement).len(), 2);
    }

    #[tokio::test]
    async fn test_closing_case_releases_volunteers() {
        let h = Harness::new();
        h.volunteer_at("v-1", HOME.0, HOME.1, 4.5).await;
        let intake = h
            .orchestrator
            .create_case(case_data(Some(CasePriority::High), HOME.0, HOME.1), "w")
            .await
            .unwrap();
        assert_eq!(intake.round.unwrap().assigned.len(), 1);

        h.cases
            .transition(intake.case.id, CaseStatus::Cancelled, "w", None)
            .await
            .unwrap();
        h.orchestrator
            .handle_case_event(CaseEvent::Closed {
                case_id: intake.case.id,
                status: CaseStatus::Cancelled,
                actor: "w".to_string(),
                timestamp: Utc::now(),
            })
            .await;

        let v = h.matcher.get_volunteer("v-1").await.unwrap();
        assert_eq!(v.status, VolunteerStatus::Available);
    }

    #[tokio::test]
    async fn test_listener_matches_dispatched_case() {
        let h = Harness::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let orchestrator = h.orchestrator.clone();
        let listener = tokio::spawn(async move { orchestrator.run(shutdown_rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.volunteer_at("v-1", 24.8, 120.9, 4.0).await;
        let case = h.dispatched_case(CasePriority::Low).await;

        let assigned = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let c = h.cases.get(case.id).await.unwrap();
                if !c.assigned_volunteers.is_empty() {
                    return c.assigned_volunteers;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("listener never matched the dispatched case");
        assert_eq!(assigned, vec!["v-1"]);

        shutdown_tx.send(true).unwrap();
        listener.await.unwrap();
    }

    async fn wait_for_volunteer(h: &Harness, id: &str, status: VolunteerStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if h.matcher.get_volunteer(id).await.unwrap().status == status {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{} never became {}", id, status));
    }

    #[tokio::test]
    async fn test_slow_round_still_completes_its_writes() {
        let mut config = AppConfig::default();
        config.round_timeout_ms = 50;
        let store = FaultyStore::new();
        let h = Harness::with_store(config, store.clone());
        h.volunteer_at("v-1", HOME.0, HOME.1, 4.5).await;

        store.slow_puts("volunteer:", Duration::from_millis(300));
        let intake = h
            .orchestrator
            .create_case(case_data(Some(CasePriority::Critical), HOME.0, HOME.1), "w")
            .await
            .unwrap();
        assert!(intake.round.is_none(), "intake should stop waiting after 50ms");

        wait_for_volunteer(&h, "v-1", VolunteerStatus::Assigned).await;
        let matches = h.matcher.matches_for_case(intake.case.id).await.unwrap();
        assert_eq!(matches.len(), 1);

        // The case write lands last; give it the same grace.
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.cases.get(intake.case.id).await.unwrap().assigned_volunteers.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("case never listed the volunteer");

        let v = h.matcher.get_volunteer("v-1").await.unwrap();
        assert_eq!(v.current_matches, vec![matches[0].id]);
        let case = h.cases.get(intake.case.id).await.unwrap();
        assert_eq!(case.assigned_volunteers, vec!["v-1"]);
    }

    #[tokio::test]
    async fn test_transition_case_releases_on_close() {
        let h = Harness::new();
        h.volunteer_at("v-1", HOME.0, HOME.1, 4.5).await;
        let intake = h
            .orchestrator
            .create_case(case_data(Some(CasePriority::High), HOME.0, HOME.1), "w")
            .await
            .unwrap();
        assert_eq!(intake.round.unwrap().assigned.len(), 1);

        let case = h
            .orchestrator
            .transition_case(intake.case.id, CaseStatus::Cancelled, "w", None)
            .await
            .unwrap();
        assert_eq!(case.status, CaseStatus::Cancelled);

        let v = h.matcher.get_volunteer("v-1").await.unwrap();
        assert_eq!(v.status, VolunteerStatus::Available);
        assert!(v.current_matches.is_empty());
    }

    #[tokio::test]
    async fn test_lagging_listener_still_frees_volunteers() {
        let h = Harness::new();
        h.volunteer_at("v-1", HOME.0, HOME.1, 4.5).await;
        let intake = h
            .orchestrator
            .create_case(case_data(Some(CasePriority::High), HOME.0, HOME.1), "w")
            .await
            .unwrap();
        assert_eq!(intake.round.unwrap().assigned.len(), 1);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let orchestrator = h.orchestrator.clone();
        let listener = tokio::spawn(async move { orchestrator.run(shutdown_rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Close through the case manager alone, then bury case_closed.
        h.cases
            .transition(intake.case.id, CaseStatus::Cancelled, "w", None)
            .await
            .unwrap();
        for _ in 0..300 {
            h.events.publish_case(CaseEvent::Created {
                case_id: Uuid::new_v4(),
                priority: CasePriority::Low,
                subject_id: None,
                actor: "noise".to_string(),
                timestamp: Utc::now(),
            });
        }

        wait_for_volunteer(&h, "v-1", VolunteerStatus::Available).await;

        shutdown_tx.send(true).unwrap();
        listener.await.unwrap();
    }
}
