//! # Geofence Monitor Service
//!
//! Tracks, for every (subject, zone) pair, whether the subject is inside
//! the zone, and raises an event exactly once per boundary crossing.
//!
//! ## Evaluation Flow
//!
//! ```text
//! location report (subject, lat, lng)
//!              │
//!              ├── validate coordinates
//!              │
//!              ├── lock geo:{subject}
//!              │
//!              ├── for each active zone of the subject:
//!              │      distance = haversine(center, point)
//!              │      inside   = distance <= radius
//!              │      prev     = stored status (absent = outside)
//!              │      prev=in,  cur=out, alert_on_exit  → EXIT
//!              │      prev=out, cur=in,  alert_on_enter → ENTER
//!              │      persist status
//!              │
//!              └── unlock, publish events
//! ```
//!
//! ## No-Movement Detection
//!
//! Separate from zone evaluation: given a subject's recent fixes, walk
//! back from the newest one while inside the window. Any fix further than
//! the movement threshold from the newest proves movement; otherwise the
//! subject is flagged `NO_MOVEMENT`.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::{queries, GeoPoint, GeofenceStatus, GeofenceZone, LocationSample, SharedStore};
use crate::errors::DispatchError;
use crate::events::{
    Anomaly, AnomalyKind, CrossingKind, EventBus, GeofenceCrossing, GeofenceEvent,
};
use crate::utils::{haversine_meters, round_meters, validate_coordinates, KeyedLocks};

/// Input for [`GeofenceMonitor::register_zone`].
#[derive(Debug, Clone)]
pub struct NewZone {
    pub subject_id: String,
    pub name: String,
    pub center: GeoPoint,
    pub radius_meters: f64,
    pub alert_on_enter: bool,
    pub alert_on_exit: bool,
    pub emergency_contacts: Vec<String>,
}

/// Result of evaluating one location report.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub statuses: Vec<GeofenceStatus>,
    pub events: Vec<GeofenceCrossing>,
}

/// The Geofence Monitor service.
#[derive(Clone)]
pub struct GeofenceMonitor {
    store: SharedStore,
    events: EventBus,
    locks: KeyedLocks,
    anomaly_threshold_minutes: i64,
    movement_threshold_meters: f64,
}

impl GeofenceMonitor {
    /// Create a new GeofenceMonitor.
    ///
    /// ## Arguments
    ///
    /// * `store` - Persistence backend
    /// * `events` - Bus the crossing and anomaly events go out on
    /// * `locks` - Lock registry shared with the other services
    /// * `config` - Anomaly window and movement threshold
    pub fn new(store: SharedStore, events: EventBus, locks: KeyedLocks, config: &AppConfig) -> Self {
        Self {
            store,
            events,
            locks,
            anomaly_threshold_minutes: config.anomaly_threshold_minutes,
            movement_threshold_meters: config.movement_threshold_meters,
        }
    }

    // ============================================
    // ZONES
    // ============================================

    /// Validate and persist a zone, seeding its status as "outside".
    pub async fn register_zone(&self, zone: NewZone) -> Result<GeofenceZone, DispatchError> {
        let mut invalid = Vec::new();
        if zone.subject_id.trim().is_empty() {
            invalid.push("subjectId".to_string());
        }
        if zone.name.trim().is_empty() {
            invalid.push("name".to_string());
        }
        if let Err(fields) = validate_coordinates(zone.center.lat, zone.center.lng) {
            invalid.extend(fields.into_iter().map(|f| format!("center.{}", f)));
        }
        if !zone.radius_meters.is_finite() || zone.radius_meters <= 0.0 {
            invalid.push("radiusMeters".to_string());
        }
        if !invalid.is_empty() {
            return Err(DispatchError::validation(invalid, "invalid geofence zone"));
        }

        let now = Utc::now();
        let record = GeofenceZone {
            id: Uuid::new_v4(),
            subject_id: zone.subject_id,
            name: zone.name,
            center: zone.center,
            radius_meters: zone.radius_meters,
            alert_on_enter: zone.alert_on_enter,
            alert_on_exit: zone.alert_on_exit,
            active: true,
            emergency_contacts: zone.emergency_contacts,
            created_at: now,
            updated_at: now,
        };

        let _guard = self.locks.lock(subject_lock_key(&record.subject_id)).await;
        queries::put_zone(self.store.as_ref(), &record).await?;
        queries::put_geofence_status(
            self.store.as_ref(),
            &GeofenceStatus {
                subject_id: record.subject_id.clone(),
                zone_id: record.id,
                inside: false,
                last_event: None,
                last_check: now,
                distance_meters: None,
            },
        )
        .await?;

        info!(
            "Registered zone '{}' ({:.0} m) for subject {}",
            record.name, record.radius_meters, record.subject_id
        );
        Ok(record)
    }

    /// Stop monitoring a zone and discard its status.
    pub async fn deactivate_zone(&self, zone_id: Uuid) -> Result<GeofenceZone, DispatchError> {
        let zone = self.get_zone(zone_id).await?;

        let _guard = self.locks.lock(subject_lock_key(&zone.subject_id)).await;
        let mut zone = queries::get_zone(self.store.as_ref(), &zone_id)
            .await?
            .ok_or_else(|| DispatchError::not_found("zone", zone_id))?;

        zone.active = false;
        zone.updated_at = Utc::now();
        queries::put_zone(self.store.as_ref(), &zone).await?;
        queries::delete_geofence_status(self.store.as_ref(), &zone.subject_id, &zone.id).await?;

        info!("Deactivated zone '{}' for subject {}", zone.name, zone.subject_id);
        Ok(zone)
    }

    pub async fn get_zone(&self, zone_id: Uuid) -> Result<GeofenceZone, DispatchError> {
        queries::get_zone(self.store.as_ref(), &zone_id)
            .await?
            .ok_or_else(|| DispatchError::not_found("zone", zone_id))
    }

    pub async fn zones_for_subject(&self, subject_id: &str) -> Result<Vec<GeofenceZone>, DispatchError> {
        Ok(queries::list_zones_for_subject(self.store.as_ref(), subject_id).await?)
    }

    /// Emergency contacts across every active zone of a subject, deduplicated.
    pub async fn emergency_contacts(&self, subject_id: &str) -> Result<Vec<String>, DispatchError> {
        let mut contacts: Vec<String> = Vec::new();
        for zone in self.zones_for_subject(subject_id).await? {
            if !zone.active {
                continue;
            }
            for contact in zone.emergency_contacts {
                if !contacts.contains(&contact) {
                    contacts.push(contact);
                }
            }
        }
        Ok(contacts)
    }

    /// Current statuses of every active zone of a subject.
    pub async fn statuses_for_subject(&self, subject_id: &str) -> Result<Vec<GeofenceStatus>, DispatchError> {
        let mut statuses = Vec::new();
        for zone in self.zones_for_subject(subject_id).await? {
            if let Some(status) =
                queries::get_geofence_status(self.store.as_ref(), subject_id, &zone.id).await?
            {
                statuses.push(status);
            }
        }
        Ok(statuses)
    }

    // ============================================
    // EVALUATION
    // ============================================

    /// Evaluate a location report against the subject's stored zones.
    pub async fn evaluate_subject(&self, subject_id: &str, lat: f64, lng: f64) -> Result<Evaluation, DispatchError> {
        let zones = self.zones_for_subject(subject_id).await?;
        self.evaluate(subject_id, lat, lng, &zones).await
    }

    /// Evaluate a location report against `zones`.
    ///
    /// Zones that are inactive or belong to another subject are skipped.
    /// Every status is persisted before the events are published.
    pub async fn evaluate(
        &self,
        subject_id: &str,
        lat: f64,
        lng: f64,
        zones: &[GeofenceZone],
    ) -> Result<Evaluation, DispatchError> {
        if subject_id.trim().is_empty() {
            return Err(DispatchError::validation(
                vec!["subjectId".to_string()],
                "subject id is required",
            ));
        }
        validate_coordinates(lat, lng)
            .map_err(|fields| DispatchError::validation(fields, "invalid coordinates"))?;

        let zones: Vec<&GeofenceZone> = zones
            .iter()
            .filter(|z| z.active && z.subject_id == subject_id)
            .collect();

        if let Some(zone) = zones.iter().find(|z| !z.radius_meters.is_finite() || z.radius_meters <= 0.0) {
            return Err(DispatchError::validation(
                vec!["radiusMeters".to_string()],
                format!("zone {} has a non-positive radius", zone.id),
            ));
        }

        let point = GeoPoint::new(lat, lng);
        let now = Utc::now();
        let mut evaluation = Evaluation::default();

        {
            let _guard = self.locks.lock(subject_lock_key(subject_id)).await;

            for zone in zones {
                let distance = haversine_meters(zone.center, point);
                let inside = distance <= zone.radius_meters;

                let previous =
                    queries::get_geofence_status(self.store.as_ref(), subject_id, &zone.id).await?;
                let was_inside = previous.as_ref().map(|s| s.inside).unwrap_or(false);
                let crossed = was_inside != inside;

                let status = GeofenceStatus {
                    subject_id: subject_id.to_string(),
                    zone_id: zone.id,
                    inside,
                    last_event: if crossed {
                        Some(now)
                    } else {
                        previous.and_then(|s| s.last_event)
                    },
                    last_check: now,
                    distance_meters: Some(round_meters(distance)),
                };
                queries::put_geofence_status(self.store.as_ref(), &status).await?;

                let kind = match (was_inside, inside) {
                    (true, false) if zone.alert_on_exit => Some(CrossingKind::Exit),
                    (false, true) if zone.alert_on_enter => Some(CrossingKind::Enter),
                    _ => None,
                };
                if let Some(kind) = kind {
                    evaluation.events.push(GeofenceCrossing {
                        kind,
                        subject_id: subject_id.to_string(),
                        zone_id: zone.id,
                        zone_name: zone.name.clone(),
                        location: point,
                        distance_meters: round_meters(distance),
                        occurred_at: now,
                    });
                }

                evaluation.statuses.push(status);
            }
        }

        for crossing in &evaluation.events {
            info!(
                "Subject {} {:?} zone '{}' ({} m from center)",
                crossing.subject_id, crossing.kind, crossing.zone_name, crossing.distance_meters
            );
            self.events
                .publish_geofence(GeofenceEvent::from_crossing(crossing.clone()));
        }

        debug!(
            "Evaluated {} zones for subject {}",
            evaluation.statuses.len(),
            subject_id
        );
        Ok(evaluation)
    }

    // ============================================
    // ANOMALY DETECTION
    // ============================================

    /// Check a subject's location history for prolonged non-movement and
    /// publish `anomaly_detected` when found.
    ///
    /// `threshold_minutes` overrides the configured window.
    pub async fn detect_anomaly(
        &self,
        subject_id: &str,
        history: &[LocationSample],
        threshold_minutes: Option<i64>,
    ) -> Result<Option<Anomaly>, DispatchError> {
        let window = threshold_minutes.unwrap_or(self.anomaly_threshold_minutes);
        if window <= 0 {
            return Err(DispatchError::validation(
                vec!["thresholdMinutes".to_string()],
                "threshold must be positive",
            ));
        }
        for sample in history {
            validate_coordinates(sample.lat, sample.lng)
                .map_err(|fields| DispatchError::validation(fields, "invalid location sample"))?;
        }

        let anomaly = find_no_movement(
            subject_id,
            history,
            window,
            self.movement_threshold_meters,
            Utc::now(),
        );

        if let Some(anomaly) = &anomaly {
            warn!(
                "No movement for subject {} in the last {} minutes (max {:.1} m)",
                subject_id, window, anomaly.max_distance_meters
            );
            self.events
                .publish_geofence(GeofenceEvent::AnomalyDetected(anomaly.clone()));
        }

        Ok(anomaly)
    }
}

/// Lock key serializing all geofence work for one subject.
fn subject_lock_key(subject_id: &str) -> String {
    format!("geo:{}", subject_id)
}

/// Pure no-movement check.
///
/// Fewer than two fixes cannot prove movement and count as an anomaly.
pub fn find_no_movement(
    subject_id: &str,
    history: &[LocationSample],
    window_minutes: i64,
    movement_threshold_meters: f64,
    detected_at: DateTime<Utc>,
) -> Option<Anomaly> {
    let mut samples = history.to_vec();
    samples.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let Some(latest) = samples.first().copied() else {
        return Some(Anomaly {
            kind: AnomalyKind::NoMovement,
            subject_id: subject_id.to_string(),
            max_distance_meters: 0.0,
            window_minutes,
            samples_examined: 0,
            last_seen: None,
            detected_at,
        });
    };
    let latest_point = GeoPoint::new(latest.lat, latest.lng);
    let window = Duration::minutes(window_minutes);

    let mut max_distance: f64 = 0.0;
    let mut examined = 1;
    for sample in samples.iter().skip(1) {
        if latest.timestamp - sample.timestamp > window {
            break;
        }
        let distance = haversine_meters(latest_point, GeoPoint::new(sample.lat, sample.lng));
        if distance > movement_threshold_meters {
            return None;
        }
        max_distance = max_distance.max(distance);
        examined += 1;
    }

    Some(Anomaly {
        kind: AnomalyKind::NoMovement,
        subject_id: subject_id.to_string(),
        max_distance_meters: max_distance,
        window_minutes,
        samples_examined: examined,
        last_seen: Some(latest_point),
        detected_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use std::sync::Arc;

    const HOME: GeoPoint = GeoPoint {
        lat: 24.8067,
        lng: 120.9687,
    };

    fn monitor() -> (GeofenceMonitor, EventBus) {
        let events = EventBus::default();
        let monitor = GeofenceMonitor::new(
            Arc::new(MemoryStore::new()),
            events.clone(),
            KeyedLocks::new(),
            &AppConfig::default(),
        );
        (monitor, events)
    }

    fn home_zone(subject: &str, enter: bool, exit: bool) -> NewZone {
        NewZone {
            subject_id: subject.to_string(),
            name: "Home".to_string(),
            center: HOME,
            radius_meters: 500.0,
            alert_on_enter: enter,
            alert_on_exit: exit,
            emergency_contacts: vec!["daughter".to_string()],
        }
    }

    fn sample(minutes_ago: i64, lat: f64, lng: f64) -> LocationSample {
        LocationSample {
            lat,
            lng,
            timestamp: Utc::now() - Duration::minutes(minutes_ago),
        }
    }

    #[tokio::test]
    async fn test_exit_fires_once_at_1km() {
        let (monitor, events) = monitor();
        let mut rx = events.subscribe_geofence();
        monitor.register_zone(home_zone("p-1", false, true)).await.unwrap();

        let first = monitor.evaluate_subject("p-1", HOME.lat, HOME.lng).await.unwrap();
        assert!(first.events.is_empty());
        assert!(first.statuses[0].inside);

        // ~1.1 km north
        let out = monitor.evaluate_subject("p-1", 24.8167, 120.9687).await.unwrap();
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].kind, CrossingKind::Exit);
        assert!((out.events[0].distance_meters - 1112.0).abs() <= 1.0);
        assert!(!out.statuses[0].inside);
        assert!(out.statuses[0].last_event.is_some());

        let again = monitor.evaluate_subject("p-1", 24.8167, 120.9687).await.unwrap();
        assert!(again.events.is_empty());

        assert_eq!(rx.recv().await.unwrap().name(), "geofence_exit");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_single_fire_sequence() {
        let (monitor, _) = monitor();
        monitor.register_zone(home_zone("p-1", true, true)).await.unwrap();

        let far = (24.8167, 120.9687);
        let path = [far, far, (HOME.lat, HOME.lng), (HOME.lat, HOME.lng), far];

        let mut kinds = Vec::new();
        for (lat, lng) in path {
            let eval = monitor.evaluate_subject("p-1", lat, lng).await.unwrap();
            kinds.extend(eval.events.into_iter().map(|e| e.kind));
        }
        assert_eq!(kinds, vec![CrossingKind::Enter, CrossingKind::Exit]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reports_fire_exit_once() {
        let (monitor, _) = monitor();
        monitor.register_zone(home_zone("p-1", true, true)).await.unwrap();
        monitor.evaluate_subject("p-1", HOME.lat, HOME.lng).await.unwrap();

        let reports: Vec<_> = (0..8)
            .map(|_| {
                let monitor = monitor.clone();
                tokio::spawn(async move { monitor.evaluate_subject("p-1", 24.8167, 120.9687).await })
            })
            .collect();

        let mut exits = 0;
        for report in reports {
            exits += report.await.unwrap().unwrap().events.len();
        }
        assert_eq!(exits, 1);
    }

    #[tokio::test]
    async fn test_crossing_without_alert_flag_updates_state_silently() {
        let (monitor, _) = monitor();
        monitor.register_zone(home_zone("p-1", false, false)).await.unwrap();

        let eval = monitor.evaluate_subject("p-1", HOME.lat, HOME.lng).await.unwrap();
        assert!(eval.events.is_empty());
        assert!(eval.statuses[0].inside);
        assert!(eval.statuses[0].last_event.is_some());
    }

    #[tokio::test]
    async fn test_inactive_zone_never_alerts() {
        let (monitor, _) = monitor();
        let zone = monitor.register_zone(home_zone("p-1", true, true)).await.unwrap();
        monitor.deactivate_zone(zone.id).await.unwrap();

        let eval = monitor.evaluate_subject("p-1", HOME.lat, HOME.lng).await.unwrap();
        assert!(eval.events.is_empty());
        assert!(eval.statuses.is_empty());
        assert!(monitor.statuses_for_subject("p-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected_before_evaluation() {
        let (monitor, _) = monitor();
        let err = monitor.evaluate_subject("p-1", 95.0, 0.0).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let mut zone = home_zone("p-1", true, true);
        zone.radius_meters = 0.0;
        let err = monitor.register_zone(zone).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_non_positive_radius_in_supplied_zones() {
        let (monitor, _) = monitor();
        let zone = GeofenceZone {
            id: Uuid::new_v4(),
            subject_id: "p-1".to_string(),
            name: "Broken".to_string(),
            center: HOME,
            radius_meters: -5.0,
            alert_on_enter: true,
            alert_on_exit: true,
            active: true,
            emergency_contacts: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let err = monitor.evaluate("p-1", HOME.lat, HOME.lng, &[zone]).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_stationary_history_is_anomaly() {
        // A fix every 2 minutes covering 35+ minutes, jittering within ~2 m.
        let now = Utc::now();
        let history: Vec<LocationSample> = (0..=18)
            .map(|i| LocationSample {
                lat: HOME.lat + ((i % 3) as f64) * 0.00001,
                lng: HOME.lng,
                timestamp: now - Duration::minutes(i * 2),
            })
            .collect();
        assert!(now - history.last().unwrap().timestamp >= Duration::minutes(35));

        let anomaly = find_no_movement("p-1", &history, 30, 10.0, now).unwrap();
        assert_eq!(anomaly.kind, AnomalyKind::NoMovement);
        assert!(anomaly.max_distance_meters < 10.0);
        assert!(anomaly.max_distance_meters > 0.0);
        // Fixes at 0, 2, .., 30 minutes fall inside the window.
        assert_eq!(anomaly.samples_examined, 16);
    }

    #[test]
    fn test_movement_inside_window_clears_anomaly() {
        let history = vec![
            sample(0, HOME.lat, HOME.lng),
            sample(10, HOME.lat + 0.001, HOME.lng),
        ];
        assert!(find_no_movement("p-1", &history, 30, 10.0, Utc::now()).is_none());
    }

    #[test]
    fn test_movement_outside_window_is_ignored() {
        let history = vec![
            sample(0, HOME.lat, HOME.lng),
            sample(5, HOME.lat, HOME.lng),
            sample(45, HOME.lat + 0.01, HOME.lng),
        ];
        assert!(find_no_movement("p-1", &history, 30, 10.0, Utc::now()).is_some());
    }

    #[test]
    fn test_short_history_is_anomaly() {
        let single = vec![sample(0, HOME.lat, HOME.lng)];
        let anomaly = find_no_movement("p-1", &single, 30, 10.0, Utc::now()).unwrap();
        assert_eq!(anomaly.max_distance_meters, 0.0);

        assert!(find_no_movement("p-1", &[], 30, 10.0, Utc::now()).is_some());
    }

    #[tokio::test]
    async fn test_detect_anomaly_publishes_event() {
        let (monitor, events) = monitor();
        let mut rx = events.subscribe_geofence();
        let history = vec![sample(0, HOME.lat, HOME.lng), sample(20, HOME.lat, HOME.lng)];

        let anomaly = monitor.detect_anomaly("p-1", &history, None).await.unwrap();
        assert!(anomaly.is_some());
        assert_eq!(rx.recv().await.unwrap().name(), "anomaly_detected");
    }
}
