//! # Case Lifecycle Manager
//!
//! Owns the case state machine and its side effects.
//!
//! ## Transition Table
//!
//! | From | Allowed targets |
//! |------|-----------------|
//! | created | assigned, cancelled |
//! | assigned | dispatched, cancelled |
//! | dispatched | in_progress, resolved, cancelled |
//! | in_progress | resolved, cancelled |
//! | resolved | closed |
//! | closed, cancelled | (terminal) |
//!
//! ## Side Effects
//!
//! | Target | Effect |
//! |--------|--------|
//! | dispatched | alerts on, dispatcher stamped, PII-free area broadcast |
//! | closed | alerts off, retention purge scheduled |
//! | cancelled | alerts off, personal data purged immediately |
//!
//! Every write of one case happens under that case's lock. Events,
//! broadcasts and audit records go out after the lock is released.

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::{
    queries, AlertConfig, Case, CaseLocation, CasePriority, CaseStatus, ContactInfo, GeoPoint,
    SharedStore, Transition, WorkflowStage,
};
use crate::errors::DispatchError;
use crate::events::{CaseChange, CaseEvent, EventBus};
use crate::notify::audit::snapshot;
use crate::notify::{broadcast_best_effort, AreaBroadcast, Auditor, SharedNotifier, GENERIC_SAFETY_MESSAGE};
use crate::utils::{validate_coordinates, KeyedLocks};

/// Replaces the description of a purged case.
pub const PURGED_PLACEHOLDER: &str = "[purged]";

/// Intake data for a new case. Required fields are optional here so that
/// every missing one can be reported at once.
#[derive(Debug, Clone, Default)]
pub struct NewCase {
    pub title: Option<String>,
    pub description: Option<String>,
    pub priority: Option<CasePriority>,
    pub location: Option<CaseLocation>,
    pub contact_info: Option<ContactInfo>,
    pub subject_description: Option<String>,
    pub subject_id: Option<String>,
}

/// Result of advancing the workflow stage.
#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
    pub case: Case,
    /// Stage and status disagree (e.g. `found` on a cancelled case).
    pub divergent: bool,
}

#[derive(Clone)]
pub struct CaseManager {
    store: SharedStore,
    locks: KeyedLocks,
    events: EventBus,
    notifier: SharedNotifier,
    auditor: Auditor,
    retention: Duration,
}

impl CaseManager {
    /// Create a new CaseManager.
    ///
    /// ## Arguments
    ///
    /// * `store` - Persistence backend
    /// * `locks` - Lock registry shared with the matching engine
    /// * `events` - Bus for case events
    /// * `notifier` - Area broadcast channel
    /// * `auditor` - Audit trail
    /// * `config` - Retention window
    pub fn new(
        store: SharedStore,
        locks: KeyedLocks,
        events: EventBus,
        notifier: SharedNotifier,
        auditor: Auditor,
        config: &AppConfig,
    ) -> Self {
        Self {
            store,
            locks,
            events,
            notifier,
            auditor,
            retention: Duration::days(config.case_retention_days),
        }
    }

    // ============================================
    // INTAKE & QUERIES
    // ============================================

    /// Create a case in `created` with alerts off.
    ///
    /// ## Errors
    ///
    /// `Validation` listing every missing or malformed field.
    pub async fn create(&self, data: NewCase, actor: &str) -> Result<Case, DispatchError> {
        let mut missing = Vec::new();
        let title = required_text(data.title, "title", &mut missing);
        let description = required_text(data.description, "description", &mut missing);
        match &data.location {
            None => missing.push("location".to_string()),
            Some(location) => {
                if let Err(fields) = validate_coordinates(location.lat, location.lng) {
                    missing.extend(fields.into_iter().map(|f| format!("location.{}", f)));
                }
            }
        }
        let (Some(title), Some(description), Some(location), true) =
            (title, description, data.location, missing.is_empty())
        else {
            return Err(DispatchError::validation(missing, "case is missing required fields"));
        };

        let priority = data.priority.unwrap_or_default();
        let now = Utc::now();
        let case = Case {
            id: Uuid::now_v7(),
            title,
            description,
            priority,
            status: CaseStatus::Created,
            location,
            contact_info: data.contact_info,
            subject_description: data.subject_description,
            subject_id: data.subject_id.filter(|s| !s.trim().is_empty()),
            alert_config: AlertConfig {
                enabled: false,
                radius: priority.search_radius_meters(),
                priority,
            },
            created_by: actor.to_string(),
            created_at: now,
            updated_at: now,
            closed_at: None,
            assigned_to: None,
            assigned_by: None,
            assigned_at: None,
            dispatched_by: None,
            dispatched_at: None,
            assigned_volunteers: Vec::new(),
            declined_volunteers: Vec::new(),
            state_history: vec![Transition {
                from: None,
                to: CaseStatus::Created,
                timestamp: now,
                actor: actor.to_string(),
                reason: Some("case created".to_string()),
            }],
            workflow_stage: WorkflowStage::Reported,
            workflow_history: vec![Transition {
                from: None,
                to: WorkflowStage::Reported,
                timestamp: now,
                actor: actor.to_string(),
                reason: None,
            }],
            cleanup_after: None,
            purged_at: None,
        };

        queries::put_case(self.store.as_ref(), &case).await?;
        info!("Created case {} ({} priority) by {}", case.id, case.priority, actor);

        self.auditor
            .record(actor, "case.create", case.id, None, snapshot(&case))
            .await;
        self.events.publish_case(CaseEvent::Created {
            case_id: case.id,
            priority: case.priority,
            subject_id: case.subject_id.clone(),
            actor: actor.to_string(),
            timestamp: now,
        });

        Ok(case)
    }

    pub async fn get(&self, id: Uuid) -> Result<Case, DispatchError> {
        queries::get_case(self.store.as_ref(), &id)
            .await?
            .ok_or_else(|| DispatchError::not_found("case", id))
    }

    /// All cases in creation order, optionally filtered by status.
    pub async fn list(&self, status: Option<CaseStatus>) -> Result<Vec<Case>, DispatchError> {
        let cases = queries::list_cases(self.store.as_ref()).await?;
        Ok(cases
            .into_iter()
            .filter(|c| status.map_or(true, |s| c.status == s))
            .collect())
    }

    // ============================================
    // STATE MACHINE
    // ============================================

    /// Move a case to `to`.
    ///
    /// ## Errors
    ///
    /// * `NotFound` - Unknown case id
    /// * `InvalidTransition` - `to` not allowed from the current status;
    ///   the case is left untouched
    pub async fn transition(
        &self,
        id: Uuid,
        to: CaseStatus,
        actor: &str,
        reason: Option<String>,
    ) -> Result<Case, DispatchError> {
        self.update_status(id, to, actor, reason, |_| {}).await
    }

    /// Set the responsible case worker and move the case to `assigned`.
    pub async fn assign(&self, id: Uuid, assignee: &str, actor: &str) -> Result<Case, DispatchError> {
        if assignee.trim().is_empty() {
            return Err(DispatchError::validation(
                vec!["assigneeId".to_string()],
                "assignee is required",
            ));
        }

        let reason = Some(format!("assigned to {}", assignee));
        self.update_status(id, CaseStatus::Assigned, actor, reason, |case| {
            case.assigned_to = Some(assignee.to_string());
            case.assigned_by = Some(actor.to_string());
            case.assigned_at = Some(Utc::now());
        })
        .await
    }

    async fn update_status<F>(
        &self,
        id: Uuid,
        to: CaseStatus,
        actor: &str,
        reason: Option<String>,
        prepare: F,
    ) -> Result<Case, DispatchError>
    where
        F: FnOnce(&mut Case),
    {
        let (before, case) = {
            let _guard = self.locks.lock(queries::case_key(&id)).await;
            let before = self.get(id).await?;

            let mut case = before.clone();
            apply_transition(&mut case, to, actor, reason, Utc::now(), self.retention)?;
            prepare(&mut case);

            queries::put_case(self.store.as_ref(), &case).await?;
            (before, case)
        };

        info!("Case {}: {} -> {} by {}", id, before.status, case.status, actor);

        if to == CaseStatus::Dispatched {
            broadcast_best_effort(
                self.notifier.as_ref(),
                &AreaBroadcast {
                    center: case.location.point(),
                    radius_meters: case.alert_config.radius,
                    priority: case.priority,
                    message: GENERIC_SAFETY_MESSAGE.to_string(),
                },
            )
            .await;
        }

        self.auditor
            .record(
                actor,
                &format!("case.transition.{}", to),
                id,
                snapshot(&before),
                snapshot(&case),
            )
            .await;

        let now = case.updated_at;
        self.events.publish_case(CaseEvent::Updated {
            case_id: id,
            change: CaseChange::Status {
                from: before.status,
                to,
            },
            actor: actor.to_string(),
            timestamp: now,
        });
        if to == CaseStatus::Cancelled {
            self.events.publish_case(CaseEvent::Updated {
                case_id: id,
                change: CaseChange::Purged,
                actor: actor.to_string(),
                timestamp: now,
            });
        }
        if to.is_terminal() {
            self.events.publish_case(CaseEvent::Closed {
                case_id: id,
                status: to,
                actor: actor.to_string(),
                timestamp: now,
            });
        }

        Ok(case)
    }

    /// Raise priority one level and refresh the location.
    ///
    /// Used when a monitored subject breaches a geofence while a case is
    /// already open. `critical` stays `critical`.
    pub async fn escalate(
        &self,
        id: Uuid,
        location: Option<GeoPoint>,
        actor: &str,
    ) -> Result<Case, DispatchError> {
        if let Some(point) = location {
            validate_coordinates(point.lat, point.lng)
                .map_err(|fields| DispatchError::validation(fields, "invalid coordinates"))?;
        }

        let (before, case) = {
            let _guard = self.locks.lock(queries::case_key(&id)).await;
            let before = self.get(id).await?;
            if !before.status.is_open() {
                return Err(DispatchError::InvalidState {
                    entity: "case",
                    id: id.to_string(),
                    expected: "open".to_string(),
                    actual: before.status.to_string(),
                });
            }

            let mut case = before.clone();
            let priority = case.priority.escalated();
            case.priority = priority;
            case.alert_config.priority = priority;
            case.alert_config.radius = priority.search_radius_meters();
            if let Some(point) = location {
                case.location.lat = point.lat;
                case.location.lng = point.lng;
            }
            case.updated_at = Utc::now();

            queries::put_case(self.store.as_ref(), &case).await?;
            (before, case)
        };

        info!(
            "Escalated case {}: {} -> {} by {}",
            id, before.priority, case.priority, actor
        );
        self.auditor
            .record(actor, "case.escalate", id, snapshot(&before), snapshot(&case))
            .await;
        if before.priority != case.priority {
            self.events.publish_case(CaseEvent::Updated {
                case_id: id,
                change: CaseChange::Escalated {
                    from: before.priority,
                    to: case.priority,
                },
                actor: actor.to_string(),
                timestamp: case.updated_at,
            });
        }

        Ok(case)
    }

    // ============================================
    // WORKFLOW STAGE
    // ============================================

    /// Advance the internal workflow stage.
    ///
    /// Validated against its own table, independent of `status`. A stage
    /// that disagrees with the status is accepted but flagged.
    pub async fn advance_workflow(
        &self,
        id: Uuid,
        stage: WorkflowStage,
        actor: &str,
        reason: Option<String>,
    ) -> Result<WorkflowOutcome, DispatchError> {
        let (before, case) = {
            let _guard = self.locks.lock(queries::case_key(&id)).await;
            let before = self.get(id).await?;
            let from = before.workflow_stage;

            if !from.can_transition_to(stage) {
                return Err(DispatchError::InvalidTransition {
                    from: from.to_string(),
                    to: stage.to_string(),
                    allowed: from
                        .allowed_transitions()
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                });
            }

            let now = Utc::now();
            let mut case = before.clone();
            case.workflow_stage = stage;
            case.workflow_history.push(Transition {
                from: Some(from),
                to: stage,
                timestamp: now,
                actor: actor.to_string(),
                reason,
            });
            case.updated_at = now;

            queries::put_case(self.store.as_ref(), &case).await?;
            (before, case)
        };

        let divergent = workflow_diverges(case.status, case.workflow_stage);
        if divergent {
            warn!(
                "Case {} workflow stage '{}' diverges from status '{}'",
                id, case.workflow_stage, case.status
            );
        }

        self.auditor
            .record(actor, "case.workflow", id, snapshot(&before), snapshot(&case))
            .await;
        self.events.publish_case(CaseEvent::Updated {
            case_id: id,
            change: CaseChange::Workflow {
                from: before.workflow_stage,
                to: case.workflow_stage,
            },
            actor: actor.to_string(),
            timestamp: case.updated_at,
        });

        Ok(WorkflowOutcome { case, divergent })
    }

    // ============================================
    // RETENTION
    // ============================================

    /// Purge personal data of closed cases whose retention window elapsed.
    ///
    /// ## Returns
    ///
    /// Number of cases purged.
    pub async fn run_retention_sweep(&self, now: DateTime<Utc>) -> Result<usize, DispatchError> {
        let due: Vec<Uuid> = queries::list_cases(self.store.as_ref())
            .await?
            .into_iter()
            .filter(|c| purge_due(c, now))
            .map(|c| c.id)
            .collect();

        let mut purged = 0;
        for id in due {
            let purged_now = {
                let _guard = self.locks.lock(queries::case_key(&id)).await;
                match queries::get_case(self.store.as_ref(), &id).await? {
                    Some(mut case) if purge_due(&case, now) => {
                        purge_personal_data(&mut case, now);
                        queries::put_case(self.store.as_ref(), &case).await?;
                        true
                    }
                    _ => false,
                }
            };

            if purged_now {
                purged += 1;
                self.auditor.record("system", "case.purge", id, None, None).await;
                self.events.publish_case(CaseEvent::Updated {
                    case_id: id,
                    change: CaseChange::Purged,
                    actor: "system".to_string(),
                    timestamp: now,
                });
            }
        }

        if purged > 0 {
            info!("Retention sweep purged {} cases", purged);
        }
        Ok(purged)
    }
}

fn required_text(value: Option<String>, field: &str, missing: &mut Vec<String>) -> Option<String> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Some(v),
        _ => {
            missing.push(field.to_string());
            None
        }
    }
}

/// Validate `to` against the table and apply it with its record-level
/// side effects. Leaves `case` untouched on error.
pub fn apply_transition(
    case: &mut Case,
    to: CaseStatus,
    actor: &str,
    reason: Option<String>,
    now: DateTime<Utc>,
    retention: Duration,
) -> Result<(), DispatchError> {
    let from = case.status;
    if !from.can_transition_to(to) {
        return Err(DispatchError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
            allowed: from
                .allowed_transitions()
                .iter()
                .map(|s| s.to_string())
                .collect(),
        });
    }

    case.status = to;
    case.updated_at = now;
    case.alert_config.enabled = to.alerts_active();
    case.state_history.push(Transition {
        from: Some(from),
        to,
        timestamp: now,
        actor: actor.to_string(),
        reason,
    });

    match to {
        CaseStatus::Dispatched => {
            case.dispatched_by = Some(actor.to_string());
            case.dispatched_at = Some(now);
        }
        CaseStatus::Closed => {
            case.closed_at = Some(now);
            case.cleanup_after = Some(now + retention);
        }
        CaseStatus::Cancelled => {
            case.closed_at = Some(now);
            purge_personal_data(case, now);
        }
        _ => {}
    }

    Ok(())
}

fn purge_due(case: &Case, now: DateTime<Utc>) -> bool {
    case.status == CaseStatus::Closed
        && case.purged_at.is_none()
        && case.cleanup_after.map_or(false, |at| at <= now)
}

/// Drop personal data; the case skeleton and history stay.
pub fn purge_personal_data(case: &mut Case, now: DateTime<Utc>) {
    case.contact_info = None;
    case.subject_description = None;
    case.description = PURGED_PLACEHOLDER.to_string();
    case.location.address = None;
    case.location.area = None;
    case.cleanup_after = None;
    case.purged_at = Some(now);
}

/// Whether `stage` contradicts `status`.
pub fn workflow_diverges(status: CaseStatus, stage: WorkflowStage) -> bool {
    use CaseStatus as S;
    use WorkflowStage as W;
    matches!(
        (status, stage),
        (S::Cancelled, W::Found | W::Reunited)
            | (S::Created | S::Assigned, W::Found | W::Reunited)
            | (S::Dispatched | S::InProgress, W::Archived)
            | (S::Closed | S::Cancelled, W::Searching)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testkit::{case_data, Harness};

    #[tokio::test]
    async fn test_create_requires_fields() {
        let h = Harness::new();
        let err = h
            .cases
            .create(
                NewCase {
                    title: Some("  ".to_string()),
                    ..Default::default()
                },
                "worker",
            )
            .await
            .unwrap_err();

        match err {
            DispatchError::Validation { fields, .. } => {
                assert_eq!(fields, vec!["title", "description", "location"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_create_defaults() {
        let h = Harness::new();
        let mut data = case_data(None, 24.8, 120.9);
        data.priority = None;
        let case = h.cases.create(data, "worker").await.unwrap();

        assert_eq!(case.priority, CasePriority::Medium);
        assert_eq!(case.status, CaseStatus::Created);
        assert!(!case.alert_config.enabled);
        assert_eq!(case.alert_config.radius, 2000.0);
        assert_eq!(case.state_history.len(), 1);
        assert_eq!(case.state_history[0].from, None);
        assert_eq!(case.workflow_stage, WorkflowStage::Reported);
    }

    #[tokio::test]
    async fn test_illegal_transition_leaves_case_unchanged() {
        let h = Harness::new();
        let case = h.dispatched_case(CasePriority::Medium).await;

        let err = h
            .cases
            .transition(case.id, CaseStatus::Assigned, "worker", None)
            .await
            .unwrap_err();
        match &err {
            DispatchError::InvalidTransition { from, to, allowed } => {
                assert_eq!(from, "dispatched");
                assert_eq!(to, "assigned");
                assert_eq!(allowed, &vec!["in_progress", "resolved", "cancelled"]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let stored = h.cases.get(case.id).await.unwrap();
        assert_eq!(stored.status, CaseStatus::Dispatched);
        assert_eq!(stored.state_history.len(), case.state_history.len());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_closures_apply_once() {
        let h = Harness::new();
        let case = h.dispatched_case(CasePriority::Medium).await;
        let case_id = case.id;

        let attempts: Vec<_> = (0..4)
            .map(|i| {
                let cases = h.cases.clone();
                tokio::spawn(async move {
                    cases
                        .transition(case_id, CaseStatus::Cancelled, &format!("worker-{i}"), None)
                        .await
                })
            })
            .collect();

        let mut applied = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => applied += 1,
                Err(e) => assert_eq!(e.code(), "INVALID_TRANSITION"),
            }
        }
        assert_eq!(applied, 1);

        let stored = h.cases.get(case.id).await.unwrap();
        assert_eq!(stored.status, CaseStatus::Cancelled);
        let cancellations = stored
            .state_history
            .iter()
            .filter(|t| t.to == CaseStatus::Cancelled)
            .count();
        assert_eq!(cancellations, 1);
        assert_eq!(stored.state_history.len(), case.state_history.len() + 1);
    }

    #[test]
    fn test_every_illegal_pair_is_rejected() {
        for from in CaseStatus::ALL {
            for to in CaseStatus::ALL {
                if from.can_transition_to(to) {
                    continue;
                }
                let mut case = Harness::bare_case(from);
                let history = case.state_history.len();
                let result = apply_transition(&mut case, to, "t", None, Utc::now(), Duration::days(30));
                assert!(result.is_err(), "{from} -> {to}");
                assert_eq!(case.status, from);
                assert_eq!(case.state_history.len(), history);
            }
        }
    }

    #[tokio::test]
    async fn test_dispatch_enables_alerts_and_broadcasts_generic_message() {
        let h = Harness::new();
        let case = h.dispatched_case(CasePriority::High).await;

        assert!(case.alert_config.enabled);
        assert_eq!(case.dispatched_by.as_deref(), Some("worker"));
        assert!(case.dispatched_at.is_some());

        let broadcasts = h.notifier.broadcasts.lock().unwrap().clone();
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(broadcasts[0].radius_meters, 3000.0);
        assert_eq!(broadcasts[0].message, GENERIC_SAFETY_MESSAGE);
        assert!(!broadcasts[0].message.contains(&case.title));
    }

    #[tokio::test]
    async fn test_alerts_follow_status() {
        let h = Harness::new();
        let case = h.dispatched_case(CasePriority::Medium).await;

        let case = h
            .cases
            .transition(case.id, CaseStatus::InProgress, "worker", None)
            .await
            .unwrap();
        assert!(case.alert_config.enabled);

        let case = h
            .cases
            .transition(case.id, CaseStatus::Resolved, "worker", None)
            .await
            .unwrap();
        assert!(!case.alert_config.enabled);
    }

    #[tokio::test]
    async fn test_close_schedules_retention_purge() {
        let h = Harness::new();
        let case = h.dispatched_case(CasePriority::Medium).await;
        h.cases
            .transition(case.id, CaseStatus::Resolved, "worker", None)
            .await
            .unwrap();
        let closed = h
            .cases
            .transition(case.id, CaseStatus::Closed, "worker", Some("reunited".to_string()))
            .await
            .unwrap();

        let cleanup_after = closed.cleanup_after.unwrap();
        assert_eq!(cleanup_after, closed.closed_at.unwrap() + Duration::days(30));
        assert!(closed.contact_info.is_some());

        assert_eq!(h.cases.run_retention_sweep(Utc::now()).await.unwrap(), 0);
        let purged = h
            .cases
            .run_retention_sweep(cleanup_after + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);

        let stored = h.cases.get(case.id).await.unwrap();
        assert!(stored.contact_info.is_none());
        assert_eq!(stored.description, PURGED_PLACEHOLDER);
        assert!(stored.purged_at.is_some());
        assert_eq!(stored.status, CaseStatus::Closed);
    }

    #[tokio::test]
    async fn test_cancel_purges_immediately() {
        let h = Harness::new();
        let case = h.cases.create(case_data(None, 24.8, 120.9), "worker").await.unwrap();
        let cancelled = h
            .cases
            .transition(case.id, CaseStatus::Cancelled, "worker", None)
            .await
            .unwrap();

        assert!(cancelled.contact_info.is_none());
        assert!(cancelled.subject_description.is_none());
        assert!(cancelled.purged_at.is_some());
        assert!(!cancelled.alert_config.enabled);

        let err = h
            .cases
            .transition(case.id, CaseStatus::Created, "worker", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
    }

    #[tokio::test]
    async fn test_assign_sets_assignee() {
        let h = Harness::new();
        let case = h.cases.create(case_data(None, 24.8, 120.9), "lead").await.unwrap();
        let case = h.cases.assign(case.id, "worker-7", "lead").await.unwrap();

        assert_eq!(case.status, CaseStatus::Assigned);
        assert_eq!(case.assigned_to.as_deref(), Some("worker-7"));
        assert_eq!(case.assigned_by.as_deref(), Some("lead"));

        let err = h.cases.assign(case.id, "worker-8", "lead").await.unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
        let stored = h.cases.get(case.id).await.unwrap();
        assert_eq!(stored.assigned_to.as_deref(), Some("worker-7"));
    }

    #[tokio::test]
    async fn test_unknown_case_is_not_found() {
        let h = Harness::new();
        let err = h
            .cases
            .transition(Uuid::now_v7(), CaseStatus::Assigned, "worker", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_escalate_raises_priority_and_moves_case() {
        let h = Harness::new();
        let case = h.cases.create(case_data(Some(CasePriority::High), 24.8, 120.9), "w").await.unwrap();

        let escalated = h
            .cases
            .escalate(case.id, Some(GeoPoint::new(24.81, 120.95)), "geofence")
            .await
            .unwrap();
        assert_eq!(escalated.priority, CasePriority::Critical);
        assert_eq!(escalated.alert_config.radius, 5000.0);
        assert_eq!(escalated.location.lat, 24.81);

        let again = h.cases.escalate(case.id, None, "geofence").await.unwrap();
        assert_eq!(again.priority, CasePriority::Critical);
    }

    #[tokio::test]
    async fn test_workflow_is_validated_independently() {
        let h = Harness::new();
        let case = h.cases.create(case_data(None, 24.8, 120.9), "w").await.unwrap();

        let err = h
            .cases
            .advance_workflow(case.id, WorkflowStage::Found, "w", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");

        for stage in [WorkflowStage::Verifying, WorkflowStage::Searching] {
            let outcome = h.cases.advance_workflow(case.id, stage, "w", None).await.unwrap();
            assert!(!outcome.divergent);
        }

        let outcome = h
            .cases
            .advance_workflow(case.id, WorkflowStage::Found, "w", None)
            .await
            .unwrap();
        assert!(outcome.divergent, "found while status is still created");
        assert_eq!(outcome.case.workflow_history.len(), 4);
        assert_eq!(outcome.case.status, CaseStatus::Created);
    }

    #[test]
    fn test_divergence_rules() {
        assert!(workflow_diverges(CaseStatus::Cancelled, WorkflowStage::Reunited));
        assert!(workflow_diverges(CaseStatus::InProgress, WorkflowStage::Archived));
        assert!(!workflow_diverges(CaseStatus::Dispatched, WorkflowStage::Searching));
        assert!(!workflow_diverges(CaseStatus::Closed, WorkflowStage::Archived));
    }

    #[tokio::test]
    async fn test_lifecycle_is_audited() {
        let h = Harness::new();
        let case = h.dispatched_case(CasePriority::Low).await;

        let records = crate::db::queries::list_audit_records(h.store.as_ref()).await.unwrap();
        let actions: Vec<&str> = records.iter().map(|r| r.action.as_str()).collect();
        assert!(actions.contains(&"case.create"));
        assert!(actions.contains(&"case.transition.dispatched"));
        assert!(records.iter().all(|r| r.entity_id == case.id.to_string()));
        // Dispatch alerts go to the area, never to a named target.
        assert!(h.notifier.alerts.lock().unwrap().is_empty());
    }
}
