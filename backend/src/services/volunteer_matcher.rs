//! # Volunteer Matching Engine
//!
//! Keeps volunteer availability and location, scores candidates against a
//! case, and drives each match through its lifecycle.
//!
//! ## Scoring
//!
//! ```text
//! score = (distance + availability + experience) × priority
//!
//! distance     = max(0, (maxDistance − d) / maxDistance) × w_distance
//! availability = w_availability                (pool is available-only)
//! experience   = (rating / 5) × (1 + successRate)
//! priority     = multiplier[priority] × w_priority
//! ```
//!
//! `maxDistance` is the volunteer's own limit, or the case's search radius
//! (low 1000 m, medium 2000 m, high 3000 m, critical 5000 m).
//!
//! ## Match Lifecycle
//!
//! ```text
//! assigned ──accept──> accepted ──complete──> completed
//!     │
//!     └──reject / timeout──> rejected  (new matching round)
//! ```
//!
//! ## Consistency
//!
//! Every operation touching a case, a volunteer and a match locks all
//! three keys (sorted) and re-reads them under the lock. Assignment and
//! resolution write match, volunteer and case in that order and restore
//! the earlier writes when a later one fails.

use std::cmp::Ordering;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{AppConfig, MatchingWeights};
use crate::db::{
    queries, Capabilities, Case, CasePriority, CaseStatus, CompletionOutcome, GeoPoint, Match,
    MatchStatus, SharedStore, Volunteer, VolunteerPreferences, VolunteerStatus,
};
use crate::errors::DispatchError;
use crate::events::{EventBus, MatchingEvent, RoundTrigger};
use crate::notify::audit::snapshot;
use crate::notify::Auditor;
use crate::services::case_manager::CaseManager;
use crate::utils::{haversine_meters, round_meters, validate_coordinates, KeyedLocks};

/// Role given to volunteers assigned by a matching round.
pub const DEFAULT_ROLE: &str = "searcher";

/// Actor recorded for automatic assignments.
pub const MATCHING_ACTOR: &str = "matching-engine";

/// Rejection reason used when an assignment is never answered.
pub const TIMEOUT_REASON: &str = "timeout";

/// Rejection reason used when the case closes under an open match.
pub const CASE_CLOSED_REASON: &str = "case_closed";

/// Input for [`MatchingEngine::register_volunteer`].
#[derive(Debug, Clone, Default)]
pub struct NewVolunteer {
    pub id: String,
    pub display_name: Option<String>,
    pub location: Option<GeoPoint>,
    pub preferences: VolunteerPreferences,
    pub capabilities: Capabilities,
    pub rating: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Cap on candidates returned, further limited by the per-case cap.
    pub limit: Option<usize>,
    /// Volunteers to skip.
    pub exclude: Vec<String>,
}

/// A scored volunteer.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub volunteer_id: String,
    pub score: f64,
    /// Rounded to whole meters.
    pub distance_meters: f64,
}

/// Details of a single assignment.
#[derive(Debug, Clone)]
pub struct AssignmentRequest {
    pub assigned_by: String,
    pub role: Option<String>,
    pub score: Option<f64>,
    pub distance_meters: Option<f64>,
    pub estimated_arrival: Option<DateTime<Utc>>,
}

impl AssignmentRequest {
    pub fn by(actor: impl Into<String>) -> Self {
        Self {
            assigned_by: actor.into(),
            role: None,
            score: None,
            distance_meters: None,
            estimated_arrival: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoundOutcome {
    pub case_id: Uuid,
    pub trigger: RoundTrigger,
    pub candidates: Vec<Candidate>,
    pub assigned: Vec<Match>,
}

impl RoundOutcome {
    fn empty(case_id: Uuid, trigger: RoundTrigger) -> Self {
        Self {
            case_id,
            trigger,
            candidates: Vec::new(),
            assigned: Vec::new(),
        }
    }
}

/// The Volunteer Matching Engine.
#[derive(Clone)]
pub struct MatchingEngine {
    store: SharedStore,
    locks: KeyedLocks,
    events: EventBus,
    auditor: Auditor,
    cases: CaseManager,
    weights: MatchingWeights,
    max_per_case: usize,
    auto_assign: bool,
    assignment_timeout: Option<Duration>,
}

impl MatchingEngine {
    /// Create a new MatchingEngine.
    ///
    /// `locks` must be the registry the [`CaseManager`] uses; both write
    /// case records.
    pub fn new(
        store: SharedStore,
        locks: KeyedLocks,
        events: EventBus,
        auditor: Auditor,
        cases: CaseManager,
        config: &AppConfig,
    ) -> Self {
        Self {
            store,
            locks,
            events,
            auditor,
            cases,
            weights: config.weights,
            max_per_case: config.max_volunteers_per_case,
            auto_assign: config.auto_assign,
            assignment_timeout: config
                .assignment_timeout
                .map(|secs| Duration::seconds(secs as i64)),
        }
    }

    pub fn max_per_case(&self) -> usize {
        self.max_per_case
    }

    // ============================================
    // VOLUNTEERS
    // ============================================

    /// Register a volunteer, or update the profile of an existing one.
    ///
    /// Status, counters and current matches of an existing volunteer are
    /// kept.
    pub async fn register_volunteer(&self, data: NewVolunteer) -> Result<Volunteer, DispatchError> {
        let mut invalid = Vec::new();
        if data.id.trim().is_empty() {
            invalid.push("id".to_string());
        }
        if let Some(rating) = data.rating {
            if !(0.0..=5.0).contains(&rating) {
                invalid.push("rating".to_string());
            }
        }
        if let Some(point) = data.location {
            if let Err(fields) = validate_coordinates(point.lat, point.lng) {
                invalid.extend(fields.into_iter().map(|f| format!("location.{}", f)));
            }
        }
        if let Some(max) = data.preferences.max_distance {
            if !max.is_finite() || max <= 0.0 {
                invalid.push("preferences.maxDistance".to_string());
            }
        }
        if !invalid.is_empty() {
            return Err(DispatchError::validation(invalid, "invalid volunteer profile"));
        }

        let _guard = self.locks.lock(queries::volunteer_key(&data.id)).await;
        let now = Utc::now();
        let volunteer = match queries::get_volunteer(self.store.as_ref(), &data.id).await? {
            Some(mut existing) => {
                existing.display_name = data.display_name.or(existing.display_name);
                if data.location.is_some() {
                    existing.location = data.location;
                    existing.location_updated_at = Some(now);
                }
                existing.preferences = data.preferences;
                existing.capabilities = data.capabilities;
                if let Some(rating) = data.rating {
                    existing.rating = rating;
                }
                existing.updated_at = now;
                existing
            }
            None => Volunteer {
                id: data.id,
                display_name: data.display_name,
                location_updated_at: data.location.map(|_| now),
                location: data.location,
                preferences: data.preferences,
                capabilities: data.capabilities,
                status: VolunteerStatus::Available,
                rating: data.rating.unwrap_or(0.0),
                total_cases: 0,
                successful_cases: 0,
                current_matches: Vec::new(),
                created_at: now,
                updated_at: now,
            },
        };

        queries::put_volunteer(self.store.as_ref(), &volunteer).await?;
        info!("Registered volunteer {} ({})", volunteer.id, volunteer.status);
        Ok(volunteer)
    }

    pub async fn update_location(&self, id: &str, lat: f64, lng: f64) -> Result<Volunteer, DispatchError> {
        validate_coordinates(lat, lng)
            .map_err(|fields| DispatchError::validation(fields, "invalid coordinates"))?;

        let _guard = self.locks.lock(queries::volunteer_key(id)).await;
        let mut volunteer = self.get_volunteer(id).await?;
        let now = Utc::now();
        volunteer.location = Some(GeoPoint::new(lat, lng));
        volunteer.location_updated_at = Some(now);
        volunteer.updated_at = now;
        queries::put_volunteer(self.store.as_ref(), &volunteer).await?;

        debug!("Volunteer {} moved to ({}, {})", id, lat, lng);
        Ok(volunteer)
    }

    pub async fn get_volunteer(&self, id: &str) -> Result<Volunteer, DispatchError> {
        queries::get_volunteer(self.store.as_ref(), id)
            .await?
            .ok_or_else(|| DispatchError::not_found("volunteer", id))
    }

    pub async fn get_match(&self, id: Uuid) -> Result<Match, DispatchError> {
        queries::get_match(self.store.as_ref(), &id)
            .await?
            .ok_or_else(|| DispatchError::not_found("match", id))
    }

    pub async fn matches_for_case(&self, case_id: Uuid) -> Result<Vec<Match>, DispatchError> {
        Ok(queries::list_matches_for_case(self.store.as_ref(), &case_id).await?)
    }

    // ============================================
    // MATCHING
    // ============================================

    /// Score available volunteers against a case, best first.
    ///
    /// Volunteers already on the case or that declined it are skipped.
    pub async fn find_matches(&self, case_id: Uuid, options: FindOptions) -> Result<Vec<Candidate>, DispatchError> {
        let case = self.cases.get(case_id).await?;
        let volunteers = queries::list_volunteers(self.store.as_ref()).await?;

        let limit = options
            .limit
            .map_or(self.max_per_case, |l| l.min(self.max_per_case));
        let candidates = rank_candidates(&case, &volunteers, &options.exclude, &self.weights, limit);

        debug!(
            "Case {}: {} candidates from {} volunteers",
            case_id,
            candidates.len(),
            volunteers.len()
        );
        Ok(candidates)
    }

    /// Put one volunteer on a case.
    ///
    /// ## Errors
    ///
    /// * `NotFound` - Unknown case or volunteer
    /// * `InvalidState` - Case no longer open
    /// * `Unavailable` - Volunteer is not `available`
    /// * `CapacityExceeded` - Case already holds the maximum
    ///
    /// On error nothing is changed.
    pub async fn assign_volunteer(
        &self,
        case_id: Uuid,
        volunteer_id: &str,
        request: AssignmentRequest,
    ) -> Result<Match, DispatchError> {
        let record = {
            let _guard = self
                .locks
                .lock_many(vec![
                    queries::case_key(&case_id),
                    queries::volunteer_key(volunteer_id),
                ])
                .await;

            let mut case = self.cases.get(case_id).await?;
            let volunteer = self.get_volunteer(volunteer_id).await?;

            if !case.status.is_open() {
                return Err(DispatchError::InvalidState {
                    entity: "case",
                    id: case_id.to_string(),
                    expected: "open".to_string(),
                    actual: case.status.to_string(),
                });
            }
            if volunteer.status != VolunteerStatus::Available {
                return Err(DispatchError::Unavailable {
                    volunteer_id: volunteer_id.to_string(),
                    status: volunteer.status.to_string(),
                });
            }
            if !case.has_capacity(self.max_per_case) {
                return Err(DispatchError::CapacityExceeded {
                    case_id,
                    cap: self.max_per_case,
                });
            }

            let now = Utc::now();
            let record = Match {
                id: Uuid::new_v4(),
                case_id,
                volunteer_id: volunteer_id.to_string(),
                status: MatchStatus::Assigned,
                role: request.role.unwrap_or_else(|| DEFAULT_ROLE.to_string()),
                score: request.score,
                distance_meters: request.distance_meters,
                assigned_by: request.assigned_by,
                assigned_at: now,
                accepted_at: None,
                rejected_at: None,
                completed_at: None,
                estimated_arrival: request.estimated_arrival,
                rejection_reason: None,
                outcome: None,
            };

            let mut updated = volunteer.clone();
            updated.current_matches.push(record.id);
            updated.status = VolunteerStatus::Assigned;
            updated.updated_at = now;

            case.assigned_volunteers.push(volunteer_id.to_string());
            case.updated_at = now;

            queries::put_match(self.store.as_ref(), &record).await?;
            if let Err(e) = queries::put_volunteer(self.store.as_ref(), &updated).await {
                self.undo_match(&record.id).await;
                return Err(e.into());
            }
            if let Err(e) = queries::put_case(self.store.as_ref(), &case).await {
                if let Err(undo) = queries::put_volunteer(self.store.as_ref(), &volunteer).await {
                    error!("Failed to restore volunteer {}: {}", volunteer.id, undo);
                }
                self.undo_match(&record.id).await;
                return Err(e.into());
            }

            record
        };

        info!(
            "Assigned volunteer {} to case {} (match {})",
            volunteer_id, case_id, record.id
        );
        self.auditor
            .record(&record.assigned_by, "match.assign", record.id, None, snapshot(&record))
            .await;
        self.events.publish_matching(MatchingEvent::VolunteerAssigned {
            match_id: record.id,
            case_id,
            volunteer_id: volunteer_id.to_string(),
        });

        Ok(record)
    }

    async fn undo_match(&self, id: &Uuid) {
        if let Err(e) = queries::delete_match(self.store.as_ref(), id).await {
            error!("Failed to roll back match {}: {}", id, e);
        }
    }

    /// Record a volunteer's answer to an assignment.
    ///
    /// Rejection frees the volunteer, takes them off the case for good and
    /// starts a new matching round.
    pub async fn respond_to_assignment(
        &self,
        match_id: Uuid,
        accepted: bool,
        reason: Option<String>,
    ) -> Result<Match, DispatchError> {
        let record = self
            .resolve_match(match_id, MatchStatus::Assigned, |record, now| {
                if accepted {
                    record.status = MatchStatus::Accepted;
                    record.accepted_at = Some(now);
                } else {
                    record.status = MatchStatus::Rejected;
                    record.rejected_at = Some(now);
                    record.rejection_reason = reason.clone();
                }
            })
            .await?;

        let actor = record.volunteer_id.clone();
        if accepted {
            info!("Volunteer {} accepted case {}", actor, record.case_id);
            self.auditor
                .record(&actor, "match.accept", record.id, None, snapshot(&record))
                .await;
            self.events.publish_matching(MatchingEvent::AssignmentAccepted {
                match_id: record.id,
                case_id: record.case_id,
                volunteer_id: actor,
            });
        } else {
            info!(
                "Volunteer {} rejected case {} ({})",
                actor,
                record.case_id,
                reason.as_deref().unwrap_or("no reason")
            );
            self.auditor
                .record(&actor, "match.reject", record.id, None, snapshot(&record))
                .await;
            self.events.publish_matching(MatchingEvent::AssignmentRejected {
                match_id: record.id,
                case_id: record.case_id,
                volunteer_id: actor,
                reason,
            });

            if let Err(e) = self
                .run_round(record.case_id, RoundTrigger::AssignmentRejected)
                .await
            {
                warn!("Re-matching case {} failed: {}", record.case_id, e);
            }
        }

        Ok(record)
    }

    /// Close an accepted assignment.
    ///
    /// When the subject was found the case is moved to `resolved` if its
    /// status allows it.
    pub async fn complete_assignment(
        &self,
        match_id: Uuid,
        completion: CompletionOutcome,
    ) -> Result<Match, DispatchError> {
        let found = completion.found;
        let record = self
            .resolve_match(match_id, MatchStatus::Accepted, |record, now| {
                record.status = MatchStatus::Completed;
                record.completed_at = Some(now);
                record.outcome = Some(completion.clone());
            })
            .await?;

        let actor = record.volunteer_id.clone();
        info!(
            "Volunteer {} completed case {} (found: {})",
            actor, record.case_id, found
        );
        self.auditor
            .record(&actor, "match.complete", record.id, None, snapshot(&record))
            .await;
        self.events.publish_matching(MatchingEvent::AssignmentCompleted {
            match_id: record.id,
            case_id: record.case_id,
            volunteer_id: actor.clone(),
            found,
        });

        if found {
            self.resolve_found_case(record.case_id, &actor).await;
        }

        Ok(record)
    }

    /// Best-effort follow-up of a successful completion; the completion
    /// itself is already persisted.
    async fn resolve_found_case(&self, case_id: Uuid, actor: &str) {
        let result = self
            .cases
            .transition(case_id, CaseStatus::Resolved, actor, Some("subject found".to_string()))
            .await;
        match result {
            Ok(_) => info!("Case {} resolved: subject found", case_id),
            Err(DispatchError::InvalidTransition { from, .. }) => {
                info!("Case {} is {}, not resolving on completion", case_id, from);
            }
            Err(e) => warn!("Failed to resolve case {} after completion: {}", case_id, e),
        }
    }

    /// Move a match out of `expected` and settle the volunteer and case.
    ///
    /// `apply` sets the new match status; every status other than
    /// `accepted` takes the volunteer off the case.
    async fn resolve_match<F>(&self, match_id: Uuid, expected: MatchStatus, apply: F) -> Result<Match, DispatchError>
    where
        F: FnOnce(&mut Match, DateTime<Utc>),
    {
        let peek = self.get_match(match_id).await?;

        let _guard = self
            .locks
            .lock_many(vec![
                queries::match_key(&match_id),
                queries::case_key(&peek.case_id),
                queries::volunteer_key(&peek.volunteer_id),
            ])
            .await;

        let mut record = self.get_match(match_id).await?;
        if record.status != expected {
            return Err(DispatchError::InvalidState {
                entity: "match",
                id: match_id.to_string(),
                expected: expected.to_string(),
                actual: record.status.to_string(),
            });
        }

        let original = record.clone();
        let now = Utc::now();
        apply(&mut record, now);
        let found = record
            .outcome
            .as_ref()
            .map_or(false, |o| o.found && record.status == MatchStatus::Completed);

        let original_volunteer = self.get_volunteer(&record.volunteer_id).await?;
        let mut volunteer = original_volunteer.clone();
        let mut case = self.cases.get(record.case_id).await?;

        if record.status == MatchStatus::Accepted {
            volunteer.status = VolunteerStatus::Active;
        } else {
            volunteer.current_matches.retain(|id| id != &match_id);
            if record.status == MatchStatus::Completed {
                volunteer.total_cases += 1;
                if found {
                    volunteer.successful_cases += 1;
                }
            }
            let accepted_elsewhere = self.any_accepted(&volunteer.current_matches).await?;
            volunteer.settle_status(accepted_elsewhere);

            case.assigned_volunteers.retain(|v| v != &record.volunteer_id);
            if record.status == MatchStatus::Rejected
                && !case.declined_volunteers.contains(&record.volunteer_id)
            {
                case.declined_volunteers.push(record.volunteer_id.clone());
            }
            case.updated_at = now;
        }
        volunteer.updated_at = now;

        queries::put_match(self.store.as_ref(), &record).await?;
        if let Err(e) = queries::put_volunteer(self.store.as_ref(), &volunteer).await {
            self.restore_match(&original).await;
            return Err(e.into());
        }
        if record.status != MatchStatus::Accepted {
            if let Err(e) = queries::put_case(self.store.as_ref(), &case).await {
                if let Err(undo) = queries::put_volunteer(self.store.as_ref(), &original_volunteer).await {
                    error!("Failed to restore volunteer {}: {}", original_volunteer.id, undo);
                }
                self.restore_match(&original).await;
                return Err(e.into());
            }
        }

        Ok(record)
    }

    async fn restore_match(&self, original: &Match) {
        if let Err(e) = queries::put_match(self.store.as_ref(), original).await {
            error!("Failed to restore match {}: {}", original.id, e);
        }
    }

    async fn any_accepted(&self, match_ids: &[Uuid]) -> Result<bool, DispatchError> {
        for id in match_ids {
            if let Some(m) = queries::get_match(self.store.as_ref(), id).await? {
                if m.status == MatchStatus::Accepted {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Free every volunteer still holding an unresolved match on a case.
    ///
    /// Called when a case closes or is cancelled. Does not start a round.
    pub async fn release_case(&self, case_id: Uuid) -> Result<usize, DispatchError> {
        let open: Vec<Match> = self
            .matches_for_case(case_id)
            .await?
            .into_iter()
            .filter(|m| m.status.is_unresolved())
            .collect();

        let mut released = 0;
        for record in open {
            let expected = record.status;
            let result = self
                .resolve_match(record.id, expected, |m, now| {
                    m.status = MatchStatus::Rejected;
                    m.rejected_at = Some(now);
                    m.rejection_reason = Some(CASE_CLOSED_REASON.to_string());
                })
                .await;

            match result {
                Ok(record) => {
                    released += 1;
                    self.events.publish_matching(MatchingEvent::AssignmentRejected {
                        match_id: record.id,
                        case_id,
                        volunteer_id: record.volunteer_id,
                        reason: Some(CASE_CLOSED_REASON.to_string()),
                    });
                }
                Err(DispatchError::InvalidState { .. }) => {
                    debug!("Match {} resolved concurrently", record.id);
                }
                Err(e) => return Err(e),
            }
        }

        if released > 0 {
            info!("Released {} volunteers from case {}", released, case_id);
        }
        Ok(released)
    }

    /// Release every unresolved match whose case is already closed or
    /// cancelled.
    ///
    /// Catches closures whose release never ran, e.g. a `case_closed`
    /// event dropped by a lagging listener.
    ///
    /// ## Returns
    ///
    /// Number of matches released.
    pub async fn release_closed_cases(&self) -> Result<usize, DispatchError> {
        let mut case_ids: Vec<Uuid> = queries::list_matches(self.store.as_ref())
            .await?
            .into_iter()
            .filter(|m| m.status.is_unresolved())
            .map(|m| m.case_id)
            .collect();
        case_ids.sort();
        case_ids.dedup();

        let mut released = 0;
        for case_id in case_ids {
            let closed = match queries::get_case(self.store.as_ref(), &case_id).await? {
                Some(case) => case.status.is_terminal(),
                None => false,
            };
            if closed {
                released += self.release_case(case_id).await?;
            }
        }
        Ok(released)
    }

    /// Reject assignments left unanswered past the configured timeout.
    ///
    /// No-op when the timeout is disabled.
    pub async fn expire_stale_assignments(&self, now: DateTime<Utc>) -> Result<usize, DispatchError> {
        let Some(timeout) = self.assignment_timeout else {
            return Ok(0);
        };

        let stale: Vec<Uuid> = queries::list_matches(self.store.as_ref())
            .await?
            .into_iter()
            .filter(|m| m.status == MatchStatus::Assigned && m.assigned_at + timeout <= now)
            .map(|m| m.id)
            .collect();

        let mut expired = 0;
        for id in stale {
            match self
                .respond_to_assignment(id, false, Some(TIMEOUT_REASON.to_string()))
                .await
            {
                Ok(_) => expired += 1,
                Err(DispatchError::InvalidState { .. }) => {
                    debug!("Match {} answered before timing out", id);
                }
                Err(e) => warn!("Failed to expire match {}: {}", id, e),
            }
        }

        if expired > 0 {
            info!("Expired {} unanswered assignments", expired);
        }
        Ok(expired)
    }

    // ============================================
    // ROUNDS
    // ============================================

    /// Find candidates for a case and, with auto-assign on, assign the best
    /// ones up to the remaining capacity.
    pub async fn run_round(&self, case_id: Uuid, trigger: RoundTrigger) -> Result<RoundOutcome, DispatchError> {
        let case = self.cases.get(case_id).await?;
        if !case.status.is_open() {
            debug!("Skipping round for case {} ({})", case_id, case.status);
            return Ok(RoundOutcome::empty(case_id, trigger));
        }

        let remaining = self.max_per_case.saturating_sub(case.assigned_volunteers.len());
        if remaining == 0 {
            return Ok(RoundOutcome::empty(case_id, trigger));
        }

        let mut outcome = RoundOutcome::empty(case_id, trigger);
        outcome.candidates = self.find_matches(case_id, FindOptions::default()).await?;

        if self.auto_assign {
            for candidate in &outcome.candidates {
                if outcome.assigned.len() >= remaining {
                    break;
                }
                let request = AssignmentRequest {
                    score: Some(candidate.score),
                    distance_meters: Some(candidate.distance_meters),
                    ..AssignmentRequest::by(MATCHING_ACTOR)
                };
                match self
                    .assign_volunteer(case_id, &candidate.volunteer_id, request)
                    .await
                {
                    Ok(record) => outcome.assigned.push(record),
                    Err(DispatchError::Unavailable { .. }) => {
                        debug!("Candidate {} taken by another case", candidate.volunteer_id);
                    }
                    Err(DispatchError::CapacityExceeded { .. } | DispatchError::InvalidState { .. }) => break,
                    Err(e) => return Err(e),
                }
            }
        }

        info!(
            "Matching round for case {} ({:?}): {} candidates, {} assigned",
            case_id,
            trigger,
            outcome.candidates.len(),
            outcome.assigned.len()
        );
        self.events.publish_matching(MatchingEvent::RoundCompleted {
            case_id,
            trigger,
            candidates: outcome.candidates.len(),
            assigned: outcome
                .assigned
                .iter()
                .map(|m| m.volunteer_id.clone())
                .collect(),
        });

        Ok(outcome)
    }

    /// Run a round for every open case below its cap.
    ///
    /// ## Returns
    ///
    /// Number of rounds run. A failing round is logged and skipped.
    pub async fn run_sweep(&self) -> Result<usize, DispatchError> {
        let cases = self.cases.list(None).await?;
        let mut rounds = 0;
        for case in cases {
            if !case.status.is_open() || !case.has_capacity(self.max_per_case) {
                continue;
            }
            match self.run_round(case.id, RoundTrigger::Periodic).await {
                Ok(_) => rounds += 1,
                Err(e) => warn!("Periodic round for case {} failed: {}", case.id, e),
            }
        }
        Ok(rounds)
    }
}

/// Score one volunteer for a case at distance `distance`.
pub fn score_candidate(
    priority: CasePriority,
    volunteer: &Volunteer,
    distance: f64,
    max_distance: f64,
    weights: &MatchingWeights,
) -> f64 {
    let distance_score = ((max_distance - distance) / max_distance).max(0.0) * weights.distance;
    let availability_score = if volunteer.status == VolunteerStatus::Available {
        weights.availability
    } else {
        0.0
    };
    let experience_score = (volunteer.rating / 5.0) * (1.0 + volunteer.success_rate());
    let priority_score = priority.multiplier() * weights.priority;

    (distance_score + availability_score + experience_score) * priority_score
}

/// Rank the eligible volunteers for `case`, best first, at most `limit`.
pub fn rank_candidates(
    case: &Case,
    volunteers: &[Volunteer],
    exclude: &[String],
    weights: &MatchingWeights,
    limit: usize,
) -> Vec<Candidate> {
    let center = case.location.point();

    let mut candidates: Vec<Candidate> = volunteers
        .iter()
        .filter(|v| v.status == VolunteerStatus::Available)
        .filter(|v| !exclude.contains(&v.id))
        .filter(|v| !case.declined_volunteers.contains(&v.id))
        .filter(|v| !case.assigned_volunteers.contains(&v.id))
        .filter_map(|v| {
            let location = v.location?;
            let distance = haversine_meters(center, location);
            let max_distance = v
                .preferences
                .max_distance
                .unwrap_or_else(|| case.priority.search_radius_meters());
            let score = score_candidate(case.priority, v, distance, max_distance, weights);
            (distance <= max_distance && score > 0.0).then(|| Candidate {
                volunteer_id: v.id.clone(),
                score,
                distance_meters: round_meters(distance),
            })
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                a.distance_meters
                    .partial_cmp(&b.distance_meters)
                    .unwrap_or(Ordering::Equal)
            })
    });
    candidates.truncate(limit);
    candidates
}
