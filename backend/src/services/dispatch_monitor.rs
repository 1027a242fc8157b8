//! # Dispatch Monitor Service
//!
//! Background task driving the periodic work of the engine.
//!
//! ## Monitoring Flow
//!
//! ```text
//! DispatchMonitor (background task)
//!              │
//!              ├── Every 60s (configurable): release volunteers held by closed
//!              │                             cases, then a matching sweep
//!              │                             over open cases
//!              │
//!              ├── Every 1h (configurable): retention purge of closed cases
//!              │
//!              ├── Every timeout/2 (only if enabled): expire unanswered assignments
//!              │
//!              └── Shutdown signal: stop after the current tick
//! ```

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::services::case_manager::CaseManager;
use crate::services::volunteer_matcher::MatchingEngine;

/// Upper bound on one matching sweep.
const SWEEP_TIMEOUT: Duration = Duration::from_secs(30);

/// The Dispatch Monitor service.
///
/// ## Usage
///
/// ```rust,ignore
/// let monitor = DispatchMonitor::new(matcher, cases, &config);
/// let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
///
/// tokio::spawn(async move {
///     monitor.start(shutdown_rx).await;
/// });
/// ```
#[derive(Clone)]
pub struct DispatchMonitor {
    matcher: MatchingEngine,
    cases: CaseManager,
    matching_interval: Duration,
    retention_interval: Duration,
    /// `None` when assignment timeouts are disabled.
    timeout_interval: Option<Duration>,
}

impl DispatchMonitor {
    pub fn new(matcher: MatchingEngine, cases: CaseManager, config: &AppConfig) -> Self {
        Self {
            matcher,
            cases,
            matching_interval: Duration::from_secs(config.matching_interval.max(1)),
            retention_interval: Duration::from_secs(config.retention_sweep_interval.max(1)),
            timeout_interval: config
                .assignment_timeout
                .map(|secs| Duration::from_secs((secs / 2).max(1))),
        }
    }

    /// Start the monitoring loop; returns once `shutdown` flips.
    ///
    /// ## Checks Performed
    ///
    /// | Check | Interval | Description |
    /// |-------|----------|-------------|
    /// | Matching sweep | `MATCHING_INTERVAL_SECS` | Re-run rounds for cases below their cap |
    /// | Retention sweep | `RETENTION_SWEEP_INTERVAL_SECS` | Purge personal data of expired closed cases |
    /// | Assignment timeout | half of `ASSIGNMENT_TIMEOUT_SECS` | Reject unanswered assignments |
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting Dispatch Monitor service");

        let mut matching_ticker = interval(self.matching_interval);
        matching_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retention_ticker = interval(self.retention_interval);
        retention_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let timeouts_enabled = self.timeout_interval.is_some();
        let mut timeout_ticker = interval(self.timeout_interval.unwrap_or(Duration::from_secs(3600)));

        loop {
            tokio::select! {
                _ = matching_ticker.tick() => self.matching_sweep().await,

                _ = retention_ticker.tick() => {
                    if let Err(e) = self.cases.run_retention_sweep(Utc::now()).await {
                        error!("Retention sweep failed: {}", e);
                    }
                }

                _ = timeout_ticker.tick(), if timeouts_enabled => {
                    if let Err(e) = self.matcher.expire_stale_assignments(Utc::now()).await {
                        error!("Assignment timeout sweep failed: {}", e);
                    }
                }

                _ = shutdown.changed() => {
                    info!("Dispatch Monitor shutting down");
                    break;
                }
            }
        }
    }

    /// One matching tick. Runs on its own task so the timeout stops the
    /// wait, never an assignment halfway through its writes.
    async fn matching_sweep(&self) {
        debug!("Running matching sweep");
        let matcher = self.matcher.clone();
        let sweep = tokio::spawn(async move {
            match matcher.release_closed_cases().await {
                Ok(0) => {}
                Ok(n) => info!("Released {} assignments on closed cases", n),
                Err(e) => error!("Closed-case reconcile failed: {}", e),
            }
            matcher.run_sweep().await
        });

        match timeout(SWEEP_TIMEOUT, sweep).await {
            Ok(Ok(Ok(rounds))) => debug!("Matching sweep ran {} rounds", rounds),
            Ok(Ok(Err(e))) => error!("Matching sweep failed: {}", e),
            Ok(Err(e)) => error!("Matching sweep panicked: {}", e),
            Err(_) => warn!("Matching sweep still running after {:?}", SWEEP_TIMEOUT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CasePriority, VolunteerStatus};
    use crate::services::testkit::{case_data, Harness};

    #[tokio::test]
    async fn test_first_tick_sweeps_and_shutdown_stops() {
        let h = Harness::new();
        let case = h
            .cases
            .create(case_data(Some(CasePriority::Medium), 24.8, 120.9), "w")
            .await
            .unwrap();
        h.volunteer_at("v-1", 24.8, 120.9, 4.0).await;

        let monitor = DispatchMonitor::new(h.matcher.clone(), h.cases.clone(), &h.config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { monitor.start(shutdown_rx).await });

        // Tokio intervals fire immediately on the first tick.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let v = h.matcher.get_volunteer("v-1").await.unwrap();
                if v.status == VolunteerStatus::Assigned {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sweep never assigned the volunteer");

        let case = h.cases.get(case.id).await.unwrap();
        assert_eq!(case.assigned_volunteers, vec!["v-1"]);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("monitor ignored shutdown")
            .unwrap();
    }

    #[test]
    fn test_timeout_ticker_only_when_configured() {
        let h = Harness::new();
        let monitor = DispatchMonitor::new(h.matcher.clone(), h.cases.clone(), &h.config);
        assert!(monitor.timeout_interval.is_none());

        let mut config = AppConfig::default();
        config.assignment_timeout = Some(600);
        let monitor = DispatchMonitor::new(h.matcher.clone(), h.cases.clone(), &config);
        assert_eq!(monitor.timeout_interval, Some(Duration::from_secs(300)));
    }
}
