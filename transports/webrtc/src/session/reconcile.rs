//! Reconciliation of the desired session set against stream state
//!
//! An external policy decides which sessions should be watched (for
//! instance every active attempt of an exam) and publishes that set on a
//! `watch` channel. The loop reacts to every change; it never polls for
//! reconciliation itself. The optional negotiation deadline adds a
//! periodic sweep that force re-requests sessions stuck in `waiting` or
//! `connecting`, or sitting in `error`, longer than the deadline.

use super::identity::{ParticipantId, SessionId};
use super::store::{StreamStateStore, StreamStatus};
use crate::peer::ViewerService;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Desired set: session to the participant whose stream it carries
pub type DesiredSessions = HashMap<SessionId, ParticipantId>;

const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(10);

/// What one reconciliation pass did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Sessions a stream request was issued for
    pub requested: Vec<SessionId>,
    /// Sessions torn down because they are no longer desired
    pub stopped: Vec<SessionId>,
}

/// Keeps viewer links in sync with the desired session set
pub struct ReconciliationLoop {
    viewer: Arc<ViewerService>,
    store: Arc<StreamStateStore>,
    deadline: Option<Duration>,
}

impl ReconciliationLoop {
    /// Create a loop driving `viewer`
    ///
    /// # Arguments
    ///
    /// * `viewer` - Viewer service owning the links
    /// * `deadline` - Negotiation deadline; `None` disables the stale sweep
    pub fn new(viewer: Arc<ViewerService>, deadline: Option<Duration>) -> Self {
        let store = Arc::clone(viewer.store());
        Self {
            viewer,
            store,
            deadline,
        }
    }

    /// One reconciliation pass.
    ///
    /// Every desired session that is idle (or unknown) and has no
    /// outstanding request gets a stream request. Every session with a
    /// link, a pending request or a stream handle that is no longer desired
    /// is torn down to idle.
    pub fn reconcile(&self, desired: &DesiredSessions) -> ReconcileReport {
        self.viewer.set_desired(desired.clone());
        let mut report = ReconcileReport::default();

        for session in desired.keys() {
            let state = self.store.ensure(session);
            if state.status != StreamStatus::Idle || self.viewer.is_requested(session) {
                continue;
            }
            match self.viewer.request_stream(session, false) {
                Ok(()) => report.requested.push(session.clone()),
                Err(e) => warn!(session = %session, "Stream request failed: {}", e),
            }
        }

        let mut undesired: Vec<SessionId> = self
            .viewer
            .active_sessions()
            .into_iter()
            .filter(|session| !desired.contains_key(session))
            .collect();
        for (session, state) in self.store.snapshot() {
            if state.stream.is_some() && !desired.contains_key(&session) && !undesired.contains(&session) {
                undesired.push(session);
            }
        }

        for session in undesired {
            self.viewer.stop_stream(&session);
            report.stopped.push(session);
        }

        if !report.requested.is_empty() || !report.stopped.is_empty() {
            info!(
                requested = report.requested.len(),
                stopped = report.stopped.len(),
                "Reconciled desired sessions"
            );
        }

        report
    }

    /// Force re-request desired sessions stuck past the deadline.
    ///
    /// Returns the sessions re-requested. Does nothing without a deadline.
    pub fn sweep_stale(&self, now: Instant) -> Vec<SessionId> {
        let Some(deadline) = self.deadline else {
            return Vec::new();
        };

        let mut retried = Vec::new();
        for session in self.viewer.desired().keys() {
            let Some(state) = self.store.get(session) else {
                continue;
            };
            let stuck = matches!(
                state.status,
                StreamStatus::Waiting | StreamStatus::Connecting | StreamStatus::Error
            );
            if !stuck || now.saturating_duration_since(state.updated_at) < deadline {
                continue;
            }

            debug!(session = %session, status = %state.status, "Session past negotiation deadline");
            match self.viewer.request_stream(session, true) {
                Ok(()) => retried.push(session.clone()),
                Err(e) => warn!(session = %session, "Forced re-request failed: {}", e),
            }
        }
        retried
    }

    /// Retry after the relay came back: force re-request sessions in error
    /// and request idle ones
    pub fn retry_failed(&self) -> Vec<SessionId> {
        let mut retried = Vec::new();
        for session in self.viewer.desired().keys() {
            let force = match self.store.status(session) {
                StreamStatus::Error => true,
                StreamStatus::Idle if !self.viewer.is_requested(session) => false,
                _ => continue,
            };
            match self.viewer.request_stream(session, force) {
                Ok(()) => retried.push(session.clone()),
                Err(e) => warn!(session = %session, "Re-request after reconnect failed: {}", e),
            }
        }
        if !retried.is_empty() {
            info!("Re-requested {} sessions after relay reconnect", retried.len());
        }
        retried
    }

    /// Run until the desired-set sender is dropped
    pub async fn run(&self, mut desired_rx: watch::Receiver<DesiredSessions>) {
        let mut reconnections = self.viewer.watch_reconnections();
        let mut sweep = self.deadline.map(|deadline| {
            let mut interval = tokio::time::interval((deadline / 2).max(MIN_SWEEP_PERIOD));
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        let desired = desired_rx.borrow_and_update().clone();
        self.reconcile(&desired);

        loop {
            tokio::select! {
                changed = desired_rx.changed() => {
                    if changed.is_err() {
                        info!("Desired session source closed, stopping reconciliation");
                        break;
                    }
                    let desired = desired_rx.borrow_and_update().clone();
                    self.reconcile(&desired);
                }
                changed = reconnections.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.retry_failed();
                }
                _ = next_tick(&mut sweep) => {
                    self.sweep_stale(Instant::now());
                }
            }
        }
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
