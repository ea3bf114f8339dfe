//! Reclaim in-progress slots whose claim has outlived the timeout window.
//!
//! A sweep is one pass over a store snapshot. Each expired slot is released
//! with a conditional update pinned to the `(in_progress, claimed_by)` pair
//! and record version seen during the scan, so a completion, release, or
//! release-and-reclaim by the same worker that lands first makes the reclaim
//! a no-op.

use crate::clock::Clock;
use crate::error::SlotError;
use crate::model::{SlotKey, SlotStatus};
use crate::store::{CasOutcome, Mutation, SlotStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Record of one reclaimed slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReclaimAudit {
    pub task_id: i64,
    pub slot_num: u32,
    pub prior_worker: String,
    pub claimed_at: DateTime<Utc>,
    pub reclaimed_at: DateTime<Utc>,
    /// Whole seconds the claim was held.
    pub held_secs: i64,
}

impl ReclaimAudit {
    #[must_use]
    pub const fn key(&self) -> SlotKey {
        SlotKey::new(self.task_id, self.slot_num)
    }
}

/// Outcome of a single sweep pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Slots examined.
    pub scanned: usize,
    /// In-progress slots still inside the window.
    pub active: usize,
    pub reclaimed: Vec<ReclaimAudit>,
    /// Expired slots that changed before the reclaim landed.
    pub lost_races: usize,
}

impl SweepReport {
    #[must_use]
    pub fn reclaimed_count(&self) -> usize {
        self.reclaimed.len()
    }
}

pub struct Sweeper<S, C> {
    store: S,
    clock: C,
    timeout: chrono::Duration,
}

impl<S: SlotStore, C: Clock> Sweeper<S, C> {
    pub const fn new(store: S, clock: C, timeout: chrono::Duration) -> Self {
        Self {
            store,
            clock,
            timeout,
        }
    }

    pub const fn timeout(&self) -> chrono::Duration {
        self.timeout
    }

    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Whether a claim taken at `claimed_at` is past the window at `now`.
    #[must_use]
    pub fn is_expired(&self, claimed_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(claimed_at) >= self.timeout
    }

    /// Run one pass, optionally restricted to a single task.
    ///
    /// # Errors
    ///
    /// Returns [`SlotError::StoreUnavailable`] if the snapshot or an update
    /// fails. Reclaims applied before the failure stay applied.
    pub fn sweep(&self, task_id: Option<i64>) -> Result<SweepReport, SlotError> {
        let snapshot = self.store.list(task_id)?;
        let now = self.clock.now();
        let mut report = SweepReport {
            scanned: snapshot.len(),
            ..SweepReport::default()
        };

        for slot in snapshot {
            if slot.status != SlotStatus::InProgress {
                continue;
            }
            let (Some(worker), Some(claimed_at)) = (slot.claimed_by.as_deref(), slot.claimed_at)
            else {
                warn!(
                    task_id = slot.task_id,
                    slot_num = slot.slot_num,
                    "in-progress slot without claimant, skipping"
                );
                continue;
            };
            if !self.is_expired(claimed_at, now) {
                report.active += 1;
                continue;
            }

            let key = slot.key();
            match self.store.conditional_update_at_version(
                key,
                SlotStatus::InProgress,
                Some(worker),
                slot.version,
                &Mutation::Release,
            )? {
                CasOutcome::Applied(_) => {
                    let held = now.signed_duration_since(claimed_at);
                    info!(
                        task_id = key.task_id,
                        slot_num = key.slot_num,
                        prior_worker = worker,
                        claimed_at = %claimed_at.to_rfc3339(),
                        held_secs = held.num_seconds(),
                        "reclaimed timed-out slot"
                    );
                    report.reclaimed.push(ReclaimAudit {
                        task_id: key.task_id,
                        slot_num: key.slot_num,
                        prior_worker: worker.to_string(),
                        claimed_at,
                        reclaimed_at: now,
                        held_secs: held.num_seconds(),
                    });
                }
                CasOutcome::Conflict(observed) => {
                    debug!(
                        task_id = key.task_id,
                        slot_num = key.slot_num,
                        observed = %observed.status,
                        "slot changed before reclaim"
                    );
                    report.lost_races += 1;
                }
            }
        }

        debug!(
            scanned = report.scanned,
            active = report.active,
            reclaimed = report.reclaimed.len(),
            lost_races = report.lost_races,
            "sweep finished"
        );
        Ok(report)
    }

    /// Sweep every `interval` until `should_stop` returns true or
    /// `max_passes` passes have run. A failed pass is logged and skipped.
    ///
    /// Returns the number of passes run and the total slots reclaimed.
    pub fn run_periodic(
        &self,
        interval: Duration,
        max_passes: Option<usize>,
        mut should_stop: impl FnMut() -> bool,
    ) -> (usize, usize) {
        let mut passes = 0;
        let mut reclaimed = 0;

        loop {
            if should_stop() {
                break;
            }
            match self.sweep(None) {
                Ok(report) => reclaimed += report.reclaimed.len(),
                Err(err) => warn!(error = %err, "sweep pass failed"),
            }
            passes += 1;
            if max_passes.is_some_and(|max| passes >= max) {
                break;
            }
            std::thread::sleep(interval);
        }

        info!(passes, reclaimed, "periodic sweep stopped");
        (passes, reclaimed)
    }
}
