//! Operator views and overrides.
//!
//! Everything here delegates to [`Allocator`] and [`Sweeper`]; the admin
//! layer only decides which slots to feed them.

use crate::alloc::{Allocator, ReleaseOutcome};
use crate::clock::Clock;
use crate::error::SlotError;
use crate::model::{Slot, SlotKey, SlotStatus};
use crate::store::SlotStore;
use crate::sweep::{SweepReport, Sweeper};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// A slot annotated for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotView {
    #[serde(flatten)]
    pub slot: Slot,
    /// Seconds since the claim, for in-progress slots.
    pub elapsed_secs: Option<i64>,
    pub timed_out: bool,
}

/// Per-task slot counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: i64,
    pub slot_count: usize,
    pub available: usize,
    pub in_progress: usize,
    pub completed: usize,
    /// In-progress slots past the timeout window, not yet swept.
    pub timed_out: usize,
}

pub struct Admin<S, C> {
    allocator: Allocator<S, C>,
    sweeper: Sweeper<S, C>,
}

impl<S: SlotStore, C: Clock> Admin<S, C> {
    pub const fn new(allocator: Allocator<S, C>, sweeper: Sweeper<S, C>) -> Self {
        Self { allocator, sweeper }
    }

    pub const fn allocator(&self) -> &Allocator<S, C> {
        &self.allocator
    }

    pub const fn sweeper(&self) -> &Sweeper<S, C> {
        &self.sweeper
    }

    fn snapshot(&self, task_id: Option<i64>) -> Result<Vec<Slot>, SlotError> {
        let slots = self.allocator.store().list(task_id)?;
        match task_id {
            Some(id) if slots.is_empty() => Err(SlotError::TaskNotFound { task_id: id }),
            _ => Ok(slots),
        }
    }

    /// Every slot (or one task's), with elapsed time and timeout flags.
    ///
    /// # Errors
    ///
    /// [`SlotError::TaskNotFound`] for an unknown `task_id`, or a store error.
    pub fn list_slots(&self, task_id: Option<i64>) -> Result<Vec<SlotView>, SlotError> {
        let now = self.allocator.clock().now();
        let views = self
            .snapshot(task_id)?
            .into_iter()
            .map(|slot| {
                let timed_out = slot.status == SlotStatus::InProgress
                    && slot
                        .claimed_at
                        .is_some_and(|at| self.sweeper.is_expired(at, now));
                SlotView {
                    elapsed_secs: slot.held_for(now).map(|held| held.num_seconds()),
                    timed_out,
                    slot,
                }
            })
            .collect();
        Ok(views)
    }

    /// Release one slot regardless of who holds it.
    ///
    /// # Errors
    ///
    /// As [`Allocator::release_slot`].
    pub fn force_release(&self, key: SlotKey) -> Result<ReleaseOutcome, SlotError> {
        self.allocator.release_slot(key, None)
    }

    /// Release every in-progress slot of `task_id`.
    ///
    /// Slots that complete between the scan and the release are skipped.
    ///
    /// # Errors
    ///
    /// [`SlotError::TaskNotFound`] for an unknown task, or a store error.
    pub fn release_all(&self, task_id: i64) -> Result<Vec<(SlotKey, ReleaseOutcome)>, SlotError> {
        let mut released = Vec::new();
        for slot in self.snapshot(Some(task_id))? {
            if slot.status != SlotStatus::InProgress {
                continue;
            }
            let key = slot.key();
            match self.allocator.release_slot(key, None) {
                Ok(outcome) => released.push((key, outcome)),
                Err(SlotError::InvalidTransition { .. }) => {
                    debug!(
                        task_id,
                        slot_num = key.slot_num,
                        "slot completed before release, skipping"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        info!(task_id, released = released.len(), "released task slots");
        Ok(released)
    }

    /// One sweep over every task.
    ///
    /// # Errors
    ///
    /// As [`Sweeper::sweep`].
    pub fn cleanup(&self) -> Result<SweepReport, SlotError> {
        self.sweeper.sweep(None)
    }

    /// Slot counts grouped by task, ordered by task id.
    ///
    /// # Errors
    ///
    /// Returns a store error if the snapshot fails.
    pub fn task_summaries(&self) -> Result<Vec<TaskSummary>, SlotError> {
        let mut by_task: BTreeMap<i64, TaskSummary> = BTreeMap::new();
        for view in self.list_slots(None)? {
            let summary = by_task
                .entry(view.slot.task_id)
                .or_insert_with(|| TaskSummary {
                    task_id: view.slot.task_id,
                    ..TaskSummary::default()
                });
            summary.slot_count += 1;
            match view.slot.status {
                SlotStatus::Available => summary.available += 1,
                SlotStatus::InProgress => summary.in_progress += 1,
                SlotStatus::Completed => summary.completed += 1,
            }
            if view.timed_out {
                summary.timed_out += 1;
            }
        }
        Ok(by_task.into_values().collect())
    }
}
