//! Claim, complete, and release against a [`SlotStore`].
//!
//! The allocator keeps no state of its own. Every decision is made from a
//! fresh store read and enforced with one conditional update; contention is
//! handled optimistically by re-reading and retrying a bounded number of
//! times.

use crate::clock::Clock;
use crate::config::AllocationConfig;
use crate::error::{LimitReason, SlotError};
use crate::model::{Slot, SlotKey, SlotStatus};
use crate::store::{CasOutcome, Mutation, SlotStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Per-worker limits and retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationPolicy {
    pub max_tasks_per_worker: u32,
    pub max_claim_attempts: u32,
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        Self::from(&AllocationConfig::default())
    }
}

impl From<&AllocationConfig> for AllocationPolicy {
    fn from(config: &AllocationConfig) -> Self {
        Self {
            max_tasks_per_worker: config.max_tasks_per_worker,
            max_claim_attempts: config.max_claim_attempts.max(1),
        }
    }
}

/// A successful claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub task_id: i64,
    pub slot_num: u32,
    pub worker_id: String,
    pub claimed_at: DateTime<Utc>,
    /// CAS attempts used, including the winning one.
    pub attempts: u32,
}

impl Claim {
    #[must_use]
    pub const fn key(&self) -> SlotKey {
        SlotKey::new(self.task_id, self.slot_num)
    }
}

/// Result of [`Allocator::complete_slot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompleteOutcome {
    /// This call moved the slot to completed.
    Completed(Slot),
    /// The worker had already completed the slot; nothing changed.
    AlreadyCompleted(Slot),
}

impl CompleteOutcome {
    #[must_use]
    pub const fn slot(&self) -> &Slot {
        match self {
            Self::Completed(slot) | Self::AlreadyCompleted(slot) => slot,
        }
    }
}

/// Result of [`Allocator::release_slot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released {
        slot: Slot,
        prior_worker: String,
        held_for: chrono::Duration,
    },
    /// The slot was already available; nothing changed.
    AlreadyAvailable,
}

pub struct Allocator<S, C> {
    store: S,
    clock: C,
    policy: AllocationPolicy,
}

impl<S: SlotStore, C: Clock> Allocator<S, C> {
    pub const fn new(store: S, clock: C, policy: AllocationPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    pub const fn store(&self) -> &S {
        &self.store
    }

    pub const fn clock(&self) -> &C {
        &self.clock
    }

    pub const fn policy(&self) -> AllocationPolicy {
        self.policy
    }

    /// Claim one available slot for `worker_id`, optionally within `task_id`.
    ///
    /// Picks the task with the fewest occupied slots (ties: lowest task id)
    /// and its lowest available slot number.
    ///
    /// # Errors
    ///
    /// - [`SlotError::SlotUnavailable`] when no eligible slot exists
    /// - [`SlotError::WorkerLimitExceeded`] when the worker already has the
    ///   requested task or has reached the task cap
    /// - [`SlotError::TransientConflict`] when every attempt lost a race
    /// - [`SlotError::TaskNotFound`] for an unknown `task_id`
    /// - [`SlotError::StoreUnavailable`] for store failures
    pub fn claim_slot(&self, worker_id: &str, task_id: Option<i64>) -> Result<Claim, SlotError> {
        let worker_id = normalize_worker(worker_id)?;
        let attempts = self.policy.max_claim_attempts;

        for attempt in 1..=attempts {
            let snapshot = self.store.list(None)?;
            let key = pick_candidate(
                &snapshot,
                worker_id,
                task_id,
                self.policy.max_tasks_per_worker,
            )?;

            let claimed_at = self.clock.now();
            let mutation = Mutation::Claim {
                worker_id: worker_id.to_string(),
                at: claimed_at,
            };

            match self
                .store
                .conditional_update(key, SlotStatus::Available, None, &mutation)?
            {
                CasOutcome::Applied(_) => {
                    self.verify_claim(worker_id, key, attempt)?;
                    info!(
                        task_id = key.task_id,
                        slot_num = key.slot_num,
                        worker_id,
                        attempt,
                        "claimed slot"
                    );
                    return Ok(Claim {
                        task_id: key.task_id,
                        slot_num: key.slot_num,
                        worker_id: worker_id.to_string(),
                        claimed_at,
                        attempts: attempt,
                    });
                }
                CasOutcome::Conflict(observed) => {
                    debug!(
                        task_id = key.task_id,
                        slot_num = key.slot_num,
                        worker_id,
                        attempt,
                        observed = %observed.status,
                        "claim lost race, retrying"
                    );
                }
            }
        }

        warn!(worker_id, attempts, "claim gave up after repeated conflicts");
        Err(SlotError::TransientConflict { attempts })
    }

    /// Re-check per-worker limits after a successful claim and back the
    /// claim out if a concurrent claim by the same worker overlapped it.
    ///
    /// Of two overlapping claims the later one always sees the earlier, so
    /// at most one survives. When the re-read shows that none survived, the
    /// caller gets a retryable [`SlotError::TransientConflict`].
    fn verify_claim(&self, worker_id: &str, key: SlotKey, attempt: u32) -> Result<(), SlotError> {
        let snapshot = self.store.list(None)?;

        let duplicate = snapshot.iter().any(|slot| {
            slot.task_id == key.task_id
                && slot.slot_num != key.slot_num
                && slot.is_held_by(worker_id)
        });
        if duplicate {
            self.back_out(worker_id, key);
            let survivor = self
                .store
                .list(Some(key.task_id))?
                .iter()
                .any(|slot| slot.is_held_by(worker_id));
            if !survivor {
                debug!(
                    task_id = key.task_id,
                    worker_id,
                    attempt,
                    "overlapping claims both backed out"
                );
                return Err(SlotError::TransientConflict { attempts: attempt });
            }
            return Err(SlotError::WorkerLimitExceeded {
                worker_id: worker_id.to_string(),
                reason: LimitReason::AlreadyInTask(key.task_id),
            });
        }

        let held = held_tasks(&snapshot, worker_id).len();
        if held > self.policy.max_tasks_per_worker as usize {
            self.back_out(worker_id, key);
            return Err(SlotError::TransientConflict { attempts: attempt });
        }

        Ok(())
    }

    fn back_out(&self, worker_id: &str, key: SlotKey) {
        warn!(
            task_id = key.task_id,
            slot_num = key.slot_num,
            worker_id,
            "concurrent claim exceeded worker limits, releasing"
        );
        match self.store.conditional_update(
            key,
            SlotStatus::InProgress,
            Some(worker_id),
            &Mutation::Release,
        ) {
            Ok(CasOutcome::Applied(_)) => {}
            Ok(CasOutcome::Conflict(observed)) => debug!(
                task_id = key.task_id,
                slot_num = key.slot_num,
                observed = %observed.status,
                "claim already moved on before back-out"
            ),
            Err(err) => warn!(
                task_id = key.task_id,
                slot_num = key.slot_num,
                error = %err,
                "failed to back out claim; the sweeper will reclaim it"
            ),
        }
    }

    /// Move the worker's in-progress slot to completed.
    ///
    /// Completing a slot the same worker already completed succeeds with
    /// [`CompleteOutcome::AlreadyCompleted`].
    ///
    /// # Errors
    ///
    /// - [`SlotError::Unauthorized`] when the slot is not (or no longer) held
    ///   by `worker_id`, including after a reclaim
    /// - [`SlotError::SlotNotFound`] for an unknown slot
    /// - [`SlotError::TransientConflict`] if the slot keeps changing underneath
    /// - [`SlotError::StoreUnavailable`] for store failures
    pub fn complete_slot(&self, worker_id: &str, key: SlotKey) -> Result<CompleteOutcome, SlotError> {
        let worker_id = normalize_worker(worker_id)?;
        let attempts = self.policy.max_claim_attempts;

        for _ in 0..attempts {
            let slot = self.store.get(key)?;
            match slot.status {
                SlotStatus::InProgress if slot.claimed_by.as_deref() == Some(worker_id) => {
                    let mutation = Mutation::Complete {
                        at: self.clock.now(),
                    };
                    match self.store.conditional_update(
                        key,
                        SlotStatus::InProgress,
                        Some(worker_id),
                        &mutation,
                    )? {
                        CasOutcome::Applied(done) => {
                            info!(
                                task_id = key.task_id,
                                slot_num = key.slot_num,
                                worker_id,
                                "completed slot"
                            );
                            return Ok(CompleteOutcome::Completed(done));
                        }
                        CasOutcome::Conflict(_) => continue,
                    }
                }
                SlotStatus::Completed if slot.completed_by.as_deref() == Some(worker_id) => {
                    info!(
                        task_id = key.task_id,
                        slot_num = key.slot_num,
                        worker_id,
                        "duplicate completion ignored"
                    );
                    return Ok(CompleteOutcome::AlreadyCompleted(slot));
                }
                _ => {
                    warn!(
                        task_id = key.task_id,
                        slot_num = key.slot_num,
                        worker_id,
                        status = %slot.status,
                        holder = slot.holder().unwrap_or("none"),
                        "completion rejected"
                    );
                    return Err(SlotError::Unauthorized {
                        key,
                        worker_id: worker_id.to_string(),
                        holder: slot.holder().map(str::to_string),
                    });
                }
            }
        }

        Err(SlotError::TransientConflict { attempts })
    }

    /// Return an in-progress slot to available.
    ///
    /// With `expected_worker` this is a self-abandon and only succeeds for the
    /// current claimant; without it this is an operator override.
    ///
    /// # Errors
    ///
    /// - [`SlotError::InvalidTransition`] when the slot is completed
    /// - [`SlotError::Unauthorized`] when `expected_worker` does not hold it
    /// - [`SlotError::EmptyWorkerId`] when `expected_worker` is blank
    /// - [`SlotError::SlotNotFound`] for an unknown slot
    /// - [`SlotError::TransientConflict`] if the slot keeps changing underneath
    /// - [`SlotError::StoreUnavailable`] for store failures
    pub fn release_slot(
        &self,
        key: SlotKey,
        expected_worker: Option<&str>,
    ) -> Result<ReleaseOutcome, SlotError> {
        let expected_worker = expected_worker.map(normalize_worker).transpose()?;
        let attempts = self.policy.max_claim_attempts;

        for _ in 0..attempts {
            let slot = self.store.get(key)?;
            match slot.status {
                SlotStatus::Available => {
                    debug!(
                        task_id = key.task_id,
                        slot_num = key.slot_num,
                        "release of available slot is a no-op"
                    );
                    return Ok(ReleaseOutcome::AlreadyAvailable);
                }
                SlotStatus::Completed => {
                    return Err(SlotError::InvalidTransition {
                        key,
                        status: SlotStatus::Completed,
                        action: "release",
                    });
                }
                SlotStatus::InProgress => {
                    let holder = slot.claimed_by.clone().unwrap_or_default();
                    if let Some(expected) = expected_worker {
                        if expected != holder {
                            return Err(SlotError::Unauthorized {
                                key,
                                worker_id: expected.to_string(),
                                holder: Some(holder),
                            });
                        }
                    }

                    let now = self.clock.now();
                    match self.store.conditional_update(
                        key,
                        SlotStatus::InProgress,
                        Some(holder.as_str()),
                        &Mutation::Release,
                    )? {
                        CasOutcome::Applied(released) => {
                            let held_for = slot.held_for(now).unwrap_or_else(chrono::Duration::zero);
                            info!(
                                task_id = key.task_id,
                                slot_num = key.slot_num,
                                prior_worker = %holder,
                                held_secs = held_for.num_seconds(),
                                forced = expected_worker.is_none(),
                                "released slot"
                            );
                            return Ok(ReleaseOutcome::Released {
                                slot: released,
                                prior_worker: holder,
                                held_for,
                            });
                        }
                        CasOutcome::Conflict(_) => continue,
                    }
                }
            }
        }

        Err(SlotError::TransientConflict { attempts })
    }
}

fn normalize_worker(worker_id: &str) -> Result<&str, SlotError> {
    let trimmed = worker_id.trim();
    if trimmed.is_empty() {
        Err(SlotError::EmptyWorkerId)
    } else {
        Ok(trimmed)
    }
}

/// Tasks in which `worker_id` holds an in-progress or completed slot.
#[must_use]
pub fn held_tasks(snapshot: &[Slot], worker_id: &str) -> Vec<i64> {
    let mut tasks: Vec<i64> = snapshot
        .iter()
        .filter(|slot| slot.is_held_by(worker_id))
        .map(|slot| slot.task_id)
        .collect();
    tasks.sort_unstable();
    tasks.dedup();
    tasks
}

#[derive(Debug, Default)]
struct TaskLoad {
    occupied: usize,
    first_available: Option<u32>,
    held_by_worker: bool,
}

/// Choose the slot a claim should target, from a store snapshot.
///
/// # Errors
///
/// Returns the claim error that applies when no slot may be targeted.
pub fn pick_candidate(
    snapshot: &[Slot],
    worker_id: &str,
    task_id: Option<i64>,
    max_tasks_per_worker: u32,
) -> Result<SlotKey, SlotError> {
    let mut tasks: BTreeMap<i64, TaskLoad> = BTreeMap::new();
    for slot in snapshot {
        let load = tasks.entry(slot.task_id).or_default();
        if slot.status.is_occupied() {
            load.occupied += 1;
        }
        if slot.status == SlotStatus::Available
            && load.first_available.is_none_or(|n| slot.slot_num < n)
        {
            load.first_available = Some(slot.slot_num);
        }
        if slot.is_held_by(worker_id) {
            load.held_by_worker = true;
        }
    }

    if let Some(id) = task_id {
        let load = tasks.get(&id).ok_or(SlotError::TaskNotFound { task_id: id })?;
        if load.held_by_worker {
            return Err(SlotError::WorkerLimitExceeded {
                worker_id: worker_id.to_string(),
                reason: LimitReason::AlreadyInTask(id),
            });
        }
    }

    let held = tasks.values().filter(|load| load.held_by_worker).count();
    if held >= max_tasks_per_worker as usize {
        return Err(SlotError::WorkerLimitExceeded {
            worker_id: worker_id.to_string(),
            reason: LimitReason::TaskCap(max_tasks_per_worker),
        });
    }

    tasks
        .iter()
        .filter(|(id, load)| task_id.is_none_or(|wanted| wanted == **id) && !load.held_by_worker)
        .filter_map(|(id, load)| load.first_available.map(|slot_num| (load.occupied, *id, slot_num)))
        .min()
        .map(|(_, id, slot_num)| SlotKey::new(id, slot_num))
        .ok_or(SlotError::SlotUnavailable { task_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryStore, StoreError};
    use chrono::TimeZone;

    fn nine() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn allocator(tasks: &[i64], k: u32, max_tasks: u32) -> Allocator<MemoryStore, ManualClock> {
        Allocator::new(
            MemoryStore::with_tasks(tasks, k),
            ManualClock::new(nine()),
            AllocationPolicy {
                max_tasks_per_worker: max_tasks,
                max_claim_attempts: 5,
            },
        )
    }

    #[test]
    fn claim_prefers_least_loaded_task_then_lowest_slot() -> Result<(), SlotError> {
        let alloc = allocator(&[1, 2, 3], 3, 10);

        let a = alloc.claim_slot("a", None)?;
        assert_eq!(a.key(), SlotKey::new(1, 1));
        assert_eq!(a.claimed_at, nine());
        assert_eq!(a.attempts, 1);

        // Task 1 now has one occupied slot, so the next claim spreads out.
        assert_eq!(alloc.claim_slot("b", None)?.key(), SlotKey::new(2, 1));
        assert_eq!(alloc.claim_slot("c", None)?.key(), SlotKey::new(3, 1));
        assert_eq!(alloc.claim_slot("d", None)?.key(), SlotKey::new(1, 2));
        Ok(())
    }

    #[test]
    fn worker_never_gets_two_slots_in_one_task() -> Result<(), SlotError> {
        let alloc = allocator(&[5], 3, 10);
        alloc.claim_slot("a", Some(5))?;

        let err = alloc.claim_slot("a", Some(5)).unwrap_err();
        assert!(matches!(
            err,
            SlotError::WorkerLimitExceeded {
                reason: LimitReason::AlreadyInTask(5),
                ..
            }
        ));

        // Without a task filter there is simply nothing left for this worker.
        let err = alloc.claim_slot("a", None).unwrap_err();
        assert!(matches!(err, SlotError::SlotUnavailable { task_id: None }));
        Ok(())
    }

    #[test]
    fn task_cap_counts_claimed_and_completed() -> Result<(), SlotError> {
        let alloc = allocator(&[1, 2, 3], 3, 2);
        let first = alloc.claim_slot("a", None)?;
        alloc.complete_slot("a", first.key())?;
        alloc.claim_slot("a", None)?;

        let err = alloc.claim_slot("a", None).unwrap_err();
        assert!(matches!(
            err,
            SlotError::WorkerLimitExceeded {
                reason: LimitReason::TaskCap(2),
                ..
            }
        ));
        assert!(!err.is_retryable());
        Ok(())
    }

    #[test]
    fn exhausted_task_reports_unavailable() -> Result<(), SlotError> {
        let alloc = allocator(&[1], 2, 10);
        alloc.claim_slot("a", Some(1))?;
        alloc.claim_slot("b", Some(1))?;

        let err = alloc.claim_slot("c", Some(1)).unwrap_err();
        assert!(matches!(err, SlotError::SlotUnavailable { task_id: Some(1) }));
        Ok(())
    }

    #[test]
    fn unknown_task_and_blank_worker_are_rejected() {
        let alloc = allocator(&[1], 3, 10);
        assert!(matches!(
            alloc.claim_slot("a", Some(42)),
            Err(SlotError::TaskNotFound { task_id: 42 })
        ));
        assert!(matches!(
            alloc.claim_slot("   ", None),
            Err(SlotError::EmptyWorkerId)
        ));
    }

    #[test]
    fn complete_is_idempotent_for_the_same_worker() -> Result<(), SlotError> {
        let alloc = allocator(&[1], 3, 10);
        let claim = alloc.claim_slot("a", None)?;

        let first = alloc.complete_slot("a", claim.key())?;
        assert!(matches!(first, CompleteOutcome::Completed(_)));
        let second = alloc.complete_slot("a", claim.key())?;
        assert!(matches!(second, CompleteOutcome::AlreadyCompleted(_)));
        assert_eq!(second.slot().status, SlotStatus::Completed);
        assert_eq!(alloc.store().get(claim.key())?.version, 2);
        Ok(())
    }

    #[test]
    fn complete_by_other_worker_is_unauthorized() -> Result<(), SlotError> {
        let alloc = allocator(&[1], 3, 10);
        let claim = alloc.claim_slot("a", None)?;

        let err = alloc.complete_slot("b", claim.key()).unwrap_err();
        assert!(matches!(
            err,
            SlotError::Unauthorized { ref holder, .. } if holder.as_deref() == Some("a")
        ));

        alloc.complete_slot("a", claim.key())?;
        assert!(matches!(
            alloc.complete_slot("b", claim.key()),
            Err(SlotError::Unauthorized { .. })
        ));
        Ok(())
    }

    #[test]
    fn complete_after_reclaim_is_unauthorized() -> Result<(), SlotError> {
        let alloc = allocator(&[1], 3, 10);
        let claim = alloc.claim_slot("a", None)?;
        alloc.release_slot(claim.key(), None)?;

        let err = alloc.complete_slot("a", claim.key()).unwrap_err();
        assert!(matches!(err, SlotError::Unauthorized { holder: None, .. }));
        Ok(())
    }

    #[test]
    fn complete_unknown_slot_is_not_found() {
        let alloc = allocator(&[1], 3, 10);
        assert!(matches!(
            alloc.complete_slot("a", SlotKey::new(1, 9)),
            Err(SlotError::SlotNotFound(_))
        ));
    }

    #[test]
    fn claim_then_release_is_indistinguishable_from_fresh() -> Result<(), SlotError> {
        let alloc = allocator(&[2], 3, 10);
        let claim = alloc.claim_slot("a", Some(2))?;
        alloc.clock().advance(chrono::Duration::minutes(10));

        let outcome = alloc.release_slot(claim.key(), Some("a"))?;
        let ReleaseOutcome::Released {
            slot,
            prior_worker,
            held_for,
        } = outcome
        else {
            panic!("expected release");
        };
        assert_eq!(prior_worker, "a");
        assert_eq!(held_for, chrono::Duration::minutes(10));
        assert_eq!(
            Slot {
                version: 0,
                ..slot
            },
            Slot::available(claim.key())
        );
        Ok(())
    }

    #[test]
    fn release_rules() -> Result<(), SlotError> {
        let alloc = allocator(&[1], 3, 10);
        let key = SlotKey::new(1, 1);

        assert_eq!(
            alloc.release_slot(key, None)?,
            ReleaseOutcome::AlreadyAvailable
        );

        alloc.claim_slot("a", Some(1))?;
        assert!(matches!(
            alloc.release_slot(key, Some("b")),
            Err(SlotError::Unauthorized { .. })
        ));

        alloc.complete_slot("a", key)?;
        assert!(matches!(
            alloc.release_slot(key, None),
            Err(SlotError::InvalidTransition {
                status: SlotStatus::Completed,
                ..
            })
        ));
        assert_eq!(alloc.store().get(key)?.status, SlotStatus::Completed);
        Ok(())
    }

    #[test]
    fn self_release_matches_the_trimmed_claimant() -> Result<(), SlotError> {
        let alloc = allocator(&[1], 3, 10);
        let claim = alloc.claim_slot(" a ", Some(1))?;
        assert_eq!(claim.worker_id, "a");

        assert!(matches!(
            alloc.release_slot(claim.key(), Some("   ")),
            Err(SlotError::EmptyWorkerId)
        ));
        let outcome = alloc.release_slot(claim.key(), Some(" a "))?;
        assert!(matches!(
            outcome,
            ReleaseOutcome::Released { ref prior_worker, .. } if prior_worker == "a"
        ));
        Ok(())
    }

    /// Store where releasing one slot also lets a concurrent back-out of
    /// `partner` land, as when both halves of a same-worker race retreat.
    struct PartnerBacksOut {
        inner: MemoryStore,
        partner: SlotKey,
    }

    impl SlotStore for PartnerBacksOut {
        fn get(&self, key: SlotKey) -> Result<Slot, StoreError> {
            self.inner.get(key)
        }

        fn list(&self, task_id: Option<i64>) -> Result<Vec<Slot>, StoreError> {
            self.inner.list(task_id)
        }

        fn conditional_update(
            &self,
            key: SlotKey,
            expected_status: SlotStatus,
            expected_claimed_by: Option<&str>,
            mutation: &Mutation,
        ) -> Result<CasOutcome, StoreError> {
            let outcome =
                self.inner
                    .conditional_update(key, expected_status, expected_claimed_by, mutation)?;
            if *mutation == Mutation::Release && key != self.partner {
                self.inner.conditional_update(
                    self.partner,
                    SlotStatus::InProgress,
                    expected_claimed_by,
                    &Mutation::Release,
                )?;
            }
            Ok(outcome)
        }

        fn conditional_update_at_version(
            &self,
            key: SlotKey,
            expected_status: SlotStatus,
            expected_claimed_by: Option<&str>,
            expected_version: u64,
            mutation: &Mutation,
        ) -> Result<CasOutcome, StoreError> {
            self.inner.conditional_update_at_version(
                key,
                expected_status,
                expected_claimed_by,
                expected_version,
                mutation,
            )
        }

        fn create_slots(&self, task_ids: &[i64], slot_count: u32) -> Result<usize, StoreError> {
            self.inner.create_slots(task_ids, slot_count)
        }
    }

    #[test]
    fn mutual_back_out_is_retryable() -> Result<(), SlotError> {
        let inner = MemoryStore::with_tasks(&[1], 3);
        for slot_num in [1, 2] {
            inner.conditional_update(
                SlotKey::new(1, slot_num),
                SlotStatus::Available,
                None,
                &Mutation::Claim {
                    worker_id: "a".into(),
                    at: nine(),
                },
            )?;
        }
        let alloc = Allocator::new(
            PartnerBacksOut {
                inner,
                partner: SlotKey::new(1, 1),
            },
            ManualClock::new(nine()),
            AllocationPolicy::default(),
        );

        let err = alloc.verify_claim("a", SlotKey::new(1, 2), 1).unwrap_err();
        assert!(matches!(err, SlotError::TransientConflict { attempts: 1 }));
        assert!(err.is_retryable());
        assert!(alloc.store().list(Some(1))?.iter().all(|slot| !slot.is_held_by("a")));
        Ok(())
    }

    #[test]
    fn back_out_releases_overlapping_duplicate() -> Result<(), SlotError> {
        let alloc = allocator(&[1], 3, 10);
        // Simulate the losing half of a same-worker race: slot 1 is already
        // held by "a" when "a"'s second claim lands on slot 2.
        let store = alloc.store();
        for slot_num in [1, 2] {
            store.conditional_update(
                SlotKey::new(1, slot_num),
                SlotStatus::Available,
                None,
                &Mutation::Claim {
                    worker_id: "a".into(),
                    at: nine(),
                },
            )?;
        }

        let err = alloc.verify_claim("a", SlotKey::new(1, 2), 1).unwrap_err();
        assert!(matches!(err, SlotError::WorkerLimitExceeded { .. }));
        assert_eq!(store.get(SlotKey::new(1, 2))?.status, SlotStatus::Available);
        assert_eq!(store.get(SlotKey::new(1, 1))?.status, SlotStatus::InProgress);
        assert!(alloc.verify_claim("a", SlotKey::new(1, 1), 1).is_ok());
        Ok(())
    }

    #[test]
    fn pick_candidate_is_deterministic() {
        let mut snapshot: Vec<Slot> = (1..=3)
            .flat_map(|task| (1..=3).map(move |n| Slot::available(SlotKey::new(task, n))))
            .collect();
        snapshot[0] = Mutation::Claim {
            worker_id: "x".into(),
            at: nine(),
        }
        .apply(&snapshot[0]);

        assert_eq!(
            pick_candidate(&snapshot, "a", None, 10).ok(),
            Some(SlotKey::new(2, 1))
        );
        assert_eq!(
            pick_candidate(&snapshot, "a", Some(1), 10).ok(),
            Some(SlotKey::new(1, 2))
        );
        assert_eq!(held_tasks(&snapshot, "x"), vec![1]);
    }
}
