//! Slot storage with a single-record compare-and-set primitive.
//!
//! Every mutation in the system goes through
//! [`SlotStore::conditional_update`]: apply a [`Mutation`] to one slot only if
//! its current `(status, claimed_by)` pair matches the expectation, otherwise
//! report [`CasOutcome::Conflict`] without effect. Nothing above this layer
//! needs multi-record transactions.
//!
//! Two implementations ship:
//! - [`MemoryStore`]: per-key mutex map for single-process deployments and tests
//! - [`SqliteStore`]: durable store where the CAS is one conditional `UPDATE`

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::model::{Slot, SlotKey, SlotStatus};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Infrastructure-level store failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(SlotKey),

    #[error("cannot apply {mutation} to {key} from status {from}")]
    IllegalTransition {
        key: SlotKey,
        from: SlotStatus,
        mutation: &'static str,
    },

    #[error("task {task_id} already has {existing} slots, refusing to set {requested}")]
    SlotCountMismatch {
        task_id: i64,
        existing: usize,
        requested: u32,
    },

    #[error("{0}")]
    Unavailable(String),
}

/// A state change applied by a successful conditional update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// `available -> in_progress`, recording the claimant.
    Claim {
        worker_id: String,
        at: DateTime<Utc>,
    },
    /// `in_progress -> completed`; the claimant becomes `completed_by`.
    Complete { at: DateTime<Utc> },
    /// `in_progress -> available`, clearing the claim.
    Release,
}

impl Mutation {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Claim { .. } => "claim",
            Self::Complete { .. } => "complete",
            Self::Release => "release",
        }
    }

    /// The only status this mutation may be applied from.
    #[must_use]
    pub const fn source_status(&self) -> SlotStatus {
        match self {
            Self::Claim { .. } => SlotStatus::Available,
            Self::Complete { .. } | Self::Release => SlotStatus::InProgress,
        }
    }

    #[must_use]
    pub const fn target_status(&self) -> SlotStatus {
        match self {
            Self::Claim { .. } => SlotStatus::InProgress,
            Self::Complete { .. } => SlotStatus::Completed,
            Self::Release => SlotStatus::Available,
        }
    }

    /// Compute the record that results from applying `self` to `slot`.
    ///
    /// Callers must already have checked the expectation; this only builds
    /// the new record and bumps its version.
    #[must_use]
    pub fn apply(&self, slot: &Slot) -> Slot {
        let mut next = slot.clone();
        next.status = self.target_status();
        next.version = slot.version.saturating_add(1);
        match self {
            Self::Claim { worker_id, at } => {
                next.claimed_by = Some(worker_id.clone());
                next.claimed_at = Some(*at);
            }
            Self::Complete { at } => {
                next.completed_by = next.claimed_by.take();
                next.completed_at = Some(*at);
                next.claimed_at = None;
            }
            Self::Release => {
                next.claimed_by = None;
                next.claimed_at = None;
            }
        }
        next
    }

    /// Reject mutations that would leave the slot lifecycle.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::IllegalTransition`] when `expected_status` is not
    /// the mutation's source status.
    pub fn check_source(&self, key: SlotKey, expected_status: SlotStatus) -> Result<(), StoreError> {
        if expected_status == self.source_status() {
            Ok(())
        } else {
            Err(StoreError::IllegalTransition {
                key,
                from: expected_status,
                mutation: self.name(),
            })
        }
    }
}

/// Result of a conditional update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The expectation held; carries the new record.
    Applied(Slot),
    /// The expectation did not hold; carries the record as observed.
    Conflict(Slot),
}

impl CasOutcome {
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Durable per-record slot storage.
pub trait SlotStore: Send + Sync {
    /// Read one slot.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] for an unknown key, [`StoreError::Unavailable`]
    /// for infrastructure failures.
    fn get(&self, key: SlotKey) -> Result<Slot, StoreError>;

    /// Snapshot of all slots (or one task's), ordered by `(task_id, slot_num)`.
    ///
    /// Not linearizable with concurrent writes.
    ///
    /// # Errors
    ///
    /// [`StoreError::Unavailable`] for infrastructure failures.
    fn list(&self, task_id: Option<i64>) -> Result<Vec<Slot>, StoreError>;

    /// Apply `mutation` only if the slot's status equals `expected_status`
    /// and its `claimed_by` equals `expected_claimed_by` (including `None`).
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] for an unknown key,
    /// [`StoreError::IllegalTransition`] when the mutation cannot start from
    /// `expected_status`, [`StoreError::Unavailable`] for infrastructure
    /// failures.
    fn conditional_update(
        &self,
        key: SlotKey,
        expected_status: SlotStatus,
        expected_claimed_by: Option<&str>,
        mutation: &Mutation,
    ) -> Result<CasOutcome, StoreError>;

    /// [`conditional_update`](Self::conditional_update) that additionally
    /// requires the slot's `version` to equal `expected_version`, so a record
    /// that left and re-entered the expected state in between still conflicts.
    ///
    /// # Errors
    ///
    /// As for [`conditional_update`](Self::conditional_update).
    fn conditional_update_at_version(
        &self,
        key: SlotKey,
        expected_status: SlotStatus,
        expected_claimed_by: Option<&str>,
        expected_version: u64,
        mutation: &Mutation,
    ) -> Result<CasOutcome, StoreError>;

    /// Create `slot_count` available slots for each task. Existing slots are
    /// left untouched. Returns the number of slots created.
    ///
    /// Nothing is created if any listed task already exists with a different
    /// number of slots.
    ///
    /// # Errors
    ///
    /// [`StoreError::SlotCountMismatch`] when a task's existing slot count is
    /// not `slot_count`, [`StoreError::Unavailable`] for infrastructure
    /// failures.
    fn create_slots(&self, task_ids: &[i64], slot_count: u32) -> Result<usize, StoreError>;
}

/// Whether `slot` currently satisfies a conditional-update expectation.
#[must_use]
pub fn matches_expectation(
    slot: &Slot,
    expected_status: SlotStatus,
    expected_claimed_by: Option<&str>,
) -> bool {
    slot.status == expected_status && slot.claimed_by.as_deref() == expected_claimed_by
}

/// Accept a task with no slots yet or exactly `requested` of them.
///
/// # Errors
///
/// [`StoreError::SlotCountMismatch`] otherwise.
pub fn check_slot_count(task_id: i64, existing: usize, requested: u32) -> Result<(), StoreError> {
    if existing == 0 || u32::try_from(existing).is_ok_and(|n| n == requested) {
        Ok(())
    } else {
        Err(StoreError::SlotCountMismatch {
            task_id,
            existing,
            requested,
        })
    }
}

impl<T: SlotStore + ?Sized> SlotStore for Arc<T> {
    fn get(&self, key: SlotKey) -> Result<Slot, StoreError> {
        (**self).get(key)
    }

    fn list(&self, task_id: Option<i64>) -> Result<Vec<Slot>, StoreError> {
        (**self).list(task_id)
    }

    fn conditional_update(
        &self,
        key: SlotKey,
        expected_status: SlotStatus,
        expected_claimed_by: Option<&str>,
        mutation: &Mutation,
    ) -> Result<CasOutcome, StoreError> {
        (**self).conditional_update(key, expected_status, expected_claimed_by, mutation)
    }

    fn conditional_update_at_version(
        &self,
        key: SlotKey,
        expected_status: SlotStatus,
        expected_claimed_by: Option<&str>,
        expected_version: u64,
        mutation: &Mutation,
    ) -> Result<CasOutcome, StoreError> {
        (**self).conditional_update_at_version(
            key,
            expected_status,
            expected_claimed_by,
            expected_version,
            mutation,
        )
    }

    fn create_slots(&self, task_ids: &[i64], slot_count: u32) -> Result<usize, StoreError> {
        (**self).create_slots(task_ids, slot_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn nine() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn claim_then_release_restores_available_shape() {
        let key = SlotKey::new(2, 1);
        let fresh = Slot::available(key);
        let claimed = Mutation::Claim {
            worker_id: "worker-a".into(),
            at: nine(),
        }
        .apply(&fresh);
        assert_eq!(claimed.status, SlotStatus::InProgress);
        assert_eq!(claimed.claimed_by.as_deref(), Some("worker-a"));
        assert!(claimed.check_invariants().is_ok());

        let released = Mutation::Release.apply(&claimed);
        assert_eq!(
            Slot {
                version: 0,
                ..released.clone()
            },
            fresh
        );
        assert_eq!(released.version, 2);
    }

    #[test]
    fn complete_moves_claimant_to_completed_by() {
        let claimed = Mutation::Claim {
            worker_id: "worker-a".into(),
            at: nine(),
        }
        .apply(&Slot::available(SlotKey::new(1, 1)));
        let done = Mutation::Complete { at: nine() }.apply(&claimed);

        assert_eq!(done.status, SlotStatus::Completed);
        assert_eq!(done.completed_by.as_deref(), Some("worker-a"));
        assert!(done.claimed_by.is_none());
        assert!(done.claimed_at.is_none());
        assert!(done.check_invariants().is_ok());
    }

    #[test]
    fn mutations_only_start_from_their_source_status() {
        let key = SlotKey::new(1, 1);
        assert!(Mutation::Release.check_source(key, SlotStatus::InProgress).is_ok());
        assert!(matches!(
            Mutation::Release.check_source(key, SlotStatus::Completed),
            Err(StoreError::IllegalTransition {
                from: SlotStatus::Completed,
                mutation: "release",
                ..
            })
        ));
        assert!(
            Mutation::Complete { at: nine() }
                .check_source(key, SlotStatus::Available)
                .is_err()
        );
    }

    #[test]
    fn expectation_compares_missing_claimant_exactly() {
        let slot = Slot::available(SlotKey::new(1, 1));
        assert!(matches_expectation(&slot, SlotStatus::Available, None));
        assert!(!matches_expectation(&slot, SlotStatus::Available, Some("w")));
        assert!(!matches_expectation(&slot, SlotStatus::InProgress, None));
    }
}
