//! In-process slot store: one mutex per slot behind a shared index.
//!
//! The index lock is only taken for writing while slots are created at
//! setup; every conditional update holds exactly one slot mutex.

use super::{
    CasOutcome, Mutation, SlotStore, StoreError, check_slot_count, matches_expectation,
};
use crate::model::{Slot, SlotKey, SlotStatus};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError, RwLock};

#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: RwLock<BTreeMap<SlotKey, Mutex<Slot>>>,
}

fn poisoned<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Unavailable("memory store lock poisoned".to_string())
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store with `slot_count` available slots for each task.
    #[must_use]
    pub fn with_tasks(task_ids: &[i64], slot_count: u32) -> Self {
        let mut slots = BTreeMap::new();
        for &task_id in task_ids {
            for slot_num in 1..=slot_count {
                let key = SlotKey::new(task_id, slot_num);
                slots.insert(key, Mutex::new(Slot::available(key)));
            }
        }
        Self {
            slots: RwLock::new(slots),
        }
    }

    fn cas(
        &self,
        key: SlotKey,
        expected_status: SlotStatus,
        expected_claimed_by: Option<&str>,
        expected_version: Option<u64>,
        mutation: &Mutation,
    ) -> Result<CasOutcome, StoreError> {
        mutation.check_source(key, expected_status)?;

        let index = self.slots.read().map_err(poisoned)?;
        let cell = index.get(&key).ok_or(StoreError::NotFound(key))?;
        let mut slot = cell.lock().map_err(poisoned)?;

        if !matches_expectation(&slot, expected_status, expected_claimed_by)
            || expected_version.is_some_and(|v| v != slot.version)
        {
            return Ok(CasOutcome::Conflict(slot.clone()));
        }

        *slot = mutation.apply(&slot);
        Ok(CasOutcome::Applied(slot.clone()))
    }
}

impl SlotStore for MemoryStore {
    fn get(&self, key: SlotKey) -> Result<Slot, StoreError> {
        let index = self.slots.read().map_err(poisoned)?;
        let cell = index.get(&key).ok_or(StoreError::NotFound(key))?;
        let slot = cell.lock().map_err(poisoned)?;
        Ok(slot.clone())
    }

    fn list(&self, task_id: Option<i64>) -> Result<Vec<Slot>, StoreError> {
        let index = self.slots.read().map_err(poisoned)?;
        let mut out = Vec::new();
        for (key, cell) in index.iter() {
            if task_id.is_some_and(|id| id != key.task_id) {
                continue;
            }
            out.push(cell.lock().map_err(poisoned)?.clone());
        }
        Ok(out)
    }

    fn conditional_update(
        &self,
        key: SlotKey,
        expected_status: SlotStatus,
        expected_claimed_by: Option<&str>,
        mutation: &Mutation,
    ) -> Result<CasOutcome, StoreError> {
        self.cas(key, expected_status, expected_claimed_by, None, mutation)
    }

    fn conditional_update_at_version(
        &self,
        key: SlotKey,
        expected_status: SlotStatus,
        expected_claimed_by: Option<&str>,
        expected_version: u64,
        mutation: &Mutation,
    ) -> Result<CasOutcome, StoreError> {
        self.cas(
            key,
            expected_status,
            expected_claimed_by,
            Some(expected_version),
            mutation,
        )
    }

    fn create_slots(&self, task_ids: &[i64], slot_count: u32) -> Result<usize, StoreError> {
        let mut index = self.slots.write().map_err(poisoned)?;
        for &task_id in task_ids {
            let existing = index
                .range(SlotKey::new(task_id, 0)..=SlotKey::new(task_id, u32::MAX))
                .count();
            check_slot_count(task_id, existing, slot_count)?;
        }
        let mut created = 0;
        for &task_id in task_ids {
            for slot_num in 1..=slot_count {
                let key = SlotKey::new(task_id, slot_num);
                index.entry(key).or_insert_with(|| {
                    created += 1;
                    Mutex::new(Slot::available(key))
                });
            }
        }
        Ok(created)
    }
}
