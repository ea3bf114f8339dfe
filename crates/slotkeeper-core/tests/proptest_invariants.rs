use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use slotkeeper_core::alloc::{AllocationPolicy, Allocator, ReleaseOutcome, held_tasks};
use slotkeeper_core::clock::{Clock, ManualClock};
use slotkeeper_core::error::SlotError;
use slotkeeper_core::model::{SlotKey, SlotStatus};
use slotkeeper_core::store::{MemoryStore, SlotStore};
use slotkeeper_core::sweep::Sweeper;
use std::collections::BTreeMap;
use std::sync::Arc;

const TASKS: [i64; 3] = [1, 2, 3];
const SLOTS: u32 = 3;
const MAX_TASKS: u32 = 2;
const WORKERS: [&str; 4] = ["a", "b", "c", "d"];

#[derive(Debug, Clone)]
enum Op {
    Claim { worker: usize, task: Option<i64> },
    Complete { worker: usize, task: i64, slot: u32 },
    Release { task: i64, slot: u32, worker: Option<usize> },
    Advance { minutes: i64 },
    Sweep,
}

fn arb_op() -> impl Strategy<Value = Op> {
    let worker = 0..WORKERS.len();
    let task = 1..=3_i64;
    let slot = 1..=SLOTS;
    prop_oneof![
        4 => (worker.clone(), proptest::option::of(task.clone()))
            .prop_map(|(worker, task)| Op::Claim { worker, task }),
        3 => (worker.clone(), task.clone(), slot.clone())
            .prop_map(|(worker, task, slot)| Op::Complete { worker, task, slot }),
        1 => (task, slot, proptest::option::of(worker))
            .prop_map(|(task, slot, worker)| Op::Release { task, slot, worker }),
        2 => (1..=90_i64).prop_map(|minutes| Op::Advance { minutes }),
        1 => Just(Op::Sweep),
    ]
}

fn check_invariants(store: &MemoryStore) -> Result<(), TestCaseError> {
    let slots = store.list(None).map_err(|e| TestCaseError::fail(e.to_string()))?;
    prop_assert_eq!(slots.len(), TASKS.len() * SLOTS as usize);

    let mut held: BTreeMap<(i64, &str), usize> = BTreeMap::new();
    for slot in &slots {
        prop_assert!(slot.check_invariants().is_ok(), "bad slot {:?}", slot);
        if let Some(worker) = slot.holder() {
            *held.entry((slot.task_id, worker)).or_default() += 1;
        }
    }
    for ((task, worker), count) in &held {
        prop_assert_eq!(*count, 1, "{} holds {} slots in task {}", worker, count, task);
    }
    for worker in WORKERS {
        prop_assert!(held_tasks(&slots, worker).len() <= MAX_TASKS as usize);
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn random_operations_preserve_slot_invariants(ops in proptest::collection::vec(arb_op(), 1..60)) {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).single().expect("valid timestamp");
        let store = Arc::new(MemoryStore::with_tasks(&TASKS, SLOTS));
        let clock = ManualClock::new(start);
        let alloc = Allocator::new(
            Arc::clone(&store),
            clock.clone(),
            AllocationPolicy { max_tasks_per_worker: MAX_TASKS, max_claim_attempts: 3 },
        );
        let sweeper = Sweeper::new(Arc::clone(&store), clock.clone(), Duration::hours(2));

        for op in ops {
            match op {
                Op::Claim { worker, task } => {
                    if let Ok(claim) = alloc.claim_slot(WORKERS[worker], task) {
                        let slot = store.get(claim.key()).map_err(|e| TestCaseError::fail(e.to_string()))?;
                        prop_assert_eq!(slot.status, SlotStatus::InProgress);
                        prop_assert_eq!(slot.claimed_by.as_deref(), Some(WORKERS[worker]));
                        if let Some(task) = task {
                            prop_assert_eq!(claim.task_id, task);
                        }
                    }
                }
                Op::Complete { worker, task, slot } => {
                    let key = SlotKey::new(task, slot);
                    match alloc.complete_slot(WORKERS[worker], key) {
                        Ok(outcome) => {
                            prop_assert_eq!(outcome.slot().status, SlotStatus::Completed);
                            prop_assert_eq!(outcome.slot().completed_by.as_deref(), Some(WORKERS[worker]));
                        }
                        Err(err) => prop_assert!(matches!(err, SlotError::Unauthorized { .. }), "{}", err),
                    }
                }
                Op::Release { task, slot, worker } => {
                    let key = SlotKey::new(task, slot);
                    match alloc.release_slot(key, worker.map(|w| WORKERS[w])) {
                        Ok(ReleaseOutcome::Released { slot, .. }) => {
                            prop_assert_eq!(slot.status, SlotStatus::Available);
                            prop_assert!(slot.claimed_by.is_none());
                        }
                        Ok(ReleaseOutcome::AlreadyAvailable) => {}
                        Err(err) => prop_assert!(
                            matches!(err, SlotError::Unauthorized { .. } | SlotError::InvalidTransition { .. }),
                            "{}", err
                        ),
                    }
                }
                Op::Advance { minutes } => clock.advance(Duration::minutes(minutes)),
                Op::Sweep => {
                    sweeper.sweep(None).map_err(|e| TestCaseError::fail(e.to_string()))?;
                    let now = clock.now();
                    for slot in store.list(None).map_err(|e| TestCaseError::fail(e.to_string()))? {
                        if let Some(held) = slot.held_for(now) {
                            prop_assert!(held < Duration::hours(2), "expired claim survived sweep");
                        }
                    }
                }
            }
            check_invariants(&store)?;
        }
    }
}
