//! `sk init`: create slots for a range of tasks.

use super::{Context, fail};
use crate::output::{pretty_kv, render};
use anyhow::{Context as _, Result};
use clap::Args;
use serde::Serialize;
use slotkeeper_core::store::SlotStore;
use tracing::info;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Number of tasks to create slots for.
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub tasks: u32,

    /// First task id in the range.
    #[arg(long, default_value_t = 1)]
    pub first_task: i64,

    /// Slots per task (defaults to `allocation.slot_count`).
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub slots: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitReport {
    db: String,
    first_task: i64,
    last_task: i64,
    slot_count: u32,
    created: usize,
}

/// Last id of a run of `tasks` ids starting at `first_task`.
fn last_task_id(first_task: i64, tasks: u32) -> Result<i64> {
    first_task
        .checked_add(i64::from(tasks) - 1)
        .with_context(|| format!("--first-task {first_task} with --tasks {tasks} overflows task ids"))
}

pub fn run_init(args: &InitArgs, ctx: &Context) -> Result<()> {
    let last_task = last_task_id(args.first_task, args.tasks)?;
    if let Some(parent) = ctx.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = ctx.open_or_create_store()?;

    let slot_count = args.slots.unwrap_or(ctx.config.allocation.slot_count);
    let task_ids: Vec<i64> = (args.first_task..=last_task).collect();
    let created = store
        .create_slots(&task_ids, slot_count)
        .map_err(|err| fail(ctx.output, err.into()))?;
    info!(
        first_task = args.first_task,
        last_task, slot_count, created, "initialized slots"
    );

    let report = InitReport {
        db: ctx.db_path.display().to_string(),
        first_task: args.first_task,
        last_task,
        slot_count,
        created,
    };
    render(ctx.output, &report, |r, w| {
        pretty_kv(w, "store", &r.db)?;
        pretty_kv(w, "tasks", format!("{}..={}", r.first_task, r.last_task))?;
        pretty_kv(w, "slots", r.slot_count.to_string())?;
        pretty_kv(w, "created", r.created.to_string())
    })
}
