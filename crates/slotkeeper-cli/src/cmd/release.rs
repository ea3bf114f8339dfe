//! `sk release`: return in-progress slots to the pool.

use super::{Context, fail};
use crate::output::{human_duration, render};
use anyhow::Result;
use clap::Args;
use serde::Serialize;
use slotkeeper_core::alloc::ReleaseOutcome;
use slotkeeper_core::model::SlotKey;

#[derive(Args, Debug)]
pub struct ReleaseArgs {
    /// Task whose slot(s) to release.
    #[arg(long)]
    pub task: i64,

    /// Slot number to release.
    #[arg(long, required_unless_present = "all", conflicts_with = "all")]
    pub slot: Option<u32>,

    /// Release every in-progress slot of the task.
    #[arg(long)]
    pub all: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReleasedSlot {
    task_id: i64,
    slot_num: u32,
    /// `released` or `already_available`.
    result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prior_worker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    held_secs: Option<i64>,
}

impl ReleasedSlot {
    fn new(key: SlotKey, outcome: ReleaseOutcome) -> Self {
        match outcome {
            ReleaseOutcome::Released {
                prior_worker,
                held_for,
                ..
            } => Self {
                task_id: key.task_id,
                slot_num: key.slot_num,
                result: "released",
                prior_worker: Some(prior_worker),
                held_secs: Some(held_for.num_seconds()),
            },
            ReleaseOutcome::AlreadyAvailable => Self {
                task_id: key.task_id,
                slot_num: key.slot_num,
                result: "already_available",
                prior_worker: None,
                held_secs: None,
            },
        }
    }
}

/// Execute `sk release`.
///
/// With `--worker`, only the current claimant may release (self-abandon);
/// environment worker identities are ignored so operators never release
/// under someone else's name by accident.
pub fn run_release(args: &ReleaseArgs, ctx: &Context) -> Result<()> {
    let admin = ctx.admin()?;

    let released: Vec<ReleasedSlot> = if args.all {
        admin
            .release_all(args.task)
            .map_err(|err| fail(ctx.output, err))?
            .into_iter()
            .map(|(key, outcome)| ReleasedSlot::new(key, outcome))
            .collect()
    } else {
        let Some(slot_num) = args.slot else {
            anyhow::bail!("--slot or --all is required");
        };
        let key = SlotKey::new(args.task, slot_num);
        let outcome = match ctx.worker_flag() {
            Some(worker) => admin.allocator().release_slot(key, Some(worker)),
            None => admin.force_release(key),
        }
        .map_err(|err| fail(ctx.output, err))?;
        vec![ReleasedSlot::new(key, outcome)]
    };

    render(ctx.output, &released, |rows, w| {
        if rows.is_empty() {
            return writeln!(w, "no in-progress slots in task {}", args.task);
        }
        for row in rows {
            match (&row.prior_worker, row.held_secs) {
                (Some(worker), Some(secs)) => writeln!(
                    w,
                    "released task {} slot {} (was {worker} for {})",
                    row.task_id,
                    row.slot_num,
                    human_duration(secs)
                )?,
                _ => writeln!(
                    w,
                    "task {} slot {} already available",
                    row.task_id, row.slot_num
                )?,
            }
        }
        Ok(())
    })
}
