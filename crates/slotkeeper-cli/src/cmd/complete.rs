//! `sk complete`: mark a held slot completed.

use super::{Context, fail};
use crate::output::{pretty_kv, render};
use anyhow::Result;
use clap::Args;
use serde::Serialize;
use slotkeeper_core::alloc::CompleteOutcome;
use slotkeeper_core::model::{Slot, SlotKey};

#[derive(Args, Debug)]
pub struct CompleteArgs {
    /// Task of the held slot.
    #[arg(long)]
    pub task: i64,

    /// Slot number of the held slot.
    #[arg(long)]
    pub slot: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompleteReport {
    /// `completed` or `already_completed`.
    result: &'static str,
    slot: Slot,
}

pub fn run_complete(args: &CompleteArgs, ctx: &Context) -> Result<()> {
    let worker = ctx.require_worker()?;
    let allocator = ctx.allocator(ctx.open_store()?);

    let outcome = allocator
        .complete_slot(&worker, SlotKey::new(args.task, args.slot))
        .map_err(|err| fail(ctx.output, err))?;
    let report = match outcome {
        CompleteOutcome::Completed(slot) => CompleteReport {
            result: "completed",
            slot,
        },
        CompleteOutcome::AlreadyCompleted(slot) => CompleteReport {
            result: "already_completed",
            slot,
        },
    };

    render(ctx.output, &report, |r, w| {
        pretty_kv(w, "slot", r.slot.key().to_string())?;
        pretty_kv(w, "result", r.result)?;
        if let Some(at) = r.slot.completed_at {
            pretty_kv(w, "completed", at.to_rfc3339())?;
        }
        Ok(())
    })
}
