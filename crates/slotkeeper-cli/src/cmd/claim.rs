//! `sk claim`: claim a slot for the resolved worker.

use super::{Context, fail};
use crate::output::{pretty_kv, render};
use anyhow::Result;
use clap::Args;

#[derive(Args, Debug, Default)]
pub struct ClaimArgs {
    /// Claim within this task only.
    #[arg(long)]
    pub task: Option<i64>,
}

pub fn run_claim(args: &ClaimArgs, ctx: &Context) -> Result<()> {
    let worker = ctx.require_worker()?;
    let allocator = ctx.allocator(ctx.open_store()?);

    let claim = allocator
        .claim_slot(&worker, args.task)
        .map_err(|err| fail(ctx.output, err))?;

    render(ctx.output, &claim, |c, w| {
        pretty_kv(w, "task", c.task_id.to_string())?;
        pretty_kv(w, "slot", c.slot_num.to_string())?;
        pretty_kv(w, "worker", &c.worker_id)?;
        pretty_kv(w, "claimed at", c.claimed_at.to_rfc3339())
    })
}
