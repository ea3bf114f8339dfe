//! `sk stats`: per-task slot counts.

use super::{Context, fail};
use crate::output::{Renderable, render_list, write_json};
use anyhow::Result;
use clap::Args;
use slotkeeper_core::admin::TaskSummary;
use std::io::{self, Write};

#[derive(Args, Debug, Default)]
pub struct StatsArgs {}

struct SummaryRow(TaskSummary);

impl Renderable for SummaryRow {
    fn render_human(&self, w: &mut dyn Write) -> io::Result<()> {
        let s = &self.0;
        write!(
            w,
            "task {:<6} {}/{} done, {} in progress, {} open",
            s.task_id, s.completed, s.slot_count, s.in_progress, s.available
        )?;
        if s.timed_out > 0 {
            write!(w, " ({} timed out)", s.timed_out)?;
        }
        writeln!(w)
    }

    fn render_json(&self, w: &mut dyn Write) -> io::Result<()> {
        write_json(w, &self.0)
    }

    fn render_table(&self, w: &mut dyn Write) -> io::Result<()> {
        let s = &self.0;
        writeln!(
            w,
            "{}  {}  {}  {}  {}  {}",
            s.task_id, s.slot_count, s.available, s.in_progress, s.completed, s.timed_out
        )
    }

    fn table_headers() -> &'static [&'static str] {
        &[
            "TASK",
            "SLOTS",
            "AVAILABLE",
            "IN_PROGRESS",
            "COMPLETED",
            "TIMED_OUT",
        ]
    }
}

pub fn run_stats(_args: &StatsArgs, ctx: &Context) -> Result<()> {
    let admin = ctx.admin()?;
    let rows: Vec<SummaryRow> = admin
        .task_summaries()
        .map_err(|err| fail(ctx.output, err))?
        .into_iter()
        .map(SummaryRow)
        .collect();
    render_list(&rows, ctx.output)?;
    Ok(())
}
