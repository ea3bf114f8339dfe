//! `sk list`: per-task, per-slot status.

use super::{Context, fail};
use crate::output::{Renderable, human_duration, render_list, write_json};
use anyhow::Result;
use clap::Args;
use slotkeeper_core::admin::SlotView;
use slotkeeper_core::model::SlotStatus;
use std::io::{self, Write};

#[derive(Args, Debug, Default)]
pub struct ListArgs {
    /// Only show slots of this task.
    #[arg(long)]
    pub task: Option<i64>,
}

/// One line of `sk list` output.
pub struct SlotRow(pub SlotView);

impl SlotRow {
    fn worker(&self) -> &str {
        self.0.slot.holder().unwrap_or("-")
    }

    fn elapsed(&self) -> String {
        self.0
            .elapsed_secs
            .map_or_else(|| "-".to_string(), human_duration)
    }
}

impl Renderable for SlotRow {
    fn render_human(&self, w: &mut dyn Write) -> io::Result<()> {
        let slot = &self.0.slot;
        write!(
            w,
            "task {:<6} slot {:<3} {:<12}",
            slot.task_id, slot.slot_num, slot.status
        )?;
        match slot.status {
            SlotStatus::Available => writeln!(w),
            SlotStatus::InProgress => {
                write!(w, " {} for {}", self.worker(), self.elapsed())?;
                if self.0.timed_out {
                    write!(w, "  [timed out]")?;
                }
                writeln!(w)
            }
            SlotStatus::Completed => writeln!(w, " by {}", self.worker()),
        }
    }

    fn render_json(&self, w: &mut dyn Write) -> io::Result<()> {
        write_json(w, &self.0)
    }

    fn render_table(&self, w: &mut dyn Write) -> io::Result<()> {
        let slot = &self.0.slot;
        writeln!(
            w,
            "{}  {}  {}  {}  {}  {}",
            slot.task_id,
            slot.slot_num,
            slot.status,
            self.worker(),
            self.elapsed(),
            self.0.timed_out
        )
    }

    fn table_headers() -> &'static [&'static str] {
        &["TASK", "SLOT", "STATUS", "WORKER", "ELAPSED", "TIMED_OUT"]
    }
}

pub fn run_list(args: &ListArgs, ctx: &Context) -> Result<()> {
    let admin = ctx.admin()?;
    let rows: Vec<SlotRow> = admin
        .list_slots(args.task)
        .map_err(|err| fail(ctx.output, err))?
        .into_iter()
        .map(SlotRow)
        .collect();
    render_list(&rows, ctx.output)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use slotkeeper_core::model::{Slot, SlotKey};

    fn claimed_view(timed_out: bool) -> SlotView {
        let at = Utc
            .with_ymd_and_hms(2024, 3, 1, 9, 0, 0)
            .single()
            .expect("valid timestamp");
        SlotView {
            slot: Slot {
                status: SlotStatus::InProgress,
                claimed_by: Some("worker-a".into()),
                claimed_at: Some(at),
                version: 1,
                ..Slot::available(SlotKey::new(2, 1))
            },
            elapsed_secs: Some(7_500),
            timed_out,
        }
    }

    #[test]
    fn human_row_flags_timeouts() {
        let mut buf = Vec::new();
        SlotRow(claimed_view(true))
            .render_human(&mut buf)
            .expect("render");
        let line = String::from_utf8(buf).expect("utf8");
        assert!(line.contains("worker-a for 2h05m"));
        assert!(line.contains("[timed out]"));
    }

    #[test]
    fn json_row_flattens_slot_fields() {
        let mut buf = Vec::new();
        SlotRow(claimed_view(false))
            .render_json(&mut buf)
            .expect("render");
        let value: serde_json::Value = serde_json::from_slice(&buf).expect("json");
        assert_eq!(value["taskId"], 2);
        assert_eq!(value["status"], "in_progress");
        assert_eq!(value["claimedBy"], "worker-a");
        assert_eq!(value["elapsedSecs"], 7_500);
        assert_eq!(value["timedOut"], false);
    }

    #[test]
    fn table_row_uses_placeholders() {
        let mut buf = Vec::new();
        SlotRow(SlotView {
            slot: Slot::available(SlotKey::new(4, 3)),
            elapsed_secs: None,
            timed_out: false,
        })
        .render_table(&mut buf)
        .expect("render");
        assert_eq!(
            String::from_utf8(buf).expect("utf8"),
            "4  3  available  -  -  false\n"
        );
    }
}
