//! `sk cleanup`: reclaim timed-out slots.

use super::{Context, fail};
use crate::output::{human_duration, pretty_kv, pretty_section, render};
use anyhow::Result;
use clap::Args;
use serde::Serialize;
use slotkeeper_core::sweep::SweepReport;
use std::time::Duration;

#[derive(Args, Debug, Default)]
pub struct CleanupArgs {
    /// Reclaim window in minutes (defaults to `sweep.timeout_minutes`).
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout_minutes: Option<u64>,

    /// Keep sweeping on an interval instead of running once.
    #[arg(long)]
    pub watch: bool,

    /// Seconds between passes with `--watch` (defaults to `sweep.interval_secs`).
    #[arg(long, requires = "watch", value_parser = clap::value_parser!(u64).range(1..))]
    pub interval_secs: Option<u64>,

    /// Stop after this many passes with `--watch`.
    #[arg(long, requires = "watch", value_parser = clap::value_parser!(u64).range(1..))]
    pub passes: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WatchSummary {
    passes: usize,
    reclaimed: usize,
}

pub fn run_cleanup(args: &CleanupArgs, ctx: &Context) -> Result<()> {
    let store = ctx.open_store()?;
    let sweeper = ctx.sweeper(store, args.timeout_minutes);

    if args.watch {
        let interval = args
            .interval_secs
            .map_or_else(|| ctx.config.sweep.interval(), Duration::from_secs);
        let max_passes = args.passes.map(|p| usize::try_from(p).unwrap_or(usize::MAX));
        let (passes, reclaimed) = sweeper.run_periodic(interval, max_passes, || false);
        return render(ctx.output, &WatchSummary { passes, reclaimed }, |s, w| {
            writeln!(
                w,
                "swept {} times, reclaimed {} slots",
                s.passes, s.reclaimed
            )
        });
    }

    let report = sweeper.sweep(None).map_err(|err| fail(ctx.output, err))?;
    let timeout_mins = sweeper.timeout().num_minutes();
    render(ctx.output, &report, |r, w| write_report(r, timeout_mins, w))
}

fn write_report(
    report: &SweepReport,
    timeout_mins: i64,
    w: &mut dyn std::io::Write,
) -> std::io::Result<()> {
    pretty_section(w, &format!("cleanup (timeout {timeout_mins}m)"))?;
    pretty_kv(w, "scanned", report.scanned.to_string())?;
    pretty_kv(w, "active", report.active.to_string())?;
    pretty_kv(w, "reclaimed", report.reclaimed.len().to_string())?;
    if report.lost_races > 0 {
        pretty_kv(w, "lost races", report.lost_races.to_string())?;
    }
    for audit in &report.reclaimed {
        writeln!(
            w,
            "  task {} slot {}: {} held it for {} (claimed {})",
            audit.task_id,
            audit.slot_num,
            audit.prior_worker,
            human_duration(audit.held_secs),
            audit.claimed_at.to_rfc3339()
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use clap::Parser;
    use slotkeeper_core::sweep::ReclaimAudit;

    #[derive(Parser, Debug)]
    struct Wrapper {
        #[command(flatten)]
        args: CleanupArgs,
    }

    #[test]
    fn watch_flags_require_watch() {
        assert!(Wrapper::try_parse_from(["test", "--passes", "2"]).is_err());
        assert!(Wrapper::try_parse_from(["test", "--timeout-minutes", "0"]).is_err());
        let w = Wrapper::parse_from(["test", "--watch", "--interval-secs", "5", "--passes", "2"]);
        assert_eq!(w.args.interval_secs, Some(5));
        assert_eq!(w.args.passes, Some(2));
    }

    #[test]
    fn report_lists_reclaimed_slots() {
        let at = |h| {
            Utc.with_ymd_and_hms(2024, 3, 1, h, 0, 0)
                .single()
                .expect("valid timestamp")
        };
        let report = SweepReport {
            scanned: 3,
            active: 0,
            reclaimed: vec![ReclaimAudit {
                task_id: 2,
                slot_num: 1,
                prior_worker: "worker-a".into(),
                claimed_at: at(9),
                reclaimed_at: at(11),
                held_secs: 7_500,
            }],
            lost_races: 0,
        };
        let mut buf = Vec::new();
        write_report(&report, 120, &mut buf).expect("render");
        let text = String::from_utf8(buf).expect("utf8");
        assert!(text.contains("cleanup (timeout 120m)"));
        assert!(text.contains("task 2 slot 1: worker-a held it for 2h05m"));
        assert!(!text.contains("lost races"));
    }
}
