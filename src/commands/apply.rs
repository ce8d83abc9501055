//! `hubctl apply` - converge the control plane to the parameters

use anyhow::Result;
use colored::Colorize;
use converge::{Action, ApplyReport};
use std::time::{Duration, Instant};

use super::{apply_options, plan, prepare};
use crate::Context;
use crate::cli::ApplyArgs;
use crate::progress::StageBars;
use crate::ui;

pub fn run(ctx: &Context, args: ApplyArgs) -> Result<()> {
    let prepared = prepare(ctx, args.target.as_deref())?;

    // 1. Classify everything and show it
    let preview = plan::preview(&prepared, args.jobs)?;
    ui::header(&format!("Apply to {}", ctx.backend));
    plan::print_plan(&preview, ctx.verbose > 0);

    let pending = preview
        .records
        .iter()
        .filter(|r| matches!(r.action, Some(Action::Create | Action::Update)))
        .count();
    if pending == 0 {
        return Ok(());
    }

    // 2. Confirm (unless --yes)
    if args.dry_run {
        println!();
        println!("  {} Dry run - no changes made", "ℹ".blue());
        return Ok(());
    }
    if !args.yes && !confirm_proceed()? {
        println!();
        println!("  {} Aborted", "✗".red());
        return Ok(());
    }

    // 3. Apply stage by stage
    println!();
    println!(
        "  {} Applying {} in {}...",
        "→".cyan(),
        ui::count(pending, "change"),
        ui::count(prepared.plan.len(), "stage")
    );
    let started = Instant::now();
    let opts = apply_options(&prepared.params, args.jobs, false);
    let mut bars = StageBars::new(prepared.plan.node_count(), ctx.quiet);
    let report = converge::apply(&prepared.plan, prepared.client.as_ref(), &opts, &mut bars)?;
    bars.finish();

    // 4. Summary
    print_summary(&report, started.elapsed());
    report.into_result()?;
    Ok(())
}

fn confirm_proceed() -> Result<bool> {
    use dialoguer::Confirm;

    let confirmed = Confirm::new()
        .with_prompt("Continue?")
        .default(true)
        .interact()?;

    Ok(confirmed)
}

/// Print final summary
fn print_summary(report: &ApplyReport, elapsed: Duration) {
    let summary = report.summary();
    println!();
    if report.is_success() {
        println!(
            "  {} Hub converged in {}",
            "✓".green().bold(),
            ui::format_elapsed(elapsed)
        );
    } else {
        println!("  {} Apply stopped with errors", "⚠".yellow().bold());
    }

    if summary.created > 0 {
        println!("    • {} created", ui::count(summary.created, "resource"));
    }
    if summary.updated > 0 {
        println!("    • {} updated", ui::count(summary.updated, "resource"));
    }
    if summary.unchanged > 0 {
        println!("    • {} unchanged", ui::count(summary.unchanged, "resource"));
    }
    if summary.skipped > 0 {
        println!("    • {} skipped", ui::count(summary.skipped, "resource"));
    }
    if summary.failed > 0 {
        println!("    • {} {} failed", summary.failed, "resources".red());
    }

    for record in report.failures() {
        println!(
            "    {} stage {}: {}",
            "✗".red(),
            record.stage + 1,
            record.label
        );
    }
}
