//! `hubctl plan` - preview what apply would change

use anyhow::Result;
use colored::Colorize;
use converge::{Action, ApplyReport, ApplySummary, FieldChange, NoProgress, NodeRecord};
use serde::Serialize;
use serde_json::Value;

use super::{Prepared, apply_options, prepare};
use crate::Context;
use crate::cli::{OutputFormat, PlanArgs};
use crate::ui;

pub fn run(ctx: &Context, args: PlanArgs) -> Result<()> {
    let prepared = prepare(ctx, args.target.as_deref())?;
    let report = preview(&prepared, args.jobs)?;

    match args.format {
        OutputFormat::Json => {
            let backend = ctx.backend.to_string();
            let doc = PlanDocument::new(&backend, &report);
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        OutputFormat::Text => {
            ui::header(&format!("Plan against {}", ctx.backend));
            print_plan(&report, args.detailed);
        }
    }
    Ok(())
}

/// Classify every node without writing.
pub(crate) fn preview(prepared: &Prepared, jobs: Option<usize>) -> Result<ApplyReport> {
    let opts = apply_options(&prepared.params, jobs, true);
    let report = converge::apply(&prepared.plan, prepared.client.as_ref(), &opts, &mut NoProgress)?;
    Ok(report.into_result()?)
}

#[derive(Serialize)]
struct PlanDocument<'a> {
    backend: &'a str,
    stages: Vec<PlanStage<'a>>,
    summary: ApplySummary,
}

#[derive(Serialize)]
struct PlanStage<'a> {
    stage: usize,
    resources: Vec<PlanEntry<'a>>,
}

#[derive(Serialize)]
struct PlanEntry<'a> {
    id: &'a str,
    resource: &'a str,
    action: Option<Action>,
    changes: &'a [FieldChange],
}

impl<'a> PlanDocument<'a> {
    fn new(backend: &'a str, report: &'a ApplyReport) -> Self {
        let mut stages: Vec<PlanStage<'a>> = (0..report.stages)
            .map(|i| PlanStage {
                stage: i + 1,
                resources: Vec::new(),
            })
            .collect();
        for record in &report.records {
            if let Some(stage) = stages.get_mut(record.stage) {
                stage.resources.push(PlanEntry {
                    id: record.id.as_str(),
                    resource: &record.label,
                    action: record.action,
                    changes: &record.changes,
                });
            }
        }
        Self {
            backend,
            stages,
            summary: report.summary(),
        }
    }
}

/// Ordered stage listing with per-node action and changed fields.
pub(crate) fn print_plan(report: &ApplyReport, detailed: bool) {
    for stage in 0..report.stages {
        ui::section(&format!("Stage {}/{}", stage + 1, report.stages));
        for record in report.records.iter().filter(|r| r.stage == stage) {
            print_record(record, detailed);
        }
    }

    let counts = count_actions(report);
    println!();
    if counts.create + counts.update == 0 {
        ui::success("No changes needed");
        return;
    }
    println!(
        "  Summary: {} to create, {} to update, {} unchanged",
        counts.create.to_string().green(),
        counts.update.to_string().yellow(),
        counts.unchanged.to_string().dimmed()
    );
}

fn print_record(record: &NodeRecord, detailed: bool) {
    let Some(action) = record.action else {
        println!("  {} {}", ui::outcome_symbol(&record.outcome), record.label);
        return;
    };
    println!(
        "  {} {:<50} {}",
        ui::action_symbol(action),
        record.label,
        action.to_string().dimmed()
    );

    if action != Action::Update {
        return;
    }
    if detailed {
        if let Some(live) = &record.live {
            print_text_diff(&project(live, &record.desired), &record.desired);
        }
        return;
    }
    for change in &record.changes {
        let live = change
            .live
            .as_ref()
            .map_or_else(|| "(absent)".to_string(), Value::to_string);
        println!(
            "      {} {} → {}",
            change.pointer.dimmed(),
            live.red(),
            change.desired.to_string().green()
        );
    }
}

#[derive(Default)]
struct ActionCounts {
    create: usize,
    update: usize,
    unchanged: usize,
}

fn count_actions(report: &ApplyReport) -> ActionCounts {
    let mut counts = ActionCounts::default();
    for record in &report.records {
        match record.action {
            Some(Action::Create) => counts.create += 1,
            Some(Action::Update) => counts.update += 1,
            Some(Action::NoOp) => counts.unchanged += 1,
            None => {}
        }
    }
    counts
}

/// The part of `live` that `desired` describes, so provider-added fields
/// do not show up as removals.
fn project(live: &Value, desired: &Value) -> Value {
    match (live, desired) {
        (Value::Object(l), Value::Object(d)) => Value::Object(
            d.iter()
                .filter_map(|(k, dv)| l.get(k).map(|lv| (k.clone(), project(lv, dv))))
                .collect(),
        ),
        (Value::Array(l), Value::Array(d)) => Value::Array(
            l.iter()
                .enumerate()
                .map(|(i, lv)| d.get(i).map_or_else(|| lv.clone(), |dv| project(lv, dv)))
                .collect(),
        ),
        _ => live.clone(),
    }
}

/// Show a line diff between two documents using the `similar` crate
fn print_text_diff(live: &Value, desired: &Value) {
    let (Ok(before), Ok(after)) = (
        serde_json::to_string_pretty(live),
        serde_json::to_string_pretty(desired),
    ) else {
        return;
    };

    let diff = similar::TextDiff::from_lines(&before, &after);
    for change in diff.iter_all_changes() {
        match change.tag() {
            similar::ChangeTag::Delete => print!("      {}", format!("- {change}").red()),
            similar::ChangeTag::Insert => print!("      {}", format!("+ {change}").green()),
            similar::ChangeTag::Equal => {}
        }
    }
}
