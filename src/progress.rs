//! Progress bars for apply runs.

use colored::Colorize;
use converge::{NodeOutcome, NodeRecord, ProgressCallback, Stage};
use indicatif::{ProgressBar, ProgressStyle};

use crate::ui;

/// Create a progress bar in the standard hubctl style
pub fn bar(len: u64, msg: &str) -> ProgressBar {
    let pb = ProgressBar::new(len);
    match ProgressStyle::default_bar().template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}") {
        Ok(style) => pb.set_style(style.progress_chars("=>-")),
        Err(e) => log::debug!("Progress template rejected: {}", e),
    }
    pb.set_message(msg.to_string());
    pb
}

/// One bar across the whole plan; failures are printed above it
pub struct StageBars {
    pb: ProgressBar,
    quiet: bool,
}

impl StageBars {
    pub fn new(total_nodes: usize, quiet: bool) -> Self {
        let pb = if quiet {
            ProgressBar::hidden()
        } else {
            bar(total_nodes as u64, "Applying")
        };
        Self { pb, quiet }
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

impl ProgressCallback for StageBars {
    fn on_stage_start(&mut self, stage: &Stage, total_stages: usize) {
        self.pb.set_message(format!(
            "stage {}/{} ({})",
            stage.index + 1,
            total_stages,
            ui::count(stage.nodes.len(), "resource")
        ));
    }

    fn on_node_complete(&mut self, record: &NodeRecord) {
        self.pb.inc(1);
        if self.quiet {
            return;
        }
        match &record.outcome {
            NodeOutcome::Failed { error } => self.pb.suspend(|| {
                println!("  {} {} ({})", "✗".red(), record.label, error);
            }),
            NodeOutcome::Created | NodeOutcome::Updated => self.pb.suspend(|| {
                println!(
                    "  {} {} {}",
                    ui::outcome_symbol(&record.outcome),
                    record.label,
                    format!("[stage {}]", record.stage + 1).dimmed()
                );
            }),
            _ => {}
        }
    }

    fn on_stage_complete(&mut self, _stage: &Stage) {}
}
