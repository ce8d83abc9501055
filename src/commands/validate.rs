//! `hubctl validate` - offline checks of the parameters and the resource graph

use anyhow::{Context as AnyhowContext, Result};
use converge::{DependencyGraph, schedule};

use super::load_hub;
use crate::Context;
use crate::ui;

pub fn run(ctx: &Context) -> Result<()> {
    let (params, nodes) = load_hub(ctx)?;
    let graph = DependencyGraph::build(nodes).context("Resource graph is invalid")?;
    let plan = schedule(&graph);

    if ctx.quiet {
        return Ok(());
    }

    let managed = graph.nodes().iter().filter(|n| n.is_managed()).count();
    ui::header(&format!("Hub {} in {}", params.prefix, params.location));
    ui::kv("Parameters", &ctx.params.display().to_string());
    ui::kv("Managed resources", &managed.to_string());
    ui::kv("External resources", &(graph.len() - managed).to_string());
    ui::kv("Dependencies", &graph.edges().len().to_string());
    ui::kv("Stages", &plan.len().to_string());
    println!();
    ui::success("Parameters are valid");
    Ok(())
}
