//! `hubctl graph` - show the dependency graph

use anyhow::{Context as AnyhowContext, Result};
use colored::Colorize;
use converge::{DependencyEdge, DependencyGraph, NodeId, schedule};
use std::collections::HashMap;

use super::load_hub;
use crate::Context;
use crate::cli::{GraphArgs, GraphFormat};
use crate::ui;

pub fn run(ctx: &Context, args: &GraphArgs) -> Result<()> {
    let (_, nodes) = load_hub(ctx)?;
    let graph = DependencyGraph::build(nodes).context("Resource graph is invalid")?;

    match args.format {
        GraphFormat::Dot => print!("{}", graph.to_dot()),
        GraphFormat::Text => print_text(&graph),
    }
    Ok(())
}

fn print_text(graph: &DependencyGraph) {
    let edges = graph.edges();
    let mut by_source: HashMap<&NodeId, Vec<&DependencyEdge>> = HashMap::new();
    for edge in &edges {
        by_source.entry(&edge.from).or_default().push(edge);
    }

    let externals: Vec<_> = graph.nodes().iter().filter(|n| !n.is_managed()).collect();
    if !externals.is_empty() {
        ui::section("External (read only)");
        for node in externals {
            println!("  {} {}", "·".dimmed(), node.label());
        }
    }

    let plan = schedule(graph);
    for stage in plan.stages() {
        ui::section(&format!("Stage {}/{}", stage.index + 1, plan.len()));
        for node in &stage.nodes {
            println!("  {} {}", "→".cyan(), node.label());
            for edge in by_source.get(node.id()).into_iter().flatten() {
                println!(
                    "      {} {}",
                    edge.to,
                    format!("({})", edge.reason.as_str()).dimmed()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::context;

    #[test]
    fn test_graph_renders_offline() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        ctx.backend = crate::cloud::Backend::Local(dir.path().join("never-created.json"));

        run(&ctx, &GraphArgs { format: GraphFormat::Dot }).unwrap();
        run(&ctx, &GraphArgs { format: GraphFormat::Text }).unwrap();
        assert!(!dir.path().join("never-created.json").exists());
    }
}
