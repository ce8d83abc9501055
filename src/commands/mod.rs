pub mod apply;
pub mod flow;
pub mod graph;
pub mod plan;
pub mod validate;

use anyhow::{Context as AnyhowContext, Result};
use converge::{ApplyOptions, ApplyPlan, CloudClient, DependencyGraph, ResourceNode};

use crate::Context;
use crate::config::HubParameters;
use crate::topology;

/// Parameters plus the nodes they describe; no control-plane access.
pub(crate) fn load_hub(ctx: &Context) -> Result<(HubParameters, Vec<ResourceNode>)> {
    let params = HubParameters::load_validated(&ctx.params)?;
    let nodes = topology::build_hub(&params).context("Could not build the hub topology")?;
    Ok((params, nodes))
}

/// Everything needed to plan or apply.
pub(crate) struct Prepared {
    pub params: HubParameters,
    pub graph: DependencyGraph,
    pub plan: ApplyPlan,
    pub client: Box<dyn CloudClient>,
}

/// Load, build, resolve against live state and schedule.
///
/// Structural defects are reported before the control plane is contacted.
pub(crate) fn prepare(ctx: &Context, target: Option<&str>) -> Result<Prepared> {
    let (params, nodes) = load_hub(ctx)?;
    let client = ctx.backend.connect()?;

    let (graph, mut plan) = converge::prepare(nodes, client.as_ref())
        .with_context(|| format!("Could not prepare the plan against {}", ctx.backend))?;
    if let Some(target) = target {
        plan = plan.filter_by_target(target)?;
    }
    log::info!(
        "{} in {}",
        crate::ui::count(plan.node_count(), "resource"),
        crate::ui::count(plan.len(), "stage")
    );

    Ok(Prepared {
        params,
        graph,
        plan,
        client,
    })
}

/// Engine options from `[engine]`, with the CLI flag winning.
pub(crate) fn apply_options(params: &HubParameters, jobs: Option<usize>, dry_run: bool) -> ApplyOptions {
    let defaults = ApplyOptions::default();
    ApplyOptions {
        dry_run,
        jobs: jobs.or(params.engine.jobs).unwrap_or(defaults.jobs),
        retry: params.engine.retry.clone(),
        ..defaults
    }
}
