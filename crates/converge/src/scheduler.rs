//! Topological scheduler - groups managed nodes into ordered stages
//!
//! Stage K holds every managed node whose dependencies all sit in stages
//! before K. Nodes within a stage are independent and may be applied
//! concurrently. External nodes are never scheduled: they exist already,
//! so edges into them are satisfied from the start. Their own edges still
//! count, so a managed node reached through an external one keeps its place.

use crate::error::{Error, Result};
use crate::graph::DependencyGraph;
use crate::node::{NodeId, ResourceNode};
use std::collections::{BTreeSet, HashMap, HashSet};

/// One group of nodes that can be applied concurrently.
#[derive(Debug, Clone)]
pub struct Stage {
    /// 0-based position in the plan
    pub index: usize,
    /// Nodes in declaration order
    pub nodes: Vec<ResourceNode>,
}

/// Ordered stages ready for the executor.
#[derive(Debug, Clone, Default)]
pub struct ApplyPlan {
    stages: Vec<Stage>,
    /// Managed nodes each managed node must follow
    requires: HashMap<NodeId, Vec<NodeId>>,
}

/// Layer the managed nodes of `graph` into stages.
pub fn schedule(graph: &DependencyGraph) -> ApplyPlan {
    let nodes = graph.nodes();
    let requires: Vec<BTreeSet<usize>> = (0..nodes.len())
        .map(|i| managed_requirements(graph, i))
        .collect();

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut remaining: Vec<usize> = vec![0; nodes.len()];
    for (i, node) in nodes.iter().enumerate() {
        if !node.is_managed() {
            continue;
        }
        remaining[i] = requires[i].len();
        for &t in &requires[i] {
            dependents[t].push(i);
        }
    }

    let mut ready: Vec<usize> = (0..nodes.len())
        .filter(|&i| nodes[i].is_managed() && remaining[i] == 0)
        .collect();
    let mut stages = Vec::new();

    while !ready.is_empty() {
        ready.sort_unstable();
        let mut next = Vec::new();
        for &i in &ready {
            for &d in &dependents[i] {
                remaining[d] -= 1;
                if remaining[d] == 0 {
                    next.push(d);
                }
            }
        }
        stages.push(Stage {
            index: stages.len(),
            nodes: ready.iter().map(|&i| nodes[i].clone()).collect(),
        });
        ready = next;
    }

    let requires = nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.is_managed())
        .map(|(i, n)| {
            let deps = requires[i].iter().map(|&t| nodes[t].id().clone()).collect();
            (n.id().clone(), deps)
        })
        .collect();

    let plan = ApplyPlan { stages, requires };
    log::debug!(
        "Scheduled {} nodes into {} stages",
        plan.node_count(),
        plan.len()
    );
    plan
}

/// Managed nodes `i` must follow, looking through external nodes.
fn managed_requirements(graph: &DependencyGraph, i: usize) -> BTreeSet<usize> {
    let nodes = graph.nodes();
    let mut out = BTreeSet::new();
    let mut seen = HashSet::new();
    let mut stack: Vec<usize> = graph.dependency_indices(i).collect();
    while let Some(t) = stack.pop() {
        if !seen.insert(t) {
            continue;
        }
        if nodes[t].is_managed() {
            out.insert(t);
        } else {
            stack.extend(graph.dependency_indices(t));
        }
    }
    out
}

impl ApplyPlan {
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Number of stages
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Number of scheduled nodes across all stages
    pub fn node_count(&self) -> usize {
        self.stages.iter().map(|s| s.nodes.len()).sum()
    }

    /// Stage index of a scheduled node.
    pub fn stage_of(&self, id: &NodeId) -> Option<usize> {
        self.stages
            .iter()
            .find(|s| s.nodes.iter().any(|n| n.id() == id))
            .map(|s| s.index)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.stages.iter().flat_map(|s| s.nodes.iter())
    }

    /// Restrict the plan to nodes matching `target` and the nodes they need.
    ///
    /// Target format: "kind", "kind.name" or a node id.
    pub fn filter_by_target(&self, target: &str) -> Result<Self> {
        let (kind, name) = parse_target(target)?;
        let mut stack: Vec<&NodeId> = self
            .nodes()
            .filter(|n| matches_filter(n, kind, name))
            .map(ResourceNode::id)
            .collect();

        if stack.is_empty() {
            return Err(Error::validation(
                format!("target '{target}'"),
                "no resource matches",
            ));
        }

        let mut keep: HashSet<&NodeId> = HashSet::new();
        while let Some(id) = stack.pop() {
            if keep.insert(id)
                && let Some(deps) = self.requires.get(id)
            {
                stack.extend(deps.iter());
            }
        }

        let stages: Vec<Stage> = self
            .stages
            .iter()
            .map(|s| s.nodes.iter().filter(|n| keep.contains(n.id())).cloned().collect::<Vec<_>>())
            .filter(|nodes| !nodes.is_empty())
            .enumerate()
            .map(|(index, nodes)| Stage { index, nodes })
            .collect();

        let requires = self
            .requires
            .iter()
            .filter(|(id, _)| keep.contains(id))
            .map(|(id, deps)| (id.clone(), deps.clone()))
            .collect();

        Ok(Self { stages, requires })
    }
}

/// Parse a target string like "kind.name" into (kind, name)
fn parse_target(target: &str) -> Result<(&str, Option<&str>)> {
    let (kind, name) = match target.split_once('.') {
        None => (target, None),
        Some((kind, name)) => (kind, Some(name)),
    };
    if kind.is_empty() || name == Some("") {
        return Err(Error::validation(
            format!("target '{target}'"),
            "expected kind, kind.name or a node id",
        ));
    }
    Ok((kind, name))
}

/// Check if a node matches the filter criteria
fn matches_filter(node: &ResourceNode, kind: &str, name: Option<&str>) -> bool {
    if node.kind() != kind && node.id().as_str() != kind {
        return false;
    }

    if let Some(n) = name
        && node.name() != n
    {
        return false;
    }

    true
}
