//! Dependency graph builder
//!
//! Edges mean "apply `from` strictly after `to`". They come from:
//!
//! - explicit `depends_on` declarations (single nodes or whole families)
//! - reference bindings
//! - the parent link (a child is applied after its parent)
//! - the descendant rule: depending on a resource means depending on every
//!   managed resource nested under it
//! - sibling serialization: children of a parent whose kind only supports
//!   whole-object replace are chained, so no two of them are ever written
//!   concurrently
//!
//! Building either yields a complete acyclic graph or an error; no partial
//! graph is ever returned.

use crate::error::{Error, Result};
use crate::node::{ChildPolicy, Dependency, NodeId, ResourceNode};
use crate::reference::{LiveStateQuery, resolve_all};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::fmt::Write as _;

/// Why an edge exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeReason {
    Explicit,
    Reference,
    Parent,
    Descendant,
    Sibling,
}

impl EdgeReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Reference => "reference",
            Self::Parent => "parent",
            Self::Descendant => "descendant",
            Self::Sibling => "sibling",
        }
    }
}

/// `from` must be applied strictly after `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyEdge {
    pub from: NodeId,
    pub to: NodeId,
    pub reason: EdgeReason,
}

/// Acyclic graph of apply-order constraints.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<ResourceNode>,
    index: HashMap<NodeId, usize>,
    /// `deps[i]` holds the nodes `i` must follow
    deps: Vec<BTreeMap<usize, EdgeReason>>,
}

impl DependencyGraph {
    /// Build the graph from nodes in declaration order.
    pub fn build(nodes: Vec<ResourceNode>) -> Result<Self> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id().clone(), i).is_some() {
                return Err(Error::validation(
                    format!("node {}", node.id()),
                    "id is declared more than once",
                ));
            }
        }

        let mut families: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            if let Some(member) = node.family() {
                families.entry(member.family.as_str()).or_default().push(i);
            }
        }

        let lookup = |from: &ResourceNode, target: &NodeId| -> Result<usize> {
            index
                .get(target)
                .copied()
                .ok_or_else(|| Error::DanglingReference {
                    from: from.id().clone(),
                    target: target.clone(),
                })
        };

        let mut deps: Vec<BTreeMap<usize, EdgeReason>> = vec![BTreeMap::new(); nodes.len()];
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];

        for (i, node) in nodes.iter().enumerate() {
            if let Some(parent) = node.parent() {
                let p = lookup(node, &parent.id)?;
                children[p].push(i);
                add_edge(&mut deps, i, p, EdgeReason::Parent);
            }

            for dep in node.dependencies() {
                match dep {
                    Dependency::Node(target) => {
                        let t = lookup(node, target)?;
                        add_edge(&mut deps, i, t, EdgeReason::Explicit);
                    }
                    Dependency::Family(family) => {
                        let members = families.get(family.as_str()).ok_or_else(|| {
                            Error::DanglingReference {
                                from: node.id().clone(),
                                target: NodeId::new(family.as_str()),
                            }
                        })?;
                        for &t in members {
                            add_edge(&mut deps, i, t, EdgeReason::Explicit);
                        }
                    }
                }
            }

            for binding in node.bindings() {
                let t = lookup(node, &binding.reference.target)?;
                add_edge(&mut deps, i, t, EdgeReason::Reference);
            }
        }

        apply_descendant_rule(&nodes, &children, &mut deps);

        if let Some(cycle) = find_cycle(&deps) {
            return Err(Error::CycleDetected {
                cycle: cycle.into_iter().map(|i| nodes[i].id().clone()).collect(),
            });
        }

        serialize_siblings(&nodes, &children, &mut deps);

        // A sibling's subtree can depend on a later sibling.
        if let Some(cycle) = find_cycle(&deps) {
            return Err(Error::CycleDetected {
                cycle: cycle.into_iter().map(|i| nodes[i].id().clone()).collect(),
            });
        }

        log::debug!(
            "Built dependency graph: {} nodes, {} edges",
            nodes.len(),
            deps.iter().map(BTreeMap::len).sum::<usize>()
        );

        Ok(Self { nodes, index, deps })
    }

    /// Build the graph, then resolve every reference binding.
    ///
    /// Structural defects are reported before any live-state query.
    pub fn build_resolved<Q: LiveStateQuery + ?Sized>(
        nodes: Vec<ResourceNode>,
        query: &Q,
    ) -> Result<Self> {
        let mut graph = Self::build(nodes)?;
        let deferred = resolve_all(&mut graph.nodes, query)?;
        if deferred > 0 {
            log::debug!("{} bindings deferred until apply", deferred);
        }
        Ok(graph)
    }

    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    pub fn node(&self, id: &NodeId) -> Option<&ResourceNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn dependency_indices(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        self.deps[i].keys().copied()
    }

    /// Ids `id` must be applied after.
    pub fn dependencies_of(&self, id: &NodeId) -> Vec<&NodeId> {
        self.index
            .get(id)
            .map(|&i| self.deps[i].keys().map(|&t| self.nodes[t].id()).collect())
            .unwrap_or_default()
    }

    /// Every edge, ordered by source then target declaration order.
    pub fn edges(&self) -> Vec<DependencyEdge> {
        self.deps
            .iter()
            .enumerate()
            .flat_map(|(from, targets)| {
                targets.iter().map(move |(&to, &reason)| DependencyEdge {
                    from: self.nodes[from].id().clone(),
                    to: self.nodes[to].id().clone(),
                    reason,
                })
            })
            .collect()
    }

    /// Render the graph in Graphviz dot format.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph resources {\n  rankdir=LR;\n");
        for node in &self.nodes {
            let style = if node.is_managed() { "solid" } else { "dashed" };
            let _ = writeln!(
                out,
                "  \"{}\" [label=\"{}\\n{}\", style={}];",
                node.id(),
                node.id(),
                node.label(),
                style
            );
        }
        for edge in self.edges() {
            let _ = writeln!(
                out,
                "  \"{}\" -> \"{}\" [label=\"{}\"];",
                edge.from,
                edge.to,
                edge.reason.as_str()
            );
        }
        out.push_str("}\n");
        out
    }
}

fn add_edge(deps: &mut [BTreeMap<usize, EdgeReason>], from: usize, to: usize, reason: EdgeReason) {
    deps[from].entry(to).or_insert(reason);
}

/// Depending on a node means depending on everything nested under it.
fn apply_descendant_rule(
    nodes: &[ResourceNode],
    children: &[Vec<usize>],
    deps: &mut [BTreeMap<usize, EdgeReason>],
) {
    for from in 0..nodes.len() {
        let targets: Vec<usize> = deps[from]
            .iter()
            .filter(|(_, reason)| **reason != EdgeReason::Parent)
            .map(|(&t, _)| t)
            .collect();

        for to in targets {
            let subtree = descendants(children, to);
            if subtree.contains(&from) {
                continue;
            }
            for d in subtree {
                if nodes[d].is_managed() {
                    add_edge(deps, from, d, EdgeReason::Descendant);
                }
            }
        }
    }
}

fn descendants(children: &[Vec<usize>], root: usize) -> Vec<usize> {
    let mut out = Vec::new();
    let mut stack = children[root].clone();
    while let Some(i) = stack.pop() {
        out.push(i);
        stack.extend(children[i].iter().copied());
    }
    out
}

/// Depth-first search in declaration order. Returns the nodes on the first
/// cycle found, with the first node repeated at the end.
fn find_cycle(deps: &[BTreeMap<usize, EdgeReason>]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Grey,
        Black,
    }

    fn visit(
        i: usize,
        deps: &[BTreeMap<usize, EdgeReason>],
        marks: &mut [Mark],
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[i] = Mark::Grey;
        path.push(i);
        for &next in deps[i].keys() {
            match marks[next] {
                Mark::Grey => {
                    let start = path.iter().position(|&p| p == next).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::White => {
                    if let Some(cycle) = visit(next, deps, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Black => {}
            }
        }
        path.pop();
        marks[i] = Mark::Black;
        None
    }

    let mut marks = vec![Mark::White; deps.len()];
    let mut path = Vec::new();
    for i in 0..deps.len() {
        if marks[i] == Mark::White
            && let Some(cycle) = visit(i, deps, &mut marks, &mut path)
        {
            return Some(cycle);
        }
    }
    None
}

/// Deterministic topological order: among ready nodes, lowest declaration
/// index first. The graph must be acyclic.
fn linearize(deps: &[BTreeMap<usize, EdgeReason>]) -> Vec<usize> {
    let n = deps.len();
    let mut remaining: Vec<usize> = deps.iter().map(BTreeMap::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (from, targets) in deps.iter().enumerate() {
        for &to in targets.keys() {
            dependents[to].push(from);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|&i| remaining[i] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::with_capacity(n);
    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &d in &dependents[i] {
            remaining[d] -= 1;
            if remaining[d] == 0 {
                ready.push(Reverse(d));
            }
        }
    }
    order
}

/// Chain the managed children of every serialized parent.
///
/// Siblings are ordered by where their subtree finishes in a topological
/// order of the graph so far. A sibling also follows everything nested
/// under the siblings before it.
fn serialize_siblings(
    nodes: &[ResourceNode],
    children: &[Vec<usize>],
    deps: &mut [BTreeMap<usize, EdgeReason>],
) {
    let order = linearize(deps);
    let mut position = vec![0; nodes.len()];
    for (pos, &i) in order.iter().enumerate() {
        position[i] = pos;
    }

    for (parent, kids) in children.iter().enumerate() {
        if nodes[parent].child_policy() != ChildPolicy::Serialized {
            continue;
        }
        let mut managed: Vec<usize> = kids
            .iter()
            .copied()
            .filter(|&k| nodes[k].is_managed())
            .collect();
        managed.sort_by_key(|&k| {
            let last = descendants(children, k)
                .into_iter()
                .map(|d| position[d])
                .max()
                .unwrap_or(0);
            (last.max(position[k]), position[k])
        });

        for (k, &child) in managed.iter().enumerate() {
            for &prior in &managed[..k] {
                add_edge(deps, child, prior, EdgeReason::Sibling);
                for d in descendants(children, prior) {
                    if nodes[d].is_managed() {
                        add_edge(deps, child, d, EdgeReason::Descendant);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::{KindRegistry, KindSpec, NodeSpec};
    use crate::reference::ExternalReference;

    fn registry() -> KindRegistry {
        let mut r = KindRegistry::new();
        r.register(KindSpec::new("virtualNetworks").serialize_children());
        r.register(KindSpec::new("subnets").child_resource());
        r.register(KindSpec::new("firewallPolicies").serialize_children());
        r.register(KindSpec::new("ruleCollectionGroups").child_resource());
        r.register(KindSpec::new("azureFirewalls"));
        r.register(KindSpec::new("publicIPAddresses"));
        r
    }

    fn top(r: &KindRegistry, id: &str, kind: &str) -> ResourceNode {
        r.construct(NodeSpec::new(id, kind, id).location("westeurope"))
            .unwrap()
    }

    fn child(r: &KindRegistry, id: &str, kind: &str, parent: &ResourceNode) -> ResourceNode {
        r.construct(NodeSpec::new(id, kind, id).parent(parent)).unwrap()
    }

    fn reasons(graph: &DependencyGraph, from: &str) -> Vec<(String, EdgeReason)> {
        graph
            .edges()
            .into_iter()
            .filter(|e| e.from.as_str() == from)
            .map(|e| (e.to.to_string(), e.reason))
            .collect()
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let r = registry();
        let err = DependencyGraph::build(vec![top(&r, "a", "azureFirewalls"), top(&r, "a", "azureFirewalls")])
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_unknown_dependency_is_dangling() {
        let r = registry();
        let fw = top(&r, "fw", "azureFirewalls").depends_on("policy");
        assert!(matches!(
            DependencyGraph::build(vec![fw]),
            Err(Error::DanglingReference { .. })
        ));

        let fw = top(&r, "fw", "azureFirewalls").depends_on_family("pip");
        assert!(matches!(
            DependencyGraph::build(vec![fw]),
            Err(Error::DanglingReference { .. })
        ));
    }

    #[test]
    fn test_cycle_reports_every_node_on_it() {
        let r = registry();
        let a = top(&r, "a", "azureFirewalls").depends_on("c");
        let b = top(&r, "b", "azureFirewalls").depends_on("a");
        let c = top(&r, "c", "azureFirewalls").depends_on("b");
        let d = top(&r, "d", "azureFirewalls");

        match DependencyGraph::build(vec![d, a, b, c]) {
            Err(Error::CycleDetected { cycle }) => {
                let ids: Vec<&str> = cycle.iter().map(NodeId::as_str).collect();
                assert_eq!(ids, vec!["a", "c", "b", "a"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_reference_cycle_detected() {
        let r = registry();
        let a = top(&r, "a", "publicIPAddresses").bind(
            "/properties/peer",
            ExternalReference::id_of("b", "publicIPAddresses"),
        );
        let b = top(&r, "b", "publicIPAddresses").bind(
            "/properties/peer",
            ExternalReference::id_of("a", "publicIPAddresses"),
        );
        assert!(matches!(
            DependencyGraph::build(vec![a, b]),
            Err(Error::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_descendant_rule() {
        let r = registry();
        let policy = top(&r, "policy", "firewallPolicies");
        let g1 = child(&r, "g1", "ruleCollectionGroups", &policy);
        let g2 = child(&r, "g2", "ruleCollectionGroups", &policy);
        let fw = top(&r, "fw", "azureFirewalls").bind(
            "/properties/firewallPolicy/id",
            ExternalReference::id_of("policy", "firewallPolicies"),
        );

        let graph = DependencyGraph::build(vec![policy, g1, g2, fw]).unwrap();
        let fw_deps = reasons(&graph, "fw");
        assert!(fw_deps.contains(&("policy".to_string(), EdgeReason::Reference)));
        assert!(fw_deps.contains(&("g1".to_string(), EdgeReason::Descendant)));
        assert!(fw_deps.contains(&("g2".to_string(), EdgeReason::Descendant)));
    }

    #[test]
    fn test_siblings_serialized_respecting_explicit_order() {
        let r = registry();
        let policy = top(&r, "policy", "firewallPolicies");
        // Declared first but depends on the later sibling.
        let net = child(&r, "net", "ruleCollectionGroups", &policy).depends_on("app");
        let app = child(&r, "app", "ruleCollectionGroups", &policy);
        let dnat = child(&r, "dnat", "ruleCollectionGroups", &policy);

        let graph = DependencyGraph::build(vec![policy, net, app, dnat]).unwrap();
        assert!(reasons(&graph, "net").contains(&("app".to_string(), EdgeReason::Explicit)));
        assert!(reasons(&graph, "dnat").contains(&("net".to_string(), EdgeReason::Sibling)));
        assert!(reasons(&graph, "dnat").contains(&("app".to_string(), EdgeReason::Sibling)));
        assert!(reasons(&graph, "app").iter().all(|(to, _)| to == "policy"));
    }

    #[test]
    fn test_independent_parent_does_not_serialize() {
        let r = registry();
        let fw = top(&r, "fw", "azureFirewalls");
        let mut r2 = r.clone();
        r2.register(KindSpec::new("diagnostics").child_resource());
        let d1 = child(&r2, "d1", "diagnostics", &fw);
        let d2 = child(&r2, "d2", "diagnostics", &fw);
        let graph = DependencyGraph::build(vec![fw, d1, d2]).unwrap();
        assert_eq!(reasons(&graph, "d2"), vec![("fw".to_string(), EdgeReason::Parent)]);
    }

    #[test]
    fn test_sibling_waits_for_earlier_siblings_subtree() {
        let mut r = registry();
        r.register(KindSpec::new("routes").child_resource());
        let vnet = top(&r, "vnet", "virtualNetworks");
        let sn1 = child(&r, "sn1", "subnets", &vnet);
        let route = child(&r, "route", "routes", &sn1);
        let sn2 = child(&r, "sn2", "subnets", &vnet);

        let graph = DependencyGraph::build(vec![vnet, sn1, route, sn2]).unwrap();
        assert!(reasons(&graph, "sn2").contains(&("sn1".to_string(), EdgeReason::Sibling)));
        assert!(reasons(&graph, "sn2").contains(&("route".to_string(), EdgeReason::Descendant)));

        let plan = crate::scheduler::schedule(&graph);
        let stage = |id: &str| plan.stage_of(&id.into()).unwrap();
        assert!(stage("sn2") > stage("route"));
        assert!(stage("route") > stage("sn1"));
    }

    #[test]
    fn test_sibling_order_follows_subtree_dependencies() {
        let mut r = registry();
        r.register(KindSpec::new("routes").child_resource());
        let vnet = top(&r, "vnet", "virtualNetworks");
        let sn1 = child(&r, "sn1", "subnets", &vnet);
        // Nested under sn1 but needs sn2, so sn2 must go first.
        let route = child(&r, "route", "routes", &sn1).depends_on("sn2");
        let sn2 = child(&r, "sn2", "subnets", &vnet);

        let graph = DependencyGraph::build(vec![vnet, sn1, route, sn2]).unwrap();
        assert!(reasons(&graph, "sn1").contains(&("sn2".to_string(), EdgeReason::Sibling)));
        assert!(reasons(&graph, "sn2").iter().all(|(to, _)| to == "vnet"));
    }

    #[test]
    fn test_dot_output() {
        let r = registry();
        let vnet = r.external("vnet", "virtualNetworks", "spoke", None).unwrap();
        let subnet = child(&r, "sn", "subnets", &vnet);
        let dot = DependencyGraph::build(vec![vnet, subnet]).unwrap().to_dot();
        assert!(dot.contains("\"sn\" -> \"vnet\" [label=\"parent\"]"));
        assert!(dot.contains("style=dashed"));
    }
}
