//! # Converge
//!
//! A dependency-aware apply engine for declarative resource graphs.
//!
//! Describe the resources you want as [`ResourceNode`]s, let the engine
//! work out a safe order, and converge a remote control plane to match.
//! Re-running against a converged control plane performs no writes.
//!
//! ## Core Concepts
//!
//! - **ResourceNode**: a provisionable unit with a JSON document and
//!   structural links (parent, explicit dependencies, reference bindings)
//! - **KindRegistry**: naming, region and child-write constraints per kind
//! - **DependencyGraph**: acyclic apply-order constraints, including
//!   serialization of siblings under parents that reject concurrent writes
//! - **ApplyPlan**: ordered stages of nodes that can be applied concurrently
//! - **Executor**: applies the plan stage by stage with retries
//!
//! ## Example
//!
//! ```ignore
//! use converge::{
//!     ApplyOptions, ExternalReference, KindRegistry, KindSpec, NoProgress, NodeSpec,
//!     apply, prepare,
//! };
//!
//! let mut kinds = KindRegistry::new();
//! kinds.register(KindSpec::new("publicIPAddresses"));
//! kinds.register(KindSpec::new("azureFirewalls").regions(["westeurope"]));
//!
//! let pip = kinds
//!     .construct(NodeSpec::new("pip", "publicIPAddresses", "fw-pip").location("westeurope"))?;
//! let fw = kinds
//!     .construct(NodeSpec::new("fw", "azureFirewalls", "hub-fw").location("westeurope"))?
//!     .bind(
//!         "/properties/ipConfigurations/0/properties/publicIPAddress/id",
//!         ExternalReference::id_of("pip", "publicIPAddresses"),
//!     );
//!
//! let (_graph, plan) = prepare(vec![pip, fw], &client)?;
//! let report = apply(&plan, &client, &ApplyOptions::default(), &mut NoProgress)?;
//! report.into_result()?;
//! ```
//!
//! ## Provider Traits
//!
//! - [`CloudClient`]: create-or-update and get against a control plane
//! - [`LiveStateQuery`]: read-only lookups of existing resources
//! - [`ProgressCallback`]: receives stage and node progress
//! - [`RetryCallback`]: notified before each retry
//!
//! This allows the crate to be used without hard dependencies on a
//! specific provider SDK or UI framework.

pub mod client;
pub mod context;
pub mod diff;
pub mod error;
pub mod executor;
pub mod graph;
pub mod kind;
pub mod node;
pub mod reference;
pub mod retry;
pub mod scheduler;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types at crate root
pub use client::{ApplyRequest, ApplyResponse, CloudClient, WriteOutcome};
pub use context::{CancellationToken, LogProgress, NoProgress, ProgressCallback};
pub use diff::{Action, Comparison, FieldChange, classify, diff_documents, needs_update};
pub use error::{CloudError, Error, ErrorCategory, Result};
pub use executor::apply;
pub use graph::{DependencyEdge, DependencyGraph, EdgeReason};
pub use kind::{KindRegistry, KindSpec, NodeSpec, RegionPolicy};
pub use node::{ChildPolicy, Dependency, Management, NodeId, ResourceNode};
pub use reference::{
    Attribute, Binding, ExternalReference, LiveStateQuery, Resolution, Resolver, resolve_all,
};
pub use retry::{LogCallback, NoCallback, RetryCallback, with_retry};
pub use scheduler::{ApplyPlan, Stage, schedule};
pub use types::{ApplyOptions, ApplyReport, ApplySummary, NodeOutcome, NodeRecord, RetryConfig};

/// Build the graph, resolve references and schedule stages.
///
/// Graph defects (duplicates, dangling references, cycles) are reported
/// before any live-state query is made.
pub fn prepare<Q: LiveStateQuery + ?Sized>(
    nodes: Vec<ResourceNode>,
    query: &Q,
) -> Result<(DependencyGraph, ApplyPlan)> {
    let graph = DependencyGraph::build_resolved(nodes, query)?;
    let plan = schedule(&graph);
    Ok((graph, plan))
}
