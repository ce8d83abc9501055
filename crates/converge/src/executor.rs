//! Execution engine - applies a staged plan with bounded parallelism
//!
//! Stages run strictly one after another. Nodes of one stage are dispatched
//! on a rayon pool sized by `jobs`; the stage completes when every node has
//! terminated. A failure lets its siblings finish but keeps every later
//! stage from starting.

use crate::client::{ApplyRequest, CloudClient, WriteOutcome};
use crate::context::ProgressCallback;
use crate::diff::{Action, Comparison, classify};
use crate::error::{CloudError, Error, Result};
use crate::node::{NodeId, ResourceNode};
use crate::reference::{Attribute, inject, normalize_document};
use crate::retry::{LogCallback, with_retry};
use crate::scheduler::{ApplyPlan, Stage};
use crate::types::{ApplyOptions, ApplyReport, NodeOutcome, NodeRecord};
use rayon::prelude::*;
use serde_json::Value;
use std::collections::HashMap;

/// Apply `plan` against `client`.
///
/// Returns a report even when a node fails; use
/// [`ApplyReport::into_result`] to turn the first failure into an error.
/// Only a worker-pool setup failure is returned as `Err`.
pub fn apply<C, P>(
    plan: &ApplyPlan,
    client: &C,
    opts: &ApplyOptions,
    progress: &mut P,
) -> Result<ApplyReport>
where
    C: CloudClient + ?Sized,
    P: ProgressCallback,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.jobs.max(1))
        .build()
        .map_err(|e| Error::WorkerPool(e.to_string()))?;

    let mut report = ApplyReport {
        dry_run: opts.dry_run,
        stages: plan.len(),
        ..Default::default()
    };
    let mut outputs: HashMap<NodeId, Value> = HashMap::new();

    for stage in plan.stages() {
        if report.failed_stage.is_none() && !report.cancelled && opts.cancel.is_cancelled() {
            log::warn!("Cancelled before stage {}", stage.index + 1);
            report.cancelled = true;
        }

        if let Some(reason) = skip_reason(&report) {
            report.records.extend(skipped(stage, &reason));
            continue;
        }

        progress.on_stage_start(stage, plan.len());
        log::info!(
            "Applying stage {}/{} ({} resources)",
            stage.index + 1,
            plan.len(),
            stage.nodes.len()
        );

        let records: Vec<NodeRecord> = pool.install(|| {
            stage
                .nodes
                .par_iter()
                .map(|node| converge_node(node, stage.index, client, opts, &outputs))
                .collect()
        });

        for record in records {
            progress.on_node_complete(&record);
            if record.outcome.is_failure() && report.failed_stage.is_none() {
                report.failed_stage = Some(stage.index);
            }
            if let Some(output) = &record.output {
                outputs.insert(record.id.clone(), output.clone());
            }
            report.records.push(record);
        }
        progress.on_stage_complete(stage);
    }

    let summary = report.summary();
    log::info!(
        "Apply finished: {} created, {} updated, {} unchanged, {} failed, {} skipped",
        summary.created,
        summary.updated,
        summary.unchanged,
        summary.failed,
        summary.skipped
    );
    Ok(report)
}

fn skip_reason(report: &ApplyReport) -> Option<String> {
    if let Some(failed) = report.failed_stage {
        return Some(format!("stage {} failed", failed + 1));
    }
    report.cancelled.then(|| "cancelled".to_string())
}

fn skipped(stage: &Stage, reason: &str) -> Vec<NodeRecord> {
    stage
        .nodes
        .iter()
        .map(|node| NodeRecord {
            id: node.id().clone(),
            label: node.label(),
            stage: stage.index,
            action: None,
            outcome: NodeOutcome::Skipped {
                reason: reason.to_string(),
            },
            changes: Vec::new(),
            desired: node.document().clone(),
            live: None,
            output: None,
        })
        .collect()
}

/// Bring one node to its desired state.
fn converge_node<C: CloudClient + ?Sized>(
    node: &ResourceNode,
    stage: usize,
    client: &C,
    opts: &ApplyOptions,
    outputs: &HashMap<NodeId, Value>,
) -> NodeRecord {
    let mut record = NodeRecord {
        id: node.id().clone(),
        label: node.label(),
        stage,
        action: None,
        outcome: NodeOutcome::NoChange,
        changes: Vec::new(),
        desired: node.document().clone(),
        live: None,
        output: None,
    };

    let fail = |mut record: NodeRecord, error: CloudError| {
        log::debug!("{} failed: {}", record.id, error);
        record.outcome = NodeOutcome::Failed { error };
        record
    };

    if let Err(error) = bind_outputs(node, &mut record.desired, outputs, opts.dry_run) {
        return fail(record, error);
    }

    let live = match with_retry(&opts.retry, &opts.cancel, Some(&LogCallback), || {
        client.get(node.kind(), node.path())
    }) {
        Ok(live) => live,
        Err(error) => return fail(record, error),
    };

    let comparison = Comparison::for_node(node);
    let action = classify(&record.desired, live.as_ref(), &comparison);
    record.action = Some(action);
    if let Some(live) = &live {
        record.changes = comparison.diff(&record.desired, live);
    }
    log::debug!(
        "{}: {} ({} changed fields)",
        node.label(),
        action,
        record.changes.len()
    );
    record.live.clone_from(&live);

    if action == Action::NoOp {
        record.outcome = NodeOutcome::NoChange;
        record.output = live;
        return record;
    }

    if opts.dry_run {
        record.outcome = NodeOutcome::Planned { action };
        record.output = live;
        return record;
    }

    let request = ApplyRequest::for_node(node, record.desired.clone());
    match with_retry(&opts.retry, &opts.cancel, Some(&LogCallback), || {
        client.create_or_update(&request)
    }) {
        Ok(response) => {
            record.outcome = match response.outcome {
                WriteOutcome::Created => NodeOutcome::Created,
                WriteOutcome::Updated => NodeOutcome::Updated,
            };
            record.output = Some(response.document);
            record
        }
        Err(error) => fail(record, error),
    }
}

/// Fill deferred bindings from the post-apply documents of earlier stages.
///
/// In a dry run a missing output is left out of the desired document; it
/// is only known once the target has been applied.
fn bind_outputs(
    node: &ResourceNode,
    desired: &mut Value,
    outputs: &HashMap<NodeId, Value>,
    dry_run: bool,
) -> std::result::Result<(), CloudError> {
    let mut bound = false;
    for binding in node.pending_bindings() {
        let reference = &binding.reference;
        let value = match &reference.attribute {
            Attribute::Id => outputs
                .get(&reference.target)
                .and_then(|doc| doc.get("id"))
                .cloned(),
            Attribute::Property(pointer) => outputs
                .get(&reference.target)
                .and_then(|doc| doc.pointer(pointer))
                .cloned(),
        };

        match value {
            Some(value) => {
                inject(desired, &binding.pointer, value).map_err(|message| CloudError::Unknown {
                    message: format!("{} binding {}: {}", node.id(), binding.pointer, message),
                })?;
                bound = true;
            }
            None if dry_run => {
                log::debug!(
                    "{}{} is known after apply",
                    node.id(),
                    binding.pointer
                );
            }
            None => {
                return Err(CloudError::Unknown {
                    message: format!(
                        "output of {} needed by {} at {} is not available",
                        reference.target,
                        node.id(),
                        binding.pointer
                    ),
                });
            }
        }
    }

    if bound {
        normalize_document(desired, node.unordered_fields());
    }
    Ok(())
}
