//! Core types for applying a plan

use crate::context::CancellationToken;
use crate::diff::{Action, FieldChange};
use crate::error::{CloudError, Error, Result};
use crate::node::NodeId;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::time::Duration;

/// Retry configuration with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Base delay between retries
    #[serde(with = "millis")]
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum delay between retries
    #[serde(with = "millis")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with custom settings.
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_factor,
            max_delay: Duration::from_secs(60),
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Create a config that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Options for an apply run
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Classify every node but write nothing
    pub dry_run: bool,
    /// Maximum concurrent calls within a stage
    pub jobs: usize,
    pub retry: RetryConfig,
    pub cancel: CancellationToken,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            jobs: 4,
            retry: RetryConfig::default(),
            cancel: CancellationToken::new(),
        }
    }
}

/// What happened to one node
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeOutcome {
    /// Resource was created
    Created,
    /// Resource existed and was updated
    Updated,
    /// Live state already matched
    NoChange,
    /// Dry run: the action apply would take
    Planned { action: Action },
    /// Apply failed
    Failed {
        #[serde(serialize_with = "as_display")]
        error: CloudError,
    },
    /// Not attempted
    Skipped { reason: String },
}

impl NodeOutcome {
    /// Check if the outcome represents a failure
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Check if the outcome wrote to the control plane
    pub fn is_change(&self) -> bool {
        matches!(self, Self::Created | Self::Updated)
    }
}

fn as_display<S: Serializer>(error: &CloudError, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.collect_str(error)
}

/// Per-node entry of an [`ApplyReport`]
#[derive(Debug, Clone, Serialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub label: String,
    pub stage: usize,
    /// `None` when the node was skipped before classification
    pub action: Option<Action>,
    pub outcome: NodeOutcome,
    /// Differing fields (empty for create and no-op)
    pub changes: Vec<FieldChange>,
    /// Desired document as sent (or as it would be sent)
    pub desired: Value,
    /// Live document before apply
    pub live: Option<Value>,
    /// Document after apply; feeds deferred bindings of later stages
    #[serde(skip)]
    pub output: Option<Value>,
}

/// Summary counts of an apply run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub planned: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl ApplySummary {
    /// Total number of writes made
    pub fn total_changes(&self) -> usize {
        self.created + self.updated
    }

    /// Check if the run had no failures
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// Total number of nodes processed
    pub fn total(&self) -> usize {
        self.created + self.updated + self.unchanged + self.planned + self.failed + self.skipped
    }

    /// Add an outcome to the summary
    pub fn add(&mut self, outcome: &NodeOutcome) {
        match outcome {
            NodeOutcome::Created => self.created += 1,
            NodeOutcome::Updated => self.updated += 1,
            NodeOutcome::NoChange => self.unchanged += 1,
            NodeOutcome::Planned { .. } => self.planned += 1,
            NodeOutcome::Failed { .. } => self.failed += 1,
            NodeOutcome::Skipped { .. } => self.skipped += 1,
        }
    }
}

/// Result of applying a plan
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    /// Records in stage order, declaration order within a stage
    pub records: Vec<NodeRecord>,
    /// First stage that had a failure
    pub failed_stage: Option<usize>,
    pub cancelled: bool,
    pub dry_run: bool,
    pub stages: usize,
}

impl ApplyReport {
    pub fn summary(&self) -> ApplySummary {
        let mut summary = ApplySummary::default();
        for record in &self.records {
            summary.add(&record.outcome);
        }
        summary
    }

    pub fn record(&self, id: &NodeId) -> Option<&NodeRecord> {
        self.records.iter().find(|r| &r.id == id)
    }

    pub fn failures(&self) -> impl Iterator<Item = &NodeRecord> {
        self.records.iter().filter(|r| r.outcome.is_failure())
    }

    pub fn is_success(&self) -> bool {
        self.failed_stage.is_none() && !self.cancelled
    }

    /// Turn the first failure into an error naming its stage and node.
    pub fn into_result(self) -> Result<Self> {
        let failure = self.records.iter().find_map(|r| match &r.outcome {
            NodeOutcome::Failed { error } => Some((r.stage, r.id.clone(), error.clone())),
            _ => None,
        });
        match failure {
            Some((stage, node, source)) => Err(Error::ApplyFailed {
                stage,
                node,
                source,
            }),
            None => Ok(self),
        }
    }
}
