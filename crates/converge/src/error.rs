//! Error types for the apply engine.
//!
//! Errors fall into two families:
//!
//! - Construction errors ([`Error`]) raised while validating nodes, building
//!   the dependency graph or resolving references. These abort a run before
//!   any write reaches the control plane and are never retried.
//! - Control-plane errors ([`CloudError`]) returned by a
//!   [`CloudClient`](crate::client::CloudClient). Each one maps to an
//!   [`ErrorCategory`] that drives the retry policy in [`crate::retry`].

use crate::node::NodeId;
use std::time::Duration;
use thiserror::Error;

/// Categories of control-plane errors for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Another operation is in progress on the same resource (HTTP 409)
    Conflict,
    /// The provider asked the caller to slow down (HTTP 429)
    Throttled,
    /// The resource or one of its parents does not exist
    NotFound,
    /// The provider rejected the request body
    Validation,
    /// Anything the client could not classify
    Unknown,
}

impl ErrorCategory {
    /// Whether this error category is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict | Self::Throttled)
    }

    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Conflict => "Concurrent modification",
            Self::Throttled => "Request throttled",
            Self::NotFound => "Resource not found",
            Self::Validation => "Request rejected",
            Self::Unknown => "Unexpected error",
        }
    }

    /// Get actionable advice for resolving this error category.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Conflict => "Wait for the other operation to finish and re-run apply",
            Self::Throttled => "Lower --jobs or re-run apply later",
            Self::NotFound => "Deploy the missing prerequisite and re-run apply",
            Self::Validation => "Fix the parameters for this resource and re-run apply",
            Self::Unknown => "Check the error details and re-run apply",
        }
    }
}

/// Errors reported by the external control plane.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloudError {
    /// Another write to the same resource (or its parent) is in progress
    #[error("conflict on {path}: {message}")]
    Conflict {
        /// Path of the resource being written
        path: String,
        /// Provider message
        message: String,
    },

    /// The provider throttled the request
    #[error("throttled on {path}{}", retry_hint(.retry_after))]
    Throttled {
        /// Path of the resource being written or read
        path: String,
        /// Provider-supplied retry-after hint
        retry_after: Option<Duration>,
    },

    /// The resource (or a parent required to create it) does not exist
    #[error("not found: {path}")]
    NotFound {
        /// Path that could not be found
        path: String,
    },

    /// The provider rejected the request
    #[error("rejected {path}: {message}")]
    ValidationRejected {
        /// Path of the rejected resource
        path: String,
        /// Provider message
        message: String,
    },

    /// Unclassified failure (transport, malformed response, server error)
    #[error("control plane error: {message}")]
    Unknown {
        /// Description of the failure
        message: String,
    },
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(" (retry after {}ms)", d.as_millis()))
        .unwrap_or_default()
}

impl CloudError {
    /// Get the error category for retry logic.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Conflict { .. } => ErrorCategory::Conflict,
            Self::Throttled { .. } => ErrorCategory::Throttled,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::ValidationRejected { .. } => ErrorCategory::Validation,
            Self::Unknown { .. } => ErrorCategory::Unknown,
        }
    }

    /// Whether this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    /// Provider-supplied delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Classify an HTTP status code returned by a REST control plane.
    pub fn from_status(
        status: u16,
        path: &str,
        message: impl Into<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        let message = message.into();
        match status {
            404 => Self::NotFound {
                path: path.to_string(),
            },
            409 => Self::Conflict {
                path: path.to_string(),
                message,
            },
            429 => Self::Throttled {
                path: path.to_string(),
                retry_after,
            },
            400 | 422 => Self::ValidationRejected {
                path: path.to_string(),
                message,
            },
            _ => Self::Unknown {
                message: format!("HTTP {status} for {path}: {message}"),
            },
        }
    }
}

/// Errors raised by the engine itself.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad input: naming, region, duplicate id, malformed document
    #[error("invalid {subject}: {message}")]
    Validation {
        /// What was being validated (node id, kind, parameter)
        subject: String,
        /// Why it was rejected
        message: String,
    },

    /// A node references an id that is not part of the graph
    #[error("{from} references unknown node '{target}'")]
    DanglingReference {
        /// Node holding the reference
        from: NodeId,
        /// Missing target
        target: NodeId,
    },

    /// The dependency graph contains a cycle
    #[error("dependency cycle detected: {}", format_cycle(.cycle))]
    CycleDetected {
        /// Every node on the cycle, first node repeated at the end
        cycle: Vec<NodeId>,
    },

    /// An existing (externally managed) prerequisite is missing
    #[error("{from} requires existing {kind} at {path}, which was not found")]
    UnresolvedReference {
        /// Node holding the reference
        from: NodeId,
        /// Kind of the missing resource
        kind: String,
        /// Path of the missing resource
        path: String,
    },

    /// A live-state query failed for a reason other than not-found
    #[error("live state query failed: {0}")]
    Cloud(#[from] CloudError),

    /// A node failed terminally during apply
    #[error("stage {} failed at {node}: {source}", .stage + 1)]
    ApplyFailed {
        /// Zero-based stage index
        stage: usize,
        /// Node that failed
        node: NodeId,
        /// Last error returned by the control plane
        source: CloudError,
    },

    /// The worker pool could not be created
    #[error("failed to create worker pool: {0}")]
    WorkerPool(String),
}

fn format_cycle(cycle: &[NodeId]) -> String {
    cycle
        .iter()
        .map(NodeId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl Error {
    /// Shorthand for a validation error.
    pub fn validation(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            subject: subject.into(),
            message: message.into(),
        }
    }

    /// Whether the error was raised before any write reached the control plane.
    pub fn is_preflight(&self) -> bool {
        !matches!(self, Self::ApplyFailed { .. })
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
