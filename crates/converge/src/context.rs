//! Progress reporting and cancellation
//!
//! These hooks let the engine run without depending on a specific UI.

use crate::scheduler::Stage;
use crate::types::NodeRecord;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Progress callback for apply runs
///
/// Called from the coordinating thread only.
pub trait ProgressCallback: Send {
    /// Called when a stage is about to be dispatched
    fn on_stage_start(&mut self, stage: &Stage, total_stages: usize);

    /// Called once per node after its stage finished
    fn on_node_complete(&mut self, record: &NodeRecord);

    /// Called when every node of a stage has terminated
    fn on_stage_complete(&mut self, stage: &Stage);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_stage_start(&mut self, _stage: &Stage, _total_stages: usize) {}
    fn on_node_complete(&mut self, _record: &NodeRecord) {}
    fn on_stage_complete(&mut self, _stage: &Stage) {}
}

/// Progress callback that logs through the `log` facade
pub struct LogProgress;

impl ProgressCallback for LogProgress {
    fn on_stage_start(&mut self, stage: &Stage, total_stages: usize) {
        let ids: Vec<&str> = stage.nodes.iter().map(|n| n.id().as_str()).collect();
        log::info!(
            "Stage {}/{}: {}",
            stage.index + 1,
            total_stages,
            ids.join(", ")
        );
    }

    fn on_node_complete(&mut self, record: &NodeRecord) {
        log::debug!("{}: {:?}", record.id, record.outcome);
    }

    fn on_stage_complete(&mut self, _stage: &Stage) {}
}

/// Cooperative cancellation flag shared between the caller and the engine.
///
/// Once raised, no new stage starts and pending retries stop.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early if cancelled.
    ///
    /// Returns `false` if the token was raised before the full duration.
    pub fn sleep(&self, duration: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(50);
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLICE.min(deadline - now));
        }
    }
}
