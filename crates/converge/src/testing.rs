//! In-memory control plane for unit tests.

use crate::client::{ApplyRequest, ApplyResponse, CloudClient, WriteOutcome};
use crate::error::CloudError;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Stores documents by path, adds provider fields on write, and replays
/// scripted failures.
#[derive(Default)]
pub(crate) struct MockCloud {
    state: Mutex<HashMap<String, Value>>,
    writes: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, VecDeque<CloudError>>>,
    gets: AtomicUsize,
}

impl MockCloud {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn seed(&self, path: &str, document: Value) {
        self.state.lock().unwrap().insert(path.to_string(), document);
    }

    /// Fail the next write to `path` with `error`.
    pub(crate) fn fail_next(&self, path: &str, error: CloudError) {
        self.failures
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(error);
    }

    /// Paths written, in call order (failed attempts included).
    pub(crate) fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }

    pub(crate) fn get_calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub(crate) fn document(&self, path: &str) -> Option<Value> {
        self.state.lock().unwrap().get(path).cloned()
    }
}

impl CloudClient for MockCloud {
    fn create_or_update(&self, request: &ApplyRequest) -> Result<ApplyResponse, CloudError> {
        self.writes.lock().unwrap().push(request.path.clone());

        if let Some(error) = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&request.path)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        let mut state = self.state.lock().unwrap();
        let existing = state.get(&request.path);
        let outcome = if existing.is_some() {
            WriteOutcome::Updated
        } else {
            WriteOutcome::Created
        };
        let guid = existing
            .and_then(|doc| doc.pointer("/properties/resourceGuid").cloned())
            .unwrap_or_else(|| json!(format!("guid-{}", request.name)));

        let mut document = request.document.clone();
        document["id"] = json!(request.path);
        document["etag"] = json!(format!("W/\"{}\"", state.len()));
        document["properties"]["provisioningState"] = json!("Succeeded");
        document["properties"]["resourceGuid"] = guid;
        state.insert(request.path.clone(), document.clone());

        Ok(ApplyResponse {
            id: request.path.clone(),
            outcome,
            document,
        })
    }

    fn get(&self, _kind: &str, path: &str) -> Result<Option<Value>, CloudError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().unwrap().get(path).cloned())
    }
}
