//! File-backed simulated control plane
//!
//! Behaves like an ARM-style resource API closely enough to exercise the
//! engine end to end:
//!
//! - writes are whole-document create-or-update
//! - a child write fails with `NotFound` while its parent does not exist
//! - writes anywhere under the same top-level resource must not overlap;
//!   an overlapping write is answered with `Conflict`
//! - stored documents carry provider-computed fields (`id`, `etag`,
//!   `provisioningState`, identity principal ids, public IP addresses)

use anyhow::{Context, Result};
use converge::{ApplyRequest, ApplyResponse, CloudClient, CloudError, WriteOutcome};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::topology::{IDENTITIES, PUBLIC_IPS};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredResource {
    kind: String,
    document: Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Store {
    resources: BTreeMap<String, StoredResource>,
}

pub struct LocalCloud {
    path: Option<PathBuf>,
    store: Mutex<Store>,
    busy: Mutex<HashSet<String>>,
    write_delay: Duration,
}

/// Releases a top-level resource when the write holding it ends.
struct BusyGuard<'a> {
    busy: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        lock(self.busy).remove(&self.key);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `/kind/name` of the outermost ancestor.
fn top_level(path: &str) -> String {
    path.split('/').take(3).collect::<Vec<_>>().join("/")
}

impl LocalCloud {
    /// Open (or start) a control plane persisted at `path`
    pub fn open(path: &Path) -> Result<Self> {
        let store = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Could not read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Invalid control-plane state in {}", path.display()))?
        } else {
            log::debug!("No state at {}, starting empty", path.display());
            Store::default()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            store: Mutex::new(store),
            busy: Mutex::new(HashSet::new()),
            write_delay: Duration::ZERO,
        })
    }

    /// A control plane that lives only as long as this value
    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            store: Mutex::new(Store::default()),
            busy: Mutex::new(HashSet::new()),
            write_delay: Duration::ZERO,
        }
    }

    /// Hold each write for `delay`, widening the window for overlaps
    #[cfg(test)]
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Store a resource as if it had been deployed elsewhere
    pub fn seed(&self, kind: &str, path: &str, document: Value) -> Result<()> {
        let mut store = lock(&self.store);
        store.resources.insert(
            path.to_string(),
            StoredResource {
                kind: kind.to_string(),
                document,
            },
        );
        self.persist(&store)
            .context("Could not save seeded resource")
    }

    fn persist(&self, store: &Store) -> std::result::Result<(), CloudError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let write = || -> std::io::Result<()> {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            let content = serde_json::to_string_pretty(store)?;
            fs::write(path, content)
        };
        write().map_err(|e| CloudError::Unknown {
            message: format!("could not save {}: {}", path.display(), e),
        })
    }

    fn acquire(&self, path: &str) -> std::result::Result<BusyGuard<'_>, CloudError> {
        let key = top_level(path);
        if !lock(&self.busy).insert(key.clone()) {
            return Err(CloudError::Conflict {
                path: path.to_string(),
                message: format!("another operation is in progress on {key}"),
            });
        }
        Ok(BusyGuard {
            busy: &self.busy,
            key,
        })
    }
}

/// Stable pseudo-random bytes for provider-computed values.
fn digest(seed: &str) -> blake3::Hash {
    blake3::hash(seed.as_bytes())
}

fn guid(seed: &str) -> String {
    let hex = digest(seed).to_hex();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// The desired document plus everything the provider adds.
fn stored_document(request: &ApplyRequest) -> Value {
    let mut doc = request.document.clone();
    let etag = digest(&request.document.to_string()).to_hex();
    doc["id"] = json!(request.path);
    doc["name"] = json!(request.name);
    doc["type"] = json!(request.kind);
    doc["etag"] = json!(format!("W/\"{}\"", &etag[..16]));
    doc["systemData"] = json!({ "lastModifiedAt": chrono::Utc::now().to_rfc3339() });

    let props = &mut doc["properties"];
    props["provisioningState"] = json!("Succeeded");
    match request.kind.as_str() {
        IDENTITIES => {
            props["principalId"] = json!(guid(&format!("principal:{}", request.path)));
            props["clientId"] = json!(guid(&format!("client:{}", request.path)));
        }
        PUBLIC_IPS => {
            let bytes = digest(&request.path);
            let b = bytes.as_bytes();
            props["ipAddress"] = json!(format!("20.{}.{}.{}", b[0], b[1], b[2].max(1)));
        }
        _ => {}
    }
    doc
}

impl CloudClient for LocalCloud {
    fn create_or_update(
        &self,
        request: &ApplyRequest,
    ) -> std::result::Result<ApplyResponse, CloudError> {
        if !request.document.is_object() || !request.document["properties"].is_object() {
            return Err(CloudError::ValidationRejected {
                path: request.path.clone(),
                message: "document must be an object with 'properties'".to_string(),
            });
        }

        let _guard = self.acquire(&request.path)?;
        if !self.write_delay.is_zero() {
            std::thread::sleep(self.write_delay);
        }

        let mut store = lock(&self.store);
        if let Some(parent) = &request.parent_path
            && !store.resources.contains_key(parent)
        {
            return Err(CloudError::NotFound {
                path: parent.clone(),
            });
        }

        let document = stored_document(request);
        let outcome = match store.resources.insert(
            request.path.clone(),
            StoredResource {
                kind: request.kind.clone(),
                document: document.clone(),
            },
        ) {
            Some(_) => WriteOutcome::Updated,
            None => WriteOutcome::Created,
        };
        self.persist(&store)?;
        log::debug!("{:?} {}", outcome, request.path);

        Ok(ApplyResponse {
            id: request.path.clone(),
            outcome,
            document,
        })
    }

    fn get(&self, kind: &str, path: &str) -> std::result::Result<Option<Value>, CloudError> {
        let store = lock(&self.store);
        Ok(store
            .resources
            .get(path)
            .filter(|r| r.kind == kind)
            .map(|r| r.document.clone()))
    }
}
