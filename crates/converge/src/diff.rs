//! Diff computation - desired document vs live document
//!
//! The comparison is a structural subset check: every field the author
//! wrote must match the live document, while fields only the provider
//! writes (ids, etags, provisioning state) are ignored. Arrays compare by
//! position, because position encodes evaluation order for prioritized
//! rules; fields registered as unordered compare as sets.

use crate::node::ResourceNode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

/// What apply will do to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Create,
    Update,
    NoOp,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Create => write!(f, "create"),
            Action::Update => write!(f, "update"),
            Action::NoOp => write!(f, "no-op"),
        }
    }
}

/// A single differing field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    /// JSON pointer of the highest differing field
    pub pointer: String,
    pub desired: Value,
    /// `None` when the field is absent from the live document
    pub live: Option<Value>,
}

/// Comparison settings for one resource.
#[derive(Debug, Clone, Default)]
pub struct Comparison {
    unordered: BTreeSet<String>,
}

impl Comparison {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare the array at `pointer` as a set.
    pub fn unordered(mut self, pointer: impl Into<String>) -> Self {
        self.unordered.insert(pointer.into());
        self
    }

    /// Settings declared on the node itself.
    pub fn for_node(node: &ResourceNode) -> Self {
        Self {
            unordered: node.unordered_fields().iter().cloned().collect(),
        }
    }

    pub fn diff(&self, desired: &Value, live: &Value) -> Vec<FieldChange> {
        let mut changes = Vec::new();
        self.walk(String::new(), desired, Some(live), &mut changes);
        changes
    }

    pub fn needs_update(&self, desired: &Value, live: &Value) -> bool {
        !self.diff(desired, live).is_empty()
    }

    fn walk(&self, pointer: String, desired: &Value, live: Option<&Value>, out: &mut Vec<FieldChange>) {
        let change = |pointer: String| FieldChange {
            pointer,
            desired: desired.clone(),
            live: live.cloned(),
        };

        match (desired, live) {
            (Value::Null, None | Some(Value::Null)) => {}
            (_, None) => out.push(change(pointer)),
            (Value::Object(want), Some(Value::Object(have))) => {
                for (key, value) in want {
                    let child = format!("{}/{}", pointer, escape(key));
                    self.walk(child, value, have.get(key), out);
                }
            }
            (Value::Array(want), Some(Value::Array(have))) => {
                if self.unordered.contains(&pointer) {
                    if !same_set(want, have) {
                        out.push(change(pointer));
                    }
                } else if want.len() != have.len() {
                    out.push(change(pointer));
                } else {
                    for (i, (w, h)) in want.iter().zip(have).enumerate() {
                        self.walk(format!("{pointer}/{i}"), w, Some(h), out);
                    }
                }
            }
            (Value::Number(a), Some(Value::Number(b))) => {
                let equal = match (a.as_i64(), b.as_i64()) {
                    (Some(x), Some(y)) => x == y,
                    _ => a.as_f64() == b.as_f64(),
                };
                if !equal {
                    out.push(change(pointer));
                }
            }
            (want, Some(have)) => {
                if want != have {
                    out.push(change(pointer));
                }
            }
        }
    }
}

fn same_set(a: &[Value], b: &[Value]) -> bool {
    let a: BTreeSet<String> = a.iter().map(Value::to_string).collect();
    let b: BTreeSet<String> = b.iter().map(Value::to_string).collect();
    a == b
}

fn escape(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

/// Whether `live` differs from `desired` in any field `desired` declares.
pub fn needs_update(desired: &Value, live: &Value) -> bool {
    Comparison::new().needs_update(desired, live)
}

/// Differing fields between `desired` and `live`.
pub fn diff_documents(desired: &Value, live: &Value) -> Vec<FieldChange> {
    Comparison::new().diff(desired, live)
}

/// Decide the action for a resource given its live document (if any).
pub fn classify(desired: &Value, live: Option<&Value>, comparison: &Comparison) -> Action {
    match live {
        None => Action::Create,
        Some(live) if comparison.needs_update(desired, live) => Action::Update,
        Some(_) => Action::NoOp,
    }
}
