//! Template resolution contexts
//!
//! A context is a hierarchical name resolver with dotted-path lookup.
//! Contexts layer: lookups fall through to the next layer, and a miss
//! reports every branch attempted so template errors can name them.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;

/// Outcome of a context lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(Value),
    /// Not resolvable here; `attempted` names the branches tried
    NotFound { attempted: Vec<String> },
}

pub trait ConfigContext: Send + Sync {
    fn lookup(&self, path: &[String]) -> Lookup;
}

/// Context backed by a JSON tree, with dotted-path traversal.
///
/// A `label` names the branch in error messages (`"variables"`,
/// `"actions"`, ...).
pub struct MapContext {
    label: String,
    root: Value,
}

impl MapContext {
    pub fn new(label: impl Into<String>, root: Value) -> Self {
        Self {
            label: label.into(),
            root,
        }
    }

    /// Build from top-level branches: each (name, tree) pair becomes a
    /// root key.
    pub fn from_branches(label: impl Into<String>, branches: Vec<(&str, Value)>) -> Self {
        let mut map = serde_json::Map::new();
        for (name, tree) in branches {
            map.insert(name.to_string(), tree);
        }
        Self::new(label, Value::Object(map))
    }
}

impl ConfigContext for MapContext {
    fn lookup(&self, path: &[String]) -> Lookup {
        let mut current = &self.root;
        for segment in path {
            current = match current {
                Value::Object(map) => match map.get(segment.as_str()) {
                    Some(next) => next,
                    None => {
                        return Lookup::NotFound {
                            attempted: vec![self.label.clone()],
                        }
                    }
                },
                Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i))
                {
                    Some(next) => next,
                    None => {
                        return Lookup::NotFound {
                            attempted: vec![self.label.clone()],
                        }
                    }
                },
                _ => {
                    return Lookup::NotFound {
                        attempted: vec![self.label.clone()],
                    }
                }
            };
        }
        Lookup::Found(current.clone())
    }
}

/// Chains contexts; the first `Found` wins, misses accumulate attempts.
#[derive(Default, Clone)]
pub struct LayeredContext {
    layers: Vec<Arc<dyn ConfigContext>>,
}

impl LayeredContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, layer: Arc<dyn ConfigContext>) -> Self {
        self.layers.push(layer);
        self
    }
}

impl ConfigContext for LayeredContext {
    fn lookup(&self, path: &[String]) -> Lookup {
        let mut attempted = Vec::new();
        for layer in &self.layers {
            match layer.lookup(path) {
                Lookup::Found(value) => return Lookup::Found(value),
                Lookup::NotFound { attempted: more } => attempted.extend(more),
            }
        }
        if attempted.is_empty() {
            attempted.push("(empty context)".to_string());
        }
        Lookup::NotFound { attempted }
    }
}

/// Helper: assemble the `actions.<kind>.<name>.outputs.*` branch from
/// dependency outputs.
///
/// `entries` maps `(kind_key, name)` to an outputs object.
pub fn actions_branch(entries: &FxHashMap<(String, String), Value>) -> Value {
    let mut kinds: serde_json::Map<String, Value> = serde_json::Map::new();
    for ((kind, name), outputs) in entries {
        let kind_map = kinds
            .entry(kind.clone())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if let Value::Object(names) = kind_map {
            names.insert(
                name.clone(),
                serde_json::json!({ "outputs": outputs }),
            );
        }
    }
    Value::Object(kinds)
}
