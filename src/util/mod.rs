//! Shared utilities: constants, string interning, deep merge.

mod constants;

pub use constants::*;

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use serde_json::Value;

static INTERNER: OnceLock<DashMap<String, Arc<str>>> = OnceLock::new();

/// Intern a string into a shared `Arc<str>`
///
/// Node keys and action keys are cloned constantly across the solver;
/// interning keeps that O(1).
pub fn intern(s: &str) -> Arc<str> {
    let interner = INTERNER.get_or_init(DashMap::new);
    if let Some(existing) = interner.get(s) {
        return Arc::clone(existing.value());
    }
    let arc: Arc<str> = Arc::from(s);
    interner.insert(s.to_string(), Arc::clone(&arc));
    arc
}

/// Keyed async mutexes. Callers holding different keys proceed
/// concurrently; the same key serializes.
#[derive(Default)]
pub struct NamedLock {
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl NamedLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = Arc::clone(
            self.locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .value(),
        );
        lock.lock_owned().await
    }
}

/// Serde default for variable/spec trees: an empty object, not null
/// (a missing map must not wipe out merged-in values).
pub fn default_object() -> Value {
    Value::Object(Default::default())
}

/// Deep-merge `overlay` into `base`. Later (overlay) wins at each leaf;
/// maps merge recursively, everything else replaces.
pub fn merge_deep(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => merge_deep(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}
