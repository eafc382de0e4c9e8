//! EventLog - append-only execution audit trail
//!
//! - Event: envelope with id + timestamp + kind
//! - EventKind: solver, node and workflow-step lifecycle
//! - EventLog: thread-safe, append-only log
//!
//! Tests assert ordering guarantees through this log rather than by
//! instrumenting handlers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock; // 2-3x faster than std::sync::RwLock
use serde::Serialize;
use serde_json::Value;

/// Single event in the execution log
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Monotonic sequence ID (for ordering)
    pub id: u64,
    /// Time since log creation (ms)
    pub timestamp_ms: u64,
    /// Event type and data
    pub kind: EventKind,
}

/// All event types
///
/// Uses Arc<str> for node/step keys to enable zero-cost cloning.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    // ═══════════════════════════════════════════
    // SOLVER LEVEL
    // ═══════════════════════════════════════════
    SolveStarted {
        request_count: usize,
        session_id: String,
    },
    SolveCompleted {
        success: bool,
        total_duration_ms: u64,
    },

    // ═══════════════════════════════════════════
    // NODE LEVEL
    // ═══════════════════════════════════════════
    NodeDispatched {
        node_key: Arc<str>,
        dependencies: Vec<Arc<str>>,
    },
    NodeCompleted {
        node_key: Arc<str>,
        success: bool,
        duration_ms: u64,
    },
    NodeAborted {
        node_key: Arc<str>,
        failed_dependency: Arc<str>,
    },
    StatusObserved {
        node_key: Arc<str>,
        state: String,
    },
    ProcessSkipped {
        node_key: Arc<str>,
    },

    // ═══════════════════════════════════════════
    // WORKFLOW LEVEL
    // ═══════════════════════════════════════════
    StepStarted {
        step_name: Arc<str>,
        number: usize,
    },
    StepCompleted {
        step_name: Arc<str>,
        outputs: Value,
        duration_ms: u64,
    },
    StepFailed {
        step_name: Arc<str>,
        error: String,
    },
    StepDropped {
        step_name: Arc<str>,
    },
    WorkflowCompleted {
        error_count: usize,
        total_duration_ms: u64,
    },
}

struct EventLogInner {
    events: RwLock<Vec<Event>>,
    next_id: AtomicU64,
    started: Instant,
}

/// Thread-safe, append-only event log
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EventLogInner {
                events: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(0),
                started: Instant::now(),
            }),
        }
    }

    /// Append an event; ids are monotonic across threads
    pub fn emit(&self, kind: EventKind) {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let timestamp_ms = self.inner.started.elapsed().as_millis() as u64;
        self.inner.events.write().push(Event {
            id,
            timestamp_ms,
            kind,
        });
    }

    /// Snapshot of all events so far
    pub fn events(&self) -> Vec<Event> {
        self.inner.events.read().clone()
    }

    /// Events whose node/step key matches
    pub fn filter_key(&self, key: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| event_key(&e.kind).is_some_and(|k| k.as_ref() == key))
            .collect()
    }

    /// Serialize the log to a JSON array
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self.events()).unwrap_or(Value::Null)
    }
}

fn event_key(kind: &EventKind) -> Option<&Arc<str>> {
    match kind {
        EventKind::NodeDispatched { node_key, .. }
        | EventKind::NodeCompleted { node_key, .. }
        | EventKind::NodeAborted { node_key, .. }
        | EventKind::StatusObserved { node_key, .. }
        | EventKind::ProcessSkipped { node_key } => Some(node_key),
        EventKind::StepStarted { step_name, .. }
        | EventKind::StepCompleted { step_name, .. }
        | EventKind::StepFailed { step_name, .. }
        | EventKind::StepDropped { step_name } => Some(step_name),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::intern;

    #[test]
    fn ids_are_monotonic() {
        let log = EventLog::new();
        for _ in 0..5 {
            log.emit(EventKind::ProcessSkipped {
                node_key: intern("build.api:process"),
            });
        }

        let ids: Vec<u64> = log.events().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn filter_key_matches_node_and_step_events() {
        let log = EventLog::new();
        log.emit(EventKind::NodeDispatched {
            node_key: intern("build.api:status"),
            dependencies: vec![],
        });
        log.emit(EventKind::StepStarted {
            step_name: intern("deploy-all"),
            number: 1,
        });
        log.emit(EventKind::NodeCompleted {
            node_key: intern("build.api:status"),
            success: true,
            duration_ms: 12,
        });

        assert_eq!(log.filter_key("build.api:status").len(), 2);
        assert_eq!(log.filter_key("deploy-all").len(), 1);
        assert_eq!(log.filter_key("missing").len(), 0);
    }

    #[test]
    fn to_json_has_tagged_kinds() {
        let log = EventLog::new();
        log.emit(EventKind::SolveStarted {
            request_count: 2,
            session_id: "s-1".into(),
        });

        let json = log.to_json();
        assert_eq!(json[0]["kind"]["type"], "solve_started");
        assert_eq!(json[0]["kind"]["request_count"], 2);
    }
}
