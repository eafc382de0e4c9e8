//! Action graph
//!
//! Typed, acyclic directed graph of actions with explicit and inferred
//! dependency edges. Edges carry flags deciding whether the dependency
//! needs mere resolution (static outputs) or full execution.
//!
//! Cycle detection uses the standard three-color DFS; the error carries
//! the full cycle path.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::error::{Result, TrellisError};
use crate::provider::ProviderRouter;
use crate::template::find_references;

use super::registry::ActionRegistry;
use super::{ActionDependency, ActionKind, ActionRef};

/// Stack-allocated edge list: most actions have 0-4 dependencies
pub type EdgeVec = SmallVec<[ActionDependency; 4]>;

#[derive(Debug)]
pub struct ActionGraph {
    registry: Arc<ActionRegistry>,
    /// from key -> edges (deduplicated, strongest flags win)
    edges: FxHashMap<String, EdgeVec>,
}

impl ActionGraph {
    /// Build the graph from the registry, inferring template-reference
    /// dependencies with the router's static-outputs knowledge.
    pub fn build(registry: Arc<ActionRegistry>, router: &ProviderRouter) -> Result<Self> {
        let mut edges: FxHashMap<String, EdgeVec> = FxHashMap::default();

        for action in registry.actions() {
            let from_key = action.key();
            let mut outgoing: FxHashMap<String, ActionDependency> = FxHashMap::default();

            // Explicit dependencies
            for dep_ref in action.dependency_refs()? {
                registry.get_by_key(&dep_ref.key(), &from_key)?;
                add_edge(&mut outgoing, ActionDependency::explicit(dep_ref));
            }

            // Build dependencies on runtime kinds
            if action.kind.is_runtime() {
                for build_name in [action.build.as_ref(), action.copy_from.as_ref()]
                    .into_iter()
                    .flatten()
                {
                    let dep_ref = ActionRef::new(ActionKind::Build, build_name.clone());
                    registry.get_by_key(&dep_ref.key(), &from_key)?;
                    add_edge(&mut outgoing, ActionDependency::explicit(dep_ref));
                }
            }

            // Template-reference dependencies from spec, variables, varfiles
            let varfile_values: Vec<serde_json::Value> = action
                .varfiles
                .iter()
                .map(|p| serde_json::Value::String(p.to_string()))
                .collect();
            let mut scan_targets = vec![&action.spec, &action.variables];
            scan_targets.extend(varfile_values.iter());

            for target in scan_targets {
                for reference in find_references(target) {
                    let Some(dependency) = output_reference(&reference) else {
                        continue;
                    };
                    let dep_config = registry.get_by_key(&dependency.0.key(), &from_key)?;
                    let edge = if router
                        .is_static_output(&dep_config.type_name, &dependency.1)
                    {
                        ActionDependency::static_outputs(dependency.0)
                    } else {
                        ActionDependency::executed_outputs(dependency.0)
                    };
                    add_edge(&mut outgoing, edge);
                }
            }

            // Self-references are config errors, caught by validate() as
            // a one-node cycle.
            edges.insert(from_key, outgoing.into_values().collect());
        }

        Ok(Self { registry, edges })
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn dependencies_of(&self, key: &str) -> &[ActionDependency] {
        static EMPTY: &[ActionDependency] = &[];
        self.edges.get(key).map_or(EMPTY, |edges| edges.as_slice())
    }

    /// Reject cycles; the error reports the full cycle path.
    pub fn validate(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut colors: FxHashMap<&str, Color> =
            self.edges.keys().map(|k| (k.as_str(), Color::White)).collect();
        let mut stack: Vec<&str> = Vec::new();

        fn dfs<'a>(
            node: &'a str,
            edges: &'a FxHashMap<String, EdgeVec>,
            colors: &mut FxHashMap<&'a str, Color>,
            stack: &mut Vec<&'a str>,
        ) -> std::result::Result<(), String> {
            colors.insert(node, Color::Gray);
            stack.push(node);

            if let Some(outgoing) = edges.get(node) {
                for edge in outgoing {
                    let target = edge.to.key();
                    let Some((target_key, _)) = edges.get_key_value(&target) else {
                        continue;
                    };
                    match colors.get(target_key.as_str()) {
                        Some(Color::Gray) => {
                            let cycle_start = stack
                                .iter()
                                .position(|entry| *entry == target_key.as_str())
                                .unwrap_or(0);
                            let mut cycle: Vec<&str> = stack[cycle_start..].to_vec();
                            cycle.push(target_key.as_str());
                            return Err(cycle.join(" → "));
                        }
                        Some(Color::White) | None => {
                            dfs(target_key.as_str(), edges, colors, stack)?;
                        }
                        Some(Color::Black) => {}
                    }
                }
            }

            stack.pop();
            colors.insert(node, Color::Black);
            Ok(())
        }

        let keys: Vec<&str> = self.edges.keys().map(String::as_str).collect();
        for key in keys {
            if colors.get(key) == Some(&Color::White) {
                if let Err(cycle) = dfs(key, &self.edges, &mut colors, &mut stack) {
                    return Err(TrellisError::CycleDetected { cycle });
                }
            }
        }

        Ok(())
    }
}

fn add_edge(outgoing: &mut FxHashMap<String, ActionDependency>, edge: ActionDependency) {
    match outgoing.get_mut(&edge.to.key()) {
        Some(existing) => existing.absorb(&edge),
        None => {
            outgoing.insert(edge.to.key(), edge);
        }
    }
}

/// Interpret a template reference path as an action output reference:
/// `actions.<kind>.<name>.outputs.<key>` -> (ref, output key)
fn output_reference(path: &[String]) -> Option<(ActionRef, String)> {
    if path.len() < 5 || path[0] != "actions" || path[3] != "outputs" {
        return None;
    }
    let kind = ActionKind::parse(&path[1])?;
    Some((ActionRef::new(kind, path[2].clone()), path[4].clone()))
}
