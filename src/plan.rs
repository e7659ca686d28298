//! Migration plan construction and validation.
//!
//! A platform adapter (external to this crate) describes the work as a flat
//! list of step specs with dependency hints; `PlanBuilder` turns that into a
//! validated `StepGraph`. Building is a pure transformation — no I/O — and
//! either yields a complete DAG or fails with `PlanValidation`.

use crate::errors::EngineError;
use crate::operation::{HostDescription, Operation};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Index into the plan's step list.
pub type StepIndex = usize;

/// A step as declared by a platform adapter, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Unique id within the plan (e.g. "db-export", "copy-uploads").
    pub id: String,
    /// The operation this step performs.
    pub operation: Operation,
    /// Ids of steps that must succeed first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Reverse operation replayed during rollback, when the step is
    /// reversible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensating_action: Option<Operation>,
}

impl StepSpec {
    pub fn new(id: impl Into<String>, operation: Operation) -> Self {
        Self {
            id: id.into(),
            operation,
            depends_on: Vec::new(),
            compensating_action: None,
        }
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_compensation(mut self, action: Operation) -> Self {
        self.compensating_action = Some(action);
        self
    }
}

/// Produces the step list for a source/destination pair. Implemented
/// per-platform outside this crate; the scheduler never branches on
/// platform identity.
pub trait PlatformAdapter: Send + Sync {
    /// Adapter name, for logging.
    fn name(&self) -> &str;

    /// Build the ordered, annotated step list for this migration.
    fn build_steps(
        &self,
        source: &HostDescription,
        destination: &HostDescription,
    ) -> Result<Vec<StepSpec>, EngineError>;
}

/// An immutable, validated DAG of migration steps.
#[derive(Debug, Clone)]
pub struct StepGraph {
    steps: Vec<StepSpec>,
    index_map: HashMap<String, StepIndex>,
    /// index -> steps that depend on it
    dependents: Vec<Vec<StepIndex>>,
    /// index -> steps it depends on
    dependencies: Vec<Vec<StepIndex>>,
}

impl StepGraph {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[StepSpec] {
        &self.steps
    }

    pub fn get(&self, index: StepIndex) -> Option<&StepSpec> {
        self.steps.get(index)
    }

    pub fn index_of(&self, id: &str) -> Option<StepIndex> {
        self.index_map.get(id).copied()
    }

    /// Steps that depend on the given step.
    pub fn dependents(&self, index: StepIndex) -> &[StepIndex] {
        self.dependents.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Steps the given step depends on.
    pub fn dependencies(&self, index: StepIndex) -> &[StepIndex] {
        self.dependencies.get(index).map_or(&[], |v| v.as_slice())
    }

    /// True when every dependency of `index` is in `succeeded`.
    pub fn dependencies_satisfied(
        &self,
        index: StepIndex,
        succeeded: &HashSet<StepIndex>,
    ) -> bool {
        self.dependencies(index)
            .iter()
            .all(|dep| succeeded.contains(dep))
    }

    /// All transitive dependents of `index`, excluding `index` itself.
    pub fn transitive_dependents(&self, index: StepIndex) -> Vec<StepIndex> {
        let mut seen = HashSet::new();
        let mut stack = vec![index];
        while let Some(current) = stack.pop() {
            for &dep in self.dependents(current) {
                if seen.insert(dep) {
                    stack.push(dep);
                }
            }
        }
        let mut out: Vec<_> = seen.into_iter().collect();
        out.sort_unstable();
        out
    }
}

/// Validating builder for `StepGraph`.
pub struct PlanBuilder {
    steps: Vec<StepSpec>,
}

impl PlanBuilder {
    pub fn new(steps: Vec<StepSpec>) -> Self {
        Self { steps }
    }

    /// Ask the adapter for the steps and build a validated graph.
    pub fn from_adapter(
        adapter: &dyn PlatformAdapter,
        source: &HostDescription,
        destination: &HostDescription,
    ) -> Result<StepGraph, EngineError> {
        tracing::debug!(adapter = adapter.name(), "building migration plan");
        Self::new(adapter.build_steps(source, destination)?).build()
    }

    /// Validate and build. Fails on an empty plan, duplicate ids, unknown
    /// dependency ids, or cyclic dependencies; no partial graph is returned.
    pub fn build(self) -> Result<StepGraph, EngineError> {
        if self.steps.is_empty() {
            return Err(EngineError::PlanValidation("plan has no steps".into()));
        }

        let mut index_map = HashMap::new();
        for (i, step) in self.steps.iter().enumerate() {
            if index_map.insert(step.id.clone(), i).is_some() {
                return Err(EngineError::PlanValidation(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }

        let mut dependents: Vec<Vec<StepIndex>> = vec![Vec::new(); self.steps.len()];
        let mut dependencies: Vec<Vec<StepIndex>> = vec![Vec::new(); self.steps.len()];

        for (to_idx, step) in self.steps.iter().enumerate() {
            for dep in &step.depends_on {
                let from_idx = *index_map.get(dep).ok_or_else(|| {
                    EngineError::PlanValidation(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    ))
                })?;
                dependents[from_idx].push(to_idx);
                dependencies[to_idx].push(from_idx);
            }
        }

        let graph = StepGraph {
            steps: self.steps,
            index_map,
            dependents,
            dependencies,
        };

        Self::check_acyclic(&graph)?;
        Ok(graph)
    }

    /// Kahn's algorithm; anything left with a positive in-degree is on a
    /// cycle.
    fn check_acyclic(graph: &StepGraph) -> Result<(), EngineError> {
        let mut in_degree: Vec<usize> =
            graph.dependencies.iter().map(|deps| deps.len()).collect();

        let mut queue: Vec<StepIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;
        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in graph.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != graph.len() {
            let on_cycle: Vec<&str> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .filter_map(|(i, _)| graph.get(i).map(|s| s.id.as_str()))
                .collect();
            return Err(EngineError::PlanValidation(format!(
                "cycle detected in step dependencies: {on_cycle:?}"
            )));
        }

        Ok(())
    }
}
