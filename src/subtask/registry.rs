//! Explicit stage registry.

use super::SubTaskMeta;
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

/// Registry and ordering errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Two stages share a name
    #[error("subtask {0} is already registered")]
    Duplicate(String),

    /// A selection named a stage that does not exist
    #[error("unknown subtask: {0}")]
    UnknownSubTask(String),

    /// Stages depend on each other's products in a loop
    #[error("dependency cycle among subtasks: {}", .0.join(", "))]
    Cycle(Vec<String>),

    /// A stage state change that the state machine forbids
    #[error("stage {stage}: illegal transition {from} -> {to}")]
    IllegalTransition {
        /// Stage name
        stage: String,
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },
}

/// Stages known to this process, in registration order.
#[derive(Debug, Default, Clone)]
pub struct SubTaskRegistry {
    stages: Vec<SubTaskMeta>,
}

impl SubTaskRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stage. Names must be unique.
    pub fn register(&mut self, meta: SubTaskMeta) -> Result<(), RegistryError> {
        if self.get(meta.name).is_some() {
            return Err(RegistryError::Duplicate(meta.name.to_string()));
        }
        debug!(subtask = meta.name, "Registered subtask");
        self.stages.push(meta);
        Ok(())
    }

    /// Look up a stage by name
    pub fn get(&self, name: &str) -> Option<&SubTaskMeta> {
        self.stages.iter().find(|meta| meta.name == name)
    }

    /// Stages in registration order
    pub fn iter(&self) -> impl Iterator<Item = &SubTaskMeta> {
        self.stages.iter()
    }

    /// Number of registered stages
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Names of the stages that should run.
    ///
    /// With an explicit selection every name must exist and only those run;
    /// otherwise stages enabled by default run.
    pub fn enabled(&self, selection: Option<&[String]>) -> Result<HashSet<&'static str>, RegistryError> {
        match selection {
            None => Ok(self
                .stages
                .iter()
                .filter(|meta| meta.enabled_by_default)
                .map(|meta| meta.name)
                .collect()),
            Some(names) => names
                .iter()
                .map(|name| {
                    self.get(name.trim())
                        .map(|meta| meta.name)
                        .ok_or_else(|| RegistryError::UnknownSubTask(name.clone()))
                })
                .collect(),
        }
    }

    /// Stages in an order where every producer precedes its consumers.
    ///
    /// Kahn's algorithm over "reads a table the other writes" edges; among
    /// ready stages the earliest registered goes first.
    pub fn execution_order(&self) -> Result<Vec<&SubTaskMeta>, RegistryError> {
        let n = self.stages.len();
        let mut indegree = vec![0usize; n];
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (consumer, meta) in self.stages.iter().enumerate() {
            for (producer, other) in self.stages.iter().enumerate() {
                if producer != consumer && meta.depends_on(other) {
                    edges[producer].push(consumer);
                    indegree[consumer] += 1;
                }
            }
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|i| indegree[*i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(next) = ready.pop_first() {
            order.push(&self.stages[next]);
            for &consumer in &edges[next] {
                indegree[consumer] -= 1;
                if indegree[consumer] == 0 {
                    ready.insert(consumer);
                }
            }
        }

        if order.len() != n {
            let stuck = (0..n)
                .filter(|i| indegree[*i] > 0)
                .map(|i| self.stages[i].name.to_string())
                .collect();
            return Err(RegistryError::Cycle(stuck));
        }
        Ok(order)
    }
}
