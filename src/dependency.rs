//! Declared dependency graph over content ids and staleness propagation.
//!
//! The graph maps a content id to the ids that depend on it. It is loaded
//! once per deployment and validated for acyclicity at load time; a cycle is
//! a startup failure, never a per-request condition.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::state::ProposalState;

#[derive(Debug, Error)]
pub enum DependencyGraphError {
    #[error("dependency cycle detected involving: {nodes:?}")]
    CycleDetected { nodes: Vec<String> },

    #[error("dependency edge references undeclared node '{node}' (dependent of '{of}')")]
    UnknownNode { node: String, of: String },
}

/// A fixed, declared mapping from content id to the ids that depend on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyGraph {
    dependents: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Build and validate a graph from a declared dependents map. Every id
    /// appearing as a dependent must also be declared as a key (possibly with
    /// an empty list), and the graph must be acyclic.
    pub fn new(dependents: HashMap<String, Vec<String>>) -> Result<Self, DependencyGraphError> {
        let graph = Self { dependents };
        graph.validate()?;
        info!(nodes = graph.dependents.len(), "Dependency graph loaded");
        Ok(graph)
    }

    /// The default proposal graph: research feeds the solution, the solution
    /// feeds the summary and plan, and the plan feeds the budget narrative.
    pub fn default_proposal_graph() -> Self {
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        dependents.insert("research".into(), vec!["solution".into()]);
        dependents.insert(
            "solution".into(),
            vec!["executive_summary".into(), "implementation_plan".into()],
        );
        dependents.insert("connections".into(), vec!["executive_summary".into()]);
        dependents.insert(
            "problem_statement".into(),
            vec!["executive_summary".into()],
        );
        dependents.insert(
            "implementation_plan".into(),
            vec!["budget_narrative".into()],
        );
        dependents.insert("executive_summary".into(), vec![]);
        dependents.insert("budget_narrative".into(), vec![]);

        // Cannot cycle by construction.
        Self::new(dependents).expect("default proposal graph is acyclic")
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.dependents.keys().map(String::as_str)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.dependents.contains_key(id)
    }

    /// Kahn's topological sort. Returns the node order on success; leftover
    /// nodes after the queue drains are part of a cycle.
    pub fn validate(&self) -> Result<Vec<String>, DependencyGraphError> {
        for (of, deps) in &self.dependents {
            for node in deps {
                if !self.dependents.contains_key(node) {
                    return Err(DependencyGraphError::UnknownNode {
                        node: node.clone(),
                        of: of.clone(),
                    });
                }
            }
        }

        let mut in_degree: HashMap<&str, usize> =
            self.dependents.keys().map(|k| (k.as_str(), 0)).collect();
        for deps in self.dependents.values() {
            for node in deps {
                *in_degree.get_mut(node.as_str()).expect("validated above") += 1;
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.dependents.len());

        while let Some(id) = queue.pop_front() {
            order.push(id.to_string());
            for node in &self.dependents[id] {
                let degree = in_degree.get_mut(node.as_str()).expect("validated above");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(node.as_str());
                }
            }
        }

        if order.len() != self.dependents.len() {
            let mut nodes: Vec<String> = in_degree
                .into_iter()
                .filter(|(_, degree)| *degree > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            nodes.sort();
            return Err(DependencyGraphError::CycleDetected { nodes });
        }

        Ok(order)
    }

    /// Transitive closure of dependents of `edited`, excluding `edited`
    /// itself. BFS with a visited set so traversal terminates even on a
    /// malformed cyclic graph.
    pub fn dependents_of(&self, edited: &str) -> Vec<String> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = self
            .dependents
            .get(edited)
            .map(|deps| deps.iter().map(String::as_str).collect())
            .unwrap_or_default();
        let mut closure = Vec::new();

        while let Some(id) = queue.pop_front() {
            if id == edited || !visited.insert(id) {
                continue;
            }
            closure.push(id.to_string());
            if let Some(deps) = self.dependents.get(id) {
                queue.extend(deps.iter().map(String::as_str));
            }
        }

        closure
    }

    /// Mark every transitive dependent of `edited` stale in `state`. Touches
    /// only statuses; Queued and already-Stale dependents are no-ops, so the
    /// operation is idempotent. Returns the ids actually marked.
    pub fn propagate_stale(&self, state: &mut ProposalState, edited: &str) -> Vec<String> {
        let mut marked = Vec::new();
        for id in self.dependents_of(edited) {
            if state.force_stale(&id) {
                marked.push(id);
            }
        }
        debug!(
            edited = %edited,
            marked = ?marked,
            "Propagated staleness to dependents"
        );
        marked
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::default_proposal_graph()
    }
}
