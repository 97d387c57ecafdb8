//! Dependency graph construction, validation and readiness queries

use indexmap::IndexMap;
use std::collections::{HashMap, VecDeque};

use crate::runtime::node::{DependencyCondition, NodeState, ServiceNode};

/// `to` may launch once `from` has reached `condition`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
    pub condition: DependencyCondition,
}

impl DependencyEdge {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        condition: DependencyCondition,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition,
        }
    }
}

/// Validated, acyclic set of nodes and edges
#[derive(Debug)]
pub struct DependencyGraph {
    /// Nodes in declaration order
    nodes: IndexMap<String, ServiceNode>,
    /// Edges grouped by the node that waits on them
    incoming: HashMap<String, Vec<DependencyEdge>>,
    /// Node -> nodes that wait on it
    outgoing: HashMap<String, Vec<String>>,
    /// Topological order, ties broken by declaration order
    order: Vec<String>,
}

impl DependencyGraph {
    /// Validate nodes and edges and compute a launch order
    pub fn build(nodes: Vec<ServiceNode>, edges: Vec<DependencyEdge>) -> Result<Self, ConfigError> {
        let mut by_id: IndexMap<String, ServiceNode> = IndexMap::new();
        for node in nodes {
            if by_id.contains_key(&node.id) {
                return Err(ConfigError::DuplicateNode(node.id));
            }
            if !node.probe.satisfies(node.required_condition) {
                return Err(ConfigError::ProbeMismatch {
                    node: node.id.clone(),
                    probe: node.probe.kind(),
                    condition: node.required_condition,
                });
            }
            by_id.insert(node.id.clone(), node);
        }

        let mut incoming: HashMap<String, Vec<DependencyEdge>> = HashMap::new();
        let mut outgoing: HashMap<String, Vec<String>> = HashMap::new();
        for id in by_id.keys() {
            incoming.insert(id.clone(), Vec::new());
            outgoing.insert(id.clone(), Vec::new());
        }

        for edge in edges {
            if !by_id.contains_key(&edge.to) {
                return Err(ConfigError::UnknownNode {
                    node: edge.to.clone(),
                    referenced_by: edge.from.clone(),
                });
            }
            let Some(source) = by_id.get(&edge.from) else {
                return Err(ConfigError::UnknownNode {
                    node: edge.from.clone(),
                    referenced_by: edge.to.clone(),
                });
            };
            if edge.from == edge.to {
                return Err(ConfigError::SelfDependency(edge.to));
            }
            if edge.condition == DependencyCondition::CompletedSuccessfully
                && source.required_condition != DependencyCondition::CompletedSuccessfully
            {
                return Err(ConfigError::ConditionMismatch {
                    node: edge.to.clone(),
                    dependency: edge.from.clone(),
                });
            }

            outgoing
                .entry(edge.from.clone())
                .or_default()
                .push(edge.to.clone());
            incoming.entry(edge.to.clone()).or_default().push(edge);
        }

        // A predicate may only read from a node it waits on, so the handle exists
        for (id, node) in &by_id {
            if let Some(source) = node.probe.source() {
                if !by_id.contains_key(source) {
                    return Err(ConfigError::UnknownNode {
                        node: source.to_string(),
                        referenced_by: id.clone(),
                    });
                }
                let waits_on_source = incoming[id].iter().any(|edge| edge.from == source);
                if source != id && !waits_on_source {
                    return Err(ConfigError::PredicateSource {
                        node: id.clone(),
                        source_node: source.to_string(),
                    });
                }
            }
        }

        let mut graph = Self {
            nodes: by_id,
            incoming,
            outgoing,
            order: Vec::new(),
        };

        if let Some(cycle) = graph.detect_cycle() {
            return Err(ConfigError::CycleDetected(cycle));
        }
        graph.order = graph.topological_sort();

        Ok(graph)
    }

    /// Depth-first search with white/grey/black marking.
    /// Returns the cycle as a path that starts and ends on the same node.
    fn detect_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Grey,
            Black,
        }

        fn visit<'a>(
            graph: &'a DependencyGraph,
            id: &'a str,
            marks: &mut HashMap<&'a str, Mark>,
            path: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            marks.insert(id, Mark::Grey);
            path.push(id);

            for next in &graph.outgoing[id] {
                match marks[next.as_str()] {
                    Mark::White => {
                        if let Some(cycle) = visit(graph, next, marks, path) {
                            return Some(cycle);
                        }
                    }
                    Mark::Grey => {
                        let start = path.iter().position(|n| *n == next.as_str())?;
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|n| n.to_string()).collect();
                        cycle.push(next.clone());
                        return Some(cycle);
                    }
                    Mark::Black => {}
                }
            }

            path.pop();
            marks.insert(id, Mark::Black);
            None
        }

        let mut marks: HashMap<&str, Mark> =
            self.nodes.keys().map(|id| (id.as_str(), Mark::White)).collect();
        let mut path = Vec::new();

        for id in self.nodes.keys() {
            if marks[id.as_str()] == Mark::White {
                if let Some(cycle) = visit(self, id, &mut marks, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Kahn's algorithm seeded in declaration order
    fn topological_sort(&self) -> Vec<String> {
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .keys()
            .map(|id| (id.as_str(), self.incoming[id].len()))
            .collect();

        let mut queue: VecDeque<&str> = self
            .nodes
            .keys()
            .map(String::as_str)
            .filter(|id| in_degree[id] == 0)
            .collect();

        let mut sorted = Vec::with_capacity(self.nodes.len());
        while let Some(id) = queue.pop_front() {
            sorted.push(id.to_string());
            for dependent in &self.outgoing[id] {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }
        sorted
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&ServiceNode> {
        self.nodes.get(id)
    }

    /// Nodes in topological order
    pub fn nodes(&self) -> impl Iterator<Item = &ServiceNode> {
        self.order.iter().map(move |id| &self.nodes[id])
    }

    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Edges `id` waits on
    pub fn dependencies(&self, id: &str) -> &[DependencyEdge] {
        self.incoming.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Nodes that wait directly on `id`
    pub fn dependents(&self, id: &str) -> &[String] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Whether the edge's source has reached the edge's condition
    pub fn is_satisfied(&self, edge: &DependencyEdge, states: &HashMap<String, NodeState>) -> bool {
        let Some(source) = self.nodes.get(&edge.from) else {
            return false;
        };
        states
            .get(&edge.from)
            .is_some_and(|state| state.satisfies(edge.condition, source.required_condition))
    }

    /// `NotStarted` nodes whose every incoming edge is satisfied, in
    /// topological order
    pub fn ready_to_launch(&self, states: &HashMap<String, NodeState>) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| matches!(states.get(*id), Some(NodeState::NotStarted)))
            .filter(|id| {
                self.dependencies(id)
                    .iter()
                    .all(|edge| self.is_satisfied(edge, states))
            })
            .cloned()
            .collect()
    }
}

/// Configuration errors; a run never starts when one is returned
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cyclic dependency detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    #[error("Node '{referenced_by}' references unknown node '{node}'")]
    UnknownNode { node: String, referenced_by: String },

    #[error("Node '{0}' is declared more than once")]
    DuplicateNode(String),

    #[error("Node '{0}' depends on itself")]
    SelfDependency(String),

    #[error("Node '{node}' waits for '{dependency}' to complete, but '{dependency}' is a long-running service")]
    ConditionMismatch { node: String, dependency: String },

    #[error("Node '{node}': a {probe} probe cannot establish condition '{condition}'")]
    ProbeMismatch {
        node: String,
        probe: &'static str,
        condition: DependencyCondition,
    },

    #[error("Node '{node}' reads from '{source_node}' without depending on it")]
    PredicateSource { node: String, source_node: String },

    #[error("Node '{node}' depends on disabled node '{dependency}'")]
    DisabledDependency { node: String, dependency: String },
}
