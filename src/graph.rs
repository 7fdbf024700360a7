//! Immutable graph model: nodes, edges, and build-time validation

use crate::action::{Action, SensorPredicate};
use crate::error::{DagRunError, Result};
use crate::models::{NodeKind, NodeSpec, PollPolicy, RetryPolicy, TriggerRule};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Work attached to a node, by kind
pub(crate) enum NodeWork {
    Action(Arc<dyn Action>),
    Sensor(Arc<dyn SensorPredicate>),
}

/// A unit of work in the graph, immutable once built
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    pub trigger_rule: TriggerRule,
    pub retry: RetryPolicy,
    pub poll: Option<PollPolicy>,
    pub(crate) work: NodeWork,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("trigger_rule", &self.trigger_rule)
            .field("retry", &self.retry)
            .field("poll", &self.poll)
            .finish()
    }
}

impl Node {
    /// Plain node running the given action
    pub fn plain(id: impl Into<String>, action: Arc<dyn Action>) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Plain,
            trigger_rule: TriggerRule::default(),
            retry: RetryPolicy::default(),
            poll: None,
            work: NodeWork::Action(action),
        }
    }

    /// Branch node: its action must return the successor ids to activate
    pub fn branch(id: impl Into<String>, action: Arc<dyn Action>) -> Self {
        Self {
            kind: NodeKind::Branch,
            ..Self::plain(id, action)
        }
    }

    /// Sensor node polling the given predicate under `poll`
    pub fn sensor(
        id: impl Into<String>,
        predicate: Arc<dyn SensorPredicate>,
        poll: PollPolicy,
    ) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Sensor,
            trigger_rule: TriggerRule::default(),
            retry: RetryPolicy::default(),
            poll: Some(poll),
            work: NodeWork::Sensor(predicate),
        }
    }

    /// Bind a parsed descriptor to an action (plain and branch kinds)
    pub fn from_spec(spec: &NodeSpec, action: Arc<dyn Action>) -> Result<Self> {
        let mut node = match spec.kind {
            NodeKind::Plain => Self::plain(spec.id.clone(), action),
            NodeKind::Branch => Self::branch(spec.id.clone(), action),
            NodeKind::Sensor => {
                return Err(DagRunError::MissingPollPolicy(spec.id.clone()));
            }
        };
        node.trigger_rule = spec.trigger_rule;
        node.retry = spec.retry_policy();
        Ok(node)
    }

    /// Bind a parsed sensor descriptor to a predicate
    pub fn sensor_from_spec(
        spec: &NodeSpec,
        predicate: Arc<dyn SensorPredicate>,
    ) -> Result<Self> {
        let poll = spec
            .poll_policy()
            .ok_or_else(|| DagRunError::MissingPollPolicy(spec.id.clone()))?;
        let mut node = Self::sensor(spec.id.clone(), predicate, poll);
        node.trigger_rule = spec.trigger_rule;
        node.retry = spec.retry_policy();
        Ok(node)
    }

    pub fn with_trigger_rule(mut self, rule: TriggerRule) -> Self {
        self.trigger_rule = rule;
        self
    }

    /// Allow `retries` extra attempts after the first failure
    pub fn with_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.retry = RetryPolicy {
            max_attempts: retries + 1,
            delay,
        };
        self
    }
}

/// Collects node and edge declarations before a single immutable `build()`
#[derive(Default)]
pub struct GraphBuilder {
    name: String,
    nodes: Vec<Node>,
    edges: Vec<(String, String)>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Declare an edge from `upstream` to `downstream`
    pub fn edge(mut self, upstream: impl Into<String>, downstream: impl Into<String>) -> Self {
        self.edges.push((upstream.into(), downstream.into()));
        self
    }

    /// Validate and freeze the graph.
    ///
    /// Checks duplicate ids, edge endpoints, self-loops and acyclicity;
    /// a cycle is reported with the offending path.
    pub fn build(self) -> Result<Graph> {
        let mut graph = DiGraph::new();
        let mut indices: HashMap<String, NodeIndex> = HashMap::new();
        let mut nodes: HashMap<String, Arc<Node>> = HashMap::new();

        for node in self.nodes {
            if indices.contains_key(&node.id) {
                return Err(DagRunError::DuplicateNode(node.id));
            }
            let index = graph.add_node(node.id.clone());
            indices.insert(node.id.clone(), index);
            nodes.insert(node.id.clone(), Arc::new(node));
        }

        for (upstream, downstream) in &self.edges {
            if upstream == downstream {
                return Err(DagRunError::SelfLoop(upstream.clone()));
            }
            let up = *indices
                .get(upstream)
                .ok_or_else(|| DagRunError::UnknownNode(upstream.clone()))?;
            let down = *indices
                .get(downstream)
                .ok_or_else(|| DagRunError::UnknownNode(downstream.clone()))?;
            graph.add_edge(up, down, ());
        }

        let built = Graph {
            name: self.name,
            graph,
            indices,
            nodes,
        };
        built.validate_acyclic()?;
        Ok(built)
    }
}

/// Immutable graph definition, safely shared across runs
pub struct Graph {
    name: String,
    graph: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
    nodes: HashMap<String, Arc<Node>>,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("nodes", &self.graph.node_count())
            .field("edges", &self.graph.edge_count())
            .finish()
    }
}

impl Graph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &str) -> Option<&Arc<Node>> {
        self.nodes.get(id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Direct upstream nodes of `id`
    pub fn predecessors(&self, id: &str) -> Vec<String> {
        self.neighbors(id, petgraph::Direction::Incoming)
    }

    /// Direct downstream nodes of `id`
    pub fn successors(&self, id: &str) -> Vec<String> {
        self.neighbors(id, petgraph::Direction::Outgoing)
    }

    /// Nodes with no predecessors, sorted for deterministic seeding
    pub fn roots(&self) -> Vec<String> {
        let mut roots: Vec<String> = self
            .graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, petgraph::Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|idx| self.graph[idx].clone())
            .collect();
        roots.sort();
        roots
    }

    fn neighbors(&self, id: &str, direction: petgraph::Direction) -> Vec<String> {
        if let Some(&index) = self.indices.get(id) {
            let mut out: Vec<String> = self
                .graph
                .neighbors_directed(index, direction)
                .map(|idx| self.graph[idx].clone())
                .collect();
            out.sort();
            out
        } else {
            Vec::new()
        }
    }

    fn validate_acyclic(&self) -> Result<()> {
        if is_cyclic_directed(&self.graph) {
            return Err(DagRunError::Cycle {
                path: self.find_cycle(),
            });
        }
        Ok(())
    }

    /// Find one cycle for error reporting
    fn find_cycle(&self) -> String {
        let mut visited = HashMap::new();
        let mut path = Vec::new();

        for node in self.graph.node_indices() {
            if !visited.contains_key(&node) {
                if let Some(cycle) = self.dfs_find_cycle(node, &mut visited, &mut path) {
                    return cycle;
                }
            }
        }

        "unknown cycle".to_string()
    }

    fn dfs_find_cycle(
        &self,
        node: NodeIndex,
        visited: &mut HashMap<NodeIndex, bool>,
        path: &mut Vec<String>,
    ) -> Option<String> {
        if let Some(&in_path) = visited.get(&node) {
            if in_path {
                path.push(self.graph[node].clone());
                return Some(path.join(" -> "));
            }
            return None;
        }

        visited.insert(node, true);
        path.push(self.graph[node].clone());

        for neighbor in self.graph.neighbors(node) {
            if let Some(cycle) = self.dfs_find_cycle(neighbor, visited, path) {
                return Some(cycle);
            }
        }

        path.pop();
        visited.insert(node, false);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Context, FnAction, FnSensor};
    use crate::models::ActionOutput;

    fn noop() -> Arc<dyn Action> {
        Arc::new(FnAction::new(|_: &Context| Ok(ActionOutput::none())))
    }

    fn test_node(id: &str) -> Node {
        Node::plain(id, noop())
    }

    fn test_poll() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_linear_graph() {
        let graph = GraphBuilder::new("linear")
            .node(test_node("a"))
            .node(test_node("b"))
            .node(test_node("c"))
            .edge("a", "b")
            .edge("b", "c")
            .build()
            .unwrap();

        assert_eq!(graph.len(), 3);
        assert_eq!(graph.roots(), vec!["a"]);
        assert_eq!(graph.predecessors("b"), vec!["a"]);
        assert_eq!(graph.successors("b"), vec!["c"]);
        assert!(graph.predecessors("a").is_empty());
        assert!(graph.successors("c").is_empty());
    }

    #[test]
    fn test_diamond_graph() {
        let graph = GraphBuilder::new("diamond")
            .node(test_node("a"))
            .node(test_node("b"))
            .node(test_node("c"))
            .node(test_node("d"))
            .edge("a", "b")
            .edge("a", "c")
            .edge("b", "d")
            .edge("c", "d")
            .build()
            .unwrap();

        assert_eq!(graph.roots(), vec!["a"]);
        assert_eq!(graph.successors("a"), vec!["b", "c"]);
        assert_eq!(graph.predecessors("d"), vec!["b", "c"]);
    }

    #[test]
    fn test_disconnected_roots() {
        let graph = GraphBuilder::new("forest")
            .node(test_node("x"))
            .node(test_node("y"))
            .node(test_node("z"))
            .edge("x", "z")
            .build()
            .unwrap();

        assert_eq!(graph.roots(), vec!["x", "y"]);
    }

    #[test]
    fn test_cycle_rejected_with_path() {
        let result = GraphBuilder::new("cyclic")
            .node(test_node("a"))
            .node(test_node("b"))
            .node(test_node("c"))
            .edge("a", "b")
            .edge("b", "c")
            .edge("c", "a")
            .build();

        match result {
            Err(DagRunError::Cycle { path }) => {
                // The reported path names at least one node on the cycle.
                assert!(
                    path.contains('a') || path.contains('b') || path.contains('c'),
                    "unexpected cycle path: {}",
                    path
                );
                assert!(path.contains("->"));
            }
            other => panic!("expected Cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_self_loop_rejected() {
        let result = GraphBuilder::new("loop")
            .node(test_node("a"))
            .edge("a", "a")
            .build();

        assert!(matches!(result, Err(DagRunError::SelfLoop(id)) if id == "a"));
    }

    #[test]
    fn test_unknown_edge_endpoint_rejected() {
        let result = GraphBuilder::new("dangling")
            .node(test_node("a"))
            .edge("a", "ghost")
            .build();

        assert!(matches!(result, Err(DagRunError::UnknownNode(id)) if id == "ghost"));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let result = GraphBuilder::new("dupe")
            .node(test_node("a"))
            .node(test_node("a"))
            .build();

        assert!(matches!(result, Err(DagRunError::DuplicateNode(id)) if id == "a"));
    }

    #[test]
    fn test_sensor_node_carries_poll_policy() {
        let predicate = Arc::new(FnSensor::new(|_: &Context| Ok(true)));
        let node = Node::sensor("wait_for_rows", predicate, test_poll());

        assert_eq!(node.kind, NodeKind::Sensor);
        assert_eq!(node.poll.unwrap().interval, Duration::from_millis(100));
    }

    #[test]
    fn test_node_from_spec_rejects_sensor_kind() {
        let spec = NodeSpec {
            id: "s".to_string(),
            kind: NodeKind::Sensor,
            trigger_rule: TriggerRule::AllSuccess,
            retries: 0,
            retry_delay_ms: 1_000,
            poll_interval_ms: None,
            poll_timeout_ms: None,
        };

        assert!(matches!(
            Node::from_spec(&spec, noop()),
            Err(DagRunError::MissingPollPolicy(_))
        ));
    }

    #[test]
    fn test_sensor_from_spec_requires_poll_fields() {
        let spec = NodeSpec {
            id: "s".to_string(),
            kind: NodeKind::Sensor,
            trigger_rule: TriggerRule::AllSuccess,
            retries: 0,
            retry_delay_ms: 1_000,
            poll_interval_ms: Some(100),
            poll_timeout_ms: None,
        };
        let predicate = Arc::new(FnSensor::new(|_: &Context| Ok(true)));

        assert!(matches!(
            Node::sensor_from_spec(&spec, predicate),
            Err(DagRunError::MissingPollPolicy(_))
        ));
    }

    #[test]
    fn test_builder_options_from_spec() {
        let spec = NodeSpec {
            id: "calc_gold".to_string(),
            kind: NodeKind::Plain,
            trigger_rule: TriggerRule::OneSuccess,
            retries: 2,
            retry_delay_ms: 250,
            poll_interval_ms: None,
            poll_timeout_ms: None,
        };

        let node = Node::from_spec(&spec, noop()).unwrap();
        assert_eq!(node.trigger_rule, TriggerRule::OneSuccess);
        assert_eq!(node.retry.max_attempts, 3);
        assert_eq!(node.retry.delay, Duration::from_millis(250));
    }
}
