//! Error types for dagrun

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// dagrun error types
#[derive(Error, Debug)]
pub enum DagRunError {
    /// Graph contains a cycle (detected at build time)
    #[error("Cycle detected in graph: {path}")]
    Cycle { path: String },

    /// Node declared more than once
    #[error("Duplicate node id '{0}'")]
    DuplicateNode(String),

    /// Edge or lookup references a node that was never declared
    #[error("Unknown node '{0}'")]
    UnknownNode(String),

    /// Edge from a node to itself
    #[error("Self-loop on node '{0}'")]
    SelfLoop(String),

    /// Sensor node declared without a polling policy
    #[error("Sensor node '{0}' has no polling policy")]
    MissingPollPolicy(String),

    /// Node id validation error
    #[error("Invalid node id '{id}': only alphanumeric, underscore, and dash allowed")]
    InvalidNodeId { id: String },

    /// Node id length validation error
    #[error("Node id '{id}' exceeds {max} characters")]
    NodeIdTooLong { id: String, max: usize },

    /// Node count exceeded limit
    #[error("Node count {count} exceeds limit of {limit}")]
    NodeCountExceeded { count: usize, limit: usize },

    /// Graph descriptor size exceeded limit
    #[error("Graph YAML exceeds 1MB limit (size: {0} bytes)")]
    YamlSizeExceeded(usize),

    /// Branch action selected a successor that is not declared in the graph
    #[error("Branch node '{node}' selected undeclared successor '{target}'")]
    InvalidBranchTarget { node: String, target: String },

    /// Branch action selected nothing
    #[error("Branch node '{0}' selected no successors")]
    EmptyBranchSelection(String),

    /// Sensor exceeded its polling budget
    #[error("Sensor timed out after {elapsed:?} (timeout: {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },

    /// Run was cancelled while this node was executing or waiting
    #[error("Cancelled")]
    Cancelled,

    /// No run with the given id is known to the engine
    #[error("Run '{0}' not found")]
    RunNotFound(Uuid),

    /// Domain action failure (retried per the node's policy)
    #[error("Action error: {0}")]
    Action(#[source] anyhow::Error),

    /// YAML parsing errors
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using DagRunError
pub type Result<T> = std::result::Result<T, DagRunError>;
