//! YAML parser with validation for graph descriptors
//!
//! A descriptor declares node specs and edges only; actions are bound in
//! code via [`crate::graph::Node::from_spec`] and
//! [`crate::graph::Node::sensor_from_spec`] before the graph is built.

use crate::error::{DagRunError, Result};
use crate::models::{GraphSpec, NodeKind, MAX_NODE_COUNT, MAX_NODE_ID_LEN, MAX_YAML_SIZE};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Parse and validate a graph descriptor from a YAML file.
///
/// Enforces the descriptor limits: file size <= 1MB, at most 1,000 nodes,
/// node ids alphanumeric plus underscore/dash and at most 64 characters.
pub fn parse_graph_file<P: AsRef<Path>>(path: P) -> Result<GraphSpec> {
    let content = fs::read_to_string(path)?;
    parse_graph_yaml(&content)
}

/// Parse and validate a graph descriptor from a YAML string.
pub fn parse_graph_yaml(content: &str) -> Result<GraphSpec> {
    if content.len() > MAX_YAML_SIZE {
        return Err(DagRunError::YamlSizeExceeded(content.len()));
    }

    let spec: GraphSpec = serde_yaml::from_str(content)?;
    validate_graph_spec(&spec)?;
    Ok(spec)
}

/// Structural validation of a parsed descriptor
pub fn validate_graph_spec(spec: &GraphSpec) -> Result<()> {
    if spec.nodes.len() > MAX_NODE_COUNT {
        return Err(DagRunError::NodeCountExceeded {
            count: spec.nodes.len(),
            limit: MAX_NODE_COUNT,
        });
    }

    let mut ids: HashSet<&str> = HashSet::new();
    for node in &spec.nodes {
        validate_node_id(&node.id)?;
        if !ids.insert(&node.id) {
            return Err(DagRunError::DuplicateNode(node.id.clone()));
        }
        if node.kind == NodeKind::Sensor && node.poll_policy().is_none() {
            return Err(DagRunError::MissingPollPolicy(node.id.clone()));
        }
    }

    for (upstream, downstream) in &spec.edges {
        if upstream == downstream {
            return Err(DagRunError::SelfLoop(upstream.clone()));
        }
        for endpoint in [upstream, downstream] {
            if !ids.contains(endpoint.as_str()) {
                return Err(DagRunError::UnknownNode(endpoint.clone()));
            }
        }
    }

    Ok(())
}

fn validate_node_id(id: &str) -> Result<()> {
    if id.len() > MAX_NODE_ID_LEN {
        return Err(DagRunError::NodeIdTooLong {
            id: id.to_string(),
            max: MAX_NODE_ID_LEN,
        });
    }
    if id.is_empty()
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(DagRunError::InvalidNodeId { id: id.to_string() });
    }
    Ok(())
}
