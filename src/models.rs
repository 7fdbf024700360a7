//! Core data models for the dagrun execution engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// Input validation limits for graph descriptors
pub const MAX_YAML_SIZE: usize = 1_048_576; // 1 MB
pub const MAX_NODE_COUNT: usize = 1_000;
pub const MAX_NODE_ID_LEN: usize = 64;

/// Status of a task instance within a run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Success,
    Failed,
    Skipped,
    UpstreamFailed,
}

impl TaskStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success
                | TaskStatus::Failed
                | TaskStatus::Skipped
                | TaskStatus::UpstreamFailed
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Success => write!(f, "success"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Skipped => write!(f, "skipped"),
            TaskStatus::UpstreamFailed => write!(f, "upstream_failed"),
        }
    }
}

/// Overall status of one run of a graph
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::NotStarted => write!(f, "not_started"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Readiness predicate over a node's direct predecessors
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerRule {
    /// Ready only once every predecessor succeeded
    #[default]
    AllSuccess,
    /// Ready as soon as any predecessor succeeded (join semantics)
    OneSuccess,
}

/// Node type variants
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    #[default]
    Plain,
    Branch,
    Sensor,
}

/// Retry policy for a node's action: bounded attempts with a fixed
/// inter-attempt delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one (>= 1)
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::from_secs(30),
        }
    }
}

/// Polling policy for sensor nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Pause between predicate checks
    pub interval: Duration,
    /// Budget for the whole poll loop
    pub timeout: Duration,
}

/// Result payload produced by a node's action
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutput {
    /// Arbitrary domain payload
    Value(serde_json::Value),
    /// Successor ids chosen by a branch node
    Branch(Vec<String>),
}

impl ActionOutput {
    /// Output of an action that produces nothing of interest.
    pub fn none() -> Self {
        ActionOutput::Value(serde_json::Value::Null)
    }
}

/// Per-run mutable state of one node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInstance {
    pub node: String,
    pub status: TaskStatus,
    /// Attempts performed so far (0 until the first dispatch)
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<ActionOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskInstance {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            status: TaskStatus::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
            output: None,
            error: None,
        }
    }

    /// Successor ids chosen by this instance, if it was a branch node.
    pub fn chosen_successors(&self) -> Option<&[String]> {
        match &self.output {
            Some(ActionOutput::Branch(ids)) => Some(ids),
            _ => None,
        }
    }
}

/// Node descriptor as it appears in a graph definition (YAML or built
/// programmatically). Actions are bound separately; see
/// [`crate::graph::GraphBuilder`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSpec {
    pub id: String,
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default)]
    pub trigger_rule: TriggerRule,
    /// Extra attempts after the first failure
    #[serde(default)]
    pub retries: u32,
    /// Fixed delay between attempts, in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_timeout_ms: Option<u64>,
}

fn default_retry_delay_ms() -> u64 {
    30_000
}

impl NodeSpec {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retries + 1,
            delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn poll_policy(&self) -> Option<PollPolicy> {
        match (self.poll_interval_ms, self.poll_timeout_ms) {
            (Some(interval), Some(timeout)) => Some(PollPolicy {
                interval: Duration::from_millis(interval),
                timeout: Duration::from_millis(timeout),
            }),
            _ => None,
        }
    }
}

/// Whole-graph descriptor: node specs plus (upstream, downstream) edges
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<(String, String)>,
}

/// Archived record of one finished run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: uuid::Uuid,
    pub graph_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_display() {
        assert_eq!(TaskStatus::Pending.to_string(), "pending");
        assert_eq!(TaskStatus::Queued.to_string(), "queued");
        assert_eq!(TaskStatus::Running.to_string(), "running");
        assert_eq!(TaskStatus::Success.to_string(), "success");
        assert_eq!(TaskStatus::Failed.to_string(), "failed");
        assert_eq!(TaskStatus::Skipped.to_string(), "skipped");
        assert_eq!(TaskStatus::UpstreamFailed.to_string(), "upstream_failed");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Success.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
        assert!(TaskStatus::UpstreamFailed.is_terminal());
    }

    #[test]
    fn test_trigger_rule_serde() {
        let rule: TriggerRule = serde_yaml::from_str("all_success").unwrap();
        assert_eq!(rule, TriggerRule::AllSuccess);

        let rule: TriggerRule = serde_yaml::from_str("one_success").unwrap();
        assert_eq!(rule, TriggerRule::OneSuccess);
    }

    #[test]
    fn test_node_kind_serde() {
        let kind: NodeKind = serde_yaml::from_str("plain").unwrap();
        assert_eq!(kind, NodeKind::Plain);

        let kind: NodeKind = serde_yaml::from_str("branch").unwrap();
        assert_eq!(kind, NodeKind::Branch);

        let kind: NodeKind = serde_yaml::from_str("sensor").unwrap();
        assert_eq!(kind, NodeKind::Sensor);
    }

    #[test]
    fn test_node_spec_defaults() {
        let yaml = r#"
id: create_table
"#;
        let spec: NodeSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.kind, NodeKind::Plain);
        assert_eq!(spec.trigger_rule, TriggerRule::AllSuccess);
        assert_eq!(spec.retries, 0);

        let policy = spec.retry_policy();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.delay, Duration::from_secs(30));
        assert!(spec.poll_policy().is_none());
    }

    #[test]
    fn test_sensor_spec_poll_policy() {
        let yaml = r#"
id: check_rows
kind: sensor
poll_interval_ms: 500
poll_timeout_ms: 30000
"#;
        let spec: NodeSpec = serde_yaml::from_str(yaml).unwrap();
        let poll = spec.poll_policy().unwrap();
        assert_eq!(poll.interval, Duration::from_millis(500));
        assert_eq!(poll.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_chosen_successors() {
        let mut instance = TaskInstance::new("pick");
        assert!(instance.chosen_successors().is_none());

        instance.output = Some(ActionOutput::Branch(vec!["gold".to_string()]));
        assert_eq!(instance.chosen_successors().unwrap(), ["gold".to_string()]);

        instance.output = Some(ActionOutput::none());
        assert!(instance.chosen_successors().is_none());
    }
}
