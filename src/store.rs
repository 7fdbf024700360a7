//! In-memory task-instance store: per-run mutable state for every node
//!
//! All reads and writes go through one mutex, so the scheduler never sees a
//! partially updated instance while a worker reports completion.

use crate::models::{ActionOutput, TaskInstance, TaskStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Shared store of one run's task instances
#[derive(Clone)]
pub struct InstanceStore {
    inner: Arc<Mutex<HashMap<String, TaskInstance>>>,
}

impl InstanceStore {
    /// One fresh pending instance per node id
    pub fn new<I>(node_ids: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let instances = node_ids
            .into_iter()
            .map(|id| {
                let id = id.into();
                (id.clone(), TaskInstance::new(id))
            })
            .collect();
        Self {
            inner: Arc::new(Mutex::new(instances)),
        }
    }

    pub fn get(&self, node: &str) -> Option<TaskInstance> {
        self.inner.lock().unwrap().get(node).cloned()
    }

    pub fn status(&self, node: &str) -> Option<TaskStatus> {
        self.inner.lock().unwrap().get(node).map(|i| i.status)
    }

    /// Statuses of the given nodes, in the same order
    pub fn statuses(&self, nodes: &[String]) -> Vec<TaskStatus> {
        let inner = self.inner.lock().unwrap();
        nodes
            .iter()
            .filter_map(|n| inner.get(n).map(|i| i.status))
            .collect()
    }

    /// All instances, sorted by node id
    pub fn snapshot(&self) -> Vec<TaskInstance> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<TaskInstance> = inner.values().cloned().collect();
        out.sort_by(|a, b| a.node.cmp(&b.node));
        out
    }

    pub fn pending_nodes(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<String> = inner
            .values()
            .filter(|i| i.status == TaskStatus::Pending)
            .map(|i| i.node.clone())
            .collect();
        out.sort();
        out
    }

    pub fn all_terminal(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .values()
            .all(|i| i.status.is_terminal())
    }

    pub fn any_failed(&self) -> bool {
        self.inner.lock().unwrap().values().any(|i| {
            matches!(
                i.status,
                TaskStatus::Failed | TaskStatus::UpstreamFailed
            )
        })
    }

    /// Node ids currently Failed or UpstreamFailed, sorted
    pub fn failed_nodes(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<String> = inner
            .values()
            .filter(|i| {
                matches!(
                    i.status,
                    TaskStatus::Failed | TaskStatus::UpstreamFailed
                )
            })
            .map(|i| i.node.clone())
            .collect();
        out.sort();
        out
    }

    /// Apply a status transition if the lattice allows it.
    ///
    /// Instances never leave a terminal status and never re-enter Pending.
    /// Returns whether the transition was applied.
    pub fn transition(&self, node: &str, to: TaskStatus) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(instance) = inner.get_mut(node) else {
            return false;
        };

        if !transition_allowed(instance.status, to) {
            warn!(
                node,
                from = %instance.status,
                to = %to,
                "rejected task instance transition"
            );
            return false;
        }

        instance.status = to;
        if to == TaskStatus::Running && instance.started_at.is_none() {
            instance.started_at = Some(Utc::now());
        }
        if to.is_terminal() {
            instance.finished_at = Some(Utc::now());
        }
        true
    }

    /// Skip the node only if it has not been queued or dispatched yet.
    /// Used when a branch resolves: untaken siblings that already run for
    /// another reason keep their own outcome.
    pub fn skip_if_pending(&self, node: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.get_mut(node) {
            Some(instance) if instance.status == TaskStatus::Pending => {
                instance.status = TaskStatus::Skipped;
                instance.finished_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    /// Record one more attempt; returns the new attempt count.
    pub fn record_attempt(&self, node: &str) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        match inner.get_mut(node) {
            Some(instance) => {
                instance.attempts += 1;
                instance.attempts
            }
            None => 0,
        }
    }

    pub fn set_output(&self, node: &str, output: ActionOutput) {
        if let Some(instance) = self.inner.lock().unwrap().get_mut(node) {
            instance.output = Some(output);
        }
    }

    pub fn set_error(&self, node: &str, error: impl Into<String>) {
        if let Some(instance) = self.inner.lock().unwrap().get_mut(node) {
            instance.error = Some(error.into());
        }
    }
}

fn transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    if from.is_terminal() || to == TaskStatus::Pending || from == to {
        return false;
    }
    match from {
        TaskStatus::Pending => true,
        TaskStatus::Queued => true,
        TaskStatus::Running => to.is_terminal(),
        _ => false,
    }
}
