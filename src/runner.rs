//! Single-run scheduler loop: readiness sweeps, dispatch, and skip/failure
//! propagation until every instance is terminal

use crate::action::Context;
use crate::error::{DagRunError, Result};
use crate::graph::{Graph, NodeWork};
use crate::metrics::EngineMetrics;
use crate::models::{ActionOutput, NodeKind, RunStatus, TaskStatus};
use crate::retry;
use crate::sensor;
use crate::store::InstanceStore;
use crate::trigger::{self, EvalMode, Readiness};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Tunables for one run
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub eval_mode: EvalMode,
    /// Upper bound on concurrently executing nodes
    pub max_parallel: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            eval_mode: EvalMode::Eager,
            max_parallel: 4,
        }
    }
}

struct Completion {
    node: String,
    outcome: Result<ActionOutput>,
}

/// Drives one run of a graph to a terminal status
pub struct Runner {
    run_id: Uuid,
    graph: Arc<Graph>,
    store: InstanceStore,
    config: RunConfig,
    cancel: watch::Receiver<bool>,
    metrics: Option<Arc<EngineMetrics>>,
}

impl Runner {
    pub fn new(
        run_id: Uuid,
        graph: Arc<Graph>,
        store: InstanceStore,
        config: RunConfig,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            run_id,
            graph,
            store,
            config,
            cancel,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run the scheduling loop until no instance is pending and none is in
    /// flight, then derive the run's terminal status.
    pub async fn drive(mut self) -> RunStatus {
        let (tx, mut rx) = mpsc::unbounded_channel::<Completion>();
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut cancelled = *self.cancel.borrow();

        info!(
            run = %self.run_id,
            graph = self.graph.name(),
            nodes = self.graph.len(),
            "run started"
        );
        if cancelled {
            self.skip_all_pending();
        }

        loop {
            self.sweep(&tx, &semaphore, &mut in_flight, cancelled);

            if in_flight.is_empty() {
                break;
            }

            let mut cancel = self.cancel.clone();
            tokio::select! {
                maybe = rx.recv() => {
                    // Workers hold a clone of tx, so recv can only yield
                    // None once every dispatched node has reported.
                    let Some(completion) = maybe else { break };
                    in_flight.remove(&completion.node);
                    self.apply_completion(completion);
                }
                _ = retry::cancel_signalled(&mut cancel), if !cancelled => {
                    cancelled = true;
                    info!(run = %self.run_id, "run cancelled, skipping pending nodes");
                    self.skip_all_pending();
                }
            }
        }

        if !self.store.all_terminal() {
            // Unreachable for well-formed graphs; surfaced rather than hung.
            warn!(run = %self.run_id, "run finished with unresolved instances");
            self.skip_all_pending();
        }

        let status = if self.store.any_failed() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        info!(
            run = %self.run_id,
            status = %status,
            failed_nodes = ?self.store.failed_nodes(),
            "run finished"
        );
        status
    }

    /// Evaluate every pending node, propagating skips and upstream failures
    /// to a fixpoint and dispatching everything ready.
    fn sweep(
        &self,
        tx: &mpsc::UnboundedSender<Completion>,
        semaphore: &Arc<Semaphore>,
        in_flight: &mut HashSet<String>,
        cancelled: bool,
    ) {
        loop {
            let mut progressed = false;

            for node_id in self.store.pending_nodes() {
                let Some(node) = self.graph.node(&node_id) else {
                    continue;
                };
                let predecessors = self.graph.predecessors(&node_id);
                let statuses = self.store.statuses(&predecessors);

                match trigger::evaluate(node.trigger_rule, self.config.eval_mode, &statuses) {
                    Readiness::Ready => {
                        if cancelled {
                            continue;
                        }
                        if self.store.transition(&node_id, TaskStatus::Queued) {
                            debug!(run = %self.run_id, node = %node_id, "node queued");
                            in_flight.insert(node_id.clone());
                            self.dispatch(node_id, tx.clone(), semaphore.clone());
                        }
                    }
                    Readiness::Skip => {
                        if self.store.transition(&node_id, TaskStatus::Skipped) {
                            debug!(run = %self.run_id, node = %node_id, "node skipped");
                            progressed = true;
                        }
                    }
                    Readiness::UpstreamFail => {
                        if self.store.transition(&node_id, TaskStatus::UpstreamFailed) {
                            warn!(run = %self.run_id, node = %node_id, "node upstream-failed");
                            progressed = true;
                        }
                    }
                    Readiness::Wait => {}
                }
            }

            if !progressed {
                break;
            }
        }
    }

    fn dispatch(
        &self,
        node_id: String,
        tx: mpsc::UnboundedSender<Completion>,
        semaphore: Arc<Semaphore>,
    ) {
        let graph = self.graph.clone();
        let store = self.store.clone();
        let mut cancel = self.cancel.clone();
        let run_id = self.run_id;
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                let _ = tx.send(Completion {
                    node: node_id,
                    outcome: Err(DagRunError::Cancelled),
                });
                return;
            };

            store.transition(&node_id, TaskStatus::Running);
            if let Some(m) = &metrics {
                m.task_started();
            }

            let outcome = execute_node(&graph, &store, run_id, &node_id, &mut cancel).await;

            if let Some(m) = &metrics {
                m.task_stopped();
            }
            let _ = tx.send(Completion {
                node: node_id,
                outcome,
            });
        });
    }

    fn apply_completion(&self, completion: Completion) {
        let node_id = completion.node;
        match completion.outcome {
            Ok(output) => {
                self.store.set_output(&node_id, output.clone());
                self.store.transition(&node_id, TaskStatus::Success);
                info!(run = %self.run_id, node = %node_id, "node succeeded");
                self.record_task_metrics(&node_id, TaskStatus::Success);

                let is_branch = self
                    .graph
                    .node(&node_id)
                    .map(|n| n.kind == NodeKind::Branch)
                    .unwrap_or(false);
                if is_branch {
                    if let ActionOutput::Branch(chosen) = &output {
                        self.skip_untaken_branches(&node_id, chosen);
                    }
                }
            }
            Err(err) => {
                self.store.set_error(&node_id, err.to_string());
                self.store.transition(&node_id, TaskStatus::Failed);
                error!(run = %self.run_id, node = %node_id, error = %err, "node failed");
                self.record_task_metrics(&node_id, TaskStatus::Failed);
            }
        }
    }

    /// Every declared successor the branch did not choose is skipped right
    /// away, so the skip propagates without waiting for those branches to
    /// come up for evaluation.
    fn skip_untaken_branches(&self, branch_id: &str, chosen: &[String]) {
        for successor in self.graph.successors(branch_id) {
            if !chosen.contains(&successor) && self.store.skip_if_pending(&successor) {
                debug!(
                    run = %self.run_id,
                    branch = %branch_id,
                    node = %successor,
                    "untaken branch skipped"
                );
            }
        }
    }

    fn skip_all_pending(&self) {
        for node_id in self.store.pending_nodes() {
            self.store.transition(&node_id, TaskStatus::Skipped);
        }
    }

    fn record_task_metrics(&self, node_id: &str, status: TaskStatus) {
        if let Some(m) = &self.metrics {
            let duration = self
                .store
                .get(node_id)
                .and_then(|i| match (i.started_at, i.finished_at) {
                    (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
                    _ => None,
                })
                .map(|ms| ms.max(0) as f64 / 1_000.0);
            m.task_completed(self.graph.name(), node_id, status, duration);
        }
    }
}

/// Execute one node's work: sensor polling or (retried) action invocation,
/// with branch-target validation after a branch action succeeds.
async fn execute_node(
    graph: &Arc<Graph>,
    store: &InstanceStore,
    run_id: Uuid,
    node_id: &str,
    cancel: &mut watch::Receiver<bool>,
) -> Result<ActionOutput> {
    let node = graph
        .node(node_id)
        .ok_or_else(|| DagRunError::UnknownNode(node_id.to_string()))?;
    let successors = graph.successors(node_id);

    match &node.work {
        NodeWork::Sensor(predicate) => {
            let poll_policy = node
                .poll
                .ok_or_else(|| DagRunError::MissingPollPolicy(node_id.to_string()))?;
            store.record_attempt(node_id);

            let polls = sensor::poll(&poll_policy, cancel, |poll_number| {
                let ctx = Context {
                    run_id,
                    node_id: node_id.to_string(),
                    attempt: poll_number,
                    successors: successors.clone(),
                };
                let predicate = predicate.clone();
                async move { predicate.check(&ctx).await }
            })
            .await?;

            Ok(ActionOutput::Value(serde_json::json!({ "polls": polls })))
        }
        NodeWork::Action(action) => {
            let output = retry::run_with_retry(&node.retry, cancel, |attempt| {
                store.record_attempt(node_id);
                let ctx = Context {
                    run_id,
                    node_id: node_id.to_string(),
                    attempt,
                    successors: successors.clone(),
                };
                let action = action.clone();
                async move { action.execute(&ctx).await }
            })
            .await?;

            if node.kind == NodeKind::Branch {
                validate_branch_output(node_id, &successors, &output)?;
            }
            Ok(output)
        }
    }
}

fn validate_branch_output(
    node_id: &str,
    declared: &[String],
    output: &ActionOutput,
) -> Result<()> {
    match output {
        ActionOutput::Branch(targets) => {
            if targets.is_empty() {
                return Err(DagRunError::EmptyBranchSelection(node_id.to_string()));
            }
            for target in targets {
                if !declared.contains(target) {
                    return Err(DagRunError::InvalidBranchTarget {
                        node: node_id.to_string(),
                        target: target.clone(),
                    });
                }
            }
            Ok(())
        }
        _ => Err(DagRunError::Action(anyhow::anyhow!(
            "branch node '{}' returned a non-branch output",
            node_id
        ))),
    }
}
