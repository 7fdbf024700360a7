//! Run control surface: start, observe, and cancel runs of immutable graphs

use crate::archive::RunArchive;
use crate::error::{DagRunError, Result};
use crate::graph::Graph;
use crate::metrics::EngineMetrics;
use crate::models::{RunRecord, RunStatus, TaskInstance};
use crate::runner::{RunConfig, Runner};
use crate::store::InstanceStore;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::error;
use uuid::Uuid;

struct RunHandle {
    graph_name: String,
    store: InstanceStore,
    cancel: watch::Sender<bool>,
    status: watch::Receiver<RunStatus>,
}

/// Engine managing any number of concurrent runs.
///
/// A [`Graph`] is read-only and may be started any number of times; every
/// run owns its own instance store.
pub struct Engine {
    config: RunConfig,
    runs: Mutex<HashMap<Uuid, RunHandle>>,
    archive: Option<RunArchive>,
    metrics: Option<Arc<EngineMetrics>>,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(RunConfig::default())
    }

    pub fn with_config(config: RunConfig) -> Self {
        Self {
            config,
            runs: Mutex::new(HashMap::new()),
            archive: None,
            metrics: None,
        }
    }

    /// Archive every terminal run into the given store
    pub fn with_archive(mut self, archive: RunArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Start a new run of the graph; returns immediately with the run id.
    pub fn start(&self, graph: Arc<Graph>) -> Uuid {
        let run_id = Uuid::new_v4();
        let store = InstanceStore::new(graph.node_ids());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(RunStatus::NotStarted);
        let started_at = Utc::now();

        let mut runner = Runner::new(
            run_id,
            graph.clone(),
            store.clone(),
            self.config.clone(),
            cancel_rx,
        );
        if let Some(metrics) = &self.metrics {
            runner = runner.with_metrics(metrics.clone());
        }

        let archive = self.archive.clone();
        let metrics = self.metrics.clone();
        let archive_store = store.clone();
        let task_graph = graph.clone();
        tokio::spawn(async move {
            let _ = status_tx.send(RunStatus::Running);
            let status = runner.drive().await;

            if let Some(metrics) = &metrics {
                metrics.run_finished(task_graph.name(), status);
            }
            if let Some(archive) = &archive {
                let record = RunRecord {
                    run_id,
                    graph_name: task_graph.name().to_string(),
                    status,
                    started_at,
                    finished_at: Some(Utc::now()),
                };
                if let Err(e) = archive.record_run(&record, &archive_store.snapshot()) {
                    error!(run = %run_id, error = %e, "failed to archive run");
                }
            }

            let _ = status_tx.send(status);
        });

        self.runs.lock().unwrap().insert(
            run_id,
            RunHandle {
                graph_name: graph.name().to_string(),
                store,
                cancel: cancel_tx,
                status: status_rx,
            },
        );
        run_id
    }

    /// Current overall status of a run
    pub fn status(&self, run_id: Uuid) -> Result<RunStatus> {
        self.with_handle(run_id, |handle| *handle.status.borrow())
    }

    /// Signal cancellation: running nodes stop at their next suspension
    /// point, pending nodes are skipped.
    pub fn cancel(&self, run_id: Uuid) -> Result<()> {
        self.with_handle(run_id, |handle| {
            let _ = handle.cancel.send(true);
        })
    }

    /// Current state of one node's instance within a run
    pub fn task_instance(&self, run_id: Uuid, node_id: &str) -> Result<TaskInstance> {
        self.with_handle(run_id, |handle| handle.store.get(node_id))?
            .ok_or_else(|| DagRunError::UnknownNode(node_id.to_string()))
    }

    /// All task instances of a run, sorted by node id
    pub fn snapshot(&self, run_id: Uuid) -> Result<Vec<TaskInstance>> {
        self.with_handle(run_id, |handle| handle.store.snapshot())
    }

    /// Node ids currently Failed or UpstreamFailed
    pub fn failed_nodes(&self, run_id: Uuid) -> Result<Vec<String>> {
        self.with_handle(run_id, |handle| handle.store.failed_nodes())
    }

    pub fn graph_name(&self, run_id: Uuid) -> Result<String> {
        self.with_handle(run_id, |handle| handle.graph_name.clone())
    }

    /// Wait until the run reaches a terminal status
    pub async fn wait(&self, run_id: Uuid) -> Result<RunStatus> {
        let mut status_rx = self.with_handle(run_id, |handle| handle.status.clone())?;
        loop {
            let status = *status_rx.borrow();
            if status.is_terminal() {
                return Ok(status);
            }
            if status_rx.changed().await.is_err() {
                // Runner gone without a terminal status; report what we saw.
                return Ok(*status_rx.borrow());
            }
        }
    }

    /// Cancel every active run and wait for all of them to settle
    pub async fn shutdown(&self) {
        let run_ids: Vec<Uuid> = self.runs.lock().unwrap().keys().copied().collect();
        for run_id in &run_ids {
            let _ = self.cancel(*run_id);
        }
        futures::future::join_all(run_ids.iter().map(|run_id| self.wait(*run_id))).await;
    }

    fn with_handle<T>(&self, run_id: Uuid, f: impl FnOnce(&RunHandle) -> T) -> Result<T> {
        let runs = self.runs.lock().unwrap();
        let handle = runs.get(&run_id).ok_or(DagRunError::RunNotFound(run_id))?;
        Ok(f(handle))
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
