//! Prometheus metrics for run and task-instance execution
//!
//! Exposed metrics:
//!
//! - `dagrun_runs_total{graph, status}` - counter of finished runs
//! - `dagrun_task_instances_total{graph, node, status}` - counter of terminal task instances
//! - `dagrun_task_duration_seconds{graph, node}` - histogram of task durations
//! - `dagrun_active_tasks` - gauge of currently executing nodes
//!
//! A minimal `/metrics` HTTP endpoint can be started with
//! [`EngineMetrics::serve`].

use crate::models::{RunStatus, TaskStatus};
use prometheus::{CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Histogram bucket boundaries for task durations (seconds)
const TASK_DURATION_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0];

/// Shared metrics collector for one engine
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Arc<Registry>,
    runs_total: Arc<CounterVec>,
    task_instances_total: Arc<CounterVec>,
    task_duration: Arc<HistogramVec>,
    active_tasks: Arc<Gauge>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let runs_total = CounterVec::new(
            Opts::new("dagrun_runs_total", "Total number of finished runs"),
            &["graph", "status"],
        )
        .unwrap();

        let task_instances_total = CounterVec::new(
            Opts::new(
                "dagrun_task_instances_total",
                "Total number of terminal task instances",
            ),
            &["graph", "node", "status"],
        )
        .unwrap();

        let task_duration = HistogramVec::new(
            HistogramOpts::new(
                "dagrun_task_duration_seconds",
                "Task instance execution duration in seconds",
            )
            .buckets(TASK_DURATION_BUCKETS.to_vec()),
            &["graph", "node"],
        )
        .unwrap();

        let active_tasks =
            Gauge::with_opts(Opts::new("dagrun_active_tasks", "Currently executing nodes"))
                .unwrap();

        registry.register(Box::new(runs_total.clone())).unwrap();
        registry
            .register(Box::new(task_instances_total.clone()))
            .unwrap();
        registry.register(Box::new(task_duration.clone())).unwrap();
        registry.register(Box::new(active_tasks.clone())).unwrap();

        Self {
            registry: Arc::new(registry),
            runs_total: Arc::new(runs_total),
            task_instances_total: Arc::new(task_instances_total),
            task_duration: Arc::new(task_duration),
            active_tasks: Arc::new(active_tasks),
        }
    }

    pub fn run_finished(&self, graph: &str, status: RunStatus) {
        self.runs_total
            .with_label_values(&[graph, &status.to_string()])
            .inc();
    }

    pub fn task_started(&self) {
        self.active_tasks.inc();
    }

    pub fn task_stopped(&self) {
        self.active_tasks.dec();
    }

    pub fn task_completed(
        &self,
        graph: &str,
        node: &str,
        status: TaskStatus,
        duration_secs: Option<f64>,
    ) {
        self.task_instances_total
            .with_label_values(&[graph, node, &status.to_string()])
            .inc();
        if let Some(duration) = duration_secs {
            self.task_duration
                .with_label_values(&[graph, node])
                .observe(duration);
        }
    }

    /// Render the registry in Prometheus text format
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8_lossy(&buffer).to_string()
    }

    /// Start the HTTP metrics endpoint on the given port (`GET /metrics`)
    pub async fn serve(&self, port: u16) -> anyhow::Result<()> {
        let addr = format!("127.0.0.1:{}", port);
        let listener = TcpListener::bind(&addr).await?;
        info!("Metrics endpoint listening on http://{}/metrics", addr);

        let metrics = self.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_request(stream, metrics).await {
                                error!("Error handling metrics request: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting metrics connection: {}", e);
                    }
                }
            }
        });

        Ok(())
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

async fn handle_request(
    mut stream: tokio::net::TcpStream,
    metrics: EngineMetrics,
) -> anyhow::Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut buffer = [0; 1024];
    let n = stream.read(&mut buffer).await?;
    let request = String::from_utf8_lossy(&buffer[..n]);

    if request.starts_with("GET /metrics") {
        let body = metrics.gather();
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await?;
    } else {
        let response = "HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nNot Found";
        stream.write_all(response.as_bytes()).await?;
    }

    Ok(())
}
