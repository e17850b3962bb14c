//! Prometheus metrics collection and HTTP endpoint
//!
//! Metrics are exposed on `/metrics` when the orchestrator is started with
//! metrics enabled (default port 9090).
//!
//! # Available Metrics
//!
//! - `tributary_runs_created_total{workflow, kind}` - Runs created
//! - `tributary_runs_finished_total{workflow, state}` - Runs completed
//! - `tributary_task_instances_total{workflow, task, state}` - Attempt outcomes
//! - `tributary_task_duration_seconds{workflow, task}` - Attempt durations
//! - `tributary_running_tasks` - Invocations currently running in this process
//! - `tributary_open_runs` - Runs in `running` as of the last scheduler tick
//! - `tributary_scheduler_ticks_total{result}` - Scheduler ticks (`ok`/`error`)
//! - `tributary_scheduler_tick_seconds` - Scheduler tick duration
//! - `tributary_memory_bytes` - Process memory usage (RSS)

use crate::error::Result;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Histogram bucket boundaries for task duration metrics (in seconds)
const TASK_DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 300.0, 1800.0];

const TICK_DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0];

/// Orchestrator metrics registry
pub struct Metrics {
    registry: Registry,
    runs_created: IntCounterVec,
    runs_finished: IntCounterVec,
    task_instances: IntCounterVec,
    task_duration: HistogramVec,
    running_tasks: IntGauge,
    open_runs: IntGauge,
    scheduler_ticks: IntCounterVec,
    tick_duration: Histogram,
    memory_bytes: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let runs_created = IntCounterVec::new(
            Opts::new("tributary_runs_created_total", "Total number of runs created"),
            &["workflow", "kind"],
        )?;
        let runs_finished = IntCounterVec::new(
            Opts::new(
                "tributary_runs_finished_total",
                "Total number of runs that reached a terminal state",
            ),
            &["workflow", "state"],
        )?;
        let task_instances = IntCounterVec::new(
            Opts::new(
                "tributary_task_instances_total",
                "Total number of finished task attempts",
            ),
            &["workflow", "task", "state"],
        )?;
        let task_duration = HistogramVec::new(
            HistogramOpts::new(
                "tributary_task_duration_seconds",
                "Task attempt duration in seconds",
            )
            .buckets(TASK_DURATION_BUCKETS.to_vec()),
            &["workflow", "task"],
        )?;
        let running_tasks =
            IntGauge::with_opts(Opts::new("tributary_running_tasks", "Running task invocations"))?;
        let open_runs = IntGauge::with_opts(Opts::new("tributary_open_runs", "Open runs"))?;
        let scheduler_ticks = IntCounterVec::new(
            Opts::new("tributary_scheduler_ticks_total", "Scheduler ticks"),
            &["result"],
        )?;
        let tick_duration = Histogram::with_opts(
            HistogramOpts::new(
                "tributary_scheduler_tick_seconds",
                "Scheduler tick duration in seconds",
            )
            .buckets(TICK_DURATION_BUCKETS.to_vec()),
        )?;
        let memory_bytes = Gauge::with_opts(Opts::new(
            "tributary_memory_bytes",
            "Process memory usage in bytes (RSS)",
        ))?;

        registry.register(Box::new(runs_created.clone()))?;
        registry.register(Box::new(runs_finished.clone()))?;
        registry.register(Box::new(task_instances.clone()))?;
        registry.register(Box::new(task_duration.clone()))?;
        registry.register(Box::new(running_tasks.clone()))?;
        registry.register(Box::new(open_runs.clone()))?;
        registry.register(Box::new(scheduler_ticks.clone()))?;
        registry.register(Box::new(tick_duration.clone()))?;
        registry.register(Box::new(memory_bytes.clone()))?;

        Ok(Self {
            registry,
            runs_created,
            runs_finished,
            task_instances,
            task_duration,
            running_tasks,
            open_runs,
            scheduler_ticks,
            tick_duration,
            memory_bytes,
        })
    }

    pub fn record_run_created(&self, workflow: &str, kind: &str) {
        self.runs_created.with_label_values(&[workflow, kind]).inc();
    }

    pub fn record_run_finished(&self, workflow: &str, state: &str) {
        self.runs_finished.with_label_values(&[workflow, state]).inc();
    }

    /// Record the end of one attempt
    pub fn record_task_attempt(&self, workflow: &str, task: &str, state: &str, duration_secs: f64) {
        self.task_instances
            .with_label_values(&[workflow, task, state])
            .inc();
        self.task_duration
            .with_label_values(&[workflow, task])
            .observe(duration_secs);
    }

    pub fn inc_running_tasks(&self) {
        self.running_tasks.inc();
    }

    pub fn dec_running_tasks(&self) {
        self.running_tasks.dec();
    }

    pub fn set_open_runs(&self, count: usize) {
        self.open_runs.set(count as i64);
    }

    pub fn record_tick(&self, ok: bool, duration_secs: f64) {
        let result = if ok { "ok" } else { "error" };
        self.scheduler_ticks.with_label_values(&[result]).inc();
        self.tick_duration.observe(duration_secs);
    }

    /// Encode all metrics in the Prometheus text format
    pub fn render(&self) -> Result<String> {
        if let Some(memory) = memory_usage() {
            self.memory_bytes.set(memory as f64);
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }

    /// Serve `/metrics` on 127.0.0.1 until `shutdown` flips to true
    pub async fn serve(
        self: Arc<Self>,
        port: u16,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>> {
        let addr = format!("127.0.0.1:{}", port);
        let listener = TcpListener::bind(&addr).await?;
        info!("Metrics server listening on http://{}/metrics", addr);

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let metrics = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = metrics.handle_request(stream).await {
                                    error!("Error handling metrics request: {}", e);
                                }
                            });
                        }
                        Err(e) => error!("Error accepting connection: {}", e),
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("Metrics server stopped");
                            break;
                        }
                    }
                }
            }
        }))
    }

    async fn handle_request(&self, mut stream: TcpStream) -> Result<()> {
        let mut buffer = [0; 1024];
        let n = stream.read(&mut buffer).await?;
        let request = String::from_utf8_lossy(&buffer[..n]);

        let response = if request.starts_with("GET /metrics") {
            let body = self.render()?;
            format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            )
        } else {
            "HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nNot Found".to_string()
        };

        stream.write_all(response.as_bytes()).await?;
        Ok(())
    }
}

/// Resident set size high-water mark in bytes
#[cfg(any(target_os = "linux", target_os = "macos"))]
fn memory_usage() -> Option<u64> {
    // SAFETY: getrusage only writes into the zeroed struct we own
    let info = unsafe {
        let mut info: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut info) != 0 {
            return None;
        }
        info
    };

    // ru_maxrss is kilobytes on Linux, bytes on macOS
    let scale = if cfg!(target_os = "linux") { 1024 } else { 1 };
    Some(info.ru_maxrss as u64 * scale)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn memory_usage() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_recorded_metrics() {
        let metrics = Metrics::new().unwrap();
        metrics.record_run_created("etl", "scheduled");
        metrics.record_run_finished("etl", "success");
        metrics.record_task_attempt("etl", "extract", "success", 1.5);
        metrics.record_tick(true, 0.01);
        metrics.set_open_runs(2);

        let text = metrics.render().unwrap();
        assert!(text.contains("tributary_runs_created_total{"));
        assert!(text.contains("workflow=\"etl\""));
        assert!(text.contains("tributary_task_duration_seconds_count"));
        assert!(text.contains("tributary_open_runs 2"));
    }

    #[test]
    fn test_running_gauge() {
        let metrics = Metrics::new().unwrap();
        metrics.inc_running_tasks();
        metrics.inc_running_tasks();
        metrics.dec_running_tasks();
        assert!(metrics.render().unwrap().contains("tributary_running_tasks 1"));
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn test_memory_usage() {
        assert!(memory_usage().unwrap_or(0) > 0);
    }

    #[tokio::test]
    async fn test_serve_metrics_endpoint() {
        let metrics = Arc::new(Metrics::new().unwrap());
        metrics.record_run_created("etl", "manual");

        // Pick a free port
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let (tx, rx) = watch::channel(false);
        let handle = Arc::clone(&metrics).serve(port, rx).await.unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(b"GET /metrics HTTP/1.1\r\n\r\n").await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("tributary_runs_created_total"));

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
