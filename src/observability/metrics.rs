//! Prometheus metrics derived from job service events.

use std::net::SocketAddr;
use std::sync::Arc;

use prometheus::{Gauge, IntCounterVec, Opts, Registry};
use tracing::{error, info};

use super::{Event, ObservabilityService};
use crate::error::MetricsError;

/// Prometheus metrics for queues and jobs.
pub struct Metrics {
    /// Registry for all metrics.
    registry: Registry,
    /// Job transitions by queue and event.
    pub jobs_total: IntCounterVec,
    /// Jobs moved to the dead-letter view, by queue.
    pub dead_lettered_total: IntCounterVec,
    /// Worker and queue errors, by queue.
    pub errors_total: IntCounterVec,
    /// Number of registered queues.
    pub queues: Gauge,
}

impl Metrics {
    /// Creates and registers all metrics.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let jobs_total = IntCounterVec::new(
            Opts::new("retry_dlq_jobs_total", "Job transitions by queue and event"),
            &["queue", "event"],
        )?;
        let dead_lettered_total = IntCounterVec::new(
            Opts::new(
                "retry_dlq_dead_lettered_total",
                "Jobs moved to the dead letter queue",
            ),
            &["queue"],
        )?;
        let errors_total = IntCounterVec::new(
            Opts::new("retry_dlq_errors_total", "Worker and queue errors"),
            &["queue"],
        )?;
        let queues = Gauge::new("retry_dlq_queues", "Number of registered queues")?;

        registry.register(Box::new(jobs_total.clone()))?;
        registry.register(Box::new(dead_lettered_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(queues.clone()))?;

        Ok(Self {
            registry,
            jobs_total,
            dead_lettered_total,
            errors_total,
            queues,
        })
    }

    /// Updates the metrics from one event.
    pub fn record(&self, event: &Event) {
        let queue = event.queue_name().unwrap_or("unknown");
        match event.event_name.as_str() {
            "job-service.queue.added" => self.queues.inc(),
            "job-service.queue.closed" => self.queues.dec(),
            "job-service.job.added" => self.inc_job(queue, "added"),
            "job-service.job.completed" => self.inc_job(queue, "completed"),
            "job-service.job.retry" => self.inc_job(queue, "retry"),
            "job-service.worker.stalled" => {
                self.inc_job(queue, "stalled");
                self.record_dead_letter(queue, event);
            }
            "job-service.job.failed" => {
                self.inc_job(queue, "failed");
                self.record_dead_letter(queue, event);
            }
            "job-service.worker.error"
            | "job-service.worker.failed"
            | "job-service.queue.error" => {
                self.errors_total.with_label_values(&[queue]).inc();
            }
            _ => {}
        }
    }

    fn inc_job(&self, queue: &str, event: &str) {
        self.jobs_total.with_label_values(&[queue, event]).inc();
    }

    fn record_dead_letter(&self, queue: &str, event: &Event) {
        let dead_lettered = event
            .event_data
            .get("deadLettered")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if dead_lettered {
            self.dead_lettered_total.with_label_values(&[queue]).inc();
        }
    }

    /// Returns the metrics in Prometheus text format.
    pub fn gather(&self) -> Result<String, MetricsError> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Server(e.to_string()))
    }
}

/// Records metrics for every event, then forwards it to an inner sink.
pub struct MetricsObservability {
    metrics: Arc<Metrics>,
    inner: Arc<dyn ObservabilityService>,
}

impl MetricsObservability {
    /// Wraps `inner` with metrics recording.
    pub fn new(metrics: Arc<Metrics>, inner: Arc<dyn ObservabilityService>) -> Self {
        Self { metrics, inner }
    }
}

impl ObservabilityService for MetricsObservability {
    fn emit(&self, event: Event) {
        self.metrics.record(&event);
        self.inner.emit(event);
    }
}

/// HTTP server for Prometheus metrics.
pub struct MetricsServer {
    /// Metrics instance.
    metrics: Arc<Metrics>,
    /// Port to listen on.
    port: u16,
}

impl MetricsServer {
    /// Creates a new metrics server.
    pub fn new(metrics: Arc<Metrics>, port: u16) -> Self {
        Self { metrics, port }
    }

    /// Serves `/metrics` until the task is dropped.
    pub async fn start(self) -> Result<(), MetricsError> {
        use http_body_util::Full;
        use hyper::body::Bytes;
        use hyper::server::conn::http1;
        use hyper::service::service_fn;
        use hyper::{body::Incoming, Request, Response, StatusCode};
        use hyper_util::rt::TokioIo;

        let addr: SocketAddr = ([0, 0, 0, 0], self.port).into();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| MetricsError::Server(e.to_string()))?;

        info!(port = self.port, "Starting Prometheus metrics server");

        loop {
            let (stream, _) = listener
                .accept()
                .await
                .map_err(|e| MetricsError::Server(e.to_string()))?;

            let io = TokioIo::new(stream);
            let metrics = self.metrics.clone();

            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| {
                    let metrics = metrics.clone();
                    async move {
                        let mut response = Response::new(Full::new(Bytes::new()));
                        if req.uri().path() != "/metrics" {
                            *response.status_mut() = StatusCode::NOT_FOUND;
                            *response.body_mut() = Full::new(Bytes::from("Not Found"));
                            return Ok::<_, hyper::Error>(response);
                        }
                        match metrics.gather() {
                            Ok(body) => *response.body_mut() = Full::new(Bytes::from(body)),
                            Err(e) => {
                                error!(error = %e, "Failed to encode metrics");
                                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                            }
                        }
                        Ok(response)
                    }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!(error = %e, "Error serving connection");
                }
            });
        }
    }
}
