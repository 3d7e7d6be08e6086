//! Error types for the retry/dead-letter subsystem.

use std::path::PathBuf;
use thiserror::Error;

/// Error returned by a job handler. Handlers may fail for any reason, so
/// this is an opaque `anyhow` error.
pub type HandlerError = anyhow::Error;

/// Job service and retry/DLQ service errors.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("Queue '{queue}' not found")]
    QueueNotFound { queue: String },

    #[error("Queue '{queue}' already exists")]
    QueueExists { queue: String },

    #[error("Queue '{queue}' is closing")]
    QueueClosing { queue: String },

    #[error("Job '{job_id}' not found in queue '{queue}'")]
    JobNotFound { queue: String, job_id: String },

    #[error("Failed to convert job data: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl JobError {
    /// Returns true for the not-found family of errors.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            JobError::QueueNotFound { .. } | JobError::JobNotFound { .. }
        )
    }
}

/// Job store operation errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to connect to Redis at '{url}': {message}")]
    ConnectionFailed { url: String, message: String },

    #[error("Redis command failed: {0}")]
    Command(#[from] redis::RedisError),

    #[error("Failed to serialize job: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job '{job_id}' is missing from queue '{queue}'")]
    MissingJob { queue: String, job_id: String },

    #[error("Worker '{worker_id}' no longer holds the lease on job '{job_id}' in queue '{queue}'")]
    LeaseLost {
        queue: String,
        job_id: String,
        worker_id: String,
    },

    #[error("Job '{job_id}' is {state} and cannot be retried")]
    NotRetryable { job_id: String, state: String },

    #[error("Store connection has been released")]
    Disconnected,
}

/// Configuration loading and parsing errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {message}")]
    ParseFailed { path: PathBuf, message: String },

    #[error("Config validation failed with {error_count} error(s)")]
    ValidationFailed { error_count: usize },

    #[error("Domain '{domain}' is not configured")]
    UnknownDomain { domain: String },
}

/// Metrics export errors.
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Prometheus registry error: {0}")]
    Registry(#[from] prometheus::Error),

    #[error("Metrics server failed: {0}")]
    Server(String),
}
