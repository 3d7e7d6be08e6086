//! Events emitted by queues, workers and jobs.

use serde_json::json;

use crate::observability::{Event, EventSeverity};

const QUEUE_SCOPE: &str = "job-service:queue";
const WORKER_SCOPE: &str = "job-service:worker";
const JOB_SCOPE: &str = "job-service:job";

/// Queue-level transitions.
#[derive(Debug, Clone)]
pub(crate) enum QueueEvent {
    Added,
    Paused,
    Resumed,
    Closed,
    Error { error: String },
}

/// Worker-level transitions, including the jobs a worker processes.
#[derive(Debug, Clone)]
pub(crate) enum WorkerEvent {
    Ready,
    Started {
        job_id: String,
    },
    Completed {
        job_id: String,
    },
    JobFailed {
        job_id: String,
        error: String,
        attempts_made: u32,
        dead_lettered: bool,
    },
    /// A failure that could not be recorded against a job.
    Failed {
        error: String,
    },
    Stalled {
        job_id: String,
        dead_lettered: bool,
    },
    Paused,
    Resumed,
    Closed,
    Error {
        error: String,
    },
}

pub(crate) fn queue_event(queue: &str, event: &QueueEvent) -> Event {
    let (name, severity, data) = match event {
        QueueEvent::Added => (
            "job-service.queue.added",
            EventSeverity::Info,
            json!({
                "queueName": queue,
                "message": format!("Queue with name '{}' has been added", queue),
            }),
        ),
        QueueEvent::Paused => (
            "job-service.queue.paused",
            EventSeverity::Info,
            json!({
                "queueName": queue,
                "message": format!("Queue '{}' has been paused", queue),
            }),
        ),
        QueueEvent::Resumed => (
            "job-service.queue.resumed",
            EventSeverity::Info,
            json!({
                "queueName": queue,
                "message": format!("Queue '{}' has been resumed", queue),
            }),
        ),
        QueueEvent::Closed => (
            "job-service.queue.closed",
            EventSeverity::Info,
            json!({
                "queueName": queue,
                "message": format!("Queue '{}' has been closed", queue),
            }),
        ),
        QueueEvent::Error { error } => (
            "job-service.queue.error",
            EventSeverity::Error,
            json!({
                "queueName": queue,
                "error": error,
                "message": format!("Queue '{}' has failed with error '{}'", queue, error),
            }),
        ),
    };
    Event::new(name, severity, QUEUE_SCOPE, data)
}

pub(crate) fn worker_event(queue: &str, worker_id: &str, event: &WorkerEvent) -> Event {
    let (name, scope, severity, data) = match event {
        WorkerEvent::Ready => (
            "job-service.worker.ready",
            WORKER_SCOPE,
            EventSeverity::Info,
            json!({
                "queueName": queue,
                "workerId": worker_id,
                "message": format!(
                    "Worker {} for queue '{}' is ready to process jobs",
                    worker_id, queue
                ),
            }),
        ),
        WorkerEvent::Started { job_id } => (
            "job-service.worker.started",
            WORKER_SCOPE,
            EventSeverity::Info,
            json!({
                "queueName": queue,
                "workerId": worker_id,
                "jobId": job_id,
                "message": format!("Job {} in queue '{}' has been started", job_id, queue),
            }),
        ),
        WorkerEvent::Completed { job_id } => (
            "job-service.job.completed",
            JOB_SCOPE,
            EventSeverity::Info,
            json!({
                "queueName": queue,
                "workerId": worker_id,
                "jobId": job_id,
                "message": format!("Job {} in queue '{}' has been completed", job_id, queue),
            }),
        ),
        WorkerEvent::JobFailed {
            job_id,
            error,
            attempts_made,
            dead_lettered,
        } => (
            "job-service.job.failed",
            JOB_SCOPE,
            EventSeverity::Error,
            json!({
                "queueName": queue,
                "workerId": worker_id,
                "jobId": job_id,
                "error": error,
                "attemptsMade": attempts_made,
                "deadLettered": dead_lettered,
                "message": format!(
                    "Job {} in queue '{}' has failed with error '{}'",
                    job_id, queue, error
                ),
            }),
        ),
        WorkerEvent::Failed { error } => (
            "job-service.worker.failed",
            WORKER_SCOPE,
            EventSeverity::Error,
            json!({
                "queueName": queue,
                "workerId": worker_id,
                "error": error,
                "message": format!(
                    "Worker {} for queue '{}' has failed with error '{}'",
                    worker_id, queue, error
                ),
            }),
        ),
        WorkerEvent::Stalled {
            job_id,
            dead_lettered,
        } => (
            "job-service.worker.stalled",
            WORKER_SCOPE,
            EventSeverity::Warn,
            json!({
                "queueName": queue,
                "workerId": worker_id,
                "jobId": job_id,
                "deadLettered": dead_lettered,
                "message": format!("Job {} in queue '{}' has been stalled", job_id, queue),
            }),
        ),
        WorkerEvent::Paused => (
            "job-service.worker.paused",
            WORKER_SCOPE,
            EventSeverity::Warn,
            json!({
                "queueName": queue,
                "workerId": worker_id,
                "message": format!("Worker {} for queue '{}' has been paused", worker_id, queue),
            }),
        ),
        WorkerEvent::Resumed => (
            "job-service.worker.resumed",
            WORKER_SCOPE,
            EventSeverity::Info,
            json!({
                "queueName": queue,
                "workerId": worker_id,
                "message": format!("Worker {} for queue '{}' has been resumed", worker_id, queue),
            }),
        ),
        WorkerEvent::Closed => (
            "job-service.worker.closed",
            WORKER_SCOPE,
            EventSeverity::Info,
            json!({
                "queueName": queue,
                "workerId": worker_id,
                "message": format!("Worker {} for queue '{}' has been closed", worker_id, queue),
            }),
        ),
        WorkerEvent::Error { error } => (
            "job-service.worker.error",
            WORKER_SCOPE,
            EventSeverity::Error,
            json!({
                "queueName": queue,
                "workerId": worker_id,
                "error": error,
                "message": format!(
                    "Worker {} for queue '{}' has failed with error '{}'",
                    worker_id, queue, error
                ),
            }),
        ),
    };
    Event::new(name, severity, scope, data)
}

pub(crate) fn job_added(queue: &str, job_id: &str, data: &serde_json::Value) -> Event {
    Event::new(
        "job-service.job.added",
        EventSeverity::Info,
        JOB_SCOPE,
        json!({
            "jobId": job_id,
            "queueName": queue,
            "message": format!("Job {} added to queue '{}'", job_id, queue),
            "data": data,
        }),
    )
}

pub(crate) fn job_retry(queue: &str, job_id: &str, data: &serde_json::Value) -> Event {
    Event::new(
        "job-service.job.retry",
        EventSeverity::Info,
        JOB_SCOPE,
        json!({
            "queueName": queue,
            "jobId": job_id,
            "data": data,
            "message": format!("Job with job id: {} is being retried", job_id),
        }),
    )
}

pub(crate) fn failed_jobs_read(queue: &str, job_ids: &[String]) -> Event {
    Event::new(
        "job-service.queue.jobs.failed.read",
        EventSeverity::Trace,
        QUEUE_SCOPE,
        json!({
            "queueName": queue,
            "failedJobs": job_ids,
            "message": format!("Failed jobs have been read for queue with name: '{}'", queue),
        }),
    )
}
