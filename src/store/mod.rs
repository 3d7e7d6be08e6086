//! Durable job store: enqueue, lease, ack, retry with backoff, dead-letter.
//!
//! The job service never counts attempts itself. Every decision about
//! retries, backoff and dead-lettering is taken by a [`JobStore`], so it
//! survives process restarts when the store is durable.

pub mod memory;
pub mod record;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::jobs::JobOptions;

pub use memory::MemoryStore;
pub use record::{FailOutcome, JobRecord, JobState};
pub use redis::RedisStore;

/// Result of asking the store for the next job.
#[derive(Debug)]
pub enum Reservation {
    /// A job leased to the calling worker.
    Job(JobRecord),
    /// Nothing is ready to run.
    Empty,
    /// The queue is paused; nothing is handed out.
    Paused,
}

/// A job whose lease expired while it was active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledJob {
    /// Job identifier.
    pub id: String,
    /// True when the job was dead-lettered instead of re-queued.
    pub dead_lettered: bool,
}

/// Number of jobs per state in a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub failed: usize,
}

/// A connection to the job store.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Adds a job to the queue and returns its record.
    async fn add(
        &self,
        queue: &str,
        data: serde_json::Value,
        opts: &JobOptions,
    ) -> Result<JobRecord, StoreError>;

    /// Leases the next ready job to `worker_id` for `lease`.
    async fn reserve(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Reservation, StoreError>;

    /// Pushes the lease of an active job `lease` into the future. Returns
    /// false when `worker_id` no longer holds the lease.
    async fn extend_lease(
        &self,
        queue: &str,
        job_id: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool, StoreError>;

    /// Acknowledges a successfully processed job and removes it. Fails with
    /// [`StoreError::LeaseLost`] unless `worker_id` holds the lease.
    async fn complete(&self, queue: &str, job_id: &str, worker_id: &str)
        -> Result<(), StoreError>;

    /// Records a failed attempt. The store decides between retry and
    /// dead-letter. Fails with [`StoreError::LeaseLost`] unless `worker_id`
    /// holds the lease.
    async fn fail(
        &self,
        queue: &str,
        job_id: &str,
        worker_id: &str,
        error: &str,
    ) -> Result<FailOutcome, StoreError>;

    /// Moves a dead-lettered job back to waiting. `None` if the job is unknown.
    async fn retry(&self, queue: &str, job_id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Looks up a job by id.
    async fn get(&self, queue: &str, job_id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Returns the dead-lettered jobs of the queue, oldest first.
    async fn failed(&self, queue: &str) -> Result<Vec<JobRecord>, StoreError>;

    /// Returns the number of jobs in each state.
    async fn counts(&self, queue: &str) -> Result<JobCounts, StoreError>;

    /// Stops handing out jobs for the queue.
    async fn pause(&self, queue: &str) -> Result<(), StoreError>;

    /// Resumes handing out jobs for the queue.
    async fn resume(&self, queue: &str) -> Result<(), StoreError>;

    /// Returns true if the queue is paused.
    async fn is_paused(&self, queue: &str) -> Result<bool, StoreError>;

    /// Re-queues jobs whose lease expired. Jobs stalled more than
    /// `max_stalled` times are dead-lettered.
    async fn recover_stalled(
        &self,
        queue: &str,
        max_stalled: u32,
    ) -> Result<Vec<StalledJob>, StoreError>;

    /// Releases the connection. Further calls fail with [`StoreError::Disconnected`].
    async fn disconnect(&self) -> Result<(), StoreError>;
}

/// Opens store connections. The job service opens one per queue and one
/// per worker.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// Opens a new connection.
    async fn connect(&self) -> Result<Arc<dyn JobStore>, StoreError>;
}
