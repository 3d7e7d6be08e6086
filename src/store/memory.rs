//! In-process job store with the same semantics as the Redis store.
//!
//! Connections opened from one [`MemoryStore`] share state, so queues,
//! workers and inspection tools see the same jobs, as they would with a
//! shared Redis server. Nothing survives the process.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use super::record::{FailOutcome, JobRecord, JobState};
use super::{JobCounts, JobStore, Reservation, StalledJob, StoreConnector};
use crate::error::StoreError;
use crate::jobs::JobOptions;

#[derive(Debug)]
struct Lease {
    worker_id: String,
    expires_at: i64,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    jobs: HashMap<String, JobRecord>,
    wait: VecDeque<String>,
    /// (ready at, job id)
    delayed: Vec<(i64, String)>,
    active: HashMap<String, Lease>,
    failed: Vec<String>,
    paused: bool,
}

impl QueueState {
    fn detach(&mut self, job_id: &str) {
        self.wait.retain(|id| id != job_id);
        self.delayed.retain(|(_, id)| id != job_id);
        self.active.remove(job_id);
        self.failed.retain(|id| id != job_id);
    }

    fn check_lease(&self, queue: &str, job_id: &str, worker_id: &str) -> Result<(), StoreError> {
        match self.active.get(job_id) {
            Some(lease) if lease.worker_id == worker_id => Ok(()),
            _ => Err(StoreError::LeaseLost {
                queue: queue.to_string(),
                job_id: job_id.to_string(),
                worker_id: worker_id.to_string(),
            }),
        }
    }

    fn schedule(&mut self, job_id: String, delay: Duration, now: i64) {
        if delay.is_zero() {
            self.wait.push_back(job_id);
        } else {
            self.delayed.push((now + delay.as_millis() as i64, job_id));
        }
    }

    fn promote_delayed(&mut self, now: i64) {
        let mut due: Vec<(i64, String)> = Vec::new();
        self.delayed.retain(|(ready_at, id)| {
            if *ready_at <= now {
                due.push((*ready_at, id.clone()));
                false
            } else {
                true
            }
        });
        due.sort();
        for (_, id) in due {
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Waiting;
            }
            self.wait.push_back(id);
        }
    }
}

#[derive(Debug, Default)]
struct Backend {
    queues: Mutex<HashMap<String, QueueState>>,
}

/// Shared in-memory job store. Cloning shares the underlying state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    backend: Arc<Backend>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StoreConnector for MemoryStore {
    async fn connect(&self) -> Result<Arc<dyn JobStore>, StoreError> {
        Ok(Arc::new(MemoryConnection {
            backend: Arc::clone(&self.backend),
            connected: AtomicBool::new(true),
        }))
    }
}

/// One connection to a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryConnection {
    backend: Arc<Backend>,
    connected: AtomicBool,
}

impl MemoryConnection {
    fn queues(&self) -> Result<MutexGuard<'_, HashMap<String, QueueState>>, StoreError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(StoreError::Disconnected);
        }
        Ok(self
            .backend
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn missing(queue: &str, job_id: &str) -> StoreError {
    StoreError::MissingJob {
        queue: queue.to_string(),
        job_id: job_id.to_string(),
    }
}

#[async_trait]
impl JobStore for MemoryConnection {
    async fn add(
        &self,
        queue: &str,
        data: serde_json::Value,
        opts: &JobOptions,
    ) -> Result<JobRecord, StoreError> {
        let mut queues = self.queues()?;
        let state = queues.entry(queue.to_string()).or_default();
        state.next_id += 1;
        let job = JobRecord::new(state.next_id.to_string(), queue, data, opts.clone());
        state.schedule(job.id.clone(), Duration::from_millis(opts.delay_ms), now_millis());
        state.jobs.insert(job.id.clone(), job.clone());
        debug!(queue, job_id = %job.id, "Added job");
        Ok(job)
    }

    async fn reserve(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Reservation, StoreError> {
        let mut queues = self.queues()?;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(Reservation::Empty);
        };
        if state.paused {
            return Ok(Reservation::Paused);
        }

        let now = now_millis();
        state.promote_delayed(now);

        while let Some(job_id) = state.wait.pop_front() {
            let Some(job) = state.jobs.get_mut(&job_id) else {
                continue;
            };
            job.start();
            let job = job.clone();
            state.active.insert(
                job_id,
                Lease {
                    worker_id: worker_id.to_string(),
                    expires_at: now + lease.as_millis() as i64,
                },
            );
            return Ok(Reservation::Job(job));
        }
        Ok(Reservation::Empty)
    }

    async fn extend_lease(
        &self,
        queue: &str,
        job_id: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let mut queues = self.queues()?;
        let held = queues
            .get_mut(queue)
            .and_then(|state| state.active.get_mut(job_id))
            .filter(|held| held.worker_id == worker_id);
        match held {
            Some(held) => {
                held.expires_at = now_millis() + lease.as_millis() as i64;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn complete(
        &self,
        queue: &str,
        job_id: &str,
        worker_id: &str,
    ) -> Result<(), StoreError> {
        let mut queues = self.queues()?;
        let state = queues.get_mut(queue).ok_or_else(|| missing(queue, job_id))?;
        state.check_lease(queue, job_id, worker_id)?;
        state.detach(job_id);
        state.jobs.remove(job_id);
        Ok(())
    }

    async fn fail(
        &self,
        queue: &str,
        job_id: &str,
        worker_id: &str,
        error: &str,
    ) -> Result<FailOutcome, StoreError> {
        let mut queues = self.queues()?;
        let state = queues.get_mut(queue).ok_or_else(|| missing(queue, job_id))?;
        state.check_lease(queue, job_id, worker_id)?;
        let job = state.jobs.get_mut(job_id).ok_or_else(|| missing(queue, job_id))?;
        let outcome = job.fail(error);

        state.detach(job_id);
        match outcome {
            FailOutcome::Retrying { delay, .. } => {
                state.schedule(job_id.to_string(), delay, now_millis())
            }
            FailOutcome::DeadLettered { .. } => state.failed.push(job_id.to_string()),
        }
        Ok(outcome)
    }

    async fn retry(&self, queue: &str, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let mut queues = self.queues()?;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };
        let Some(job) = state.jobs.get_mut(job_id) else {
            return Ok(None);
        };
        if job.state != JobState::Failed {
            return Err(StoreError::NotRetryable {
                job_id: job_id.to_string(),
                state: job.state.to_string(),
            });
        }
        job.revive();
        let job = job.clone();
        state.detach(job_id);
        state.wait.push_back(job_id.to_string());
        Ok(Some(job))
    }

    async fn get(&self, queue: &str, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let queues = self.queues()?;
        Ok(queues.get(queue).and_then(|s| s.jobs.get(job_id)).cloned())
    }

    async fn failed(&self, queue: &str) -> Result<Vec<JobRecord>, StoreError> {
        let queues = self.queues()?;
        let Some(state) = queues.get(queue) else {
            return Ok(Vec::new());
        };
        Ok(state
            .failed
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .cloned()
            .collect())
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts, StoreError> {
        let queues = self.queues()?;
        Ok(queues
            .get(queue)
            .map(|s| JobCounts {
                waiting: s.wait.len(),
                delayed: s.delayed.len(),
                active: s.active.len(),
                failed: s.failed.len(),
            })
            .unwrap_or_default())
    }

    async fn pause(&self, queue: &str) -> Result<(), StoreError> {
        let mut queues = self.queues()?;
        queues.entry(queue.to_string()).or_default().paused = true;
        Ok(())
    }

    async fn resume(&self, queue: &str) -> Result<(), StoreError> {
        let mut queues = self.queues()?;
        queues.entry(queue.to_string()).or_default().paused = false;
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, StoreError> {
        let queues = self.queues()?;
        Ok(queues.get(queue).map(|s| s.paused).unwrap_or(false))
    }

    async fn recover_stalled(
        &self,
        queue: &str,
        max_stalled: u32,
    ) -> Result<Vec<StalledJob>, StoreError> {
        let mut queues = self.queues()?;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let now = now_millis();
        let expired: Vec<String> = state
            .active
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut stalled = Vec::with_capacity(expired.len());
        for job_id in expired {
            state.active.remove(&job_id);
            let Some(job) = state.jobs.get_mut(&job_id) else {
                continue;
            };
            let dead_lettered = job.stall(max_stalled);
            if dead_lettered {
                state.failed.push(job_id.clone());
            } else {
                state.wait.push_front(job_id.clone());
            }
            stalled.push(StalledJob {
                id: job_id,
                dead_lettered,
            });
        }
        Ok(stalled)
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }
}
