//! Persisted job records and their state transitions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jobs::{FailedJobEntry, JobEntry, JobOptions};

/// Reason recorded when a job exceeds its stalled budget.
pub const STALLED_REASON: &str = "job stalled more than allowable limit";

/// A job as stored in the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    /// Store-assigned identifier, unique within the queue.
    pub id: String,

    /// Name of the queue the job belongs to.
    pub queue: String,

    /// Serialized payload.
    pub data: serde_json::Value,

    /// Retry options captured when the job was added.
    pub opts: JobOptions,

    /// Current state of the job.
    pub state: JobState,

    /// Number of processing attempts that have failed.
    pub attempts_made: u32,

    /// Number of times the job's lease expired while active.
    pub stalled_count: u32,

    /// Failure messages, oldest first, bounded by `opts.stacktrace_limit`.
    pub stacktrace: Vec<String>,

    /// Message of the most recent failure.
    pub failed_reason: Option<String>,

    /// Timestamp when the job was created.
    pub created_at: DateTime<Utc>,

    /// Timestamp when the job was last updated.
    pub updated_at: DateTime<Utc>,

    /// Timestamp when the current attempt started.
    pub processed_at: Option<DateTime<Utc>>,

    /// Timestamp when the job was dead-lettered.
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Creates a new job record in the waiting or delayed state.
    pub fn new(id: String, queue: &str, data: serde_json::Value, opts: JobOptions) -> Self {
        let now = Utc::now();
        let state = if opts.delay_ms > 0 {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        Self {
            id,
            queue: queue.to_string(),
            data,
            opts,
            state,
            attempts_made: 0,
            stalled_count: 0,
            stacktrace: Vec::new(),
            failed_reason: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
            finished_at: None,
        }
    }

    /// Marks the job as leased by a worker.
    pub fn start(&mut self) {
        self.state = JobState::Active;
        self.processed_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }

    /// Records a failed attempt and decides what happens next.
    pub fn fail(&mut self, error: &str) -> FailOutcome {
        self.attempts_made += 1;
        self.push_failure(error);

        if self.attempts_made < self.opts.attempts {
            let delay = self.opts.retry_delay(self.attempts_made);
            self.state = if delay.is_zero() {
                JobState::Waiting
            } else {
                JobState::Delayed
            };
            FailOutcome::Retrying {
                attempt: self.attempts_made,
                delay,
            }
        } else {
            self.dead_letter();
            FailOutcome::DeadLettered {
                attempts_made: self.attempts_made,
            }
        }
    }

    /// Records an expired lease. Returns true when the job was dead-lettered
    /// because it stalled more than `max_stalled` times.
    pub fn stall(&mut self, max_stalled: u32) -> bool {
        self.stalled_count += 1;
        self.updated_at = Utc::now();
        if self.stalled_count > max_stalled {
            self.push_failure(STALLED_REASON);
            self.dead_letter();
            true
        } else {
            self.state = JobState::Waiting;
            false
        }
    }

    /// Moves a dead-lettered job back to waiting. Attempt counters are kept.
    pub fn revive(&mut self) {
        self.state = JobState::Waiting;
        self.updated_at = Utc::now();
        self.failed_reason = None;
        self.finished_at = None;
        self.processed_at = None;
    }

    /// Returns the caller-facing entry for this job.
    pub fn entry<T: serde::de::DeserializeOwned>(&self) -> Result<JobEntry<T>, serde_json::Error> {
        Ok(JobEntry {
            id: self.id.clone(),
            data: serde_json::from_value(self.data.clone())?,
        })
    }

    /// Returns the dead-letter view of this job.
    pub fn failed_entry<T: serde::de::DeserializeOwned>(
        &self,
    ) -> Result<FailedJobEntry<T>, serde_json::Error> {
        Ok(FailedJobEntry {
            id: self.id.clone(),
            data: serde_json::from_value(self.data.clone())?,
            stacktrace: self.stacktrace.clone(),
            attempts_made: self.attempts_made,
            attempts_allowed: self.opts.attempts,
        })
    }

    fn push_failure(&mut self, error: &str) {
        self.stacktrace.push(error.to_string());
        let limit = self.opts.stacktrace_limit;
        if self.stacktrace.len() > limit {
            let excess = self.stacktrace.len() - limit;
            self.stacktrace.drain(..excess);
        }
        self.failed_reason = Some(error.to_string());
        self.updated_at = Utc::now();
    }

    fn dead_letter(&mut self) {
        self.state = JobState::Failed;
        self.finished_at = Some(Utc::now());
    }
}

/// State of a stored job. Completed jobs are removed from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to be reserved by a worker.
    Waiting,
    /// Waiting for its delay or backoff to elapse.
    Delayed,
    /// Leased by a worker.
    Active,
    /// Dead-lettered after exhausting its attempts.
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Delayed => write!(f, "delayed"),
            Self::Active => write!(f, "active"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// What the store did with a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The job will be attempted again after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// The job was moved to the dead-letter view.
    DeadLettered { attempts_made: u32 },
}
