//! Job entries and per-job retry options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A unit of work as seen by callers: the store-assigned id plus the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEntry<T> {
    /// Identifier assigned by the job store.
    pub id: String,

    /// Caller-defined payload.
    pub data: T,
}

/// A job sitting in a queue's dead-letter view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedJobEntry<T> {
    /// Identifier assigned by the job store.
    pub id: String,

    /// Caller-defined payload.
    pub data: T,

    /// Error messages of the failed attempts, oldest first.
    pub stacktrace: Vec<String>,

    /// Number of attempts made so far.
    pub attempts_made: u32,

    /// Number of attempts the queue allows before dead-lettering.
    pub attempts_allowed: u32,
}

/// Delay policy applied between attempts of a failing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    /// Wait the same delay before every retry.
    Fixed { delay_ms: u64 },
    /// Double the delay after every failed attempt.
    Exponential { delay_ms: u64 },
}

impl Backoff {
    /// Fixed backoff with the given delay.
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// Exponential backoff starting from the given base delay.
    pub fn exponential(delay: Duration) -> Self {
        Self::Exponential {
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// Returns the delay before the next attempt, given how many attempts
    /// have been made (including the one that just failed).
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match *self {
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential { delay_ms } => {
                let factor = 2u64.saturating_pow(attempts_made.saturating_sub(1));
                Duration::from_millis(delay_ms.saturating_mul(factor))
            }
        }
    }
}

/// Options the store applies to every job added to a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Total number of attempts before the job is dead-lettered.
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Milliseconds to wait before the job becomes available the first time.
    #[serde(default)]
    pub delay_ms: u64,

    /// Delay policy between attempts. `None` retries immediately.
    #[serde(default)]
    pub backoff: Option<Backoff>,

    /// Number of failure messages kept per job.
    #[serde(default = "default_stacktrace_limit")]
    pub stacktrace_limit: usize,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            delay_ms: 0,
            backoff: None,
            stacktrace_limit: default_stacktrace_limit(),
        }
    }
}

impl JobOptions {
    /// Options allowing `attempts` tries.
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            attempts,
            ..Self::default()
        }
    }

    /// Sets the initial delay.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay_ms = delay.as_millis() as u64;
        self
    }

    /// Sets the backoff policy.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Delay before the next attempt after `attempts_made` failures.
    pub fn retry_delay(&self, attempts_made: u32) -> Duration {
        self.backoff
            .map(|b| b.delay_for(attempts_made))
            .unwrap_or(Duration::ZERO)
    }
}

fn default_attempts() -> u32 {
    1
}

fn default_stacktrace_limit() -> usize {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_is_constant() {
        let backoff = Backoff::fixed(Duration::from_millis(250));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(250));
        assert_eq!(backoff.delay_for(5), Duration::from_millis(250));
    }

    #[test]
    fn exponential_backoff_doubles() {
        let backoff = Backoff::exponential(Duration::from_millis(100));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_backoff_saturates() {
        let backoff = Backoff::exponential(Duration::from_millis(u64::MAX / 2));
        assert_eq!(backoff.delay_for(70), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn no_backoff_retries_immediately() {
        assert_eq!(JobOptions::with_attempts(3).retry_delay(2), Duration::ZERO);
    }

    #[test]
    fn backoff_deserializes_from_tagged_yaml() {
        let backoff: Backoff = serde_yaml::from_str("type: exponential\ndelay_ms: 500").unwrap();
        assert_eq!(backoff, Backoff::Exponential { delay_ms: 500 });
    }
}
