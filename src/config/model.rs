//! Configuration data structures.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::job_service::WorkerOptions;
use crate::jobs::{Backoff, JobOptions};
use crate::retry_dlq::FailureDomain;

/// Root configuration structure containing all settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Redis connection settings.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Worker pool defaults applied to every queue.
    #[serde(default)]
    pub job_service: JobServiceSettings,

    /// Prometheus metrics settings.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Retry/DLQ domains keyed by domain name.
    #[serde(default)]
    pub domains: BTreeMap<String, DomainConfig>,
}

impl AppConfig {
    /// Looks up a domain by name.
    pub fn domain(&self, name: &str) -> Result<&DomainConfig, ConfigError> {
        self.domains.get(name).ok_or_else(|| ConfigError::UnknownDomain {
            domain: name.to_string(),
        })
    }
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis server hostname.
    #[serde(default = "default_redis_host")]
    pub host: String,

    /// Redis server port.
    #[serde(default = "default_redis_port")]
    pub port: u16,

    /// Redis database number.
    #[serde(default)]
    pub db: u8,

    /// Optional Redis password.
    #[serde(default)]
    pub password: Option<String>,

    /// Prefix for every key written by the store.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl RedisConfig {
    /// Builds the Redis URL.
    pub fn url(&self) -> String {
        match &self.password {
            Some(pass) => format!("redis://:{}@{}:{}/{}", pass, self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
            password: None,
            key_prefix: default_key_prefix(),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobServiceSettings {
    /// Workers started per queue.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Milliseconds an idle worker waits before polling again.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Milliseconds a worker holds the lease on a job.
    #[serde(default = "default_lock_duration_ms")]
    pub lock_duration_ms: u64,

    /// Milliseconds between checks for expired leases.
    #[serde(default = "default_stalled_interval_ms")]
    pub stalled_interval_ms: u64,

    /// Expired leases tolerated before a job is dead-lettered.
    #[serde(default = "default_max_stalled_count")]
    pub max_stalled_count: u32,

    /// Failure messages kept per job.
    #[serde(default = "default_stacktrace_limit")]
    pub stacktrace_limit: usize,
}

impl Default for JobServiceSettings {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            lock_duration_ms: default_lock_duration_ms(),
            stalled_interval_ms: default_stalled_interval_ms(),
            max_stalled_count: default_max_stalled_count(),
            stacktrace_limit: default_stacktrace_limit(),
        }
    }
}

impl JobServiceSettings {
    /// Worker options derived from these settings.
    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            autorun: true,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            lock_duration: Duration::from_millis(self.lock_duration_ms),
            stalled_interval: Duration::from_millis(self.stalled_interval_ms),
            max_stalled_count: self.max_stalled_count,
        }
    }
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether to serve the metrics endpoint.
    #[serde(default)]
    pub enabled: bool,

    /// Port for the metrics HTTP server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

/// Retry policy for one failure domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Which consumer or producer this domain covers.
    pub identifier: FailureDomain,

    /// Total attempts before a job is dead-lettered.
    pub attempts: u32,

    /// Milliseconds before a new job becomes available.
    #[serde(default)]
    pub delay_ms: Option<u64>,

    /// Delay policy between attempts.
    #[serde(default)]
    pub backoff: Option<Backoff>,
}

impl DomainConfig {
    /// Job options enforced by the store for this domain.
    pub fn job_options(&self, stacktrace_limit: usize) -> JobOptions {
        JobOptions {
            attempts: self.attempts,
            delay_ms: self.delay_ms.unwrap_or(0),
            backoff: self.backoff,
            stacktrace_limit,
        }
    }
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_key_prefix() -> String {
    "retry-dlq".to_string()
}

fn default_num_workers() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_lock_duration_ms() -> u64 {
    30_000
}

fn default_stalled_interval_ms() -> u64 {
    30_000
}

fn default_max_stalled_count() -> u32 {
    1
}

fn default_stacktrace_limit() -> usize {
    10
}

fn default_metrics_port() -> u16 {
    9090
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
redis:
  host: cache
  password: hunter2
job_service:
  num_workers: 4
domains:
  orders-consumer:
    identifier:
      consumer:
        topic: orders
        consumer_group: billing
    attempts: 3
    backoff:
      type: exponential
      delay_ms: 1000
  audit-producer:
    identifier:
      producer:
        producer: audit
    attempts: 5
    delay_ms: 200
"#;

    #[test]
    fn parses_domains_and_defaults() {
        let config: AppConfig = serde_yaml::from_str(SAMPLE).unwrap();

        assert_eq!(config.redis.url(), "redis://:hunter2@cache:6379/0");
        assert_eq!(config.redis.key_prefix, "retry-dlq");
        assert_eq!(config.job_service.num_workers, 4);
        assert_eq!(config.job_service.lock_duration_ms, 30_000);
        assert!(!config.metrics.enabled);

        let consumer = config.domain("orders-consumer").unwrap();
        assert_eq!(
            consumer.identifier.queue_name(),
            "retry||consumer||orders||billing"
        );
        assert_eq!(
            consumer.job_options(10).backoff,
            Some(Backoff::Exponential { delay_ms: 1000 })
        );

        let producer = config.domain("audit-producer").unwrap();
        assert_eq!(producer.identifier.queue_name(), "retry||producer||audit");
        assert_eq!(producer.job_options(10).delay_ms, 200);
    }

    #[test]
    fn unknown_domain_is_an_error() {
        let config: AppConfig = serde_yaml::from_str(SAMPLE).unwrap();
        assert!(matches!(
            config.domain("missing"),
            Err(ConfigError::UnknownDomain { .. })
        ));
    }
}
