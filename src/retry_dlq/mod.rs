//! Retry and dead-letter queues per failure domain.
//!
//! Each configured domain gets one retry queue on the job service, named
//! after its [`FailureDomain`]. The store enforces the domain's attempt
//! budget and backoff; jobs that exhaust it land in the queue's
//! dead-letter view, where they can be listed and revived.

pub mod identifier;

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::model::{DomainConfig, JobServiceSettings};
use crate::error::{HandlerError, JobError};
use crate::job_service::{job_handler, JobHandler, JobService, QueueConfig};
use crate::jobs::{Backoff, FailedJobEntry, JobEntry, JobOptions};
use crate::observability::ObservabilityService;

pub use identifier::{consumer_queue_name, producer_queue_name, FailureDomain};

/// What a domain handler can reach while processing a retry.
#[derive(Clone)]
pub struct Dependencies {
    pub observability: Arc<dyn ObservabilityService>,
    pub job_service: JobService,
}

impl Dependencies {
    /// Dependencies sharing the job service's sink.
    pub fn new(job_service: JobService) -> Self {
        Self {
            observability: job_service.observability(),
            job_service,
        }
    }
}

/// Processes one retried payload of a domain.
pub type RetryHandler<T> =
    Arc<dyn Fn(Dependencies, T) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Wraps an async closure as a [`RetryHandler`].
pub fn retry_handler<T, F, Fut>(f: F) -> RetryHandler<T>
where
    T: 'static,
    F: Fn(Dependencies, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(
        move |deps: Dependencies, data: T| -> BoxFuture<'static, Result<(), HandlerError>> {
            Box::pin(f(deps, data))
        },
    )
}

/// One retry/dead-letter domain.
pub struct RetryDlqConfig<T> {
    /// Which consumer or producer the domain covers.
    pub identifier: FailureDomain,

    /// Total attempts before a job is dead-lettered.
    pub attempts: u32,

    /// Wait before a new job becomes available.
    pub delay: Option<Duration>,

    /// Delay policy between attempts.
    pub backoff: Option<Backoff>,

    /// Number of workers on the retry queue.
    pub workers: usize,

    /// Failure messages kept per job.
    pub stacktrace_limit: usize,

    pub handler: RetryHandler<T>,
}

impl<T> Clone for RetryDlqConfig<T> {
    fn clone(&self) -> Self {
        Self {
            identifier: self.identifier.clone(),
            attempts: self.attempts,
            delay: self.delay,
            backoff: self.backoff,
            workers: self.workers,
            stacktrace_limit: self.stacktrace_limit,
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<T> RetryDlqConfig<T> {
    pub fn new(identifier: FailureDomain, attempts: u32, handler: RetryHandler<T>) -> Self {
        Self {
            identifier,
            attempts,
            delay: None,
            backoff: None,
            workers: 1,
            stacktrace_limit: JobOptions::default().stacktrace_limit,
            handler,
        }
    }

    /// Builds a domain from its YAML settings. Worker count and stacktrace
    /// limit come from the job service section.
    pub fn from_domain(
        domain: &DomainConfig,
        settings: &JobServiceSettings,
        handler: RetryHandler<T>,
    ) -> Self {
        Self {
            identifier: domain.identifier.clone(),
            attempts: domain.attempts,
            delay: domain.delay_ms.map(Duration::from_millis),
            backoff: domain.backoff,
            workers: settings.num_workers,
            stacktrace_limit: settings.stacktrace_limit,
            handler,
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn stacktrace_limit(mut self, limit: usize) -> Self {
        self.stacktrace_limit = limit;
        self
    }

    /// Options the store enforces for every job of the domain.
    pub fn job_options(&self) -> JobOptions {
        let mut options = JobOptions::with_attempts(self.attempts);
        if let Some(delay) = self.delay {
            options = options.delay(delay);
        }
        if let Some(backoff) = self.backoff {
            options = options.backoff(backoff);
        }
        options.stacktrace_limit = self.stacktrace_limit;
        options
    }
}

/// A domain waiting to be registered.
struct Registration {
    domain: String,
    queue: QueueConfig,
    handler: JobHandler<serde_json::Value>,
}

/// Collects domains with different payload types before registering them.
pub struct RetryDlqServiceBuilder {
    deps: Dependencies,
    registrations: Vec<Registration>,
}

impl RetryDlqServiceBuilder {
    /// Adds a domain. Payloads are decoded as `T` before reaching the handler.
    pub fn domain<T>(mut self, name: impl Into<String>, config: RetryDlqConfig<T>) -> Self
    where
        T: DeserializeOwned + Send + 'static,
    {
        let queue = QueueConfig::new(config.identifier.queue_name())
            .workers(config.workers)
            .job_options(config.job_options());

        let deps = self.deps.clone();
        let handler = Arc::clone(&config.handler);
        let handler = job_handler(move |value: serde_json::Value| {
            let deps = deps.clone();
            let handler = Arc::clone(&handler);
            async move {
                let data: T = serde_json::from_value(value)
                    .context("retry payload does not match the domain handler")?;
                handler(deps, data).await
            }
        });

        self.registrations.push(Registration {
            domain: name.into(),
            queue,
            handler,
        });
        self
    }

    /// Registers one retry queue per domain. If any registration fails the
    /// queues already added are stopped again.
    pub async fn build(self) -> Result<RetryDlqService, JobError> {
        let service = RetryDlqService {
            deps: self.deps,
            queues: Mutex::new(BTreeSet::new()),
        };

        for registration in self.registrations {
            let queue_name = registration.queue.name.clone();
            let added = service
                .deps
                .job_service
                .add_queue(registration.queue, registration.handler)
                .await;

            match added {
                Ok(_) => {
                    info!(domain = %registration.domain, queue = %queue_name, "Retry queue registered");
                    service.tracked().insert(queue_name);
                }
                Err(e) => {
                    warn!(domain = %registration.domain, queue = %queue_name, error = %e, "Failed to register retry queue");
                    if let Err(stop_error) = service.stop().await {
                        warn!(error = %stop_error, "Failed to roll back retry queues");
                    }
                    return Err(e);
                }
            }
        }

        Ok(service)
    }
}

/// Domain-scoped retry and dead-letter operations over a [`JobService`].
pub struct RetryDlqService {
    deps: Dependencies,
    queues: Mutex<BTreeSet<String>>,
}

impl RetryDlqService {
    /// Starts collecting domains.
    pub fn builder(deps: Dependencies) -> RetryDlqServiceBuilder {
        RetryDlqServiceBuilder {
            deps,
            registrations: Vec::new(),
        }
    }

    /// Registers every domain of a single payload type.
    pub async fn new<T>(
        deps: Dependencies,
        configs: HashMap<String, RetryDlqConfig<T>>,
    ) -> Result<Self, JobError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let mut configs: Vec<_> = configs.into_iter().collect();
        configs.sort_by(|a, b| a.0.cmp(&b.0));

        configs
            .into_iter()
            .fold(Self::builder(deps), |builder, (name, config)| {
                builder.domain(name, config)
            })
            .build()
            .await
    }

    /// Retry queues this service registered, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        self.tracked().iter().cloned().collect()
    }

    /// Starts the underlying job service.
    pub async fn start(&self) -> Result<bool, JobError> {
        self.deps.job_service.start().await
    }

    /// Stops this service's queues only; the job service may carry others.
    pub async fn stop(&self) -> Result<bool, JobError> {
        for queue in self.queue_names() {
            match self.deps.job_service.stop_queue(&queue).await {
                Ok(_) | Err(JobError::QueueNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
            self.tracked().remove(&queue);
        }
        Ok(true)
    }

    pub async fn pause(&self) -> Result<bool, JobError> {
        for queue in self.queue_names() {
            self.deps.job_service.pause_queue(&queue).await?;
        }
        Ok(true)
    }

    pub async fn resume(&self) -> Result<bool, JobError> {
        for queue in self.queue_names() {
            self.deps.job_service.resume_queue(&queue).await?;
        }
        Ok(true)
    }

    pub async fn enqueue_consumer_retry<T: Serialize>(
        &self,
        topic: &str,
        consumer_group: &str,
        data: T,
    ) -> Result<JobEntry<T>, JobError> {
        self.deps
            .job_service
            .enqueue_job(&consumer_queue_name(topic, consumer_group), data)
            .await
    }

    pub async fn enqueue_producer_retry<T: Serialize>(
        &self,
        producer: &str,
        data: T,
    ) -> Result<JobEntry<T>, JobError> {
        self.deps
            .job_service
            .enqueue_job(&producer_queue_name(producer), data)
            .await
    }

    pub async fn get_consumer_dlq<T: DeserializeOwned>(
        &self,
        topic: &str,
        consumer_group: &str,
    ) -> Result<Vec<FailedJobEntry<T>>, JobError> {
        self.deps
            .job_service
            .get_failed_jobs(&consumer_queue_name(topic, consumer_group))
            .await
    }

    pub async fn get_producer_dlq<T: DeserializeOwned>(
        &self,
        producer: &str,
    ) -> Result<Vec<FailedJobEntry<T>>, JobError> {
        self.deps
            .job_service
            .get_failed_jobs(&producer_queue_name(producer))
            .await
    }

    /// Resubmits a dead-lettered job. Success means the job is queued again,
    /// not that it has been processed.
    pub async fn revive_consumer_dlq<T: DeserializeOwned>(
        &self,
        topic: &str,
        consumer_group: &str,
        entry_id: &str,
    ) -> Result<JobEntry<T>, JobError> {
        self.deps
            .job_service
            .retry_job(&consumer_queue_name(topic, consumer_group), entry_id)
            .await
    }

    /// Resubmits a dead-lettered job. Success means the job is queued again,
    /// not that it has been processed.
    pub async fn revive_producer_dlq<T: DeserializeOwned>(
        &self,
        producer: &str,
        entry_id: &str,
    ) -> Result<JobEntry<T>, JobError> {
        self.deps
            .job_service
            .retry_job(&producer_queue_name(producer), entry_id)
            .await
    }

    fn tracked(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::EventBuffer;
    use crate::store::MemoryStore;

    fn deps() -> Dependencies {
        Dependencies::new(JobService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(EventBuffer::new()),
        ))
    }

    fn noop<T: Send + 'static>() -> RetryHandler<T> {
        retry_handler(|_deps: Dependencies, _data: T| async { Ok(()) })
    }

    #[test]
    fn job_options_carry_retry_policy() {
        let config = RetryDlqConfig::new(FailureDomain::producer("p"), 4, noop::<u32>())
            .delay(Duration::from_millis(50))
            .backoff(Backoff::fixed(Duration::from_millis(10)));
        let options = config.job_options();
        assert_eq!(options.attempts, 4);
        assert_eq!(options.delay_ms, 50);
        assert_eq!(options.backoff, Some(Backoff::Fixed { delay_ms: 10 }));
        assert_eq!(options.stacktrace_limit, 10);
    }

    #[test]
    fn domain_settings_reach_the_queue() {
        let yaml = r#"
job_service:
  num_workers: 3
  stacktrace_limit: 2
domains:
  audit:
    identifier:
      producer:
        producer: audit
    attempts: 4
    delay_ms: 25
"#;
        let config: crate::config::model::AppConfig = serde_yaml::from_str(yaml).unwrap();
        let domain = config.domain("audit").unwrap();
        let retry = RetryDlqConfig::from_domain(domain, &config.job_service, noop::<u32>());

        assert_eq!(retry.identifier, FailureDomain::producer("audit"));
        assert_eq!(retry.workers, 3);
        let options = retry.job_options();
        assert_eq!(options.attempts, 4);
        assert_eq!(options.delay_ms, 25);
        assert_eq!(options.stacktrace_limit, 2);
        assert_eq!(options, domain.job_options(2));
    }

    #[tokio::test]
    async fn registers_one_queue_per_domain() {
        let deps = deps();
        let job_service = deps.job_service.clone();
        let service = RetryDlqService::builder(deps)
            .domain(
                "orders",
                RetryDlqConfig::new(FailureDomain::consumer("orders", "billing"), 3, noop::<u32>()),
            )
            .domain(
                "audit",
                RetryDlqConfig::new(FailureDomain::producer("audit"), 1, noop::<String>()),
            )
            .build()
            .await
            .unwrap();

        assert_eq!(
            service.queue_names(),
            vec![
                "retry||consumer||orders||billing".to_string(),
                "retry||producer||audit".to_string(),
            ]
        );

        service.stop().await.unwrap();
        assert!(service.queue_names().is_empty());
        assert!(job_service.queue_names().await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_domain_rolls_back() {
        let deps = deps();
        let job_service = deps.job_service.clone();
        let result = RetryDlqService::builder(deps)
            .domain(
                "a",
                RetryDlqConfig::new(FailureDomain::producer("audit"), 1, noop::<u32>()),
            )
            .domain(
                "b",
                RetryDlqConfig::new(FailureDomain::producer("audit"), 2, noop::<u32>()),
            )
            .build()
            .await;

        assert!(matches!(result, Err(JobError::QueueExists { .. })));
        assert!(job_service.queue_names().await.is_empty());
    }

    #[tokio::test]
    async fn stop_leaves_foreign_queues_alone() {
        let deps = deps();
        let job_service = deps.job_service.clone();
        job_service
            .add_queue(
                QueueConfig::new("other"),
                job_handler(|_: serde_json::Value| async { Ok(()) }),
            )
            .await
            .unwrap();

        let mut configs = HashMap::new();
        configs.insert(
            "audit".to_string(),
            RetryDlqConfig::new(FailureDomain::producer("audit"), 1, noop::<u32>()),
        );
        let service = RetryDlqService::new(deps, configs).await.unwrap();

        service.stop().await.unwrap();
        assert_eq!(job_service.queue_names().await, vec!["other".to_string()]);
        job_service.stop().await.unwrap();
    }
}
