//! Named job queues with worker pools over a shared [`JobStore`].
//!
//! The service keeps a registry of queues. Each queue owns one store
//! connection for producer-side operations and a pool of workers, each
//! with its own connection. Retry counting, backoff and dead-lettering
//! are delegated to the store.

mod events;
pub mod worker;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use self::events::QueueEvent;
use self::worker::{WorkerContext, WorkerSlot};
use crate::error::{HandlerError, JobError, StoreError};
use crate::jobs::{FailedJobEntry, JobEntry, JobOptions};
use crate::observability::ObservabilityService;
use crate::store::{JobCounts, JobStore, StoreConnector};

pub use self::worker::{WorkerCommand, WorkerHandle, WorkerOptions, WorkerState};

/// Processes one job payload. Returning an error fails the attempt.
pub type JobHandler<T> =
    Arc<dyn Fn(T) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Wraps an async closure as a [`JobHandler`].
pub fn job_handler<T, F, Fut>(f: F) -> JobHandler<T>
where
    T: 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |data: T| -> BoxFuture<'static, Result<(), HandlerError>> {
        Box::pin(f(data))
    })
}

/// Erases the payload type: the worker hands the handler raw JSON, which
/// is decoded here. A payload that does not decode fails the attempt.
fn erase<T>(handler: JobHandler<T>) -> JobHandler<serde_json::Value>
where
    T: DeserializeOwned + Send + 'static,
{
    Arc::new(
        move |value: serde_json::Value| -> BoxFuture<'static, Result<(), HandlerError>> {
            match serde_json::from_value::<T>(value) {
                Ok(data) => handler(data),
                Err(e) => Box::pin(async move {
                    Err(anyhow::Error::new(e)
                        .context("job payload does not match the queue handler"))
                }),
            }
        },
    )
}

/// Settings for a new queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Unique queue name.
    pub name: String,

    /// Number of workers. Values below 1 are raised to 1.
    pub num_workers: usize,

    /// Options applied to every job added to the queue.
    pub job_options: JobOptions,

    /// Worker tuning. `None` uses the service defaults.
    pub worker_options: Option<WorkerOptions>,
}

impl QueueConfig {
    /// A queue with one worker and default options.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            num_workers: 1,
            job_options: JobOptions::default(),
            worker_options: None,
        }
    }

    /// Sets the number of workers.
    pub fn workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Sets the job options.
    pub fn job_options(mut self, job_options: JobOptions) -> Self {
        self.job_options = job_options;
        self
    }

    /// Sets the worker options.
    pub fn worker_options(mut self, worker_options: WorkerOptions) -> Self {
        self.worker_options = Some(worker_options);
        self
    }
}

/// Producer-side view of a registered queue.
#[derive(Clone)]
pub struct QueueHandle {
    name: String,
    store: Arc<dyn JobStore>,
}

impl QueueHandle {
    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if the queue is paused.
    pub async fn is_paused(&self) -> Result<bool, JobError> {
        Ok(self.store.is_paused(&self.name).await?)
    }

    /// Number of jobs per state.
    pub async fn counts(&self) -> Result<JobCounts, JobError> {
        Ok(self.store.counts(&self.name).await?)
    }
}

impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle").field("name", &self.name).finish()
    }
}

/// What [`JobService::add_queue`] created.
#[derive(Debug, Clone)]
pub struct AddQueueResult {
    pub queue: QueueHandle,
    pub workers: Vec<WorkerHandle>,
}

/// Registry entry for one queue.
struct RegisteredQueue {
    store: Arc<dyn JobStore>,
    options: JobOptions,
    workers: Vec<WorkerSlot>,
    wakeup: Arc<Notify>,
    closing: bool,
}

/// Pause or resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueControl {
    Pause,
    Resume,
}

struct Inner {
    connector: Arc<dyn StoreConnector>,
    observability: Arc<dyn ObservabilityService>,
    worker_defaults: WorkerOptions,
    queues: Mutex<HashMap<String, RegisteredQueue>>,
}

/// Manages named queues and their workers. Cloning shares the registry.
#[derive(Clone)]
pub struct JobService {
    inner: Arc<Inner>,
}

impl JobService {
    /// Creates a service with default worker options.
    pub fn new(
        connector: Arc<dyn StoreConnector>,
        observability: Arc<dyn ObservabilityService>,
    ) -> Self {
        Self::with_worker_defaults(connector, observability, WorkerOptions::default())
    }

    /// Creates a service whose queues use `worker_defaults` unless they
    /// bring their own worker options.
    pub fn with_worker_defaults(
        connector: Arc<dyn StoreConnector>,
        observability: Arc<dyn ObservabilityService>,
        worker_defaults: WorkerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                observability,
                worker_defaults,
                queues: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The sink this service emits to.
    pub fn observability(&self) -> Arc<dyn ObservabilityService> {
        Arc::clone(&self.inner.observability)
    }

    /// Names of the registered queues, sorted.
    pub async fn queue_names(&self) -> Vec<String> {
        let queues = self.inner.queues.lock().await;
        let mut names: Vec<String> = queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Tells every idle worker to start processing.
    pub async fn start(&self) -> Result<bool, JobError> {
        let queues = self.inner.queues.lock().await;
        for queue in queues.values().filter(|q| !q.closing) {
            for slot in &queue.workers {
                slot.run();
            }
        }
        Ok(true)
    }

    /// Pauses every queue that is not already paused.
    pub async fn pause(&self) -> Result<bool, JobError> {
        for name in self.queue_names().await {
            self.control(&name, QueueControl::Pause, true).await?;
        }
        Ok(true)
    }

    /// Resumes every paused queue.
    pub async fn resume(&self) -> Result<bool, JobError> {
        for name in self.queue_names().await {
            self.control(&name, QueueControl::Resume, true).await?;
        }
        Ok(true)
    }

    /// Stops every queue and its workers.
    pub async fn stop(&self) -> Result<bool, JobError> {
        for name in self.queue_names().await {
            match self.stop_queue(&name).await {
                Ok(_) => {}
                // Another caller is already closing it.
                Err(JobError::QueueNotFound { .. }) | Err(JobError::QueueClosing { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Registers a queue and spawns its workers.
    pub async fn add_queue<T>(
        &self,
        config: QueueConfig,
        handler: JobHandler<T>,
    ) -> Result<AddQueueResult, JobError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let name = config.name.clone();
        if self.inner.queues.lock().await.contains_key(&name) {
            return Err(JobError::QueueExists { queue: name });
        }

        let num_workers = config.num_workers.max(1);
        let mut connections = Vec::with_capacity(num_workers + 1);
        for _ in 0..=num_workers {
            match self.inner.connector.connect().await {
                Ok(store) => connections.push(store),
                Err(e) => {
                    self.emit_queue(&name, QueueEvent::Error {
                        error: e.to_string(),
                    });
                    release(connections).await;
                    return Err(e.into());
                }
            }
        }
        let store = connections.remove(0);

        let options = config
            .worker_options
            .unwrap_or_else(|| self.inner.worker_defaults.clone());
        let handler = erase(handler);
        let wakeup = Arc::new(Notify::new());

        let mut queues = self.inner.queues.lock().await;
        if queues.contains_key(&name) {
            drop(queues);
            connections.push(store);
            release(connections).await;
            return Err(JobError::QueueExists { queue: name });
        }

        let workers: Vec<WorkerSlot> = connections
            .into_iter()
            .map(|worker_store| {
                worker::spawn(WorkerContext {
                    queue: name.clone(),
                    store: worker_store,
                    handler: Arc::clone(&handler),
                    observability: Arc::clone(&self.inner.observability),
                    options: options.clone(),
                    wakeup: Arc::clone(&wakeup),
                })
            })
            .collect();

        let result = AddQueueResult {
            queue: QueueHandle {
                name: name.clone(),
                store: Arc::clone(&store),
            },
            workers: workers.iter().map(|slot| slot.handle.clone()).collect(),
        };

        queues.insert(
            name.clone(),
            RegisteredQueue {
                store,
                options: config.job_options,
                workers,
                wakeup,
                closing: false,
            },
        );
        drop(queues);

        info!(queue = %name, workers = num_workers, "Queue added");
        self.emit_queue(&name, QueueEvent::Added);
        Ok(result)
    }

    /// Closes the queue's workers, waiting for in-flight jobs, then releases
    /// its store connection and removes it from the registry.
    pub async fn stop_queue(&self, name: &str) -> Result<bool, JobError> {
        let (store, workers) = {
            let mut queues = self.inner.queues.lock().await;
            let queue = queues.get_mut(name).ok_or_else(|| not_found(name))?;
            if queue.closing {
                return Err(JobError::QueueClosing {
                    queue: name.to_string(),
                });
            }
            queue.closing = true;
            (Arc::clone(&queue.store), std::mem::take(&mut queue.workers))
        };

        for slot in workers {
            let worker_id = slot.handle.id().to_string();
            if let Err(e) = slot.close().await {
                warn!(queue = %name, worker_id = %worker_id, error = %e, "Worker task ended abnormally");
            }
        }

        if let Err(e) = store.disconnect().await {
            self.emit_queue(name, QueueEvent::Error {
                error: e.to_string(),
            });
        }

        self.inner.queues.lock().await.remove(name);
        info!(queue = %name, "Queue stopped");
        self.emit_queue(name, QueueEvent::Closed);
        Ok(true)
    }

    /// Pauses one queue.
    pub async fn pause_queue(&self, name: &str) -> Result<bool, JobError> {
        self.control(name, QueueControl::Pause, false).await
    }

    /// Resumes one queue.
    pub async fn resume_queue(&self, name: &str) -> Result<bool, JobError> {
        self.control(name, QueueControl::Resume, false).await
    }

    /// Adds a job with the queue's job options.
    pub async fn enqueue_job<T>(&self, name: &str, data: T) -> Result<JobEntry<T>, JobError>
    where
        T: Serialize,
    {
        let (store, options, wakeup) = self.producer(name).await?;
        let value = serde_json::to_value(&data)?;
        let record = store
            .add(name, value, &options)
            .await
            .map_err(|e| self.queue_failure(name, e))?;

        debug!(queue = %name, job_id = %record.id, "Job added");
        self.inner
            .observability
            .emit(events::job_added(name, &record.id, &record.data));
        wakeup.notify_waiters();

        Ok(JobEntry {
            id: record.id,
            data,
        })
    }

    /// Moves a dead-lettered job back to waiting. Attempt counters are kept,
    /// so a revived job that fails again is dead-lettered after one attempt.
    pub async fn retry_job<T>(&self, name: &str, job_id: &str) -> Result<JobEntry<T>, JobError>
    where
        T: DeserializeOwned,
    {
        let (store, _, wakeup) = self.producer(name).await?;
        let record = store
            .retry(name, job_id)
            .await
            .map_err(|e| self.queue_failure(name, e))?
            .ok_or_else(|| JobError::JobNotFound {
                queue: name.to_string(),
                job_id: job_id.to_string(),
            })?;

        self.inner
            .observability
            .emit(events::job_retry(name, &record.id, &record.data));
        wakeup.notify_waiters();

        Ok(record.entry()?)
    }

    /// Returns the dead-lettered jobs of a queue. An unknown queue has none.
    pub async fn get_failed_jobs<T>(&self, name: &str) -> Result<Vec<FailedJobEntry<T>>, JobError>
    where
        T: DeserializeOwned,
    {
        let store = {
            let queues = self.inner.queues.lock().await;
            match queues.get(name) {
                Some(queue) => Arc::clone(&queue.store),
                None => return Ok(Vec::new()),
            }
        };

        let records = store
            .failed(name)
            .await
            .map_err(|e| self.queue_failure(name, e))?;
        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        self.inner
            .observability
            .emit(events::failed_jobs_read(name, &ids));

        records
            .iter()
            .map(|r| r.failed_entry().map_err(JobError::from))
            .collect()
    }

    /// Performs a pause or resume against the store and emits the matching
    /// event. With `if_needed`, a queue already in the target state is left
    /// untouched.
    async fn control(
        &self,
        name: &str,
        action: QueueControl,
        if_needed: bool,
    ) -> Result<bool, JobError> {
        let (store, wakeup) = {
            let queues = self.inner.queues.lock().await;
            let queue = queues.get(name).ok_or_else(|| not_found(name))?;
            (Arc::clone(&queue.store), Arc::clone(&queue.wakeup))
        };

        if if_needed {
            let paused = store
                .is_paused(name)
                .await
                .map_err(|e| self.queue_failure(name, e))?;
            if paused == (action == QueueControl::Pause) {
                return Ok(true);
            }
        }

        let result = match action {
            QueueControl::Pause => store.pause(name).await,
            QueueControl::Resume => store.resume(name).await,
        };
        result.map_err(|e| self.queue_failure(name, e))?;

        match action {
            QueueControl::Pause => self.emit_queue(name, QueueEvent::Paused),
            QueueControl::Resume => {
                self.emit_queue(name, QueueEvent::Resumed);
                wakeup.notify_waiters();
            }
        }
        Ok(true)
    }

    /// Looks up what a producer-side operation needs. Closing queues refuse
    /// new work.
    async fn producer(
        &self,
        name: &str,
    ) -> Result<(Arc<dyn JobStore>, JobOptions, Arc<Notify>), JobError> {
        let queues = self.inner.queues.lock().await;
        let queue = queues.get(name).ok_or_else(|| not_found(name))?;
        if queue.closing {
            return Err(JobError::QueueClosing {
                queue: name.to_string(),
            });
        }
        Ok((
            Arc::clone(&queue.store),
            queue.options.clone(),
            Arc::clone(&queue.wakeup),
        ))
    }

    fn queue_failure(&self, name: &str, error: StoreError) -> JobError {
        self.emit_queue(name, QueueEvent::Error {
            error: error.to_string(),
        });
        error.into()
    }

    fn emit_queue(&self, name: &str, event: QueueEvent) {
        self.inner
            .observability
            .emit(events::queue_event(name, &event));
    }
}

fn not_found(name: &str) -> JobError {
    JobError::QueueNotFound {
        queue: name.to_string(),
    }
}

async fn release(connections: Vec<Arc<dyn JobStore>>) {
    for store in connections {
        if let Err(e) = store.disconnect().await {
            warn!(error = %e, "Failed to release store connection");
        }
    }
}
