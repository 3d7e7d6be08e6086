//! Queue worker that leases jobs from the store and runs the queue handler.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::events::{self, WorkerEvent};
use super::JobHandler;
use crate::error::HandlerError;
use crate::observability::ObservabilityService;
use crate::store::{FailOutcome, JobRecord, JobStore, Reservation};

/// Tuning for the workers of a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Start processing as soon as the worker is created.
    pub autorun: bool,

    /// How long an idle worker waits before asking the store again.
    pub poll_interval: Duration,

    /// Lease granted on a job. A job still active after its lease is stalled.
    pub lock_duration: Duration,

    /// How often the worker looks for stalled jobs.
    pub stalled_interval: Duration,

    /// Number of times a job may stall before it is dead-lettered.
    pub max_stalled_count: u32,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            autorun: true,
            poll_interval: Duration::from_millis(250),
            lock_duration: Duration::from_secs(30),
            stalled_interval: Duration::from_secs(30),
            max_stalled_count: 1,
        }
    }
}

/// What the owner of a worker wants it to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Created but not started.
    Idle,
    /// Process jobs.
    Run,
    /// Finish the current job and exit.
    Close,
}

/// Observable state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Paused,
    Closed,
}

/// Read-only view of a running worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: String,
    queue: String,
    command: watch::Receiver<WorkerCommand>,
    state: watch::Receiver<WorkerState>,
}

impl WorkerHandle {
    /// Worker identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue the worker consumes.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Current state.
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// True once the worker has been told to run and has not closed.
    pub fn is_running(&self) -> bool {
        *self.command.borrow() == WorkerCommand::Run && self.state() != WorkerState::Closed
    }

    /// Waits until the worker reaches `target`.
    pub async fn wait_for(&self, target: WorkerState) {
        let mut state = self.state.clone();
        // A dropped sender means the worker task is gone; nothing left to wait on.
        let _ = state.wait_for(|s| *s == target).await;
    }
}

/// Worker owned by the job service registry.
pub(crate) struct WorkerSlot {
    pub(crate) handle: WorkerHandle,
    control: watch::Sender<WorkerCommand>,
    task: JoinHandle<()>,
}

impl WorkerSlot {
    /// Starts an idle worker. A worker already running is left alone.
    pub(crate) fn run(&self) {
        self.control.send_if_modified(|command| {
            if *command == WorkerCommand::Idle {
                *command = WorkerCommand::Run;
                true
            } else {
                false
            }
        });
    }

    /// Asks the worker to exit and waits for it. The in-flight job, if any,
    /// is settled first.
    pub(crate) async fn close(self) -> Result<(), tokio::task::JoinError> {
        self.control.send_replace(WorkerCommand::Close);
        self.task.await
    }
}

/// Everything a worker needs to process one queue.
pub(crate) struct WorkerContext {
    pub(crate) queue: String,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) handler: JobHandler<serde_json::Value>,
    pub(crate) observability: Arc<dyn ObservabilityService>,
    pub(crate) options: WorkerOptions,
    pub(crate) wakeup: Arc<Notify>,
}

/// Spawns a worker task for the queue.
pub(crate) fn spawn(context: WorkerContext) -> WorkerSlot {
    let id = uuid::Uuid::new_v4().to_string();
    let initial = if context.options.autorun {
        WorkerCommand::Run
    } else {
        WorkerCommand::Idle
    };
    let (control, command_rx) = watch::channel(initial);
    let (state_tx, state_rx) = watch::channel(WorkerState::Idle);

    let handle = WorkerHandle {
        id: id.clone(),
        queue: context.queue.clone(),
        command: control.subscribe(),
        state: state_rx,
    };

    let worker = Worker {
        id,
        context,
        control: command_rx,
        state: state_tx,
        ready: false,
        last_stalled_check: None,
    };
    let task = tokio::spawn(worker.run());

    WorkerSlot {
        handle,
        control,
        task,
    }
}

struct Worker {
    id: String,
    context: WorkerContext,
    control: watch::Receiver<WorkerCommand>,
    state: watch::Sender<WorkerState>,
    ready: bool,
    last_stalled_check: Option<Instant>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let command = *self.control.borrow_and_update();
            match command {
                WorkerCommand::Close => break,
                WorkerCommand::Idle => {
                    if self.control.changed().await.is_err() {
                        break;
                    }
                    continue;
                }
                WorkerCommand::Run => {}
            }

            if !self.ready {
                self.ready = true;
                self.emit(WorkerEvent::Ready);
            }

            self.check_stalled().await;

            let reservation = self
                .context
                .store
                .reserve(&self.context.queue, &self.id, self.context.options.lock_duration)
                .await;

            match reservation {
                Ok(Reservation::Job(job)) => {
                    self.leave_pause();
                    self.process(job).await;
                }
                Ok(Reservation::Empty) => {
                    self.leave_pause();
                    if !self.wait().await {
                        break;
                    }
                }
                Ok(Reservation::Paused) => {
                    if self.current() != WorkerState::Paused {
                        self.emit(WorkerEvent::Paused);
                    }
                    if !self.wait().await {
                        break;
                    }
                }
                Err(e) => {
                    self.emit(WorkerEvent::Error {
                        error: e.to_string(),
                    });
                    if !self.wait().await {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.context.store.disconnect().await {
            self.emit(WorkerEvent::Error {
                error: e.to_string(),
            });
        }
        self.emit(WorkerEvent::Closed);
    }

    /// Runs the handler for a leased job and settles it with the store.
    async fn process(&mut self, job: JobRecord) {
        let queue = self.context.queue.clone();
        debug!(queue = %queue, job_id = %job.id, worker_id = %self.id, "Processing job");
        self.emit(WorkerEvent::Started {
            job_id: job.id.clone(),
        });

        // A panicking handler only takes down its own task.
        let task = tokio::spawn((self.context.handler)(job.data.clone()));
        let outcome = self.hold_lease(&job.id, task).await;

        match outcome {
            Ok(()) => match self.context.store.complete(&queue, &job.id, &self.id).await {
                Ok(()) => self.emit(WorkerEvent::Completed { job_id: job.id }),
                Err(e) => self.emit(WorkerEvent::Error {
                    error: e.to_string(),
                }),
            },
            Err(e) => {
                let error = format!("{:#}", e);
                match self.context.store.fail(&queue, &job.id, &self.id, &error).await {
                    Ok(FailOutcome::Retrying { attempt, delay }) => {
                        debug!(job_id = %job.id, attempt, delay_ms = delay.as_millis() as u64, "Job will be retried");
                        self.emit(WorkerEvent::JobFailed {
                            job_id: job.id,
                            error,
                            attempts_made: attempt,
                            dead_lettered: false,
                        });
                    }
                    Ok(FailOutcome::DeadLettered { attempts_made }) => {
                        self.emit(WorkerEvent::JobFailed {
                            job_id: job.id,
                            error,
                            attempts_made,
                            dead_lettered: true,
                        });
                    }
                    Err(store_error) => {
                        warn!(job_id = %job.id, error = %store_error, "Failed to record job failure");
                        self.emit(WorkerEvent::Failed {
                            error: format!("{} (while recording: {})", error, store_error),
                        });
                    }
                }
            }
        }
    }

    /// Waits for the handler task, renewing the job's lease every half
    /// lock duration so other workers never see it as stalled.
    async fn hold_lease(
        &self,
        job_id: &str,
        mut task: JoinHandle<Result<(), HandlerError>>,
    ) -> Result<(), HandlerError> {
        let lease = self.context.options.lock_duration;
        let mut renew = tokio::time::interval((lease / 2).max(Duration::from_millis(1)));
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        renew.tick().await;

        loop {
            tokio::select! {
                joined = &mut task => {
                    return joined
                        .unwrap_or_else(|e| Err(anyhow::anyhow!("handler panicked: {}", e)));
                }
                _ = renew.tick() => {
                    match self
                        .context
                        .store
                        .extend_lease(&self.context.queue, job_id, &self.id, lease)
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(job_id, worker_id = %self.id, "Lost lease on job");
                        }
                        Err(e) => self.emit(WorkerEvent::Error {
                            error: e.to_string(),
                        }),
                    }
                }
            }
        }
    }

    /// Re-queues jobs whose lease expired, at most once per stalled interval.
    async fn check_stalled(&mut self) {
        let due = self
            .last_stalled_check
            .map_or(true, |at| at.elapsed() >= self.context.options.stalled_interval);
        if !due {
            return;
        }
        self.last_stalled_check = Some(Instant::now());

        match self
            .context
            .store
            .recover_stalled(&self.context.queue, self.context.options.max_stalled_count)
            .await
        {
            Ok(stalled) => {
                for job in stalled {
                    self.emit(WorkerEvent::Stalled {
                        job_id: job.id,
                        dead_lettered: job.dead_lettered,
                    });
                }
            }
            Err(e) => self.emit(WorkerEvent::Error {
                error: e.to_string(),
            }),
        }
    }

    /// Waits for new work, a command change or the poll interval.
    /// Returns false when the owner is gone.
    async fn wait(&mut self) -> bool {
        let wakeup = Arc::clone(&self.context.wakeup);
        tokio::select! {
            changed = self.control.changed() => changed.is_ok(),
            _ = wakeup.notified() => true,
            _ = tokio::time::sleep(self.context.options.poll_interval) => true,
        }
    }

    fn leave_pause(&mut self) {
        if self.current() == WorkerState::Paused {
            self.emit(WorkerEvent::Resumed);
        }
    }

    fn current(&self) -> WorkerState {
        *self.state.borrow()
    }

    fn emit(&self, event: WorkerEvent) {
        let next = match &event {
            WorkerEvent::Ready | WorkerEvent::Resumed => Some(WorkerState::Running),
            WorkerEvent::Paused => Some(WorkerState::Paused),
            WorkerEvent::Closed => Some(WorkerState::Closed),
            _ => None,
        };
        if let Some(state) = next {
            self.state.send_replace(state);
        }
        self.context
            .observability
            .emit(events::worker_event(&self.context.queue, &self.id, &event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobOptions;
    use crate::observability::EventBuffer;
    use crate::store::{MemoryStore, StoreConnector};
    use serde_json::json;

    fn fast_options() -> WorkerOptions {
        WorkerOptions {
            poll_interval: Duration::from_millis(10),
            ..WorkerOptions::default()
        }
    }

    async fn context(
        store: &MemoryStore,
        handler: JobHandler<serde_json::Value>,
        options: WorkerOptions,
        events: Arc<EventBuffer>,
    ) -> WorkerContext {
        WorkerContext {
            queue: "q1".to_string(),
            store: store.connect().await.unwrap(),
            handler,
            observability: events,
            options,
            wakeup: Arc::new(Notify::new()),
        }
    }

    #[tokio::test]
    async fn idle_worker_waits_for_run() {
        let store = MemoryStore::new();
        let events = Arc::new(EventBuffer::new());
        let handler = super::super::job_handler(|_: serde_json::Value| async { Ok(()) });
        let options = WorkerOptions {
            autorun: false,
            ..fast_options()
        };
        let slot = spawn(context(&store, handler, options, events.clone()).await);

        assert!(!slot.handle.is_running());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(events.named("job-service.worker.ready").is_empty());

        slot.run();
        assert!(slot.handle.is_running());
        slot.handle.wait_for(WorkerState::Running).await;

        let handle = slot.handle.clone();
        slot.close().await.unwrap();
        assert_eq!(handle.state(), WorkerState::Closed);
        assert_eq!(events.named("job-service.worker.closed").len(), 1);
    }

    #[tokio::test]
    async fn panicking_handler_fails_the_job() {
        let store = MemoryStore::new();
        let events = Arc::new(EventBuffer::new());
        let handler = super::super::job_handler(|_: serde_json::Value| async {
            if true {
                panic!("bad payload");
            }
            Ok(())
        });
        let slot = spawn(context(&store, handler, fast_options(), events.clone()).await);

        let conn = store.connect().await.unwrap();
        conn.add("q1", json!({"n": 1}), &JobOptions::default())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while conn.failed("q1").await.unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(events.contains("job-service.job.failed", |e| {
            e.event_data["deadLettered"] == true
        }));
        slot.close().await.unwrap();
    }
}
