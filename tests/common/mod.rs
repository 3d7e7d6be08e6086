//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use retry_dlq::job_service::{JobService, WorkerOptions};
use retry_dlq::observability::EventBuffer;
use retry_dlq::store::MemoryStore;

/// Worker options that keep tests fast.
pub fn fast_workers() -> WorkerOptions {
    WorkerOptions {
        poll_interval: Duration::from_millis(10),
        ..WorkerOptions::default()
    }
}

/// A job service over a fresh in-memory store, recording every event.
pub fn job_service() -> (JobService, Arc<EventBuffer>) {
    let events = Arc::new(EventBuffer::new());
    let service = JobService::with_worker_defaults(
        Arc::new(MemoryStore::new()),
        events.clone(),
        fast_workers(),
    );
    (service, events)
}

/// Polls `check` until it returns true, panicking after `timeout`.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = tokio::time::timeout(timeout, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition not met within {:?}", timeout);
}

/// Records handler invocations.
#[derive(Debug, Clone)]
pub struct Calls<T> {
    calls: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone> Calls<T> {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn record(&self, value: T) -> usize {
        let mut calls = self.calls.lock().unwrap();
        calls.push(value);
        calls.len()
    }

    pub fn all(&self) -> Vec<T> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}
