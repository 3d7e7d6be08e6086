mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use common::{eventually, job_service, Calls};
use retry_dlq::error::JobError;
use retry_dlq::job_service::{job_handler, QueueConfig, WorkerOptions, WorkerState};
use retry_dlq::jobs::{Backoff, JobOptions};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct TestJob {
    test: String,
}

fn test_job() -> TestJob {
    TestJob {
        test: "data".to_string(),
    }
}

#[tokio::test]
async fn processes_job_and_reports_events() {
    let (service, events) = job_service();
    let calls = Calls::new();

    let recorder = calls.clone();
    let added = service
        .add_queue(
            QueueConfig::new("q1").workers(2),
            job_handler(move |data: TestJob| {
                let recorder = recorder.clone();
                async move {
                    recorder.record(data);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();
    assert_eq!(added.queue.name(), "q1");
    assert_eq!(added.workers.len(), 2);
    assert!(added.workers.iter().all(|w| w.is_running()));

    let entry = service.enqueue_job("q1", test_job()).await.unwrap();
    assert_eq!(entry.data, test_job());

    eventually(Duration::from_secs(1), || {
        let events = events.clone();
        async move { !events.named("job-service.job.completed").is_empty() }
    })
    .await;

    assert_eq!(calls.all(), vec![test_job()]);
    assert!(events.contains("job-service.job.added", |e| {
        e.data_str("jobId") == Some(entry.id.as_str()) && e.event_data["data"] == json!({"test": "data"})
    }));
    assert!(events.contains("job-service.queue.added", |e| {
        e.message() == Some("Queue with name 'q1' has been added")
    }));
    eventually(Duration::from_secs(1), || {
        let events = events.clone();
        async move { events.named("job-service.worker.ready").len() == 2 }
    })
    .await;
    assert!(service.get_failed_jobs::<TestJob>("q1").await.unwrap().is_empty());

    service.stop().await.unwrap();
    assert_eq!(events.named("job-service.worker.closed").len(), 2);
    assert!(added.workers.iter().all(|w| w.state() == WorkerState::Closed));
}

#[tokio::test]
async fn failing_job_is_dead_lettered_after_all_attempts() {
    let (service, events) = job_service();
    let calls = Calls::new();

    let recorder = calls.clone();
    service
        .add_queue(
            QueueConfig::new("q1").job_options(
                JobOptions::with_attempts(3).backoff(Backoff::fixed(Duration::from_millis(5))),
            ),
            job_handler(move |data: TestJob| {
                let count = recorder.record(data);
                async move { anyhow::bail!("attempt {} failed", count) }
            }),
        )
        .await
        .unwrap();

    let entry = service.enqueue_job("q1", test_job()).await.unwrap();

    eventually(Duration::from_secs(2), || {
        let service = service.clone();
        async move {
            !service
                .get_failed_jobs::<TestJob>("q1")
                .await
                .unwrap()
                .is_empty()
        }
    })
    .await;

    let failed = service.get_failed_jobs::<TestJob>("q1").await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, entry.id);
    assert_eq!(failed[0].data, test_job());
    assert_eq!(failed[0].attempts_made, 3);
    assert_eq!(failed[0].attempts_allowed, 3);
    assert_eq!(
        failed[0].stacktrace,
        vec!["attempt 1 failed", "attempt 2 failed", "attempt 3 failed"]
    );
    assert_eq!(calls.count(), 3);

    let failures = events.named("job-service.job.failed");
    assert_eq!(failures.len(), 3);
    assert_eq!(
        failures
            .iter()
            .filter(|e| e.event_data["deadLettered"] == true)
            .count(),
        1
    );
    assert!(!events.named("job-service.queue.jobs.failed.read").is_empty());

    service.stop().await.unwrap();
}

#[tokio::test]
async fn job_succeeds_after_a_retry() {
    let (service, _events) = job_service();
    let calls = Calls::new();

    let recorder = calls.clone();
    service
        .add_queue(
            QueueConfig::new("q1").job_options(JobOptions::with_attempts(3)),
            job_handler(move |data: TestJob| {
                let count = recorder.record(data);
                async move {
                    if count == 1 {
                        anyhow::bail!("first attempt fails");
                    }
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    service.enqueue_job("q1", test_job()).await.unwrap();

    eventually(Duration::from_secs(2), || {
        let calls = calls.clone();
        async move { calls.count() >= 2 }
    })
    .await;

    assert!(calls.all().iter().all(|data| *data == test_job()));
    let counts = service.get_failed_jobs::<TestJob>("q1").await.unwrap();
    assert!(counts.is_empty());

    service.stop().await.unwrap();
}

#[tokio::test]
async fn revived_job_runs_again() {
    let (service, events) = job_service();
    let calls = Calls::new();
    let healthy = Arc::new(AtomicBool::new(false));

    let recorder = calls.clone();
    let flag = healthy.clone();
    service
        .add_queue(
            QueueConfig::new("q1").job_options(JobOptions::with_attempts(2)),
            job_handler(move |data: TestJob| {
                recorder.record(data);
                let ok = flag.load(Ordering::SeqCst);
                async move {
                    if ok {
                        Ok(())
                    } else {
                        anyhow::bail!("downstream unavailable")
                    }
                }
            }),
        )
        .await
        .unwrap();

    let entry = service.enqueue_job("q1", test_job()).await.unwrap();
    eventually(Duration::from_secs(2), || {
        let service = service.clone();
        async move { service.get_failed_jobs::<TestJob>("q1").await.unwrap().len() == 1 }
    })
    .await;
    assert_eq!(calls.count(), 2);

    healthy.store(true, Ordering::SeqCst);
    let revived = service.retry_job::<TestJob>("q1", &entry.id).await.unwrap();
    assert_eq!(revived.id, entry.id);
    assert_eq!(revived.data, test_job());
    assert!(events.contains("job-service.job.retry", |e| {
        e.message() == Some(format!("Job with job id: {} is being retried", entry.id).as_str())
    }));

    eventually(Duration::from_secs(2), || {
        let calls = calls.clone();
        async move { calls.count() == 3 }
    })
    .await;
    eventually(Duration::from_secs(1), || {
        let events = events.clone();
        async move { !events.named("job-service.job.completed").is_empty() }
    })
    .await;

    assert_eq!(calls.all()[2], test_job());
    assert!(service.get_failed_jobs::<TestJob>("q1").await.unwrap().is_empty());

    service.stop().await.unwrap();
}

#[tokio::test]
async fn revived_job_that_fails_again_gains_one_attempt() {
    let (service, _events) = job_service();
    let calls = Calls::new();

    let recorder = calls.clone();
    service
        .add_queue(
            QueueConfig::new("q1").job_options(JobOptions::with_attempts(2)),
            job_handler(move |data: TestJob| {
                recorder.record(data);
                async { anyhow::bail!("still broken") }
            }),
        )
        .await
        .unwrap();

    let entry = service.enqueue_job("q1", test_job()).await.unwrap();
    eventually(Duration::from_secs(2), || {
        let service = service.clone();
        async move { service.get_failed_jobs::<TestJob>("q1").await.unwrap().len() == 1 }
    })
    .await;
    let before = service.get_failed_jobs::<TestJob>("q1").await.unwrap();
    assert_eq!(before[0].attempts_made, 2);

    service.retry_job::<TestJob>("q1", &entry.id).await.unwrap();
    eventually(Duration::from_secs(2), || {
        let calls = calls.clone();
        async move { calls.count() == 3 }
    })
    .await;
    eventually(Duration::from_secs(2), || {
        let service = service.clone();
        async move { service.get_failed_jobs::<TestJob>("q1").await.unwrap().len() == 1 }
    })
    .await;

    let after = service.get_failed_jobs::<TestJob>("q1").await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, entry.id);
    assert_eq!(after[0].attempts_made, before[0].attempts_made + 1);
    assert_eq!(after[0].attempts_allowed, before[0].attempts_allowed);

    service.stop().await.unwrap();
}

#[tokio::test]
async fn stopping_one_queue_leaves_others_running() {
    let (service, _events) = job_service();
    let a_calls = Calls::new();
    let b_calls = Calls::new();

    for (name, calls) in [("a", a_calls.clone()), ("b", b_calls.clone())] {
        service
            .add_queue(
                QueueConfig::new(name),
                job_handler(move |data: TestJob| {
                    calls.record(data);
                    async { Ok(()) }
                }),
            )
            .await
            .unwrap();
    }

    service.stop_queue("a").await.unwrap();
    assert_eq!(service.queue_names().await, vec!["b".to_string()]);

    let err = service.enqueue_job("a", test_job()).await.unwrap_err();
    assert!(matches!(err, JobError::QueueNotFound { .. }));

    service.enqueue_job("b", test_job()).await.unwrap();
    eventually(Duration::from_secs(1), || {
        let calls = b_calls.clone();
        async move { calls.count() == 1 }
    })
    .await;
    assert_eq!(a_calls.count(), 0);

    service.stop().await.unwrap();
}

#[tokio::test]
async fn stop_clears_every_queue() {
    let (service, events) = job_service();
    for name in ["a", "b"] {
        service
            .add_queue(
                QueueConfig::new(name),
                job_handler(|_: TestJob| async { Ok(()) }),
            )
            .await
            .unwrap();
    }

    assert!(service.stop().await.unwrap());
    assert!(service.queue_names().await.is_empty());
    assert_eq!(events.named("job-service.queue.closed").len(), 2);

    for name in ["a", "b"] {
        let err = service.enqueue_job(name, test_job()).await.unwrap_err();
        assert!(err.is_not_found());
    }
}

#[tokio::test]
async fn stop_queue_waits_for_in_flight_job() {
    let (service, events) = job_service();
    let calls = Calls::new();

    let recorder = calls.clone();
    service
        .add_queue(
            QueueConfig::new("q1"),
            job_handler(move |data: TestJob| {
                let recorder = recorder.clone();
                async move {
                    recorder.record(data);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    service.enqueue_job("q1", test_job()).await.unwrap();
    eventually(Duration::from_secs(1), || {
        let calls = calls.clone();
        async move { calls.count() == 1 }
    })
    .await;

    service.stop_queue("q1").await.unwrap();

    let names: Vec<String> = events
        .events()
        .into_iter()
        .map(|e| e.event_name)
        .filter(|n| {
            n == "job-service.job.completed"
                || n == "job-service.worker.closed"
                || n == "job-service.queue.closed"
        })
        .collect();
    assert_eq!(
        names,
        vec![
            "job-service.job.completed",
            "job-service.worker.closed",
            "job-service.queue.closed",
        ]
    );
}

#[tokio::test]
async fn paused_queue_holds_jobs_until_resumed() {
    let (service, events) = job_service();
    let calls = Calls::new();

    let recorder = calls.clone();
    let added = service
        .add_queue(
            QueueConfig::new("q1"),
            job_handler(move |data: TestJob| {
                recorder.record(data);
                async { Ok(()) }
            }),
        )
        .await
        .unwrap();

    assert!(service.pause_queue("q1").await.unwrap());
    assert!(added.queue.is_paused().await.unwrap());
    service.enqueue_job("q1", test_job()).await.unwrap();

    added.workers[0].wait_for(WorkerState::Paused).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.count(), 0);
    assert_eq!(added.queue.counts().await.unwrap().waiting, 1);

    assert!(service.resume_queue("q1").await.unwrap());
    eventually(Duration::from_secs(1), || {
        let calls = calls.clone();
        async move { calls.count() == 1 }
    })
    .await;

    assert_eq!(events.named("job-service.queue.paused").len(), 1);
    assert_eq!(events.named("job-service.queue.resumed").len(), 1);
    assert!(!events.named("job-service.worker.paused").is_empty());
    assert!(!events.named("job-service.worker.resumed").is_empty());

    service.stop().await.unwrap();
}

#[tokio::test]
async fn service_pause_skips_queues_already_paused() {
    let (service, events) = job_service();
    for name in ["a", "b"] {
        service
            .add_queue(
                QueueConfig::new(name),
                job_handler(|_: TestJob| async { Ok(()) }),
            )
            .await
            .unwrap();
    }

    service.pause_queue("a").await.unwrap();
    service.pause().await.unwrap();
    assert_eq!(events.named("job-service.queue.paused").len(), 2);

    service.resume().await.unwrap();
    service.resume().await.unwrap();
    assert_eq!(events.named("job-service.queue.resumed").len(), 2);

    service.stop().await.unwrap();
}

#[tokio::test]
async fn start_runs_idle_workers() {
    let (service, events) = job_service();
    let calls = Calls::new();

    let recorder = calls.clone();
    let added = service
        .add_queue(
            QueueConfig::new("q1").worker_options(WorkerOptions {
                autorun: false,
                ..common::fast_workers()
            }),
            job_handler(move |data: TestJob| {
                recorder.record(data);
                async { Ok(()) }
            }),
        )
        .await
        .unwrap();

    service.enqueue_job("q1", test_job()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.count(), 0);
    assert!(!added.workers[0].is_running());

    assert!(service.start().await.unwrap());
    assert!(service.start().await.unwrap());
    eventually(Duration::from_secs(1), || {
        let calls = calls.clone();
        async move { calls.count() == 1 }
    })
    .await;
    assert_eq!(events.named("job-service.worker.ready").len(), 1);

    service.stop().await.unwrap();
}

#[tokio::test]
async fn retrying_unknown_job_is_not_found() {
    let (service, _events) = job_service();
    service
        .add_queue(
            QueueConfig::new("q1"),
            job_handler(|_: TestJob| async { Ok(()) }),
        )
        .await
        .unwrap();

    let err = service.retry_job::<TestJob>("q1", "404").await.unwrap_err();
    assert!(matches!(err, JobError::JobNotFound { .. }));
    assert!(err.is_not_found());

    service.stop().await.unwrap();
}

#[tokio::test]
async fn failed_jobs_of_unknown_queue_is_empty() {
    let (service, events) = job_service();
    let failed = service.get_failed_jobs::<TestJob>("ghost").await.unwrap();
    assert!(failed.is_empty());
    assert!(events.events().is_empty());
}

#[tokio::test]
async fn long_running_job_keeps_its_lease() {
    let (service, events) = job_service();
    let running = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let calls = Calls::new();

    let (recorder, in_flight, max_seen) = (calls.clone(), running.clone(), peak.clone());
    service
        .add_queue(
            QueueConfig::new("q1")
                .workers(2)
                .worker_options(WorkerOptions {
                    poll_interval: Duration::from_millis(10),
                    lock_duration: Duration::from_millis(50),
                    stalled_interval: Duration::from_millis(10),
                    ..WorkerOptions::default()
                }),
            job_handler(move |data: TestJob| {
                recorder.record(data);
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                let in_flight = in_flight.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        )
        .await
        .unwrap();

    service.enqueue_job("q1", test_job()).await.unwrap();
    eventually(Duration::from_secs(2), || {
        let events = events.clone();
        async move { !events.named("job-service.job.completed").is_empty() }
    })
    .await;
    // Give the idle worker a few stalled checks after completion.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(calls.count(), 1);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert!(events.named("job-service.worker.stalled").is_empty());
    assert_eq!(events.named("job-service.job.completed").len(), 1);

    service.stop().await.unwrap();
}
