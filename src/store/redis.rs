//! Redis-backed job store.
//!
//! Keys per queue, under a configurable prefix:
//! - `{prefix}:{queue}:id` job id counter
//! - `{prefix}:{queue}:job:{id}` job record (JSON)
//! - `{prefix}:{queue}:wait` list of ready job ids
//! - `{prefix}:{queue}:delayed` sorted set, scored by ready time (ms)
//! - `{prefix}:{queue}:active` sorted set, scored by lease expiry (ms)
//! - `{prefix}:{queue}:owner` hash of active job id to leaseholding worker
//! - `{prefix}:{queue}:failed` list of dead-lettered job ids
//! - `{prefix}:{queue}:paused` present while the queue is paused

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use tracing::{debug, info};

use super::record::{FailOutcome, JobRecord, JobState};
use super::{JobCounts, JobStore, Reservation, StalledJob, StoreConnector};
use crate::config::model::RedisConfig;
use crate::error::StoreError;
use crate::jobs::JobOptions;

/// Opens connections to a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    url: String,
    prefix: String,
}

impl RedisStore {
    /// Creates a connector for the given Redis URL and key prefix.
    pub fn new(redis_url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url).map_err(|e| StoreError::ConnectionFailed {
            url: redis_url.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            client,
            url: redis_url.to_string(),
            prefix: prefix.into(),
        })
    }

    /// Creates a connector from configuration.
    pub fn from_config(config: &RedisConfig) -> Result<Self, StoreError> {
        Self::new(&config.url(), config.key_prefix.clone())
    }

    /// Opens a concrete connection.
    pub async fn open(&self) -> Result<RedisConnection, StoreError> {
        let connection = self
            .client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::ConnectionFailed {
                url: self.url.clone(),
                message: e.to_string(),
            })?;
        debug!(prefix = %self.prefix, "Opened Redis connection");
        Ok(RedisConnection {
            connection,
            prefix: self.prefix.clone(),
            connected: AtomicBool::new(true),
        })
    }
}

#[async_trait]
impl StoreConnector for RedisStore {
    async fn connect(&self) -> Result<Arc<dyn JobStore>, StoreError> {
        Ok(Arc::new(self.open().await?))
    }
}

/// One connection to Redis.
pub struct RedisConnection {
    connection: redis::aio::ConnectionManager,
    prefix: String,
    connected: AtomicBool,
}

/// Atomic state transitions. Each script moves a job between the state
/// collections and rewrites its record in one step, so a crash between
/// commands can never leave a job outside every collection.
mod scripts {
    use redis::Script;

    /// KEYS: job, wait, delayed. ARGV: id, record, ready at (0 for now).
    pub fn add() -> Script {
        Script::new(
            r#"
            redis.call('SET', KEYS[1], ARGV[2])
            if tonumber(ARGV[3]) > 0 then
                redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
            else
                redis.call('RPUSH', KEYS[2], ARGV[1])
            end
            return 1
            "#,
        )
    }

    /// KEYS: paused, delayed, wait, active, owner.
    /// ARGV: now, lease expiry, worker id, job key prefix.
    pub fn reserve() -> Script {
        Script::new(
            r#"
            if redis.call('EXISTS', KEYS[1]) == 1 then
                return {'paused'}
            end

            local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
            for _, id in ipairs(due) do
                redis.call('ZREM', KEYS[2], id)
                redis.call('RPUSH', KEYS[3], id)
            end

            while true do
                local id = redis.call('LPOP', KEYS[3])
                if not id then
                    return {'empty'}
                end
                local job = redis.call('GET', ARGV[4] .. id)
                if job then
                    redis.call('ZADD', KEYS[4], ARGV[2], id)
                    redis.call('HSET', KEYS[5], id, ARGV[3])
                    return {'job', job}
                end
            end
            "#,
        )
    }

    /// KEYS: owner, job. ARGV: id, worker id, record.
    pub fn save_if_owner() -> Script {
        Script::new(
            r#"
            if redis.call('HGET', KEYS[1], ARGV[1]) ~= ARGV[2] then
                return 0
            end
            redis.call('SET', KEYS[2], ARGV[3])
            return 1
            "#,
        )
    }

    /// KEYS: owner, active. ARGV: id, worker id, lease expiry.
    pub fn extend_lease() -> Script {
        Script::new(
            r#"
            if redis.call('HGET', KEYS[1], ARGV[1]) ~= ARGV[2] then
                return 0
            end
            redis.call('ZADD', KEYS[2], 'XX', ARGV[3], ARGV[1])
            return 1
            "#,
        )
    }

    /// KEYS: owner, active, job. ARGV: id, worker id.
    pub fn complete() -> Script {
        Script::new(
            r#"
            if redis.call('HGET', KEYS[1], ARGV[1]) ~= ARGV[2] then
                return 0
            end
            redis.call('HDEL', KEYS[1], ARGV[1])
            redis.call('ZREM', KEYS[2], ARGV[1])
            redis.call('DEL', KEYS[3])
            return 1
            "#,
        )
    }

    /// KEYS: owner, active, job, wait, delayed, failed.
    /// ARGV: id, worker id, record, target (wait, delayed or failed), ready at.
    pub fn fail() -> Script {
        Script::new(
            r#"
            if redis.call('HGET', KEYS[1], ARGV[1]) ~= ARGV[2] then
                return 0
            end
            redis.call('HDEL', KEYS[1], ARGV[1])
            redis.call('ZREM', KEYS[2], ARGV[1])
            redis.call('SET', KEYS[3], ARGV[3])
            if ARGV[4] == 'delayed' then
                redis.call('ZADD', KEYS[5], ARGV[5], ARGV[1])
            elseif ARGV[4] == 'failed' then
                redis.call('RPUSH', KEYS[6], ARGV[1])
            else
                redis.call('RPUSH', KEYS[4], ARGV[1])
            end
            return 1
            "#,
        )
    }

    /// KEYS: owner, active, job, wait, failed.
    /// ARGV: id, now, record, '1' to dead-letter.
    ///
    /// Skips jobs whose lease was renewed or settled since they were read.
    pub fn stall() -> Script {
        Script::new(
            r#"
            local expiry = redis.call('ZSCORE', KEYS[2], ARGV[1])
            if not expiry or tonumber(expiry) > tonumber(ARGV[2]) then
                return 0
            end
            redis.call('HDEL', KEYS[1], ARGV[1])
            redis.call('ZREM', KEYS[2], ARGV[1])
            redis.call('SET', KEYS[3], ARGV[3])
            if ARGV[4] == '1' then
                redis.call('RPUSH', KEYS[5], ARGV[1])
            else
                redis.call('LPUSH', KEYS[4], ARGV[1])
            end
            return 1
            "#,
        )
    }

    /// KEYS: failed, wait, job. ARGV: id, record.
    pub fn revive() -> Script {
        Script::new(
            r#"
            if redis.call('LREM', KEYS[1], 0, ARGV[1]) == 0 then
                return 0
            end
            redis.call('SET', KEYS[3], ARGV[2])
            redis.call('RPUSH', KEYS[2], ARGV[1])
            return 1
            "#,
        )
    }
}

/// Key builder for one queue.
struct Keys<'a> {
    prefix: &'a str,
    queue: &'a str,
}

impl Keys<'_> {
    fn key(&self, suffix: &str) -> String {
        format!("{}:{}:{}", self.prefix, self.queue, suffix)
    }

    fn id(&self) -> String {
        self.key("id")
    }

    fn job_prefix(&self) -> String {
        format!("{}:{}:job:", self.prefix, self.queue)
    }

    fn job(&self, job_id: &str) -> String {
        format!("{}{}", self.job_prefix(), job_id)
    }

    fn wait(&self) -> String {
        self.key("wait")
    }

    fn delayed(&self) -> String {
        self.key("delayed")
    }

    fn active(&self) -> String {
        self.key("active")
    }

    fn owner(&self) -> String {
        self.key("owner")
    }

    fn failed(&self) -> String {
        self.key("failed")
    }

    fn paused(&self) -> String {
        self.key("paused")
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry(lease: Duration) -> i64 {
    now_millis() + lease.as_millis() as i64
}

fn lease_lost(queue: &str, job_id: &str, worker_id: &str) -> StoreError {
    StoreError::LeaseLost {
        queue: queue.to_string(),
        job_id: job_id.to_string(),
        worker_id: worker_id.to_string(),
    }
}

impl RedisConnection {
    fn keys<'a>(&'a self, queue: &'a str) -> Keys<'a> {
        Keys {
            prefix: &self.prefix,
            queue,
        }
    }

    fn conn(&self) -> Result<redis::aio::ConnectionManager, StoreError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(StoreError::Disconnected);
        }
        Ok(self.connection.clone())
    }

    async fn load(&self, queue: &str, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let json: Option<String> = self.conn()?.get(self.keys(queue).job(job_id)).await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn load_all(&self, queue: &str, ids: Vec<String>) -> Result<Vec<JobRecord>, StoreError> {
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.load(queue, &id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }
}

#[async_trait]
impl JobStore for RedisConnection {
    async fn add(
        &self,
        queue: &str,
        data: serde_json::Value,
        opts: &JobOptions,
    ) -> Result<JobRecord, StoreError> {
        let keys = self.keys(queue);
        let mut conn = self.conn()?;
        let id: u64 = conn.incr(keys.id(), 1).await?;
        let job = JobRecord::new(id.to_string(), queue, data, opts.clone());
        let ready_at = if opts.delay_ms > 0 {
            expiry(Duration::from_millis(opts.delay_ms))
        } else {
            0
        };

        let _: i64 = scripts::add()
            .key(keys.job(&job.id))
            .key(keys.wait())
            .key(keys.delayed())
            .arg(&job.id)
            .arg(serde_json::to_string(&job)?)
            .arg(ready_at)
            .invoke_async(&mut conn)
            .await?;

        debug!(queue, job_id = %job.id, "Added job");
        Ok(job)
    }

    async fn reserve(
        &self,
        queue: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Reservation, StoreError> {
        let keys = self.keys(queue);
        let mut conn = self.conn()?;
        let reply: Vec<String> = scripts::reserve()
            .key(keys.paused())
            .key(keys.delayed())
            .key(keys.wait())
            .key(keys.active())
            .key(keys.owner())
            .arg(now_millis())
            .arg(expiry(lease))
            .arg(worker_id)
            .arg(keys.job_prefix())
            .invoke_async(&mut conn)
            .await?;

        match reply.as_slice() {
            [kind] if kind == "paused" => Ok(Reservation::Paused),
            [kind, json] if kind == "job" => {
                let mut job: JobRecord = serde_json::from_str(json)?;
                job.start();
                // A lost lease surfaces when the job is settled.
                let _: i64 = scripts::save_if_owner()
                    .key(keys.owner())
                    .key(keys.job(&job.id))
                    .arg(&job.id)
                    .arg(worker_id)
                    .arg(serde_json::to_string(&job)?)
                    .invoke_async(&mut conn)
                    .await?;
                Ok(Reservation::Job(job))
            }
            _ => Ok(Reservation::Empty),
        }
    }

    async fn extend_lease(
        &self,
        queue: &str,
        job_id: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let keys = self.keys(queue);
        let extended: i64 = scripts::extend_lease()
            .key(keys.owner())
            .key(keys.active())
            .arg(job_id)
            .arg(worker_id)
            .arg(expiry(lease))
            .invoke_async(&mut self.conn()?)
            .await?;
        Ok(extended == 1)
    }

    async fn complete(
        &self,
        queue: &str,
        job_id: &str,
        worker_id: &str,
    ) -> Result<(), StoreError> {
        let keys = self.keys(queue);
        let completed: i64 = scripts::complete()
            .key(keys.owner())
            .key(keys.active())
            .key(keys.job(job_id))
            .arg(job_id)
            .arg(worker_id)
            .invoke_async(&mut self.conn()?)
            .await?;
        if completed == 1 {
            Ok(())
        } else {
            Err(lease_lost(queue, job_id, worker_id))
        }
    }

    async fn fail(
        &self,
        queue: &str,
        job_id: &str,
        worker_id: &str,
        error: &str,
    ) -> Result<FailOutcome, StoreError> {
        let mut job = self
            .load(queue, job_id)
            .await?
            .ok_or_else(|| StoreError::MissingJob {
                queue: queue.to_string(),
                job_id: job_id.to_string(),
            })?;

        let outcome = job.fail(error);
        let (target, ready_at) = match outcome {
            FailOutcome::Retrying { delay, .. } if delay.is_zero() => ("wait", 0),
            FailOutcome::Retrying { delay, .. } => ("delayed", expiry(delay)),
            FailOutcome::DeadLettered { .. } => ("failed", 0),
        };

        let keys = self.keys(queue);
        let recorded: i64 = scripts::fail()
            .key(keys.owner())
            .key(keys.active())
            .key(keys.job(job_id))
            .key(keys.wait())
            .key(keys.delayed())
            .key(keys.failed())
            .arg(job_id)
            .arg(worker_id)
            .arg(serde_json::to_string(&job)?)
            .arg(target)
            .arg(ready_at)
            .invoke_async(&mut self.conn()?)
            .await?;
        if recorded != 1 {
            return Err(lease_lost(queue, job_id, worker_id));
        }

        if let FailOutcome::DeadLettered { attempts_made } = outcome {
            info!(queue, job_id, attempts_made, "Moved job to dead letter queue");
        }
        Ok(outcome)
    }

    async fn retry(&self, queue: &str, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let Some(mut job) = self.load(queue, job_id).await? else {
            return Ok(None);
        };
        if job.state != JobState::Failed {
            return Err(StoreError::NotRetryable {
                job_id: job_id.to_string(),
                state: job.state.to_string(),
            });
        }

        job.revive();
        let keys = self.keys(queue);
        let revived: i64 = scripts::revive()
            .key(keys.failed())
            .key(keys.wait())
            .key(keys.job(job_id))
            .arg(job_id)
            .arg(serde_json::to_string(&job)?)
            .invoke_async(&mut self.conn()?)
            .await?;
        if revived == 1 {
            return Ok(Some(job));
        }

        // Revived by someone else in the meantime.
        match self.load(queue, job_id).await? {
            Some(current) => Err(StoreError::NotRetryable {
                job_id: job_id.to_string(),
                state: current.state.to_string(),
            }),
            None => Ok(None),
        }
    }

    async fn get(&self, queue: &str, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        self.load(queue, job_id).await
    }

    async fn failed(&self, queue: &str) -> Result<Vec<JobRecord>, StoreError> {
        let ids: Vec<String> = self.conn()?.lrange(self.keys(queue).failed(), 0, -1).await?;
        self.load_all(queue, ids).await
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts, StoreError> {
        let keys = self.keys(queue);
        let mut conn = self.conn()?;
        Ok(JobCounts {
            waiting: conn.llen(keys.wait()).await?,
            delayed: conn.zcard(keys.delayed()).await?,
            active: conn.zcard(keys.active()).await?,
            failed: conn.llen(keys.failed()).await?,
        })
    }

    async fn pause(&self, queue: &str) -> Result<(), StoreError> {
        self.conn()?
            .set::<_, _, ()>(self.keys(queue).paused(), 1)
            .await?;
        Ok(())
    }

    async fn resume(&self, queue: &str) -> Result<(), StoreError> {
        self.conn()?.del::<_, ()>(self.keys(queue).paused()).await?;
        Ok(())
    }

    async fn is_paused(&self, queue: &str) -> Result<bool, StoreError> {
        Ok(self.conn()?.exists(self.keys(queue).paused()).await?)
    }

    async fn recover_stalled(
        &self,
        queue: &str,
        max_stalled: u32,
    ) -> Result<Vec<StalledJob>, StoreError> {
        let keys = self.keys(queue);
        let mut conn = self.conn()?;
        let now = now_millis();
        let expired: Vec<String> = conn.zrangebyscore(keys.active(), "-inf", now).await?;

        let mut stalled = Vec::new();
        for job_id in expired {
            let Some(mut job) = self.load(queue, &job_id).await? else {
                continue;
            };

            let dead_lettered = job.stall(max_stalled);
            let moved: i64 = scripts::stall()
                .key(keys.owner())
                .key(keys.active())
                .key(keys.job(&job_id))
                .key(keys.wait())
                .key(keys.failed())
                .arg(&job_id)
                .arg(now)
                .arg(serde_json::to_string(&job)?)
                .arg(if dead_lettered { "1" } else { "0" })
                .invoke_async(&mut conn)
                .await?;
            if moved == 1 {
                stalled.push(StalledJob {
                    id: job_id,
                    dead_lettered,
                });
            }
        }
        Ok(stalled)
    }

    async fn disconnect(&self) -> Result<(), StoreError> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_include_prefix_and_queue() {
        let keys = Keys {
            prefix: "retry-dlq",
            queue: "retry||producer||billing",
        };
        assert_eq!(keys.wait(), "retry-dlq:retry||producer||billing:wait");
        assert_eq!(keys.job("7"), "retry-dlq:retry||producer||billing:job:7");
        assert_eq!(keys.failed(), "retry-dlq:retry||producer||billing:failed");
        assert_eq!(keys.job_prefix(), "retry-dlq:retry||producer||billing:job:");
    }

    async fn live_connection() -> RedisConnection {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        let prefix = format!("retry-dlq-test-{}", uuid::Uuid::new_v4());
        RedisStore::new(&url, prefix).unwrap().open().await.unwrap()
    }

    async fn reserve(store: &RedisConnection, worker_id: &str, lease: Duration) -> JobRecord {
        match store.reserve("q", worker_id, lease).await.unwrap() {
            Reservation::Job(job) => job,
            other => panic!("expected a job, got {:?}", other),
        }
    }

    #[tokio::test]
    #[ignore] // Requires actual Redis
    async fn reserve_moves_the_job_into_active() {
        let store = live_connection().await;
        store.add("q", serde_json::json!({"n": 1}), &JobOptions::default()).await.unwrap();

        let job = reserve(&store, "w1", Duration::from_secs(30)).await;
        assert_eq!(job.state, JobState::Active);
        let counts = store.counts("q").await.unwrap();
        assert_eq!((counts.waiting, counts.active), (0, 1));

        assert!(!store.extend_lease("q", &job.id, "w2", Duration::from_secs(30)).await.unwrap());
        assert!(store.extend_lease("q", &job.id, "w1", Duration::from_secs(30)).await.unwrap());
        assert!(store.recover_stalled("q", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore] // Requires actual Redis
    async fn stale_worker_cannot_settle_a_redelivered_job() {
        let store = live_connection().await;
        store.add("q", serde_json::json!("x"), &JobOptions::default()).await.unwrap();

        let job = reserve(&store, "w1", Duration::ZERO).await;
        let stalled = store.recover_stalled("q", 1).await.unwrap();
        assert_eq!(stalled.len(), 1);
        let again = reserve(&store, "w2", Duration::from_secs(30)).await;
        assert_eq!(again.id, job.id);

        let err = store.fail("q", &job.id, "w1", "late").await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseLost { .. }));
        let err = store.complete("q", &job.id, "w1").await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseLost { .. }));
        assert_eq!(store.get("q", &job.id).await.unwrap().unwrap().attempts_made, 0);

        store.complete("q", &job.id, "w2").await.unwrap();
        assert!(store.get("q", &job.id).await.unwrap().is_none());
        assert_eq!(store.counts("q").await.unwrap(), JobCounts::default());
    }

    #[tokio::test]
    #[ignore] // Requires actual Redis
    async fn dead_lettered_job_is_revived_once() {
        let store = live_connection().await;
        store.add("q", serde_json::json!("x"), &JobOptions::default()).await.unwrap();

        let job = reserve(&store, "w1", Duration::from_secs(30)).await;
        let outcome = store.fail("q", &job.id, "w1", "nope").await.unwrap();
        assert_eq!(outcome, FailOutcome::DeadLettered { attempts_made: 1 });
        assert_eq!(store.failed("q").await.unwrap().len(), 1);

        let revived = store.retry("q", &job.id).await.unwrap().expect("revived");
        assert_eq!(revived.state, JobState::Waiting);
        let err = store.retry("q", &job.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotRetryable { .. }));
        assert_eq!(store.counts("q").await.unwrap().waiting, 1);
    }

    #[test]
    fn invalid_url_is_a_connection_error() {
        let err = RedisStore::new("not a url", "p").err().expect("invalid url");
        assert!(matches!(err, StoreError::ConnectionFailed { .. }));
    }
}
