//! Redis job store.
//!
//! Layout under the configured prefix:
//!
//! | key                      | type   | contents                                  |
//! |--------------------------|--------|-------------------------------------------|
//! | `{p}:job:{id}`           | string | JSON job record                           |
//! | `{p}:status:{status}`    | set    | ids currently in that status              |
//! | `{p}:ready:{priority}`   | zset   | pending/failed ids, scored by eligible-at |
//!
//! Claims and updates are read, applied in Rust, then written back through
//! [`SAVE_IF_UNCHANGED`], a Lua compare-and-set that only writes if the stored
//! JSON is still the one that was read. A claim that loses the race returns
//! `None`; an update re-reads and tries again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::Duration;

use super::{order_eligible, order_stale, JobStore};
use crate::config::RedisConfig;
use crate::error::{QueueError, Result};
use crate::jobs::job::{JobId, JobPriority, JobRecord, JobStatus, JobUpdate};

const NAME: &str = "redis";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on due ids read per priority in one listing.
const SCAN_CAP: usize = 1000;
/// Update attempts before giving up on a record under heavy contention.
const UPDATE_RETRIES: usize = 5;

/// Write a record and move its index entries, if the record is unchanged.
///
/// KEYS: job, current status set, next status set, ready zset.
/// ARGV: JSON as read, new JSON, id, ready score (empty removes it).
/// Returns 1 if written, 0 if the record changed or disappeared.
const SAVE_IF_UNCHANGED: &str = r#"
local current = redis.call('GET', KEYS[1])
if current ~= ARGV[1] then
    return 0
end

redis.call('SET', KEYS[1], ARGV[2])
if KEYS[2] ~= KEYS[3] then
    redis.call('SREM', KEYS[2], ARGV[3])
    redis.call('SADD', KEYS[3], ARGV[3])
end
if ARGV[4] == '' then
    redis.call('ZREM', KEYS[4], ARGV[3])
else
    redis.call('ZADD', KEYS[4], ARGV[4], ARGV[3])
end
return 1
"#;

#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn job(&self, id: impl std::fmt::Display) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn status(&self, status: JobStatus) -> String {
        format!("{}:status:{}", self.prefix, status)
    }

    fn ready(&self, priority: JobPriority) -> String {
        format!("{}:ready:{}", self.prefix, priority)
    }

    /// Keys and arguments of a [`SAVE_IF_UNCHANGED`] call moving `before`
    /// (stored as `raw`) to `after`.
    fn save_call(&self, raw: &str, before: &JobRecord, after: &JobRecord) -> Result<([String; 4], [String; 4])> {
        let score = if after.status.is_eligible_state() {
            after.eligible_at().timestamp_millis().to_string()
        } else {
            String::new()
        };
        let keys = [
            self.job(after.id),
            self.status(before.status),
            self.status(after.status),
            self.ready(after.priority),
        ];
        let args = [raw.to_string(), serde_json::to_string(after)?, after.id.to_string(), score];
        Ok((keys, args))
    }
}

pub struct RedisStore {
    conn: ConnectionManager,
    keys: Keys,
    save_script: redis::Script,
}

impl RedisStore {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let mut conn = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| QueueError::store_unavailable(NAME, "connect timed out"))??;

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        tracing::info!(prefix = %config.key_prefix, "Connected to redis job store");

        Ok(Self {
            conn,
            keys: Keys {
                prefix: config.key_prefix.clone(),
            },
            save_script: redis::Script::new(SAVE_IF_UNCHANGED),
        })
    }

    /// The stored JSON and its decoded record.
    async fn load(&self, id: JobId) -> Result<Option<(String, JobRecord)>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET").arg(self.keys.job(id)).query_async(&mut conn).await?;
        match raw {
            Some(raw) => {
                let job = decode(&raw)?;
                Ok(Some((raw, job)))
            }
            None => Ok(None),
        }
    }

    async fn load_many(&self, ids: &[String]) -> Result<Vec<JobRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| self.keys.job(id)).collect();
        let mut conn = self.conn.clone();
        let raw: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;
        raw.iter().flatten().map(|s| decode(s)).collect()
    }

    /// Write `after` if the record still reads `raw`. Returns whether it did.
    async fn save_if_unchanged(&self, raw: &str, before: &JobRecord, after: &JobRecord) -> Result<bool> {
        let (keys, args) = self.keys.save_call(raw, before, after)?;
        let mut conn = self.conn.clone();
        let written: i64 = self
            .save_script
            .key(&keys[0])
            .key(&keys[1])
            .key(&keys[2])
            .key(&keys[3])
            .arg(&args[0])
            .arg(&args[1])
            .arg(&args[2])
            .arg(&args[3])
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }
}

fn decode(raw: &str) -> Result<JobRecord> {
    Ok(serde_json::from_str(raw)?)
}

#[async_trait]
impl JobStore for RedisStore {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn create(&self, job: &JobRecord) -> Result<JobId> {
        let id = job.id.to_string();
        let mut conn = self.conn.clone();

        let inserted: bool = redis::cmd("SET")
            .arg(self.keys.job(job.id))
            .arg(serde_json::to_string(job)?)
            .arg("NX")
            .query_async::<_, Option<String>>(&mut conn)
            .await?
            .is_some();
        if !inserted {
            return Err(QueueError::new(
                crate::error::ErrorCode::DuplicateRecord,
                format!("Job already exists: {}", job.id),
            ));
        }

        let mut pipe = redis::pipe();
        pipe.atomic().sadd(self.keys.status(job.status), &id).ignore();
        if job.status.is_eligible_state() {
            pipe.zadd(self.keys.ready(job.priority), &id, job.eligible_at().timestamp_millis())
                .ignore();
        }
        let () = pipe.query_async(&mut conn).await?;

        tracing::debug!(job_id = %job.id, priority = %job.priority, "Job written to redis");
        Ok(job.id)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        Ok(self.load(id).await?.map(|(_, job)| job))
    }

    async fn update(&self, id: JobId, update: &JobUpdate) -> Result<JobRecord> {
        for _ in 0..UPDATE_RETRIES {
            let (raw, before) = self.load(id).await?.ok_or_else(|| QueueError::job_not_found(id))?;
            let mut after = before.clone();
            after.apply(update);
            if self.save_if_unchanged(&raw, &before, &after).await? {
                return Ok(after);
            }
            tracing::debug!(job_id = %id, "Job changed while updating, re-reading");
        }
        Err(QueueError::store_query_failed(
            NAME,
            format!("job {} kept changing during update", id),
        ))
    }

    async fn claim(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<JobRecord>> {
        let Some((raw, before)) = self.load(id).await? else {
            return Ok(None);
        };
        if !before.is_claimable(now) {
            return Ok(None);
        }

        let mut after = before.clone();
        after.apply(&JobUpdate::processing(before.attempts + 1, now));
        if !self.save_if_unchanged(&raw, &before, &after).await? {
            return Ok(None);
        }
        Ok(Some(after))
    }

    async fn list_eligible(
        &self,
        limit: usize,
        priority_order: &[JobPriority],
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>> {
        let mut listed = Vec::with_capacity(limit);

        for priority in priority_order {
            if listed.len() >= limit {
                break;
            }
            let mut conn = self.conn.clone();
            let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(self.keys.ready(*priority))
                .arg("-inf")
                .arg(now.timestamp_millis())
                .arg("LIMIT")
                .arg(0)
                .arg(SCAN_CAP)
                .query_async(&mut conn)
                .await?;

            let due = self
                .load_many(&ids)
                .await?
                .into_iter()
                .filter(|job| job.is_eligible(now))
                .collect();
            let remaining = limit - listed.len();
            listed.extend(order_eligible(due, remaining, std::slice::from_ref(priority)));
        }

        Ok(listed)
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<JobRecord>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.status(JobStatus::Processing))
            .query_async(&mut conn)
            .await?;

        let stale = self
            .load_many(&ids)
            .await?
            .into_iter()
            .filter(|job| job.status == JobStatus::Processing && job.updated_at < cutoff)
            .collect();
        Ok(order_stale(stale, limit))
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>> {
        let mut pipe = redis::pipe();
        for status in JobStatus::ALL {
            pipe.scard(self.keys.status(status));
        }
        let mut conn = self.conn.clone();
        let counts: Vec<u64> = pipe.query_async(&mut conn).await?;

        Ok(JobStatus::ALL.into_iter().zip(counts).collect())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>, statuses: &[JobStatus]) -> Result<u64> {
        let mut deleted = 0u64;

        for status in statuses {
            let mut conn = self.conn.clone();
            let ids: Vec<String> = redis::cmd("SMEMBERS")
                .arg(self.keys.status(*status))
                .query_async(&mut conn)
                .await?;

            let stale: Vec<JobRecord> = self
                .load_many(&ids)
                .await?
                .into_iter()
                .filter(|job| job.status == *status && job.updated_at < cutoff)
                .collect();
            if stale.is_empty() {
                continue;
            }

            let mut pipe = redis::pipe();
            pipe.atomic();
            for job in &stale {
                let id = job.id.to_string();
                pipe.del(self.keys.job(job.id)).ignore();
                pipe.srem(self.keys.status(*status), &id).ignore();
                pipe.zrem(self.keys.ready(job.priority), &id).ignore();
            }
            let () = pipe.query_async(&mut conn).await?;
            deleted += stale.len() as u64;
        }

        Ok(deleted)
    }
}
