//! PostgreSQL job store (sqlx).
//!
//! The plain-table tier. Claims are a conditional `UPDATE ... RETURNING`, so
//! the row lock decides the single owner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;
use uuid::Uuid;

use super::JobStore;
use crate::config::DatabaseConfig;
use crate::error::{ErrorCode, QueueError, Result};
use crate::jobs::job::{JobId, JobPriority, JobRecord, JobStatus, JobUpdate};
use crate::jobs::payload::ResearchPayload;

const NAME: &str = "postgres";

const COLUMNS: &str = "id, owner_id, query, output_format, source_limit, focus_area, metadata, \
     status, attempts, max_attempts, next_retry_at, last_error, result, priority, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    owner_id: String,
    query: String,
    output_format: String,
    source_limit: i32,
    focus_area: String,
    metadata: Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    next_retry_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    result: Option<Value>,
    priority: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self> {
        let metadata = match row.metadata {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Ok(Self {
            id: JobId(row.id),
            owner_id: row.owner_id,
            payload: ResearchPayload {
                query: row.query,
                output_format: row.output_format.parse()?,
                source_limit: u32::try_from(row.source_limit).unwrap_or_default(),
                focus_area: row.focus_area.parse()?,
                metadata,
            },
            status: row.status.parse()?,
            attempts: u32::try_from(row.attempts).unwrap_or_default(),
            max_attempts: u32::try_from(row.max_attempts).unwrap_or_default(),
            next_retry_at: row.next_retry_at,
            last_error: row.last_error,
            result: row.result.map(serde_json::from_value).transpose()?,
            priority: row.priority.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect if `database.url` is set; `Ok(None)` means the tier is not configured.
    pub async fn from_config(config: &DatabaseConfig) -> Result<Option<Self>> {
        let Some(url) = config.url.as_deref() else {
            return Ok(None);
        };

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout)
            .connect(url)
            .await?;
        let store = Self::new(pool);

        if config.run_migrations {
            store.migrate().await?;
        }
        tracing::info!("Connected to postgres job store");
        Ok(Some(store))
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| QueueError::from(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn create(&self, job: &JobRecord) -> Result<JobId> {
        sqlx::query(
            r#"
            INSERT INTO research_jobs (id, owner_id, query, output_format, source_limit, focus_area,
                metadata, status, attempts, max_attempts, next_retry_at, last_error, result, priority,
                created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(job.id.0)
        .bind(&job.owner_id)
        .bind(&job.payload.query)
        .bind(job.payload.output_format.as_str())
        .bind(to_i32(job.payload.source_limit))
        .bind(job.payload.focus_area.as_str())
        .bind(Value::Object(job.payload.metadata.clone()))
        .bind(job.status.as_str())
        .bind(to_i32(job.attempts))
        .bind(to_i32(job.max_attempts))
        .bind(job.next_retry_at)
        .bind(&job.last_error)
        .bind(job.result.as_ref().map(serde_json::to_value).transpose()?)
        .bind(job.priority.as_str())
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(job.id)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {} FROM research_jobs WHERE id = $1", COLUMNS))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.map(JobRecord::try_from).transpose()
    }

    async fn update(&self, id: JobId, update: &JobUpdate) -> Result<JobRecord> {
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE research_jobs SET updated_at = ");
        qb.push_bind(update.updated_at);

        if let Some(status) = update.status {
            qb.push(", status = ").push_bind(status.as_str());
        }
        if let Some(attempts) = update.attempts {
            qb.push(", attempts = ").push_bind(to_i32(attempts));
        }
        if let Some(next_retry_at) = update.next_retry_at {
            qb.push(", next_retry_at = ").push_bind(next_retry_at);
        }
        if let Some(ref result) = update.result {
            let value = result.as_ref().map(serde_json::to_value).transpose()?;
            qb.push(", result = ").push_bind(value);
        }
        if let Some(ref last_error) = update.last_error {
            qb.push(", last_error = ").push_bind(last_error.clone());
        }

        qb.push(" WHERE id = ").push_bind(id.0);
        qb.push(" RETURNING ").push(COLUMNS);

        let row: Option<JobRow> = qb.build_query_as().fetch_optional(&self.pool).await?;
        row.ok_or_else(|| QueueError::job_not_found(id))?.try_into()
    }

    async fn claim(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<JobRecord>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            r#"
            UPDATE research_jobs
            SET status = 'processing', attempts = attempts + 1, next_retry_at = NULL, updated_at = $2
            WHERE id = $1
              AND status IN ('pending', 'failed')
              AND (next_retry_at IS NULL OR next_retry_at <= $2)
              AND attempts < max_attempts
            RETURNING {}
            "#,
            COLUMNS
        ))
        .bind(id.0)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.map(JobRecord::try_from).transpose()
    }

    async fn list_eligible(
        &self,
        limit: usize,
        priority_order: &[JobPriority],
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>> {
        let order: Vec<String> = priority_order.iter().map(|p| p.as_str().to_string()).collect();
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM research_jobs
            WHERE status IN ('pending', 'failed')
              AND (next_retry_at IS NULL OR next_retry_at <= $1)
              AND priority = ANY($2)
            ORDER BY array_position($2, priority), created_at
            LIMIT $3
            "#,
            COLUMNS
        ))
        .bind(now)
        .bind(&order)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<JobRecord>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM research_jobs
            WHERE status = 'processing' AND updated_at < $1
            ORDER BY updated_at
            LIMIT $2
            "#,
            COLUMNS
        ))
        .bind(cutoff)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM research_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = HashMap::new();
        for (status, count) in rows {
            match status.parse::<JobStatus>() {
                Ok(status) => {
                    counts.insert(status, u64::try_from(count).unwrap_or_default());
                }
                Err(_) => tracing::warn!(status = %status, "Ignoring rows with unknown job status"),
            }
        }
        Ok(counts)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>, statuses: &[JobStatus]) -> Result<u64> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let result = sqlx::query("DELETE FROM research_jobs WHERE status = ANY($1) AND updated_at < $2")
            .bind(&statuses)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
