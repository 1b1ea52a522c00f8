//! Supabase job store, spoken to over its PostgREST interface.
//!
//! Claims are a compare-and-set `PATCH` filtered on the status and attempt
//! count that were read; an empty representation means another worker won.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_RANGE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use std::collections::HashMap;

use super::JobStore;
use crate::config::SupabaseConfig;
use crate::error::{ErrorCode, QueueError, Result};
use crate::jobs::job::{JobId, JobPriority, JobRecord, JobStatus, JobUpdate};

const NAME: &str = "supabase";

pub struct SupabaseStore {
    client: Client,
    endpoint: String,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn status_list(statuses: &[JobStatus]) -> String {
    let names: Vec<&str> = statuses.iter().map(JobStatus::as_str).collect();
    format!("in.({})", names.join(","))
}

fn transport_error(e: reqwest::Error) -> QueueError {
    if e.is_timeout() {
        QueueError::store_timeout(NAME, "request")
    } else {
        QueueError::store_unavailable(NAME, e.to_string())
    }
}

/// Fail on any non-2xx answer. Server-side trouble falls through to the next
/// tier; client errors mean the request itself was wrong.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let reason = format!("{}: {}", status, body.chars().take(200).collect::<String>());
    Err(match status {
        StatusCode::CONFLICT => QueueError::with_internal(
            ErrorCode::DuplicateRecord,
            "Job already exists",
            reason,
        ),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            QueueError::store_unavailable(NAME, reason)
        }
        _ => QueueError::store_query_failed(NAME, reason),
    })
}

/// Total from a `Content-Range: 0-9/42` or `*/42` header.
fn parse_total(header: Option<&HeaderValue>) -> Option<u64> {
    header?.to_str().ok()?.rsplit('/').next()?.parse().ok()
}

impl SupabaseStore {
    /// Build the client if both URL and service key are set; `Ok(None)`
    /// means the tier is not configured.
    pub fn from_config(config: &SupabaseConfig) -> Result<Option<Self>> {
        let (Some(url), Some(key)) = (config.url.as_deref(), config.service_key.as_deref()) else {
            return Ok(None);
        };
        Self::new(url, key, config).map(Some)
    }

    pub fn new(url: &str, service_key: &str, config: &SupabaseConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let invalid = |_| QueueError::configuration("Supabase service key is not a valid header value");
        headers.insert("apikey", HeaderValue::from_str(service_key).map_err(invalid)?);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", service_key)).map_err(invalid)?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| QueueError::configuration(format!("Failed to build Supabase client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/rest/v1/{}", url.trim_end_matches('/'), config.table),
        })
    }

    fn request(&self, method: Method) -> RequestBuilder {
        self.client.request(method, &self.endpoint)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await.map_err(transport_error)?;
        check(response).await
    }

    async fn rows(&self, request: RequestBuilder) -> Result<Vec<JobRecord>> {
        let response = self.send(request).await?;
        response.json().await.map_err(|e| {
            QueueError::with_internal(
                ErrorCode::DeserializationError,
                "Failed to decode job rows",
                e.to_string(),
            )
        })
    }

    async fn patch(&self, filters: &[(&str, String)], update: &JobUpdate) -> Result<Vec<JobRecord>> {
        let request = self
            .request(Method::PATCH)
            .query(filters)
            .header("Prefer", "return=representation")
            .json(update);
        self.rows(request).await
    }
}

#[async_trait]
impl JobStore for SupabaseStore {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn ping(&self) -> Result<()> {
        let request = self.request(Method::GET).query(&[("select", "id"), ("limit", "1")]);
        self.send(request).await?;
        Ok(())
    }

    async fn create(&self, job: &JobRecord) -> Result<JobId> {
        let request = self
            .request(Method::POST)
            .header("Prefer", "return=minimal")
            .json(job);
        self.send(request).await?;
        Ok(job.id)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        let request = self
            .request(Method::GET)
            .query(&[("id", format!("eq.{}", id)), ("limit", "1".to_string())]);
        Ok(self.rows(request).await?.into_iter().next())
    }

    async fn update(&self, id: JobId, update: &JobUpdate) -> Result<JobRecord> {
        self.patch(&[("id", format!("eq.{}", id))], update)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| QueueError::job_not_found(id))
    }

    async fn claim(&self, id: JobId, now: DateTime<Utc>) -> Result<Option<JobRecord>> {
        let Some(current) = self.get(id).await? else {
            return Ok(None);
        };
        if !current.is_claimable(now) {
            return Ok(None);
        }

        let filters = [
            ("id", format!("eq.{}", id)),
            ("status", format!("eq.{}", current.status)),
            ("attempts", format!("eq.{}", current.attempts)),
        ];
        let claimed = self
            .patch(&filters, &JobUpdate::processing(current.attempts + 1, now))
            .await?;
        Ok(claimed.into_iter().next())
    }

    async fn list_eligible(
        &self,
        limit: usize,
        priority_order: &[JobPriority],
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>> {
        let mut jobs = Vec::with_capacity(limit);
        let due = format!("(next_retry_at.is.null,next_retry_at.lte.{})", timestamp(now));

        for priority in priority_order {
            let remaining = limit.saturating_sub(jobs.len());
            if remaining == 0 {
                break;
            }
            let request = self.request(Method::GET).query(&[
                ("status", status_list(&JobStatus::ELIGIBLE)),
                ("priority", format!("eq.{}", priority)),
                ("or", due.clone()),
                ("order", "created_at.asc".to_string()),
                ("limit", remaining.to_string()),
            ]);
            jobs.extend(self.rows(request).await?);
        }

        Ok(jobs)
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<JobRecord>> {
        let request = self.request(Method::GET).query(&[
            ("status", format!("eq.{}", JobStatus::Processing)),
            ("updated_at", format!("lt.{}", timestamp(cutoff))),
            ("order", "updated_at.asc".to_string()),
            ("limit", limit.to_string()),
        ]);
        self.rows(request).await
    }

    async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>> {
        let mut counts = HashMap::new();
        for status in JobStatus::ALL {
            let request = self
                .request(Method::HEAD)
                .query(&[("select", "id".to_string()), ("status", format!("eq.{}", status))])
                .header("Prefer", "count=exact");
            let response = self.send(request).await?;
            let total = parse_total(response.headers().get(CONTENT_RANGE)).ok_or_else(|| {
                QueueError::store_query_failed(NAME, "count response had no Content-Range total")
            })?;
            counts.insert(status, total);
        }
        Ok(counts)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>, statuses: &[JobStatus]) -> Result<u64> {
        if statuses.is_empty() {
            return Ok(0);
        }
        let request = self
            .request(Method::DELETE)
            .query(&[
                ("status", status_list(statuses)),
                ("updated_at", format!("lt.{}", timestamp(cutoff))),
                ("select", "id".to_string()),
            ])
            .header("Prefer", "return=representation");
        let response = self.send(request).await?;
        let deleted: Vec<serde_json::Value> = response.json().await.map_err(|e| {
            QueueError::with_internal(
                ErrorCode::DeserializationError,
                "Failed to decode deleted rows",
                e.to_string(),
            )
        })?;
        Ok(deleted.len() as u64)
    }
}
