//! The external research request function.
//!
//! The queue treats the research backend as a black box: it hands over a
//! validated payload with a deadline and gets back either a report or a
//! [`RequestFailure`]. Failures never escape the engine; they become job
//! transitions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

use crate::config::ResearchConfig;
use crate::error::QueueError;
use crate::jobs::payload::ResearchPayload;

/// Output of a successful research request, stored as the job result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchReport {
    pub report: String,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ResearchReport {
    pub fn new(report: impl Into<String>) -> Self {
        Self {
            report: report.into(),
            sources: Vec::new(),
            metadata: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Deadline elapsed before the backend answered
    Timeout,
    /// The backend answered with an error status
    Rejected,
    /// Connection-level failure
    Transport,
    /// The backend answered 2xx with a body we could not read
    InvalidResponse,
}

/// A failed research request. Always recoverable through the retry policy.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct RequestFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl RequestFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The failure recorded when the per-job deadline elapses. Its message is
    /// exactly `"timeout"`.
    pub fn timeout() -> Self {
        Self::new(FailureKind::Timeout, "timeout")
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Rejected, message)
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == FailureKind::Timeout
    }
}

impl From<reqwest::Error> for RequestFailure {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::timeout()
        } else if error.is_decode() {
            Self::new(FailureKind::InvalidResponse, error.to_string())
        } else if let Some(status) = error.status() {
            Self::rejected(format!("research endpoint returned {}", status))
        } else {
            Self::new(FailureKind::Transport, error.to_string())
        }
    }
}

/// The request function the engine invokes for each dispatched job.
#[async_trait]
pub trait ResearchClient: Send + Sync {
    /// Run one research request. `timeout` is the caller's deadline; the
    /// engine also enforces it from the outside.
    async fn perform(
        &self,
        payload: &ResearchPayload,
        timeout: Duration,
    ) -> Result<ResearchReport, RequestFailure>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP Client
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
struct ResearchCall<'a> {
    query: &'a str,
    output_format: &'a str,
    max_sources: u32,
    focus_area: &'a str,
    #[serde(skip_serializing_if = "Map::is_empty")]
    metadata: &'a Map<String, Value>,
}

/// Calls a research service over HTTP.
///
/// `POST {endpoint}` with `{query, output_format, max_sources, focus_area}`;
/// a 2xx JSON body `{report, sources?, metadata?}` is the report.
pub struct HttpResearchClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpResearchClient {
    pub fn new(config: &ResearchConfig) -> Result<Self, QueueError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| QueueError::configuration(format!("research http client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl ResearchClient for HttpResearchClient {
    async fn perform(
        &self,
        payload: &ResearchPayload,
        timeout: Duration,
    ) -> Result<ResearchReport, RequestFailure> {
        let body = ResearchCall {
            query: &payload.query,
            output_format: payload.output_format.as_str(),
            max_sources: payload.source_limit,
            focus_area: payload.focus_area.as_str(),
            metadata: &payload.metadata,
        };

        let mut request = self.client.post(&self.endpoint).timeout(timeout).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(200).collect();
            return Err(RequestFailure::rejected(format!(
                "research endpoint returned {}: {}",
                status, snippet
            )));
        }

        Ok(response.json::<ResearchReport>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message() {
        let failure = RequestFailure::timeout();
        assert_eq!(failure.to_string(), "timeout");
        assert!(failure.is_timeout());
    }

    #[test]
    fn test_report_defaults_optional_fields() {
        let report: ResearchReport = serde_json::from_str(r#"{"report":"done"}"#).unwrap();
        assert_eq!(report, ResearchReport::new("done"));
    }
}
