//! HTTP client for the queue server's REST API.

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Success envelope returned by the `/api/v1` routes.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub error_code: Option<String>,
}

/// Error body returned when a request is rejected.
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorInfo,
}

#[derive(Debug, Deserialize)]
struct ErrorInfo {
    code: String,
    message: String,
}

/// Turn a non-2xx body into a readable message, preferring the structured
/// `{error: {code, message}}` form.
fn describe_failure(status: reqwest::StatusCode, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorResponse>(body) {
        return format!("{} ({}): {}", parsed.error.code, status, parsed.error.message);
    }
    if let Ok(parsed) = serde_json::from_str::<ApiResponse<serde_json::Value>>(body) {
        if let Some(message) = parsed.error {
            let code = parsed.error_code.unwrap_or_else(|| "ERROR".into());
            return format!("{} ({}): {}", code, status, message);
        }
    }
    format!("API error ({}): {}", status, body)
}

pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, url: &str) -> Result<T> {
        let resp = request
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!(describe_failure(status, &body));
        }

        let api_resp: ApiResponse<T> = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))?;

        if api_resp.success {
            api_resp
                .data
                .ok_or_else(|| anyhow::anyhow!("API returned success but no data"))
        } else {
            Err(anyhow::anyhow!(
                "API error: {}",
                api_resp.error.unwrap_or_else(|| "Unknown error".into())
            ))
        }
    }

    /// GET an enveloped resource.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        self.send(self.client.get(&url), &url).await
    }

    /// POST a JSON body to an enveloped resource.
    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.url(path);
        self.send(self.client.post(&url).json(body), &url).await
    }

    /// GET a bare JSON document. The health route answers 503 with a full
    /// report when no store tier is reachable, so that status is accepted.
    pub async fn get_raw(&self, path: &str) -> Result<serde_json::Value> {
        let url = self.url(path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        let status = resp.status();
        if !status.is_success() && status != reqwest::StatusCode::SERVICE_UNAVAILABLE {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!(describe_failure(status, &body));
        }

        resp.json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }
}
