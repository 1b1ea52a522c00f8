//! Job commands: submit, get, process and cleanup.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use tabled::Tabled;
use uuid::Uuid;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum JobCommands {
    /// Enqueue a research request
    Submit {
        /// Research query
        query: String,

        /// Owner the job is recorded against; falls back to the `owner-id` setting
        #[arg(long, env = "RQ_OWNER_ID")]
        owner: Option<String>,

        /// Report format (text, markdown, json, html)
        #[arg(short, long)]
        format: Option<String>,

        /// Maximum number of sources to consult (1-50)
        #[arg(short, long)]
        sources: Option<i64>,

        /// Research focus (general, academic, news, technical, business, science)
        #[arg(long)]
        focus: Option<String>,

        /// Queue priority (high, normal, low)
        #[arg(short, long)]
        priority: Option<String>,
    },

    /// Show one job
    Get {
        /// Job ID
        job_id: Uuid,
    },

    /// Run one processing batch on the server
    Process,

    /// Purge old terminal jobs
    Cleanup {
        /// Single retention window for every terminal status, e.g. "24h"
        #[arg(long)]
        older_than: Option<String>,
    },
}

// ── API types ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct EnqueueRequest {
    owner_id: String,
    query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    focus_area: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct EnqueueReceipt {
    job_id: Uuid,
    status: String,
    estimated_processing_secs: u64,
}

#[derive(Debug, Deserialize, Serialize)]
struct JobInfo {
    id: Uuid,
    owner_id: String,
    query: String,
    output_format: String,
    source_limit: u32,
    focus_area: String,
    status: String,
    attempts: u32,
    max_attempts: u32,
    #[serde(default)]
    next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    last_error: Option<String>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    priority: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Serialize, Tabled)]
struct BatchReport {
    #[tabled(rename = "Fetched")]
    fetched: usize,
    #[tabled(rename = "Completed")]
    completed: usize,
    #[tabled(rename = "Retried")]
    retried: usize,
    #[tabled(rename = "Dead-lettered")]
    dead_lettered: usize,
    #[tabled(rename = "Skipped")]
    skipped: usize,
    #[tabled(rename = "Errors")]
    errors: usize,
}

#[derive(Serialize)]
struct CleanupRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    older_than: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
struct CleanupResponse {
    deleted: u64,
}

fn format_time(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn print_job(job: &JobInfo) {
    output::print_header(&format!("Job: {}", job.id));
    output::print_detail("Status", &output::colorize_status(&job.status).to_string());
    output::print_detail("Owner", &job.owner_id);
    output::print_detail("Priority", &job.priority);
    output::print_detail("Query", &job.query);
    output::print_detail(
        "Format",
        &format!("{} / {} sources / {}", job.output_format, job.source_limit, job.focus_area),
    );
    output::print_detail("Attempts", &format!("{}/{}", job.attempts, job.max_attempts));
    if let Some(at) = &job.next_retry_at {
        output::print_detail("Next retry", &format_time(at));
    }
    if let Some(error) = &job.last_error {
        output::print_detail("Last error", error);
    }
    output::print_detail("Created", &format_time(&job.created_at));
    output::print_detail("Updated", &format_time(&job.updated_at));

    if let Some(report) = job.result.as_ref().and_then(|r| r.get("report")).and_then(|r| r.as_str()) {
        println!();
        output::print_header("Report");
        println!("{}", report);
    }
}

// ── Execution ───────────────────────────────────────────────────────────────

pub async fn execute(cmd: JobCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        JobCommands::Submit {
            query,
            owner,
            format: output_format,
            sources,
            focus,
            priority,
        } => {
            let owner_id = owner
                .or_else(super::config::load_owner_id)
                .context("No owner given: pass --owner, set RQ_OWNER_ID or `rqctl config set owner-id`")?;
            let body = EnqueueRequest {
                owner_id,
                query,
                output_format,
                source_limit: sources,
                focus_area: focus,
                priority,
            };
            let receipt: EnqueueReceipt = client.post("/api/v1/jobs", &body).await?;

            match format {
                OutputFormat::Table => {
                    output::print_success("Job enqueued");
                    output::print_detail("Job ID", &receipt.job_id.to_string());
                    output::print_detail("Status", &receipt.status);
                    output::print_detail(
                        "Estimated wait",
                        &format!("~{}s", receipt.estimated_processing_secs),
                    );
                }
                _ => output::print_item(&receipt, format)?,
            }
        }

        JobCommands::Get { job_id } => {
            let job: JobInfo = client.get(&format!("/api/v1/jobs/{}", job_id)).await?;
            match format {
                OutputFormat::Table => print_job(&job),
                _ => output::print_item(&job, format)?,
            }
        }

        JobCommands::Process => {
            let report: BatchReport = client
                .post("/api/v1/jobs/process", &serde_json::json!({}))
                .await?;
            match format {
                OutputFormat::Table => {
                    if report.fetched == 0 {
                        output::print_info("No eligible jobs");
                    }
                    output::print_list(std::slice::from_ref(&report), format)?;
                    if report.errors > 0 {
                        output::print_warning(&format!("{} job(s) hit store errors", report.errors));
                    }
                }
                _ => output::print_item(&report, format)?,
            }
        }

        JobCommands::Cleanup { older_than } => {
            let resp: CleanupResponse = client
                .post("/api/v1/jobs/cleanup", &CleanupRequest { older_than })
                .await?;
            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Deleted {} job(s)", resp.deleted));
                }
                _ => output::print_item(&resp, format)?,
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_info_reads_server_record() {
        let body = r#"{
            "id": "0b0f6f2e-2f7d-4c61-9a4e-1a3c2b4d5e6f",
            "owner_id": "u1",
            "query": "quantum computing",
            "output_format": "markdown",
            "source_limit": 5,
            "focus_area": "technical",
            "metadata": {},
            "status": "failed",
            "attempts": 1,
            "max_attempts": 3,
            "next_retry_at": "2024-03-01T00:00:01Z",
            "last_error": "timeout",
            "result": null,
            "priority": "high",
            "created_at": "2024-03-01T00:00:00Z",
            "updated_at": "2024-03-01T00:00:00Z"
        }"#;
        let job: JobInfo = serde_json::from_str(body).unwrap();
        assert_eq!(job.status, "failed");
        assert_eq!(job.last_error.as_deref(), Some("timeout"));
        assert!(job.next_retry_at.is_some());
    }

    #[test]
    fn test_enqueue_request_omits_unset_fields() {
        let body = EnqueueRequest {
            owner_id: "u1".into(),
            query: "q".into(),
            output_format: None,
            source_limit: Some(5),
            focus_area: None,
            priority: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json, serde_json::json!({"owner_id": "u1", "query": "q", "source_limit": 5}));
    }
}
