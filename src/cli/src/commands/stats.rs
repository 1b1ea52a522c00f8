//! Queue statistics command.

use anyhow::Result;
use clap::Args;
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct StatsArgs {
    /// Include worker counters
    #[arg(short, long)]
    worker: bool,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    pending: u64,
    processing: u64,
    completed: u64,
    failed: u64,
    dead_letter: u64,
    worker: WorkerStats,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkerStats {
    processed: u64,
    completed: u64,
    retried: u64,
    dead_lettered: u64,
    timeouts: u64,
    #[serde(default)]
    mean_duration_ms: Option<u64>,
}

#[derive(Tabled, Serialize)]
struct StatusRow {
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Jobs")]
    count: u64,
}

fn status_rows(stats: &StatsResponse) -> Vec<StatusRow> {
    [
        ("pending", stats.pending),
        ("processing", stats.processing),
        ("completed", stats.completed),
        ("failed", stats.failed),
        ("dead_letter", stats.dead_letter),
    ]
    .into_iter()
    .map(|(status, count)| StatusRow {
        status: output::colorize_status(status).to_string(),
        count,
    })
    .collect()
}

pub async fn execute(args: StatsArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let stats: StatsResponse = client.get("/api/v1/stats").await?;

    match format {
        OutputFormat::Table => {
            output::print_header("Queue");
            output::print_list(&status_rows(&stats), format)?;

            if args.worker {
                let w = &stats.worker;
                output::print_header("Worker");
                output::print_detail("Processed", &w.processed.to_string());
                output::print_detail("Completed", &w.completed.to_string());
                output::print_detail("Retried", &w.retried.to_string());
                output::print_detail("Dead-lettered", &w.dead_lettered.to_string());
                output::print_detail("Timeouts", &w.timeouts.to_string());
                let mean = w
                    .mean_duration_ms
                    .map(|ms| format!("{}ms", ms))
                    .unwrap_or_else(|| "-".into());
                output::print_detail("Mean duration", &mean);
            }

            if stats.dead_letter > 0 {
                output::print_warning(&format!(
                    "{} job(s) in the dead-letter queue",
                    stats.dead_letter
                ));
            }
        }
        _ => output::print_item(&stats, format)?,
    }

    Ok(())
}
