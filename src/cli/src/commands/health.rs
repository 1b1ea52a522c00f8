//! Health check command.
//!
//! Queries `/health` and shows the overall status, the store tier currently
//! serving traffic and, with `--detailed`, every tier's probe result.

use anyhow::Result;
use clap::Args;
use serde_json::Value;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Args)]
pub struct HealthArgs {
    /// Include per-tier checks
    #[arg(short, long)]
    detailed: bool,
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

pub async fn execute(args: HealthArgs, client: &ApiClient, format: OutputFormat) -> Result<()> {
    let health: Value = client.get_raw("/health").await?;

    match format {
        OutputFormat::Table => {
            let status = str_field(&health, "status").unwrap_or("unknown");

            output::print_header("Queue Health");
            output::print_detail("Status", &output::colorize_status(status).to_string());
            output::print_detail("API URL", client.base_url());
            if let Some(store) = str_field(&health, "active_store") {
                output::print_detail("Active store", store);
            }
            if let Some(version) = str_field(&health, "version") {
                output::print_detail("Version", version);
            }
            if let Some(uptime) = health.get("uptime_secs").and_then(Value::as_u64) {
                output::print_detail("Uptime", &format!("{}s", uptime));
            }

            if args.detailed {
                if let Some(components) = health.get("components").and_then(Value::as_array) {
                    output::print_header("Store tiers");
                    for comp in components {
                        let name = str_field(comp, "name").unwrap_or("?");
                        let comp_status = str_field(comp, "status").unwrap_or("?");
                        let mut line = output::colorize_status(comp_status).to_string();
                        if let Some(ms) = comp.get("latency_ms").and_then(Value::as_u64) {
                            line.push_str(&format!(" ({}ms)", ms));
                        }
                        if let Some(error) = str_field(comp, "error") {
                            line.push_str(&format!(" - {}", error));
                        }
                        output::print_detail(name, &line);
                    }
                }
            }

            match status {
                "healthy" => output::print_success("All store tiers operational"),
                "degraded" => output::print_warning("Serving from a fallback store"),
                other => output::print_error(&format!("Queue status: {}", other)),
            }
        }
        _ => output::print_item(&health, format)?,
    }

    Ok(())
}
