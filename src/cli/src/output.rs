//! Output formatting for rqctl: tables, JSON and YAML.

use anyhow::{Context, Result};
use clap::ValueEnum;
use colored::*;
use serde::Serialize;
use tabled::{
    settings::{object::Columns, Alignment, Modify, Style},
    Table, Tabled,
};

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Render as a formatted table
    #[default]
    Table,
    /// Render as JSON
    Json,
    /// Render as YAML
    Yaml,
}

pub fn print_success(msg: &str) {
    println!("{} {}", "[OK]".green().bold(), msg);
}

/// Print an error message to stderr.
pub fn print_error(msg: &str) {
    eprintln!("{} {}", "[ERROR]".red().bold(), msg);
}

pub fn print_warning(msg: &str) {
    println!("{} {}", "[WARN]".yellow().bold(), msg);
}

pub fn print_info(msg: &str) {
    println!("{} {}", "[INFO]".blue().bold(), msg);
}

fn render_json<T: Serialize + ?Sized>(item: &T) -> Result<String> {
    serde_json::to_string_pretty(item).context("Failed to serialize output as JSON")
}

fn render_yaml<T: Serialize + ?Sized>(item: &T) -> Result<String> {
    serde_yaml::to_string(item).context("Failed to serialize output as YAML")
}

/// Print rows in the requested format. Tables use the `Tabled` view, JSON and
/// YAML the `Serialize` one.
pub fn print_list<T: Tabled + Serialize>(items: &[T], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("{}", "No results found.".dimmed());
                return Ok(());
            }
            let table = Table::new(items)
                .with(Style::rounded())
                .with(Modify::new(Columns::first()).with(Alignment::left()))
                .to_string();
            println!("{}", table);
        }
        OutputFormat::Json => println!("{}", render_json(items)?),
        OutputFormat::Yaml => print!("{}", render_yaml(items)?),
    }
    Ok(())
}

/// Print a single item as JSON or YAML. Table mode falls back to JSON.
pub fn print_item<T: Serialize>(item: &T, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table | OutputFormat::Json => println!("{}", render_json(item)?),
        OutputFormat::Yaml => print!("{}", render_yaml(item)?),
    }
    Ok(())
}

pub fn print_detail(key: &str, value: &str) {
    println!("  {}: {}", key.cyan(), value);
}

pub fn print_header(title: &str) {
    println!();
    println!("{}", title.bold().underline());
    println!();
}

/// Color a job or health status word for table output.
pub fn colorize_status(status: &str) -> ColoredString {
    match status {
        "completed" | "healthy" => status.green(),
        "pending" | "processing" => status.blue(),
        "failed" | "degraded" => status.yellow(),
        "dead_letter" | "unhealthy" => status.red().bold(),
        other => other.normal(),
    }
}
