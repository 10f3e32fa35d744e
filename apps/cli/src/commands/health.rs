//! Store health command.

use anyhow::{Result, bail};
use aml_core::memory::HealthStatus;
use colored::Colorize;

use super::StoreOptions;
use super::agents::format_size;

/// Executes the health command; fails when the store is critical.
pub async fn execute(options: &StoreOptions, json: bool) -> Result<()> {
    let store = options.open_store()?;
    let report = store.health_check()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let status = match report.status {
            HealthStatus::Healthy => report.status.as_str().green(),
            HealthStatus::Warning => report.status.as_str().yellow(),
            HealthStatus::Critical => report.status.as_str().red(),
        };
        println!("{} {}", "Memory store".bold(), status.bold());
        for (check, passed) in &report.checks {
            let mark = if *passed { "ok".green() } else { "fail".red() };
            println!("  {:<20} {}", check, mark);
        }

        let stats = &report.stats;
        println!(
            "  {} agent(s), {} pattern(s), {} solution(s), {} decision(s), {}",
            stats.agent_count,
            stats.patterns,
            stats.solutions,
            stats.decisions,
            format_size(stats.total_size_bytes)
        );
        for warning in &report.warnings {
            println!("  {} {}", "warning:".yellow(), warning);
        }
        for error in &report.errors {
            println!("  {} {}", "error:".red(), error);
        }
    }

    if report.status == HealthStatus::Critical {
        bail!("Memory store is in critical state");
    }
    Ok(())
}
