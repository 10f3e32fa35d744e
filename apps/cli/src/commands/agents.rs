//! Agent listing command.

use anyhow::Result;
use colored::Colorize;

use super::StoreOptions;

/// Executes the agents command.
pub async fn execute(options: &StoreOptions, json: bool) -> Result<()> {
    let store = options.open_store()?;
    let summaries = store
        .list_agents()?
        .iter()
        .map(|agent| store.summarize(agent))
        .collect::<aml_core::memory::Result<Vec<_>>>()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    if summaries.is_empty() {
        println!("No agents found.");
        return Ok(());
    }

    println!("{}", "Agents".bold().cyan());
    println!("{:<30} {:>9} {:>10} {:>10} {:>12}", "Agent", "Patterns", "Solutions", "Decisions", "Size");
    println!("{}", "-".repeat(75));
    for summary in summaries {
        println!(
            "{:<30} {:>9} {:>10} {:>10} {:>12}",
            summary.agent,
            summary.patterns,
            summary.solutions,
            summary.decisions,
            format_size(summary.size_bytes)
        );
    }

    Ok(())
}

/// Formats a byte count for display.
pub fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let bytes = bytes as f64;
    if bytes < KB {
        format!("{} B", bytes)
    } else if bytes < KB * KB {
        format!("{:.1} KB", bytes / KB)
    } else {
        format!("{:.1} MB", bytes / (KB * KB))
    }
}
