//! Pattern listing command.

use aml_core::memory::Pattern;
use anyhow::Result;
use colored::Colorize;

use super::StoreOptions;

/// Executes the patterns command.
pub async fn execute(options: &StoreOptions, agent: &str, json: bool) -> Result<()> {
    let store = options.open_store()?;
    let patterns = store.get::<Pattern>(agent)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&patterns)?);
        return Ok(());
    }

    if patterns.is_empty() {
        println!("No patterns found for {}.", agent);
        return Ok(());
    }

    println!("{}", format!("Patterns for {}", agent).bold().cyan());
    println!("{:<30} {:>8} {:>10} {:>11} {:<8}", "ID", "Runs", "Success", "Confidence", "Active");
    println!("{}", "-".repeat(71));
    for pattern in patterns {
        let active = if pattern.active { "yes".green() } else { "no".yellow() };
        println!(
            "{:<30} {:>8} {:>9.0}% {:>11.2} {:<8}",
            pattern.id,
            pattern.metrics.execution_count,
            pattern.metrics.success_rate * 100.0,
            pattern.evolution.confidence_score,
            active
        );
    }

    Ok(())
}
