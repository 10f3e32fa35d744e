//! Schema migration command.

use anyhow::{Context, Result};
use colored::Colorize;

use super::StoreOptions;

/// Executes the migrate command.
pub async fn execute(options: &StoreOptions, backup: bool, json: bool) -> Result<()> {
    let store = options.open_store()?;
    let report = store.migrate_to_latest(backup).context("Migration failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if !report.migrated() {
        println!("Schema is current (version {}).", report.to_version);
        return Ok(());
    }

    println!(
        "{} schema {} -> {}",
        "Migrated".green(),
        report.from_version,
        report.to_version
    );
    println!("  Records: {}", report.records_migrated);
    println!("  Files:   {}", report.files_updated);
    for (agent, backup_id) in &report.backups {
        println!("  Backup:  {} {}", agent, backup_id.dimmed());
    }

    Ok(())
}
