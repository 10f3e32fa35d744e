//! Backup commands for snapshotting and restoring agent memory.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use colored::Colorize;

use super::StoreOptions;
use super::agents::format_size;

/// Backup subcommands
#[derive(Subcommand, Debug)]
pub enum BackupCommand {
    /// Snapshot an agent's memory
    Create {
        /// Agent name
        agent: String,
    },
    /// List an agent's backups, newest first
    List {
        /// Agent name
        agent: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a backup's checksums
    Verify {
        /// Agent name
        agent: String,
        /// Backup ID
        backup_id: String,
    },
    /// Overwrite an agent's memory with a backup
    Restore {
        /// Agent name
        agent: String,
        /// Backup ID
        #[arg(required_unless_present = "at")]
        backup_id: Option<String>,
        /// Restore the newest backup taken at or before this RFC 3339 time
        #[arg(long, conflicts_with = "backup_id")]
        at: Option<DateTime<Utc>>,
    },
    /// Delete old backups
    Prune {
        /// Agent name
        agent: String,
        /// Number of most recent backups to keep
        #[arg(long, default_value = "5")]
        keep: usize,
    },
    /// Delete backups older than the retention period, keeping the newest
    Rotate {
        /// Agent name
        agent: String,
        /// Retention in days (defaults to backup.retentionDays)
        #[arg(long)]
        retention_days: Option<i64>,
    },
}

/// Execute backup command
pub async fn execute(options: &StoreOptions, cmd: BackupCommand) -> Result<()> {
    let (store, config) = options.open_store_with_config()?;

    match cmd {
        BackupCommand::Create { agent } => {
            let backup_id = store
                .backup_agent_memory(&agent)
                .with_context(|| format!("Failed to back up {}", agent))?;
            println!("{} {}", "Created backup".green(), backup_id);
        }
        BackupCommand::List { agent, json } => {
            let backups = store.list_backups(&agent)?;
            if json {
                let manifests: Vec<_> = backups.iter().map(|b| &b.manifest).collect();
                println!("{}", serde_json::to_string_pretty(&manifests)?);
            } else if backups.is_empty() {
                println!("No backups found for {}.", agent);
            } else {
                println!("{:<45} {:<20} {:>6} {:>10}", "ID", "Created", "Files", "Size");
                println!("{}", "-".repeat(84));
                for backup in backups {
                    println!(
                        "{:<45} {:<20} {:>6} {:>10}",
                        backup.manifest.backup_id,
                        backup.manifest.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        backup.manifest.files.len(),
                        format_size(backup.size_bytes)
                    );
                }
            }
        }
        BackupCommand::Verify { agent, backup_id } => {
            let manifest = store
                .verify_backup(&agent, &backup_id)
                .with_context(|| format!("Backup {} failed verification", backup_id))?;
            println!("{} {} ({} files)", "Verified".green(), backup_id, manifest.files.len());
        }
        BackupCommand::Restore { agent, backup_id, at } => {
            let manifest = match (backup_id, at) {
                (Some(backup_id), _) => store
                    .restore_agent_memory(&agent, &backup_id)
                    .with_context(|| format!("Failed to restore {} into {}", backup_id, agent))?,
                (None, Some(at)) => store
                    .restore_to_point_in_time(&agent, at)
                    .with_context(|| format!("Failed to restore {} as of {}", agent, at))?,
                (None, None) => anyhow::bail!("Either a backup ID or --at is required"),
            };
            println!("{} {} into {}", "Restored".green(), manifest.backup_id, agent);
        }
        BackupCommand::Prune { agent, keep } => {
            let deleted = store.prune_backups(&agent, keep)?;
            println!("Deleted {} backup(s), kept at most {}", deleted.len(), keep);
            for backup_id in deleted {
                println!("  {}", backup_id.dimmed());
            }
        }
        BackupCommand::Rotate { agent, retention_days } => {
            let days = retention_days.unwrap_or(config.backup.retention_days);
            let deleted = store.rotate_backups(&agent, days)?;
            println!("Deleted {} backup(s) older than {} day(s)", deleted.len(), days);
            for backup_id in deleted {
                println!("  {}", backup_id.dimmed());
            }
        }
    }

    Ok(())
}
