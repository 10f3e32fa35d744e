//! Memory pruning command.

use anyhow::{Context, Result};
use aml_core::memory::{PruneReport, PruneStrategy};
use clap::ValueEnum;
use colored::Colorize;

use super::StoreOptions;
use super::agents::format_size;

/// Strategy names accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StrategyArg {
    /// Records unused past their maximum age
    Time,
    /// Failing patterns, broken solutions and regretted decisions
    Performance,
    /// Lowest-value patterns of oversized agents
    Space,
}

impl From<StrategyArg> for PruneStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Time => Self::TimeBased,
            StrategyArg::Performance => Self::PerformanceBased,
            StrategyArg::Space => Self::SpaceBased,
        }
    }
}

/// Executes the prune command.
pub async fn execute(
    options: &StoreOptions,
    strategies: &[StrategyArg],
    agent: Option<&str>,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let (store, config) = options.open_store_with_config()?;
    let strategies: Vec<PruneStrategy> = if strategies.is_empty() {
        PruneStrategy::ALL.to_vec()
    } else {
        strategies.iter().copied().map(PruneStrategy::from).collect()
    };

    let reports = match agent {
        Some(agent) => strategies
            .iter()
            .map(|&strategy| store.prune_agent(agent, strategy, &config.prune, dry_run))
            .collect::<aml_core::memory::Result<Vec<_>>>()
            .with_context(|| format!("Failed to prune {}", agent))?,
        None => store.prune_all(&strategies, &config.prune, dry_run)?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    let total: usize = reports.iter().map(PruneReport::count).sum();
    if total == 0 {
        println!("Nothing to prune.");
        return Ok(());
    }

    let heading = if dry_run { "Would prune" } else { "Pruned" };
    for report in reports.iter().filter(|report| report.count() > 0) {
        println!(
            "{} {} record(s) from {} ({})",
            heading.bold(),
            report.count(),
            report.agent.cyan(),
            report.strategy
        );
        for record in &report.pruned {
            println!("  {:<10} {:<30} {:?}", record.collection, record.id, record.reason);
        }
        if !dry_run {
            println!("  freed {}", format_size(report.bytes_freed()));
        }
        if let Some(ref archive) = report.archive {
            println!("  archived to {}", archive.dimmed());
        }
    }

    Ok(())
}
