//! AML CLI - command-line interface for the Adaptive Memory Layer
//!
//! This CLI provides an `aml` command for inspecting and maintaining an
//! agent memory store: initialization, listing agents and patterns, global
//! data, backups, pruning, schema migration, health checks and master key
//! generation.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::{
    BackupCommand, GlobalCommand, StrategyArg, agents, backup, global, health, init, keygen, migrate,
    patterns, prune,
};

/// AML - encrypted memory for multi-agent automation
#[derive(Parser, Debug)]
#[command(
    name = "aml",
    author,
    version,
    about = "Adaptive Memory Layer - encrypted, agent-namespaced memory store",
    long_about = "Adaptive Memory Layer (aml) keeps patterns, solutions and decisions learned by agents.\nConfiguration is read from ~/.aml/config.toml, ./aml.toml and AML_* environment variables.\nEncrypted stores read the master key from AML_MASTER_KEY."
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    /// Memory root (overrides storage.path)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Configuration file to use instead of discovery
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize the memory store
    ///
    /// Creates the global, audit and backup directories and writes the
    /// effective configuration to config.json. Safe to run repeatedly.
    Init,

    /// List agents with stored memory
    Agents {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List an agent's patterns
    Patterns {
        /// Agent name
        agent: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Read or write global cross-agent data
    #[command(subcommand)]
    Global(GlobalCommand),

    /// Create, inspect and restore agent backups
    #[command(subcommand)]
    Backup(BackupCommand),

    /// Remove stale, failing or low-value records
    ///
    /// Applies every strategy unless --strategy is given. Removed records
    /// are archived under backup/<agent>/archive/ unless prune.archive is
    /// disabled in the configuration.
    Prune {
        /// Strategy to apply (repeatable)
        #[arg(short, long, value_enum)]
        strategy: Vec<StrategyArg>,

        /// Only prune this agent
        #[arg(short, long)]
        agent: Option<String>,

        /// Report what would be removed without removing it
        #[arg(long)]
        dry_run: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Upgrade stored records to the current schema version
    Migrate {
        /// Skip the per-agent backup taken before migrating
        #[arg(long)]
        no_backup: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check store layout, capacity, file integrity and backups
    ///
    /// Exits with an error when the store is in critical state.
    Health {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate a new base64 master key
    ///
    /// Prints a key suitable for AML_MASTER_KEY. The key is never stored.
    Keygen,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let options = commands::StoreOptions { root: args.root, config: args.config };

    match args.command {
        Command::Init => init::execute(&options).await,
        Command::Agents { json } => agents::execute(&options, json).await,
        Command::Patterns { agent, json } => patterns::execute(&options, &agent, json).await,
        Command::Global(cmd) => global::execute(&options, cmd).await,
        Command::Backup(cmd) => backup::execute(&options, cmd).await,
        Command::Prune { strategy, agent, dry_run, json } => {
            prune::execute(&options, &strategy, agent.as_deref(), dry_run, json).await
        }
        Command::Migrate { no_backup, json } => migrate::execute(&options, !no_backup, json).await,
        Command::Health { json } => health::execute(&options, json).await,
        Command::Keygen => keygen::execute().await,
    }
}
