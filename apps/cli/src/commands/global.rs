//! Global data commands.

use anyhow::{Context, Result, anyhow};
use clap::Subcommand;
use serde_json::Value;

use super::StoreOptions;

/// Global data subcommands
#[derive(Subcommand, Debug)]
pub enum GlobalCommand {
    /// Print a namespace's value as JSON
    Get {
        /// Namespace name
        namespace: String,
    },
    /// Replace a namespace's value
    Set {
        /// Namespace name
        namespace: String,
        /// JSON value
        value: String,
    },
    /// List written namespaces
    List,
}

/// Execute global command
pub async fn execute(options: &StoreOptions, cmd: GlobalCommand) -> Result<()> {
    let store = options.open_store()?;

    match cmd {
        GlobalCommand::Get { namespace } => {
            let value = store
                .get_global_data(&namespace)?
                .ok_or_else(|| anyhow!("Global namespace '{}' not found", namespace))?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        GlobalCommand::Set { namespace, value } => {
            let value: Value =
                serde_json::from_str(&value).context("Value must be valid JSON")?;
            store.set_global_data(&namespace, &value)?;
            println!("Stored global namespace '{}'", namespace);
        }
        GlobalCommand::List => {
            for namespace in store.list_global_namespaces()? {
                println!("{}", namespace);
            }
        }
    }

    Ok(())
}
