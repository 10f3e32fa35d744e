//! Store initialization command.

use anyhow::Result;
use colored::Colorize;

use super::StoreOptions;

/// Executes the init command.
pub async fn execute(options: &StoreOptions) -> Result<()> {
    let store = options.open_store()?;

    println!("{}", "Memory store ready".bold().green());
    println!("  Root:        {}", store.root().display());
    println!("  Encryption:  {}", if store.is_encrypted() { "enabled" } else { "disabled" });
    println!("  Compression: {}", if store.config().compression { "enabled" } else { "disabled" });
    match store.config().max_size_gb {
        Some(gb) => println!("  Size cap:    {} GB", gb),
        None => println!("  Size cap:    none"),
    }

    Ok(())
}
