//! Master key generation command.

use aml_core::security::MasterKey;
use anyhow::Result;

use super::MASTER_KEY_ENV;

/// Executes the keygen command.
pub async fn execute() -> Result<()> {
    let key = MasterKey::generate();
    let encoded = key.to_base64()?;

    println!("{}", encoded.as_str());
    eprintln!("Store this key safely; export it as {} to open encrypted stores.", MASTER_KEY_ENV);

    Ok(())
}
