//! Create command - initialise a new empty vault.

use std::path::Path;

use anyhow::Result;
use clap::Args as ClapArgs;
use coffer_core::Vault;

use crate::Cli;

#[derive(ClapArgs, Clone)]
pub struct Args {}

pub fn execute(vault_path: &Path, _args: &Args, cli: &Cli) -> Result<()> {
    let passphrase = crate::read_passphrase(cli, true)?;
    let vault = Vault::create(vault_path, &passphrase)?;
    println!("created {} (vault id {})", vault_path.display(), hex::encode(vault.vault_id()));
    vault.close();
    Ok(())
}
