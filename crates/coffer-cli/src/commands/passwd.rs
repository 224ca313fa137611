//! Passwd command - rotate the vault passphrase.

use std::path::Path;

use anyhow::{Result, bail};
use clap::Args as ClapArgs;

use crate::Cli;

#[derive(ClapArgs, Clone)]
pub struct Args {}

pub fn execute(vault_path: &Path, _args: &Args, cli: &Cli) -> Result<()> {
    let old_passphrase = crate::read_passphrase(cli, false)?;
    let mut vault = coffer_core::Vault::open(vault_path, &old_passphrase)?;

    if !std::io::IsTerminal::is_terminal(&std::io::stdin()) {
        bail!("passwd needs a terminal to prompt for the new passphrase");
    }
    let new_passphrase = rpassword::prompt_password("New passphrase: ")?;
    let again = rpassword::prompt_password("Confirm new passphrase: ")?;
    if new_passphrase != again {
        bail!("passphrases do not match");
    }

    vault.change_password(&old_passphrase, &new_passphrase)?;
    println!("passphrase changed");
    Ok(())
}
