//! Mv command - rename an entry.

use std::path::Path;

use anyhow::Result;
use clap::Args as ClapArgs;

use crate::Cli;
use crate::commands::{open_vault, resolve_entry};

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Entry name or file id
    pub entry: String,

    /// New entry name
    pub new_name: String,
}

pub fn execute(vault_path: &Path, args: &Args, cli: &Cli) -> Result<()> {
    let mut vault = open_vault(vault_path, cli)?;
    let file_id = resolve_entry(&vault, &args.entry)?;
    vault.rename_file(file_id, &args.new_name)?;
    println!("renamed {} -> {}", args.entry, args.new_name);
    Ok(())
}
