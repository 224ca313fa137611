//! Rm command - soft-delete an entry.

use std::path::Path;

use anyhow::Result;
use clap::Args as ClapArgs;

use crate::Cli;
use crate::commands::{open_vault, resolve_entry};
use crate::output::format_size;

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Entry name or file id
    pub entry: String,
}

pub fn execute(vault_path: &Path, args: &Args, cli: &Cli) -> Result<()> {
    let mut vault = open_vault(vault_path, cli)?;
    let file_id = resolve_entry(&vault, &args.entry)?;
    vault.delete_file(file_id)?;

    let stats = vault.stats();
    println!(
        "deleted {} ({} reclaimable, run `coffer compact` to reclaim)",
        args.entry,
        format_size(stats.free_space)
    );
    Ok(())
}
