//! Compact command - reclaim orphaned space.

use std::path::Path;

use anyhow::Result;
use clap::Args as ClapArgs;

use crate::Cli;
use crate::commands::open_vault;
use crate::output::format_size;

#[derive(ClapArgs, Clone)]
pub struct Args {}

pub fn execute(vault_path: &Path, _args: &Args, cli: &Cli) -> Result<()> {
    let mut vault = open_vault(vault_path, cli)?;

    let before = vault.stats();
    vault.compact()?;
    let after = vault.stats();

    if after.total_size < before.total_size {
        println!(
            "compacted: {} -> {}",
            format_size(before.total_size),
            format_size(after.total_size)
        );
    } else {
        println!(
            "nothing to do ({} reclaimable of {})",
            format_size(before.free_space),
            format_size(before.total_size)
        );
    }
    Ok(())
}
