//! Stats command - size and free-space counters.

use std::path::Path;

use anyhow::Result;
use clap::Args as ClapArgs;

use crate::Cli;
use crate::commands::open_vault;
use crate::output::format_size;

#[derive(ClapArgs, Clone)]
pub struct Args {}

pub fn execute(vault_path: &Path, _args: &Args, cli: &Cli) -> Result<()> {
    let vault = open_vault(vault_path, cli)?;
    let stats = vault.stats();

    println!("entries:    {}", vault.list_files().len());
    println!("total size: {}", format_size(stats.total_size));
    println!("reclaimable:{}", format_size(stats.free_space));
    let params = vault.kdf_params();
    println!(
        "kdf:        argon2id mem={} iter={} parallel={}",
        format_size(u64::from(params.mem_bytes)),
        params.iterations,
        params.parallelism
    );
    Ok(())
}
