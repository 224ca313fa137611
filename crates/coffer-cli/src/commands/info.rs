//! Info command - container header details.

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
    let params = vault.kdf_params();

    println!("path:       {}", vault.path().display());
    println!("vault id:   {}", hex::encode(vault.vault_id()));
    match vault.journal_sequence() {
        Some(seq) => println!("header:     journal (seq {seq})"),
        None => println!("header:     legacy (migrates on next passphrase change)"),
    }
    println!("entries:    {}", vault.list_files().len());
    println!("total size: {}", format_size(stats.total_size));
    println!(
        "kdf:        argon2id mem={} iter={} parallel={}",
        format_size(u64::from(params.mem_bytes)),
        params.iterations,
        params.parallelism
    );
    Ok(())
}
