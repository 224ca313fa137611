//! Cat command - write an entry's plaintext to stdout or a file.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args as ClapArgs;
use coffer_core::Storage;

use crate::Cli;
use crate::commands::{open_vault, resolve_entry};

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Entry name or file id
    pub entry: String,

    /// Write to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

pub fn execute(vault_path: &Path, args: &Args, cli: &Cli) -> Result<()> {
    let vault = open_vault(vault_path, cli)?;
    let file_id = resolve_entry(&vault, &args.entry)?;

    let mut sink: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(std::fs::File::create(path)?),
        None => Box::new(std::io::stdout().lock()),
    };

    let entry = vault
        .list_files()
        .iter()
        .find(|e| e.file_id == file_id)
        .context("entry vanished while reading")?;

    match &entry.storage {
        Storage::Blob { .. } => {
            sink.write_all(&vault.read_file(file_id)?)?;
        }
        Storage::Chunked(_) => {
            // Chunked entries stream out one chunk at a time.
            for chunk_index in 0..entry.chunk_count() {
                sink.write_all(&vault.read_chunk(file_id, chunk_index)?)?;
            }
        }
    }
    sink.flush()?;
    Ok(())
}
