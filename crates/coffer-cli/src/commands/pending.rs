//! Pending command - inspect and clean up interrupted streaming imports.

use std::path::Path;

use anyhow::Result;
use clap::Args as ClapArgs;
use coffer_core::ImportId;

use crate::Cli;
use crate::commands::open_vault;
use crate::output::{create_table, format_size, format_timestamp};

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Abort one pending import (securely scrubbing its staged chunks)
    #[arg(long, value_name = "IMPORT_ID")]
    pub abort: Option<ImportId>,

    /// Scrub pending imports idle for longer than this many milliseconds
    /// (0 scrubs all)
    #[arg(long, value_name = "MS")]
    pub cleanup_age_ms: Option<u64>,
}

pub fn execute(vault_path: &Path, args: &Args, cli: &Cli) -> Result<()> {
    let mut vault = open_vault(vault_path, cli)?;

    if let Some(import_id) = args.abort {
        vault.streaming_abort(import_id)?;
        println!("aborted {import_id}");
        return Ok(());
    }
    if let Some(max_age_ms) = args.cleanup_age_ms {
        let removed = vault.streaming_cleanup_old(max_age_ms)?;
        println!("scrubbed {removed} pending import(s)");
        return Ok(());
    }

    let pending = vault.streaming_list_pending()?;
    if pending.is_empty() {
        println!("no pending imports");
        return Ok(());
    }

    let mut table = create_table();
    table.set_header(vec!["Import", "Name", "Progress", "Staged", "Updated"]);
    for state in pending {
        table.add_row(vec![
            state.import_id.to_string(),
            state.name.clone(),
            format!("{}/{} chunks", state.completed_chunks, state.total_chunks),
            format_size(state.bytes_written),
            format_timestamp(state.updated_at),
        ]);
    }
    println!("{table}");
    Ok(())
}
