//! List command - show the vault index.

use std::path::Path;

use anyhow::Result;
use clap::Args as ClapArgs;

use crate::Cli;
use crate::commands::open_vault;
use crate::output::{create_table, format_kind, format_size, format_timestamp};

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// Show file ids and chunk counts
    #[arg(short, long)]
    long: bool,
}

pub fn execute(vault_path: &Path, args: &Args, cli: &Cli) -> Result<()> {
    let vault = open_vault(vault_path, cli)?;

    let mut table = create_table();
    if args.long {
        table.set_header(vec!["Name", "Type", "Size", "Chunks", "Created", "Id"]);
    } else {
        table.set_header(vec!["Name", "Type", "Size", "Created"]);
    }

    for entry in vault.list_files() {
        let mut row = vec![
            entry.name.clone(),
            format_kind(entry.kind).to_string(),
            format_size(entry.size),
        ];
        if args.long {
            row.push(entry.chunk_count().to_string());
        }
        row.push(format_timestamp(entry.created_at));
        if args.long {
            row.push(entry.file_id.to_string());
        }
        table.add_row(row);
    }

    println!("{table}");
    Ok(())
}
