//! One module per subcommand.

pub mod add;
pub mod cat;
pub mod compact;
pub mod create;
pub mod info;
pub mod ls;
pub mod mv;
pub mod passwd;
pub mod pending;
pub mod rm;
pub mod stats;

use std::path::Path;

use anyhow::{Result, bail};
use coffer_core::{FileId, Vault};

use crate::Cli;

/// Open the vault with the passphrase resolved from the global flags.
pub(crate) fn open_vault(path: &Path, cli: &Cli) -> Result<Vault> {
    let passphrase = crate::read_passphrase(cli, false)?;
    Ok(Vault::open(path, &passphrase)?)
}

/// Resolve an entry selector: a 32-hex-digit file id, or an entry name.
pub(crate) fn resolve_entry(vault: &Vault, selector: &str) -> Result<FileId> {
    if let Ok(file_id) = selector.parse::<FileId>()
        && vault.list_files().iter().any(|e| e.file_id == file_id)
    {
        return Ok(file_id);
    }

    let mut matches = vault.list_files().iter().filter(|e| e.name == selector);
    match (matches.next(), matches.next()) {
        (Some(entry), None) => Ok(entry.file_id),
        (Some(_), Some(_)) => bail!("multiple entries named {selector:?}; use the file id"),
        (None, _) => bail!("no entry named {selector:?}"),
    }
}
