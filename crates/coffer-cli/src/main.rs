#![deny(unsafe_code)]

mod commands;
mod output;

use std::io::{IsTerminal, Read};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::{add, cat, compact, create, info, ls, mv, passwd, pending, rm, stats};

/// Command-line interface for coffer encrypted containers
#[derive(Parser)]
#[command(name = "coffer")]
#[command(author, version)]
#[command(propagate_version = true)]
#[command(after_help = "EXAMPLES:
    # Create a vault and add a file
    coffer create ~/photos.vault
    coffer add ~/photos.vault ~/Pictures/cat.jpg

    # List contents and read a file back
    coffer ls ~/photos.vault
    coffer cat ~/photos.vault cat.jpg > cat.jpg

    # Pipe the passphrase from a secret manager
    pass show vault | coffer --password-stdin ls ~/photos.vault
")]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Vault passphrase (insecure, prefer --password-stdin or COFFER_PASSWORD)
    #[arg(long, env = "COFFER_PASSWORD", hide_env_values = true, global = true)]
    password: Option<String>,

    /// Read the passphrase from stdin (single line)
    #[arg(long, conflicts_with = "password", global = true)]
    password_stdin: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new empty vault
    Create(VaultCommand<create::Args>),

    /// List vault entries
    Ls(VaultCommand<ls::Args>),

    /// Show container header details
    Info(VaultCommand<info::Args>),

    /// Add a file to the vault
    Add(VaultCommand<add::Args>),

    /// Write an entry's contents to stdout or a file
    Cat(VaultCommand<cat::Args>),

    /// Delete an entry
    Rm(VaultCommand<rm::Args>),

    /// Rename an entry
    Mv(VaultCommand<mv::Args>),

    /// Show size and free-space counters
    Stats(VaultCommand<stats::Args>),

    /// Reclaim orphaned space
    Compact(VaultCommand<compact::Args>),

    /// Change the vault passphrase
    Passwd(VaultCommand<passwd::Args>),

    /// Show or clean up pending streaming imports
    Pending(VaultCommand<pending::Args>),
}

/// A subcommand operating on a vault file.
#[derive(clap::Args)]
struct VaultCommand<A: clap::Args> {
    /// Path to the vault container
    vault: PathBuf,

    #[command(flatten)]
    args: A,
}

/// Resolve the passphrase from flag, environment, stdin, or a prompt.
fn read_passphrase(cli: &Cli, confirm: bool) -> Result<String> {
    if let Some(password) = &cli.password {
        return Ok(password.clone());
    }
    if cli.password_stdin {
        let mut line = String::new();
        std::io::stdin()
            .read_to_string(&mut line)
            .context("reading passphrase from stdin")?;
        return Ok(line.trim_end_matches(['\r', '\n']).to_string());
    }
    if !std::io::stdin().is_terminal() {
        bail!("no passphrase: use --password-stdin when stdin is not a terminal");
    }

    let passphrase = rpassword::prompt_password("Passphrase: ")?;
    if confirm {
        let again = rpassword::prompt_password("Confirm passphrase: ")?;
        if passphrase != again {
            bail!("passphrases do not match");
        }
    }
    Ok(passphrase)
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("coffer_core={default},coffer={default}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Create(cmd) => create::execute(&cmd.vault, &cmd.args, cli),
        Commands::Ls(cmd) => ls::execute(&cmd.vault, &cmd.args, cli),
        Commands::Info(cmd) => info::execute(&cmd.vault, &cmd.args, cli),
        Commands::Add(cmd) => add::execute(&cmd.vault, &cmd.args, cli),
        Commands::Cat(cmd) => cat::execute(&cmd.vault, &cmd.args, cli),
        Commands::Rm(cmd) => rm::execute(&cmd.vault, &cmd.args, cli),
        Commands::Mv(cmd) => mv::execute(&cmd.vault, &cmd.args, cli),
        Commands::Stats(cmd) => stats::execute(&cmd.vault, &cmd.args, cli),
        Commands::Compact(cmd) => compact::execute(&cmd.vault, &cmd.args, cli),
        Commands::Passwd(cmd) => passwd::execute(&cmd.vault, &cmd.args, cli),
        Commands::Pending(cmd) => pending::execute(&cmd.vault, &cmd.args, cli),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    // Size the KDF to the machine we are on; the LOW floor still applies.
    coffer_core::set_profile_by_ram(total_ram_mb());

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Total system RAM in MiB, read from /proc on Linux; 0 (LOW profile)
/// anywhere the probe fails.
fn total_ram_mb() -> u64 {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|meminfo| {
            meminfo.lines().find_map(|line| {
                let rest = line.strip_prefix("MemTotal:")?;
                let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
                Some(kb / 1024)
            })
        })
        .unwrap_or(0)
}
