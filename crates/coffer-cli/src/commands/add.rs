//! Add command - import a file, streaming large sources in 4 MiB chunks.
//!
//! Imports above the streaming threshold go through the resumable path:
//! re-running the same `add` after an interruption picks up where the last
//! run stopped, keyed by the source fingerprint.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{Context, Result, bail};
use clap::Args as ClapArgs;
use coffer_core::crypto::hash::source_fingerprint;
use coffer_core::streaming::STREAMING_CHUNK_SIZE;
use coffer_core::{FileKind, Vault};

use crate::Cli;
use crate::commands::open_vault;
use crate::output::format_size;

/// Sources above this size take the resumable streaming path.
const STREAMING_THRESHOLD: u64 = 8 * 1024 * 1024;

const SAMPLE_LEN: u64 = 1024 * 1024;

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum KindArg {
    Text,
    Image,
    Video,
}

impl From<KindArg> for FileKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Text => FileKind::Text,
            KindArg::Image => FileKind::Image,
            KindArg::Video => FileKind::Video,
        }
    }
}

#[derive(ClapArgs, Clone)]
pub struct Args {
    /// File to import
    pub file: std::path::PathBuf,

    /// Entry name (default: source file name)
    #[arg(long)]
    pub name: Option<String>,

    /// MIME type (default: guessed from the extension)
    #[arg(long)]
    pub mime: Option<String>,

    /// Content kind (default: guessed from the MIME type)
    #[arg(long, value_enum)]
    pub kind: Option<KindArg>,
}

pub fn execute(vault_path: &Path, args: &Args, cli: &Cli) -> Result<()> {
    let mut vault = open_vault(vault_path, cli)?;

    let name = match &args.name {
        Some(name) => name.clone(),
        None => args
            .file
            .file_name()
            .and_then(|n| n.to_str())
            .context("source path has no usable file name")?
            .to_string(),
    };
    let mime = args
        .mime
        .clone()
        .unwrap_or_else(|| guess_mime(&args.file).to_string());
    let kind = args.kind.map_or_else(|| kind_from_mime(&mime), FileKind::from);

    let metadata = std::fs::metadata(&args.file)
        .with_context(|| format!("reading {}", args.file.display()))?;
    if !metadata.is_file() {
        bail!("{} is not a regular file", args.file.display());
    }

    let file_id = if metadata.len() > STREAMING_THRESHOLD {
        add_streaming(&mut vault, args, &name, &mime, kind, metadata.len())?
    } else {
        let data = std::fs::read(&args.file)?;
        vault.import_file(&data, kind, &name, &mime)?
    };

    println!("added {name} ({}) as {file_id}", format_size(metadata.len()));
    Ok(())
}

fn add_streaming(
    vault: &mut Vault,
    args: &Args,
    name: &str,
    mime: &str,
    kind: FileKind,
    file_size: u64,
) -> Result<coffer_core::FileId> {
    let mut source = File::open(&args.file)?;

    // Fingerprint: first MiB, last MiB (when distinct), and the size.
    let mut first = vec![0u8; file_size.min(SAMPLE_LEN) as usize];
    source.read_exact(&mut first)?;
    let hash = if file_size > 2 * SAMPLE_LEN {
        let mut last = vec![0u8; SAMPLE_LEN as usize];
        source.seek(SeekFrom::Start(file_size - SAMPLE_LEN))?;
        source.read_exact(&mut last)?;
        source_fingerprint(&first, Some(&last), file_size)
    } else {
        source_fingerprint(&first, None, file_size)
    };

    let uri = args.file.display().to_string();
    let (import_id, resume_from) =
        vault.streaming_start(&uri, hash, name, mime, kind, file_size)?;
    if resume_from > 0 {
        eprintln!("resuming import at chunk {resume_from}");
    }

    let chunk_size = u64::from(STREAMING_CHUNK_SIZE);
    let total_chunks = file_size.div_ceil(chunk_size) as u32;
    vault.streaming_set_progress(import_id, |progress| {
        eprint!(
            "\r{} / {} ({}/{} chunks)",
            format_size(progress.bytes_written),
            format_size(progress.total_bytes),
            progress.chunks_completed,
            progress.total_chunks
        );
    })?;

    source.seek(SeekFrom::Start(u64::from(resume_from) * chunk_size))?;
    let mut buf = vec![0u8; STREAMING_CHUNK_SIZE as usize];
    for chunk_index in resume_from..total_chunks {
        let want = if chunk_index + 1 == total_chunks {
            (file_size - chunk_size * u64::from(total_chunks - 1)) as usize
        } else {
            buf.len()
        };
        source.read_exact(&mut buf[..want])?;
        vault.streaming_write_chunk(import_id, &mut buf[..want], chunk_index)?;
    }
    eprintln!();

    Ok(vault.streaming_finish(import_id)?)
}

fn guess_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("mp4" | "m4v") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("webm") => "video/webm",
        Some("txt" | "md") => "text/plain",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn kind_from_mime(mime: &str) -> FileKind {
    if mime.starts_with("image/") {
        FileKind::Image
    } else if mime.starts_with("video/") {
        FileKind::Video
    } else {
        FileKind::Text
    }
}
