#![forbid(unsafe_code)]

//! Resumable streaming imports.
//!
//! Large files (up to 50 GiB) are imported chunk by chunk into a staging
//! directory beside the container, so the host never holds more than one
//! plaintext chunk in memory and an interrupted import survives process
//! death. The staging tree is
//!
//! ```text
//! <vault_dir>/.pending_imports/<import_id_hex>/
//!     .state              versioned resume record (see [`state`])
//!     chunk_00000000.enc  nonce[24] ‖ ciphertext (one file per chunk)
//! ```
//!
//! State machine: `start` either allocates a fresh import or, when the source
//! fingerprint matches an on-disk pending import, resumes it at
//! `completed_chunks`. `write_chunk` encrypts and stages one chunk.
//! `finish` folds the staged ciphertext into the container via the append
//! path and scrubs the staging directory; `abort` scrubs without importing.

pub mod state;

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write as _};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rand::RngCore;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{HASH_LEN, ID_LEN, KEY_LEN, NONCE_LEN, TAG_LEN, aead, wipe};
use crate::error::VaultError;
use crate::vault::entry::{self, ChunkRef, Entry, FileId, FileKind, MAX_MIME_LEN, Storage};
use crate::vault::write::PayloadSource;
use crate::vault::{Vault, now_ms, parent_dir};

pub use state::ImportState;

/// Plaintext chunk size for streaming imports.
pub const STREAMING_CHUNK_SIZE: u32 = 4 * 1024 * 1024;

/// Ceiling on a streaming import source.
pub const MAX_STREAMING_FILE_SIZE: u64 = 50 * 1024 * 1024 * 1024;

/// At most this many import sessions are held in memory; the rest live on
/// disk and are loaded on demand.
const MAX_ACTIVE_IMPORTS: usize = 4;

/// Persist `.state` every N chunks (and always on the final one).
const STATE_SAVE_INTERVAL: u32 = 10;

const PENDING_DIR_NAME: &str = ".pending_imports";
const STATE_FILE_NAME: &str = ".state";

/// Unique identifier of an import session.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImportId(pub [u8; ID_LEN]);

impl ImportId {
    pub fn random() -> Self {
        Self(aead::random_id())
    }
}

impl fmt::Display for ImportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ImportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ImportId({self})")
    }
}

impl FromStr for ImportId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut id = [0u8; ID_LEN];
        hex::decode_to_slice(s, &mut id)?;
        Ok(Self(id))
    }
}

/// Snapshot passed to a progress callback after each staged chunk.
#[derive(Debug, Clone, Copy)]
pub struct ImportProgress {
    pub import_id: ImportId,
    pub bytes_written: u64,
    pub total_bytes: u64,
    pub chunks_completed: u32,
    pub total_chunks: u32,
}

type ProgressFn = Box<dyn Fn(&ImportProgress) + Send>;

struct Session {
    state: ImportState,
    progress: Option<ProgressFn>,
}

/// In-memory registry of active import sessions, bounded to
/// [`MAX_ACTIVE_IMPORTS`]; anything beyond that stays on disk.
pub(crate) struct ImportRegistry {
    sessions: Vec<Session>,
}

impl ImportRegistry {
    pub(crate) fn new() -> Self {
        Self {
            sessions: Vec::new(),
        }
    }

    fn position(&self, import_id: ImportId) -> Option<usize> {
        self.sessions
            .iter()
            .position(|s| s.state.import_id == import_id)
    }

    fn remove(&mut self, import_id: ImportId) {
        if let Some(index) = self.position(import_id) {
            self.sessions.remove(index);
        }
    }
}

fn chunk_file_name(chunk_index: u32) -> String {
    format!("chunk_{chunk_index:08}.enc")
}

fn save_state(dir: &Path, state: &ImportState) -> Result<(), VaultError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dir.join(STATE_FILE_NAME))?;
    file.write_all(&state.encode())?;
    file.sync_all()?;
    Ok(())
}

fn load_state(dir: &Path) -> Result<ImportState, VaultError> {
    let bytes = fs::read(dir.join(STATE_FILE_NAME)).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            VaultError::NotFound
        } else {
            VaultError::Io(e)
        }
    })?;
    let mut state = ImportState::decode(&bytes)?;
    reconcile_staged_chunks(dir, &mut state);
    Ok(state)
}

/// Credit chunks staged after the last `.state` persist.
///
/// `.state` is only flushed every few chunks, but each chunk file lands by an
/// atomic rename, so its presence proves the chunk completed. Progress on
/// disk is therefore the persisted count extended by the contiguous chunk
/// files that follow it.
fn reconcile_staged_chunks(dir: &Path, state: &mut ImportState) {
    while state.completed_chunks < state.total_chunks {
        let Ok(metadata) = dir.join(chunk_file_name(state.completed_chunks)).metadata() else {
            break;
        };
        if metadata.len() < (NONCE_LEN + TAG_LEN) as u64 {
            break;
        }
        state.completed_chunks += 1;
        state.bytes_written += metadata.len() - (NONCE_LEN + TAG_LEN) as u64;
    }
}

/// Random-overwrite and unlink everything in a staging directory, then remove
/// the directory itself.
fn scrub_import_dir(dir: &Path) -> Result<(), VaultError> {
    for dir_entry in fs::read_dir(dir)? {
        let path = dir_entry?.path();
        if path.is_file() {
            wipe::secure_wipe_file(&path)?;
            fs::remove_file(&path)?;
        }
    }
    fs::remove_dir(dir)?;
    Ok(())
}

impl Vault {
    fn pending_root(&self) -> PathBuf {
        parent_dir(&self.path).join(PENDING_DIR_NAME)
    }

    fn import_dir(&self, import_id: ImportId) -> PathBuf {
        self.pending_root().join(import_id.to_string())
    }

    /// Bring a session into the registry, loading its state from disk if it
    /// is not already resident. Evicts the stalest resident session (after
    /// persisting its state) when the registry is full.
    fn ensure_session(&mut self, import_id: ImportId) -> Result<usize, VaultError> {
        if let Some(index) = self.imports.position(import_id) {
            return Ok(index);
        }

        let dir = self.import_dir(import_id);
        if !dir.is_dir() {
            return Err(VaultError::NotFound);
        }
        let state = load_state(&dir)?;
        self.register_session(state)
    }

    fn register_session(&mut self, state: ImportState) -> Result<usize, VaultError> {
        if self.imports.sessions.len() >= MAX_ACTIVE_IMPORTS {
            // Evict the session that has gone longest without a write, not
            // whichever happens to sit at the front of the table.
            let stalest = self
                .imports
                .sessions
                .iter()
                .enumerate()
                .min_by_key(|(_, session)| session.state.updated_at)
                .map(|(index, _)| index);
            if let Some(index) = stalest {
                let evicted = self.imports.sessions.remove(index);
                let dir = self.import_dir(evicted.state.import_id);
                save_state(&dir, &evicted.state)?;
                tracing::trace!(import = %evicted.state.import_id, "import session evicted");
            }
        }
        self.imports.sessions.push(Session {
            state,
            progress: None,
        });
        Ok(self.imports.sessions.len() - 1)
    }

    /// Start a new streaming import, or resume the pending one whose source
    /// fingerprint matches.
    ///
    /// Returns the import id and the chunk index to resume from (0 for a
    /// fresh import). The source URI is used for diagnostics only and is
    /// never persisted.
    pub fn streaming_start(
        &mut self,
        source_uri: &str,
        source_hash: [u8; HASH_LEN],
        name: &str,
        mime: &str,
        kind: FileKind,
        file_size: u64,
    ) -> Result<(ImportId, u32), VaultError> {
        if file_size == 0 {
            return Err(VaultError::InvalidParam("empty source file"));
        }
        if file_size > MAX_STREAMING_FILE_SIZE {
            return Err(VaultError::TooLarge);
        }
        if !entry::validate_new_name(name) {
            return Err(VaultError::InvalidParam("illegal entry name"));
        }
        if mime.len() > MAX_MIME_LEN {
            return Err(VaultError::InvalidParam("mime string too long"));
        }

        // Resume scan: a pending import with the same fingerprint wins.
        for pending in self.streaming_list_pending()? {
            if pending.source_hash == source_hash {
                let import_id = pending.import_id;
                let resume_from = pending.completed_chunks;
                if self.imports.position(import_id).is_none() {
                    self.register_session(pending)?;
                }
                tracing::debug!(import = %import_id, resume_from, uri = source_uri, "import resumed");
                return Ok((import_id, resume_from));
            }
        }

        let import_id = ImportId::random();
        let file_id = FileId::random();
        let mut dek = Zeroizing::new([0u8; KEY_LEN]);
        rand::rng().fill_bytes(&mut dek[..]);
        let wrapped_dek = self.wrap_dek(file_id, &dek)?;
        drop(dek);

        let now = now_ms();
        let state = ImportState {
            import_id,
            file_id,
            source_hash,
            kind,
            file_size,
            chunk_size: STREAMING_CHUNK_SIZE,
            total_chunks: file_size.div_ceil(u64::from(STREAMING_CHUNK_SIZE)) as u32,
            completed_chunks: 0,
            bytes_written: 0,
            created_at: now,
            updated_at: now,
            name: name.to_string(),
            mime: mime.to_string(),
            wrapped_dek,
        };

        let dir = self.import_dir(import_id);
        create_staging_dir(&dir)?;
        save_state(&dir, &state)?;
        self.register_session(state)?;

        tracing::debug!(import = %import_id, file_size, uri = source_uri, "import started");
        Ok((import_id, 0))
    }

    /// Encrypt and stage one chunk.
    ///
    /// The chunk must be exactly `chunk_size` bytes, except the final chunk
    /// which carries the remainder. The plaintext buffer is zeroed before
    /// returning. State is persisted every few chunks and on the final one.
    pub fn streaming_write_chunk(
        &mut self,
        import_id: ImportId,
        plaintext: &mut [u8],
        chunk_index: u32,
    ) -> Result<(), VaultError> {
        let session = self.ensure_session(import_id)?;
        let (file_id, file_size, chunk_size, total_chunks, wrapped_dek) = {
            let state = &self.imports.sessions[session].state;
            (
                state.file_id,
                state.file_size,
                state.chunk_size,
                state.total_chunks,
                state.wrapped_dek.clone(),
            )
        };

        if chunk_index >= total_chunks {
            return Err(VaultError::InvalidParam("chunk index out of range"));
        }
        let expected = if chunk_index + 1 == total_chunks {
            file_size - u64::from(chunk_size) * u64::from(total_chunks - 1)
        } else {
            u64::from(chunk_size)
        };
        if plaintext.len() as u64 != expected {
            return Err(VaultError::InvalidParam("chunk length mismatch"));
        }

        let dek = self.unwrap_dek(file_id, &wrapped_dek)?;
        let aad = aead::Aad::new(self.vault_id(), file_id.0, chunk_index).to_bytes();
        let (nonce, ciphertext) = aead::encrypt(&dek, None, &aad, plaintext)?;
        plaintext.zeroize();

        // Stage atomically: a crash mid-write must not leave a half chunk
        // that a resume would count as complete.
        let dir = self.import_dir(import_id);
        let final_path = dir.join(chunk_file_name(chunk_index));
        let tmp_path = dir.join(format!("{}.tmp", chunk_file_name(chunk_index)));
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(&nonce)?;
            file.write_all(&ciphertext)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;

        let progress = {
            let state = &mut self.imports.sessions[session].state;
            state.completed_chunks = chunk_index + 1;
            state.bytes_written += expected;
            state.updated_at = now_ms();

            if state.completed_chunks % STATE_SAVE_INTERVAL == 0
                || state.completed_chunks == state.total_chunks
            {
                save_state(&dir, state)?;
            }
            ImportProgress {
                import_id,
                bytes_written: state.bytes_written,
                total_bytes: state.file_size,
                chunks_completed: state.completed_chunks,
                total_chunks: state.total_chunks,
            }
        };

        if let Some(callback) = &self.imports.sessions[session].progress {
            callback(&progress);
        }
        tracing::trace!(import = %import_id, chunk_index, "chunk staged");
        Ok(())
    }

    /// Fold a fully staged import into the container.
    ///
    /// Requires every chunk to be staged. The chunk nonces move into the
    /// entry's chunk table, the ciphertext is streamed into the data region
    /// via the append path, and the staging directory is scrubbed.
    pub fn streaming_finish(&mut self, import_id: ImportId) -> Result<FileId, VaultError> {
        let session = self.ensure_session(import_id)?;
        let state = self.imports.sessions[session].state.clone();

        if state.completed_chunks != state.total_chunks {
            return Err(VaultError::InvalidParam("import incomplete"));
        }

        let dir = self.import_dir(import_id);
        let mut refs = Vec::with_capacity(state.total_chunks as usize);
        let mut staged = Vec::with_capacity(state.total_chunks as usize);
        for chunk_index in 0..state.total_chunks {
            let path = dir.join(chunk_file_name(chunk_index));
            let mut file = File::open(&path)?;
            let len = file.metadata()?.len();
            if len < (NONCE_LEN + TAG_LEN) as u64 {
                return Err(crate::container::FormatError::Truncated.into());
            }
            let mut nonce = [0u8; NONCE_LEN];
            file.read_exact(&mut nonce)?;

            let ciphertext_len = (len - NONCE_LEN as u64) as u32;
            refs.push(ChunkRef {
                offset: 0,
                length: ciphertext_len,
                nonce,
            });
            staged.push((path, ciphertext_len));
        }

        let new_entry = Entry {
            file_id: state.file_id,
            kind: state.kind,
            created_at: state.created_at,
            name: state.name.clone(),
            mime: state.mime.clone(),
            size: state.file_size,
            wrapped_dek: state.wrapped_dek.clone(),
            storage: Storage::Chunked(refs),
        };
        self.append_entry(new_entry, PayloadSource::Staged(staged))?;

        self.imports.remove(import_id);
        scrub_import_dir(&dir)?;

        tracing::debug!(import = %import_id, file = %state.file_id, "import finished");
        Ok(state.file_id)
    }

    /// Abort an import: securely scrub every staged file and remove the
    /// staging directory.
    pub fn streaming_abort(&mut self, import_id: ImportId) -> Result<(), VaultError> {
        self.imports.remove(import_id);

        let dir = self.import_dir(import_id);
        if !dir.is_dir() {
            return Err(VaultError::InvalidParam("unknown import"));
        }
        scrub_import_dir(&dir)?;
        tracing::debug!(import = %import_id, "import aborted");
        Ok(())
    }

    /// All pending imports found on disk, resident or not.
    pub fn streaming_list_pending(&self) -> Result<Vec<ImportState>, VaultError> {
        let root = self.pending_root();
        let mut pending = Vec::new();
        let entries = match fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(pending),
            Err(e) => return Err(e.into()),
        };
        for dir_entry in entries {
            let path = dir_entry?.path();
            if !path.is_dir() {
                continue;
            }
            match load_state(&path) {
                Ok(state) => pending.push(state),
                Err(err) => {
                    tracing::warn!(dir = %path.display(), %err, "skipping unreadable import state");
                }
            }
        }
        Ok(pending)
    }

    /// State of one import session.
    pub fn streaming_get_state(&self, import_id: ImportId) -> Result<ImportState, VaultError> {
        if let Some(index) = self.imports.position(import_id) {
            return Ok(self.imports.sessions[index].state.clone());
        }
        let dir = self.import_dir(import_id);
        if !dir.is_dir() {
            return Err(VaultError::NotFound);
        }
        load_state(&dir)
    }

    /// Scrub pending imports older than `max_age_ms` (0 scrubs everything).
    ///
    /// Returns how many staging directories were removed.
    pub fn streaming_cleanup_old(&mut self, max_age_ms: u64) -> Result<usize, VaultError> {
        let root = self.pending_root();
        let entries = match fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let now = now_ms();
        let mut removed = 0usize;
        for dir_entry in entries {
            let path = dir_entry?.path();
            if !path.is_dir() {
                continue;
            }
            let stale = if max_age_ms == 0 {
                true
            } else {
                match load_state(&path) {
                    Ok(state) => now.saturating_sub(state.updated_at) > max_age_ms,
                    Err(_) => false,
                }
            };
            if stale {
                if let Ok(state) = load_state(&path) {
                    self.imports.remove(state.import_id);
                }
                scrub_import_dir(&path)?;
                removed += 1;
            }
        }
        tracing::debug!(removed, "stale imports cleaned up");
        Ok(removed)
    }

    /// Register a progress callback for an import; it is invoked on the
    /// thread calling [`Vault::streaming_write_chunk`].
    pub fn streaming_set_progress(
        &mut self,
        import_id: ImportId,
        callback: impl Fn(&ImportProgress) + Send + 'static,
    ) -> Result<(), VaultError> {
        let session = self.ensure_session(import_id)?;
        self.imports.sessions[session].progress = Some(Box::new(callback));
        Ok(())
    }
}

#[cfg(unix)]
fn create_staging_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_staging_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)
}
