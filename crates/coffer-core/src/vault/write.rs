#![forbid(unsafe_code)]

//! The three write paths.
//!
//! * **Full rebuild** ([`Vault::save_container`]) — repack every payload
//!   contiguously after a fresh header + index and append a real trailing
//!   hash. Used by `create`, `compact`, and legacy-to-journal migration.
//! * **Fast append** ([`Vault::append_entry`]) — when the new index still fits
//!   the on-disk capacity, the payload is written over the trailing-hash
//!   placeholder, fsynced, and only then is the index section overwritten in
//!   place. The authenticated index is the commit point.
//! * **Fast index-only** ([`Vault::save_index_only`]) — rename/delete rewrite
//!   just the index section in place.
//!
//! Both fast paths fall back to `rewrite_path` when the index outgrows its
//! capacity: the index section grows by `delta`, every stored offset shifts by
//! `delta`, and the whole file is rebuilt through a temp file and an atomic
//! rename. Nothing commits without an fsync first.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write as _};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use crate::container::header::Header;
use crate::container::index;
use crate::crypto::{HASH_LEN, NONCE_LEN, hash};
use crate::error::VaultError;

use super::entry::{Entry, Storage};
use super::{Vault, parent_dir};

const COPY_BUF_LEN: usize = 64 * 1024;

/// Ciphertext a write path is about to place into the data region.
pub(crate) enum PayloadSource {
    /// Single blob: `content_nonce ‖ ciphertext ‖ tag` as one span.
    Blob(Vec<u8>),
    /// Per-chunk ciphertext; chunk nonces live in the entry's chunk table.
    Chunks(Vec<Vec<u8>>),
    /// Staged chunk files from a streaming import. Each file holds
    /// `nonce[24] ‖ ciphertext`; the nonce prefix is skipped on copy so a
    /// 50 GiB import never has to fit in memory.
    Staged(Vec<(PathBuf, u32)>),
}

impl PayloadSource {
    /// Bytes this payload will occupy in the data region.
    pub(crate) fn total_len(&self) -> u64 {
        match self {
            PayloadSource::Blob(data) => data.len() as u64,
            PayloadSource::Chunks(chunks) => chunks.iter().map(|c| c.len() as u64).sum(),
            PayloadSource::Staged(files) => files.iter().map(|(_, len)| u64::from(*len)).sum(),
        }
    }

    /// Sequential write for the temp-file paths.
    fn write_to<W: io::Write>(&self, writer: &mut W) -> Result<(), VaultError> {
        match self {
            PayloadSource::Blob(data) => writer.write_all(data)?,
            PayloadSource::Chunks(chunks) => {
                for chunk in chunks {
                    writer.write_all(chunk)?;
                }
            }
            PayloadSource::Staged(files) => {
                for (path, _) in files {
                    let mut src = File::open(path)?;
                    src.seek(SeekFrom::Start(NONCE_LEN as u64))?;
                    io::copy(&mut src, writer)?;
                }
            }
        }
        Ok(())
    }

    /// Positioned write for the fast append path.
    fn write_at(&self, file: &File, mut offset: u64) -> Result<(), VaultError> {
        match self {
            PayloadSource::Blob(data) => file.write_all_at(data, offset)?,
            PayloadSource::Chunks(chunks) => {
                for chunk in chunks {
                    file.write_all_at(chunk, offset)?;
                    offset += chunk.len() as u64;
                }
            }
            PayloadSource::Staged(files) => {
                let mut buf = vec![0u8; COPY_BUF_LEN];
                for (path, _) in files {
                    let mut src = File::open(path)?;
                    src.seek(SeekFrom::Start(NONCE_LEN as u64))?;
                    loop {
                        let n = src.read(&mut buf)?;
                        if n == 0 {
                            break;
                        }
                        file.write_all_at(&buf[..n], offset)?;
                        offset += n as u64;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Point an entry's storage at `base`, taking span lengths from the payload.
///
/// The entry's shape and the payload's shape must agree; a mismatch means the
/// caller built the pair inconsistently.
fn assign_offsets(
    entry: &mut Entry,
    payload: &PayloadSource,
    base: u64,
) -> Result<(), VaultError> {
    match (&mut entry.storage, payload) {
        (Storage::Blob { offset, length }, PayloadSource::Blob(data)) => {
            *offset = base;
            *length = data.len() as u64;
        }
        (Storage::Chunked(refs), PayloadSource::Chunks(chunks)) => {
            if refs.len() != chunks.len() {
                return Err(VaultError::InvalidParam("chunk table/payload mismatch"));
            }
            let mut offset = base;
            for (chunk_ref, chunk) in refs.iter_mut().zip(chunks) {
                chunk_ref.offset = offset;
                chunk_ref.length = chunk.len() as u32;
                offset += chunk.len() as u64;
            }
        }
        (Storage::Chunked(refs), PayloadSource::Staged(files)) => {
            if refs.len() != files.len() {
                return Err(VaultError::InvalidParam("chunk table/payload mismatch"));
            }
            let mut offset = base;
            for (chunk_ref, (_, len)) in refs.iter_mut().zip(files) {
                chunk_ref.offset = offset;
                chunk_ref.length = *len;
                offset += u64::from(*len);
            }
        }
        _ => return Err(VaultError::InvalidParam("storage shape/payload mismatch")),
    }
    Ok(())
}

fn shift_storage(storage: &mut Storage, delta: u64) {
    match storage {
        Storage::Blob { offset, .. } => *offset += delta,
        Storage::Chunked(refs) => {
            for chunk_ref in refs {
                chunk_ref.offset += delta;
            }
        }
    }
}

impl Vault {
    /// Append one new entry and its payload without touching existing data.
    ///
    /// Precondition for the in-place fast path: the index serialized with the
    /// new entry still fits the on-disk capacity, which also means the index
    /// ciphertext length is unchanged. Otherwise the container is rewritten
    /// with a grown index section.
    pub(crate) fn append_entry(
        &mut self,
        mut entry: Entry,
        payload: PayloadSource,
    ) -> Result<(), VaultError> {
        // Probe assignment: fixes lengths (offsets are rebased per path) and
        // validates the shape match before any size arithmetic.
        assign_offsets(&mut entry, &payload, 0)?;

        let mut entries = self.entries.clone();
        entries.push(entry);
        let required = index::serialized_len(&entries);

        if required <= self.index_capacity {
            self.append_fast(entries, payload)
        } else {
            tracing::debug!(required, capacity = self.index_capacity, "index full, rewriting");
            self.rewrite_path(entries, Some(payload), required)
        }
    }

    fn append_fast(
        &mut self,
        mut entries: Vec<Entry>,
        payload: PayloadSource,
    ) -> Result<(), VaultError> {
        let base = self.end_of_data();
        if let Some(new_entry) = entries.last_mut() {
            assign_offsets(new_entry, &payload, base)?;
        }
        let payload_len = payload.total_len();

        let section = index::encrypt_section(&self.master_key, &entries, self.index_capacity)?;
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;

        // Data first: the payload overwrites the old hash placeholder and is
        // made durable before the index that references it.
        payload.write_at(&file, base)?;
        file.sync_all()?;

        file.write_all_at(&section, self.header.byte_len())?;
        file.write_all_at(&[0u8; HASH_LEN], base + payload_len)?;
        file.sync_all()?;

        self.replace_entries(entries);
        self.total_size = base + payload_len + HASH_LEN as u64;
        self.index_padded = true;
        tracing::trace!(payload_len, total = self.total_size, "fast append committed");
        Ok(())
    }

    /// Persist the index section alone; data offsets are unchanged.
    ///
    /// Capacity is never shrunk here even when the entry list got smaller —
    /// the on-disk section keeps its size so the write stays in place.
    pub(crate) fn save_index_only(&mut self, entries: Vec<Entry>) -> Result<(), VaultError> {
        let required = index::serialized_len(&entries);

        if required <= self.index_capacity {
            let section = index::encrypt_section(&self.master_key, &entries, self.index_capacity)?;
            let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
            file.write_all_at(&section, self.header.byte_len())?;
            file.write_all_at(&[0u8; HASH_LEN], self.end_of_data())?;
            file.sync_all()?;

            self.replace_entries(entries);
            self.index_padded = true;
            tracing::trace!("index-only save committed in place");
            Ok(())
        } else {
            tracing::debug!(required, capacity = self.index_capacity, "index full, rewriting");
            self.rewrite_path(entries, None, required)
        }
    }

    /// Slow path shared by append and index-only saves: grow the index
    /// section, shift every stored offset by the growth delta, and rebuild
    /// the file through a temp file. Orphan bytes are preserved verbatim.
    fn rewrite_path(
        &mut self,
        mut entries: Vec<Entry>,
        new_payload: Option<PayloadSource>,
        required: usize,
    ) -> Result<(), VaultError> {
        let new_capacity = index::grow_capacity(required).max(self.index_capacity);
        let delta = index::section_len(new_capacity) - index::section_len(self.index_capacity);
        let old_data_start = self.data_start();
        let old_end = self.end_of_data();

        // The trailing element is the new entry when a payload rides along;
        // everything before it keeps its place, shifted by delta.
        let carried = entries.len() - usize::from(new_payload.is_some());
        for entry in &mut entries[..carried] {
            shift_storage(&mut entry.storage, delta);
        }
        if let Some(payload) = &new_payload
            && let Some(new_entry) = entries.last_mut()
        {
            assign_offsets(new_entry, payload, old_end + delta)?;
        }
        let payload_len = new_payload.as_ref().map_or(0, PayloadSource::total_len);

        let section = index::encrypt_section(&self.master_key, &entries, new_capacity)?;

        let old_file = File::open(&self.path)?;
        let tmp = tempfile::NamedTempFile::new_in(parent_dir(&self.path))?;
        let mut writer = tmp.as_file();

        writer.write_all(&self.header.encode())?;
        writer.write_all(&section)?;

        let mut src = &old_file;
        src.seek(SeekFrom::Start(old_data_start))?;
        io::copy(&mut src.take(old_end - old_data_start), &mut writer)?;

        if let Some(payload) = &new_payload {
            payload.write_to(&mut writer)?;
        }
        writer.write_all(&[0u8; HASH_LEN])?;

        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| VaultError::Io(e.error))?;

        self.replace_entries(entries);
        self.index_capacity = new_capacity;
        self.index_padded = true;
        self.total_size = self.header.byte_len()
            + index::section_len(new_capacity)
            + (old_end - old_data_start)
            + payload_len
            + HASH_LEN as u64;
        tracing::debug!(new_capacity, total = self.total_size, "rewrite committed");
        Ok(())
    }

    /// Full rebuild: pack `payloads` contiguously after a fresh header and
    /// index, recomputing every stored offset, and append a real trailing
    /// hash. Orphan bytes are dropped.
    pub(crate) fn save_container(
        &mut self,
        mut entries: Vec<Entry>,
        payloads: Vec<PayloadSource>,
        new_header: Header,
    ) -> Result<(), VaultError> {
        if entries.len() != payloads.len() {
            return Err(VaultError::InvalidParam("entry/payload count mismatch"));
        }

        let required = index::serialized_len(&entries);
        let capacity = if required <= self.index_capacity {
            self.index_capacity
        } else {
            index::grow_capacity(required)
        };

        let mut offset = new_header.byte_len() + index::section_len(capacity);
        for (entry, payload) in entries.iter_mut().zip(&payloads) {
            assign_offsets(entry, payload, offset)?;
            offset += payload.total_len();
        }

        let section = index::encrypt_section(&self.master_key, &entries, capacity)?;

        let tmp = tempfile::NamedTempFile::new_in(parent_dir(&self.path))?;
        let mut writer = hash::HashingWriter::new(tmp.as_file());
        writer.write_all(&new_header.encode())?;
        writer.write_all(&section)?;
        for payload in &payloads {
            payload.write_to(&mut writer)?;
        }
        let (digest, mut file) = writer.finalize();
        file.write_all(&digest)?;

        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| VaultError::Io(e.error))?;

        self.header = new_header;
        self.replace_entries(entries);
        self.index_capacity = capacity;
        self.index_padded = true;
        self.total_size = offset + HASH_LEN as u64;
        self.recompute_free_space();
        tracing::debug!(total = self.total_size, "container rebuilt");
        Ok(())
    }
}
