#![forbid(unsafe_code)]

//! Entry operations on an open vault: import, read, delete, rename,
//! compaction, and passphrase rotation.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;

use rand::RngCore;
use secrecy::ExposeSecret;
use zeroize::Zeroizing;

use crate::container::header::{self, Header, HeaderFields};
use crate::container::{CHUNK_SIZE, FormatError, MIN_PASSPHRASE_LEN};
use crate::crypto::kdf;
use crate::crypto::{CryptoError, KEY_LEN, NONCE_LEN, SALT_LEN, TAG_LEN, aead, wipe};
use crate::error::VaultError;

use super::entry::{self, ChunkRef, Entry, FileId, FileKind, MAX_MIME_LEN, Storage};
use super::write::PayloadSource;
use super::{Vault, now_ms, wrap_master_key};

/// Blobs above this size are stored chunked regardless of their type tag, so
/// reads never have to materialise more than one chunk of ciphertext.
const OVERSIZE_BLOB_LIMIT: usize = 64 * 1024 * 1024;

impl Vault {
    /// Import a file held in memory, returning its new id.
    ///
    /// Text and images are stored as a single blob; video — and any payload
    /// over 64 MiB — is split into 1 MiB plaintext chunks, each independently
    /// encrypted under the entry's DEK.
    pub fn import_file(
        &mut self,
        data: &[u8],
        kind: FileKind,
        name: &str,
        mime: &str,
    ) -> Result<FileId, VaultError> {
        if data.is_empty() {
            return Err(VaultError::InvalidParam("empty file data"));
        }
        if !entry::validate_new_name(name) {
            return Err(VaultError::InvalidParam("illegal entry name"));
        }
        if mime.len() > MAX_MIME_LEN {
            return Err(VaultError::InvalidParam("mime string too long"));
        }

        let file_id = FileId::random();
        let mut dek = Zeroizing::new([0u8; KEY_LEN]);
        rand::rng().fill_bytes(&mut dek[..]);
        let wrapped_dek = self.wrap_dek(file_id, &dek)?;

        let chunked = kind == FileKind::Video || data.len() > OVERSIZE_BLOB_LIMIT;
        let (storage, payload) = if chunked {
            let mut refs = Vec::new();
            let mut chunks = Vec::new();
            for (index, chunk) in data.chunks(CHUNK_SIZE).enumerate() {
                let aad = aead::Aad::new(self.vault_id(), file_id.0, index as u32).to_bytes();
                let (nonce, ciphertext) = aead::encrypt(&dek, None, &aad, chunk)?;
                refs.push(ChunkRef {
                    offset: 0,
                    length: ciphertext.len() as u32,
                    nonce,
                });
                chunks.push(ciphertext);
            }
            (Storage::Chunked(refs), PayloadSource::Chunks(chunks))
        } else {
            let aad = aead::Aad::new(self.vault_id(), file_id.0, 0).to_bytes();
            let (nonce, ciphertext) = aead::encrypt(&dek, None, &aad, data)?;
            let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
            blob.extend_from_slice(&nonce);
            blob.extend_from_slice(&ciphertext);
            (
                Storage::Blob {
                    offset: 0,
                    length: blob.len() as u64,
                },
                PayloadSource::Blob(blob),
            )
        };

        let new_entry = Entry {
            file_id,
            kind,
            created_at: now_ms(),
            name: name.to_string(),
            mime: mime.to_string(),
            size: data.len() as u64,
            wrapped_dek,
            storage,
        };
        self.append_entry(new_entry, payload)?;

        tracing::debug!(%file_id, size = data.len(), chunked, "file imported");
        Ok(file_id)
    }

    /// Read a single-blob entry in full.
    ///
    /// Chunked entries are rejected with `InvalidParam`; use
    /// [`Vault::read_chunk`] for those. The returned buffer is zeroed when
    /// dropped.
    pub fn read_file(&self, file_id: FileId) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let entry = &self.entries[self.find_entry(file_id).ok_or(VaultError::NotFound)?];
        let (offset, length) = match entry.storage {
            Storage::Blob { offset, length } => (offset, length),
            Storage::Chunked(_) => {
                return Err(VaultError::InvalidParam("chunked entry, use read_chunk"));
            }
        };
        if length < (NONCE_LEN + TAG_LEN) as u64 {
            return Err(FormatError::Truncated.into());
        }

        let dek = self.unwrap_dek(file_id, &entry.wrapped_dek)?;

        let file = File::open(&self.path)?;
        let mut blob = Zeroizing::new(vec![0u8; length as usize]);
        file.read_exact_at(&mut blob, offset)?;

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&blob[..NONCE_LEN]);
        let aad = aead::Aad::new(self.vault_id(), file_id.0, 0).to_bytes();
        aead::decrypt(&dek, &nonce, &aad, &blob[NONCE_LEN..]).map_err(VaultError::from)
    }

    /// Read one chunk of a chunked entry.
    pub fn read_chunk(
        &self,
        file_id: FileId,
        chunk_index: u32,
    ) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let entry = &self.entries[self.find_entry(file_id).ok_or(VaultError::NotFound)?];
        let refs = match &entry.storage {
            Storage::Chunked(refs) => refs,
            Storage::Blob { .. } => {
                return Err(VaultError::InvalidParam("blob entry, use read_file"));
            }
        };
        let chunk = refs.get(chunk_index as usize).ok_or(VaultError::NotFound)?;
        if chunk.length < TAG_LEN as u32 {
            return Err(FormatError::Truncated.into());
        }

        let dek = self.unwrap_dek(file_id, &entry.wrapped_dek)?;

        let file = File::open(&self.path)?;
        let mut ciphertext = Zeroizing::new(vec![0u8; chunk.length as usize]);
        file.read_exact_at(&mut ciphertext, chunk.offset)?;

        let aad = aead::Aad::new(self.vault_id(), file_id.0, chunk_index).to_bytes();
        aead::decrypt(&dek, &chunk.nonce, &aad, &ciphertext).map_err(VaultError::from)
    }

    /// Soft-delete an entry.
    ///
    /// The index record is removed; the ciphertext stays orphaned in the data
    /// region until [`Vault::compact`] reclaims it. Offsets of every other
    /// entry are untouched.
    pub fn delete_file(&mut self, file_id: FileId) -> Result<(), VaultError> {
        let index = self.find_entry(file_id).ok_or(VaultError::NotFound)?;
        let freed = self.entries[index].storage.data_len();

        let mut entries = self.entries.clone();
        let mut removed = entries.remove(index);
        self.save_index_only(entries)?;
        removed.wipe();

        self.free_space += freed;
        tracing::debug!(%file_id, freed, "entry deleted");
        Ok(())
    }

    /// Rename an entry. Reserved `__` names are only reachable from other
    /// allow-listed system names.
    pub fn rename_file(&mut self, file_id: FileId, new_name: &str) -> Result<(), VaultError> {
        let index = self.find_entry(file_id).ok_or(VaultError::NotFound)?;
        if !entry::validate_rename(&self.entries[index].name, new_name) {
            return Err(VaultError::InvalidParam("illegal rename"));
        }

        let mut entries = self.entries.clone();
        entries[index].name = new_name.to_string();
        self.save_index_only(entries)?;
        Ok(())
    }

    /// Reclaim orphaned space by rebuilding the container.
    ///
    /// A no-op until orphans reach 25% of the file; then every live payload
    /// is re-read and repacked contiguously.
    pub fn compact(&mut self) -> Result<(), VaultError> {
        if self.free_space * 100 < self.total_size * 25 {
            tracing::debug!(
                free = self.free_space,
                total = self.total_size,
                "compaction not needed"
            );
            return Ok(());
        }

        let payloads = self.load_payloads()?;
        let entries = self.entries.clone();
        let new_header = self.header.clone();
        self.save_container(entries, payloads, new_header)?;
        tracing::debug!(total = self.total_size, "container compacted");
        Ok(())
    }

    /// Rotate the passphrase (and salt) protecting the master key.
    ///
    /// Journal containers commit the new credentials as a new slot with the
    /// next sequence number; the data region is untouched. Legacy containers
    /// take the only flavor-changing path there is: a full rewrite that
    /// migrates them to the journal header.
    pub fn change_password(
        &mut self,
        old_passphrase: &str,
        new_passphrase: &str,
    ) -> Result<(), VaultError> {
        if old_passphrase.len() < MIN_PASSPHRASE_LEN || new_passphrase.len() < MIN_PASSPHRASE_LEN {
            return Err(VaultError::PassphraseTooShort);
        }

        let fields = self.header.fields().clone();

        // Verify the old passphrase: the stored wrapped MK must authenticate
        // under the old KEK, and the unwrapped key must match the one in the
        // slot.
        let old_kek =
            kdf::derive_with_params(old_passphrase.as_bytes(), &fields.salt, fields.kdf)?;
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&fields.wrapped_mk[..NONCE_LEN]);
        let unwrapped = aead::decrypt(
            old_kek.expose_secret(),
            &nonce,
            &fields.vault_id,
            &fields.wrapped_mk[NONCE_LEN..],
        )?;
        let matches = self
            .master_key
            .with_key(|key| wipe::memcmp_ct(&unwrapped, key))
            .map_err(CryptoError::from)?;
        drop(unwrapped);
        if !matches {
            return Err(VaultError::AuthFailed);
        }

        let mut new_salt = [0u8; SALT_LEN];
        rand::rng().fill_bytes(&mut new_salt);
        let new_kek = kdf::derive_with_params(new_passphrase.as_bytes(), &new_salt, fields.kdf)?;
        let new_wrapped = wrap_master_key(&new_kek, &self.master_key, &fields.vault_id)?;
        drop(new_kek);

        let new_fields = HeaderFields {
            vault_id: fields.vault_id,
            salt: new_salt,
            kdf: fields.kdf,
            wrapped_mk: new_wrapped,
        };

        if let Some(seq) = self.journal_sequence() {
            let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
            let new_seq = header::rotate_slot(&file, seq, &new_fields)?;
            self.header = Header::Journal {
                seq: new_seq,
                fields: new_fields,
            };
            tracing::debug!(seq = new_seq, "passphrase rotated in place");
        } else {
            // Legacy containers have no slots to rotate; migrate to the
            // journal flavor through a full rewrite.
            let payloads = self.load_payloads()?;
            let entries = self.entries.clone();
            self.save_container(
                entries,
                payloads,
                Header::Journal {
                    seq: 1,
                    fields: new_fields,
                },
            )?;
            tracing::debug!("legacy container migrated to journal header");
        }
        Ok(())
    }

    /// The active journal sequence number, if this container has the journal
    /// header flavor.
    pub fn journal_sequence(&self) -> Option<u32> {
        match &self.header {
            Header::Journal { seq, .. } => Some(*seq),
            Header::Legacy(_) => None,
        }
    }

    /// Materialise every live payload from disk, for rebuild paths.
    fn load_payloads(&self) -> Result<Vec<PayloadSource>, VaultError> {
        let file = File::open(&self.path)?;
        let mut payloads = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let payload = match &entry.storage {
                Storage::Blob { offset, length } => {
                    let mut data = vec![0u8; *length as usize];
                    file.read_exact_at(&mut data, *offset)?;
                    PayloadSource::Blob(data)
                }
                Storage::Chunked(refs) => {
                    let mut chunks = Vec::with_capacity(refs.len());
                    for chunk in refs {
                        let mut data = vec![0u8; chunk.length as usize];
                        file.read_exact_at(&mut data, chunk.offset)?;
                        chunks.push(data);
                    }
                    PayloadSource::Chunks(chunks)
                }
            };
            payloads.push(payload);
        }
        Ok(payloads)
    }
}
