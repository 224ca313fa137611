#![forbid(unsafe_code)]

//! The vault handle: one open container, its key material, and its index.
//!
//! [`Vault`] replaces the classic global-state engine with a typed owner:
//! [`Vault::create`] / [`Vault::open`] are the only ways to obtain one, every
//! operation is a method, and dropping the handle zeroizes all key material.
//! A `&mut Vault` is therefore proof that the container is open and that no
//! other mutation is in flight; callers serialize mutating operations by
//! ordinary Rust borrowing.
//!
//! Two writers on the same container file are unsupported: there is no file
//! lock, and a second process will corrupt the first.

pub mod entry;
pub mod operations;
pub(crate) mod write;

use std::fs::File;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use secrecy::{ExposeSecret, SecretBox};
use zeroize::{Zeroize, Zeroizing};

use crate::container::header::{self, Header, HeaderFields};
use crate::container::{MIN_PASSPHRASE_LEN, WRAPPED_MK_LEN, index};
use crate::crypto::{HASH_LEN, ID_LEN, KEY_LEN, MasterKey, NONCE_LEN, SALT_LEN, TAG_LEN, aead, hash};
use crate::crypto::kdf::{self, KdfParams};
use crate::error::VaultError;
use crate::streaming::ImportRegistry;

pub use entry::{ChunkRef, Entry, FileId, FileKind, Storage};

/// Size and occupancy counters for an open vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaultStats {
    /// Container file size in bytes.
    pub total_size: u64,
    /// Bytes no longer referenced by any live entry (orphans from soft
    /// deletes plus trailing slack), reclaimable by `compact`.
    pub free_space: u64,
}

/// An open vault.
pub struct Vault {
    pub(crate) path: PathBuf,
    pub(crate) header: Header,
    pub(crate) master_key: MasterKey,
    pub(crate) entries: Vec<Entry>,
    pub(crate) total_size: u64,
    pub(crate) free_space: u64,
    /// Plaintext capacity the on-disk index was encrypted at.
    pub(crate) index_capacity: usize,
    /// Whether the on-disk index carried the padded-count flag.
    pub(crate) index_padded: bool,
    pub(crate) imports: ImportRegistry,
}

impl Vault {
    /// Create a new container at `path` and return the open handle.
    ///
    /// Fails with `AlreadyExists` if the path is occupied and
    /// `PassphraseTooShort` below the 12-byte minimum. The missing parent
    /// directory is created with mode `0700`. New containers always get the
    /// journal header flavor, with KDF costs from the process-wide profile.
    pub fn create(path: impl AsRef<Path>, passphrase: &str) -> Result<Self, VaultError> {
        let path = path.as_ref();
        if passphrase.len() < MIN_PASSPHRASE_LEN {
            return Err(VaultError::PassphraseTooShort);
        }
        if path.exists() {
            return Err(VaultError::AlreadyExists(path.to_path_buf()));
        }
        let parent = parent_dir(path);
        if !parent.exists() {
            create_private_dir(&parent)?;
        }

        let mut salt = [0u8; SALT_LEN];
        rand::rng().fill_bytes(&mut salt);
        let vault_id = aead::random_id();
        let master_key = MasterKey::random()?;

        // Derive first, then read back the profile: a LOW fallback inside the
        // derivation must be the profile the header records.
        let kek = kdf::derive_adaptive(passphrase.as_bytes(), &salt)?;
        let kdf_params = kdf::active_params();

        let wrapped_mk = wrap_master_key(&kek, &master_key, &vault_id)?;
        drop(kek);

        let header = Header::Journal {
            seq: 1,
            fields: HeaderFields {
                vault_id,
                salt,
                kdf: kdf_params,
                wrapped_mk,
            },
        };

        let index_capacity = index::grow_capacity(index::serialized_len(&[]));
        let index_section = index::encrypt_section(&master_key, &[], index_capacity)?;

        let tmp = tempfile::NamedTempFile::new_in(&parent)?;
        let mut writer = hash::HashingWriter::new(tmp.as_file());
        writer.write_all(&header.encode())?;
        writer.write_all(&index_section)?;
        let (digest, mut file) = writer.finalize();
        file.write_all(&digest)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| VaultError::Io(e.error))?;

        tracing::debug!(path = %path.display(), "vault created");

        let mut vault = Vault {
            path: path.to_path_buf(),
            header,
            master_key,
            entries: Vec::new(),
            total_size: 0,
            free_space: 0,
            index_capacity,
            index_padded: true,
            imports: ImportRegistry::new(),
        };
        vault.total_size =
            vault.header.byte_len() + index::section_len(index_capacity) + HASH_LEN as u64;
        vault.recompute_free_space();
        Ok(vault)
    }

    /// Open an existing container.
    ///
    /// The KEK is derived with the KDF parameters stored in the header, so a
    /// container created under any profile opens anywhere. A wrong passphrase
    /// and a tampered wrapped master key both surface as `AuthFailed`.
    pub fn open(path: impl AsRef<Path>, passphrase: &str) -> Result<Self, VaultError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                VaultError::NotFound
            } else {
                VaultError::Io(e)
            }
        })?;
        let total_size = file.metadata()?.len();

        let header = header::read_header(&file)?;
        let fields = header.fields();

        let kek = kdf::derive_with_params(passphrase.as_bytes(), &fields.salt, fields.kdf)?;
        let master_key = unwrap_master_key(&kek, &fields.wrapped_mk, &fields.vault_id)?;
        drop(kek);

        let raw_index = index::read_section(&file, header.byte_len())?;
        let index_capacity = raw_index.capacity();
        let (entries, index_padded) = raw_index.open(&master_key)?;

        let mut vault = Vault {
            path: path.to_path_buf(),
            header,
            master_key,
            entries,
            total_size,
            free_space: 0,
            index_capacity,
            index_padded,
            imports: ImportRegistry::new(),
        };
        vault.validate_spans()?;
        vault.recompute_free_space();

        tracing::debug!(
            path = %path.display(),
            entries = vault.entries.len(),
            journal = vault.header.is_journal(),
            padded = vault.index_padded,
            "vault opened"
        );
        Ok(vault)
    }

    /// Close the vault, zeroizing all key material.
    ///
    /// Equivalent to dropping the handle; provided for call sites that want
    /// the teardown to be visible.
    pub fn close(self) {}

    /// Read-only view of the index, in insertion order.
    pub fn list_files(&self) -> &[Entry] {
        &self.entries
    }

    /// Current size and free-space counters.
    pub fn stats(&self) -> VaultStats {
        VaultStats {
            total_size: self.total_size,
            free_space: self.free_space,
        }
    }

    /// The container path this handle was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The public vault identifier.
    pub fn vault_id(&self) -> [u8; ID_LEN] {
        self.header.fields().vault_id
    }

    /// KDF parameters this container's header stores.
    pub fn kdf_params(&self) -> KdfParams {
        self.header.fields().kdf
    }

    pub(crate) fn find_entry(&self, file_id: FileId) -> Option<usize> {
        self.entries.iter().position(|e| e.file_id == file_id)
    }

    /// Swap in a new entry list, wiping the secrets held by the old one.
    pub(crate) fn replace_entries(&mut self, new_entries: Vec<Entry>) {
        for entry in &mut self.entries {
            entry.wipe();
        }
        self.entries = new_entries;
    }

    /// Offset of the first data byte (end of header + index section).
    pub(crate) fn data_start(&self) -> u64 {
        self.header.byte_len() + index::section_len(self.index_capacity)
    }

    /// End of the data region (start of the trailing hash field).
    pub(crate) fn end_of_data(&self) -> u64 {
        self.total_size - HASH_LEN as u64
    }

    fn validate_spans(&self) -> Result<(), VaultError> {
        let data_start = self.data_start();
        let data_end = self.end_of_data();
        for entry in &self.entries {
            if entry.storage.start_offset() < data_start || entry.storage.end_offset() > data_end {
                return Err(crate::container::FormatError::SpanOutOfBounds.into());
            }
        }
        Ok(())
    }

    pub(crate) fn recompute_free_space(&mut self) {
        let end = self
            .entries
            .iter()
            .map(|e| e.storage.end_offset())
            .max()
            .unwrap_or(0)
            .max(self.data_start());
        self.free_space = self.total_size.saturating_sub(end);
    }

    /// Unwrap an entry's DEK under the master key.
    pub(crate) fn unwrap_dek(
        &self,
        file_id: FileId,
        wrapped_dek: &[u8],
    ) -> Result<Zeroizing<[u8; KEY_LEN]>, VaultError> {
        if wrapped_dek.len() < NONCE_LEN + TAG_LEN {
            return Err(VaultError::InvalidParam("wrapped DEK too short"));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&wrapped_dek[..NONCE_LEN]);
        let aad = aead::Aad::new(self.vault_id(), file_id.0, 0).to_bytes();

        let plaintext = self
            .master_key
            .with_key(|key| aead::decrypt(key, &nonce, &aad, &wrapped_dek[NONCE_LEN..]))
            .map_err(crate::crypto::CryptoError::from)??;
        if plaintext.len() != KEY_LEN {
            return Err(VaultError::Corrupted(
                crate::container::FormatError::BadIndexField("wrapped DEK payload"),
            ));
        }
        let mut dek = Zeroizing::new([0u8; KEY_LEN]);
        dek.copy_from_slice(&plaintext);
        Ok(dek)
    }

    /// Wrap a fresh DEK under the master key, bound to `(vault_id, file_id, 0)`.
    pub(crate) fn wrap_dek(
        &self,
        file_id: FileId,
        dek: &[u8; KEY_LEN],
    ) -> Result<Vec<u8>, VaultError> {
        let aad = aead::Aad::new(self.vault_id(), file_id.0, 0).to_bytes();
        let (nonce, ciphertext) = self
            .master_key
            .with_key(|key| aead::encrypt(key, None, &aad, dek))
            .map_err(crate::crypto::CryptoError::from)??;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }
}

impl Drop for Vault {
    fn drop(&mut self) {
        let fields = self.header.fields_mut();
        fields.salt.zeroize();
        fields.vault_id.zeroize();
        fields.wrapped_mk.zeroize();
        for entry in &mut self.entries {
            entry.wipe();
        }
        // The master key slot zeroizes itself when MemSafe drops.
    }
}

/// Wrap the master key under a KEK: `nonce ‖ ciphertext ‖ tag`, AAD-bound to
/// the vault id.
pub(crate) fn wrap_master_key(
    kek: &SecretBox<[u8; KEY_LEN]>,
    master_key: &MasterKey,
    vault_id: &[u8; ID_LEN],
) -> Result<[u8; WRAPPED_MK_LEN], VaultError> {
    let (nonce, ciphertext) = master_key
        .with_key(|key| aead::encrypt(kek.expose_secret(), None, vault_id, key))
        .map_err(crate::crypto::CryptoError::from)??;

    let mut out = [0u8; WRAPPED_MK_LEN];
    out[..NONCE_LEN].copy_from_slice(&nonce);
    out[NONCE_LEN..].copy_from_slice(&ciphertext);
    Ok(out)
}

/// Unwrap the master key from a header's wrapped blob into a protected slot.
pub(crate) fn unwrap_master_key(
    kek: &SecretBox<[u8; KEY_LEN]>,
    wrapped_mk: &[u8; WRAPPED_MK_LEN],
    vault_id: &[u8; ID_LEN],
) -> Result<MasterKey, VaultError> {
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&wrapped_mk[..NONCE_LEN]);

    let plaintext = aead::decrypt(kek.expose_secret(), &nonce, vault_id, &wrapped_mk[NONCE_LEN..])?;
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&plaintext);
    Ok(MasterKey::new(*key)?)
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new().recursive(true).mode(0o700).create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> io::Result<()> {
    std::fs::create_dir_all(path)
}
