#![forbid(unsafe_code)]

//! Index entries: one record per stored file.

use std::fmt;
use std::str::FromStr;

use zeroize::Zeroize;

use crate::crypto::{ID_LEN, NONCE_LEN, aead};

/// Maximum entry name length in bytes.
pub const MAX_NAME_LEN: usize = 4096;
/// Maximum MIME string length in bytes.
pub const MAX_MIME_LEN: usize = 512;
/// Maximum wrapped-DEK length in bytes.
pub const MAX_WRAPPED_DEK_LEN: usize = 512;

/// Names the host reserves for its own system records.
const ALLOWED_SYSTEM_NAMES: [&str; 4] = [
    "__folder_map__",
    "__folder_map__.tmp",
    "__vault_title__",
    "__vault_title__.tmp",
];

/// Unique identifier of a stored file.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub [u8; ID_LEN]);

impl FileId {
    /// Generate a fresh random id.
    pub fn random() -> Self {
        Self(aead::random_id())
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({self})")
    }
}

impl FromStr for FileId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut id = [0u8; ID_LEN];
        hex::decode_to_slice(s, &mut id)?;
        Ok(Self(id))
    }
}

/// Coarse content classification.
///
/// The type tag is advisory metadata for the host UI; the storage shape is
/// carried separately (see [`Storage`]), since streaming imports store any
/// type chunked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileKind {
    Text = 1,
    Image = 2,
    Video = 3,
}

impl FileKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(FileKind::Text),
            2 => Some(FileKind::Image),
            3 => Some(FileKind::Video),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// Location of one encrypted chunk inside the data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRef {
    pub offset: u64,
    /// Ciphertext length (plaintext + tag).
    pub length: u32,
    pub nonce: [u8; NONCE_LEN],
}

/// Storage shape of an entry, fixed at import time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Storage {
    /// Single blob: `content_nonce ‖ ciphertext ‖ tag` at one span.
    Blob { offset: u64, length: u64 },
    /// Ordered chunk table; each chunk is independently authenticated.
    Chunked(Vec<ChunkRef>),
}

impl Storage {
    pub fn chunk_count(&self) -> u32 {
        match self {
            Storage::Blob { .. } => 0,
            Storage::Chunked(chunks) => chunks.len() as u32,
        }
    }

    /// Total ciphertext bytes this entry occupies in the data region.
    pub fn data_len(&self) -> u64 {
        match self {
            Storage::Blob { length, .. } => *length,
            Storage::Chunked(chunks) => chunks.iter().map(|c| u64::from(c.length)).sum(),
        }
    }

    /// End offset of the last byte this entry references.
    pub fn end_offset(&self) -> u64 {
        match self {
            Storage::Blob { offset, length } => offset + length,
            Storage::Chunked(chunks) => chunks
                .iter()
                .map(|c| c.offset + u64::from(c.length))
                .max()
                .unwrap_or(0),
        }
    }

    /// Lowest offset this entry references.
    pub fn start_offset(&self) -> u64 {
        match self {
            Storage::Blob { offset, .. } => *offset,
            Storage::Chunked(chunks) => chunks.iter().map(|c| c.offset).min().unwrap_or(0),
        }
    }
}

/// One index record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub file_id: FileId,
    pub kind: FileKind,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at: u64,
    pub name: String,
    pub mime: String,
    /// Original plaintext size in bytes.
    pub size: u64,
    /// Per-file DEK wrapped under the master key:
    /// `nonce ‖ ciphertext ‖ tag`, AAD-bound to (vault_id, file_id, 0).
    pub wrapped_dek: Vec<u8>,
    pub storage: Storage,
}

impl Entry {
    pub fn chunk_count(&self) -> u32 {
        self.storage.chunk_count()
    }

    /// Zero the entry's sensitive material. Called from the vault handle's
    /// teardown; the wrapped DEK and names never outlive the handle in clear
    /// heap memory.
    pub(crate) fn wipe(&mut self) {
        self.name.zeroize();
        self.mime.zeroize();
        self.wrapped_dek.zeroize();
    }
}

/// Is `name` on the reserved-prefix allow-list?
pub(crate) fn is_allowed_system_name(name: &str) -> bool {
    ALLOWED_SYSTEM_NAMES.contains(&name)
}

/// Validate a name for a new entry (import or streaming start).
///
/// Host-reserved `__` names are rejected unless allow-listed.
pub(crate) fn validate_new_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && (!name.starts_with("__") || is_allowed_system_name(name))
}

/// Validate a rename transition.
///
/// System records may only be renamed to other system names, and ordinary
/// entries can never move into the reserved namespace.
pub(crate) fn validate_rename(current: &str, new: &str) -> bool {
    if new.is_empty() || new.len() > MAX_NAME_LEN {
        return false;
    }
    let new_is_system = is_allowed_system_name(new);
    if new.starts_with("__") && !new_is_system {
        return false;
    }
    if current.starts_with("__") {
        is_allowed_system_name(current) && new_is_system
    } else {
        !new_is_system
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_id_hex_roundtrip() {
        let id = FileId([0xA5; ID_LEN]);
        let parsed: FileId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn kind_tags() {
        assert_eq!(FileKind::from_tag(1), Some(FileKind::Text));
        assert_eq!(FileKind::from_tag(3), Some(FileKind::Video));
        assert_eq!(FileKind::from_tag(0), None);
        assert_eq!(FileKind::from_tag(9), None);
        assert_eq!(FileKind::Image.tag(), 2);
    }

    #[test]
    fn new_name_rules() {
        assert!(validate_new_name("photo.jpg"));
        assert!(validate_new_name("__folder_map__"));
        assert!(validate_new_name("__vault_title__.tmp"));
        assert!(!validate_new_name("__secret"));
        assert!(!validate_new_name(""));
        assert!(!validate_new_name(&"x".repeat(MAX_NAME_LEN + 1)));
    }

    #[test]
    fn rename_rules() {
        // Ordinary renames
        assert!(validate_rename("a.txt", "b.txt"));
        // Crossing into the reserved namespace
        assert!(!validate_rename("a.txt", "__folder_map__"));
        assert!(!validate_rename("a.txt", "__anything"));
        // System records stay system records
        assert!(validate_rename("__folder_map__.tmp", "__folder_map__"));
        assert!(!validate_rename("__folder_map__", "plain.txt"));
        // Unknown reserved names are frozen entirely
        assert!(!validate_rename("__unknown__", "__folder_map__"));
    }

    #[test]
    fn storage_extents() {
        let blob = Storage::Blob {
            offset: 100,
            length: 50,
        };
        assert_eq!(blob.end_offset(), 150);
        assert_eq!(blob.data_len(), 50);
        assert_eq!(blob.chunk_count(), 0);

        let chunked = Storage::Chunked(vec![
            ChunkRef {
                offset: 200,
                length: 16,
                nonce: [0; NONCE_LEN],
            },
            ChunkRef {
                offset: 216,
                length: 32,
                nonce: [0; NONCE_LEN],
            },
        ]);
        assert_eq!(chunked.start_offset(), 200);
        assert_eq!(chunked.end_offset(), 248);
        assert_eq!(chunked.data_len(), 48);
        assert_eq!(chunked.chunk_count(), 2);
    }
}
