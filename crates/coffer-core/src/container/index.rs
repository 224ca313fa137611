#![forbid(unsafe_code)]

//! Encrypted index codec and the capacity policy.
//!
//! The index section is `nonce[24] ‖ ct_len:u64 ‖ ciphertext[ct_len]`, where
//! the ciphertext authenticates a zero-padded plaintext buffer of a fixed
//! *capacity*. Padding lets rename/delete/append rewrite the section in place
//! without moving the data region; capacity only ever grows, and growth is
//! geometric with slack so small vaults stay small.
//!
//! The plaintext starts with `entry_count | 0x8000_0000` — the high bit marks
//! a padded buffer. Entries are length-prefixed throughout, so the parser
//! never reads the trailing zeros.

use std::fs::File;
use std::os::unix::fs::FileExt;

use zeroize::Zeroizing;

use crate::crypto::{ID_LEN, MasterKey, NONCE_LEN, TAG_LEN, aead};
use crate::error::VaultError;
use crate::vault::entry::{
    ChunkRef, Entry, FileId, FileKind, MAX_MIME_LEN, MAX_NAME_LEN, MAX_WRAPPED_DEK_LEN, Storage,
};

use super::{ByteReader, FormatError};

/// High bit of the count field: the plaintext buffer is padded.
pub const PADDED_FLAG: u32 = 0x8000_0000;

/// Sanity cap on the index ciphertext length.
pub const MAX_INDEX_CT_LEN: u64 = 100 * 1024 * 1024;

/// Sanity cap on the entry count.
pub const MAX_ENTRY_COUNT: u32 = 1_000_000;

/// Fixed prefix of the index section: nonce ‖ ct_len.
pub const SECTION_PREFIX_LEN: u64 = NONCE_LEN as u64 + 8;

/// On-disk size of an index section holding `capacity` plaintext bytes.
pub fn section_len(capacity: usize) -> u64 {
    SECTION_PREFIX_LEN + capacity as u64 + TAG_LEN as u64
}

/// Capacity for a plaintext that needs `required` bytes.
///
/// `max(required + 32 KiB, required * 1.5, 64 KiB)` — a flat floor plus
/// geometric headroom, so successive appends amortise their rewrites.
pub fn grow_capacity(required: usize) -> usize {
    (required + 32 * 1024)
        .max(required + required / 2)
        .max(64 * 1024)
}

fn entry_serialized_len(entry: &Entry) -> usize {
    let shape = match &entry.storage {
        Storage::Blob { .. } => 8 + 8,
        Storage::Chunked(chunks) => chunks.len() * (8 + 4 + NONCE_LEN),
    };
    ID_LEN + 1 + 8 + 2 + entry.name.len() + 2 + entry.mime.len() + 8 + 2 + entry.wrapped_dek.len()
        + 4
        + shape
}

/// Exact serialized size of an entry list, including the count field.
pub fn serialized_len(entries: &[Entry]) -> usize {
    4 + entries.iter().map(entry_serialized_len).sum::<usize>()
}

fn write_entry(buf: &mut Vec<u8>, entry: &Entry) {
    buf.extend_from_slice(&entry.file_id.0);
    buf.push(entry.kind.tag());
    buf.extend_from_slice(&entry.created_at.to_le_bytes());
    buf.extend_from_slice(&(entry.name.len() as u16).to_le_bytes());
    buf.extend_from_slice(entry.name.as_bytes());
    buf.extend_from_slice(&(entry.mime.len() as u16).to_le_bytes());
    buf.extend_from_slice(entry.mime.as_bytes());
    buf.extend_from_slice(&entry.size.to_le_bytes());
    buf.extend_from_slice(&(entry.wrapped_dek.len() as u16).to_le_bytes());
    buf.extend_from_slice(&entry.wrapped_dek);
    buf.extend_from_slice(&entry.storage.chunk_count().to_le_bytes());
    match &entry.storage {
        Storage::Blob { offset, length } => {
            buf.extend_from_slice(&offset.to_le_bytes());
            buf.extend_from_slice(&length.to_le_bytes());
        }
        Storage::Chunked(chunks) => {
            for chunk in chunks {
                buf.extend_from_slice(&chunk.offset.to_le_bytes());
                buf.extend_from_slice(&chunk.length.to_le_bytes());
                buf.extend_from_slice(&chunk.nonce);
            }
        }
    }
}

/// Serialize entries into a zero-padded plaintext of exactly `capacity` bytes.
///
/// The caller guarantees `serialized_len(entries) <= capacity`; a violation is
/// a programming error in the write paths, reported as `Truncated`.
pub fn serialize_padded(
    entries: &[Entry],
    capacity: usize,
) -> Result<Zeroizing<Vec<u8>>, FormatError> {
    let required = serialized_len(entries);
    if required > capacity || entries.len() as u32 > MAX_ENTRY_COUNT {
        return Err(FormatError::Truncated);
    }

    let mut buf = Vec::with_capacity(capacity);
    buf.extend_from_slice(&(entries.len() as u32 | PADDED_FLAG).to_le_bytes());
    for entry in entries {
        write_entry(&mut buf, entry);
    }
    buf.resize(capacity, 0);
    Ok(Zeroizing::new(buf))
}

fn read_entry(reader: &mut ByteReader<'_>) -> Result<Entry, FormatError> {
    let file_id = FileId(reader.array()?);
    let kind =
        FileKind::from_tag(reader.u8()?).ok_or(FormatError::BadIndexField("file type tag"))?;
    let created_at = reader.u64()?;

    let name_len = reader.u16()? as usize;
    if name_len > MAX_NAME_LEN {
        return Err(FormatError::BadIndexField("name length"));
    }
    let name = String::from_utf8(reader.take(name_len)?.to_vec())
        .map_err(|_| FormatError::BadIndexField("name encoding"))?;

    let mime_len = reader.u16()? as usize;
    if mime_len > MAX_MIME_LEN {
        return Err(FormatError::BadIndexField("mime length"));
    }
    let mime = String::from_utf8(reader.take(mime_len)?.to_vec())
        .map_err(|_| FormatError::BadIndexField("mime encoding"))?;

    let size = reader.u64()?;

    let wrapped_dek_len = reader.u16()? as usize;
    if wrapped_dek_len > MAX_WRAPPED_DEK_LEN {
        return Err(FormatError::BadIndexField("wrapped DEK length"));
    }
    let wrapped_dek = reader.take(wrapped_dek_len)?.to_vec();

    let chunk_count = reader.u32()?;
    let storage = if chunk_count == 0 {
        Storage::Blob {
            offset: reader.u64()?,
            length: reader.u64()?,
        }
    } else {
        let mut chunks = Vec::with_capacity(chunk_count as usize);
        for _ in 0..chunk_count {
            chunks.push(ChunkRef {
                offset: reader.u64()?,
                length: reader.u32()?,
                nonce: reader.array()?,
            });
        }
        Storage::Chunked(chunks)
    };

    Ok(Entry {
        file_id,
        kind,
        created_at,
        name,
        mime,
        size,
        wrapped_dek,
        storage,
    })
}

/// Parse an index plaintext. Returns the entries and whether the buffer
/// carried the padded flag (legacy writers did not pad).
pub fn deserialize(plaintext: &[u8]) -> Result<(Vec<Entry>, bool), FormatError> {
    let mut reader = ByteReader::new(plaintext);
    let count_field = reader.u32()?;
    let padded = count_field & PADDED_FLAG != 0;
    let count = count_field & !PADDED_FLAG;
    if count > MAX_ENTRY_COUNT {
        return Err(FormatError::BadIndexField("entry count"));
    }

    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        entries.push(read_entry(&mut reader)?);
    }
    Ok((entries, padded))
}

/// Serialize and encrypt the index into a full on-disk section.
///
/// The index is encrypted directly under the master key with no AAD; that is
/// a legacy format decision every existing container depends on.
pub fn encrypt_section(
    mk: &MasterKey,
    entries: &[Entry],
    capacity: usize,
) -> Result<Vec<u8>, VaultError> {
    let plaintext = serialize_padded(entries, capacity)?;

    let (nonce, ciphertext) = mk
        .with_key(|key| aead::encrypt(key, None, &[], &plaintext))
        .map_err(crate::crypto::CryptoError::from)??;

    let mut section = Vec::with_capacity(SECTION_PREFIX_LEN as usize + ciphertext.len());
    section.extend_from_slice(&nonce);
    section.extend_from_slice(&(ciphertext.len() as u64).to_le_bytes());
    section.extend_from_slice(&ciphertext);
    Ok(section)
}

/// A raw index section read from disk.
pub struct RawSection {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl RawSection {
    /// Plaintext capacity this section was encrypted at.
    pub fn capacity(&self) -> usize {
        self.ciphertext.len() - TAG_LEN
    }

    /// Total section length on disk.
    pub fn section_len(&self) -> u64 {
        SECTION_PREFIX_LEN + self.ciphertext.len() as u64
    }

    /// Decrypt and parse, returning the entries and the padded flag.
    pub fn open(&self, mk: &MasterKey) -> Result<(Vec<Entry>, bool), VaultError> {
        let plaintext = mk
            .with_key(|key| aead::decrypt(key, &self.nonce, &[], &self.ciphertext))
            .map_err(crate::crypto::CryptoError::from)??;
        Ok(deserialize(&plaintext)?)
    }
}

/// Read the index section starting at `offset` (the end of the header).
pub fn read_section(file: &File, offset: u64) -> Result<RawSection, VaultError> {
    let mut prefix = [0u8; SECTION_PREFIX_LEN as usize];
    file.read_exact_at(&mut prefix, offset)?;

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&prefix[..NONCE_LEN]);
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&prefix[NONCE_LEN..]);
    let ct_len = u64::from_le_bytes(len_bytes);

    if ct_len > MAX_INDEX_CT_LEN {
        return Err(FormatError::IndexTooLarge(ct_len).into());
    }
    if ct_len < TAG_LEN as u64 {
        return Err(FormatError::Truncated.into());
    }

    let mut ciphertext = vec![0u8; ct_len as usize];
    file.read_exact_at(&mut ciphertext, offset + SECTION_PREFIX_LEN)?;
    Ok(RawSection { nonce, ciphertext })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn sample_entry(name: &str, storage: Storage) -> Entry {
        Entry {
            file_id: FileId([7; ID_LEN]),
            kind: FileKind::Text,
            created_at: 1_700_000_000_000,
            name: name.to_string(),
            mime: "text/plain".to_string(),
            size: 5,
            wrapped_dek: vec![0xAB; 72],
            storage,
        }
    }

    #[test]
    fn capacity_policy() {
        // Small indexes land on the 64 KiB floor.
        assert_eq!(grow_capacity(4), 64 * 1024);
        assert_eq!(grow_capacity(30 * 1024), 64 * 1024);
        // Mid-size: flat 32 KiB slack dominates.
        assert_eq!(grow_capacity(40 * 1024), 72 * 1024);
        // Large: geometric headroom dominates.
        assert_eq!(grow_capacity(1024 * 1024), 1024 * 1024 + 512 * 1024);
    }

    #[test]
    fn padded_roundtrip_ignores_trailing_zeros() {
        let entries = vec![
            sample_entry(
                "a.txt",
                Storage::Blob {
                    offset: 1000,
                    length: 45,
                },
            ),
            sample_entry(
                "b.mp4",
                Storage::Chunked(vec![ChunkRef {
                    offset: 1045,
                    length: 1024,
                    nonce: [3; NONCE_LEN],
                }]),
            ),
        ];

        let required = serialized_len(&entries);
        let plaintext = serialize_padded(&entries, required + 4096).unwrap();
        assert_eq!(plaintext.len(), required + 4096);

        let (parsed, padded) = deserialize(&plaintext).unwrap();
        assert!(padded);
        assert_eq!(parsed, entries);
    }

    #[test]
    fn unpadded_legacy_count_field() {
        // A legacy writer serializes the bare count without the flag.
        let entries = vec![sample_entry(
            "a.txt",
            Storage::Blob {
                offset: 0,
                length: 1,
            },
        )];
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_le_bytes());
        write_entry(&mut buf, &entries[0]);

        let (parsed, padded) = deserialize(&buf).unwrap();
        assert!(!padded);
        assert_eq!(parsed, entries);
    }

    #[test]
    fn oversized_fields_rejected() {
        let entries = vec![sample_entry(
            "a",
            Storage::Blob {
                offset: 0,
                length: 1,
            },
        )];
        let mut buf = serialize_padded(&entries, 4096).unwrap();

        // name_len sits right after file_id + type + created_at.
        let name_len_at = 4 + ID_LEN + 1 + 8;
        buf[name_len_at..name_len_at + 2].copy_from_slice(&5000u16.to_le_bytes());
        assert!(matches!(
            deserialize(&buf),
            Err(FormatError::BadIndexField("name length"))
        ));
    }

    #[test]
    fn truncated_plaintext_rejected() {
        let entries = vec![sample_entry(
            "a.txt",
            Storage::Blob {
                offset: 0,
                length: 1,
            },
        )];
        let required = serialized_len(&entries);
        let plaintext = serialize_padded(&entries, required).unwrap();
        assert!(matches!(
            deserialize(&plaintext[..required - 3]),
            Err(FormatError::Truncated)
        ));
    }

    #[test]
    fn capacity_overflow_is_error() {
        let entries = vec![sample_entry(
            "a.txt",
            Storage::Blob {
                offset: 0,
                length: 1,
            },
        )];
        assert!(serialize_padded(&entries, 8).is_err());
    }

    #[test]
    fn section_roundtrip_through_master_key() {
        let mk = MasterKey::new([5; 32]).unwrap();
        let entries = vec![sample_entry(
            "a.txt",
            Storage::Blob {
                offset: 64,
                length: 128,
            },
        )];
        let section = encrypt_section(&mk, &entries, 4096).unwrap();
        assert_eq!(section.len() as u64, section_len(4096));

        let raw = RawSection {
            nonce: section[..NONCE_LEN].try_into().unwrap(),
            ciphertext: section[SECTION_PREFIX_LEN as usize..].to_vec(),
        };
        assert_eq!(raw.capacity(), 4096);
        let (parsed, padded) = raw.open(&mk).unwrap();
        assert!(padded);
        assert_eq!(parsed, entries);
    }

    proptest! {
        #[test]
        fn entry_codec_roundtrip(
            name in "[a-zA-Z0-9 ._-]{1,64}",
            mime in "[a-z]{1,12}/[a-z0-9.+-]{1,24}",
            size in 0u64..u64::MAX / 2,
            created_at in 0u64..u64::MAX / 2,
            dek in proptest::collection::vec(any::<u8>(), 0..256),
            chunks in proptest::collection::vec((0u64..1 << 40, 1u32..1 << 24), 0..12),
        ) {
            let storage = if chunks.is_empty() {
                Storage::Blob { offset: size % (1 << 40), length: size % (1 << 20) }
            } else {
                Storage::Chunked(
                    chunks
                        .iter()
                        .map(|&(offset, length)| ChunkRef { offset, length, nonce: [9; NONCE_LEN] })
                        .collect(),
                )
            };
            let entry = Entry {
                file_id: FileId([1; ID_LEN]),
                kind: FileKind::Image,
                created_at,
                name,
                mime,
                size,
                wrapped_dek: dek,
                storage,
            };

            let entries = vec![entry];
            let required = serialized_len(&entries);
            let plaintext = serialize_padded(&entries, grow_capacity(required)).unwrap();
            let (parsed, padded) = deserialize(&plaintext).unwrap();
            prop_assert!(padded);
            prop_assert_eq!(parsed, entries);
        }
    }
}
