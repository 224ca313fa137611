#![forbid(unsafe_code)]

//! The versioned `.state` record persisted in each import's staging directory.
//!
//! The record carries everything needed to resume after a process death:
//! identifiers, the source fingerprint, chunk accounting, and the wrapped DEK
//! the staged chunks were encrypted under. The source URI is deliberately
//! never persisted — a `.state` file must not leak where the plaintext came
//! from — so its length field is always written as zero.

use crate::container::{ByteReader, FormatError};
use crate::crypto::HASH_LEN;
use crate::vault::entry::{FileId, FileKind, MAX_MIME_LEN, MAX_NAME_LEN, MAX_WRAPPED_DEK_LEN};

use super::ImportId;

/// Magic prefix of a `.state` file.
pub const STATE_MAGIC: [u8; 6] = *b"STRMV1";
/// Current `.state` record version.
pub const STATE_VERSION: u32 = 1;

/// Persistent state of one streaming import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportState {
    pub import_id: ImportId,
    /// File id the finished entry will get.
    pub file_id: FileId,
    /// `SHA256(first_1MiB ‖ last_1MiB ‖ size)` of the source, the resume key.
    pub source_hash: [u8; HASH_LEN],
    pub kind: FileKind,
    pub file_size: u64,
    /// Plaintext chunk size this import was started with.
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub completed_chunks: u32,
    pub bytes_written: u64,
    pub created_at: u64,
    pub updated_at: u64,
    pub name: String,
    pub mime: String,
    /// DEK wrapped under the master key, AAD-bound to (vault_id, file_id, 0).
    pub wrapped_dek: Vec<u8>,
}

impl ImportState {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            STATE_MAGIC.len() + 128 + self.name.len() + self.mime.len() + self.wrapped_dek.len(),
        );
        out.extend_from_slice(&STATE_MAGIC);
        out.extend_from_slice(&STATE_VERSION.to_le_bytes());
        out.extend_from_slice(&self.import_id.0);
        out.extend_from_slice(&self.file_id.0);
        out.extend_from_slice(&self.source_hash);
        out.push(self.kind.tag());
        out.extend_from_slice(&self.file_size.to_le_bytes());
        out.extend_from_slice(&self.chunk_size.to_le_bytes());
        out.extend_from_slice(&self.total_chunks.to_le_bytes());
        out.extend_from_slice(&self.completed_chunks.to_le_bytes());
        out.extend_from_slice(&self.bytes_written.to_le_bytes());
        out.extend_from_slice(&self.created_at.to_le_bytes());
        out.extend_from_slice(&self.updated_at.to_le_bytes());
        // source_uri_len: the URI is never written out.
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.extend_from_slice(&(self.mime.len() as u16).to_le_bytes());
        out.extend_from_slice(self.mime.as_bytes());
        out.extend_from_slice(&(self.wrapped_dek.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.wrapped_dek);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        let mut reader = ByteReader::new(bytes);

        let magic: [u8; 6] = reader.array()?;
        if magic != STATE_MAGIC {
            return Err(FormatError::BadMagic);
        }
        let version = reader.u32()?;
        if version != STATE_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }

        let import_id = ImportId(reader.array()?);
        let file_id = FileId(reader.array()?);
        let source_hash: [u8; HASH_LEN] = reader.array()?;
        let kind = FileKind::from_tag(reader.u8()?)
            .ok_or(FormatError::BadIndexField("file type tag"))?;
        let file_size = reader.u64()?;
        let chunk_size = reader.u32()?;
        let total_chunks = reader.u32()?;
        let completed_chunks = reader.u32()?;
        let bytes_written = reader.u64()?;
        let created_at = reader.u64()?;
        let updated_at = reader.u64()?;

        // Skip a source URI if some writer persisted one anyway.
        let uri_len = reader.u16()? as usize;
        let _ = reader.take(uri_len)?;

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

        let wrapped_dek_len = reader.u16()? as usize;
        if wrapped_dek_len > MAX_WRAPPED_DEK_LEN {
            return Err(FormatError::BadIndexField("wrapped DEK length"));
        }
        let wrapped_dek = reader.take(wrapped_dek_len)?.to_vec();

        if completed_chunks > total_chunks {
            return Err(FormatError::BadIndexField("completed chunk count"));
        }

        Ok(ImportState {
            import_id,
            file_id,
            source_hash,
            kind,
            file_size,
            chunk_size,
            total_chunks,
            completed_chunks,
            bytes_written,
            created_at,
            updated_at,
            name,
            mime,
            wrapped_dek,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::crypto::ID_LEN;

    use super::*;

    fn sample() -> ImportState {
        ImportState {
            import_id: ImportId([1; ID_LEN]),
            file_id: FileId([2; ID_LEN]),
            source_hash: [3; HASH_LEN],
            kind: FileKind::Video,
            file_size: 10 * 1024 * 1024,
            chunk_size: 4 * 1024 * 1024,
            total_chunks: 3,
            completed_chunks: 2,
            bytes_written: 8 * 1024 * 1024,
            created_at: 1_700_000_000_000,
            updated_at: 1_700_000_060_000,
            name: "holiday.mp4".to_string(),
            mime: "video/mp4".to_string(),
            wrapped_dek: vec![9; 72],
        }
    }

    #[test]
    fn roundtrip() {
        let state = sample();
        let decoded = ImportState::decode(&state.encode()).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn source_uri_is_never_encoded() {
        let bytes = sample().encode();
        // The uri length field sits right after the fixed-width block.
        let uri_len_at = 6 + 4 + ID_LEN * 2 + HASH_LEN + 1 + 8 + 4 + 4 + 4 + 8 + 8 + 8;
        assert_eq!(&bytes[uri_len_at..uri_len_at + 2], &[0, 0]);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = sample().encode();
        bytes[0] = b'X';
        assert!(matches!(
            ImportState::decode(&bytes),
            Err(FormatError::BadMagic)
        ));
    }

    #[test]
    fn wrong_version_rejected() {
        let mut bytes = sample().encode();
        bytes[6..10].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(
            ImportState::decode(&bytes),
            Err(FormatError::UnsupportedVersion(7))
        ));
    }

    #[test]
    fn truncation_rejected() {
        let bytes = sample().encode();
        assert!(ImportState::decode(&bytes[..bytes.len() - 5]).is_err());
    }

    #[test]
    fn inconsistent_progress_rejected() {
        let mut state = sample();
        state.completed_chunks = 9;
        assert!(matches!(
            ImportState::decode(&state.encode()),
            Err(FormatError::BadIndexField("completed chunk count"))
        ));
    }
}
