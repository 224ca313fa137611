#![forbid(unsafe_code)]

//! Container header codec: the legacy CRC flavor and the A/B journal flavor.
//!
//! Legacy headers are still opened for compatibility but never newly written;
//! every fresh container gets a journal header. The journal keeps two
//! fixed-size slots with monotonically increasing sequence numbers, so a
//! passphrase or KDF-parameter rotation can be committed by writing one slot
//! and a crash between writes always leaves the previous slot selectable.

use std::fs::File;
use std::os::unix::fs::FileExt;

use crate::crypto::kdf::{self, KdfParams};
use crate::crypto::{ID_LEN, SALT_LEN};
use crate::error::VaultError;

use super::{ByteReader, FORMAT_VERSION, FormatError, JOURNAL_MAGIC, LEGACY_MAGIC, WRAPPED_MK_LEN};

/// Legacy fixed record: magic ‖ version ‖ vault_id ‖ salt ‖ kdf ×3 ‖ mk_len.
pub const LEGACY_RECORD_LEN: usize = 8 + 4 + ID_LEN + SALT_LEN + 4 + 4 + 4 + 4;
/// Full legacy header: record ‖ wrapped_mk ‖ crc32.
pub const LEGACY_HEADER_LEN: usize = LEGACY_RECORD_LEN + WRAPPED_MK_LEN + 4;

/// Journal superblock: magic ‖ version ‖ slot_size ‖ slot_count ‖ flags ‖ crc.
pub const SUPERBLOCK_LEN: usize = 8 + 4 + 4 + 4 + 4 + 4;
/// Journal slot: seq ‖ vault_id ‖ salt ‖ kdf ×3 ‖ mk_len ‖ wrapped_mk ‖ crc.
pub const SLOT_LEN: usize = 4 + ID_LEN + SALT_LEN + 4 + 4 + 4 + 4 + WRAPPED_MK_LEN + 4;
/// Number of journal slots.
pub const SLOT_COUNT: u32 = 2;
/// Full journal header.
pub const JOURNAL_HEADER_LEN: usize = SUPERBLOCK_LEN + SLOT_COUNT as usize * SLOT_LEN;

/// The credential material every header flavor carries.
#[derive(Debug, Clone)]
pub struct HeaderFields {
    pub vault_id: [u8; ID_LEN],
    pub salt: [u8; SALT_LEN],
    pub kdf: KdfParams,
    pub wrapped_mk: [u8; WRAPPED_MK_LEN],
}

/// A decoded container header.
#[derive(Debug, Clone)]
pub enum Header {
    Legacy(HeaderFields),
    Journal { seq: u32, fields: HeaderFields },
}

impl Header {
    pub fn fields(&self) -> &HeaderFields {
        match self {
            Header::Legacy(fields) | Header::Journal { fields, .. } => fields,
        }
    }

    pub fn fields_mut(&mut self) -> &mut HeaderFields {
        match self {
            Header::Legacy(fields) | Header::Journal { fields, .. } => fields,
        }
    }

    pub fn is_journal(&self) -> bool {
        matches!(self, Header::Journal { .. })
    }

    /// Serialized header length for this flavor.
    pub fn byte_len(&self) -> u64 {
        match self {
            Header::Legacy(_) => LEGACY_HEADER_LEN as u64,
            Header::Journal { .. } => JOURNAL_HEADER_LEN as u64,
        }
    }

    /// Serialize the header for a full container write.
    ///
    /// Journal flavor writes the active slot at `seq % SLOT_COUNT` and leaves
    /// the other slot empty; a rebuilt container starts its journal history
    /// from the current sequence.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Header::Legacy(fields) => encode_legacy(fields),
            Header::Journal { seq, fields } => encode_journal(*seq, fields),
        }
    }
}

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

fn encode_legacy_record(fields: &HeaderFields) -> [u8; LEGACY_RECORD_LEN] {
    let mut out = [0u8; LEGACY_RECORD_LEN];
    out[..8].copy_from_slice(&LEGACY_MAGIC);
    out[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    out[12..28].copy_from_slice(&fields.vault_id);
    out[28..44].copy_from_slice(&fields.salt);
    out[44..48].copy_from_slice(&fields.kdf.mem_bytes.to_le_bytes());
    out[48..52].copy_from_slice(&fields.kdf.iterations.to_le_bytes());
    out[52..56].copy_from_slice(&fields.kdf.parallelism.to_le_bytes());
    out[56..60].copy_from_slice(&(WRAPPED_MK_LEN as u32).to_le_bytes());
    out
}

fn encode_legacy(fields: &HeaderFields) -> Vec<u8> {
    let record = encode_legacy_record(fields);
    let mut out = Vec::with_capacity(LEGACY_HEADER_LEN);
    out.extend_from_slice(&record);
    out.extend_from_slice(&fields.wrapped_mk);
    out.extend_from_slice(&crc32(&record).to_le_bytes());
    out
}

/// Serialize the superblock. All fields are format constants, so the bytes
/// are identical for every journal container.
pub fn encode_superblock() -> [u8; SUPERBLOCK_LEN] {
    let mut out = [0u8; SUPERBLOCK_LEN];
    out[..8].copy_from_slice(&JOURNAL_MAGIC);
    out[8..12].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    out[12..16].copy_from_slice(&(SLOT_LEN as u32).to_le_bytes());
    out[16..20].copy_from_slice(&SLOT_COUNT.to_le_bytes());
    out[20..24].copy_from_slice(&0u32.to_le_bytes()); // flags
    let crc = crc32(&out[..SUPERBLOCK_LEN - 4]);
    out[24..28].copy_from_slice(&crc.to_le_bytes());
    out
}

/// Serialize one journal slot.
pub fn encode_slot(seq: u32, fields: &HeaderFields) -> [u8; SLOT_LEN] {
    let mut out = [0u8; SLOT_LEN];
    out[..4].copy_from_slice(&seq.to_le_bytes());
    out[4..20].copy_from_slice(&fields.vault_id);
    out[20..36].copy_from_slice(&fields.salt);
    out[36..40].copy_from_slice(&fields.kdf.mem_bytes.to_le_bytes());
    out[40..44].copy_from_slice(&fields.kdf.iterations.to_le_bytes());
    out[44..48].copy_from_slice(&fields.kdf.parallelism.to_le_bytes());
    out[48..52].copy_from_slice(&(WRAPPED_MK_LEN as u32).to_le_bytes());
    out[52..52 + WRAPPED_MK_LEN].copy_from_slice(&fields.wrapped_mk);
    let crc = crc32(&out[..SLOT_LEN - 4]);
    out[SLOT_LEN - 4..].copy_from_slice(&crc.to_le_bytes());
    out
}

fn encode_journal(seq: u32, fields: &HeaderFields) -> Vec<u8> {
    let mut out = vec![0u8; JOURNAL_HEADER_LEN];
    out[..SUPERBLOCK_LEN].copy_from_slice(&encode_superblock());
    let slot = (seq % SLOT_COUNT) as usize;
    let offset = SUPERBLOCK_LEN + slot * SLOT_LEN;
    out[offset..offset + SLOT_LEN].copy_from_slice(&encode_slot(seq, fields));
    out
}

/// Byte offset of slot `index` within the container file.
pub fn slot_offset(index: u32) -> u64 {
    SUPERBLOCK_LEN as u64 + u64::from(index) * SLOT_LEN as u64
}

fn parse_kdf(reader: &mut ByteReader<'_>) -> Result<KdfParams, FormatError> {
    Ok(KdfParams {
        mem_bytes: reader.u32()?,
        iterations: reader.u32()?,
        parallelism: reader.u32()?,
    })
}

fn parse_legacy(bytes: &[u8]) -> Result<HeaderFields, FormatError> {
    let mut reader = ByteReader::new(bytes);
    let magic: [u8; 8] = reader.array()?;
    debug_assert_eq!(magic, LEGACY_MAGIC);

    let version = reader.u32()?;
    if version != FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }

    let vault_id: [u8; ID_LEN] = reader.array()?;
    let salt: [u8; SALT_LEN] = reader.array()?;
    let kdf_params = parse_kdf(&mut reader)?;
    let wrapped_mk_len = reader.u32()?;
    if wrapped_mk_len as usize != WRAPPED_MK_LEN {
        return Err(FormatError::BadHeaderField("wrapped_mk_len"));
    }

    let wrapped_mk: [u8; WRAPPED_MK_LEN] = reader.array()?;
    let stored_crc = reader.u32()?;
    if stored_crc != crc32(&bytes[..LEGACY_RECORD_LEN]) {
        return Err(FormatError::CrcMismatch);
    }

    if !kdf::params_in_range(&kdf_params) {
        return Err(FormatError::KdfParamsOutOfRange);
    }

    Ok(HeaderFields {
        vault_id,
        salt,
        kdf: kdf_params,
        wrapped_mk,
    })
}

/// Parse one slot's bytes. `None` means the slot is empty or invalid and
/// simply not a candidate; hard errors are reserved for the superblock.
fn parse_slot(bytes: &[u8; SLOT_LEN]) -> Option<(u32, HeaderFields)> {
    let seq = u32::from_le_bytes(bytes[..4].try_into().ok()?);
    if seq == 0 {
        return None;
    }
    let stored_crc = u32::from_le_bytes(bytes[SLOT_LEN - 4..].try_into().ok()?);
    if stored_crc != crc32(&bytes[..SLOT_LEN - 4]) {
        return None;
    }

    let mut reader = ByteReader::new(&bytes[4..]);
    let vault_id: [u8; ID_LEN] = reader.array().ok()?;
    let salt: [u8; SALT_LEN] = reader.array().ok()?;
    let kdf_params = parse_kdf(&mut reader).ok()?;
    let wrapped_mk_len = reader.u32().ok()?;
    if wrapped_mk_len as usize != WRAPPED_MK_LEN {
        return None;
    }
    let wrapped_mk: [u8; WRAPPED_MK_LEN] = reader.array().ok()?;

    Some((
        seq,
        HeaderFields {
            vault_id,
            salt,
            kdf: kdf_params,
            wrapped_mk,
        },
    ))
}

fn read_journal(file: &File) -> Result<Header, VaultError> {
    let mut superblock = [0u8; SUPERBLOCK_LEN];
    file.read_exact_at(&mut superblock, 0)?;

    let mut reader = ByteReader::new(&superblock);
    let _magic: [u8; 8] = reader.array()?;
    let version = reader.u32()?;
    if version != FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion(version).into());
    }
    let slot_size = reader.u32()?;
    let slot_count = reader.u32()?;
    let _flags = reader.u32()?;
    let stored_crc = reader.u32()?;

    if slot_size as usize != SLOT_LEN {
        return Err(FormatError::BadHeaderField("slot_size").into());
    }
    if slot_count != SLOT_COUNT {
        return Err(FormatError::BadHeaderField("slot_count").into());
    }
    if stored_crc != crc32(&superblock[..SUPERBLOCK_LEN - 4]) {
        return Err(FormatError::CrcMismatch.into());
    }

    // A slot whose bytes cannot be read in full (short file) is treated as
    // empty, like a seq-0 slot; recovery proceeds with the remaining one.
    let mut best: Option<(u32, HeaderFields)> = None;
    for index in 0..SLOT_COUNT {
        let mut slot_bytes = [0u8; SLOT_LEN];
        if file.read_exact_at(&mut slot_bytes, slot_offset(index)).is_err() {
            continue;
        }
        if let Some((seq, fields)) = parse_slot(&slot_bytes)
            && best.as_ref().is_none_or(|(best_seq, _)| seq > *best_seq)
        {
            best = Some((seq, fields));
        }
    }

    let (seq, fields) = best.ok_or(FormatError::NoValidSlot)?;
    if !kdf::params_in_range(&fields.kdf) {
        return Err(FormatError::KdfParamsOutOfRange.into());
    }

    tracing::trace!(seq, "journal header read, active slot selected");
    Ok(Header::Journal { seq, fields })
}

/// Read and validate the container header, dispatching on the magic.
pub fn read_header(file: &File) -> Result<Header, VaultError> {
    let mut magic = [0u8; 8];
    file.read_exact_at(&mut magic, 0)?;

    if magic == JOURNAL_MAGIC {
        read_journal(file)
    } else if magic == LEGACY_MAGIC {
        let mut bytes = vec![0u8; LEGACY_HEADER_LEN];
        file.read_exact_at(&mut bytes, 0)?;
        Ok(Header::Legacy(parse_legacy(&bytes)?))
    } else {
        Err(FormatError::BadMagic.into())
    }
}

/// The sequence number the next rotation will commit.
///
/// On overflow the journal restarts at `{1, 2}`; see [`rotate_slot`].
fn next_seq(current: u32) -> u32 {
    if current == u32::MAX { 2 } else { current + 1 }
}

/// Rotate the journal to new credential fields, in place.
///
/// Writes the new slot first and fsyncs before touching the superblock, so a
/// crash between the writes leaves the previously active slot intact and
/// recovery selects it on reopen.
///
/// Returns the committed sequence number.
pub fn rotate_slot(
    file: &File,
    current_seq: u32,
    fields: &HeaderFields,
) -> Result<u32, VaultError> {
    let seq = next_seq(current_seq);

    if current_seq == u32::MAX {
        // Sequence exhausted: restart the journal at {1, 2}. The new slot
        // (seq 2) is made durable before the old one is rewritten, so the old
        // credentials stay selectable until the new ones are on disk.
        file.write_all_at(&encode_slot(2, fields), slot_offset(2 % SLOT_COUNT))?;
        file.sync_all()?;
        file.write_all_at(&encode_slot(1, fields), slot_offset(1 % SLOT_COUNT))?;
    } else {
        file.write_all_at(&encode_slot(seq, fields), slot_offset(seq % SLOT_COUNT))?;
    }
    file.sync_all()?;

    file.write_all_at(&encode_superblock(), 0)?;
    file.sync_all()?;

    tracing::debug!(seq, "journal slot rotated");
    Ok(seq)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use crate::crypto::kdf::PROFILE_LOW;

    use super::*;

    fn fields() -> HeaderFields {
        HeaderFields {
            vault_id: [1; ID_LEN],
            salt: [2; SALT_LEN],
            kdf: PROFILE_LOW,
            wrapped_mk: [3; WRAPPED_MK_LEN],
        }
    }

    fn write_temp(bytes: &[u8]) -> File {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(bytes).unwrap();
        file
    }

    #[test]
    fn layout_constants() {
        assert_eq!(LEGACY_RECORD_LEN, 60);
        assert_eq!(LEGACY_HEADER_LEN, 136);
        assert_eq!(SUPERBLOCK_LEN, 28);
        assert_eq!(SLOT_LEN, 128);
        assert_eq!(JOURNAL_HEADER_LEN, 284);
    }

    #[test]
    fn legacy_roundtrip() {
        let header = Header::Legacy(fields());
        let file = write_temp(&header.encode());

        let parsed = read_header(&file).unwrap();
        assert!(!parsed.is_journal());
        assert_eq!(parsed.fields().vault_id, [1; ID_LEN]);
        assert_eq!(parsed.fields().wrapped_mk, [3; WRAPPED_MK_LEN]);
    }

    #[test]
    fn journal_roundtrip() {
        let header = Header::Journal {
            seq: 1,
            fields: fields(),
        };
        let file = write_temp(&header.encode());

        match read_header(&file).unwrap() {
            Header::Journal { seq, fields } => {
                assert_eq!(seq, 1);
                assert_eq!(fields.salt, [2; SALT_LEN]);
            }
            Header::Legacy(_) => panic!("expected journal header"),
        }
    }

    #[test]
    fn legacy_crc_flip_is_corrupted() {
        let mut bytes = Header::Legacy(fields()).encode();
        bytes[13] ^= 0x01; // inside vault_id, covered by the CRC
        let file = write_temp(&bytes);
        assert!(matches!(
            read_header(&file),
            Err(VaultError::Corrupted(FormatError::CrcMismatch))
        ));
    }

    #[test]
    fn bad_magic_rejected() {
        let file = write_temp(&[0u8; LEGACY_HEADER_LEN]);
        assert!(matches!(
            read_header(&file),
            Err(VaultError::Corrupted(FormatError::BadMagic))
        ));
    }

    #[test]
    fn higher_seq_slot_wins() {
        let mut bytes = Header::Journal {
            seq: 1,
            fields: fields(),
        }
        .encode();
        // Plant seq 2 with a different salt in slot 0.
        let mut newer = fields();
        newer.salt = [9; SALT_LEN];
        let offset = SUPERBLOCK_LEN + (2 % SLOT_COUNT) as usize * SLOT_LEN;
        bytes[offset..offset + SLOT_LEN].copy_from_slice(&encode_slot(2, &newer));

        let file = write_temp(&bytes);
        match read_header(&file).unwrap() {
            Header::Journal { seq, fields } => {
                assert_eq!(seq, 2);
                assert_eq!(fields.salt, [9; SALT_LEN]);
            }
            Header::Legacy(_) => panic!("expected journal header"),
        }
    }

    #[test]
    fn corrupt_slot_falls_back_to_other() {
        let file = write_temp(
            &Header::Journal {
                seq: 1,
                fields: fields(),
            }
            .encode(),
        );
        // Rotate to seq 2 (slot 0), then trash slot 1.
        rotate_slot(&file, 1, &fields()).unwrap();
        file.write_all_at(&[0xFF; SLOT_LEN], slot_offset(1)).unwrap();

        match read_header(&file).unwrap() {
            Header::Journal { seq, .. } => assert_eq!(seq, 2),
            Header::Legacy(_) => panic!("expected journal header"),
        }
    }

    #[test]
    fn no_valid_slot_is_corrupted() {
        let mut bytes = Header::Journal {
            seq: 1,
            fields: fields(),
        }
        .encode();
        for b in &mut bytes[SUPERBLOCK_LEN..] {
            *b = 0;
        }
        let file = write_temp(&bytes);
        assert!(matches!(
            read_header(&file),
            Err(VaultError::Corrupted(FormatError::NoValidSlot))
        ));
    }

    #[test]
    fn rotation_increments_and_places_by_modulo() {
        let file = write_temp(
            &Header::Journal {
                seq: 1,
                fields: fields(),
            }
            .encode(),
        );

        let mut rotated = fields();
        rotated.salt = [7; SALT_LEN];
        let seq = rotate_slot(&file, 1, &rotated).unwrap();
        assert_eq!(seq, 2);

        match read_header(&file).unwrap() {
            Header::Journal { seq, fields } => {
                assert_eq!(seq, 2);
                assert_eq!(fields.salt, [7; SALT_LEN]);
            }
            Header::Legacy(_) => panic!("expected journal header"),
        }
    }

    #[test]
    fn rotation_resets_on_overflow() {
        let file = write_temp(
            &Header::Journal {
                seq: u32::MAX,
                fields: fields(),
            }
            .encode(),
        );

        let seq = rotate_slot(&file, u32::MAX, &fields()).unwrap();
        assert_eq!(seq, 2);
        match read_header(&file).unwrap() {
            Header::Journal { seq, .. } => assert_eq!(seq, 2),
            Header::Legacy(_) => panic!("expected journal header"),
        }
    }
}
