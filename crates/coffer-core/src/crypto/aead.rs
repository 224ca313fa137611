#![forbid(unsafe_code)]

//! AEAD framing (XChaCha20-Poly1305) and the associated-data record.
//!
//! Every ciphertext in a container is bound to its position in the key
//! hierarchy through AAD. Three AAD shapes exist on disk:
//!
//! * the wrapped master key binds the raw 16-byte vault id;
//! * the encrypted index binds nothing (legacy format decision);
//! * everything else (wrapped DEKs, blobs, chunks) binds the packed 40-byte
//!   [`Aad`] record.

use chacha20poly1305::{
    Key, XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::RngCore;
use zeroize::Zeroizing;

use super::{CryptoError, ID_LEN, KEY_LEN, NONCE_LEN, TAG_LEN};
use crate::container::FORMAT_VERSION;

/// Packed associated-data record: `vault_id ‖ file_id ‖ chunk_index ‖ version`.
///
/// Serialized little-endian with no padding; 40 bytes on the wire. The layout
/// is part of the container format and must not change.
#[derive(Debug, Clone, Copy)]
pub struct Aad {
    pub vault_id: [u8; ID_LEN],
    pub file_id: [u8; ID_LEN],
    pub chunk_index: u32,
    pub format_version: u32,
}

/// Serialized size of [`Aad`].
pub const AAD_LEN: usize = ID_LEN + ID_LEN + 4 + 4;

impl Aad {
    pub fn new(vault_id: [u8; ID_LEN], file_id: [u8; ID_LEN], chunk_index: u32) -> Self {
        Self {
            vault_id,
            file_id,
            chunk_index,
            format_version: FORMAT_VERSION,
        }
    }

    pub fn to_bytes(self) -> [u8; AAD_LEN] {
        let mut out = [0u8; AAD_LEN];
        out[..ID_LEN].copy_from_slice(&self.vault_id);
        out[ID_LEN..2 * ID_LEN].copy_from_slice(&self.file_id);
        out[32..36].copy_from_slice(&self.chunk_index.to_le_bytes());
        out[36..40].copy_from_slice(&self.format_version.to_le_bytes());
        out
    }
}

/// Generate a fresh random nonce.
pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);
    nonce
}

/// Encrypt `plaintext` under `key`, returning `(nonce, ciphertext ‖ tag)`.
///
/// A fresh random nonce is generated when `nonce` is `None`; callers only pass
/// an explicit nonce in tests and format tooling.
pub fn encrypt(
    key: &[u8; KEY_LEN],
    nonce: Option<[u8; NONCE_LEN]>,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<([u8; NONCE_LEN], Vec<u8>), CryptoError> {
    let nonce = nonce.unwrap_or_else(random_nonce);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::InvalidParam("AEAD encryption failed"))?;
    Ok((nonce, ciphertext))
}

/// Decrypt `ciphertext ‖ tag` under `key`.
///
/// Returns [`CryptoError::AuthenticationFailed`] on tag mismatch; the returned
/// plaintext is zeroed when dropped.
pub fn decrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::InvalidParam("ciphertext shorter than tag"));
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let plaintext = cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed)?;
    Ok(Zeroizing::new(plaintext))
}

/// Generate a random 16-byte identifier (vault, file, or import id).
pub fn random_id() -> [u8; ID_LEN] {
    let mut id = [0u8; ID_LEN];
    rand::rng().fill_bytes(&mut id);
    id
}
