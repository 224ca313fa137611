//! Cryptographic primitives for container operations

pub mod aead;
pub mod hash;
pub mod kdf;
pub mod keys;
mod thread_safety; // Send + Sync impls for MasterKey
pub mod wipe;

use thiserror::Error;

/// Symmetric key length (KEK, MK, DEK are all 256-bit).
pub const KEY_LEN: usize = 32;
/// XChaCha20-Poly1305 nonce length.
pub const NONCE_LEN: usize = 24;
/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;
/// KDF salt length.
pub const SALT_LEN: usize = 16;
/// Vault / file / import identifier length.
pub const ID_LEN: usize = 16;
/// SHA-256 digest length.
pub const HASH_LEN: usize = 32;

/// Errors that can occur during cryptographic operations.
///
/// `AuthenticationFailed` is the only variant a caller may branch on to detect
/// a wrong passphrase or tampered ciphertext; everything else is an input or
/// environment problem.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// AEAD tag verification failed.
    ///
    /// Wrong key (typically a wrong passphrase upstream) and tampered
    /// ciphertext are cryptographically indistinguishable here.
    #[error("authentication failed - wrong key or tampered ciphertext")]
    AuthenticationFailed,

    /// Inputs failed a precondition check (short ciphertext, bad lengths).
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    /// Argon2id rejected its cost parameters.
    #[error("invalid KDF parameters: {0}")]
    InvalidKdfParams(String),

    /// Argon2id failed to derive a key, which in practice means the memory
    /// cost exceeded what the system would give us.
    #[error("key derivation failed: {0}")]
    DerivationFailed(String),

    /// Master-key slot access failed (memory protection or lock poisoning).
    #[error("key access failed: {0}")]
    KeyAccess(#[from] keys::KeyAccessError),
}

// Re-export commonly used types
pub use keys::{KeyAccessError, MasterKey};
