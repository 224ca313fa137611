//! Error types for the coffer crate.
//!
//! Module-local errors ([`CryptoError`], [`KeyAccessError`], [`FormatError`])
//! describe what went wrong mechanically; [`VaultError`] is the stable surface
//! every public operation returns. The mapping keeps two distinctions
//! rigorous:
//!
//! * `AuthFailed` vs `Corrupted` — an AEAD refusing to open (wrong passphrase
//!   *or* tampering, deliberately indistinguishable) vs a structural check
//!   failing before any key material was involved.
//! * `Memory` — Argon2id running out of memory is reported as an allocation
//!   failure, matching the container format's historical error contract.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::container::{FormatError, MIN_PASSPHRASE_LEN};
use crate::crypto::{CryptoError, KeyAccessError};

/// Errors returned by every public vault operation.
#[derive(Debug, Error)]
pub enum VaultError {
    /// An input failed a precondition check (bad name, chunk index out of
    /// bounds, reserved-name misuse, wrong storage shape, ...).
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    /// Allocation failed, or Argon2id exceeded available memory.
    #[error("out of memory: {0}")]
    Memory(String),

    /// A filesystem call failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A cryptographic primitive failed for a reason other than
    /// authentication.
    #[error("cryptographic failure: {0}")]
    Crypto(String),

    /// AEAD tag mismatch: wrong passphrase or tampered ciphertext, by design
    /// indistinguishable.
    #[error("authentication failed")]
    AuthFailed,

    /// A structural check failed: bad magic, CRC mismatch, out-of-range
    /// fields, version mismatch.
    #[error("container corrupted: {0}")]
    Corrupted(#[from] FormatError),

    /// No entry / import / chunk at the given identifier.
    #[error("not found")]
    NotFound,

    /// `create` refuses to overwrite an existing container.
    #[error("container already exists at {0}")]
    AlreadyExists(PathBuf),

    /// Passphrases must be at least [`MIN_PASSPHRASE_LEN`] bytes.
    #[error("passphrase shorter than {MIN_PASSPHRASE_LEN} bytes")]
    PassphraseTooShort,

    /// Streaming import source exceeds the 50 GiB ceiling.
    #[error("source file too large for streaming import")]
    TooLarge,
}

impl From<CryptoError> for VaultError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::AuthenticationFailed => VaultError::AuthFailed,
            CryptoError::DerivationFailed(msg) => VaultError::Memory(msg),
            CryptoError::InvalidParam(msg) => VaultError::InvalidParam(msg),
            other => VaultError::Crypto(other.to_string()),
        }
    }
}

impl From<KeyAccessError> for VaultError {
    fn from(err: KeyAccessError) -> Self {
        VaultError::Crypto(err.to_string())
    }
}
