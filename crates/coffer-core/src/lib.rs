//! Single-file encrypted container engine.
//!
//! A coffer container stores a collection of user files (small blobs and
//! large, chunked media) inside one file, under one passphrase. The format is
//! a plaintext header (legacy CRC flavor or the crash-safe A/B journal flavor),
//! an AEAD-encrypted index, a packed data region of per-entry ciphertext, and a
//! trailing whole-file hash.
//!
//! The [`vault::Vault`] handle is the entry point: [`vault::Vault::create`]
//! builds a fresh container, [`vault::Vault::open`] unlocks an existing one.

pub mod container;
pub mod crypto;
pub mod error;
pub mod streaming;
pub mod vault;

// Re-export commonly used types at crate root
pub use error::VaultError;
pub use streaming::{ImportId, ImportProgress, ImportState};
pub use vault::{ChunkRef, Entry, FileId, FileKind, Storage, Vault, VaultStats};

pub use crypto::kdf::{KdfParams, active_params as kdf_params, set_profile_by_ram};
