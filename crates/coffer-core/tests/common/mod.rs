//! Shared helpers for the integration suites.
#![allow(dead_code)] // each suite uses a different subset

use std::path::PathBuf;

use coffer_core::{Vault, set_profile_by_ram};
use tempfile::TempDir;

pub const PASSPHRASE: &str = "correct horse battery staple";

/// Create a fresh vault in its own temp directory.
///
/// Selects the LOW KDF profile first so Argon2id stays test-speed; LOW is
/// inside the validated parameter range, so nothing else changes.
pub fn create_vault() -> (TempDir, PathBuf, Vault) {
    set_profile_by_ram(1024);
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("store.vault");
    let vault = Vault::create(&path, PASSPHRASE).expect("create vault");
    (dir, path, vault)
}

/// Deterministic pseudo-random bytes for payloads.
pub fn pattern_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// Flip one bit in the file at `offset`.
pub fn flip_bit(path: &std::path::Path, offset: u64) {
    use std::os::unix::fs::FileExt;
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .expect("open for corruption");
    let mut byte = [0u8; 1];
    file.read_exact_at(&mut byte, offset).expect("read byte");
    byte[0] ^= 0x01;
    file.write_all_at(&byte, offset).expect("write byte");
}
