#![forbid(unsafe_code)]

use std::sync::RwLock;

use memsafe::MemSafe;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroize;

use super::KEY_LEN;

/// Error type for key access operations.
#[derive(Debug, Error)]
pub enum KeyAccessError {
    /// Memory protection operation failed (mlock, mprotect, etc.)
    #[error("memory protection operation failed: {0}")]
    MemoryProtection(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Lock was poisoned (a thread panicked while holding it)
    #[error("key lock was poisoned")]
    LockPoisoned,
}

impl KeyAccessError {
    /// Create a memory protection error from any error type.
    pub fn memory_protection<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        KeyAccessError::MemoryProtection(Box::new(err))
    }
}

/// The vault master key.
///
/// The 32-byte key wraps every per-file DEK and the index, so it is the one
/// secret that must never reach swap or a core dump. It lives in a `memsafe`
/// slot: locked in RAM via `mlock`, protected `PROT_NONE` while idle, excluded
/// from dumps where the platform supports it, and zeroed on drop.
///
/// Access goes through [`MasterKey::with_key`], which elevates permissions for
/// the duration of the callback only. The callback cannot store a reference to
/// the key material.
#[derive(Debug)]
pub struct MasterKey {
    key: RwLock<MemSafe<[u8; KEY_LEN]>>,
}

impl MasterKey {
    /// Wrap raw key material in a protected slot.
    ///
    /// The caller keeps responsibility for zeroing its own copy; pass material
    /// through `Zeroizing` buffers up to this point.
    ///
    /// # Errors
    ///
    /// Returns a `KeyAccessError` if memory protection initialization fails,
    /// e.g. when the system's mlock limit is exceeded.
    pub fn new(key: [u8; KEY_LEN]) -> Result<Self, KeyAccessError> {
        Ok(MasterKey {
            key: RwLock::new(MemSafe::new(key).map_err(KeyAccessError::memory_protection)?),
        })
    }

    /// Generate a fresh random master key.
    pub fn random() -> Result<Self, KeyAccessError> {
        let mut key = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut key);
        let result = Self::new(key);
        key.zeroize();
        result
    }

    /// Execute a function with scoped access to the raw key.
    ///
    /// Memory permissions are elevated only while the callback runs. Anything
    /// the callback copies out is its own responsibility to zeroize.
    ///
    /// # Errors
    ///
    /// Returns a `KeyAccessError` if the lock is poisoned or if memory
    /// protection operations fail.
    pub fn with_key<F, R>(&self, f: F) -> Result<R, KeyAccessError>
    where
        F: FnOnce(&[u8; KEY_LEN]) -> R,
    {
        let mut lock = self.key.write().map_err(|_| KeyAccessError::LockPoisoned)?;
        let guard = lock.read().map_err(KeyAccessError::memory_protection)?;
        Ok(f(&guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_access() {
        let mk = MasterKey::random().unwrap();
        let len = mk.with_key(|key| key.len()).unwrap();
        assert_eq!(len, KEY_LEN);
    }

    #[test]
    fn stores_exact_material() {
        let mk = MasterKey::new([0x42; KEY_LEN]).unwrap();
        mk.with_key(|key| assert_eq!(key, &[0x42; KEY_LEN])).unwrap();
    }

    #[test]
    fn random_keys_differ() {
        let a = MasterKey::random().unwrap();
        let b = MasterKey::random().unwrap();
        let a_bytes = a.with_key(|k| *k).unwrap();
        let b_bytes = b.with_key(|k| *k).unwrap();
        assert_ne!(a_bytes, b_bytes);
    }
}
