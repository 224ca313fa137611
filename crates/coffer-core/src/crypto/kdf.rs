#![forbid(unsafe_code)]

//! Passphrase key derivation (Argon2id).
//!
//! Two entry points mirror the two situations the engine is in:
//!
//! * [`derive_adaptive`] uses the process-wide cost profile selected at host
//!   init from the device RAM class. If derivation fails at a higher profile
//!   (memory pressure), it retries once with the LOW profile and persists the
//!   downgrade so later operations do not repeat the failure.
//! * [`derive_with_params`] uses cost parameters stored in a container header,
//!   so a vault created on one device opens on any other. It never falls back:
//!   deriving with different parameters would produce a different key.

use std::sync::RwLock;

use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::SecretBox;
use zeroize::Zeroizing;

use super::{CryptoError, KEY_LEN, SALT_LEN};

/// Argon2id cost parameters as stored in container headers.
///
/// `mem_bytes` is the memory cost in bytes (the on-disk unit); the `argon2`
/// crate takes KiB, converted at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub mem_bytes: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

/// LOW profile: devices under 2 GiB of RAM.
pub const PROFILE_LOW: KdfParams = KdfParams {
    mem_bytes: 32 * 1024 * 1024,
    iterations: 3,
    parallelism: 1,
};

/// MEDIUM profile: 2-4 GiB of RAM.
pub const PROFILE_MEDIUM: KdfParams = KdfParams {
    mem_bytes: 128 * 1024 * 1024,
    iterations: 10,
    parallelism: 2,
};

/// HIGH profile: 4 GiB of RAM and up.
pub const PROFILE_HIGH: KdfParams = KdfParams {
    mem_bytes: 256 * 1024 * 1024,
    iterations: 12,
    parallelism: 2,
};

// Process-wide profile. Starts at LOW so a host that never calls
// set_profile_by_ram cannot OOM a small device; upgraded once at init.
static ACTIVE: RwLock<KdfParams> = RwLock::new(PROFILE_LOW);

/// Select the process-wide KDF profile from the device RAM class.
///
/// Called once at host init; also rewritten by the LOW fallback inside
/// [`derive_adaptive`].
pub fn set_profile_by_ram(total_ram_mb: u64) {
    let profile = if total_ram_mb >= 4096 {
        PROFILE_HIGH
    } else if total_ram_mb >= 2048 {
        PROFILE_MEDIUM
    } else {
        PROFILE_LOW
    };
    tracing::debug!(ram_mb = total_ram_mb, ?profile, "KDF profile selected");
    *ACTIVE.write().unwrap_or_else(std::sync::PoisonError::into_inner) = profile;
}

/// The currently active process-wide KDF parameters.
pub fn active_params() -> KdfParams {
    *ACTIVE.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Check that stored parameters lie within [LOW, HIGH] on every axis.
///
/// Headers carrying anything outside this range are rejected as corrupted
/// before any derivation is attempted.
pub fn params_in_range(params: &KdfParams) -> bool {
    params.mem_bytes >= PROFILE_LOW.mem_bytes
        && params.mem_bytes <= PROFILE_HIGH.mem_bytes
        && params.iterations >= PROFILE_LOW.iterations
        && params.iterations <= PROFILE_HIGH.iterations
        && params.parallelism >= PROFILE_LOW.parallelism
        && params.parallelism <= PROFILE_HIGH.parallelism
}

fn derive_inner(
    passphrase: &[u8],
    salt: &[u8; SALT_LEN],
    params: KdfParams,
) -> Result<SecretBox<[u8; KEY_LEN]>, CryptoError> {
    let argon_params = Params::new(
        params.mem_bytes / 1024,
        params.iterations,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| CryptoError::InvalidKdfParams(e.to_string()))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let mut kek = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(passphrase, salt, &mut kek[..])
        .map_err(|e| CryptoError::DerivationFailed(e.to_string()))?;

    Ok(SecretBox::new(Box::new(*kek)))
}

/// Derive a KEK with the process-wide adaptive profile.
///
/// Used when creating a vault (the chosen parameters are then persisted in the
/// header). On failure at an elevated profile this retries once with LOW and,
/// if that succeeds, downgrades the process-wide profile.
pub fn derive_adaptive(
    passphrase: &[u8],
    salt: &[u8; SALT_LEN],
) -> Result<SecretBox<[u8; KEY_LEN]>, CryptoError> {
    if passphrase.is_empty() {
        return Err(CryptoError::InvalidParam("empty passphrase"));
    }

    let params = active_params();
    match derive_inner(passphrase, salt, params) {
        Ok(kek) => Ok(kek),
        Err(err @ CryptoError::DerivationFailed(_)) if params != PROFILE_LOW => {
            tracing::warn!(%err, "adaptive KDF failed, retrying with LOW profile");
            let kek = derive_inner(passphrase, salt, PROFILE_LOW)?;
            *ACTIVE.write().unwrap_or_else(std::sync::PoisonError::into_inner) = PROFILE_LOW;
            Ok(kek)
        }
        Err(err) => Err(err),
    }
}

/// Derive a KEK with parameters stored in a container header.
///
/// The parameters must already have passed [`params_in_range`]; using anything
/// but the stored values would derive the wrong key.
pub fn derive_with_params(
    passphrase: &[u8],
    salt: &[u8; SALT_LEN],
    params: KdfParams,
) -> Result<SecretBox<[u8; KEY_LEN]>, CryptoError> {
    if passphrase.is_empty() {
        return Err(CryptoError::InvalidParam("empty passphrase"));
    }
    derive_inner(passphrase, salt, params)
}

#[cfg(test)]
mod tests {
    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn profile_selection_by_ram() {
        set_profile_by_ram(8192);
        assert_eq!(active_params(), PROFILE_HIGH);
        set_profile_by_ram(3000);
        assert_eq!(active_params(), PROFILE_MEDIUM);
        set_profile_by_ram(1024);
        assert_eq!(active_params(), PROFILE_LOW);
    }

    #[test]
    fn stored_params_deterministic() {
        let salt = [7u8; SALT_LEN];
        let a = derive_with_params(b"correct horse battery staple", &salt, PROFILE_LOW).unwrap();
        let b = derive_with_params(b"correct horse battery staple", &salt, PROFILE_LOW).unwrap();
        assert_eq!(a.expose_secret(), b.expose_secret());
    }

    #[test]
    fn different_salt_different_key() {
        let a = derive_with_params(b"correct horse battery staple", &[1; SALT_LEN], PROFILE_LOW)
            .unwrap();
        let b = derive_with_params(b"correct horse battery staple", &[2; SALT_LEN], PROFILE_LOW)
            .unwrap();
        assert_ne!(a.expose_secret(), b.expose_secret());
    }

    #[test]
    fn range_validation() {
        assert!(params_in_range(&PROFILE_LOW));
        assert!(params_in_range(&PROFILE_HIGH));
        assert!(!params_in_range(&KdfParams {
            mem_bytes: 8 * 1024 * 1024,
            iterations: 3,
            parallelism: 1,
        }));
        assert!(!params_in_range(&KdfParams {
            mem_bytes: 32 * 1024 * 1024,
            iterations: 42,
            parallelism: 1,
        }));
        assert!(!params_in_range(&KdfParams {
            mem_bytes: 32 * 1024 * 1024,
            iterations: 3,
            parallelism: 8,
        }));
    }

    #[test]
    fn empty_passphrase_rejected() {
        let salt = [0u8; SALT_LEN];
        assert!(matches!(
            derive_with_params(b"", &salt, PROFILE_LOW),
            Err(CryptoError::InvalidParam(_))
        ));
    }
}
