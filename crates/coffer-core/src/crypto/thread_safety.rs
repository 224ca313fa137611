//! Thread safety implementation for the master-key slot.
//!
//! `MemSafe` holds a raw pointer to its protected mapping, which suppresses
//! the automatic `Send`/`Sync` implementations for [`MasterKey`]. The manual
//! implementations below are sound because:
//!
//! 1. every access to the slot goes through the `RwLock` inside `MasterKey`,
//!    so the raw pointer is never dereferenced without holding the lock;
//! 2. the memory protection syscalls (`mlock`, `mprotect`) are thread-safe,
//!    and the mapping they manage is valid from any thread;
//! 3. no reference to the protected memory escapes the scoped
//!    [`MasterKey::with_key`] callback.

use super::keys::MasterKey;

// SAFETY: the RwLock serializes all access to the MemSafe slot; the raw
// pointer inside is only touched while the lock is held, and the mapping it
// names is valid independent of the owning thread.
unsafe impl Send for MasterKey {}

// SAFETY: shared access is read-only from the caller's perspective and still
// funnels through the RwLock, so no data race on the slot is possible.
unsafe impl Sync for MasterKey {}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn master_key_is_send_and_sync() {
        assert_send::<MasterKey>();
        assert_sync::<MasterKey>();
        assert_send::<Arc<MasterKey>>();
    }

    #[test]
    fn concurrent_scoped_reads() {
        let key = Arc::new(MasterKey::random().expect("generate key"));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let key = Arc::clone(&key);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    key.with_key(|k| k[0]).expect("access key");
                }
            }));
        }
        for handle in handles {
            handle.join().expect("thread completed");
        }
    }
}
