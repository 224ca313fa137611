#![forbid(unsafe_code)]

//! Secure disposal of sensitive bytes, in memory and on disk.

use std::fs::OpenOptions;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

const WIPE_BUF_LEN: usize = 64 * 1024;

/// Overwrite a buffer with random bytes, then zero it.
///
/// Plain zeroing is enough for confidentiality; the random pass additionally
/// destroys any structure an allocator-reuse bug might later expose.
pub fn secure_wipe(buf: &mut [u8]) {
    if buf.is_empty() {
        return;
    }
    rand::rng().fill_bytes(buf);
    buf.zeroize();
}

/// Overwrite a file's contents with random bytes and fsync.
///
/// The file is left in place; callers unlink it afterwards. Used for staged
/// import chunks, which hold real ciphertext plus a persisted wrapped DEK.
pub fn secure_wipe_file(path: &Path) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(0))?;

    let mut buf = [0u8; WIPE_BUF_LEN];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(WIPE_BUF_LEN as u64) as usize;
        rand::rng().fill_bytes(&mut buf[..n]);
        file.write_all(&buf[..n])?;
        remaining -= n as u64;
    }
    file.sync_all()
}

/// Constant-time equality for secret byte strings.
pub fn memcmp_ct(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn wipe_zeroes_buffer() {
        let mut buf = vec![0xAB; 4096];
        secure_wipe(&mut buf);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn wipe_file_destroys_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scratch");
        fs::write(&path, vec![0xCD; 200_000]).unwrap();

        secure_wipe_file(&path).unwrap();

        let after = fs::read(&path).unwrap();
        assert_eq!(after.len(), 200_000);
        assert!(after.iter().any(|&b| b != 0xCD));
    }

    #[test]
    fn constant_time_compare() {
        assert!(memcmp_ct(b"same", b"same"));
        assert!(!memcmp_ct(b"same", b"diff"));
        assert!(!memcmp_ct(b"short", b"longer"));
    }
}
