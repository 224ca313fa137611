#![forbid(unsafe_code)]

//! SHA-256 helpers: whole-file hashing for the trailing integrity field and
//! the source fingerprint used to key resumable imports.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use sha2::{Digest, Sha256};

use super::HASH_LEN;

const IO_BUF_LEN: usize = 64 * 1024;

/// Sample size for the source fingerprint (1 MiB from each end).
pub const FINGERPRINT_SAMPLE_LEN: usize = 1024 * 1024;

/// Hash `len` bytes of `file` starting at the beginning.
///
/// Used to compute the trailing container hash: the caller passes the file
/// length minus the hash field itself.
pub fn hash_file_prefix(file: &mut File, len: u64) -> io::Result<[u8; HASH_LEN]> {
    file.seek(SeekFrom::Start(0))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; IO_BUF_LEN];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(IO_BUF_LEN as u64) as usize;
        file.read_exact(&mut buf[..want])?;
        hasher.update(&buf[..want]);
        remaining -= want as u64;
    }
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&hasher.finalize());
    Ok(out)
}

/// Fingerprint of a source file for resume matching.
///
/// `SHA256(first_1MiB ‖ last_1MiB ‖ file_size_le)`; the trailing sample is
/// omitted for files of 2 MiB or less (the leading sample already covers
/// them).
pub fn source_fingerprint(
    first_sample: &[u8],
    last_sample: Option<&[u8]>,
    file_size: u64,
) -> [u8; HASH_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(first_sample);
    if let Some(last) = last_sample {
        hasher.update(last);
    }
    hasher.update(file_size.to_le_bytes());
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// A writer that feeds everything it writes through SHA-256.
///
/// The write paths use this to produce the trailing container hash in one
/// pass instead of re-reading the temp file.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Finish hashing, returning the digest and the inner writer.
    pub fn finalize(self) -> ([u8; HASH_LEN], W) {
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&self.hasher.finalize());
        (out, self.inner)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use hex_literal::hex;

    use super::*;

    #[test]
    fn hashing_writer_matches_one_shot() {
        let mut w = HashingWriter::new(Vec::new());
        w.write_all(b"abc").unwrap();
        let (digest, inner) = w.finalize();
        assert_eq!(inner, b"abc");
        // SHA-256("abc")
        assert_eq!(
            digest,
            hex!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }

    #[test]
    fn fingerprint_binds_size() {
        let data = vec![5u8; 1024];
        let a = source_fingerprint(&data, None, 1024);
        let b = source_fingerprint(&data, None, 1025);
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_binds_tail_sample() {
        let head = vec![1u8; 16];
        let a = source_fingerprint(&head, Some(&[2u8; 16]), 4_000_000);
        let b = source_fingerprint(&head, Some(&[3u8; 16]), 4_000_000);
        assert_ne!(a, b);
    }

    #[test]
    fn file_prefix_hash() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"abcdef").unwrap();
        let digest = hash_file_prefix(&mut file, 3).unwrap();
        assert_eq!(
            digest,
            hex!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
    }
}
