// src/hash.rs

//! Checksums for package archives
//!
//! Repositories publish MD5 sums; SHA-256 is accepted as well. The algorithm
//! is inferred from the length of the hex digest.

use crate::error::Result;
use md5::Md5;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumType {
    Md5,
    Sha256,
}

impl ChecksumType {
    /// Infer the algorithm of a hex digest from its length
    pub fn detect(digest: &str) -> Option<Self> {
        if !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        match digest.len() {
            32 => Some(ChecksumType::Md5),
            64 => Some(ChecksumType::Sha256),
            _ => None,
        }
    }
}

enum Inner {
    Md5(Md5),
    Sha256(Sha256),
}

/// Incremental hasher over one of the supported algorithms
pub struct Hasher {
    inner: Inner,
}

impl Hasher {
    pub fn new(kind: ChecksumType) -> Self {
        let inner = match kind {
            ChecksumType::Md5 => Inner::Md5(Md5::new()),
            ChecksumType::Sha256 => Inner::Sha256(Sha256::new()),
        };
        Self { inner }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            Inner::Md5(h) => h.update(data),
            Inner::Sha256(h) => h.update(data),
        }
    }

    /// Lowercase hex digest
    pub fn finalize(self) -> String {
        match self.inner {
            Inner::Md5(h) => format!("{:x}", h.finalize()),
            Inner::Sha256(h) => format!("{:x}", h.finalize()),
        }
    }
}

impl Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writer adapter that hashes everything passing through it
pub struct HashingWriter<W> {
    inner: W,
    hasher: Hasher,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W, kind: ChecksumType) -> Self {
        Self {
            inner,
            hasher: Hasher::new(kind),
            written: 0,
        }
    }

    /// Return the wrapped writer, the digest and the byte count
    pub fn finish(self) -> (W, String, u64) {
        (self.inner, self.hasher.finalize(), self.written)
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

/// Hash a file on disk
pub fn file_checksum(path: &Path, kind: ChecksumType) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Hasher::new(kind);
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize())
}

/// Compare two hex digests, ignoring case
pub fn digests_match(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}
