use std::collections::BTreeMap;
use std::io::{self, Read};

use sha2::{Digest, Sha256};
use thiserror::Error;

/// `<hex-digest><two spaces><relative path>` per line, sorted by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumSet {
    entries: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChecksumParseError {
    #[error("line {line} is not `<sha256>  <path>`")]
    Malformed { line: usize },
    #[error("line {line} repeats path {path}")]
    Duplicate { line: usize, path: String },
    #[error("checksum file is not valid UTF-8")]
    Encoding,
}

impl ChecksumSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, digest: impl Into<String>) {
        self.entries.insert(path.into(), digest.into());
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.entries.get(path).map(String::as_str)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (path, digest) in &self.entries {
            out.push_str(digest);
            out.push_str("  ");
            out.push_str(path);
            out.push('\n');
        }
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ChecksumParseError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ChecksumParseError::Encoding)?;
        let mut set = ChecksumSet::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            if raw.is_empty() {
                continue;
            }
            let (digest, path) = raw
                .split_once("  ")
                .ok_or(ChecksumParseError::Malformed { line })?;
            if digest.len() != 64
                || !digest.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
                || path.is_empty()
            {
                return Err(ChecksumParseError::Malformed { line });
            }
            if set.contains(path) {
                return Err(ChecksumParseError::Duplicate {
                    line,
                    path: path.to_string(),
                });
            }
            set.insert(path, digest);
        }
        Ok(set)
    }
}

/// Reader adapter that hashes and counts everything read through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    pub fn finish(self) -> (String, u64) {
        (format!("{:x}", self.hasher.finalize()), self.bytes)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.hasher.update(&buf[..read]);
        self.bytes += read as u64;
        Ok(read)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
