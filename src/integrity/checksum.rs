//! Size-prefixed SHA-512 checksums: `"<len>:<base64(sha512(bytes))>"`.

#![allow(missing_docs)]

use std::fs;
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use crate::core::errors::{FimError, Result};

/// Checksum of an in-memory buffer.
#[must_use]
pub fn checksum_bytes(bytes: &[u8]) -> String {
    let digest = Sha512::digest(bytes);
    format!("{}:{}", bytes.len(), STANDARD.encode(digest))
}

/// Byte length encoded in a checksum's prefix, if it parses.
#[must_use]
pub fn declared_len(checksum: &str) -> Option<u64> {
    checksum.split_once(':')?.0.parse().ok()
}

/// Computes checksums for files on disk.
pub trait ChecksumProvider: Send + Sync {
    fn checksum(&self, path: &Path) -> Result<String>;
}

/// Default provider: reads the whole file and hashes it with SHA-512.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha512Checksums;

impl ChecksumProvider for Sha512Checksums {
    fn checksum(&self, path: &Path) -> Result<String> {
        let bytes = fs::read(path).map_err(|source| FimError::io(path, source))?;
        Ok(checksum_bytes(&bytes))
    }
}

/// How a verified file differs from its database entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchKind {
    /// Length prefix differs.
    SizeChanged,
    /// Same length, different digest.
    ContentChanged,
    /// On disk but absent from the database.
    Untracked,
}

impl MismatchKind {
    /// Classify a mismatch from the stored and freshly computed checksums.
    #[must_use]
    pub fn classify(expected: Option<&str>, actual: &str) -> Self {
        match expected {
            None => Self::Untracked,
            Some(expected) => match (declared_len(expected), declared_len(actual)) {
                (Some(a), Some(b)) if a == b => Self::ContentChanged,
                _ => Self::SizeChanged,
            },
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::SizeChanged => "size changed",
            Self::ContentChanged => "content changed",
            Self::Untracked => "untracked",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_has_zero_prefix() {
        let sum = checksum_bytes(b"");
        assert!(sum.starts_with("0:"));
        // base64 of a 64-byte digest is 88 characters with padding.
        assert_eq!(sum.len(), "0:".len() + 88);
    }

    #[test]
    fn known_vector_abc() {
        let sum = checksum_bytes(b"abc");
        assert_eq!(
            sum,
            "3:3a81oZNherrMQXNJriBBMRLm+k6JqX6iCp7u5ktV05ohkpkqJ0/BqDa6PCOj/uu9RU1EI2Q86A4qmslPpUyknw=="
        );
    }

    #[test]
    fn deterministic_and_content_sensitive() {
        assert_eq!(checksum_bytes(b"hello"), checksum_bytes(b"hello"));
        assert_ne!(checksum_bytes(b"hello"), checksum_bytes(b"hellp"));
    }

    #[test]
    fn provider_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, b"0123456789").unwrap();
        let sum = Sha512Checksums.checksum(&path).unwrap();
        assert_eq!(sum, checksum_bytes(b"0123456789"));
        assert_eq!(declared_len(&sum), Some(10));
    }

    #[test]
    fn provider_reports_missing_file_as_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = Sha512Checksums
            .checksum(&dir.path().join("gone.txt"))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn classify_mismatch_kinds() {
        assert_eq!(
            MismatchKind::classify(Some("10:AAAA"), "12:BBBB"),
            MismatchKind::SizeChanged
        );
        assert_eq!(
            MismatchKind::classify(Some("10:AAAA"), "10:BBBB"),
            MismatchKind::ContentChanged
        );
        assert_eq!(MismatchKind::classify(None, "5:CCCC"), MismatchKind::Untracked);
        assert_eq!(
            MismatchKind::classify(Some("garbage"), "5:CCCC"),
            MismatchKind::SizeChanged
        );
    }
}
