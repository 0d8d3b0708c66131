//! In-memory checksum index and its line-oriented file format.
//!
//! Each line is `"<checksum> => <relative path>"`. Lines are written parents
//! first (depth, then path). On load, blank and malformed lines are skipped
//! and the first occurrence of a key wins.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::io::{BufRead, Write};

use memchr::memmem;
use parking_lot::RwLock;

use crate::integrity::key::PathKey;

/// Separator between checksum and path in a database line.
pub const LINE_SEPARATOR: &str = "=>";

/// Outcome of reading a database file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub loaded: usize,
    /// Blank, malformed or duplicate lines.
    pub skipped: usize,
}

/// Concurrent map from case-insensitive relative path to checksum.
#[derive(Debug, Default)]
pub struct IntegrityDatabase {
    entries: RwLock<HashMap<PathKey, String>>,
}

impl IntegrityDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &PathKey) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    pub fn contains(&self, key: &PathKey) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Insert or replace. Returns the previous checksum.
    pub fn upsert(&self, key: PathKey, checksum: String) -> Option<String> {
        self.entries.write().insert(key, checksum)
    }

    pub fn remove(&self, key: &PathKey) -> Option<String> {
        self.entries.write().remove(key)
    }

    /// Remove `prefix` and every key beneath it. Returns the number removed.
    pub fn remove_tree(&self, prefix: &PathKey) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| !key.is_within(prefix));
        before - entries.len()
    }

    /// Move `from` and every key beneath it under `to`, keeping checksums.
    /// Existing entries at the destination are overwritten. Returns the
    /// number of entries moved.
    pub fn rename_tree(&self, from: &PathKey, to: &PathKey) -> usize {
        let mut entries = self.entries.write();
        let moving: Vec<PathKey> = entries
            .keys()
            .filter(|key| key.is_within(from))
            .cloned()
            .collect();
        let mut moved = Vec::with_capacity(moving.len());
        for key in moving {
            if let (Some(checksum), Some(target)) = (entries.remove(&key), key.rebase(from, to)) {
                moved.push((target, checksum));
            }
        }
        let count = moved.len();
        for (target, checksum) in moved {
            // Remove first so a case-only rename takes the new spelling.
            entries.remove(&target);
            entries.insert(target, checksum);
        }
        count
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Copy of every entry in file order.
    pub fn sorted_entries(&self) -> Vec<(PathKey, String)> {
        let mut out: Vec<(PathKey, String)> = self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Serialize every entry. The lock is held only while copying.
    pub fn write_to<W: Write>(&self, mut out: W) -> std::io::Result<usize> {
        let entries = self.sorted_entries();
        for (key, checksum) in &entries {
            writeln!(out, "{}", format_line(checksum, key.as_str()))?;
        }
        out.flush()?;
        Ok(entries.len())
    }

    /// Replace the contents with entries read from `input`.
    ///
    /// Lines that are not valid UTF-8 count as malformed. Only read errors
    /// abort the load, and then the current contents are kept.
    pub fn read_from<R: BufRead>(&self, mut input: R) -> std::io::Result<LoadSummary> {
        let mut fresh: HashMap<PathKey, String> = HashMap::new();
        let mut summary = LoadSummary::default();
        let mut raw = Vec::new();
        loop {
            raw.clear();
            if input.read_until(b'\n', &mut raw)? == 0 {
                break;
            }
            let Ok(line) = std::str::from_utf8(&raw) else {
                summary.skipped += 1;
                continue;
            };
            let line = line.strip_suffix('\n').unwrap_or(line);
            match parse_line(line) {
                Some((checksum, key)) => {
                    let key = PathKey::new(key);
                    if fresh.contains_key(&key) {
                        summary.skipped += 1;
                    } else {
                        fresh.insert(key, checksum.to_string());
                        summary.loaded += 1;
                    }
                }
                None if line.trim().is_empty() => {}
                None => summary.skipped += 1,
            }
        }
        *self.entries.write() = fresh;
        Ok(summary)
    }
}

/// Render one database line.
pub fn format_line(checksum: &str, key: &str) -> String {
    format!("{checksum} {LINE_SEPARATOR} {key}")
}

/// Split a line at the first separator into `(checksum, key)`.
///
/// Checksums never contain the separator, so keys may.
pub fn parse_line(line: &str) -> Option<(&str, &str)> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let at = memmem::find(line.as_bytes(), LINE_SEPARATOR.as_bytes())?;
    let checksum = line[..at].trim_end();
    let key = line[at + LINE_SEPARATOR.len()..].trim_start();
    if checksum.is_empty() || key.is_empty() {
        return None;
    }
    Some((checksum, key))
}
