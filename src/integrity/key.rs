//! Case-insensitive database keys.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::core::paths::KEY_SEPARATOR;

/// Root-relative path key. Equality, hashing and ordering ignore case; the
/// original spelling is kept for display and for mapping back to disk.
#[derive(Debug, Clone)]
pub struct PathKey {
    display: String,
    folded: String,
}

impl PathKey {
    pub fn new(key: impl Into<String>) -> Self {
        let display: String = key.into();
        // Per character, so a final sigma folds like any other sigma.
        let folded = display.chars().flat_map(char::to_lowercase).collect();
        Self { display, folded }
    }

    /// Key as first spelled.
    pub fn as_str(&self) -> &str {
        &self.display
    }

    /// Per-character lowercase form used for comparisons.
    pub fn folded(&self) -> &str {
        &self.folded
    }

    /// Number of directories above the file.
    pub fn depth(&self) -> usize {
        self.display.matches(KEY_SEPARATOR).count()
    }

    /// True when `self` is `ancestor` or lies beneath it.
    pub fn is_within(&self, ancestor: &Self) -> bool {
        self.folded == ancestor.folded
            || (self.folded.len() > ancestor.folded.len()
                && self.folded.starts_with(&ancestor.folded)
                && self.folded[ancestor.folded.len()..].starts_with(KEY_SEPARATOR))
    }

    /// Replace the `from` prefix with `to`. `None` if `self` is not within `from`.
    pub fn rebase(&self, from: &Self, to: &Self) -> Option<Self> {
        if !self.is_within(from) {
            return None;
        }
        // Lowercasing can change byte lengths, so cut the display form by
        // component count rather than by byte offset.
        let skip = from.display.split(KEY_SEPARATOR).count();
        let rest: Vec<&str> = self.display.split(KEY_SEPARATOR).skip(skip).collect();
        if rest.is_empty() {
            Some(to.clone())
        } else {
            Some(Self::new(format!(
                "{}{KEY_SEPARATOR}{}",
                to.display,
                rest.join(&KEY_SEPARATOR.to_string())
            )))
        }
    }
}

impl PartialEq for PathKey {
    fn eq(&self, other: &Self) -> bool {
        self.folded == other.folded
    }
}

impl Eq for PathKey {}

impl Hash for PathKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.folded.hash(state);
    }
}

impl PartialOrd for PathKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Parents before children: depth first, then path.
impl Ord for PathKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.depth()
            .cmp(&other.depth())
            .then_with(|| self.folded.cmp(&other.folded))
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

impl From<&str> for PathKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn case_variants_are_equal() {
        let a = PathKey::new("Dir/Foo.txt");
        let b = PathKey::new("dir/foo.txt");
        assert_eq!(a, b);
        let set: HashSet<PathKey> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn final_sigma_folds_like_medial_sigma() {
        assert_eq!(PathKey::new("ΑΣ"), PathKey::new("ασ"));
        assert_eq!(PathKey::new("ΑΣ"), PathKey::new("ας".to_uppercase()));
        assert_eq!(PathKey::new("dir/ΟΔΟΣ.txt").folded(), "dir/οδοσ.txt");
    }

    #[test]
    fn display_keeps_original_spelling() {
        assert_eq!(PathKey::new("Dir/Foo.txt").to_string(), "Dir/Foo.txt");
    }

    #[test]
    fn ordering_puts_parents_first() {
        let mut keys = vec![
            PathKey::new("b/deep/x.txt"),
            PathKey::new("z.txt"),
            PathKey::new("a/y.txt"),
            PathKey::new("A.txt"),
        ];
        keys.sort();
        let order: Vec<&str> = keys.iter().map(PathKey::as_str).collect();
        assert_eq!(order, vec!["A.txt", "z.txt", "a/y.txt", "b/deep/x.txt"]);
    }

    #[test]
    fn within_requires_separator_boundary() {
        let dir = PathKey::new("docs");
        assert!(PathKey::new("docs").is_within(&dir));
        assert!(PathKey::new("Docs/a.txt").is_within(&dir));
        assert!(!PathKey::new("docs2/a.txt").is_within(&dir));
        assert!(!PathKey::new("doc").is_within(&dir));
    }

    #[test]
    fn rebase_moves_prefix() {
        let from = PathKey::new("Old");
        let to = PathKey::new("New/Place");
        let moved = PathKey::new("old/sub/a.txt").rebase(&from, &to).unwrap();
        assert_eq!(moved.as_str(), "New/Place/sub/a.txt");
        assert_eq!(PathKey::new("old").rebase(&from, &to).unwrap(), to);
        assert!(PathKey::new("other/a.txt").rebase(&from, &to).is_none());
    }
}
