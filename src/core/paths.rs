//! Path helpers: absolute resolution and root-relative database keys.

use std::env;
use std::path::{Component, Path, PathBuf};

/// Separator used inside database keys regardless of host platform.
pub const KEY_SEPARATOR: char = '/';

/// Resolve a path to an absolute, normalized path.
///
/// Uses `fs::canonicalize` when the path exists so symlinked roots resolve to
/// the same location the change source reports. Otherwise the path is made
/// absolute against the CWD and `.`/`..` are folded syntactically.
pub fn resolve_absolute_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
    };

    if let Ok(canonical) = std::fs::canonicalize(&absolute) {
        return canonical;
    }

    normalize_syntactic(&absolute)
}

fn normalize_syntactic(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(..) | Component::RootDir | Component::Normal(_) => {
                components.push(component);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                }
            }
        }
    }
    components.into_iter().collect()
}

/// Build the database key for `path` relative to `root`.
///
/// Returns `None` when `path` is not strictly below `root` (the root itself
/// has no key) or when a component is not valid UTF-8, since such a key
/// could not be mapped back to the file. Components are joined with
/// [`KEY_SEPARATOR`].
pub fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut key = String::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                if !key.is_empty() {
                    key.push(KEY_SEPARATOR);
                }
                key.push_str(part.to_str()?);
            }
            Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) | Component::RootDir => return None,
        }
    }
    if key.is_empty() { None } else { Some(key) }
}

/// Resolve a database key back to an absolute path under `root`.
pub fn key_to_path(root: &Path, key: &str) -> PathBuf {
    key.split(KEY_SEPARATOR)
        .filter(|part| !part.is_empty())
        .fold(root.to_path_buf(), |acc, part| acc.join(part))
}
