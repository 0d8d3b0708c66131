//! Protective attributes on the checksum database file.
//!
//! The database is "sealed" between saves so casual edits fail loudly. A save
//! unseals, writes, reseals, then asks the filesystem to compress the file.
//! Every step here is best-effort: a failure is reported to the caller but
//! never prevents the data itself from being written.

#![allow(missing_docs)]

use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;

use crate::core::errors::{FimError, Result};

/// Attribute operations applied around every database save.
pub trait DatabaseAttributes: Send + Sync {
    /// Make the file writable again before a save.
    fn unseal(&self, path: &Path) -> Result<()>;
    /// Protect the file after a save.
    fn seal(&self, path: &Path) -> Result<()>;
    /// Request filesystem-level compression. Unsupported filesystems are not an error.
    fn try_enable_compression(&self, path: &Path) -> Result<()>;
}

/// Leaves the file untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAttributes;

impl DatabaseAttributes for NoopAttributes {
    fn unseal(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn seal(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    fn try_enable_compression(&self, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Unix implementation: seal = read-only permission bits, compression via `chattr +c`.
#[cfg(unix)]
#[derive(Debug, Clone, Copy)]
pub struct UnixAttributes {
    pub compress: bool,
}

#[cfg(unix)]
impl UnixAttributes {
    const SEALED_MODE: u32 = 0o444;
    const UNSEALED_MODE: u32 = 0o644;

    fn set_mode(path: &Path, mode: u32) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        match fs::metadata(path) {
            Ok(meta) => {
                let mut perms = meta.permissions();
                if perms.mode() & 0o777 == mode {
                    return Ok(());
                }
                perms.set_mode(mode);
                fs::set_permissions(path, perms).map_err(|source| FimError::io(path, source))
            }
            // Nothing to unseal before the first save.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(FimError::io(path, source)),
        }
    }
}

#[cfg(unix)]
impl DatabaseAttributes for UnixAttributes {
    fn unseal(&self, path: &Path) -> Result<()> {
        Self::set_mode(path, Self::UNSEALED_MODE)
    }

    fn seal(&self, path: &Path) -> Result<()> {
        Self::set_mode(path, Self::SEALED_MODE)
    }

    fn try_enable_compression(&self, path: &Path) -> Result<()> {
        if !self.compress || !cfg!(target_os = "linux") {
            return Ok(());
        }
        // chattr is absent on minimal systems and fails on filesystems without
        // compression support; neither is worth surfacing.
        match Command::new("chattr")
            .arg("+c")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FimError::Runtime {
                details: format!("chattr +c {}: {e}", path.display()),
            }),
        }
    }
}

/// Pick the attribute strategy for the current platform and settings.
pub fn detect_attributes(seal: bool, compress: bool) -> Arc<dyn DatabaseAttributes> {
    #[cfg(unix)]
    {
        if seal || compress {
            return Arc::new(SealGate {
                seal,
                inner: UnixAttributes { compress },
            });
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (seal, compress);
    }
    Arc::new(NoopAttributes)
}

/// Skips seal/unseal when sealing is disabled but compression is still wanted.
#[cfg(unix)]
struct SealGate {
    seal: bool,
    inner: UnixAttributes,
}

#[cfg(unix)]
impl DatabaseAttributes for SealGate {
    fn unseal(&self, path: &Path) -> Result<()> {
        if self.seal { self.inner.unseal(path) } else { Ok(()) }
    }

    fn seal(&self, path: &Path) -> Result<()> {
        if self.seal { self.inner.seal(path) } else { Ok(()) }
    }

    fn try_enable_compression(&self, path: &Path) -> Result<()> {
        self.inner.try_enable_compression(path)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn mode(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn seal_and_unseal_toggle_permission_bits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checksum.db");
        fs::write(&path, "x").unwrap();

        let attrs = UnixAttributes { compress: false };
        attrs.seal(&path).unwrap();
        assert_eq!(mode(&path), 0o444);
        attrs.unseal(&path).unwrap();
        assert_eq!(mode(&path), 0o644);
    }

    #[test]
    fn unseal_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let attrs = UnixAttributes { compress: false };
        assert!(attrs.unseal(&dir.path().join("absent.db")).is_ok());
    }

    #[test]
    fn compression_request_never_fails_on_plain_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checksum.db");
        fs::write(&path, "x").unwrap();
        let attrs = UnixAttributes { compress: true };
        assert!(attrs.try_enable_compression(&path).is_ok());
    }

    #[test]
    fn detect_without_seal_leaves_mode_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checksum.db");
        fs::write(&path, "x").unwrap();
        let before = mode(&path);

        let attrs = detect_attributes(false, false);
        attrs.seal(&path).unwrap();
        assert_eq!(mode(&path), before);
    }
}
