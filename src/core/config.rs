//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{FimError, Result};

/// Full monitor configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub checker: CheckerConfig,
    pub daemon: DaemonConfig,
    pub paths: PathsConfig,
}

/// Per-root checker behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CheckerConfig {
    /// File name of the checksum database, created directly under each root.
    pub database_file_name: String,
    /// Quiet window before a burst of mutations is persisted.
    pub save_debounce_ms: u64,
    /// Re-enqueue a failed mutation at the tail instead of dropping it.
    pub requeue_on_failure: bool,
    /// Descend into symlinked directories during rebuild/verify walks.
    pub follow_symlinks: bool,
    /// Capacity of the bounded change-event channel.
    pub event_channel_capacity: usize,
    /// Mark the database read-only between saves.
    pub seal_database: bool,
    /// Ask the filesystem to compress the database file (best-effort).
    pub request_compression: bool,
}

/// Supervisor settings for `fim watch`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    pub roots: Vec<PathBuf>,
    /// Periodic verification interval; 0 disables it.
    pub verify_interval_secs: u64,
    pub poll_interval_ms: u64,
    /// Build a fresh database for roots that have none yet.
    pub rebuild_missing_database: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub activity_log: PathBuf,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            database_file_name: "checksum.db".to_string(),
            save_debounce_ms: 10_000,
            requeue_on_failure: true,
            follow_symlinks: false,
            event_channel_capacity: 4096,
            seal_database: true,
            request_compression: true,
        }
    }
}

impl CheckerConfig {
    #[must_use]
    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            verify_interval_secs: 0,
            poll_interval_ms: 500,
            rebuild_missing_database: true,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!("[FIM-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths");
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        Self {
            config_file: home_dir.join(".config").join("fim").join("config.toml"),
            activity_log: home_dir
                .join(".local")
                .join("share")
                .join("fim")
                .join("activity.jsonl"),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, |name| env::var(name).ok())
    }

    fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| FimError::io(&path_buf, source))?;
            toml::from_str::<Self>(&raw)?
        } else if path.is_some() {
            return Err(FimError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides(&lookup)?;
        cfg.normalize_roots();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for the startup log line.
    ///
    /// FNV-1a over the canonical JSON so the value is stable across processes.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides<F>(&mut self, lookup: &F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvOverrides { lookup };

        if let Some(raw) = env.get("FIM_CHECKER_DATABASE_FILE_NAME") {
            self.checker.database_file_name = raw;
        }
        env.set_u64("FIM_CHECKER_SAVE_DEBOUNCE_MS", &mut self.checker.save_debounce_ms)?;
        env.set_bool("FIM_CHECKER_REQUEUE_ON_FAILURE", &mut self.checker.requeue_on_failure)?;
        env.set_bool("FIM_CHECKER_FOLLOW_SYMLINKS", &mut self.checker.follow_symlinks)?;
        env.set_usize(
            "FIM_CHECKER_EVENT_CHANNEL_CAPACITY",
            &mut self.checker.event_channel_capacity,
        )?;
        env.set_bool("FIM_CHECKER_SEAL_DATABASE", &mut self.checker.seal_database)?;
        env.set_bool(
            "FIM_CHECKER_REQUEST_COMPRESSION",
            &mut self.checker.request_compression,
        )?;

        if let Some(raw) = env.get("FIM_DAEMON_ROOTS") {
            self.daemon.roots = env::split_paths(&raw).collect();
        }
        env.set_u64(
            "FIM_DAEMON_VERIFY_INTERVAL_SECS",
            &mut self.daemon.verify_interval_secs,
        )?;
        env.set_u64("FIM_DAEMON_POLL_INTERVAL_MS", &mut self.daemon.poll_interval_ms)?;
        env.set_bool(
            "FIM_DAEMON_REBUILD_MISSING_DATABASE",
            &mut self.daemon.rebuild_missing_database,
        )?;

        if let Some(raw) = env.get("FIM_PATHS_ACTIVITY_LOG") {
            self.paths.activity_log = PathBuf::from(raw);
        }
        Ok(())
    }

    /// Strip trailing slashes so roots compare equal to watcher-reported paths.
    fn normalize_roots(&mut self) {
        for root in &mut self.daemon.roots {
            let s = root.to_string_lossy();
            if s.len() > 1
                && let Some(stripped) = s.strip_suffix('/')
            {
                *root = PathBuf::from(stripped);
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let name = self.checker.database_file_name.trim();
        if name.is_empty() || name.contains('/') || name.contains('\\') || name == "." || name == ".." {
            return Err(FimError::InvalidConfig {
                details: format!(
                    "checker.database_file_name must be a plain file name, got {:?}",
                    self.checker.database_file_name
                ),
            });
        }
        if self.checker.save_debounce_ms == 0 {
            return Err(FimError::InvalidConfig {
                details: "checker.save_debounce_ms must be > 0".to_string(),
            });
        }
        if self.checker.event_channel_capacity == 0 {
            return Err(FimError::InvalidConfig {
                details: "checker.event_channel_capacity must be > 0".to_string(),
            });
        }
        if self.daemon.poll_interval_ms == 0 {
            return Err(FimError::InvalidConfig {
                details: "daemon.poll_interval_ms must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

struct EnvOverrides<'a, F> {
    lookup: &'a F,
}

impl<F> EnvOverrides<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|raw| !raw.trim().is_empty())
    }

    fn set_u64(&self, name: &str, slot: &mut u64) -> Result<()> {
        if let Some(raw) = self.get(name) {
            *slot = raw.trim().parse::<u64>().map_err(|error| parse_error(name, &raw, &error))?;
        }
        Ok(())
    }

    fn set_usize(&self, name: &str, slot: &mut usize) -> Result<()> {
        if let Some(raw) = self.get(name) {
            *slot = raw
                .trim()
                .parse::<usize>()
                .map_err(|error| parse_error(name, &raw, &error))?;
        }
        Ok(())
    }

    fn set_bool(&self, name: &str, slot: &mut bool) -> Result<()> {
        if let Some(raw) = self.get(name) {
            *slot = raw
                .trim()
                .parse::<bool>()
                .map_err(|error| parse_error(name, &raw, &error))?;
        }
        Ok(())
    }
}

fn parse_error(name: &str, raw: &str, error: &dyn std::fmt::Display) -> FimError {
    FimError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, FimError};
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
            .collect()
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.checker.database_file_name, "checksum.db");
        assert_eq!(cfg.checker.save_debounce_ms, 10_000);
        assert!(cfg.checker.requeue_on_failure);
    }

    #[test]
    fn database_file_name_must_be_plain() {
        let mut cfg = Config::default();
        cfg.checker.database_file_name = "sub/checksum.db".to_string();
        let err = cfg.validate().expect_err("expected invalid file name");
        assert!(matches!(err, FimError::InvalidConfig { .. }));
    }

    #[test]
    fn zero_debounce_rejected() {
        let mut cfg = Config::default();
        cfg.checker.save_debounce_ms = 0;
        let err = cfg.validate().expect_err("expected debounce validation error");
        assert!(err.to_string().contains("save_debounce_ms"));
    }

    #[test]
    fn stable_hash_tracks_changes() {
        let cfg = Config::default();
        assert_eq!(cfg.stable_hash().unwrap(), cfg.stable_hash().unwrap());
        let mut modified = Config::default();
        modified.checker.requeue_on_failure = false;
        assert_ne!(cfg.stable_hash().unwrap(), modified.stable_hash().unwrap());
    }

    #[test]
    fn toml_sections_parse_with_defaults_for_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[checker]\nsave_debounce_ms = 250\n\n[daemon]\nroots = [\"/srv/data/\"]\n",
        )
        .unwrap();

        let cfg = Config::load_with(Some(&path), |_| None).unwrap();
        assert_eq!(cfg.checker.save_debounce_ms, 250);
        assert_eq!(cfg.checker.database_file_name, "checksum.db");
        assert_eq!(cfg.daemon.roots, vec![PathBuf::from("/srv/data")]);
        assert_eq!(cfg.paths.config_file, path);
    }

    #[test]
    fn env_overrides_apply_after_file() {
        let env = vars(&[
            ("FIM_CHECKER_SAVE_DEBOUNCE_MS", "42"),
            ("FIM_CHECKER_REQUEUE_ON_FAILURE", "false"),
            ("FIM_DAEMON_VERIFY_INTERVAL_SECS", "3600"),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[checker]\nsave_debounce_ms = 250\n").unwrap();

        let cfg = Config::load_with(Some(&path), |name| env.get(name).cloned()).unwrap();
        assert_eq!(cfg.checker.save_debounce_ms, 42);
        assert!(!cfg.checker.requeue_on_failure);
        assert_eq!(cfg.daemon.verify_interval_secs, 3600);
    }

    #[test]
    fn invalid_env_boolean_rejected() {
        let env = vars(&[("FIM_CHECKER_SEAL_DATABASE", "sometimes")]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "").unwrap();

        let err = Config::load_with(Some(&path), |name| env.get(name).cloned())
            .expect_err("expected env parse failure");
        match err {
            FimError::ConfigParse { context, details } => {
                assert_eq!(context, "env");
                assert!(details.contains("FIM_CHECKER_SEAL_DATABASE"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn load_returns_error_for_explicit_missing_path() {
        let err = Config::load(Some(Path::new("/nonexistent/fim/config.toml")))
            .expect_err("missing explicit path must fail");
        assert!(matches!(err, FimError::MissingConfig { .. }));
    }
}
