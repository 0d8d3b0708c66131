//! FIM-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, FimError>;

/// Top-level error type for the folder integrity monitor.
#[derive(Debug, Error)]
pub enum FimError {
    #[error("[FIM-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[FIM-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[FIM-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[FIM-2001] {path} is not inside watched root {root}")]
    OutsideRoot { path: PathBuf, root: PathBuf },

    #[error("[FIM-2002] {path} has a name that cannot be stored as a database key")]
    UnrepresentablePath { path: PathBuf },

    #[error("[FIM-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[FIM-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[FIM-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[FIM-3004] queued task panicked: {details}")]
    TaskPanicked { details: String },

    #[error("[FIM-3101] change notification source failed for {path}: {details}")]
    Watch { path: PathBuf, details: String },

    #[error("[FIM-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl FimError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "FIM-1001",
            Self::MissingConfig { .. } => "FIM-1002",
            Self::ConfigParse { .. } => "FIM-1003",
            Self::OutsideRoot { .. } => "FIM-2001",
            Self::UnrepresentablePath { .. } => "FIM-2002",
            Self::Serialization { .. } => "FIM-2101",
            Self::Io { .. } => "FIM-3002",
            Self::ChannelClosed { .. } => "FIM-3003",
            Self::TaskPanicked { .. } => "FIM-3004",
            Self::Watch { .. } => "FIM-3101",
            Self::Runtime { .. } => "FIM-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Watch { .. } | Self::TaskPanicked { .. } | Self::Runtime { .. }
        )
    }

    /// Whether this is an IO failure caused by the path not existing.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for FimError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for FimError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
