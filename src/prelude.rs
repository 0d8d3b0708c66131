//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use folder_integrity_monitor::prelude::*;
//! ```

// Core
pub use crate::core::config::{CheckerConfig, Config};
pub use crate::core::errors::{FimError, Result};

// Integrity
pub use crate::integrity::checker::{
    CheckerOptions, Finding, FolderIntegrityChecker, RebuildReport, VerifyFailure, VerifyReport,
};
pub use crate::integrity::checksum::{ChecksumProvider, MismatchKind, Sha512Checksums, checksum_bytes};
pub use crate::integrity::database::IntegrityDatabase;
pub use crate::integrity::key::PathKey;

// Scheduling
pub use crate::scheduler::debounce::DebounceScheduler;
pub use crate::scheduler::task_queue::{Task, TaskQueue};

// Events
pub use crate::watcher::events::{ChangeEvent, EventSender, event_channel};

// Logging
pub use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle, spawn_logger};
