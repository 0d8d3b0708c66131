#![forbid(unsafe_code)]

//! Folder Integrity Monitor (fim): keeps a persisted checksum database of a
//! directory tree current from change notifications, and verifies the live
//! tree against it on demand.
//!
//! Building blocks:
//! 1. **Task queue** with tag-based cancellation and a single on-demand worker
//! 2. **Debounce scheduler** that coalesces bursts of saves
//! 3. **Integrity checker** that owns one root's database and applies change
//!    events to it
//!
//! # Library usage
//!
//! ```rust,no_run
//! use folder_integrity_monitor::prelude::*;
//!
//! # fn demo() -> Result<()> {
//! let checker = FolderIntegrityChecker::create(std::path::Path::new("/srv/data"), &CheckerConfig::default())?;
//! let report = checker.verify_integrity(|path, _, _| println!("{}", path.display()), None);
//! println!("{} checked", report.checked);
//! checker.close()?;
//! # Ok(())
//! # }
//! ```

pub mod prelude;

pub mod core;
#[cfg(feature = "daemon")]
pub mod daemon;
pub mod integrity;
pub mod logger;
pub mod platform;
pub mod scheduler;
pub mod watcher;
