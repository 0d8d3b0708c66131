//! Activity logger thread: producers send `ActivityEvent`s over a bounded
//! crossbeam channel; one dedicated thread owns the `JsonlWriter`.
//!
//! `try_send()` keeps the checker worker and the intake thread from ever
//! blocking on logging back-pressure. Dropped events are counted and
//! reported as a warning line on the next successful receive.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::errors::{FimError, Result};
use crate::logger::jsonl::{EventType, JsonlConfig, JsonlWriter, LogEntry, Severity};

/// Default bounded channel capacity for log events.
const CHANNEL_CAPACITY: usize = 1024;

/// Events emitted by checkers and the supervisor.
#[derive(Debug, Clone)]
pub enum ActivityEvent {
    CheckerStarted {
        root: String,
        entries: u64,
        config_hash: String,
    },
    CheckerStopped {
        root: String,
        entries: u64,
    },
    EntryUpdated {
        root: String,
        path: String,
        checksum: String,
    },
    EntryRemoved {
        root: String,
        path: String,
        removed: u64,
    },
    EntryRenamed {
        root: String,
        from: String,
        to: String,
        rehashed: bool,
    },
    DatabaseSaved {
        root: String,
        entries: u64,
        duration_ms: u64,
    },
    DatabaseLoaded {
        root: String,
        entries: u64,
    },
    RebuildCompleted {
        root: String,
        indexed: u64,
        skipped: u64,
        duration_ms: u64,
    },
    VerifyCompleted {
        root: String,
        checked: u64,
        mismatches: u64,
        untracked: u64,
        errors: u64,
        duration_ms: u64,
    },
    ChecksumMismatch {
        root: String,
        path: String,
        expected: String,
        actual: String,
    },
    UntrackedFile {
        root: String,
        path: String,
        actual: String,
    },
    TaskFailed {
        root: String,
        path: Option<String>,
        error_code: String,
        error_message: String,
        requeued: bool,
    },
    Error {
        root: Option<String>,
        code: String,
        message: String,
    },
    /// Sentinel to request graceful shutdown of the logger thread.
    Shutdown,
}

impl ActivityEvent {
    /// Generic error event from a `FimError`.
    pub fn error(root: Option<String>, err: &FimError) -> Self {
        Self::Error {
            root,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Thread-safe, cheaply-cloneable handle for sending log events.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl std::fmt::Debug for ActivityLoggerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityLoggerHandle")
            .field("dropped_events", &self.dropped_events())
            .finish_non_exhaustive()
    }
}

impl ActivityLoggerHandle {
    /// Send an event to the logger thread. Non-blocking; a full channel drops
    /// the event and bumps the counter.
    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of events dropped due to channel back-pressure.
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Ask the logger thread to flush and exit. Blocks only until the
    /// sentinel is queued.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }
}

/// Options for the activity logger.
pub struct ActivityLoggerConfig {
    pub jsonl_config: JsonlConfig,
    pub channel_capacity: usize,
}

impl ActivityLoggerConfig {
    pub fn new(jsonl_config: JsonlConfig) -> Self {
        Self {
            jsonl_config,
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

/// Spawn the logger thread and return a handle.
///
/// The thread runs until `handle.shutdown()` is called or every handle has
/// been dropped.
pub fn spawn_logger(
    config: ActivityLoggerConfig,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded::<ActivityEvent>(config.channel_capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    let dropped_clone = Arc::clone(&dropped);

    let handle = ActivityLoggerHandle {
        tx,
        dropped_events: dropped,
    };

    let join = thread::Builder::new()
        .name("fim-logger".to_string())
        .spawn(move || logger_thread_main(&rx, config.jsonl_config, &dropped_clone))
        .map_err(|e| FimError::Runtime {
            details: format!("failed to spawn logger thread: {e}"),
        })?;

    Ok((handle, join))
}

fn logger_thread_main(rx: &Receiver<ActivityEvent>, jsonl_config: JsonlConfig, dropped: &AtomicU64) {
    let mut jsonl = JsonlWriter::open(jsonl_config);

    while let Ok(event) = rx.recv() {
        let d = dropped.swap(0, Ordering::Relaxed);
        if d > 0 {
            let mut warn = LogEntry::new(EventType::Error, Severity::Warning);
            warn.details = Some(format!("{d} log events dropped due to back-pressure"));
            jsonl.write_entry(&warn);
        }

        if matches!(event, ActivityEvent::Shutdown) {
            break;
        }
        jsonl.write_entry(&event_to_log_entry(event));
    }

    jsonl.flush();
    jsonl.fsync();
}

fn event_to_log_entry(event: ActivityEvent) -> LogEntry {
    match event {
        ActivityEvent::CheckerStarted {
            root,
            entries,
            config_hash,
        } => {
            let mut e = LogEntry::new(EventType::CheckerStart, Severity::Info);
            e.root = Some(root);
            e.entries = Some(entries);
            e.details = Some(format!(
                "version={} config_hash={config_hash}",
                env!("CARGO_PKG_VERSION")
            ));
            e
        }
        ActivityEvent::CheckerStopped { root, entries } => {
            let mut e = LogEntry::new(EventType::CheckerStop, Severity::Info);
            e.root = Some(root);
            e.entries = Some(entries);
            e
        }
        ActivityEvent::EntryUpdated {
            root,
            path,
            checksum,
        } => {
            let mut e = LogEntry::new(EventType::EntryUpdate, Severity::Info);
            e.root = Some(root);
            e.path = Some(path);
            e.actual = Some(checksum);
            e
        }
        ActivityEvent::EntryRemoved {
            root,
            path,
            removed,
        } => {
            let mut e = LogEntry::new(EventType::EntryRemove, Severity::Info);
            e.root = Some(root);
            e.path = Some(path);
            e.entries = Some(removed);
            e
        }
        ActivityEvent::EntryRenamed {
            root,
            from,
            to,
            rehashed,
        } => {
            let mut e = LogEntry::new(EventType::EntryRename, Severity::Info);
            e.root = Some(root);
            e.from = Some(from);
            e.path = Some(to);
            e.details = Some(format!("rehashed={rehashed}"));
            e
        }
        ActivityEvent::DatabaseSaved {
            root,
            entries,
            duration_ms,
        } => {
            let mut e = LogEntry::new(EventType::DatabaseSave, Severity::Info);
            e.root = Some(root);
            e.entries = Some(entries);
            e.duration_ms = Some(duration_ms);
            e.ok = Some(true);
            e
        }
        ActivityEvent::DatabaseLoaded { root, entries } => {
            let mut e = LogEntry::new(EventType::DatabaseLoad, Severity::Info);
            e.root = Some(root);
            e.entries = Some(entries);
            e.ok = Some(true);
            e
        }
        ActivityEvent::RebuildCompleted {
            root,
            indexed,
            skipped,
            duration_ms,
        } => {
            let mut e = LogEntry::new(EventType::RebuildComplete, Severity::Info);
            e.root = Some(root);
            e.entries = Some(indexed);
            e.duration_ms = Some(duration_ms);
            e.details = Some(format!("skipped={skipped}"));
            e.ok = Some(skipped == 0);
            e
        }
        ActivityEvent::VerifyCompleted {
            root,
            checked,
            mismatches,
            untracked,
            errors,
            duration_ms,
        } => {
            let clean = mismatches == 0 && untracked == 0 && errors == 0;
            let severity = if clean {
                Severity::Info
            } else {
                Severity::Warning
            };
            let mut e = LogEntry::new(EventType::VerifyComplete, severity);
            e.root = Some(root);
            e.entries = Some(checked);
            e.duration_ms = Some(duration_ms);
            e.details = Some(format!(
                "mismatches={mismatches} untracked={untracked} errors={errors}"
            ));
            e.ok = Some(clean);
            e
        }
        ActivityEvent::ChecksumMismatch {
            root,
            path,
            expected,
            actual,
        } => {
            let mut e = LogEntry::new(EventType::ChecksumMismatch, Severity::Critical);
            e.root = Some(root);
            e.path = Some(path);
            e.expected = Some(expected);
            e.actual = Some(actual);
            e
        }
        ActivityEvent::UntrackedFile { root, path, actual } => {
            let mut e = LogEntry::new(EventType::UntrackedFile, Severity::Warning);
            e.root = Some(root);
            e.path = Some(path);
            e.actual = Some(actual);
            e
        }
        ActivityEvent::TaskFailed {
            root,
            path,
            error_code,
            error_message,
            requeued,
        } => {
            let mut e = LogEntry::new(EventType::TaskFailed, Severity::Warning);
            e.root = Some(root);
            e.path = path;
            e.error_code = Some(error_code);
            e.error_message = Some(error_message);
            e.details = Some(format!("requeued={requeued}"));
            e.ok = Some(false);
            e
        }
        ActivityEvent::Error {
            root,
            code,
            message,
        } => {
            let mut e = LogEntry::new(EventType::Error, Severity::Critical);
            e.root = root;
            e.error_code = Some(code);
            e.error_message = Some(message);
            e.ok = Some(false);
            e
        }
        ActivityEvent::Shutdown => LogEntry::new(EventType::CheckerStop, Severity::Info),
    }
}
