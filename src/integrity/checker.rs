//! Folder integrity checker: keeps the checksum database of one root current
//! from change events and verifies the live tree against it.
//!
//! Mutations triggered by change events run on the task queue's worker,
//! tagged by their path key so a newer event for the same path cancels an
//! older one that has not started yet. Renames are not tagged: they carry
//! stored checksums to the new path and must run even when later events
//! touch either side. A rename absorbs the pending updates it supersedes;
//! the entries those updates covered are marked stale and recomputed once
//! the queue drains. Every applied mutation re-arms the debounced save.
//! Rebuild, verify and `update_file` run on the caller's thread.

#![allow(missing_docs)]

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded, select};
use parking_lot::Mutex;
use serde::Serialize;

use crate::core::config::CheckerConfig;
use crate::core::errors::{FimError, Result};
use crate::core::paths::{key_to_path, relative_key, resolve_absolute_path};
use crate::integrity::checksum::{ChecksumProvider, MismatchKind, Sha512Checksums};
use crate::integrity::database::{IntegrityDatabase, LoadSummary};
use crate::integrity::key::PathKey;
use crate::integrity::walk::walk_files;
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::platform::attributes::{DatabaseAttributes, detect_attributes};
use crate::scheduler::debounce::DebounceScheduler;
use crate::scheduler::task_queue::{FailureHook, PauseGuard, Task, TaskQueue};
use crate::watcher::events::ChangeEvent;
#[cfg(feature = "watch")]
use crate::watcher::events::event_channel;
#[cfg(feature = "watch")]
use crate::watcher::notify_source::NotifySource;

/// One lock per database file, shared by every checker in the process, so a
/// debounced save and an explicit save never write the same file at once.
static SAVE_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn save_lock_for(path: &Path) -> Arc<Mutex<()>> {
    Arc::clone(
        SAVE_LOCKS
            .lock()
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(()))),
    )
}

/// Construction options for a checker.
#[derive(Clone)]
pub struct CheckerOptions {
    pub database_file_name: String,
    pub save_debounce: Duration,
    pub requeue_on_failure: bool,
    pub follow_symlinks: bool,
    pub event_channel_capacity: usize,
    pub provider: Arc<dyn ChecksumProvider>,
    pub attributes: Arc<dyn DatabaseAttributes>,
    pub logger: Option<ActivityLoggerHandle>,
    /// Reported in the start-up log line.
    pub config_hash: Option<String>,
}

impl CheckerOptions {
    pub fn from_config(config: &CheckerConfig) -> Self {
        Self {
            database_file_name: config.database_file_name.clone(),
            save_debounce: config.save_debounce(),
            requeue_on_failure: config.requeue_on_failure,
            follow_symlinks: config.follow_symlinks,
            event_channel_capacity: config.event_channel_capacity,
            provider: Arc::new(Sha512Checksums),
            attributes: detect_attributes(config.seal_database, config.request_compression),
            logger: None,
            config_hash: None,
        }
    }

    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn ChecksumProvider>) -> Self {
        self.provider = provider;
        self
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: Arc<dyn DatabaseAttributes>) -> Self {
        self.attributes = attributes;
        self
    }

    #[must_use]
    pub fn with_logger(mut self, logger: ActivityLoggerHandle) -> Self {
        self.logger = Some(logger);
        self
    }

    #[must_use]
    pub fn with_save_debounce(mut self, delay: Duration) -> Self {
        self.save_debounce = delay;
        self
    }

    #[must_use]
    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = Some(hash.into());
        self
    }
}

impl Default for CheckerOptions {
    fn default() -> Self {
        Self::from_config(&CheckerConfig::default())
    }
}

/// Result of a full rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub indexed: usize,
    /// Files that could not be read.
    pub skipped: usize,
    pub duration_ms: u64,
}

/// A file whose live checksum disagrees with the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub path: PathBuf,
    pub kind: MismatchKind,
    /// `None` for untracked files.
    pub expected: Option<String>,
    pub actual: String,
}

/// A file whose checksum could not be computed during verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyFailure {
    pub path: PathBuf,
    pub expected: Option<String>,
    pub error_code: String,
    pub error_message: String,
}

/// Result of a verification pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    /// Tracked entries examined.
    pub checked: usize,
    pub findings: Vec<Finding>,
    pub failures: Vec<VerifyFailure>,
    pub duration_ms: u64,
}

impl VerifyReport {
    /// Tracked files whose checksum changed.
    pub fn mismatches(&self) -> usize {
        self.findings
            .iter()
            .filter(|f| f.kind != MismatchKind::Untracked)
            .count()
    }

    pub fn untracked(&self) -> usize {
        self.findings
            .iter()
            .filter(|f| f.kind == MismatchKind::Untracked)
            .count()
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty() && self.failures.is_empty()
    }
}

/// Signature of the optional verification error callback.
pub type VerifyErrorCallback<'a> = &'a mut dyn FnMut(&Path, Option<&str>, &FimError);

#[derive(Debug)]
enum Mutation {
    /// Created: a directory is indexed recursively.
    Add(PathBuf),
    /// Changed: a directory is ignored.
    Update(PathBuf),
    Remove(PathBuf),
    /// `stale` lists keys at the destination whose pending updates the
    /// rename cancelled.
    Rename {
        from: PathBuf,
        to: PathBuf,
        stale: Vec<PathKey>,
    },
}

struct Intake {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

struct Shared {
    root: PathBuf,
    root_label: String,
    database_path: PathBuf,
    temp_path: PathBuf,
    database_key: PathKey,
    temp_key: PathKey,
    database: IntegrityDatabase,
    /// Keys to recompute once no mutation is pending.
    stale: Mutex<BTreeSet<PathKey>>,
    enabled: AtomicBool,
    closed: AtomicBool,
    follow_symlinks: bool,
    event_channel_capacity: usize,
    provider: Arc<dyn ChecksumProvider>,
    attributes: Arc<dyn DatabaseAttributes>,
    logger: Option<ActivityLoggerHandle>,
    config_hash: Option<String>,
    queue: TaskQueue<PathKey>,
    saver: DebounceScheduler,
    intake: Mutex<Option<Intake>>,
    #[cfg(feature = "watch")]
    source: Mutex<Option<NotifySource>>,
}

/// Watches one root directory and maintains its checksum database.
pub struct FolderIntegrityChecker {
    shared: Arc<Shared>,
}

impl FolderIntegrityChecker {
    /// Build a checker for `root` with an empty in-memory database.
    ///
    /// The checker starts disabled; change events are ignored until
    /// [`enable`](Self::enable) is called.
    pub fn new(root: &Path, options: CheckerOptions) -> Result<Self> {
        let root = resolve_absolute_path(root);
        let meta = fs::metadata(&root).map_err(|source| FimError::io(&root, source))?;
        if !meta.is_dir() {
            return Err(FimError::io(
                &root,
                std::io::Error::other("watched root is not a directory"),
            ));
        }

        let database_path = root.join(&options.database_file_name);
        let temp_name = format!("{}.tmp", options.database_file_name);
        let temp_path = root.join(&temp_name);
        let root_label = root.display().to_string();

        let queue = TaskQueue::new("fim-queue");
        queue.set_requeue_on_failure(options.requeue_on_failure);
        if let Some(logger) = options.logger.clone() {
            let label = root_label.clone();
            let hook: FailureHook<PathKey> =
                Arc::new(move |tag: Option<&PathKey>, error: &FimError, requeued: bool| {
                    logger.send(ActivityEvent::TaskFailed {
                        root: label.clone(),
                        path: tag.map(ToString::to_string),
                        error_code: error.code().to_string(),
                        error_message: error.to_string(),
                        requeued,
                    });
                });
            queue.set_failure_hook(hook);
        }

        let shared = Arc::new(Shared {
            database_key: PathKey::new(options.database_file_name.as_str()),
            temp_key: PathKey::new(temp_name),
            root,
            root_label,
            database_path,
            temp_path,
            database: IntegrityDatabase::new(),
            stale: Mutex::new(BTreeSet::new()),
            enabled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            follow_symlinks: options.follow_symlinks,
            event_channel_capacity: options.event_channel_capacity,
            provider: options.provider,
            attributes: options.attributes,
            logger: options.logger,
            config_hash: options.config_hash,
            queue,
            saver: DebounceScheduler::new("fim-debounce", options.save_debounce),
            intake: Mutex::new(None),
            #[cfg(feature = "watch")]
            source: Mutex::new(None),
        });

        let weak = Arc::downgrade(&shared);
        shared.saver.start(move || {
            if let Some(shared) = weak.upgrade()
                && let Err(e) = shared.save_database()
            {
                shared.report_error(&e);
            }
        })?;

        Ok(Self { shared })
    }

    /// Build a checker and load its existing database, if any.
    pub fn create(root: &Path, config: &CheckerConfig) -> Result<Self> {
        Self::open(root, CheckerOptions::from_config(config))
    }

    /// [`create`](Self::create) with explicit options.
    pub fn open(root: &Path, options: CheckerOptions) -> Result<Self> {
        let checker = Self::new(root, options)?;
        checker.load_database()?;
        checker.shared.log(ActivityEvent::CheckerStarted {
            root: checker.shared.root_label.clone(),
            entries: checker.len() as u64,
            config_hash: checker
                .shared
                .config_hash
                .clone()
                .unwrap_or_else(|| "-".to_string()),
        });
        Ok(checker)
    }

    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    pub fn database_path(&self) -> &Path {
        &self.shared.database_path
    }

    pub fn database(&self) -> &IntegrityDatabase {
        &self.shared.database
    }

    pub fn len(&self) -> usize {
        self.shared.database.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.database.is_empty()
    }

    /// Absolute paths of every tracked file, parents first.
    pub fn known_files(&self) -> Vec<PathBuf> {
        self.shared
            .database
            .sorted_entries()
            .into_iter()
            .map(|(key, _)| key_to_path(&self.shared.root, key.as_str()))
            .collect()
    }

    /// Stored checksum for `path`, if tracked.
    pub fn checksum_of(&self, path: &Path) -> Option<String> {
        let key = self.shared.key_for(&self.shared.absolute(path))?;
        self.shared.database.get(&key)
    }

    /// Start acting on change events.
    pub fn enable(&self) {
        self.shared.enabled.store(true, Ordering::Release);
    }

    /// Stop acting on change events. Existing state is kept.
    pub fn disable(&self) {
        self.shared.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Whether a debounced save is armed.
    pub fn save_pending(&self) -> bool {
        self.shared.saver.is_pending()
    }

    /// Feed one change event. Ignored while disabled or closed.
    pub fn handle_event(&self, event: ChangeEvent) {
        self.shared.handle_event(event);
    }

    /// Hold queued mutations until the guard drops.
    pub fn pause_mutations(&self) -> PauseGuard<'_, PathKey> {
        self.shared.queue.pause()
    }

    /// Number of mutations waiting to run.
    pub fn pending_mutations(&self) -> usize {
        self.shared.queue.len()
    }

    /// Block until queued mutations have been applied. False on timeout.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        self.shared.queue.wait_idle(timeout)
    }

    /// Consume events from `events` on a dedicated intake thread, replacing
    /// any previously attached stream.
    pub fn attach_events(&self, events: Receiver<ChangeEvent>) -> Result<()> {
        if self.is_closed() {
            return Err(FimError::ChannelClosed {
                component: "checker",
            });
        }
        self.shared.stop_intake();

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let weak = Arc::downgrade(&self.shared);
        let handle = thread::Builder::new()
            .name("fim-intake".to_string())
            .spawn(move || intake_loop(&events, &stop_rx, &weak))
            .map_err(|e| FimError::Runtime {
                details: format!("failed to spawn intake thread: {e}"),
            })?;
        *self.shared.intake.lock() = Some(Intake {
            stop: stop_tx,
            handle,
        });
        Ok(())
    }

    /// Start a recursive filesystem watcher on the root and route its events
    /// through the intake thread.
    #[cfg(feature = "watch")]
    pub fn watch(&self) -> Result<()> {
        let (tx, rx) = event_channel(self.shared.event_channel_capacity);
        let source = NotifySource::start(&self.shared.root, tx)?;
        self.attach_events(rx)?;
        *self.shared.source.lock() = Some(source);
        Ok(())
    }

    /// Recompute one file now. Paths outside the root are rejected; a missing
    /// file is removed; read errors are logged and otherwise ignored.
    pub fn update_file(&self, path: &Path) -> Result<()> {
        let path = self.shared.absolute(path);
        let Some(key) = self.shared.key_for(&path) else {
            return Err(self.shared.no_key_error(path));
        };
        if self.shared.is_database_key(&key) {
            return Ok(());
        }
        if let Err(e) = self.shared.add_or_update(&path, key, false) {
            self.shared.report_error(&e);
        }
        Ok(())
    }

    /// Clear the database and re-index every file under the root.
    pub fn rebuild_database(&self) -> RebuildReport {
        self.shared.rebuild()
    }

    /// Write the database file now.
    pub fn save_database(&self) -> Result<usize> {
        self.shared.save_database()
    }

    /// Replace the in-memory database with the file's contents. A missing
    /// file leaves the database empty.
    pub fn load_database(&self) -> Result<LoadSummary> {
        self.shared.load_database()
    }

    /// Recompute every tracked checksum and report changes, then report every
    /// untracked file on disk.
    ///
    /// `on_mismatch(path, expected, actual)` gets `expected = None` for
    /// untracked files. `on_error(path, expected, error)` gets checksum
    /// failures; without it they are only recorded in the report.
    pub fn verify_integrity<M>(
        &self,
        on_mismatch: M,
        on_error: Option<VerifyErrorCallback<'_>>,
    ) -> VerifyReport
    where
        M: FnMut(&Path, Option<&str>, &str),
    {
        self.shared.verify(on_mismatch, on_error)
    }

    /// Stop event handling, drop pending mutations, and write the database
    /// one last time. Only the first call does anything.
    pub fn close(&self) -> Result<()> {
        let shared = &self.shared;
        if shared
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        shared.enabled.store(false, Ordering::Release);
        #[cfg(feature = "watch")]
        drop(shared.source.lock().take());
        shared.stop_intake();
        shared.queue.close();
        shared.saver.shutdown();

        let saved = shared.save_database();
        if let Err(e) = &saved {
            shared.report_error(e);
        }
        shared.log(ActivityEvent::CheckerStopped {
            root: shared.root_label.clone(),
            entries: shared.database.len() as u64,
        });
        saved.map(|_| ())
    }
}

impl Drop for FolderIntegrityChecker {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for FolderIntegrityChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderIntegrityChecker")
            .field("root", &self.shared.root)
            .field("entries", &self.len())
            .field("enabled", &self.is_enabled())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn intake_loop(events: &Receiver<ChangeEvent>, stop: &Receiver<()>, shared: &Weak<Shared>) {
    loop {
        select! {
            recv(stop) -> _ => return,
            recv(events) -> message => {
                let Ok(event) = message else { return };
                let Some(shared) = shared.upgrade() else { return };
                shared.handle_event(event);
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

impl Shared {
    fn log(&self, event: ActivityEvent) {
        if let Some(logger) = &self.logger {
            logger.send(event);
        }
    }

    fn report_error(&self, error: &FimError) {
        self.log(ActivityEvent::error(Some(self.root_label.clone()), error));
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    fn key_for(&self, path: &Path) -> Option<PathKey> {
        relative_key(&self.root, path).map(PathKey::new)
    }

    /// Why `path` has no key: outside the root, or a name that is not UTF-8.
    fn no_key_error(&self, path: PathBuf) -> FimError {
        if path.starts_with(&self.root) && path != self.root {
            FimError::UnrepresentablePath { path }
        } else {
            FimError::OutsideRoot {
                path,
                root: self.root.clone(),
            }
        }
    }

    fn is_database_key(&self, key: &PathKey) -> bool {
        *key == self.database_key || *key == self.temp_key
    }

    /// Key for an event path, or `None` when the path is outside the root or
    /// is the database file itself.
    fn tracked_key(&self, path: &Path) -> Option<PathKey> {
        self.key_for(path).filter(|key| !self.is_database_key(key))
    }

    fn stop_intake(&self) {
        let intake = self.intake.lock().take();
        if let Some(intake) = intake {
            let _ = intake.stop.send(());
            if intake.handle.thread().id() != thread::current().id() {
                let _ = intake.handle.join();
            }
        }
    }

    fn handle_event(self: &Arc<Self>, event: ChangeEvent) {
        if !self.enabled.load(Ordering::Acquire) || self.closed.load(Ordering::Acquire) {
            return;
        }

        match event {
            ChangeEvent::Created(path) => {
                if let Some(key) = self.tracked_key(&path) {
                    self.submit(key, Mutation::Add(path));
                }
            }
            ChangeEvent::Changed(path) => {
                if let Some(key) = self.tracked_key(&path) {
                    self.submit(key, Mutation::Update(path));
                }
            }
            ChangeEvent::Deleted(path) => {
                if let Some(key) = self.tracked_key(&path) {
                    self.submit(key, Mutation::Remove(path));
                }
            }
            ChangeEvent::Renamed { from, to } => {
                match (self.tracked_key(&from), self.tracked_key(&to)) {
                    (Some(old), Some(new)) => self.submit_rename(&old, &new, from, to),
                    // Moved in from outside, or the database's temp file
                    // being renamed over the database.
                    (None, Some(new)) => self.submit(new, Mutation::Add(to)),
                    (Some(old), None) => self.submit(old, Mutation::Remove(from)),
                    (None, None) => {}
                }
            }
        }
    }

    /// Cancel queued work tagged `key`, then queue the mutation under it.
    fn submit(self: &Arc<Self>, key: PathKey, mutation: Mutation) {
        self.queue.dequeue_by_tag(&key);
        self.enqueue(Some(key), mutation);
    }

    /// Cancel queued updates on either side of a rename and queue the rename
    /// untagged. Cancelled updates under `old` ran against content that now
    /// lives under `new`, so their keys travel with the rename as stale.
    fn submit_rename(
        self: &Arc<Self>,
        old: &PathKey,
        new: &PathKey,
        from: PathBuf,
        to: PathBuf,
    ) {
        let cancelled = self
            .queue
            .dequeue_where(|tag| tag.is_within(old) || tag.is_within(new));
        let stale = cancelled
            .iter()
            .filter_map(|tag| tag.rebase(old, new))
            .collect();
        self.enqueue(None, Mutation::Rename { from, to, stale });
    }

    fn enqueue(self: &Arc<Self>, tag: Option<PathKey>, mutation: Mutation) {
        let weak = Arc::downgrade(self);
        let task: Task = Box::new(move || match weak.upgrade() {
            Some(shared) => {
                let result = shared.apply(&mutation);
                if shared.queue.is_empty() {
                    shared.rehash_stale();
                }
                result
            }
            None => Ok(()),
        });
        if let Err(e) = self.queue.enqueue(task, tag) {
            self.report_error(&e);
        }
    }

    fn apply(&self, mutation: &Mutation) -> Result<()> {
        match mutation {
            Mutation::Add(path) | Mutation::Update(path) => {
                let Some(key) = self.tracked_key(path) else {
                    return Ok(());
                };
                self.add_or_update(path, key, matches!(mutation, Mutation::Add(_)))
            }
            Mutation::Remove(path) => {
                if let Some(key) = self.tracked_key(path) {
                    self.remove(&key);
                }
                Ok(())
            }
            Mutation::Rename { from, to, stale } => {
                if let (Some(old), Some(new)) = (self.tracked_key(from), self.tracked_key(to)) {
                    self.rename(&old, new, stale);
                }
                Ok(())
            }
        }
    }

    /// Recompute `path` and store it under `key`. A vanished path becomes a
    /// removal. Directories are indexed recursively when `index_dirs` is set
    /// and ignored otherwise.
    fn add_or_update(&self, path: &Path, key: PathKey, index_dirs: bool) -> Result<()> {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.remove(&key);
                return Ok(());
            }
            Err(source) => return Err(FimError::io(path, source)),
        };

        if meta.is_dir() {
            if index_dirs {
                self.forget_stale(&key);
                self.index_tree(path);
            }
            return Ok(());
        }

        match self.provider.checksum(path) {
            Ok(checksum) => {
                self.forget_stale(&key);
                self.log(ActivityEvent::EntryUpdated {
                    root: self.root_label.clone(),
                    path: key.to_string(),
                    checksum: checksum.clone(),
                });
                self.database.upsert(key, checksum);
                self.saver.schedule();
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                self.remove(&key);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn remove(&self, key: &PathKey) {
        self.forget_stale(key);
        let removed = self.database.remove_tree(key);
        if removed > 0 {
            self.log(ActivityEvent::EntryRemoved {
                root: self.root_label.clone(),
                path: key.to_string(),
                removed: removed as u64,
            });
        }
        self.saver.schedule();
    }

    /// Move stored checksums from `old` to `new`. Stale marks under `old`
    /// move with them. Nothing stored under `old` means the destination is
    /// recomputed once the queue drains.
    fn rename(&self, old: &PathKey, new: PathKey, carried: &[PathKey]) {
        let moved = self.database.rename_tree(old, &new);
        let rehashed = moved == 0 || !carried.is_empty();
        {
            let mut stale = self.stale.lock();
            let moving: Vec<PathKey> = stale
                .iter()
                .filter_map(|key| key.rebase(old, &new))
                .collect();
            stale.retain(|key| !key.is_within(old) && !key.is_within(&new));
            stale.extend(moving);
            stale.extend(carried.iter().cloned());
            if moved == 0 {
                stale.insert(new.clone());
            }
        }
        self.log(ActivityEvent::EntryRenamed {
            root: self.root_label.clone(),
            from: old.to_string(),
            to: new.to_string(),
            rehashed,
        });
        self.saver.schedule();
    }

    fn forget_stale(&self, key: &PathKey) {
        let mut stale = self.stale.lock();
        if !stale.is_empty() {
            stale.retain(|stale_key| !stale_key.is_within(key));
        }
    }

    /// Recompute every stale key, parents first. Runs on the worker once the
    /// queue is empty, so all earlier renames have landed.
    fn rehash_stale(&self) {
        let stale = std::mem::take(&mut *self.stale.lock());
        for key in stale {
            let path = key_to_path(&self.root, key.as_str());
            if let Err(e) = self.add_or_update(&path, key, true) {
                self.report_error(&e);
            }
        }
    }

    /// Hash every file below `dir` into the database. Unreadable files are
    /// skipped. Returns `(indexed, skipped)`.
    fn index_tree(&self, dir: &Path) -> (usize, usize) {
        let mut indexed = 0;
        let mut skipped = 0;
        walk_files(dir, self.follow_symlinks, |file| {
            let Some(key) = self.key_for(file) else {
                skipped += 1;
                self.report_error(&self.no_key_error(file.to_path_buf()));
                return;
            };
            if self.is_database_key(&key) {
                return;
            }
            match self.provider.checksum(file) {
                Ok(checksum) => {
                    self.database.upsert(key, checksum);
                    indexed += 1;
                }
                Err(_) => skipped += 1,
            }
        });
        if indexed > 0 {
            self.saver.schedule();
        }
        (indexed, skipped)
    }

    fn rebuild(&self) -> RebuildReport {
        let started = Instant::now();
        let _pause = self.queue.pause();
        self.database.clear();
        self.stale.lock().clear();
        let (indexed, skipped) = self.index_tree(&self.root);
        self.saver.schedule();

        let report = RebuildReport {
            indexed,
            skipped,
            duration_ms: elapsed_ms(started),
        };
        self.log(ActivityEvent::RebuildCompleted {
            root: self.root_label.clone(),
            indexed: indexed as u64,
            skipped: skipped as u64,
            duration_ms: report.duration_ms,
        });
        report
    }

    fn save_database(&self) -> Result<usize> {
        let lock = save_lock_for(&self.database_path);
        let _guard = lock.lock();
        let started = Instant::now();

        if let Err(e) = self.attributes.unseal(&self.database_path) {
            self.report_error(&e);
        }
        let written = self.write_database();
        if let Err(e) = self.attributes.seal(&self.database_path) {
            self.report_error(&e);
        }
        let count = written?;
        if let Err(e) = self.attributes.try_enable_compression(&self.database_path) {
            self.report_error(&e);
        }

        self.log(ActivityEvent::DatabaseSaved {
            root: self.root_label.clone(),
            entries: count as u64,
            duration_ms: elapsed_ms(started),
        });
        Ok(count)
    }

    /// Write to the temp sibling, then rename over the database file.
    fn write_database(&self) -> Result<usize> {
        let result = (|| {
            let file = File::create(&self.temp_path)
                .map_err(|source| FimError::io(&self.temp_path, source))?;
            let mut writer = BufWriter::new(file);
            let count = self
                .database
                .write_to(&mut writer)
                .map_err(|source| FimError::io(&self.temp_path, source))?;
            let file = writer
                .into_inner()
                .map_err(|e| FimError::io(&self.temp_path, e.into_error()))?;
            file.sync_all()
                .map_err(|source| FimError::io(&self.temp_path, source))?;
            fs::rename(&self.temp_path, &self.database_path)
                .map_err(|source| FimError::io(&self.database_path, source))?;
            Ok(count)
        })();
        if result.is_err() {
            let _ = fs::remove_file(&self.temp_path);
        }
        result
    }

    fn load_database(&self) -> Result<LoadSummary> {
        let lock = save_lock_for(&self.database_path);
        let _guard = lock.lock();

        let file = match File::open(&self.database_path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.database.clear();
                return Ok(LoadSummary::default());
            }
            Err(source) => return Err(FimError::io(&self.database_path, source)),
        };
        let summary = self
            .database
            .read_from(BufReader::new(file))
            .map_err(|source| FimError::io(&self.database_path, source))?;
        self.log(ActivityEvent::DatabaseLoaded {
            root: self.root_label.clone(),
            entries: summary.loaded as u64,
        });
        Ok(summary)
    }

    fn verify<M>(&self, mut on_mismatch: M, mut on_error: Option<VerifyErrorCallback<'_>>) -> VerifyReport
    where
        M: FnMut(&Path, Option<&str>, &str),
    {
        let started = Instant::now();
        let mut report = VerifyReport::default();

        for (key, expected) in self.database.sorted_entries() {
            let path = key_to_path(&self.root, key.as_str());
            report.checked += 1;
            match self.provider.checksum(&path) {
                Ok(actual) if actual == expected => {}
                Ok(actual) => {
                    on_mismatch(&path, Some(&expected), &actual);
                    self.log(ActivityEvent::ChecksumMismatch {
                        root: self.root_label.clone(),
                        path: key.to_string(),
                        expected: expected.clone(),
                        actual: actual.clone(),
                    });
                    report.findings.push(Finding {
                        kind: MismatchKind::classify(Some(&expected), &actual),
                        path,
                        expected: Some(expected),
                        actual,
                    });
                }
                Err(e) => {
                    if let Some(cb) = on_error.as_mut() {
                        cb(&path, Some(&expected), &e);
                    }
                    report.failures.push(VerifyFailure {
                        path,
                        expected: Some(expected),
                        error_code: e.code().to_string(),
                        error_message: e.to_string(),
                    });
                }
            }
        }

        walk_files(&self.root, self.follow_symlinks, |path| {
            let Some(key) = self.key_for(path) else {
                let e = self.no_key_error(path.to_path_buf());
                if let Some(cb) = on_error.as_mut() {
                    cb(path, None, &e);
                }
                report.failures.push(VerifyFailure {
                    path: path.to_path_buf(),
                    expected: None,
                    error_code: e.code().to_string(),
                    error_message: e.to_string(),
                });
                return;
            };
            if self.is_database_key(&key) || self.database.contains(&key) {
                return;
            }
            match self.provider.checksum(path) {
                Ok(actual) => {
                    on_mismatch(path, None, &actual);
                    self.log(ActivityEvent::UntrackedFile {
                        root: self.root_label.clone(),
                        path: key.to_string(),
                        actual: actual.clone(),
                    });
                    report.findings.push(Finding {
                        path: path.to_path_buf(),
                        kind: MismatchKind::Untracked,
                        expected: None,
                        actual,
                    });
                }
                Err(e) => {
                    if let Some(cb) = on_error.as_mut() {
                        cb(path, None, &e);
                    }
                    report.failures.push(VerifyFailure {
                        path: path.to_path_buf(),
                        expected: None,
                        error_code: e.code().to_string(),
                        error_message: e.to_string(),
                    });
                }
            }
        });

        report.duration_ms = elapsed_ms(started);
        self.log(ActivityEvent::VerifyCompleted {
            root: self.root_label.clone(),
            checked: report.checked as u64,
            mismatches: report.mismatches() as u64,
            untracked: report.untracked() as u64,
            errors: report.failures.len() as u64,
            duration_ms: report.duration_ms,
        });
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::checksum::checksum_bytes;
    use crate::platform::attributes::NoopAttributes;

    const WAIT: Duration = Duration::from_secs(5);

    fn options() -> CheckerOptions {
        CheckerOptions::default()
            .with_attributes(Arc::new(NoopAttributes))
            .with_save_debounce(Duration::from_millis(50))
    }

    fn checker(dir: &Path) -> FolderIntegrityChecker {
        let c = FolderIntegrityChecker::new(dir, options()).unwrap();
        c.enable();
        c
    }

    /// Debounced saves never fire during the test.
    fn quiet_checker(dir: &Path) -> FolderIntegrityChecker {
        let c = FolderIntegrityChecker::new(
            dir,
            options().with_save_debounce(Duration::from_secs(3600)),
        )
        .unwrap();
        c.enable();
        c
    }

    #[test]
    fn rejects_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let err = FolderIntegrityChecker::new(&dir.path().join("absent"), options()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn created_event_adds_entry() {
        let dir = tempfile::tempdir().unwrap();
        let c = quiet_checker(dir.path());
        let file = c.root().join("a.txt");
        fs::write(&file, b"hello").unwrap();

        c.handle_event(ChangeEvent::Created(file.clone()));
        assert!(c.wait_for_idle(WAIT));
        assert_eq!(c.checksum_of(&file), Some(checksum_bytes(b"hello")));
        assert!(c.save_pending());
    }

    #[test]
    fn disabled_checker_ignores_events() {
        let dir = tempfile::tempdir().unwrap();
        let c = checker(dir.path());
        c.disable();
        let file = c.root().join("a.txt");
        fs::write(&file, b"hello").unwrap();
        c.handle_event(ChangeEvent::Created(file));
        assert!(c.wait_for_idle(WAIT));
        assert!(c.is_empty());
    }

    #[test]
    fn database_file_events_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let c = checker(dir.path());
        c.save_database().unwrap();
        let db = c.database_path().to_path_buf();
        c.handle_event(ChangeEvent::Changed(db.clone()));
        c.handle_event(ChangeEvent::Created(c.root().join("checksum.db.tmp")));
        c.handle_event(ChangeEvent::Renamed {
            from: c.root().join("checksum.db.tmp"),
            to: db,
        });
        assert!(c.wait_for_idle(WAIT));
        assert!(c.is_empty());
    }

    #[test]
    fn deleted_directory_removes_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let c = checker(dir.path());
        fs::create_dir_all(c.root().join("sub/inner")).unwrap();
        fs::write(c.root().join("sub/a.txt"), b"a").unwrap();
        fs::write(c.root().join("sub/inner/b.txt"), b"b").unwrap();
        fs::write(c.root().join("keep.txt"), b"k").unwrap();
        assert_eq!(c.rebuild_database().indexed, 3);

        fs::remove_dir_all(c.root().join("sub")).unwrap();
        c.handle_event(ChangeEvent::Deleted(c.root().join("sub")));
        assert!(c.wait_for_idle(WAIT));
        assert_eq!(c.known_files(), vec![c.root().join("keep.txt")]);
    }

    #[test]
    fn created_directory_is_indexed() {
        let dir = tempfile::tempdir().unwrap();
        let c = checker(dir.path());
        fs::create_dir_all(c.root().join("moved/in")).unwrap();
        fs::write(c.root().join("moved/in/x.txt"), b"x").unwrap();

        c.handle_event(ChangeEvent::Created(c.root().join("moved")));
        assert!(c.wait_for_idle(WAIT));
        assert_eq!(c.known_files(), vec![c.root().join("moved/in/x.txt")]);
    }

    #[test]
    fn directory_rename_carries_pending_update_beneath_it() {
        let dir = tempfile::tempdir().unwrap();
        let c = quiet_checker(dir.path());
        fs::create_dir_all(c.root().join("docs")).unwrap();
        fs::write(c.root().join("docs/a.txt"), b"one").unwrap();
        fs::write(c.root().join("docs/b.txt"), b"two").unwrap();
        assert_eq!(c.rebuild_database().indexed, 2);

        {
            let _paused = c.pause_mutations();
            fs::write(c.root().join("docs/a.txt"), b"one, edited").unwrap();
            c.handle_event(ChangeEvent::Changed(c.root().join("docs/a.txt")));
            fs::rename(c.root().join("docs"), c.root().join("archive")).unwrap();
            c.handle_event(ChangeEvent::Renamed {
                from: c.root().join("docs"),
                to: c.root().join("archive"),
            });
            assert_eq!(c.pending_mutations(), 1);
        }

        assert!(c.wait_for_idle(WAIT));
        assert_eq!(
            c.checksum_of(&c.root().join("archive/a.txt")),
            Some(checksum_bytes(b"one, edited"))
        );
        assert_eq!(
            c.checksum_of(&c.root().join("archive/b.txt")),
            Some(checksum_bytes(b"two"))
        );
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn vanished_file_becomes_removal() {
        let dir = tempfile::tempdir().unwrap();
        let c = checker(dir.path());
        let file = c.root().join("blip.txt");
        fs::write(&file, b"1").unwrap();
        c.update_file(&file).unwrap();
        assert_eq!(c.len(), 1);

        fs::remove_file(&file).unwrap();
        c.handle_event(ChangeEvent::Changed(file));
        assert!(c.wait_for_idle(WAIT));
        assert!(c.is_empty());
    }

    #[test]
    fn update_file_rejects_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let c = checker(dir.path());
        let err = c.update_file(&other.path().join("x.txt")).unwrap_err();
        assert_eq!(err.code(), "FIM-2001");
        let err = c.update_file(Path::new("../escape.txt")).unwrap_err();
        assert_eq!(err.code(), "FIM-2001");
    }

    #[test]
    fn update_file_accepts_root_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let c = checker(dir.path());
        fs::write(c.root().join("rel.txt"), b"rel").unwrap();
        c.update_file(Path::new("rel.txt")).unwrap();
        assert_eq!(c.checksum_of(Path::new("REL.TXT")), Some(checksum_bytes(b"rel")));
    }

    #[test]
    fn save_writes_sorted_lines_and_load_restores() {
        let dir = tempfile::tempdir().unwrap();
        let c = quiet_checker(dir.path());
        fs::create_dir(c.root().join("d")).unwrap();
        fs::write(c.root().join("d/inner.txt"), b"inner").unwrap();
        fs::write(c.root().join("top.txt"), b"top").unwrap();
        c.rebuild_database();
        assert_eq!(c.save_database().unwrap(), 2);

        let text = fs::read_to_string(c.database_path()).unwrap();
        let expected = format!(
            "{} => top.txt\n{} => d/inner.txt\n",
            checksum_bytes(b"top"),
            checksum_bytes(b"inner")
        );
        assert_eq!(text, expected);
        assert!(!c.root().join("checksum.db.tmp").exists());

        c.database().clear();
        let summary = c.load_database().unwrap();
        assert_eq!(summary.loaded, 2);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn load_without_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let c = quiet_checker(dir.path());
        c.database().upsert(PathKey::new("stale"), "1:A".to_string());
        assert_eq!(c.load_database().unwrap(), LoadSummary::default());
        assert!(c.is_empty());
    }

    #[test]
    fn close_is_idempotent_and_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let c = quiet_checker(dir.path());
        fs::write(c.root().join("a.txt"), b"a").unwrap();
        c.update_file(&c.root().join("a.txt")).unwrap();
        assert!(!c.database_path().exists());

        c.close().unwrap();
        c.close().unwrap();
        assert!(c.is_closed());
        assert!(!c.is_enabled());
        let text = fs::read_to_string(c.database_path()).unwrap();
        assert!(text.ends_with("=> a.txt\n"));
    }

    #[test]
    fn debounced_save_eventually_writes() {
        let dir = tempfile::tempdir().unwrap();
        let c = checker(dir.path());
        fs::write(c.root().join("a.txt"), b"a").unwrap();
        c.handle_event(ChangeEvent::Created(c.root().join("a.txt")));
        assert!(c.wait_for_idle(WAIT));

        let deadline = Instant::now() + WAIT;
        while !c.database_path().exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(c.database_path().exists());
        assert!(!c.save_pending());
    }
}
