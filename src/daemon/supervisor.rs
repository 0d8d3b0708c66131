//! Supervisor for `fim watch`: one checker per configured root, a poll loop
//! reacting to signals, periodic verification, and a clean shutdown that
//! lets every checker write its database one last time.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::core::config::Config;
use crate::core::errors::{FimError, Result};
use crate::daemon::signals::SignalHandler;
use crate::integrity::checker::{CheckerOptions, FolderIntegrityChecker, VerifyReport};
use crate::logger::activity::{
    ActivityEvent, ActivityLoggerConfig, ActivityLoggerHandle, spawn_logger,
};
use crate::logger::jsonl::JsonlConfig;

/// Owns the checkers and the activity logger for a watch session.
pub struct Supervisor {
    config: Config,
    logger_handle: ActivityLoggerHandle,
    logger_join: Option<JoinHandle<()>>,
    signal_handler: SignalHandler,
    checkers: Vec<FolderIntegrityChecker>,
    start_time: Instant,
    last_verify: Instant,
}

impl Supervisor {
    /// Start the logger, open a checker for every root, bring missing
    /// databases up to date, then enable and watch each root.
    pub fn init(config: Config, signal_handler: SignalHandler) -> Result<Self> {
        if config.daemon.roots.is_empty() {
            return Err(FimError::InvalidConfig {
                details: "daemon.roots must name at least one directory".to_string(),
            });
        }

        let logger_config =
            ActivityLoggerConfig::new(JsonlConfig::for_path(&config.paths.activity_log));
        let (logger_handle, logger_join) = spawn_logger(logger_config)?;
        let config_hash = config.stable_hash().unwrap_or_default();

        let mut supervisor = Self {
            config,
            logger_handle,
            logger_join: Some(logger_join),
            signal_handler,
            checkers: Vec::new(),
            start_time: Instant::now(),
            last_verify: Instant::now(),
        };

        let roots = supervisor.config.daemon.roots.clone();
        for root in &roots {
            match supervisor.open_root(root, &config_hash) {
                Ok(checker) => supervisor.checkers.push(checker),
                Err(e) => {
                    supervisor.stop();
                    return Err(e);
                }
            }
        }
        Ok(supervisor)
    }

    fn open_root(&self, root: &Path, config_hash: &str) -> Result<FolderIntegrityChecker> {
        let options = CheckerOptions::from_config(&self.config.checker)
            .with_logger(self.logger_handle.clone())
            .with_config_hash(config_hash);
        let checker = FolderIntegrityChecker::open(root, options)?;

        if self.config.daemon.rebuild_missing_database && !checker.database_path().exists() {
            let report = checker.rebuild_database();
            checker.save_database()?;
            eprintln!(
                "[FIM-DAEMON] built database for {} ({} files, {} skipped)",
                checker.root().display(),
                report.indexed,
                report.skipped
            );
        }

        checker.enable();
        checker.watch()?;
        eprintln!(
            "[FIM-DAEMON] watching {} ({} entries)",
            checker.root().display(),
            checker.len()
        );
        Ok(checker)
    }

    pub fn checkers(&self) -> &[FolderIntegrityChecker] {
        &self.checkers
    }

    pub fn logger(&self) -> &ActivityLoggerHandle {
        &self.logger_handle
    }

    /// Poll signals until shutdown is requested, then close every checker.
    pub fn run(&mut self) -> Result<()> {
        let tick = Duration::from_millis(self.config.daemon.poll_interval_ms.max(1));
        let verify_every = match self.config.daemon.verify_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        loop {
            if self.signal_handler.should_shutdown() {
                eprintln!("[FIM-DAEMON] shutdown requested");
                break;
            }

            if self.signal_handler.should_save() {
                self.save_all();
            }

            let verify_due = verify_every.is_some_and(|every| self.last_verify.elapsed() >= every);
            if self.signal_handler.should_verify() || verify_due {
                self.verify_all();
            }

            thread::sleep(tick);
        }

        self.stop();
        Ok(())
    }

    /// Write every database now.
    pub fn save_all(&self) {
        for checker in &self.checkers {
            match checker.save_database() {
                Ok(entries) => eprintln!(
                    "[FIM-DAEMON] saved {} ({entries} entries)",
                    checker.database_path().display()
                ),
                Err(e) => eprintln!("[FIM-DAEMON] save failed: {e}"),
            }
        }
    }

    /// Verify every root and report findings on stderr.
    pub fn verify_all(&mut self) -> Vec<(PathBuf, VerifyReport)> {
        self.last_verify = Instant::now();
        self.checkers
            .iter()
            .map(|checker| {
                let report = checker.verify_integrity(
                    |path, expected, actual| match expected {
                        Some(expected) => eprintln!(
                            "[FIM-DAEMON] MISMATCH {} expected={expected} actual={actual}",
                            path.display()
                        ),
                        None => eprintln!("[FIM-DAEMON] UNTRACKED {} actual={actual}", path.display()),
                    },
                    None,
                );
                eprintln!(
                    "[FIM-DAEMON] verified {}: checked={} mismatches={} untracked={} errors={}",
                    checker.root().display(),
                    report.checked,
                    report.mismatches(),
                    report.untracked(),
                    report.failures.len()
                );
                (checker.root().to_path_buf(), report)
            })
            .collect()
    }

    /// Close every checker and stop the logger. Idempotent.
    fn stop(&mut self) {
        for checker in self.checkers.drain(..) {
            if let Err(e) = checker.close() {
                self.logger_handle
                    .send(ActivityEvent::error(Some(checker.root().display().to_string()), &e));
                eprintln!("[FIM-DAEMON] final save failed for {}: {e}", checker.root().display());
            }
        }

        if let Some(join) = self.logger_join.take() {
            self.logger_handle.shutdown();
            let _ = join.join();
            eprintln!(
                "[FIM-DAEMON] shutdown complete (uptime={}s)",
                self.start_time.elapsed().as_secs()
            );
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}
