//! Signal handling: SIGTERM/SIGINT graceful shutdown, SIGHUP immediate
//! database save, SIGUSR1 immediate verification.
//!
//! Uses the `signal-hook` crate for safe signal registration. The supervisor
//! polls `SignalHandler` flags each tick rather than blocking on signals.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGINT, SIGTERM};

/// Signal state shared between the OS hooks and the supervisor loop.
///
/// Flags use `Ordering::Relaxed`; the loop polls them every tick.
#[derive(Clone)]
pub struct SignalHandler {
    shutdown_flag: Arc<AtomicBool>,
    save_flag: Arc<AtomicBool>,
    verify_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Create a handler and register OS signal hooks.
    ///
    /// Registration is best-effort; failures are reported on stderr.
    pub fn new() -> Self {
        let handler = Self::detached();
        handler.register_signals();
        handler
    }

    /// Handler with no OS hooks, driven only by the `request_*` methods.
    pub fn detached() -> Self {
        Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            save_flag: Arc::new(AtomicBool::new(false)),
            verify_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Check (and clear) whether an immediate save was requested.
    pub fn should_save(&self) -> bool {
        self.save_flag.swap(false, Ordering::Relaxed)
    }

    /// Check (and clear) whether an immediate verification was requested.
    pub fn should_verify(&self) -> bool {
        self.verify_flag.swap(false, Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }

    pub fn request_save(&self) {
        self.save_flag.store(true, Ordering::Relaxed);
    }

    pub fn request_verify(&self) {
        self.verify_flag.store(true, Ordering::Relaxed);
    }

    fn register_signals(&self) {
        if let Err(e) = signal_hook::flag::register(SIGTERM, Arc::clone(&self.shutdown_flag)) {
            eprintln!("[FIM-SIGNAL] failed to register SIGTERM: {e}");
        }
        if let Err(e) = signal_hook::flag::register(SIGINT, Arc::clone(&self.shutdown_flag)) {
            eprintln!("[FIM-SIGNAL] failed to register SIGINT: {e}");
        }

        #[cfg(unix)]
        {
            use signal_hook::consts::{SIGHUP, SIGUSR1};
            if let Err(e) = signal_hook::flag::register(SIGHUP, Arc::clone(&self.save_flag)) {
                eprintln!("[FIM-SIGNAL] failed to register SIGHUP: {e}");
            }
            if let Err(e) = signal_hook::flag::register(SIGUSR1, Arc::clone(&self.verify_flag)) {
                eprintln!("[FIM-SIGNAL] failed to register SIGUSR1: {e}");
            }
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_handler_starts_clear() {
        let handler = SignalHandler::detached();
        assert!(!handler.should_shutdown());
        assert!(!handler.should_save());
        assert!(!handler.should_verify());
    }

    #[test]
    fn shutdown_is_sticky() {
        let handler = SignalHandler::detached();
        handler.request_shutdown();
        assert!(handler.should_shutdown());
        assert!(handler.should_shutdown());
    }

    #[test]
    fn save_and_verify_clear_on_read() {
        let handler = SignalHandler::detached();
        handler.request_save();
        handler.request_verify();
        assert!(handler.should_save());
        assert!(!handler.should_save());
        assert!(handler.should_verify());
        assert!(!handler.should_verify());
    }

    #[test]
    fn clones_share_state() {
        let handler = SignalHandler::detached();
        let other = handler.clone();
        handler.request_shutdown();
        assert!(other.should_shutdown());
    }
}
