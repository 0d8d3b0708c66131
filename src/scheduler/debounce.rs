//! Single deferred trigger: fires once, `delay` after the last `schedule()`.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;

use crate::core::errors::{FimError, Result};

enum TimerMessage {
    Schedule(Instant),
    Shutdown,
}

/// Debounced action runner backed by one timer thread.
///
/// Each `schedule()` replaces the pending deadline, so a burst of calls
/// produces one run after the burst goes quiet.
pub struct DebounceScheduler {
    delay: Duration,
    tx: Sender<TimerMessage>,
    rx: Mutex<Option<Receiver<TimerMessage>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<AtomicBool>,
    name: String,
}

impl DebounceScheduler {
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        let (tx, rx) = unbounded();
        Self {
            delay,
            tx,
            rx: Mutex::new(Some(rx)),
            handle: Mutex::new(None),
            pending: Arc::new(AtomicBool::new(false)),
            name: name.into(),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Spawn the timer thread that runs `action`. Only the first call has an
    /// effect.
    pub fn start<F>(&self, action: F) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        let Some(rx) = self.rx.lock().take() else {
            return Ok(());
        };
        let pending = Arc::clone(&self.pending);
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || timer_loop(&rx, &pending, action))
            .map_err(|e| FimError::Runtime {
                details: format!("failed to spawn debounce timer: {e}"),
            })?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// (Re)arm the timer for `now + delay`.
    pub fn schedule(&self) {
        self.pending.store(true, Ordering::Release);
        if self
            .tx
            .send(TimerMessage::Schedule(Instant::now() + self.delay))
            .is_err()
        {
            self.pending.store(false, Ordering::Release);
        }
    }

    /// Whether a fire is armed and has not run yet.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Stop the timer thread, discarding any pending fire. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.tx.send(TimerMessage::Shutdown);
        self.pending.store(false, Ordering::Release);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for DebounceScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DebounceScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebounceScheduler")
            .field("name", &self.name)
            .field("delay", &self.delay)
            .field("pending", &self.is_pending())
            .finish_non_exhaustive()
    }
}

fn timer_loop<F: FnMut()>(rx: &Receiver<TimerMessage>, pending: &AtomicBool, mut action: F) {
    let mut deadline: Option<Instant> = None;
    loop {
        let message = match deadline {
            Some(at) => rx.recv_deadline(at),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match message {
            Ok(TimerMessage::Schedule(at)) => deadline = Some(at),
            Ok(TimerMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {
                deadline = None;
                pending.store(false, Ordering::Release);
                action();
            }
        }
    }
}
