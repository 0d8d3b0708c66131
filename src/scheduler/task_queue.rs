//! Single-consumer work queue with tag-based cancellation.
//!
//! Producers append `(action, tag)` items from any thread. At most one worker
//! thread drains the queue in FIFO order; it is spawned on demand by the
//! enqueue that finds no active worker and exits once the queue is empty.
//! Items that have not started yet can be cancelled by tag. Bulk inspection
//! runs under a pause so the worker cannot pick up an item mid-scan.

#![allow(missing_docs)]

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::core::errors::{FimError, Result};

/// A unit of work. Returning `Err` (or panicking) counts as a failure.
pub type Task = Box<dyn FnMut() -> Result<()> + Send>;

/// Called after every failed task with its tag, the error, and whether the
/// item was put back at the tail.
pub type FailureHook<T> = Arc<dyn Fn(Option<&T>, &FimError, bool) + Send + Sync>;

struct QueueItem<T> {
    action: Task,
    tag: Option<T>,
}

struct State<T> {
    items: VecDeque<QueueItem<T>>,
    paused: usize,
    running: bool,
    closed: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    resumed: Condvar,
    idle: Condvar,
    worker_active: AtomicBool,
    requeue_on_failure: AtomicBool,
    on_failure: RwLock<Option<FailureHook<T>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    name: String,
}

/// Tagged FIFO queue drained by one worker thread.
pub struct TaskQueue<T: PartialEq + Send + Sync + 'static> {
    inner: Arc<Inner<T>>,
}

/// Holds the worker off the queue until dropped.
pub struct PauseGuard<'a, T: PartialEq + Send + Sync + 'static> {
    inner: &'a Inner<T>,
}

impl<T: PartialEq + Send + Sync + 'static> Drop for PauseGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.paused = state.paused.saturating_sub(1);
        if state.paused == 0 {
            self.inner.resumed.notify_all();
        }
    }
}

impl<T: PartialEq + Send + Sync + 'static> TaskQueue<T> {
    /// Create a queue whose worker threads are named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    items: VecDeque::new(),
                    paused: 0,
                    running: false,
                    closed: false,
                }),
                resumed: Condvar::new(),
                idle: Condvar::new(),
                worker_active: AtomicBool::new(false),
                requeue_on_failure: AtomicBool::new(false),
                on_failure: RwLock::new(None),
                worker: Mutex::new(None),
                name: name.into(),
            }),
        }
    }

    /// Put failed items back at the tail instead of dropping them.
    ///
    /// A task that always fails is then retried forever and starves the rest
    /// of the queue.
    pub fn set_requeue_on_failure(&self, enabled: bool) {
        self.inner.requeue_on_failure.store(enabled, Ordering::Relaxed);
    }

    pub fn requeue_on_failure(&self) -> bool {
        self.inner.requeue_on_failure.load(Ordering::Relaxed)
    }

    pub fn set_failure_hook(&self, hook: FailureHook<T>) {
        *self.inner.on_failure.write() = Some(hook);
    }

    /// Append a task and make sure a worker is draining the queue.
    pub fn enqueue(&self, action: Task, tag: Option<T>) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(FimError::ChannelClosed {
                    component: "task_queue",
                });
            }
            state.items.push_back(QueueItem { action, tag });
        }
        self.ensure_worker()
    }

    /// Remove every queued item whose tag equals `tag`. Items already running
    /// are not affected. Returns the number removed.
    pub fn dequeue_by_tag(&self, tag: &T) -> usize {
        self.dequeue_where(|t| t == tag).len()
    }

    /// Remove every queued tagged item whose tag satisfies `matches` and
    /// return the removed tags in queue order. Untagged items always stay.
    pub fn dequeue_where<F: Fn(&T) -> bool>(&self, matches: F) -> Vec<T> {
        let _pause = self.pause();
        let mut state = self.inner.state.lock();
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(state.items.len());
        for item in state.items.drain(..) {
            match item.tag {
                Some(tag) if matches(&tag) => removed.push(tag),
                tag => kept.push_back(QueueItem {
                    action: item.action,
                    tag,
                }),
            }
        }
        state.items = kept;
        if state.items.is_empty() && !state.running {
            self.inner.idle.notify_all();
        }
        removed
    }

    /// Discard every queued item.
    pub fn clear(&self) {
        let _pause = self.pause();
        let mut state = self.inner.state.lock();
        state.items.clear();
        if !state.running {
            self.inner.idle.notify_all();
        }
    }

    /// Stop the worker from starting new items until the guard drops.
    pub fn pause(&self) -> PauseGuard<'_, T> {
        self.inner.state.lock().paused += 1;
        PauseGuard { inner: &self.inner }
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a worker thread currently holds the drain claim.
    pub fn is_worker_active(&self) -> bool {
        self.inner.worker_active.load(Ordering::Acquire)
    }

    /// Block until nothing is queued or running. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !(state.items.is_empty() && !state.running) {
            if self.inner.idle.wait_until(&mut state, deadline).timed_out() {
                return state.items.is_empty() && !state.running;
            }
        }
        true
    }

    /// Discard pending items, refuse new ones, and wait for an in-flight task
    /// to finish. Idempotent. Called from the worker itself it does not join.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.items.clear();
        }
        self.inner.resumed.notify_all();
        self.inner.idle.notify_all();

        let handle = self.inner.worker.lock().take();
        if let Some(handle) = handle
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    fn ensure_worker(&self) -> Result<()> {
        if self
            .inner
            .worker_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(self.inner.name.clone())
            .spawn(move || worker_loop(&inner));
        match spawned {
            Ok(handle) => {
                // Any previous handle belongs to a worker that already gave
                // up the claim and is exiting.
                *self.inner.worker.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.inner.worker_active.store(false, Ordering::Release);
                Err(FimError::Runtime {
                    details: format!("failed to spawn queue worker: {e}"),
                })
            }
        }
    }
}

impl<T: PartialEq + Send + Sync + 'static> Drop for TaskQueue<T> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<T: PartialEq + Send + Sync + 'static> std::fmt::Debug for TaskQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.inner.name)
            .field("len", &self.len())
            .field("worker_active", &self.is_worker_active())
            .finish()
    }
}

fn worker_loop<T: PartialEq + Send + Sync + 'static>(inner: &Inner<T>) {
    loop {
        let next = {
            let mut state = inner.state.lock();
            loop {
                if state.closed {
                    break None;
                }
                if state.paused > 0 {
                    inner.resumed.wait(&mut state);
                    continue;
                }
                let item = state.items.pop_front();
                state.running = item.is_some();
                break item;
            }
        };

        let Some(mut item) = next else {
            inner.worker_active.store(false, Ordering::Release);
            inner.idle.notify_all();
            // An enqueue may have pushed after our empty pop but seen the
            // claim still held; take the claim back if so.
            let more = {
                let state = inner.state.lock();
                !state.closed && !state.items.is_empty()
            };
            if more
                && inner
                    .worker_active
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                continue;
            }
            return;
        };

        let outcome = match catch_unwind(AssertUnwindSafe(|| (item.action)())) {
            Ok(result) => result,
            Err(payload) => Err(FimError::TaskPanicked {
                details: panic_message(payload.as_ref()),
            }),
        };

        match outcome {
            Ok(()) => finish_item(inner, None),
            Err(error) => {
                let requeue = inner.requeue_on_failure.load(Ordering::Relaxed);
                let hook = inner.on_failure.read().clone();
                if let Some(hook) = hook {
                    hook(item.tag.as_ref(), &error, requeue);
                }
                finish_item(inner, requeue.then_some(item));
            }
        }
    }
}

/// Mark the current item done, optionally pushing a retry at the tail.
fn finish_item<T: PartialEq + Send + Sync + 'static>(
    inner: &Inner<T>,
    retry: Option<QueueItem<T>>,
) {
    let mut state = inner.state.lock();
    state.running = false;
    if let Some(item) = retry
        && !state.closed
    {
        state.items.push_back(item);
    }
    if state.items.is_empty() {
        inner.idle.notify_all();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
