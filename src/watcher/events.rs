//! Discrete change records and the bounded channel they travel over.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

/// One filesystem change, carrying absolute paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Created(PathBuf),
    Changed(PathBuf),
    Deleted(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

impl ChangeEvent {
    /// Every path the event touches.
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            Self::Created(p) | Self::Changed(p) | Self::Deleted(p) => vec![p.as_path()],
            Self::Renamed { from, to } => vec![from.as_path(), to.as_path()],
        }
    }

    pub const fn label(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Changed(_) => "changed",
            Self::Deleted(_) => "deleted",
            Self::Renamed { .. } => "renamed",
        }
    }
}

/// Producer side of the event channel. Never blocks; a full channel drops the
/// event and counts it.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<ChangeEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// Returns false when the event was dropped or the receiver is gone.
    pub fn send(&self, event: ChangeEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Create a bounded event channel.
pub fn event_channel(capacity: usize) -> (EventSender, Receiver<ChangeEvent>) {
    let (tx, rx) = bounded(capacity.max(1));
    (
        EventSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}
