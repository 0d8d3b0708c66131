//! Live change source: a recursive `notify` watcher feeding `ChangeEvent`s
//! into the bounded event channel.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::core::errors::{FimError, Result};
use crate::watcher::events::{ChangeEvent, EventSender};

/// Owns the OS watcher. Dropping it stops delivery.
pub struct NotifySource {
    root: PathBuf,
    _watcher: RecommendedWatcher,
}

impl NotifySource {
    /// Start watching `root` recursively.
    pub fn start(root: &Path, sender: EventSender) -> Result<Self> {
        let watch_err = |e: notify::Error| FimError::Watch {
            path: root.to_path_buf(),
            details: e.to_string(),
        };

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for change in translate(event) {
                    sender.send(change);
                }
            }
            Err(e) => eprintln!("[FIM-WATCH] notify error: {e}"),
        })
        .map_err(watch_err)?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(watch_err)?;

        Ok(Self {
            root: root.to_path_buf(),
            _watcher: watcher,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl std::fmt::Debug for NotifySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifySource")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

/// Map one notify event onto zero or more change records.
pub fn translate(event: Event) -> Vec<ChangeEvent> {
    let Event { kind, paths, .. } = event;
    match kind {
        EventKind::Create(_) => paths.into_iter().map(ChangeEvent::Created).collect(),
        EventKind::Remove(_) => paths.into_iter().map(ChangeEvent::Deleted).collect(),
        EventKind::Modify(ModifyKind::Name(mode)) => translate_rename(mode, paths),
        EventKind::Modify(ModifyKind::Metadata(_)) | EventKind::Access(_) | EventKind::Other => {
            Vec::new()
        }
        EventKind::Modify(_) | EventKind::Any => {
            paths.into_iter().map(ChangeEvent::Changed).collect()
        }
    }
}

fn translate_rename(mode: RenameMode, paths: Vec<PathBuf>) -> Vec<ChangeEvent> {
    match mode {
        RenameMode::Both => {
            let mut it = paths.into_iter();
            match (it.next(), it.next()) {
                (Some(from), Some(to)) => vec![ChangeEvent::Renamed { from, to }],
                (Some(only), None) => vec![existence_event(only)],
                _ => Vec::new(),
            }
        }
        RenameMode::From => paths.into_iter().map(ChangeEvent::Deleted).collect(),
        RenameMode::To => paths.into_iter().map(ChangeEvent::Created).collect(),
        // Backends that cannot pair halves report each side on its own.
        RenameMode::Any | RenameMode::Other => paths.into_iter().map(existence_event).collect(),
    }
}

fn existence_event(path: PathBuf) -> ChangeEvent {
    if path.exists() {
        ChangeEvent::Created(path)
    } else {
        ChangeEvent::Deleted(path)
    }
}
