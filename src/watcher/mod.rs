use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, FileIdMap};
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::media::is_image_file;

/// Invoked with the path of an image that was created, modified or removed.
pub type ChangeCallback = Arc<dyn Fn(&Path) + Send + Sync>;

/// Capability for watching a single directory for image changes
pub trait FolderWatcher: Send + Sync {
    /// Start watching `path` (non-recursively). The watch lives as long as the
    /// returned handle.
    fn subscribe(&self, path: &Path, on_change: ChangeCallback) -> Result<WatchHandle>;
}

/// Keeps a watch alive; dropping it releases the underlying watcher.
pub struct WatchHandle {
    path: PathBuf,
    guard: Option<Box<dyn Any + Send>>,
}

impl WatchHandle {
    pub fn new(path: PathBuf, guard: Box<dyn Any + Send>) -> Self {
        Self {
            path,
            guard: Some(guard),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_active(&self) -> bool {
        self.guard.is_some()
    }

    pub fn unsubscribe(&mut self) {
        if self.guard.take().is_some() {
            info!("Stopped watching directory: {:?}", self.path);
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// `notify` backed watcher with a short debounce window
pub struct NotifyWatcher {
    debounce_duration: Duration,
}

impl NotifyWatcher {
    pub fn new() -> Self {
        Self {
            debounce_duration: Duration::from_millis(100),
        }
    }

    pub fn with_debounce(debounce_duration: Duration) -> Self {
        Self { debounce_duration }
    }
}

impl Default for NotifyWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl FolderWatcher for NotifyWatcher {
    fn subscribe(&self, path: &Path, on_change: ChangeCallback) -> Result<WatchHandle> {
        let mut debouncer: Debouncer<RecommendedWatcher, FileIdMap> = new_debouncer(
            self.debounce_duration,
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    for event in events {
                        for changed in event.paths.iter().filter(|p| is_image_file(p)) {
                            debug!("Image event {:?} for {:?}", event.event.kind, changed);
                            on_change(changed.as_path());
                        }
                    }
                }
                Err(errors) => {
                    for error in errors {
                        error!("File watcher error: {:?}", error);
                    }
                }
            },
        )?;

        debouncer.watcher().watch(path, RecursiveMode::NonRecursive)?;
        info!(
            "Started watching directory: {:?} ({}ms debounce)",
            path,
            self.debounce_duration.as_millis()
        );

        Ok(WatchHandle::new(path.to_path_buf(), Box::new(debouncer)))
    }
}
