//! Shared plumbing for the JSON side-files: reading, pretty writing and
//! debounced flushing.
//!
//! Mutations always land in memory first. A [`FlushScheduler`] then delays the
//! durable write until a quiet period has passed; every new mutation cancels
//! the pending flush and schedules a fresh one, so there is at most one
//! scheduled write per store. A crash inside the quiet period loses the
//! unflushed mutations.

use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::Result;

/// Read and parse a JSON file, `Ok(None)` if it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write `value` as 2-space indented JSON, creating parent directories.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(value)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Holds the single pending debounced flush of a store.
pub struct FlushScheduler {
    name: &'static str,
    delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl FlushScheduler {
    pub fn new(name: &'static str, delay: Duration) -> Self {
        Self {
            name,
            delay,
            pending: Mutex::new(None),
        }
    }

    /// Cancel any pending flush and schedule `flush` after the quiet period.
    ///
    /// Outside a tokio runtime the flush runs immediately.
    pub fn schedule<F>(&self, flush: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = pending.take() {
            handle.abort();
        }

        let name = self.name;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let delay = self.delay;
                *pending = Some(runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    match flush() {
                        Ok(()) => debug!("Flushed {} after {}ms quiet period", name, delay.as_millis()),
                        Err(e) => error!("Failed to persist {}: {}", name, e),
                    }
                }));
            }
            Err(_) => {
                if let Err(e) = flush() {
                    error!("Failed to persist {}: {}", name, e);
                }
            }
        }
    }

    /// Drop the pending flush, if any. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.take() {
            Some(handle) => {
                let was_pending = !handle.is_finished();
                handle.abort();
                was_pending
            }
            None => false,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
