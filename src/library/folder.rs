use serde::Serialize;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::ratings::{Rating, RatingFilter, RatingsStore};
use crate::error::{AppError, Result};
use crate::media::is_image_file;
use crate::watcher::{FolderWatcher, WatchHandle};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(20);
pub const DEFAULT_LONG_POLL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_TODAY_FORMAT: &str = "%Y-%m-%d";

/// Settings shared by every folder of a library
#[derive(Clone)]
pub struct FolderOptions {
    pub refresh_interval: Duration,
    pub long_poll_timeout: Duration,
    /// `chrono` format a folder name must render to for it to count as today's folder.
    pub today_format: String,
    pub watcher: Option<Arc<dyn FolderWatcher>>,
}

impl Default for FolderOptions {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            long_poll_timeout: DEFAULT_LONG_POLL_TIMEOUT,
            today_format: DEFAULT_TODAY_FORMAT.to_string(),
            watcher: None,
        }
    }
}

/// One image in a listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileReference {
    pub library: String,
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<Rating>,
}

/// Result of a long-poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WaitOutcome {
    pub timeout: bool,
    pub changed: bool,
}

/// Cached flat listing of a folder and its refresh schedule.
#[derive(Debug, Clone)]
pub struct FileListCache {
    files: Arc<Vec<String>>,
    next_due: Instant,
    last_changed: SystemTime,
}

impl FileListCache {
    pub fn new(now: Instant) -> Self {
        Self {
            files: Arc::new(Vec::new()),
            next_due: now,
            last_changed: SystemTime::now(),
        }
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        now >= self.next_due
    }

    pub fn invalidate(&mut self, now: Instant) {
        self.next_due = now;
    }

    pub fn files(&self) -> Arc<Vec<String>> {
        self.files.clone()
    }

    pub fn last_changed(&self) -> SystemTime {
        self.last_changed
    }

    /// Store a fresh listing; returns whether it differs from the cached one.
    pub fn apply(&mut self, files: Vec<String>, now: Instant, interval: Duration) -> bool {
        self.next_due = now + interval;

        if *self.files == files {
            return false;
        }
        self.files = Arc::new(files);
        self.last_changed = SystemTime::now();
        true
    }
}

#[derive(Default)]
struct Waiters {
    next_id: u64,
    pending: Vec<(u64, oneshot::Sender<bool>)>,
}

/// Removes a waiter from the list if the poll ends without being resolved.
struct WaiterGuard<'a> {
    folder: &'a FolderIndex,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let mut waiters = self.folder.waiters.lock().unwrap_or_else(|e| e.into_inner());
        waiters.pending.retain(|(id, _)| *id != self.id);
    }
}

/// Cached, rating-aware view of one leaf library directory.
pub struct FolderIndex {
    library_id: String,
    name: String,
    path: PathBuf,
    ratings: Arc<RatingsStore>,
    refresh_interval: Duration,
    long_poll_timeout: Duration,
    is_today: bool,
    cache: Mutex<FileListCache>,
    waiters: Mutex<Waiters>,
    watch: Mutex<Option<WatchHandle>>,
}

impl FolderIndex {
    /// Create the index and read the directory once.
    ///
    /// A folder named after today's date is additionally watched when a
    /// watcher is configured.
    pub fn new(
        library_id: impl Into<String>,
        path: impl Into<PathBuf>,
        ratings: Arc<RatingsStore>,
        options: &FolderOptions,
    ) -> Result<Arc<Self>> {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let is_today = today_folder_name(&options.today_format).is_some_and(|today| today == name);

        let folder = Arc::new(Self {
            library_id: library_id.into(),
            name,
            path,
            ratings,
            refresh_interval: options.refresh_interval,
            long_poll_timeout: options.long_poll_timeout,
            is_today,
            cache: Mutex::new(FileListCache::new(Instant::now())),
            waiters: Mutex::new(Waiters::default()),
            watch: Mutex::new(None),
        });

        folder.refresh_if_stale()?;

        if folder.is_today {
            if let Some(watcher) = &options.watcher {
                folder.install_watch(watcher.as_ref());
            }
        }

        Ok(folder)
    }

    pub fn library_id(&self) -> &str {
        &self.library_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_today(&self) -> bool {
        self.is_today
    }

    pub fn is_watching(&self) -> bool {
        self.watch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(WatchHandle::is_active)
            .unwrap_or(false)
    }

    /// Milliseconds since the epoch of the last detected listing change.
    pub fn last_changed_millis(&self) -> u64 {
        let last_changed = self.lock_cache().last_changed();
        last_changed
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn cache_snapshot(&self) -> FileListCache {
        self.lock_cache().clone()
    }

    /// Force the next access to re-read the directory.
    pub fn invalidate(&self) {
        self.lock_cache().invalidate(Instant::now());
    }

    /// Re-read the directory if the refresh deadline has passed.
    ///
    /// Returns whether the listing changed.
    pub fn refresh_if_stale(&self) -> Result<bool> {
        let changed = {
            let mut cache = self.lock_cache();
            let now = Instant::now();
            if !cache.is_stale(now) {
                return Ok(false);
            }
            let files = read_image_names(&self.path)?;
            cache.apply(files, now, self.refresh_interval)
        };

        if changed {
            debug!("Listing of {} changed", self.library_id);
            self.notify_waiters(true);
        }
        Ok(changed)
    }

    /// Images of this folder, optionally restricted to some ratings.
    pub fn list(&self, filter: Option<&RatingFilter>, recursive: bool) -> Result<Vec<FileReference>> {
        self.refresh_if_stale()?;

        let files: Arc<Vec<String>> = if recursive {
            Arc::new(walk_image_paths(&self.path)?)
        } else {
            self.lock_cache().files()
        };

        let ratings = self.ratings.ratings_for_library(&self.library_id)?;
        let annotate = |file: &String| FileReference {
            library: self.library_id.clone(),
            file: file.clone(),
            rating: ratings.get(file).copied(),
        };

        match filter {
            None => Ok(files.iter().map(annotate).collect()),
            Some(filter) => {
                let rated: HashSet<String> = self
                    .ratings
                    .files_for_library(&self.library_id, Some(filter))?
                    .into_iter()
                    .collect();
                Ok(files
                    .iter()
                    .filter(|file| rated.contains(*file))
                    .map(annotate)
                    .collect())
            }
        }
    }

    pub fn rate(&self, file: &str, rating: u8) -> Result<()> {
        let rating = Rating::try_from(rating)?;
        if file.is_empty() {
            return Err(AppError::validation("Invalid payload: img required"));
        }
        self.ratings.set_rating(&self.library_id, file, rating)
    }

    /// Wait until a refresh detects a change, or until the long-poll timeout.
    pub async fn wait_for_update(&self) -> WaitOutcome {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
            let id = waiters.next_id;
            waiters.next_id += 1;
            waiters.pending.push((id, tx));
            id
        };
        let _guard = WaiterGuard { folder: self, id };

        match tokio::time::timeout(self.long_poll_timeout, rx).await {
            Ok(Ok(changed)) => WaitOutcome {
                timeout: false,
                changed,
            },
            Ok(Err(_)) => WaitOutcome {
                timeout: false,
                changed: false,
            },
            Err(_) => WaitOutcome {
                timeout: true,
                changed: false,
            },
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner()).pending.len()
    }

    /// Resolve a file name against the folder, rejecting anything that would
    /// escape it.
    pub fn resolve_file(&self, file: &str) -> Result<PathBuf> {
        let relative = Path::new(file);
        let is_plain = !file.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !is_plain {
            return Err(AppError::validation(format!("Invalid file name: {}", file)));
        }
        Ok(self.path.join(relative))
    }

    /// Release the watch and drop outstanding waiters.
    pub fn teardown(&self) {
        if let Some(mut handle) = self.watch.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.unsubscribe();
        }
        let dropped = std::mem::take(&mut self.waiters.lock().unwrap_or_else(|e| e.into_inner()).pending);
        if !dropped.is_empty() {
            debug!("Dropped {} waiters of {}", dropped.len(), self.library_id);
        }
    }

    fn install_watch(self: &Arc<Self>, watcher: &dyn FolderWatcher) {
        let weak = Arc::downgrade(self);
        let result = watcher.subscribe(
            &self.path,
            Arc::new(move |changed: &Path| {
                if let Some(folder) = weak.upgrade() {
                    folder.on_watch_event(changed);
                }
            }),
        );

        match result {
            Ok(handle) => {
                info!("Watching today's folder {}", self.library_id);
                *self.watch.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
            }
            Err(e) => warn!("Failed to watch {}: {} - falling back to periodic refresh", self.path.display(), e),
        }
    }

    fn on_watch_event(&self, changed: &Path) {
        debug!("Watch event in {}: {:?}", self.library_id, changed);
        self.invalidate();
        if let Err(e) = self.refresh_if_stale() {
            warn!("Failed to refresh {} after watch event: {}", self.library_id, e);
        }
    }

    fn notify_waiters(&self, changed: bool) {
        let pending = std::mem::take(&mut self.waiters.lock().unwrap_or_else(|e| e.into_inner()).pending);
        for (_, tx) in pending {
            let _ = tx.send(changed);
        }
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, FileListCache> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for FolderIndex {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Today's date rendered with `format`, `None` if the format is invalid.
fn today_folder_name(format: &str) -> Option<String> {
    use std::fmt::Write;

    let mut today = String::new();
    write!(today, "{}", chrono::Local::now().format(format)).ok()?;
    Some(today)
}

/// Image file names directly inside `dir`, sorted.
pub fn read_image_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            continue;
        }
        let path = entry.path();
        if !is_image_file(&path) {
            continue;
        }
        if let Ok(name) = entry.file_name().into_string() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Whether `dir` directly contains at least one image.
pub fn has_images(dir: &Path) -> Result<bool> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() && is_image_file(&entry.path()) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Every image below `root`, as `/`-separated paths relative to it, sorted.
pub fn walk_image_paths(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).min_depth(1) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_dir() || !is_image_file(entry.path()) {
            continue;
        }
        let relative = match entry.path().strip_prefix(root) {
            Ok(relative) => relative,
            Err(_) => continue,
        };
        let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
        if let Some(parts) = parts {
            files.push(parts.join("/"));
        }
    }
    files.sort();
    Ok(files)
}
