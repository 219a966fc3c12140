use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::persist::{read_json, write_json, FlushScheduler};
use crate::error::{AppError, Result};

pub const RATINGS_FILE_NAME: &str = "ratings.json";

/// A star rating, always within 1..=5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rating(u8);

impl Rating {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 5;

    pub fn all() -> impl Iterator<Item = Rating> {
        (Self::MIN..=Self::MAX).map(Rating)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Parse a comma separated filter such as `1,4,5`.
    ///
    /// Anything empty or malformed means "no filter".
    pub fn parse_filter(raw: &str) -> Option<RatingFilter> {
        let mut filter = RatingFilter::new();
        for part in raw.split(',') {
            let value: u8 = part.trim().parse().ok()?;
            filter.insert(Rating::try_from(value).ok()?);
        }
        if filter.is_empty() {
            None
        } else {
            Some(filter)
        }
    }
}

impl TryFrom<u8> for Rating {
    type Error = AppError;

    fn try_from(value: u8) -> Result<Self> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Rating(value))
        } else {
            Err(AppError::validation(format!(
                "Rating must be between {} and {}, got {}",
                Self::MIN,
                Self::MAX,
                value
            )))
        }
    }
}

impl TryFrom<i64> for Rating {
    type Error = AppError;

    fn try_from(value: i64) -> Result<Self> {
        u8::try_from(value)
            .map_err(|_| AppError::validation(format!("Rating out of range: {}", value)))
            .and_then(Rating::try_from)
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Rating {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.0)
    }
}

impl<'de> Deserialize<'de> for Rating {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        Rating::try_from(value).map_err(de::Error::custom)
    }
}

/// Set of ratings a listing is restricted to.
pub type RatingFilter = BTreeSet<Rating>;

/// The persisted form: rating -> fully-qualified references (`{library}/{file}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RatingBuckets {
    buckets: BTreeMap<Rating, Vec<String>>,
}

impl Default for RatingBuckets {
    fn default() -> Self {
        Self {
            buckets: Rating::all().map(|rating| (rating, Vec::new())).collect(),
        }
    }
}

impl RatingBuckets {
    pub fn bucket(&self, rating: Rating) -> &[String] {
        self.buckets.get(&rating).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (Rating, &[String])> {
        self.buckets.iter().map(|(rating, refs)| (*rating, refs.as_slice()))
    }

    pub fn rating_of(&self, full_ref: &str) -> Option<Rating> {
        self.buckets
            .iter()
            .find(|(_, refs)| refs.iter().any(|r| r == full_ref))
            .map(|(rating, _)| *rating)
    }

    /// Returns whether the reference was present in any bucket.
    fn remove(&mut self, full_ref: &str) -> bool {
        let mut removed = false;
        for refs in self.buckets.values_mut() {
            let before = refs.len();
            refs.retain(|r| r != full_ref);
            removed |= refs.len() != before;
        }
        removed
    }

    fn insert(&mut self, full_ref: String, rating: Rating) {
        self.remove(&full_ref);
        self.buckets.entry(rating).or_default().push(full_ref);
    }

    fn ensure_all_buckets(&mut self) {
        for rating in Rating::all() {
            self.buckets.entry(rating).or_default();
        }
    }
}

fn full_ref(library: &str, file: &str) -> String {
    format!("{}/{}", library, file)
}

/// Unified rating store backed by `ratings/ratings.json`.
pub struct RatingsStore {
    ratings_dir: PathBuf,
    ratings_file: PathBuf,
    cache: Arc<Mutex<Option<RatingBuckets>>>,
    migration_done: AtomicBool,
    revision: AtomicU64,
    flusher: FlushScheduler,
}

impl RatingsStore {
    pub fn new(ratings_dir: impl Into<PathBuf>, write_delay: Duration) -> Self {
        let ratings_dir = ratings_dir.into();
        let ratings_file = ratings_dir.join(RATINGS_FILE_NAME);
        Self {
            ratings_dir,
            ratings_file,
            cache: Arc::new(Mutex::new(None)),
            migration_done: AtomicBool::new(false),
            revision: AtomicU64::new(0),
            flusher: FlushScheduler::new("ratings", write_delay),
        }
    }

    pub fn ratings_file(&self) -> &Path {
        &self.ratings_file
    }

    /// Bumped on every mutation.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    pub fn load(&self) -> Result<RatingBuckets> {
        self.with_buckets(|buckets| buckets.clone())
    }

    pub fn set_rating(&self, library: &str, file: &str, rating: Rating) -> Result<()> {
        let reference = full_ref(library, file);
        debug!("Rating {} as {}", reference, rating);
        self.with_buckets(|buckets| buckets.insert(reference, rating))?;
        self.revision.fetch_add(1, Ordering::SeqCst);
        self.schedule_flush();
        Ok(())
    }

    pub fn get_rating(&self, library: &str, file: &str) -> Result<Option<Rating>> {
        let reference = full_ref(library, file);
        self.with_buckets(|buckets| buckets.rating_of(&reference))
    }

    /// Remove a rating and persist immediately.
    pub fn remove_rating(&self, library: &str, file: &str) -> Result<()> {
        let reference = full_ref(library, file);
        let removed = self.with_buckets(|buckets| buckets.remove(&reference))?;
        if removed {
            debug!("Removed rating for {}", reference);
            self.revision.fetch_add(1, Ordering::SeqCst);
        }
        self.flusher.cancel();
        Self::save(&self.cache, &self.ratings_file)
    }

    /// Bare file names rated for `library`, bucket order then insertion order.
    pub fn files_for_library(
        &self,
        library: &str,
        filter: Option<&RatingFilter>,
    ) -> Result<Vec<String>> {
        let prefix = format!("{}/", library);
        self.with_buckets(|buckets| {
            buckets
                .iter()
                .filter(|(rating, _)| filter.map_or(true, |f| f.contains(rating)))
                .flat_map(|(_, refs)| refs.iter())
                .filter_map(|r| r.strip_prefix(&prefix))
                .map(str::to_string)
                .collect()
        })
    }

    /// Every rated file of `library` with its rating.
    pub fn ratings_for_library(&self, library: &str) -> Result<HashMap<String, Rating>> {
        let prefix = format!("{}/", library);
        self.with_buckets(|buckets| {
            buckets
                .iter()
                .flat_map(|(rating, refs)| refs.iter().map(move |r| (rating, r)))
                .filter_map(|(rating, r)| r.strip_prefix(&prefix).map(|f| (f.to_string(), rating)))
                .collect()
        })
    }

    /// Write any pending change right away.
    pub fn flush_now(&self) -> Result<()> {
        if self.flusher.cancel() {
            info!("Flushing pending ratings to {}", self.ratings_file.display());
        }
        let loaded = self.cache.lock().unwrap_or_else(|e| e.into_inner()).is_some();
        if loaded {
            Self::save(&self.cache, &self.ratings_file)?;
        }
        Ok(())
    }

    pub fn has_pending_flush(&self) -> bool {
        self.flusher.has_pending()
    }

    fn schedule_flush(&self) {
        let cache = self.cache.clone();
        let path = self.ratings_file.clone();
        self.flusher.schedule(move || Self::save(&cache, &path));
    }

    fn save(cache: &Mutex<Option<RatingBuckets>>, path: &Path) -> Result<()> {
        let guard = cache.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(buckets) => write_json(path, buckets),
            None => Ok(()),
        }
    }

    fn with_buckets<R>(&self, f: impl FnOnce(&mut RatingBuckets) -> R) -> Result<R> {
        let mut guard = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(self.read_or_migrate()?);
        }
        match guard.as_mut() {
            Some(buckets) => Ok(f(buckets)),
            None => Err(AppError::Internal(anyhow::anyhow!("ratings cache unavailable"))),
        }
    }

    fn read_or_migrate(&self) -> Result<RatingBuckets> {
        if let Some(mut buckets) = read_json::<RatingBuckets>(&self.ratings_file)? {
            buckets.ensure_all_buckets();
            return Ok(buckets);
        }

        let mut buckets = RatingBuckets::default();
        if !self.migration_done.swap(true, Ordering::SeqCst) {
            self.migrate_legacy_files(&mut buckets)?;
        }
        Ok(buckets)
    }

    /// Merge legacy one-file-per-folder maps (`{filename: rating}`) into `buckets`.
    fn migrate_legacy_files(&self, buckets: &mut RatingBuckets) -> Result<()> {
        if !self.ratings_dir.is_dir() {
            std::fs::create_dir_all(&self.ratings_dir)?;
            return Ok(());
        }

        let mut legacy_files: Vec<PathBuf> = std::fs::read_dir(&self.ratings_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| is_legacy_ratings_file(path))
            .collect();
        legacy_files.sort();

        if legacy_files.is_empty() {
            return Ok(());
        }

        info!("Migrating {} old rating files...", legacy_files.len());

        for legacy_path in &legacy_files {
            let folder_name = match legacy_path.file_stem().and_then(|s| s.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };

            let legacy: HashMap<String, serde_json::Value> = match read_json(legacy_path) {
                Ok(Some(map)) => map,
                Ok(None) => continue,
                Err(e) => {
                    warn!("  Failed to migrate {}: {}", legacy_path.display(), e);
                    continue;
                }
            };

            let mut entries: Vec<_> = legacy.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));

            let mut migrated = 0usize;
            for (filename, value) in entries {
                let rating = value.as_i64().and_then(|v| Rating::try_from(v).ok());
                match rating {
                    Some(rating) => {
                        let reference = full_ref(&folder_name, &filename);
                        if buckets.rating_of(&reference).is_none() {
                            buckets.insert(reference, rating);
                        }
                        migrated += 1;
                    }
                    None => warn!("  Skipping {}/{}: invalid rating {}", folder_name, filename, value),
                }
            }

            info!("  Migrated {}: {} ratings", folder_name, migrated);
        }

        write_json(&self.ratings_file, buckets)?;
        info!("Migration complete.");
        Ok(())
    }
}

fn is_legacy_ratings_file(path: &Path) -> bool {
    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    is_json
        && path.is_file()
        && name != RATINGS_FILE_NAME
        && name != super::customizations::CUSTOMIZATIONS_FILE_NAME
}
