use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

use super::persist::{read_json, write_json, FlushScheduler};
use crate::error::{AppError, Result};

pub const CUSTOMIZATIONS_FILE_NAME: &str = "customizations.json";

/// Display overrides for one folder
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderCustomization {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl FolderCustomization {
    /// Blank strings count as absent.
    pub fn normalized(self) -> Self {
        fn keep(value: Option<String>) -> Option<String> {
            value.filter(|v| !v.is_empty())
        }
        Self {
            display_name: keep(self.display_name),
            icon: keep(self.icon),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.display_name.is_none() && self.icon.is_none()
    }
}

/// Folder relative path -> customization.
pub type Customizations = BTreeMap<String, FolderCustomization>;

pub struct CustomizationsStore {
    file: PathBuf,
    cache: Arc<Mutex<Option<Customizations>>>,
    flusher: FlushScheduler,
}

impl CustomizationsStore {
    pub fn new(data_dir: impl AsRef<Path>, write_delay: Duration) -> Self {
        Self {
            file: data_dir.as_ref().join(CUSTOMIZATIONS_FILE_NAME),
            cache: Arc::new(Mutex::new(None)),
            flusher: FlushScheduler::new("customizations", write_delay),
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn load(&self) -> Result<Customizations> {
        self.with_cache(|map| map.clone())
    }

    pub fn get(&self, folder_path: &str) -> Result<Option<FolderCustomization>> {
        self.with_cache(|map| map.get(folder_path).cloned())
    }

    /// Store `customization`, or drop the entry when it carries no field.
    pub fn set(&self, folder_path: &str, customization: FolderCustomization) -> Result<()> {
        validate_folder_path(folder_path)?;
        let customization = customization.normalized();
        self.with_cache(|map| {
            if customization.is_empty() {
                map.remove(folder_path);
            } else {
                map.insert(folder_path.to_string(), customization);
            }
        })?;

        let cache = self.cache.clone();
        let path = self.file.clone();
        self.flusher.schedule(move || Self::save(&cache, &path));
        Ok(())
    }

    /// Delete an entry and persist immediately.
    pub fn remove(&self, folder_path: &str) -> Result<()> {
        validate_folder_path(folder_path)?;
        self.with_cache(|map| map.remove(folder_path))?;
        self.flusher.cancel();
        Self::save(&self.cache, &self.file)
    }

    pub fn flush_now(&self) -> Result<()> {
        if self.flusher.cancel() {
            info!("Flushing pending customizations to {}", self.file.display());
        }
        let loaded = self.cache.lock().unwrap_or_else(|e| e.into_inner()).is_some();
        if loaded {
            Self::save(&self.cache, &self.file)?;
        }
        Ok(())
    }

    pub fn has_pending_flush(&self) -> bool {
        self.flusher.has_pending()
    }

    fn save(cache: &Mutex<Option<Customizations>>, path: &Path) -> Result<()> {
        let guard = cache.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(map) => write_json(path, map),
            None => Ok(()),
        }
    }

    fn with_cache<R>(&self, f: impl FnOnce(&mut Customizations) -> R) -> Result<R> {
        let mut guard = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let map = match guard.take() {
            Some(map) => map,
            None => read_json::<Customizations>(&self.file)?.unwrap_or_default(),
        };
        let map = guard.insert(map);
        Ok(f(map))
    }
}

fn validate_folder_path(folder_path: &str) -> Result<()> {
    if folder_path.trim().is_empty() {
        return Err(AppError::validation("Invalid payload: folderPath required"));
    }
    Ok(())
}
