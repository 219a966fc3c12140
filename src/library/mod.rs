//! Library indexing engine.
//!
//! [`LibraryIndex`] scans the base directory into a [`FolderNode`] tree and
//! owns one [`FolderIndex`] per folder that directly contains images. Ratings
//! and folder customizations live in JSON side-files shared by every folder
//! and survive reloads.

pub mod customizations;
pub mod folder;
pub mod persist;
pub mod ratings;

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::error::{AppError, Result};

pub use customizations::{Customizations, CustomizationsStore, FolderCustomization};
pub use folder::{FileReference, FolderIndex, FolderOptions, WaitOutcome};
pub use ratings::{Rating, RatingFilter, RatingsStore};

/// Library id of the base directory when it holds images itself.
pub const ROOT_LIBRARY_ID: &str = "__root__";

/// One directory of the scanned tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderNode {
    /// Relative path from the base, `/`-separated.
    #[serde(rename = "path")]
    pub relative_path: String,
    #[serde(rename = "fullPath")]
    pub absolute_path: PathBuf,
    #[serde(rename = "name")]
    pub display_name: String,
    pub children: Vec<FolderNode>,
    pub has_images: bool,
}

/// Snapshot returned by `GET /libs`
#[derive(Debug, Clone, Serialize)]
pub struct LibraryListing {
    pub root: Option<FolderNode>,
    pub folders: Vec<FolderNode>,
    pub customizations: Customizations,
}

/// Result of a scan: the tree plus the dispatch table built from it.
struct LibrarySnapshot {
    root: Option<FolderNode>,
    tree: Vec<FolderNode>,
    folders: HashMap<String, Arc<FolderIndex>>,
    order: Vec<String>,
}

impl LibrarySnapshot {
    fn empty() -> Self {
        Self {
            root: None,
            tree: Vec::new(),
            folders: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn teardown(&self) {
        for folder in self.folders.values() {
            folder.teardown();
        }
    }
}

pub struct LibraryIndex {
    base_path: PathBuf,
    ratings: Arc<RatingsStore>,
    customizations: Arc<CustomizationsStore>,
    options: FolderOptions,
    snapshot: RwLock<Arc<LibrarySnapshot>>,
}

impl LibraryIndex {
    /// Create the index and perform the initial scan.
    pub fn open(
        base_path: impl Into<PathBuf>,
        ratings: Arc<RatingsStore>,
        customizations: Arc<CustomizationsStore>,
        options: FolderOptions,
    ) -> Result<Self> {
        let index = Self {
            base_path: base_path.into(),
            ratings,
            customizations,
            options,
            snapshot: RwLock::new(Arc::new(LibrarySnapshot::empty())),
        };
        index.reload()?;
        Ok(index)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn ratings(&self) -> &Arc<RatingsStore> {
        &self.ratings
    }

    pub fn customizations(&self) -> &Arc<CustomizationsStore> {
        &self.customizations
    }

    /// Discard every folder index and rebuild from a fresh scan.
    ///
    /// On failure the previous state stays in place.
    pub fn reload(&self) -> Result<()> {
        let next = Arc::new(self.build_snapshot()?);
        info!(
            "Indexed {} libraries under {}",
            next.order.len(),
            self.base_path.display()
        );

        let previous = {
            let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *guard, next)
        };
        previous.teardown();
        Ok(())
    }

    pub fn list(&self) -> Result<LibraryListing> {
        let snapshot = self.current();
        Ok(LibraryListing {
            root: snapshot.root.clone(),
            folders: snapshot.tree.clone(),
            customizations: self.customizations.load()?,
        })
    }

    pub fn folder(&self, library_id: &str) -> Option<Arc<FolderIndex>> {
        self.current().folders.get(library_id).cloned()
    }

    pub fn require_folder(&self, library_id: &str) -> Result<Arc<FolderIndex>> {
        self.folder(library_id)
            .ok_or_else(|| AppError::not_found("Library not found"))
    }

    /// Library ids in pre-order (root first when present).
    pub fn library_ids(&self) -> Vec<String> {
        self.current().order.clone()
    }

    /// Delete an image from disk together with its rating.
    pub fn delete(&self, library_id: &str, file: &str) -> Result<()> {
        if library_id.is_empty() || file.is_empty() {
            return Err(AppError::validation("Invalid payload: library and file required"));
        }

        let folder = self.require_folder(library_id)?;
        let path = folder.resolve_file(file)?;
        if !path.is_file() {
            return Err(AppError::not_found("File not found"));
        }

        std::fs::remove_file(&path)?;
        self.ratings.remove_rating(library_id, file)?;
        self.invalidate_all();

        info!("Deleted: {}/{}", library_id, file);
        Ok(())
    }

    pub fn invalidate_all(&self) {
        for folder in self.current().folders.values() {
            folder.invalidate();
        }
    }

    pub fn get_customization(&self, folder_path: &str) -> Result<Option<FolderCustomization>> {
        validate_folder_path(folder_path)?;
        self.customizations.get(folder_path)
    }

    pub fn set_customization(&self, folder_path: &str, customization: FolderCustomization) -> Result<()> {
        validate_folder_path(folder_path)?;
        self.customizations.set(folder_path, customization)
    }

    pub fn remove_customization(&self, folder_path: &str) -> Result<()> {
        validate_folder_path(folder_path)?;
        self.customizations.remove(folder_path)
    }

    /// Persist pending debounced writes of both stores.
    pub fn flush(&self) -> Result<()> {
        self.ratings.flush_now()?;
        self.customizations.flush_now()
    }

    fn current(&self) -> Arc<LibrarySnapshot> {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn build_snapshot(&self) -> Result<LibrarySnapshot> {
        let tree = scan_folder_tree(&self.base_path)?;
        let root = if folder::has_images(&self.base_path)? {
            Some(FolderNode {
                relative_path: ROOT_LIBRARY_ID.to_string(),
                absolute_path: self.base_path.clone(),
                display_name: display_name_of(&self.base_path),
                children: Vec::new(),
                has_images: true,
            })
        } else {
            None
        };

        let mut leaves: Vec<(String, PathBuf)> = Vec::new();
        if let Some(root) = &root {
            leaves.push((root.relative_path.clone(), root.absolute_path.clone()));
        }
        leaves.extend(
            flatten_tree(&tree)
                .into_iter()
                .map(|node| (node.relative_path.clone(), node.absolute_path.clone())),
        );

        let mut folders = HashMap::with_capacity(leaves.len());
        let mut order = Vec::with_capacity(leaves.len());
        for (library_id, path) in leaves {
            let folder = FolderIndex::new(library_id.clone(), path, self.ratings.clone(), &self.options)?;
            if folders.insert(library_id.clone(), folder).is_some() {
                warn!("Duplicate library id {}", library_id);
                continue;
            }
            order.push(library_id);
        }

        Ok(LibrarySnapshot {
            root,
            tree,
            folders,
            order,
        })
    }
}

impl Drop for LibraryIndex {
    fn drop(&mut self) {
        self.current().teardown();
    }
}

fn validate_folder_path(folder_path: &str) -> Result<()> {
    if folder_path.trim().is_empty() {
        return Err(AppError::validation("Invalid payload: folderPath required"));
    }
    Ok(())
}

fn display_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Recursively build the directory tree below `base_path`.
///
/// Children are ordered by name. `has_images` only looks at a directory's
/// direct entries.
pub fn scan_folder_tree(base_path: &Path) -> Result<Vec<FolderNode>> {
    scan_level(base_path, "")
}

fn scan_level(dir: &Path, relative: &str) -> Result<Vec<FolderNode>> {
    let mut subdirs: Vec<(String, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => subdirs.push((name, entry.path())),
            Err(name) => warn!("Skipping directory with non UTF-8 name: {:?}", name),
        }
    }
    subdirs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut nodes = Vec::with_capacity(subdirs.len());
    for (name, path) in subdirs {
        let relative_path = if relative.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", relative, name)
        };
        let has_images = folder::has_images(&path)?;
        let children = scan_level(&path, &relative_path)?;
        nodes.push(FolderNode {
            relative_path,
            absolute_path: path,
            display_name: name,
            children,
            has_images,
        });
    }
    Ok(nodes)
}

/// Pre-order list of every node with images.
pub fn flatten_tree(nodes: &[FolderNode]) -> Vec<&FolderNode> {
    let mut flat = Vec::new();
    for node in nodes {
        if node.has_images {
            flat.push(node);
        }
        flat.extend(flatten_tree(&node.children));
    }
    flat
}
