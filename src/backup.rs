//! Snapshots of the metadata store.
//!
//! A snapshot is a full copy of the store directory taken before the first
//! write of an apply run:
//!
//! ```text
//! <backup root>/Tags-backup-20261016093000/
//!     tags/            copy of the store
//!     manifest.json    source path, creation time, MD5 of every file
//! ```
//!
//! The copy is staged under a hidden `.partial` name and only renamed to its
//! final name once complete, so every listed snapshot is whole. Snapshots are
//! never modified or deleted here.
//!
//! Restore stages the snapshot next to the live store, verifies it against
//! the manifest, then swaps directories. If anything fails before the swap
//! the live store is untouched; if the swap itself fails the old store is
//! moved back.
//!
//! The backup root and the store must not contain each other; both
//! operations refuse to run when they do.

use crate::error::{RestoreError, SnapshotError};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

pub const SNAPSHOT_PREFIX: &str = "Tags-backup-";

const CONTENTS_DIR: &str = "tags";
const MANIFEST_FILE: &str = "manifest.json";

/// A snapshot by value: its id (directory name) and location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub id: String,
    pub path: PathBuf,
}

impl Snapshot {
    /// Directory holding the copied store. Snapshots written here carry a
    /// manifest next to `tags/`; plain directory copies without one are
    /// their own contents.
    pub fn contents(&self) -> PathBuf {
        if self.path.join(MANIFEST_FILE).is_file() {
            self.path.join(CONTENTS_DIR)
        } else {
            self.path.clone()
        }
    }

    pub fn manifest(&self) -> Result<Option<SnapshotManifest>, RestoreError> {
        let path = self.path.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).map_err(|source| RestoreError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| RestoreError::Corrupt {
                snapshot: self.id.clone(),
                detail: format!("unreadable manifest: {}", e),
            })
    }

    /// Sort key: timestamp text, then collision counter.
    fn order_key(&self) -> (String, u32) {
        let rest = self.id.strip_prefix(SNAPSHOT_PREFIX).unwrap_or(&self.id);
        match rest.split_once('-') {
            Some((stamp, n)) => (stamp.to_string(), n.parse().unwrap_or(0)),
            None => (rest.to_string(), 0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub id: String,
    pub source: PathBuf,
    pub created_at: String,
    pub files: Vec<FileDigest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    /// Path relative to the store root, `/`-separated.
    pub path: String,
    pub size: u64,
    pub md5: String,
}

/// Creates, lists and restores snapshots under one backup root.
#[derive(Debug, Clone)]
pub struct BackupManager {
    root: PathBuf,
}

impl BackupManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy the whole store into a new snapshot. On any failure nothing is
    /// left behind and the error is returned.
    pub fn snapshot(&self, store_dir: &Path) -> Result<Snapshot, SnapshotError> {
        if !store_dir.is_dir() {
            return Err(SnapshotError::Io {
                path: store_dir.to_path_buf(),
                source: io::Error::new(io::ErrorKind::NotFound, "store directory does not exist"),
            });
        }
        if paths_overlap(&self.root, store_dir) {
            return Err(SnapshotError::Nested {
                root: self.root.clone(),
                store: store_dir.to_path_buf(),
            });
        }
        fs::create_dir_all(&self.root).map_err(|source| SnapshotError::Io {
            path: self.root.clone(),
            source,
        })?;

        let id = self.next_id();
        let staging = self.root.join(format!(".{}.partial", id));
        let path = self.root.join(&id);

        if let Err(e) = stage_snapshot(store_dir, &staging, &id) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }
        if let Err(source) = fs::rename(&staging, &path) {
            let _ = fs::remove_dir_all(&staging);
            return Err(SnapshotError::Io { path, source });
        }

        info!("Snapshot {} created at {:?}", id, path);
        Ok(Snapshot { id, path })
    }

    /// Complete snapshots, most recent first.
    pub fn list_snapshots(&self) -> Result<Vec<Snapshot>, SnapshotError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.root).map_err(|source| SnapshotError::Io {
            path: self.root.clone(),
            source,
        })?;

        let mut snapshots: Vec<Snapshot> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .filter_map(|path| {
                let id = path.file_name()?.to_string_lossy().to_string();
                id.starts_with(SNAPSHOT_PREFIX).then_some(Snapshot { id, path })
            })
            .collect();
        snapshots.sort_by_key(|s| std::cmp::Reverse(s.order_key()));
        Ok(snapshots)
    }

    pub fn latest(&self) -> Result<Option<Snapshot>, SnapshotError> {
        Ok(self.list_snapshots()?.into_iter().next())
    }

    /// Resolve a snapshot by id under the backup root, or by directory path.
    pub fn find(&self, id_or_path: &str) -> Result<Snapshot, RestoreError> {
        let by_id = self.root.join(id_or_path);
        if !id_or_path.contains(std::path::MAIN_SEPARATOR) && by_id.is_dir() {
            return Ok(Snapshot {
                id: id_or_path.to_string(),
                path: by_id,
            });
        }
        let path = PathBuf::from(id_or_path);
        if path.is_dir() {
            let id = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| id_or_path.to_string());
            return Ok(Snapshot { id, path });
        }
        Err(RestoreError::NotFound(id_or_path.to_string()))
    }

    /// Check a snapshot's files against its manifest. Snapshots without a
    /// manifest pass.
    pub fn verify(&self, snapshot: &Snapshot) -> Result<(), RestoreError> {
        match snapshot.manifest()? {
            Some(manifest) => verify_tree(&snapshot.contents(), &manifest, &snapshot.id),
            None => Ok(()),
        }
    }

    /// Replace the live store with the snapshot's contents.
    pub fn restore(&self, snapshot: &Snapshot, store_dir: &Path) -> Result<(), RestoreError> {
        for outside in [&self.root, &snapshot.path] {
            if paths_overlap(outside, store_dir) {
                return Err(RestoreError::Nested {
                    snapshot: outside.clone(),
                    store: store_dir.to_path_buf(),
                });
            }
        }
        let contents = snapshot.contents();
        if !contents.is_dir() {
            return Err(RestoreError::NotFound(snapshot.id.clone()));
        }
        let manifest = snapshot.manifest()?;

        let parent = match store_dir.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name = store_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| RestoreError::NotFound(format!("{:?} has no directory name", store_dir)))?;
        fs::create_dir_all(&parent).map_err(|source| RestoreError::Io {
            path: parent.clone(),
            source,
        })?;

        let stamp = Local::now().format("%Y%m%d%H%M%S%f");
        let staging = parent.join(format!(".{}.restore-{}", name, stamp));
        let retired = parent.join(format!(".{}.pre-restore-{}", name, stamp));

        let staged = copy_tree(&contents, &staging)
            .map_err(RestoreError::from)
            .and_then(|_| match &manifest {
                Some(manifest) => verify_tree(&staging, manifest, &snapshot.id),
                None => Ok(()),
            })
            .and_then(|_| swap_into_place(&staging, store_dir, &retired));
        if let Err(e) = staged {
            if staging.exists() {
                let _ = fs::remove_dir_all(&staging);
            }
            return Err(e);
        }

        if retired.exists() {
            if let Err(e) = fs::remove_dir_all(&retired) {
                warn!("Failed to remove previous store at {:?}: {}", retired, e);
            }
        }
        info!("Restored {:?} from snapshot {}", store_dir, snapshot.id);
        Ok(())
    }

    pub fn restore_latest(&self, store_dir: &Path) -> Result<Snapshot, RestoreError> {
        let latest = self
            .latest()?
            .ok_or_else(|| RestoreError::NoSnapshots(self.root.clone()))?;
        self.restore(&latest, store_dir)?;
        Ok(latest)
    }

    fn next_id(&self) -> String {
        let base = format!("{}{}", SNAPSHOT_PREFIX, Local::now().format("%Y%m%d%H%M%S"));
        let taken = |id: &str| {
            self.root.join(id).exists() || self.root.join(format!(".{}.partial", id)).exists()
        };
        if !taken(&base) {
            return base;
        }
        (1u32..)
            .map(|n| format!("{}-{}", base, n))
            .find(|id| !taken(id))
            .unwrap_or(base)
    }
}

/// Absolute form of `path` with symlinks resolved. Components past the
/// deepest existing ancestor are appended as given.
pub fn resolve_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut existing = absolute.as_path();
    let mut missing = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return missing.iter().rev().fold(canonical, |acc, name| acc.join(name));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return absolute,
        }
    }
}

/// True when one path is the other or lies inside it.
pub fn paths_overlap(a: &Path, b: &Path) -> bool {
    let (a, b) = (resolve_path(a), resolve_path(b));
    a.starts_with(&b) || b.starts_with(&a)
}

fn stage_snapshot(store_dir: &Path, staging: &Path, id: &str) -> Result<(), SnapshotError> {
    let files = copy_tree(store_dir, &staging.join(CONTENTS_DIR))?;
    let manifest = SnapshotManifest {
        id: id.to_string(),
        source: store_dir.to_path_buf(),
        created_at: Local::now().to_rfc3339(),
        files,
    };
    let manifest_path = staging.join(MANIFEST_FILE);
    let content = serde_json::to_string_pretty(&manifest).map_err(|source| SnapshotError::Manifest {
        path: manifest_path.clone(),
        source,
    })?;
    fs::write(&manifest_path, content).map_err(|source| SnapshotError::Io {
        path: manifest_path,
        source,
    })?;
    debug!("Staged {} files for {}", manifest.files.len(), id);
    Ok(())
}

/// Rename `staging` to `store`, moving any existing store to `retired`
/// first and back again if the second rename fails.
fn swap_into_place(staging: &Path, store: &Path, retired: &Path) -> Result<(), RestoreError> {
    let swap_err = |source: io::Error| RestoreError::Swap {
        staging: staging.to_path_buf(),
        store: store.to_path_buf(),
        source,
    };
    if !store.exists() {
        return fs::rename(staging, store).map_err(swap_err);
    }
    fs::rename(store, retired).map_err(swap_err)?;
    if let Err(source) = fs::rename(staging, store) {
        if let Err(e) = fs::rename(retired, store) {
            error!("Failed to put {:?} back at {:?}: {}", retired, store, e);
        }
        return Err(swap_err(source));
    }
    Ok(())
}

struct TreeError {
    path: PathBuf,
    source: io::Error,
}

impl From<TreeError> for SnapshotError {
    fn from(e: TreeError) -> Self {
        SnapshotError::Io {
            path: e.path,
            source: e.source,
        }
    }
}

impl From<TreeError> for RestoreError {
    fn from(e: TreeError) -> Self {
        RestoreError::Io {
            path: e.path,
            source: e.source,
        }
    }
}

fn at(path: &Path) -> impl Fn(io::Error) -> TreeError + '_ {
    move |source| TreeError {
        path: path.to_path_buf(),
        source,
    }
}

/// Files and directories under `root`, sorted by name, root excluded.
fn walk(root: &Path) -> Result<Vec<(PathBuf, walkdir::DirEntry)>, TreeError> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| TreeError {
            path: e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf()),
            source: e.into(),
        })?;
        let rel = match entry.path().strip_prefix(root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
            _ => continue,
        };
        entries.push((rel, entry));
    }
    Ok(entries)
}

/// Recursively copy `src` into `dst`, returning digests of the bytes copied.
fn copy_tree(src: &Path, dst: &Path) -> Result<Vec<FileDigest>, TreeError> {
    fs::create_dir_all(dst).map_err(at(dst))?;
    let mut digests = Vec::new();
    for (rel, entry) in walk(src)? {
        let target = dst.join(&rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(at(&target))?;
            continue;
        }
        let bytes = fs::read(entry.path()).map_err(at(entry.path()))?;
        fs::write(&target, &bytes).map_err(at(&target))?;
        if let Ok(meta) = entry.metadata() {
            fs::set_permissions(&target, meta.permissions()).map_err(at(&target))?;
        }
        digests.push(digest(&rel, &bytes));
    }
    Ok(digests)
}

fn digest_tree(root: &Path) -> Result<Vec<FileDigest>, TreeError> {
    let mut digests = Vec::new();
    for (rel, entry) in walk(root)? {
        if entry.file_type().is_dir() {
            continue;
        }
        let bytes = fs::read(entry.path()).map_err(at(entry.path()))?;
        digests.push(digest(&rel, &bytes));
    }
    Ok(digests)
}

fn digest(rel: &Path, bytes: &[u8]) -> FileDigest {
    FileDigest {
        path: rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        size: bytes.len() as u64,
        md5: format!("{:x}", md5::compute(bytes)),
    }
}

fn verify_tree(root: &Path, manifest: &SnapshotManifest, id: &str) -> Result<(), RestoreError> {
    let actual = digest_tree(root)?;
    if actual == manifest.files {
        return Ok(());
    }
    let detail = manifest
        .files
        .iter()
        .find(|expected| !actual.contains(expected))
        .map(|f| format!("{} differs or is missing", f.path))
        .or_else(|| {
            actual
                .iter()
                .find(|f| !manifest.files.contains(f))
                .map(|f| format!("{} is not in the manifest", f.path))
        })
        .unwrap_or_else(|| "file order differs".to_string());
    Err(RestoreError::Corrupt {
        snapshot: id.to_string(),
        detail,
    })
}
