//! Filesystem-resident cache backend
//!
//! Entries live under a cache directory independent of any workspace root,
//! one directory per key:
//!
//! ```text
//! <cache_dir>/
//!   <key>/
//!     metadata.json        origin root, duration, captured file list
//!     outputs/<relpath>    captured files at their original relative paths
//!   .staging/              in-progress writes, ignored by readers
//!   roots.json             origin-root index for scoped cleaning
//! ```
//!
//! Writes stage the whole entry into a uniquely named directory under
//! `.staging/` and publish it with a single `fs::rename`. A reader therefore
//! sees either no entry or a complete one; a crash mid-write leaves only
//! staging debris that later writes ignore.

use crate::backend::{CacheBackend, FetchResponse, ItemStatus};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

const METADATA_FILE: &str = "metadata.json";
const OUTPUTS_DIR: &str = "outputs";
const STAGING_DIR: &str = ".staging";
const ROOT_INDEX_FILE: &str = "roots.json";

/// Opaque identifier for a workspace root, used to scope invalidation
///
/// The same identifier is sent to the remote store as the deletion scope so
/// both backends agree on what "entries from this root" means.
#[must_use]
pub fn root_scope(root: &Path) -> String {
    let digest = Sha256::digest(root.to_string_lossy().as_bytes());
    hex::encode(&digest[..8])
}

/// Sidecar metadata stored next to each entry's captured files
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMetadata {
    /// Workspace root the files were captured from
    origin_root: PathBuf,
    /// Task execution duration in milliseconds
    duration_ms: u64,
    /// Relative paths captured at put time
    files: Vec<PathBuf>,
}

/// Index mapping origin-root scopes to the keys stored from them
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct RootIndex {
    entries: BTreeMap<String, BTreeSet<String>>,
}

/// Filesystem-backed cache, content-addressed by caller-supplied key
pub struct LocalCache {
    cache_dir: PathBuf,
    // Guards roots.json read-modify-write cycles. Entry I/O never holds it.
    index_lock: Mutex<()>,
}

impl LocalCache {
    /// Open (creating if needed) a local cache rooted at `cache_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir).map_err(|e| Error::io(e, &cache_dir, "create_dir_all"))?;
        Ok(Self {
            cache_dir,
            index_lock: Mutex::new(()),
        })
    }

    fn entry_dir(&self, key: &str) -> PathBuf {
        self.cache_dir.join(key)
    }

    fn index_path(&self) -> PathBuf {
        self.cache_dir.join(ROOT_INDEX_FILE)
    }

    /// Keys are opaque but become directory names; reject anything that
    /// would escape the cache directory or collide with internal files.
    fn validate_key(key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(Error::configuration("cache key must not be empty"));
        }
        if key.starts_with('.') || key.contains('/') || key.contains('\\') {
            return Err(Error::configuration(format!(
                "cache key {key:?} must not start with '.' or contain path separators"
            )));
        }
        Ok(())
    }

    fn put_sync(&self, root: &Path, key: &str, duration: Duration, files: &[PathBuf]) -> Result<()> {
        Self::validate_key(key)?;
        let dest = self.entry_dir(key);
        if dest.exists() {
            debug!(key, "Entry already cached, skipping put");
            return Ok(());
        }

        // Unique staging directory per attempt so concurrent puts for the
        // same key never write into each other's tree.
        let stage = self
            .cache_dir
            .join(STAGING_DIR)
            .join(format!("{key}-{}", uuid::Uuid::new_v4()));

        let staged = self.stage_entry(&stage, root, duration, files);
        let result = staged.and_then(|()| self.publish(&stage, &dest, key));
        if result.is_err() {
            let _ = fs::remove_dir_all(&stage);
        }
        result?;

        self.index_add(&root_scope(root), key);
        debug!(key, files = files.len(), "Cached entry locally");
        Ok(())
    }

    fn stage_entry(
        &self,
        stage: &Path,
        root: &Path,
        duration: Duration,
        files: &[PathBuf],
    ) -> Result<()> {
        let out_dir = stage.join(OUTPUTS_DIR);
        fs::create_dir_all(&out_dir).map_err(|e| Error::io(e, &out_dir, "create_dir_all"))?;

        for rel in files {
            // Escaping paths would restore outside a future fetch's root.
            crate::archive::ensure_contained(rel)?;
            let src = root.join(rel);
            let dst = out_dir.join(rel);
            copy_tree(&src, &dst)?;
        }

        let meta = EntryMetadata {
            origin_root: root.to_path_buf(),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            files: files.to_vec(),
        };
        let meta_path = stage.join(METADATA_FILE);
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| Error::serialization(format!("Failed to serialize metadata: {e}")))?;
        fs::write(&meta_path, json).map_err(|e| Error::io(e, &meta_path, "write"))?;
        Ok(())
    }

    /// Atomically publish a staged entry. Losing a publish race to a
    /// concurrent writer for the same key counts as success.
    fn publish(&self, stage: &Path, dest: &Path, key: &str) -> Result<()> {
        match fs::rename(stage, dest) {
            Ok(()) => Ok(()),
            Err(_) if dest.exists() => {
                debug!(key, "Concurrent put won the publish race");
                let _ = fs::remove_dir_all(stage);
                Ok(())
            }
            Err(e) => Err(Error::io(e, dest, "rename")),
        }
    }

    fn fetch_sync(&self, root: &Path, key: &str, expected: &[PathBuf]) -> Result<FetchResponse> {
        if Self::validate_key(key).is_err() {
            return Ok(FetchResponse::miss());
        }
        let dest = self.entry_dir(key);
        if !dest.exists() {
            return Ok(FetchResponse::miss());
        }

        let Some(meta) = self.read_metadata(&dest, key) else {
            return Ok(FetchResponse::miss());
        };

        let out_dir = dest.join(OUTPUTS_DIR);
        let listed: BTreeSet<&PathBuf> = meta.files.iter().collect();

        // An entry missing a captured or expected file is corrupt; partial
        // restores are forbidden, so drop it and report a miss.
        let incomplete = meta.files.iter().any(|rel| !out_dir.join(rel).exists())
            || expected.iter().any(|rel| !listed.contains(rel));
        if incomplete {
            warn!(key, "Incomplete cache entry, removing");
            self.self_heal(&dest, key);
            return Ok(FetchResponse::miss());
        }

        for rel in &meta.files {
            copy_tree(&out_dir.join(rel), &root.join(rel))?;
        }

        debug!(key, files = meta.files.len(), "Restored entry from local cache");
        Ok(FetchResponse {
            status: ItemStatus {
                local: true,
                remote: false,
            },
            files: meta.files,
            duration: Duration::from_millis(meta.duration_ms),
        })
    }

    fn read_metadata(&self, dest: &Path, key: &str) -> Option<EntryMetadata> {
        let meta_path = dest.join(METADATA_FILE);
        let content = match fs::read_to_string(&meta_path) {
            Ok(content) => content,
            Err(e) => {
                warn!(key, error = %e, "Cache entry has no readable metadata, removing");
                self.self_heal(dest, key);
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!(key, error = %e, "Cache entry has corrupt metadata, removing");
                self.self_heal(dest, key);
                None
            }
        }
    }

    fn self_heal(&self, dest: &Path, key: &str) {
        if let Err(e) = fs::remove_dir_all(dest) {
            warn!(key, error = %e, "Failed to remove corrupt cache entry");
        }
    }

    // Root index maintenance. The lock only covers the read-modify-write of
    // roots.json; entry directories are never touched while holding it.

    fn load_index(&self) -> RootIndex {
        let path = self.index_path();
        if !path.exists() {
            return RootIndex::default();
        }
        fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    }

    fn store_index(&self, index: &RootIndex) {
        let path = self.index_path();
        let json = match serde_json::to_vec_pretty(index) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize root index");
                return;
            }
        };
        // Same stage-then-rename protocol as entries, at file granularity.
        let tmp = path.with_extension("json.tmp");
        let written = fs::write(&tmp, json).and_then(|()| fs::rename(&tmp, &path));
        if let Err(e) = written {
            warn!(error = %e, "Failed to write root index");
            let _ = fs::remove_file(&tmp);
        }
    }

    fn index_add(&self, scope: &str, key: &str) {
        #[allow(clippy::unwrap_used)] // mutex poisoning only after a panic
        let _guard = self.index_lock.lock().unwrap();
        let mut index = self.load_index();
        index
            .entries
            .entry(scope.to_string())
            .or_default()
            .insert(key.to_string());
        self.store_index(&index);
    }

    fn index_take_scope(&self, scope: &str) -> BTreeSet<String> {
        #[allow(clippy::unwrap_used)]
        let _guard = self.index_lock.lock().unwrap();
        let mut index = self.load_index();
        let keys = index.entries.remove(scope).unwrap_or_default();
        self.store_index(&index);
        keys
    }
}

#[async_trait]
impl CacheBackend for LocalCache {
    async fn put(
        &self,
        root: &Path,
        key: &str,
        duration: Duration,
        files: &[PathBuf],
    ) -> Result<()> {
        self.put_sync(root, key, duration, files)
    }

    async fn fetch(
        &self,
        root: &Path,
        key: &str,
        expected: &[PathBuf],
    ) -> Result<FetchResponse> {
        self.fetch_sync(root, key, expected)
    }

    async fn exists(&self, key: &str) -> ItemStatus {
        ItemStatus {
            local: Self::validate_key(key).is_ok()
                && self.entry_dir(key).join(METADATA_FILE).exists(),
            remote: false,
        }
    }

    async fn clean(&self, root: &Path) {
        let scope = root_scope(root);
        let keys = self.index_take_scope(&scope);
        for key in &keys {
            if let Err(e) = fs::remove_dir_all(self.entry_dir(key)) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(key, error = %e, "Failed to remove cache entry during clean");
                }
            }
        }
        debug!(root = %root.display(), removed = keys.len(), "Cleaned local cache for root");
    }

    async fn clean_all(&self) {
        if let Err(e) = fs::remove_dir_all(&self.cache_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, "Failed to remove local cache directory");
            }
        }
        if let Err(e) = fs::create_dir_all(&self.cache_dir) {
            warn!(error = %e, "Failed to recreate local cache directory");
        }
    }

    async fn shutdown(&self) {
        // No asynchronous work to drain; handles close on drop.
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// Copy a file, or a directory tree file by file, creating parents.
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    if src.is_dir() {
        for entry in walkdir::WalkDir::new(src).into_iter().filter_map(|e| e.ok()) {
            let p = entry.path();
            if p.is_dir() {
                continue;
            }
            let rel = p.strip_prefix(src).map_err(|_| {
                Error::configuration(format!(
                    "path {} is not under {}",
                    p.display(),
                    src.display()
                ))
            })?;
            let target = dst.join(rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
            }
            fs::copy(p, &target).map_err(|e| Error::io(e, &target, "copy"))?;
        }
        return Ok(());
    }

    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
    }
    fs::copy(src, dst).map_err(|e| Error::io(e, dst, "copy"))?;
    Ok(())
}
