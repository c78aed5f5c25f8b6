//! The capability contract every cache backend satisfies
//!
//! The scheduler talks to a single `Arc<dyn CacheBackend>`; which storage
//! media sit behind it (filesystem, remote store, both, or nothing) is
//! decided at construction time.

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where a cached entry was found
///
/// Describes presence, not content. Both flags false is a full miss.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStatus {
    /// Entry present in the local filesystem cache
    pub local: bool,
    /// Entry present in the remote artifact store
    pub remote: bool,
}

impl ItemStatus {
    /// True if the entry was found anywhere
    #[must_use]
    pub fn hit(&self) -> bool {
        self.local || self.remote
    }

    /// Union of two statuses
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            local: self.local || other.local,
            remote: self.remote || other.remote,
        }
    }
}

/// Result of a cache fetch
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    /// Where the entry was found; all-false on a miss
    pub status: ItemStatus,
    /// Relative paths restored into the workspace root
    pub files: Vec<PathBuf>,
    /// Task execution duration recorded when the entry was stored
    pub duration: Duration,
}

impl FetchResponse {
    /// A full miss: zero status, no files, zero duration
    #[must_use]
    pub fn miss() -> Self {
        Self::default()
    }

    /// True if nothing was found
    #[must_use]
    pub fn is_miss(&self) -> bool {
        !self.status.hit()
    }
}

/// Common contract for cache backends
///
/// Implementations must be safe for concurrent calls with arbitrary,
/// possibly identical, keys. Concurrent operations on distinct keys must
/// never contend on a lock held across I/O.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Persist the listed files (already on disk under `root`) plus the
    /// task duration under `key`.
    ///
    /// Atomic from an observer's viewpoint: a concurrent fetch for the same
    /// key sees either the pre-put state or the complete entry, never a
    /// partial one. A failed put leaves no visible entry.
    ///
    /// # Errors
    ///
    /// Returns an error on storage-write failure (disk full, permission
    /// denied, unreadable source file). Callers treat this as "could not
    /// cache, proceed".
    async fn put(
        &self,
        root: &Path,
        key: &str,
        duration: Duration,
        files: &[PathBuf],
    ) -> Result<()>;

    /// Look up `key` and, on a hit, restore every associated file into
    /// `root` at its original relative path.
    ///
    /// A miss is a normal outcome and returns `Ok(FetchResponse::miss())`.
    /// `expected` is the output set the caller recorded for this key; an
    /// entry missing one of those files is corrupt and reported as a miss.
    ///
    /// # Errors
    ///
    /// Reserved for I/O faults while restoring (e.g. target not writable).
    async fn fetch(&self, root: &Path, key: &str, expected: &[PathBuf])
    -> Result<FetchResponse>;

    /// Presence check with no side effects.
    async fn exists(&self, key: &str) -> ItemStatus;

    /// Remove all entries captured from the given workspace root.
    /// Best-effort; failures are logged, never returned.
    async fn clean(&self, root: &Path);

    /// Remove every entry regardless of origin root. Best-effort.
    async fn clean_all(&self);

    /// Flush pending asynchronous work and release held resources.
    ///
    /// Blocks until outstanding work completes or a bounded grace period
    /// elapses. Safe to call more than once; later calls are no-ops.
    async fn shutdown(&self);

    /// Short identifier for logging
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_default_is_full_miss() {
        let status = ItemStatus::default();
        assert!(!status.local);
        assert!(!status.remote);
        assert!(!status.hit());
    }

    #[test]
    fn test_status_merge_is_union() {
        let local = ItemStatus {
            local: true,
            remote: false,
        };
        let remote = ItemStatus {
            local: false,
            remote: true,
        };

        let merged = local.merge(remote);
        assert!(merged.local);
        assert!(merged.remote);
        assert!(merged.hit());

        assert_eq!(
            ItemStatus::default().merge(ItemStatus::default()),
            ItemStatus::default()
        );
    }

    #[test]
    fn test_miss_response_is_zeroed() {
        let miss = FetchResponse::miss();
        assert!(miss.is_miss());
        assert!(miss.files.is_empty());
        assert_eq!(miss.duration, Duration::ZERO);
    }
}
