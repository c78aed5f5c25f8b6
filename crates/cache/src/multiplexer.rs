//! Composes multiple backends into one logical cache
//!
//! Backends are ordered fastest first (by convention local before remote).
//! Reads go through the list in order; writes fan out to every backend. The
//! scheduler only ever holds the multiplexer, so enabling or disabling a
//! backend changes the configured list, not calling code.

use crate::backend::{CacheBackend, FetchResponse, ItemStatus};
use crate::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Ordered collection of backends presented as a single cache
pub struct CacheMultiplexer {
    backends: Vec<Arc<dyn CacheBackend>>,
}

impl CacheMultiplexer {
    /// Compose the given backends, queried in order on fetch.
    #[must_use]
    pub fn new(backends: Vec<Arc<dyn CacheBackend>>) -> Self {
        Self { backends }
    }
}

#[async_trait]
impl CacheBackend for CacheMultiplexer {
    /// Write through to every backend. All backends are attempted even when
    /// one fails; the first error (if any) is returned afterwards.
    async fn put(
        &self,
        root: &Path,
        key: &str,
        duration: Duration,
        files: &[PathBuf],
    ) -> Result<()> {
        let mut first_err = None;
        for backend in &self.backends {
            if let Err(e) = backend.put(root, key, duration, files).await {
                warn!(key, backend = backend.name(), error = %e, "Cache put failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// First hit wins. A hit from a later backend is back-filled into every
    /// earlier (faster) backend before returning, so the next fetch for the
    /// same key is served locally.
    async fn fetch(
        &self,
        root: &Path,
        key: &str,
        expected: &[PathBuf],
    ) -> Result<FetchResponse> {
        for (i, backend) in self.backends.iter().enumerate() {
            let response = backend.fetch(root, key, expected).await?;
            if response.is_miss() {
                continue;
            }

            let mut status = response.status;
            for earlier in &self.backends[..i] {
                match earlier.put(root, key, response.duration, &response.files).await {
                    Ok(()) => {
                        debug!(key, backend = earlier.name(), "Promoted cache entry");
                        status = status.merge(earlier.exists(key).await);
                    }
                    Err(e) => {
                        warn!(key, backend = earlier.name(), error = %e, "Cache promotion failed");
                    }
                }
            }

            return Ok(FetchResponse { status, ..response });
        }
        Ok(FetchResponse::miss())
    }

    async fn exists(&self, key: &str) -> ItemStatus {
        let mut status = ItemStatus::default();
        for backend in &self.backends {
            status = status.merge(backend.exists(key).await);
        }
        status
    }

    async fn clean(&self, root: &Path) {
        for backend in &self.backends {
            backend.clean(root).await;
        }
    }

    async fn clean_all(&self) {
        for backend in &self.backends {
            backend.clean_all().await;
        }
    }

    async fn shutdown(&self) {
        for backend in &self.backends {
            backend.shutdown().await;
        }
    }

    fn name(&self) -> &'static str {
        "multiplexer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalCache;
    use crate::{Error, NoopCache};
    use std::collections::HashMap;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::Mutex as AsyncMutex;

    /// In-memory backend double that records calls
    struct MemBackend {
        label: &'static str,
        flavor: ItemStatus,
        entries: AsyncMutex<HashMap<String, (Duration, Vec<PathBuf>)>>,
        puts: AtomicUsize,
        fetches: AtomicUsize,
        shutdowns: AtomicUsize,
        fail_puts: bool,
    }

    impl MemBackend {
        fn new(label: &'static str, flavor: ItemStatus) -> Self {
            Self {
                label,
                flavor,
                entries: AsyncMutex::new(HashMap::new()),
                puts: AtomicUsize::new(0),
                fetches: AtomicUsize::new(0),
                shutdowns: AtomicUsize::new(0),
                fail_puts: false,
            }
        }

        fn remote_like() -> Self {
            Self::new(
                "mem-remote",
                ItemStatus {
                    local: false,
                    remote: true,
                },
            )
        }

        fn local_like() -> Self {
            Self::new(
                "mem-local",
                ItemStatus {
                    local: true,
                    remote: false,
                },
            )
        }

        async fn seed(&self, key: &str, duration: Duration, files: Vec<PathBuf>) {
            self.entries
                .lock()
                .await
                .insert(key.to_string(), (duration, files));
        }
    }

    #[async_trait]
    impl CacheBackend for MemBackend {
        async fn put(
            &self,
            _root: &Path,
            key: &str,
            duration: Duration,
            files: &[PathBuf],
        ) -> Result<()> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            if self.fail_puts {
                return Err(Error::configuration("put rejected"));
            }
            self.seed(key, duration, files.to_vec()).await;
            Ok(())
        }

        async fn fetch(
            &self,
            _root: &Path,
            key: &str,
            _expected: &[PathBuf],
        ) -> Result<FetchResponse> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            match self.entries.lock().await.get(key) {
                Some((duration, files)) => Ok(FetchResponse {
                    status: self.flavor,
                    files: files.clone(),
                    duration: *duration,
                }),
                None => Ok(FetchResponse::miss()),
            }
        }

        async fn exists(&self, key: &str) -> ItemStatus {
            if self.entries.lock().await.contains_key(key) {
                self.flavor
            } else {
                ItemStatus::default()
            }
        }

        async fn clean(&self, _root: &Path) {}

        async fn clean_all(&self) {
            self.entries.lock().await.clear();
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }

        fn name(&self) -> &'static str {
            self.label
        }
    }

    #[tokio::test]
    async fn test_remote_hit_is_promoted_to_local() {
        let cache_dir = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("dist")).unwrap();
        fs::write(root.path().join("dist/out.js"), b"bundle").unwrap();
        let files = vec![PathBuf::from("dist/out.js")];

        let local = Arc::new(LocalCache::new(cache_dir.path()).unwrap());
        let remote = Arc::new(MemBackend::remote_like());
        remote
            .seed("k1", Duration::from_millis(9), files.clone())
            .await;

        let mux = CacheMultiplexer::new(vec![local.clone(), remote.clone()]);

        // First fetch hits remote and reports the promotion
        let response = mux.fetch(root.path(), "k1", &files).await.unwrap();
        assert!(response.status.remote);
        assert!(response.status.local, "backfilled local flag should be set");
        assert_eq!(response.duration, Duration::from_millis(9));

        // Second fetch is served by the local backend without asking remote
        let before = remote.fetches.load(Ordering::SeqCst);
        let dst = TempDir::new().unwrap();
        let response = mux.fetch(dst.path(), "k1", &files).await.unwrap();
        assert!(response.status.local);
        assert_eq!(remote.fetches.load(Ordering::SeqCst), before);
        assert_eq!(fs::read(dst.path().join("dist/out.js")).unwrap(), b"bundle");
    }

    #[tokio::test]
    async fn test_first_hit_wins_in_order() {
        let first = Arc::new(MemBackend::local_like());
        let second = Arc::new(MemBackend::remote_like());
        first.seed("k", Duration::ZERO, vec![]).await;
        second.seed("k", Duration::ZERO, vec![]).await;

        let mux = CacheMultiplexer::new(vec![first, second.clone()]);
        let root = TempDir::new().unwrap();
        let response = mux.fetch(root.path(), "k", &[]).await.unwrap();

        assert!(response.status.local);
        assert!(!response.status.remote);
        assert_eq!(second.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_put_fans_out_to_all_backends() {
        let a = Arc::new(MemBackend::local_like());
        let b = Arc::new(MemBackend::remote_like());
        let mux = CacheMultiplexer::new(vec![a.clone(), b.clone()]);

        let root = TempDir::new().unwrap();
        mux.put(root.path(), "k", Duration::ZERO, &[]).await.unwrap();

        assert_eq!(a.puts.load(Ordering::SeqCst), 1);
        assert_eq!(b.puts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_put_failure_does_not_short_circuit() {
        let failing = Arc::new(MemBackend {
            fail_puts: true,
            ..MemBackend::local_like()
        });
        let healthy = Arc::new(MemBackend::remote_like());
        let mux = CacheMultiplexer::new(vec![failing.clone(), healthy.clone()]);

        let root = TempDir::new().unwrap();
        let result = mux.put(root.path(), "k", Duration::ZERO, &[]).await;

        assert!(result.is_err());
        // The healthy backend was still written
        assert_eq!(healthy.puts.load(Ordering::SeqCst), 1);
        assert!(mux.exists("k").await.remote);
    }

    #[tokio::test]
    async fn test_exists_is_union_of_backends() {
        let local = Arc::new(MemBackend::local_like());
        let remote = Arc::new(MemBackend::remote_like());
        remote.seed("k", Duration::ZERO, vec![]).await;
        let mux = CacheMultiplexer::new(vec![local.clone(), remote]);

        let status = mux.exists("k").await;
        assert!(!status.local);
        assert!(status.remote);

        local.seed("k", Duration::ZERO, vec![]).await;
        let status = mux.exists("k").await;
        assert!(status.local);
        assert!(status.remote);
    }

    #[tokio::test]
    async fn test_miss_everywhere_is_not_an_error() {
        let mux = CacheMultiplexer::new(vec![
            Arc::new(MemBackend::local_like()) as Arc<dyn CacheBackend>,
            Arc::new(NoopCache::new()),
        ]);
        let root = TempDir::new().unwrap();

        let response = mux.fetch(root.path(), "nope", &[]).await.unwrap();
        assert!(response.is_miss());
        assert_eq!(mux.exists("nope").await, ItemStatus::default());
    }

    #[tokio::test]
    async fn test_unreachable_remote_degrades_to_local_only() {
        struct DeadStore;

        #[async_trait]
        impl crate::ArtifactClient for DeadStore {
            async fn upload(&self, _key: &str, _duration_ms: u64, _body: Vec<u8>) -> Result<()> {
                Err(Error::remote("store unreachable"))
            }

            async fn download(&self, _key: &str) -> Result<Option<(u64, Vec<u8>)>> {
                Err(Error::remote("store unreachable"))
            }

            async fn exists(&self, _key: &str) -> Result<bool> {
                Err(Error::remote("store unreachable"))
            }

            async fn delete(&self, _scope: Option<&str>) -> Result<()> {
                Err(Error::remote("store unreachable"))
            }
        }

        let cache_dir = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("out.txt"), b"payload").unwrap();
        let files = vec![PathBuf::from("out.txt")];

        let local = Arc::new(LocalCache::new(cache_dir.path()).unwrap());
        let remote = Arc::new(crate::RemoteCache::new(
            Arc::new(DeadStore),
            4,
            Duration::from_millis(100),
        ));
        let mux = CacheMultiplexer::new(vec![local, remote]);

        // Every operation succeeds on the local backend alone
        mux.put(root.path(), "k", Duration::ZERO, &files)
            .await
            .unwrap();
        assert!(mux.exists("k").await.local);

        let dst = TempDir::new().unwrap();
        let response = mux.fetch(dst.path(), "k", &files).await.unwrap();
        assert!(response.status.local);
        assert!(!response.status.remote);

        let response = mux.fetch(dst.path(), "absent", &[]).await.unwrap();
        assert!(response.is_miss());
        mux.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_fans_out() {
        let a = Arc::new(MemBackend::local_like());
        let b = Arc::new(MemBackend::remote_like());
        let mux = CacheMultiplexer::new(vec![a.clone(), b.clone()]);

        mux.shutdown().await;
        assert_eq!(a.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(b.shutdowns.load(Ordering::SeqCst), 1);
    }
}
