//! Always-miss backend used when caching is disabled or misconfigured
//!
//! Satisfies the full contract with successful no-ops so calling code never
//! needs an absent-cache special case.

use crate::backend::{CacheBackend, FetchResponse, ItemStatus};
use crate::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Backend that stores nothing and never hits
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

impl NoopCache {
    /// Create a new no-op backend
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CacheBackend for NoopCache {
    async fn put(
        &self,
        _root: &Path,
        _key: &str,
        _duration: Duration,
        _files: &[PathBuf],
    ) -> Result<()> {
        Ok(())
    }

    async fn fetch(
        &self,
        _root: &Path,
        _key: &str,
        _expected: &[PathBuf],
    ) -> Result<FetchResponse> {
        Ok(FetchResponse::miss())
    }

    async fn exists(&self, _key: &str) -> ItemStatus {
        ItemStatus::default()
    }

    async fn clean(&self, _root: &Path) {}

    async fn clean_all(&self) {}

    async fn shutdown(&self) {}

    fn name(&self) -> &'static str {
        "noop"
    }
}
