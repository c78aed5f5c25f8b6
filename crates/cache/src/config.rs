//! Cache configuration and backend construction
//!
//! The surrounding orchestrator owns parsing; this module consumes plain
//! config structs and turns them into a single `Arc<dyn CacheBackend>`.
//! Construction never fails outward: anything that cannot be built is
//! logged and skipped, falling back to the no-op backend so calling code
//! needs no absent-cache special case.

use crate::backend::CacheBackend;
use crate::local::LocalCache;
use crate::multiplexer::CacheMultiplexer;
use crate::noop::NoopCache;
use crate::remote::RemoteCache;
use crate::{Error, Result};
use relay_api_client::ApiClient;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Top-level cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Global switch; false selects the no-op backend
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Local filesystem backend settings; `None` disables it
    #[serde(default = "default_local")]
    pub local: Option<LocalCacheConfig>,

    /// Remote artifact store settings; `None` disables remote caching
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteCacheConfig>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            local: default_local(),
            remote: None,
        }
    }
}

/// Local filesystem backend settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LocalCacheConfig {
    /// Cache directory override; resolved via the fallback chain when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

/// Remote artifact store settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteCacheConfig {
    /// Artifact store endpoint (e.g. "https://cache.example.com")
    pub endpoint: String,

    /// Bearer token supplied by the caller
    pub token: String,

    /// Team/organization identifier scoping all artifacts
    pub team_id: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Bounded capacity of the asynchronous upload queue
    #[serde(default = "default_upload_queue_capacity")]
    pub upload_queue_capacity: usize,

    /// How long shutdown waits for queued uploads, in milliseconds
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

/// Which backends ended up active
///
/// Kept separate from [`ItemStatus`](crate::ItemStatus) so a disabled cache
/// is never mistaken for a cache miss when the orchestrator reports state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheState {
    /// Caching is off (by configuration or because nothing could be built)
    Disabled,
    /// Only the filesystem backend is active
    LocalOnly,
    /// Only the remote backend is active
    RemoteOnly,
    /// Filesystem and remote backends are composed
    LocalAndRemote,
}

/// Construct the cache described by `config`.
///
/// Returns the backend handle plus the state actually achieved, which may
/// be more degraded than requested (e.g. remote skipped because the client
/// could not be built). Must be called within a tokio runtime when a remote
/// backend is configured, since its upload worker is spawned here.
pub fn new_cache(config: &CacheConfig) -> (Arc<dyn CacheBackend>, CacheState) {
    if !config.enabled {
        debug!("Caching disabled by configuration");
        return (Arc::new(NoopCache::new()), CacheState::Disabled);
    }

    let local = config.local.as_ref().and_then(|local_cfg| {
        match build_local(local_cfg) {
            Ok(cache) => Some(Arc::new(cache)),
            Err(e) => {
                warn!(error = %e, "Failed to construct local cache, skipping");
                None
            }
        }
    });

    let remote = config.remote.as_ref().and_then(|remote_cfg| {
        match build_remote(remote_cfg) {
            Ok(cache) => Some(Arc::new(cache)),
            Err(e) => {
                warn!(error = %e, "Failed to construct remote cache, skipping");
                None
            }
        }
    });

    match (local, remote) {
        (Some(local), Some(remote)) => {
            let mux = CacheMultiplexer::new(vec![local, remote]);
            (Arc::new(mux), CacheState::LocalAndRemote)
        }
        (Some(local), None) => (local, CacheState::LocalOnly),
        (None, Some(remote)) => (remote, CacheState::RemoteOnly),
        (None, None) => {
            warn!("No cache backend could be constructed, caching disabled");
            (Arc::new(NoopCache::new()), CacheState::Disabled)
        }
    }
}

fn build_local(config: &LocalCacheConfig) -> Result<LocalCache> {
    let cache_dir = match &config.cache_dir {
        Some(dir) => dir.clone(),
        None => resolve_cache_dir()?,
    };
    debug!(cache_dir = %cache_dir.display(), "Using local cache directory");
    LocalCache::new(cache_dir)
}

fn build_remote(config: &RemoteCacheConfig) -> Result<RemoteCache> {
    if config.endpoint.trim().is_empty() {
        return Err(Error::configuration("remote cache endpoint is empty"));
    }
    if config.token.trim().is_empty() {
        return Err(Error::configuration("remote cache token is empty"));
    }
    let client = ApiClient::new(
        &config.endpoint,
        &config.token,
        &config.team_id,
        Some(config.timeout_secs),
        env!("CARGO_PKG_VERSION"),
    )
    .map_err(|e| Error::configuration(format!("Failed to build API client: {e}")))?;

    Ok(RemoteCache::new(
        Arc::new(client),
        config.upload_queue_capacity,
        Duration::from_millis(config.shutdown_grace_ms),
    ))
}

/// Inputs for determining the local cache directory
#[derive(Debug, Clone)]
struct CacheDirInputs {
    relay_cache_dir: Option<PathBuf>,
    xdg_cache_home: Option<PathBuf>,
    os_cache_dir: Option<PathBuf>,
    home_dir: Option<PathBuf>,
    temp_dir: PathBuf,
}

fn cache_dir_from_inputs(inputs: CacheDirInputs) -> Result<PathBuf> {
    // Resolution order (first writable wins):
    // 1) RELAY_CACHE_DIR (explicit override)
    // 2) XDG_CACHE_HOME/relay/cache
    // 3) OS cache dir/relay/cache
    // 4) ~/.relay/cache
    // 5) TMPDIR/relay/cache (fallback)
    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Some(dir) = inputs.relay_cache_dir.filter(|p| !p.as_os_str().is_empty()) {
        candidates.push(dir);
    }
    if let Some(xdg) = inputs.xdg_cache_home {
        candidates.push(xdg.join("relay/cache"));
    }
    if let Some(os_cache) = inputs.os_cache_dir {
        candidates.push(os_cache.join("relay/cache"));
    }
    if let Some(home) = inputs.home_dir {
        candidates.push(home.join(".relay/cache"));
    }
    candidates.push(inputs.temp_dir.join("relay/cache"));

    for path in candidates {
        // Nix build sandboxes set HOME to a read-only placeholder
        if path.starts_with("/homeless-shelter") {
            continue;
        }
        // If the path already exists, ensure it is writable; some CI
        // environments provide read-only cache directories under $HOME.
        if path.exists() {
            let probe = path.join(".write_probe");
            match std::fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&probe)
            {
                Ok(_) => {
                    let _ = std::fs::remove_file(&probe);
                    return Ok(path);
                }
                Err(_) => {
                    // Not writable, try next candidate
                    continue;
                }
            }
        }
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        }
        // Permission denied or other errors - try next candidate
    }
    Err(Error::configuration(
        "Failed to determine a writable cache directory",
    ))
}

fn resolve_cache_dir() -> Result<PathBuf> {
    let inputs = CacheDirInputs {
        relay_cache_dir: std::env::var("RELAY_CACHE_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from),
        xdg_cache_home: std::env::var("XDG_CACHE_HOME")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from),
        os_cache_dir: dirs::cache_dir(),
        home_dir: dirs::home_dir(),
        temp_dir: std::env::temp_dir(),
    };
    cache_dir_from_inputs(inputs)
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_local() -> Option<LocalCacheConfig> {
    Some(LocalCacheConfig::default())
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_upload_queue_capacity() -> usize {
    64
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}
