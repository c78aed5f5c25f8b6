//! Task output caching for relay
//!
//! This crate decides whether a task's work has already been done — locally
//! or on a shared remote store — restores its outputs without re-executing,
//! and persists fresh outputs so future runs with the same key skip
//! execution entirely.
//!
//! # Overview
//!
//! Every backend satisfies the same [`CacheBackend`] contract:
//!
//! - [`LocalCache`]: filesystem store, content-addressed by key, atomic
//!   stage-then-rename writes
//! - [`RemoteCache`]: client for the shared artifact store with a
//!   fire-and-forget upload queue
//! - [`CacheMultiplexer`]: composes backends with read-through fetches and
//!   write-through puts
//! - [`NoopCache`]: always-miss fallback when caching is disabled
//!
//! The scheduler calls `fetch` before running a task and `put` after; a
//! remote hit is promoted into the local cache for subsequent fast access.
//! Remote unavailability always degrades to local-only caching, never to a
//! build failure.
//!
//! Cache keys are opaque strings derived by the caller from task inputs;
//! this crate performs no hashing of its own and never interprets a key.

mod archive;
mod backend;
mod config;
mod error;
mod local;
mod multiplexer;
mod noop;
mod remote;

// Re-export error types at crate root
pub use error::{Error, Result};

// Re-export the contract and its implementations
pub use backend::{CacheBackend, FetchResponse, ItemStatus};
pub use config::{
    CacheConfig, CacheState, LocalCacheConfig, RemoteCacheConfig, new_cache,
};
pub use local::{LocalCache, root_scope};
pub use multiplexer::CacheMultiplexer;
pub use noop::NoopCache;
pub use remote::{ArtifactClient, RemoteCache};
