//! Network-backed cache over the shared artifact store
//!
//! The remote store is an unreliable dependency that must never stall or
//! break a build: uploads are queued and performed by a background worker,
//! and every transport fault on the read path is downgraded to a miss. The
//! only errors this backend surfaces are genuine local faults, such as being
//! unable to write a downloaded archive to disk.

use crate::archive;
use crate::backend::{CacheBackend, FetchResponse, ItemStatus};
use crate::local::root_scope;
use crate::Result;
use async_trait::async_trait;
use relay_api_client::ApiClient;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Transport seam between the remote backend and the artifact store
///
/// Implemented by [`relay_api_client::ApiClient`] in production and by
/// recording doubles in tests.
#[async_trait]
pub trait ArtifactClient: Send + Sync {
    /// Upload an archived entry under `key`, tagged with the task duration.
    async fn upload(&self, key: &str, duration_ms: u64, body: Vec<u8>) -> Result<()>;

    /// Download the entry stored under `key`; `None` means not found.
    async fn download(&self, key: &str) -> Result<Option<(u64, Vec<u8>)>>;

    /// Probe for the entry's existence without downloading it.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete entries, optionally restricted to an origin scope.
    async fn delete(&self, scope: Option<&str>) -> Result<()>;
}

#[async_trait]
impl ArtifactClient for ApiClient {
    async fn upload(&self, key: &str, duration_ms: u64, body: Vec<u8>) -> Result<()> {
        self.put_artifact(key, duration_ms, body).await?;
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Option<(u64, Vec<u8>)>> {
        let response = self.fetch_artifact(key).await?;
        Ok(response.map(|r| (r.duration_ms, r.body)))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.artifact_exists(key).await?)
    }

    async fn delete(&self, scope: Option<&str>) -> Result<()> {
        self.delete_artifacts(scope).await?;
        Ok(())
    }
}

struct UploadJob {
    key: String,
    duration_ms: u64,
    body: Vec<u8>,
}

/// Cache backend backed by the remote artifact store
pub struct RemoteCache {
    client: Arc<dyn ArtifactClient>,
    // Dropped on shutdown to close the queue; puts afterwards are no-ops.
    queue: Mutex<Option<mpsc::Sender<UploadJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown_grace: Duration,
}

impl RemoteCache {
    /// Create a remote backend with a bounded upload queue.
    ///
    /// Spawns the upload worker, so this must be called within a tokio
    /// runtime. `shutdown_grace` bounds how long [`CacheBackend::shutdown`]
    /// waits for queued uploads before abandoning them.
    #[must_use]
    pub fn new(
        client: Arc<dyn ArtifactClient>,
        queue_capacity: usize,
        shutdown_grace: Duration,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<UploadJob>(queue_capacity.max(1));
        let worker_client = client.clone();
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match worker_client
                    .upload(&job.key, job.duration_ms, job.body)
                    .await
                {
                    Ok(()) => debug!(key = %job.key, "Uploaded cache entry"),
                    Err(e) => warn!(key = %job.key, error = %e, "Cache upload failed"),
                }
            }
        });

        Self {
            client,
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            shutdown_grace,
        }
    }

    fn enqueue(&self, job: UploadJob) {
        #[allow(clippy::unwrap_used)] // mutex poisoning only after a panic
        let queue = self.queue.lock().unwrap();
        let Some(tx) = queue.as_ref() else {
            debug!(key = %job.key, "Cache shut down, dropping upload");
            return;
        };
        match tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                warn!(key = %job.key, "Upload queue full, dropping cache upload");
            }
            Err(TrySendError::Closed(job)) => {
                debug!(key = %job.key, "Upload queue closed, dropping cache upload");
            }
        }
    }

    /// True if every expected path is covered by an archived file, either
    /// directly or as a directory prefix.
    fn covers(archived: &[PathBuf], expected: &[PathBuf]) -> bool {
        expected
            .iter()
            .all(|want| archived.iter().any(|have| have == want || have.starts_with(want)))
    }
}

#[async_trait]
impl CacheBackend for RemoteCache {
    async fn put(
        &self,
        root: &Path,
        key: &str,
        duration: Duration,
        files: &[PathBuf],
    ) -> Result<()> {
        // Capture contents now; the files may change after we return.
        let body = archive::pack_files(root, files)?;
        let job = UploadJob {
            key: key.to_string(),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            body,
        };
        // Queued, not uploaded: a slow or unreachable store must not stall
        // the build, and queue failures are swallowed for the same reason.
        self.enqueue(job);
        Ok(())
    }

    async fn fetch(
        &self,
        root: &Path,
        key: &str,
        expected: &[PathBuf],
    ) -> Result<FetchResponse> {
        let (duration_ms, body) = match self.client.download(key).await {
            Ok(Some(artifact)) => artifact,
            Ok(None) => return Ok(FetchResponse::miss()),
            Err(e) => {
                warn!(key, error = %e, "Remote cache unavailable, treating as miss");
                return Ok(FetchResponse::miss());
            }
        };

        // Validate the archive against the expected output set before
        // touching the workspace; a mismatched entry must not half-restore.
        let archived = match archive::list(&body) {
            Ok(archived) => archived,
            Err(e) => {
                warn!(key, error = %e, "Remote cache entry is not a valid archive");
                return Ok(FetchResponse::miss());
            }
        };
        if !Self::covers(&archived, expected) {
            warn!(key, "Remote cache entry is missing expected files, treating as miss");
            return Ok(FetchResponse::miss());
        }

        // From here on, failures are local I/O faults and do surface.
        let files = archive::unpack_into(root, &body)?;
        debug!(key, files = files.len(), "Restored entry from remote cache");
        Ok(FetchResponse {
            status: ItemStatus {
                local: false,
                remote: true,
            },
            files,
            duration: Duration::from_millis(duration_ms),
        })
    }

    async fn exists(&self, key: &str) -> ItemStatus {
        match self.client.exists(key).await {
            Ok(found) => ItemStatus {
                local: false,
                remote: found,
            },
            Err(e) => {
                debug!(key, error = %e, "Remote existence probe failed, treating as miss");
                ItemStatus::default()
            }
        }
    }

    async fn clean(&self, root: &Path) {
        let scope = root_scope(root);
        let client = self.client.clone();
        // Fire and forget; deletion must not block the caller.
        tokio::spawn(async move {
            if let Err(e) = client.delete(Some(&scope)).await {
                warn!(scope, error = %e, "Remote cache clean failed");
            }
        });
    }

    async fn clean_all(&self) {
        let client = self.client.clone();
        tokio::spawn(async move {
            if let Err(e) = client.delete(None).await {
                warn!(error = %e, "Remote cache purge failed");
            }
        });
    }

    async fn shutdown(&self) {
        // Closing the sender lets the worker drain what is already queued
        // and then exit; the grace period bounds how long we wait for it.
        let sender = {
            #[allow(clippy::unwrap_used)]
            let mut queue = self.queue.lock().unwrap();
            queue.take()
        };
        drop(sender);

        let worker = {
            #[allow(clippy::unwrap_used)]
            let mut worker = self.worker.lock().unwrap();
            worker.take()
        };
        let Some(worker) = worker else {
            return; // already shut down
        };

        let abort = worker.abort_handle();
        match tokio::time::timeout(self.shutdown_grace, worker).await {
            Ok(_) => debug!("Upload queue drained"),
            Err(_) => {
                abort.abort();
                warn!(
                    grace_ms = self.shutdown_grace.as_millis(),
                    "Shutdown grace period elapsed, abandoning queued uploads"
                );
            }
        }
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}
