//! HTTP client for the relay remote artifact store
//!
//! Artifacts are addressed by an opaque cache key and scoped to a team. The
//! store speaks plain HTTP:
//!
//! - `PUT /v8/artifacts/{key}` uploads an artifact body
//! - `GET /v8/artifacts/{key}` downloads one
//! - `HEAD /v8/artifacts/{key}` is a lightweight existence probe
//! - `DELETE /v8/artifacts` removes artifacts, optionally filtered by an
//!   origin scope
//! - `GET /v8/artifacts/status` reports whether caching is enabled for the
//!   team
//!
//! Every request carries a bearer token and the team identifier. Transient
//! failures (connect errors, timeouts, 429, most 5xx) are retried with
//! exponential backoff; everything else surfaces to the caller, which is
//! expected to degrade to local-only caching.

use std::env;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use crate::error::{Error, Result};
pub use crate::retry::RetryConfig;
use crate::retry::retry_with_backoff;

mod error;
mod retry;

/// Header carrying the task execution duration in milliseconds
pub const DURATION_HEADER: &str = "x-artifact-duration";

/// Whether remote caching is enabled for a team
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachingStatus {
    /// Remote caching has been switched off for the team
    Disabled,
    /// Remote caching is active
    Enabled,
    /// The team exceeded its storage quota
    OverLimit,
    /// Remote caching is temporarily paused by the store
    Paused,
}

/// Response body of the caching status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachingStatusResponse {
    /// Current caching status for the authenticated team
    pub status: CachingStatus,
}

/// A downloaded artifact
#[derive(Debug, Clone)]
pub struct ArtifactResponse {
    /// Task execution duration recorded at upload time, in milliseconds
    pub duration_ms: u64,
    /// Raw artifact bytes (a compressed archive of the cached files)
    pub body: Vec<u8>,
}

/// Client for the remote artifact store
///
/// Cheap to clone is not a goal; wrap in `Arc` to share across tasks.
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    team_id: String,
    user_agent: String,
    retry: RetryConfig,
}

impl ApiClient {
    /// Create a new client for `base_url`, authenticating as `token` within
    /// the team identified by `team_id`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the underlying HTTP client cannot be
    /// built (e.g. TLS backend initialization failure).
    pub fn new(
        base_url: impl AsRef<str>,
        token: impl Into<String>,
        team_id: impl Into<String>,
        timeout_secs: Option<u64>,
        version: &str,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout_secs {
            builder = builder.timeout(std::time::Duration::from_secs(timeout));
        }
        let client = builder
            .build()
            .map_err(|e| Error::configuration(format!("Failed to build HTTP client: {e}")))?;

        let user_agent = format!(
            "relay {} {} {}",
            version,
            env::consts::OS,
            env::consts::ARCH
        );

        Ok(Self {
            client,
            base_url: base_url.as_ref().trim_end_matches('/').to_string(),
            token: token.into(),
            team_id: team_id.into(),
            user_agent,
            retry: RetryConfig::default(),
        })
    }

    /// Override the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Upload an artifact body under `key`, tagged with the task duration.
    pub async fn put_artifact(&self, key: &str, duration_ms: u64, body: Vec<u8>) -> Result<()> {
        let url = self.artifact_url(key);
        let response = retry_with_backoff(&self.retry, "put_artifact", || {
            let request = self
                .client
                .put(&url)
                .query(&[("teamId", self.team_id.as_str())])
                .header("User-Agent", self.user_agent.clone())
                .header("Authorization", format!("Bearer {}", self.token))
                .header("Content-Type", "application/octet-stream")
                .header(DURATION_HEADER, duration_ms.to_string())
                .body(body.clone());
            async move { Self::check_server_status(request.send().await?, "put_artifact") }
        })
        .await?;

        if !response.status().is_success() {
            return Err(Error::unexpected_status(
                response.status().as_u16(),
                "put_artifact",
            ));
        }
        debug!(key, size = body.len(), "Uploaded artifact");
        Ok(())
    }

    /// Download the artifact stored under `key`.
    ///
    /// Returns `Ok(None)` when the store has no artifact for the key (404)
    /// or denies access to it (403) — both are cache misses to the caller.
    pub async fn fetch_artifact(&self, key: &str) -> Result<Option<ArtifactResponse>> {
        let url = self.artifact_url(key);
        let response = retry_with_backoff(&self.retry, "fetch_artifact", || {
            let request = self
                .client
                .get(&url)
                .query(&[("teamId", self.team_id.as_str())])
                .header("User-Agent", self.user_agent.clone())
                .header("Authorization", format!("Bearer {}", self.token));
            async move { Self::check_server_status(request.send().await?, "fetch_artifact") }
        })
        .await?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => return Ok(None),
            status if !status.is_success() => {
                return Err(Error::unexpected_status(status.as_u16(), "fetch_artifact"));
            }
            _ => {}
        }

        let duration_ms = parse_duration_header(&response);
        let body = response.bytes().await?.to_vec();
        debug!(key, size = body.len(), "Downloaded artifact");
        Ok(Some(ArtifactResponse { duration_ms, body }))
    }

    /// Check whether an artifact exists under `key` without downloading it.
    pub async fn artifact_exists(&self, key: &str) -> Result<bool> {
        let url = self.artifact_url(key);
        let response = retry_with_backoff(&self.retry, "artifact_exists", || {
            let request = self
                .client
                .head(&url)
                .query(&[("teamId", self.team_id.as_str())])
                .header("User-Agent", self.user_agent.clone())
                .header("Authorization", format!("Bearer {}", self.token));
            async move { Self::check_server_status(request.send().await?, "artifact_exists") }
        })
        .await?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(Error::unexpected_status(status.as_u16(), "artifact_exists")),
        }
    }

    /// Delete the team's artifacts, optionally restricted to an origin scope.
    ///
    /// `scope` is the opaque origin identifier artifacts were tagged with at
    /// upload time; `None` purges everything the team owns.
    pub async fn delete_artifacts(&self, scope: Option<&str>) -> Result<()> {
        let url = format!("{}/v8/artifacts", self.base_url);
        let response = retry_with_backoff(&self.retry, "delete_artifacts", || {
            let mut request = self
                .client
                .delete(&url)
                .query(&[("teamId", self.team_id.as_str())])
                .header("User-Agent", self.user_agent.clone())
                .header("Authorization", format!("Bearer {}", self.token));
            if let Some(scope) = scope {
                request = request.query(&[("scope", scope)]);
            }
            async move { Self::check_server_status(request.send().await?, "delete_artifacts") }
        })
        .await?;

        match response.status() {
            // Nothing to delete is a successful deletion
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            status => Err(Error::unexpected_status(status.as_u16(), "delete_artifacts")),
        }
    }

    /// Query whether remote caching is enabled for the team.
    pub async fn get_caching_status(&self) -> Result<CachingStatus> {
        let url = format!("{}/v8/artifacts/status", self.base_url);
        let response = retry_with_backoff(&self.retry, "get_caching_status", || {
            let request = self
                .client
                .get(&url)
                .query(&[("teamId", self.team_id.as_str())])
                .header("User-Agent", self.user_agent.clone())
                .header("Content-Type", "application/json")
                .header("Authorization", format!("Bearer {}", self.token));
            async move { Self::check_server_status(request.send().await?, "get_caching_status") }
        })
        .await?;

        if !response.status().is_success() {
            return Err(Error::unexpected_status(
                response.status().as_u16(),
                "get_caching_status",
            ));
        }

        let parsed: CachingStatusResponse = response.json().await?;
        Ok(parsed.status)
    }

    /// Map retryable server responses to errors so the backoff loop retries
    /// them; every other response passes through for the caller to inspect.
    fn check_server_status(
        response: reqwest::Response,
        operation: &str,
    ) -> Result<reqwest::Response> {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS
            || (status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED)
        {
            return Err(Error::unexpected_status(status.as_u16(), operation));
        }
        Ok(response)
    }

    fn artifact_url(&self, key: &str) -> String {
        format!("{}/v8/artifacts/{}", self.base_url, key)
    }
}

fn parse_duration_header(response: &reqwest::Response) -> u64 {
    response
        .headers()
        .get(DURATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client() -> ApiClient {
        ApiClient::new(
            "https://cache.example.com/",
            "tok_test",
            "team_demo",
            Some(30),
            "0.0.0-test",
        )
        .expect("client builds with default TLS settings")
    }

    #[test]
    fn test_artifact_url_strips_trailing_slash() {
        let client = test_client();
        assert_eq!(
            client.artifact_url("abc123"),
            "https://cache.example.com/v8/artifacts/abc123"
        );
    }

    #[test]
    fn test_caching_status_serde_snake_case() {
        let parsed: CachingStatusResponse =
            serde_json::from_str(r#"{"status":"over_limit"}"#).unwrap();
        assert_eq!(parsed.status, CachingStatus::OverLimit);

        let json = serde_json::to_string(&CachingStatusResponse {
            status: CachingStatus::Enabled,
        })
        .unwrap();
        assert_eq!(json, r#"{"status":"enabled"}"#);
    }

    #[test]
    fn test_user_agent_includes_version() {
        let client = test_client();
        assert!(client.user_agent.starts_with("relay 0.0.0-test"));
    }

    fn client_for(server: &MockServer) -> ApiClient {
        ApiClient::new(server.uri(), "tok_test", "team_demo", Some(5), "0.0.0-test")
            .expect("client builds against the mock server")
    }

    #[tokio::test]
    async fn test_fetch_artifact_miss_statuses_map_to_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v8/artifacts/absent"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v8/artifacts/forbidden"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        let client = client_for(&server);

        assert!(client.fetch_artifact("absent").await.unwrap().is_none());
        assert!(client.fetch_artifact("forbidden").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_artifact_hit_carries_duration_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v8/artifacts/hit"))
            .and(query_param("teamId", "team_demo"))
            .and(header("Authorization", "Bearer tok_test"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(DURATION_HEADER, "250")
                    .set_body_bytes(b"archive-bytes".to_vec()),
            )
            .mount(&server)
            .await;
        let client = client_for(&server);

        let artifact = client
            .fetch_artifact("hit")
            .await
            .unwrap()
            .expect("200 response is a hit");
        assert_eq!(artifact.duration_ms, 250);
        assert_eq!(artifact.body, b"archive-bytes");
    }

    #[tokio::test]
    async fn test_fetch_artifact_without_duration_header_defaults_to_zero() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v8/artifacts/bare"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()))
            .mount(&server)
            .await;
        let client = client_for(&server);

        let artifact = client.fetch_artifact("bare").await.unwrap().unwrap();
        assert_eq!(artifact.duration_ms, 0);
    }

    #[tokio::test]
    async fn test_artifact_exists_head_status_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/v8/artifacts/present"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/v8/artifacts/absent"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let client = client_for(&server);

        assert!(client.artifact_exists("present").await.unwrap());
        assert!(!client.artifact_exists("absent").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_artifacts_treats_not_found_as_success() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v8/artifacts"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let client = client_for(&server);

        client.delete_artifacts(Some("scope123")).await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_store_reports_transport_error() {
        // Port 1 is never listening; the connect error must surface as an
        // Error (for callers to downgrade to a miss), not hang or panic.
        let client = ApiClient::new("http://127.0.0.1:1", "tok", "team", Some(1), "0.0.0-test")
            .unwrap()
            .with_retry(RetryConfig {
                max_attempts: 1,
                initial_backoff_ms: 1,
                max_backoff_ms: 10,
                backoff_multiplier: 2.0,
            });

        let result = client.fetch_artifact("missing-key").await;
        assert!(result.is_err());
    }
}
