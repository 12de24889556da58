//! HTTP client for the job submission/status service.
//!
//! Wraps the job service REST endpoints (submission, status, queue
//! statistics, health) using [`reqwest`]. The [`JobService`] trait is
//! the seam the tracker depends on, so tests can substitute an
//! in-memory implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use storyweave_core::{GenerationRequest, JobSnapshot, QueueStats};

/// Response returned by the job service after accepting a generation
/// request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    /// Service-assigned identifier for the queued job.
    pub job_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Relative URL for point-in-time status queries.
    #[serde(default)]
    pub status_url: Option<String>,
}

/// Health report from the job service.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Errors from the job service HTTP layer.
#[derive(Debug, thiserror::Error)]
pub enum QueueApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The job service returned a non-2xx status code.
    #[error("Job service error ({status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },
}

/// Submission and status operations the tracker depends on.
#[async_trait]
pub trait JobService: Send + Sync {
    /// Submit a generation request, returning the assigned job id.
    async fn submit(&self, request: &GenerationRequest) -> Result<SubmitResponse, QueueApiError>;

    /// Fetch the current status of a job.
    async fn status(&self, job_id: &str) -> Result<JobSnapshot, QueueApiError>;
}

/// HTTP client for the job service.
pub struct QueueApi {
    client: reqwest::Client,
    backend_url: String,
}

impl QueueApi {
    /// Create a new API client for the job service.
    ///
    /// * `backend_url` - Base HTTP URL, e.g. `http://localhost:3001`.
    pub fn new(backend_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            backend_url,
        }
    }

    /// Create an API client reusing an existing [`reqwest::Client`]
    /// (useful for connection pooling with other HTTP callers).
    pub fn with_client(client: reqwest::Client, backend_url: String) -> Self {
        Self {
            client,
            backend_url,
        }
    }

    /// Retrieve aggregate queue counters.
    ///
    /// Sends a `GET /api/jobs/stats` request.
    pub async fn stats(&self) -> Result<QueueStats, QueueApiError> {
        let response = self
            .client
            .get(format!("{}/api/jobs/stats", self.backend_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Check whether the job service is reachable and healthy.
    ///
    /// Sends a `GET /api/jobs/health` request.
    pub async fn health(&self) -> Result<HealthStatus, QueueApiError> {
        let response = self
            .client
            .get(format!("{}/api/jobs/health", self.backend_url))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`QueueApiError::Api`]
    /// containing the status and body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, QueueApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(QueueApiError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, QueueApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl JobService for QueueApi {
    async fn submit(&self, request: &GenerationRequest) -> Result<SubmitResponse, QueueApiError> {
        let response = self
            .client
            .post(format!("{}/api/jobs/generate-image", self.backend_url))
            .json(request)
            .send()
            .await?;

        let submitted: SubmitResponse = Self::parse_response(response).await?;

        tracing::info!(
            job_id = %submitted.job_id,
            "Generation request accepted by job service",
        );

        Ok(submitted)
    }

    async fn status(&self, job_id: &str) -> Result<JobSnapshot, QueueApiError> {
        let response = self
            .client
            .get(format!("{}/api/jobs/{}/status", self.backend_url, job_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }
}
