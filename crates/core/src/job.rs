//! Image-generation job types shared across the platform.
//!
//! A job is created by submitting a [`GenerationRequest`] to the job
//! service and observed through [`JobSnapshot`] updates until it
//! reaches a terminal [`JobStatus`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Lifecycle state of a generation job.
///
/// `Completed` and `Failed` are terminal; a job enters a terminal
/// state exactly once and never leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted by the service, waiting for a worker.
    Queued,
    /// A worker is generating the image.
    Processing,
    /// The job finished and produced a result.
    Completed,
    /// The job failed with an error.
    Failed,
}

impl JobStatus {
    /// Whether this status is terminal (`Completed` or `Failed`).
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Point-in-time view of a generation job.
///
/// Produced by both the status endpoint and the real-time channel.
/// Progress values may arrive duplicated or out of order; the latest
/// received snapshot is treated as current truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    /// Service-assigned job identifier.
    pub job_id: String,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Completion percentage (0-100).
    pub progress: u8,
    /// Human-readable status text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Reference to the generated image, present once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Error description, present only when `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Free-form preview payload returned when the job completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview_data: Option<serde_json::Value>,
}

impl JobSnapshot {
    /// Initial snapshot for a freshly submitted job.
    pub fn queued(job_id: String, message: Option<String>) -> Self {
        Self {
            job_id,
            status: JobStatus::Queued,
            progress: 0,
            message,
            image_url: None,
            error: None,
            started_at: None,
            completed_at: None,
            preview_data: None,
        }
    }

    /// Synthetic failure snapshot used when the client gives up on a
    /// job (e.g. the polling budget ran out).
    pub fn failed(job_id: String, progress: u8, error: String) -> Self {
        Self {
            job_id,
            status: JobStatus::Failed,
            progress,
            message: Some("Job failed".to_string()),
            image_url: None,
            error: Some(error),
            started_at: None,
            completed_at: None,
            preview_data: None,
        }
    }
}

/// Which page of the book the generated image is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageKind {
    Cover,
    Interior,
    Dedication,
}

/// Request to generate one stylized picture-book image.
///
/// Serialized as the JSON body of the job submission call. The
/// uploaded photo travels inline as base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    /// Name of the child the book is personalized for.
    #[validate(length(min = 1, max = 80))]
    pub hero_name: String,
    /// Source photo, base64-encoded.
    #[validate(length(min = 1))]
    pub original_image_base64: String,
    /// Optional inpainting mask, base64-encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_base64: Option<String>,
    /// Which page this image belongs to.
    pub kind: PageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_group: Option<String>,
    /// Requested page count for the story.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Text rendered onto the cover, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_text: Option<String>,
    /// Placeholder substitutions applied to the story template.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub placeholders: HashMap<String, String>,
}

impl GenerationRequest {
    /// Create a request with only the required fields set.
    pub fn new(
        hero_name: impl Into<String>,
        original_image_base64: impl Into<String>,
        kind: PageKind,
    ) -> Self {
        Self {
            hero_name: hero_name.into(),
            original_image_base64: original_image_base64.into(),
            mask_base64: None,
            kind,
            theme_id: None,
            story_id: None,
            series_key: None,
            style_key: None,
            age_group: None,
            length: None,
            story_text: None,
            title: None,
            cover_text: None,
            placeholders: HashMap::new(),
        }
    }
}

/// Aggregate queue counters reported by the job service.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}
