//! Client configuration.

use std::time::Duration;

/// Storage key under which the active job handle is persisted.
pub const ACTIVE_JOB_KEY: &str = "storyweave_active_job";

/// Endpoint configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development. In
/// production, override via environment variables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base HTTP URL of the job service (default: `http://localhost:3001`).
    pub backend_url: String,
    /// Base WebSocket URL of the job event channel (default: `ws://localhost:3001`).
    pub ws_url: String,
}

impl ClientConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var       | Default                 |
    /// |---------------|-------------------------|
    /// | `BACKEND_URL` | `http://localhost:3001` |
    /// | `WS_URL`      | `ws://localhost:3001`   |
    pub fn from_env() -> Self {
        let backend_url =
            std::env::var("BACKEND_URL").unwrap_or_else(|_| "http://localhost:3001".into());
        let ws_url = std::env::var("WS_URL").unwrap_or_else(|_| "ws://localhost:3001".into());

        Self {
            backend_url,
            ws_url,
        }
    }
}

/// Tunable parameters for the job tracking state machine.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// How long to wait for the first push event before promoting the
    /// job to polling.
    pub watchdog: Duration,
    /// Delay between status polls during pull fallback.
    pub poll_interval: Duration,
    /// Hard wall-clock budget for the polling fallback. Exceeding it
    /// fails the job with a synthetic timeout error.
    pub poll_budget: Duration,
    /// Persisted job handles older than this are treated as abandoned.
    pub handle_max_age: chrono::Duration,
    /// Key the job handle is stored under.
    pub storage_key: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            watchdog: Duration::from_secs(12),
            poll_interval: Duration::from_secs(2),
            poll_budget: Duration::from_secs(300),
            handle_max_age: chrono::Duration::minutes(10),
            storage_key: ACTIVE_JOB_KEY.to_string(),
        }
    }
}
