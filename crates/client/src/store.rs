//! Persistence for the active job handle.
//!
//! A [`JobHandle`] survives a client restart so tracking can resume.
//! At most one handle exists at a time; writes are last-writer-wins.
//! Handles past their expiry window are treated as abandoned and
//! discarded without further inquiry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use storyweave_core::GenerationRequest;

/// Minimal key-value interface over whatever storage the host
/// environment provides.
pub trait HandleStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// Durable record of an in-flight job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub job_id: String,
    pub submitted_at: DateTime<Utc>,
    /// The request that created the job, kept so a resumed UI can
    /// re-render what was being generated.
    pub request: GenerationRequest,
}

impl JobHandle {
    pub fn new(job_id: String, request: GenerationRequest) -> Self {
        Self {
            job_id,
            submitted_at: Utc::now(),
            request,
        }
    }

    /// Whether the handle is older than `max_age` at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        now - self.submitted_at > max_age
    }
}

/// Load the persisted handle, discarding it if missing, unparseable,
/// or older than `max_age`.
pub fn load_handle(
    store: &dyn HandleStore,
    key: &str,
    max_age: chrono::Duration,
) -> Option<JobHandle> {
    let raw = store.get(key)?;

    let handle: JobHandle = match serde_json::from_str(&raw) {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!(error = %e, "Discarding unparseable job handle");
            store.remove(key);
            return None;
        }
    };

    if handle.is_expired(Utc::now(), max_age) {
        tracing::info!(job_id = %handle.job_id, "Discarding expired job handle");
        store.remove(key);
        return None;
    }

    Some(handle)
}

/// Persist the handle, overwriting any previous one.
pub fn save_handle(store: &dyn HandleStore, key: &str, handle: &JobHandle) {
    match serde_json::to_string(handle) {
        Ok(json) => store.set(key, &json),
        Err(e) => tracing::error!(job_id = %handle.job_id, error = %e, "Failed to serialize job handle"),
    }
}

/// Remove the persisted handle. Removing an absent handle is a no-op.
pub fn clear_handle(store: &dyn HandleStore, key: &str) {
    store.remove(key);
}

/// Process-local store, the session-storage analogue. State is lost
/// when the process exits.
#[derive(Default)]
pub struct MemoryHandleStore {
    entries: Mutex<HashMap<String, String>>,
}

impl HandleStore for MemoryHandleStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

/// File-backed store so a restarted process can recover the handle.
/// Each key maps to `<dir>/<key>.json`.
pub struct FsHandleStore {
    dir: PathBuf,
}

impl FsHandleStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl HandleStore for FsHandleStore {
    fn get(&self, key: &str) -> Option<String> {
        std::fs::read_to_string(self.path_for(key)).ok()
    }

    fn set(&self, key: &str, value: &str) {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            tracing::error!(error = %e, "Failed to create handle store directory");
            return;
        }
        if let Err(e) = std::fs::write(self.path_for(key), value) {
            tracing::error!(error = %e, "Failed to write job handle");
        }
    }

    fn remove(&self, key: &str) {
        let path = self.path_for(key);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(error = %e, "Failed to remove job handle");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storyweave_core::PageKind;

    const KEY: &str = "test_active_job";

    fn handle() -> JobHandle {
        JobHandle::new(
            "job-1".into(),
            GenerationRequest::new("Mira", "aW1hZ2U=", PageKind::Cover),
        )
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryHandleStore::default();
        save_handle(&store, KEY, &handle());

        let loaded = load_handle(&store, KEY, chrono::Duration::minutes(10)).unwrap();
        assert_eq!(loaded.job_id, "job-1");
        assert_eq!(loaded.request.hero_name, "Mira");
    }

    #[test]
    fn missing_handle_loads_as_none() {
        let store = MemoryHandleStore::default();
        assert!(load_handle(&store, KEY, chrono::Duration::minutes(10)).is_none());
    }

    #[test]
    fn expired_handle_is_discarded() {
        let store = MemoryHandleStore::default();
        let mut old = handle();
        old.submitted_at = Utc::now() - chrono::Duration::minutes(11);
        save_handle(&store, KEY, &old);

        assert!(load_handle(&store, KEY, chrono::Duration::minutes(10)).is_none());
        // The expired record is removed, not just skipped.
        assert!(store.get(KEY).is_none());
    }

    #[test]
    fn fresh_handle_survives_expiry_check() {
        let recent = handle();
        assert!(!recent.is_expired(Utc::now(), chrono::Duration::minutes(10)));
    }

    #[test]
    fn corrupt_handle_is_discarded() {
        let store = MemoryHandleStore::default();
        store.set(KEY, "{not valid json");

        assert!(load_handle(&store, KEY, chrono::Duration::minutes(10)).is_none());
        assert!(store.get(KEY).is_none());
    }

    #[test]
    fn save_overwrites_previous_handle() {
        let store = MemoryHandleStore::default();
        save_handle(&store, KEY, &handle());

        let mut second = handle();
        second.job_id = "job-2".into();
        save_handle(&store, KEY, &second);

        let loaded = load_handle(&store, KEY, chrono::Duration::minutes(10)).unwrap();
        assert_eq!(loaded.job_id, "job-2");
    }

    #[test]
    fn remove_absent_handle_is_a_noop() {
        let store = MemoryHandleStore::default();
        clear_handle(&store, KEY);
        clear_handle(&store, KEY);
    }

    #[test]
    fn fs_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsHandleStore::new(dir.path());

        save_handle(&store, KEY, &handle());
        let loaded = load_handle(&store, KEY, chrono::Duration::minutes(10)).unwrap();
        assert_eq!(loaded.job_id, "job-1");

        clear_handle(&store, KEY);
        assert!(store.get(KEY).is_none());
    }
}
