//! Job tracking state machine.
//!
//! [`JobTracker`] owns the lifecycle of one active generation job at a
//! time: submit -> push tracking over the event channel -> polling
//! fallback -> terminal callback. A watchdog promotes a silent push
//! subscription to polling; a persisted handle lets a restarted client
//! resume tracking. Terminal delivery and teardown are idempotent:
//! whichever of {terminal event, explicit cancel} runs first takes the
//! tracking record out of the state under one lock, and the loser
//! observes nothing left to do.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use validator::Validate;

use storyweave_core::{GenerationRequest, JobSnapshot, JobStatus};

use crate::channel::{JobChannel, WsChannel};
use crate::config::{ClientConfig, TrackerConfig};
use crate::messages::ChannelMessage;
use crate::queue::{JobService, QueueApi, QueueApiError};
use crate::store::{self, HandleStore, JobHandle};

/// Errors surfaced by [`JobTracker::submit`].
///
/// Submission failures are not retried; no job is tracked and no
/// handle is persisted.
#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    /// The request failed validation before any network call.
    #[error("Invalid generation request: {0}")]
    Invalid(#[from] validator::ValidationErrors),

    /// The job service rejected the request or was unreachable.
    #[error("Job submission failed: {0}")]
    Service(#[from] QueueApiError),
}

/// Which terminal callback a finished job fires.
#[derive(Debug, Clone, Copy)]
enum Terminal {
    Completed,
    Failed,
}

/// Live tracking resources for the active job. Taken out of the state
/// exactly once on terminal/cancel, which makes teardown idempotent.
struct Tracking {
    job_id: String,
    /// Whether the push subscription went through (and must be torn
    /// down on terminal/cancel).
    subscribed: bool,
    /// Updated on every push event; the watchdog re-validates against
    /// this at fire time.
    last_progress_at: Instant,
    /// Set once the polling fallback has been started for this job.
    polling: bool,
    /// Cancels the watchdog and poll tasks for this job.
    cancel: CancellationToken,
}

struct TrackerState {
    /// Last known snapshot. Kept after the job finishes so callers can
    /// still read the final state.
    current: Option<JobSnapshot>,
    tracking: Option<Tracking>,
}

type JobCallback = Arc<dyn Fn(&JobSnapshot) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    progress: std::sync::Mutex<Vec<JobCallback>>,
    completed: std::sync::Mutex<Vec<JobCallback>>,
    failed: std::sync::Mutex<Vec<JobCallback>>,
}

impl Callbacks {
    /// Invoke every registered callback with the lock released, so a
    /// callback may register further callbacks without deadlocking.
    fn fire(list: &std::sync::Mutex<Vec<JobCallback>>, snapshot: &JobSnapshot) {
        let callbacks: Vec<JobCallback> =
            list.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for callback in callbacks {
            callback(snapshot);
        }
    }
}

struct TrackerInner {
    service: Arc<dyn JobService>,
    channel: Arc<dyn JobChannel>,
    store: Arc<dyn HandleStore>,
    config: TrackerConfig,
    state: Mutex<TrackerState>,
    callbacks: Callbacks,
    /// Set once `resume` has run; recovery happens at most once per
    /// tracker lifetime.
    resumed: AtomicBool,
    /// Master token. Child tokens drive per-job tasks, so `shutdown`
    /// stops everything at once.
    cancel: CancellationToken,
}

/// Tracks one image-generation job from submission to terminal state.
///
/// Cheap to clone; all clones share state. Spawns an event pump task
/// on construction that consumes the channel's broadcast stream until
/// [`shutdown`](Self::shutdown).
#[derive(Clone)]
pub struct JobTracker {
    inner: Arc<TrackerInner>,
}

impl JobTracker {
    pub fn new(
        service: Arc<dyn JobService>,
        channel: Arc<dyn JobChannel>,
        store: Arc<dyn HandleStore>,
        config: TrackerConfig,
    ) -> Self {
        let tracker = Self {
            inner: Arc::new(TrackerInner {
                service,
                channel,
                store,
                config,
                state: Mutex::new(TrackerState {
                    current: None,
                    tracking: None,
                }),
                callbacks: Callbacks::default(),
                resumed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        };
        tracker.spawn_event_pump();
        tracker
    }

    /// Build a tracker wired to the real HTTP and WebSocket transports.
    pub fn with_endpoints(
        endpoints: &ClientConfig,
        store: Arc<dyn HandleStore>,
        config: TrackerConfig,
    ) -> Self {
        let service = Arc::new(QueueApi::new(endpoints.backend_url.clone()));
        let channel = Arc::new(WsChannel::new(endpoints.ws_url.clone()));
        Self::new(service, channel, store, config)
    }

    // ---- callback registration ----

    /// Register a callback for progress updates of the tracked job.
    pub fn on_progress(&self, callback: impl Fn(&JobSnapshot) + Send + Sync + 'static) {
        self.inner
            .callbacks
            .progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(callback));
    }

    /// Register a callback for successful completion. Fires at most
    /// once per tracked job, mutually exclusive with `on_failed`.
    pub fn on_completed(&self, callback: impl Fn(&JobSnapshot) + Send + Sync + 'static) {
        self.inner
            .callbacks
            .completed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(callback));
    }

    /// Register a callback for failure (reported by the service or
    /// synthesized on poll timeout). Fires at most once per tracked
    /// job, mutually exclusive with `on_completed`.
    pub fn on_failed(&self, callback: impl Fn(&JobSnapshot) + Send + Sync + 'static) {
        self.inner
            .callbacks
            .failed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(callback));
    }

    // ---- public operations ----

    /// Submit a generation request and begin tracking the new job.
    ///
    /// Tracking of any previous job is torn down first (without
    /// cancelling it server-side). On success the job handle is
    /// persisted and push tracking is set up, falling back to polling
    /// if the channel is unavailable.
    pub async fn submit(&self, request: GenerationRequest) -> Result<String, SubmissionError> {
        request.validate()?;

        // Stop listening to the previous job before starting a new one.
        // The old snapshot goes too: if the new submission fails, a
        // non-terminal snapshot for a torn-down job must not linger.
        let previous = {
            let mut guard = self.inner.state.lock().await;
            guard.current = None;
            guard.tracking.take()
        };
        if let Some(previous) = previous {
            tracing::info!(job_id = %previous.job_id, "Superseding previously tracked job");
            previous.cancel.cancel();
            if previous.subscribed {
                let _ = self
                    .inner
                    .channel
                    .unsubscribe_from_job(&previous.job_id)
                    .await;
            }
        }

        let response = self.inner.service.submit(&request).await.inspect_err(|e| {
            tracing::error!(error = %e, "Job submission failed");
        })?;
        let job_id = response.job_id;
        tracing::info!(job_id = %job_id, "Generation job submitted");

        let handle = JobHandle::new(job_id.clone(), request);
        store::save_handle(
            self.inner.store.as_ref(),
            &self.inner.config.storage_key,
            &handle,
        );

        let snapshot = JobSnapshot::queued(job_id.clone(), response.message);
        {
            let mut guard = self.inner.state.lock().await;
            guard.current = Some(snapshot);
            // A concurrent resume may have installed tracking while the
            // submission call was in flight; the fresh submit wins.
            if let Some(old) = guard.tracking.replace(Tracking {
                job_id: job_id.clone(),
                subscribed: false,
                last_progress_at: Instant::now(),
                polling: false,
                cancel: self.inner.cancel.child_token(),
            }) {
                old.cancel.cancel();
            }
        }

        self.start_push_tracking(&job_id).await;
        Ok(job_id)
    }

    /// Tear down any active tracking without notifying the server.
    ///
    /// Idempotent: calling it twice, or after a terminal event already
    /// fired, produces no additional side effects.
    pub async fn cancel(&self) {
        let tracking = {
            let mut guard = self.inner.state.lock().await;
            guard.current = None;
            guard.tracking.take()
        };
        if let Some(tracking) = tracking {
            tracing::info!(job_id = %tracking.job_id, "Cancelling job tracking");
            self.teardown(tracking).await;
        }
    }

    /// Last known snapshot of the tracked (or most recently finished)
    /// job.
    pub async fn current_job(&self) -> Option<JobSnapshot> {
        self.inner.state.lock().await.current.clone()
    }

    /// Whether a job is currently being tracked toward a terminal
    /// state.
    pub async fn is_generating(&self) -> bool {
        self.inner.state.lock().await.tracking.is_some()
    }

    /// Resume tracking of a persisted job after a restart.
    ///
    /// Runs at most once per tracker lifetime. The handle is discarded
    /// when absent, expired, or when the service reports the job
    /// already finished (no callbacks fire retroactively). Returns the
    /// fetched snapshot when tracking was resumed.
    pub async fn resume(&self) -> Option<JobSnapshot> {
        if self.inner.resumed.swap(true, Ordering::SeqCst) {
            return None;
        }

        let handle = store::load_handle(
            self.inner.store.as_ref(),
            &self.inner.config.storage_key,
            self.inner.config.handle_max_age,
        )?;
        tracing::info!(job_id = %handle.job_id, "Found persisted job, attempting to resume");

        let snapshot = match self.inner.service.status(&handle.job_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(
                    job_id = %handle.job_id,
                    error = %e,
                    "Failed to query persisted job status, discarding handle",
                );
                store::clear_handle(self.inner.store.as_ref(), &self.inner.config.storage_key);
                return None;
            }
        };

        if snapshot.status.is_terminal() {
            tracing::info!(
                job_id = %handle.job_id,
                status = ?snapshot.status,
                "Persisted job already finished, discarding handle",
            );
            store::clear_handle(self.inner.store.as_ref(), &self.inner.config.storage_key);
            return None;
        }

        {
            let mut guard = self.inner.state.lock().await;
            if guard.tracking.is_some() {
                // A fresh submit won the race; leave its job alone.
                return None;
            }
            guard.current = Some(snapshot.clone());
            guard.tracking = Some(Tracking {
                job_id: handle.job_id.clone(),
                subscribed: false,
                last_progress_at: Instant::now(),
                polling: false,
                cancel: self.inner.cancel.child_token(),
            });
        }

        self.start_push_tracking(&handle.job_id).await;
        tracing::info!(job_id = %handle.job_id, "Resumed tracking of persisted job");
        Some(snapshot)
    }

    /// Stop the event pump and all per-job tasks.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let tracking = self.inner.state.lock().await.tracking.take();
        if let Some(tracking) = tracking {
            if tracking.subscribed {
                let _ = self
                    .inner
                    .channel
                    .unsubscribe_from_job(&tracking.job_id)
                    .await;
            }
        }
        tracing::info!("Job tracker shut down");
    }

    // ---- event pump ----

    fn spawn_event_pump(&self) {
        let tracker = self.clone();
        let mut events = tracker.inner.channel.events();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tracker.inner.cancel.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(message) => tracker.handle_channel_message(message).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Job event receiver lagged, events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
    }

    async fn handle_channel_message(&self, message: ChannelMessage) {
        match message {
            ChannelMessage::JobProgress { progress } => self.apply_progress(progress).await,
            ChannelMessage::JobCompleted { progress } => {
                self.finish_job(progress, Terminal::Completed).await
            }
            ChannelMessage::JobFailed { progress } => {
                self.finish_job(progress, Terminal::Failed).await
            }
            ChannelMessage::ConnectionConfirmed { .. } => {
                tracing::debug!("Job event channel connection confirmed");
            }
        }
    }

    // ---- state transitions ----

    /// Record a progress snapshot and fire `on_progress`, unless the
    /// event is for a job that is no longer tracked.
    async fn apply_progress(&self, snapshot: JobSnapshot) {
        {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            match state.tracking.as_mut() {
                Some(tracking) if tracking.job_id == snapshot.job_id => {
                    tracking.last_progress_at = Instant::now();
                    state.current = Some(snapshot.clone());
                }
                _ => {
                    tracing::debug!(
                        job_id = %snapshot.job_id,
                        "Dropping event for job no longer tracked",
                    );
                    return;
                }
            }
        }
        Callbacks::fire(&self.inner.callbacks.progress, &snapshot);
    }

    /// Deliver a terminal snapshot: record it, tear tracking down, and
    /// fire exactly one terminal callback. Duplicate or stale terminal
    /// events observe no tracking record and do nothing.
    async fn finish_job(&self, snapshot: JobSnapshot, terminal: Terminal) {
        let tracking = {
            let mut guard = self.inner.state.lock().await;
            let state = &mut *guard;
            let Some(tracking) = state
                .tracking
                .take_if(|tracking| tracking.job_id == snapshot.job_id)
            else {
                tracing::debug!(
                    job_id = %snapshot.job_id,
                    "Dropping terminal event for job no longer tracked",
                );
                return;
            };
            state.current = Some(snapshot.clone());
            tracking
        };

        self.teardown(tracking).await;

        match terminal {
            Terminal::Completed => {
                tracing::info!(job_id = %snapshot.job_id, "Generation job completed");
                Callbacks::fire(&self.inner.callbacks.completed, &snapshot);
            }
            Terminal::Failed => {
                tracing::warn!(
                    job_id = %snapshot.job_id,
                    error = ?snapshot.error,
                    "Generation job failed",
                );
                Callbacks::fire(&self.inner.callbacks.failed, &snapshot);
            }
        }
    }

    /// Release the resources of a tracking record: stop its tasks,
    /// leave its topic, clear the persisted handle.
    async fn teardown(&self, tracking: Tracking) {
        tracking.cancel.cancel();
        if tracking.subscribed {
            if let Err(e) = self
                .inner
                .channel
                .unsubscribe_from_job(&tracking.job_id)
                .await
            {
                tracing::debug!(
                    job_id = %tracking.job_id,
                    error = %e,
                    "Unsubscribe failed during teardown",
                );
            }
        }
        store::clear_handle(self.inner.store.as_ref(), &self.inner.config.storage_key);
    }

    // ---- push setup, watchdog, polling ----

    /// Connect and subscribe the push channel for a job. Any failure
    /// falls back to polling; push problems are never surfaced to the
    /// caller directly.
    async fn start_push_tracking(&self, job_id: &str) {
        if !self.inner.channel.is_connected() {
            if let Err(e) = self.inner.channel.connect().await {
                tracing::warn!(
                    job_id = %job_id,
                    error = %e,
                    "Channel connect failed, falling back to polling",
                );
            }
        }

        let mut push_ready = false;
        if self.inner.channel.is_connected() {
            match self.inner.channel.subscribe_to_job(job_id).await {
                Ok(()) => push_ready = true,
                Err(e) => {
                    tracing::warn!(
                        job_id = %job_id,
                        error = %e,
                        "Job subscription failed, falling back to polling",
                    );
                }
            }
        }

        if push_ready {
            self.mark_subscribed(job_id).await;
            self.spawn_watchdog(job_id).await;
        } else {
            self.start_polling(job_id).await;
        }
    }

    async fn mark_subscribed(&self, job_id: &str) {
        let mut guard = self.inner.state.lock().await;
        if let Some(tracking) = guard.tracking.as_mut() {
            if tracking.job_id == job_id {
                tracking.subscribed = true;
                tracking.last_progress_at = Instant::now();
            }
        }
    }

    /// Arm the one-shot promotion timer: if no push event arrives
    /// within the watchdog window, start polling as backup.
    async fn spawn_watchdog(&self, job_id: &str) {
        let token = {
            let guard = self.inner.state.lock().await;
            match guard.tracking.as_ref() {
                Some(tracking) if tracking.job_id == job_id => tracking.cancel.clone(),
                _ => return,
            }
        };

        let tracker = self.clone();
        let job_id = job_id.to_string();
        let watchdog = self.inner.config.watchdog;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(watchdog) => {
                    tracker.check_watchdog(&job_id).await;
                }
            }
        });
    }

    /// Re-validate the "no progress since subscribe" condition at fire
    /// time; a push event that arrived meanwhile suppresses promotion.
    async fn check_watchdog(&self, job_id: &str) {
        let promote = {
            let guard = self.inner.state.lock().await;
            matches!(
                guard.tracking.as_ref(),
                Some(tracking)
                    if tracking.job_id == job_id
                        && !tracking.polling
                        && tracking.last_progress_at.elapsed() >= self.inner.config.watchdog
            )
        };
        if promote {
            tracing::warn!(
                job_id = %job_id,
                "No push progress within watchdog window, promoting to polling",
            );
            self.start_polling(job_id).await;
        }
    }

    /// Start the polling fallback for a job. The push subscription, if
    /// any, is left open; terminal delivery tears both down.
    async fn start_polling(&self, job_id: &str) {
        let token = {
            let mut guard = self.inner.state.lock().await;
            match guard.tracking.as_mut() {
                Some(tracking) if tracking.job_id == job_id && !tracking.polling => {
                    tracking.polling = true;
                    tracking.cancel.clone()
                }
                _ => return,
            }
        };

        tracing::info!(job_id = %job_id, "Starting polling fallback");
        let tracker = self.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tracker.run_poll_loop(&job_id) => {}
            }
        });
    }

    /// Poll the status endpoint at a fixed interval until a terminal
    /// state is observed or the wall-clock budget runs out. Transient
    /// query errors are retried; budget exhaustion fails the job with
    /// a synthetic timeout snapshot.
    async fn run_poll_loop(&self, job_id: &str) {
        let deadline = Instant::now() + self.inner.config.poll_budget;

        loop {
            tokio::time::sleep(self.inner.config.poll_interval).await;

            if Instant::now() >= deadline {
                let last_progress = self
                    .current_job()
                    .await
                    .map(|snapshot| snapshot.progress)
                    .unwrap_or(0);
                let budget_secs = self.inner.config.poll_budget.as_secs();
                tracing::error!(
                    job_id = %job_id,
                    "Polling budget exhausted without a terminal status",
                );
                let snapshot = JobSnapshot::failed(
                    job_id.to_string(),
                    last_progress,
                    format!("Job polling timed out after {budget_secs}s"),
                );
                self.finish_job(snapshot, Terminal::Failed).await;
                return;
            }

            match self.inner.service.status(job_id).await {
                Ok(snapshot) => {
                    let status = snapshot.status;
                    let changed = {
                        let guard = self.inner.state.lock().await;
                        guard.current.as_ref() != Some(&snapshot)
                    };
                    if changed {
                        self.apply_progress(snapshot.clone()).await;
                    }
                    match status {
                        JobStatus::Completed => {
                            self.finish_job(snapshot, Terminal::Completed).await;
                            return;
                        }
                        JobStatus::Failed => {
                            self.finish_job(snapshot, Terminal::Failed).await;
                            return;
                        }
                        JobStatus::Queued | JobStatus::Processing => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Status poll failed, will retry");
                }
            }
        }
    }
}
