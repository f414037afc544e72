//! Submission and polling of image-analysis jobs.
//!
//! A job moves through
//! `Idle -> Submitting -> Polling{Queued|Analyzing} -> terminal`, where the
//! terminal state is one of completed, failed, auth required, submit failed,
//! timed out or cancelled. `reset` returns to `Idle`.
//!
//! Polling is owned by a [`PollHandle`]. Cancelling or dropping the handle
//! stops the loop. Without a [`PollPolicy`] cap the loop runs until the
//! backend reports a terminal status.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::models::analysis::AnalysisResult;
use crate::models::job::{JobId, JobPhase, JobProgress, JobSnapshot, JobStatus};
use crate::models::notification::{Notification, NotificationAction};
use crate::services::api::{ApiClient, ApiError, ImageUpload};
use crate::services::notify::Notifier;
use crate::services::quota::QuotaTracker;
use crate::services::session::ResultHandoff;

/// How often to poll, and when to give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Stop after this many status requests. `None` polls indefinitely.
    pub max_attempts: Option<u32>,
    /// Stop once this much time has passed since polling began. `None` never expires.
    pub timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: None,
            timeout: None,
        }
    }
}

impl PollPolicy {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn exhausted(&self, attempts: u32, elapsed: Duration) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
            || self.timeout.is_some_and(|limit| elapsed >= limit)
    }
}

/// Client-side view of the current job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowState {
    Idle,
    Submitting,
    Polling(JobPhase),
    Completed,
    Failed,
    AuthRequired,
    SubmitFailed,
    TimedOut,
    Cancelled,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            WorkflowState::Idle | WorkflowState::Submitting | WorkflowState::Polling(_)
        )
    }
}

/// Progress reported to the consuming view while a job is watched.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Progress(JobPhase),
    Completed(AnalysisResult),
    Failed(String),
    AuthRequired,
    TimedOut { attempts: u32 },
    Cancelled,
}

/// How a watched job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(AnalysisResult),
    Failed(String),
    AuthRequired,
    TimedOut { attempts: u32 },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitFailure {
    #[error("Session expired, please log in again")]
    AuthRequired,

    #[error("Upgrade required: {detail}")]
    UpgradeRequired { detail: String },

    #[error("Upload failed: {message}")]
    Failed { message: String },
}

/// Submits images and watches the resulting jobs.
#[derive(Clone)]
pub struct AnalysisClient {
    api: Arc<ApiClient>,
    notifier: Arc<dyn Notifier>,
    handoff: ResultHandoff,
    quota: QuotaTracker,
    policy: PollPolicy,
    state: Arc<watch::Sender<WorkflowState>>,
    /// Bumped by every `reset`, `submit` and `watch`. Only the newest one may move `state`.
    generation: Arc<AtomicU64>,
}

impl AnalysisClient {
    pub fn new(
        api: Arc<ApiClient>,
        notifier: Arc<dyn Notifier>,
        handoff: ResultHandoff,
        quota: QuotaTracker,
        policy: PollPolicy,
    ) -> Self {
        let (state, _) = watch::channel(WorkflowState::Idle);
        Self {
            api,
            notifier,
            handoff,
            quota,
            policy,
            state: Arc::new(state),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    pub fn state(&self) -> WorkflowState {
        self.state.borrow().clone()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<WorkflowState> {
        self.state.subscribe()
    }

    /// Acknowledge a finished job and return to `Idle`.
    pub fn reset(&self) {
        self.begin(WorkflowState::Idle);
    }

    /// Upload an image and return the job id assigned by the backend.
    ///
    /// A 403 means the weekly quota is used up and is never retried. Auth
    /// failures have already been through one refresh by the time they land
    /// here.
    pub async fn submit(&self, upload: &ImageUpload) -> Result<JobId, SubmitFailure> {
        let generation = self.begin(WorkflowState::Submitting);
        tracing::info!(file_name = %upload.file_name(), bytes = upload.len(), "Submitting image");

        match self.api.submit_image(upload).await {
            Ok(job_id) => {
                metrics::counter!("analysis_jobs_submitted_total").increment(1);
                self.set_state(generation, WorkflowState::Polling(JobPhase::Queued));
                Ok(job_id)
            }
            Err(e) if e.requires_login() => {
                self.set_state(generation, WorkflowState::AuthRequired);
                self.notify_login_required();
                Err(SubmitFailure::AuthRequired)
            }
            Err(ApiError::QuotaExceeded { detail }) => {
                tracing::info!(detail = %detail, "Upload quota exhausted");
                self.set_state(generation, WorkflowState::SubmitFailed);
                self.notifier.notify(
                    Notification::error(detail.clone())
                        .with_action(NotificationAction::UpgradeToPremium),
                );
                Err(SubmitFailure::UpgradeRequired { detail })
            }
            Err(e) => {
                tracing::error!(error = %e, "Image submission failed");
                self.set_state(generation, WorkflowState::SubmitFailed);
                self.notifier
                    .notify(Notification::error("Error uploading image. Please try again."));
                Err(SubmitFailure::Failed {
                    message: e.user_message(),
                })
            }
        }
    }

    /// Submit an image and start polling the job it creates.
    pub async fn start(&self, upload: &ImageUpload) -> Result<PollHandle, SubmitFailure> {
        let job_id = self.submit(upload).await?;
        Ok(self.watch(job_id))
    }

    /// Poll an already-submitted job until it finishes or the handle goes away.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn watch(&self, job_id: JobId) -> PollHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(JobSnapshot::submitted(job_id.clone()));

        let generation = self.begin(WorkflowState::Polling(JobPhase::Queued));
        let _ = event_tx.send(JobEvent::Progress(JobPhase::Queued));

        let poller = Poller {
            client: self.clone(),
            generation,
            job_id: job_id.clone(),
            events: event_tx,
            snapshot: snapshot_tx,
        };
        let task = tokio::spawn(poller.run(cancel_rx));

        PollHandle {
            job_id,
            cancel: cancel_tx,
            events: event_rx,
            snapshot: snapshot_rx,
            task: Some(task),
        }
    }

    /// Recent jobs for the history view.
    pub async fn history(&self, limit: u32) -> Result<Vec<JobSnapshot>, ApiError> {
        match self.api.list_jobs(limit).await {
            Ok(jobs) => Ok(jobs),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to fetch analysis jobs");
                if e.requires_login() {
                    self.notify_login_required();
                } else {
                    self.notifier
                        .notify(Notification::error("Failed to fetch analysis jobs."));
                }
                Err(e)
            }
        }
    }

    /// Delete a job from history. Missing jobs come back as `ApiError::NotFound`.
    pub async fn remove(&self, job_id: &JobId) -> Result<(), ApiError> {
        match self.api.delete_job(job_id).await {
            Ok(()) => {
                self.notifier
                    .notify(Notification::success("Job removed from history."));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to remove job");
                if e.requires_login() {
                    self.notify_login_required();
                } else {
                    let message = match &e {
                        ApiError::Http(_) => "Error removing job.".to_string(),
                        other => other.user_message(),
                    };
                    self.notifier.notify(Notification::error(message));
                }
                Err(e)
            }
        }
    }

    /// Hand a completed job from history to the results view.
    pub fn open_result(&self, snapshot: &JobSnapshot) -> Option<AnalysisResult> {
        let result = match snapshot.progress() {
            Ok(JobProgress::Completed(result)) => result,
            _ => {
                self.notifier
                    .notify(Notification::error("No results available for this job."));
                return None;
            }
        };

        if let Err(e) = self.handoff.stash(&result) {
            tracing::error!(error = %e, "Failed to store pending analysis result");
            self.notifier
                .notify(Notification::error("Could not open this result. Please try again."));
            return None;
        }
        Some(result)
    }

    /// Consume the pending result left by a completed job, if any.
    pub fn take_result(&self) -> Option<AnalysisResult> {
        self.handoff.take().unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to read pending analysis result");
            None
        })
    }

    /// Start a new generation in `state`, superseding any running poller.
    fn begin(&self, state: WorkflowState) -> u64 {
        let mut generation = 0;
        self.state.send_modify(|current| {
            generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::debug!(from = ?current, to = ?state, generation, "Workflow state changed");
            *current = state;
        });
        generation
    }

    /// Move to `state` if `generation` is still the newest one.
    fn set_state(&self, generation: u64, state: WorkflowState) {
        self.state.send_if_modified(|current| {
            if self.generation.load(Ordering::SeqCst) != generation {
                tracing::debug!(generation, ignored = ?state, "State change from a superseded job");
                return false;
            }
            if *current == state {
                return false;
            }
            tracing::debug!(from = ?current, to = ?state, generation, "Workflow state changed");
            *current = state;
            true
        });
    }

    fn notify_login_required(&self) {
        self.notifier.notify(
            Notification::error("Your session has expired. Please log in again.")
                .with_action(NotificationAction::LogIn),
        );
    }
}

/// Handle to a running poll loop.
///
/// Dropping the handle cancels polling.
pub struct PollHandle {
    job_id: JobId,
    cancel: watch::Sender<bool>,
    events: mpsc::UnboundedReceiver<JobEvent>,
    snapshot: watch::Receiver<JobSnapshot>,
    task: Option<JoinHandle<JobOutcome>>,
}

impl PollHandle {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Latest accepted snapshot. Starts as the local `pending` record.
    pub fn snapshot(&self) -> JobSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Stop polling. The loop ends with [`JobOutcome::Cancelled`] unless it already finished.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Next progress event, or `None` once the loop has finished and all events are read.
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        self.events.recv().await
    }

    /// Wait for the loop to finish.
    pub async fn wait(mut self) -> JobOutcome {
        let Some(task) = self.task.take() else {
            return JobOutcome::Cancelled;
        };
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(job_id = %self.job_id, error = %e, "Poll task ended abnormally");
                JobOutcome::Cancelled
            }
        }
    }
}

impl std::fmt::Debug for PollHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollHandle")
            .field("job_id", &self.job_id)
            .field("status", &self.snapshot.borrow().status)
            .finish_non_exhaustive()
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.cancel.send(true);
        }
    }
}

struct Poller {
    client: AnalysisClient,
    generation: u64,
    job_id: JobId,
    events: mpsc::UnboundedSender<JobEvent>,
    snapshot: watch::Sender<JobSnapshot>,
}

impl Poller {
    async fn run(self, mut cancel: watch::Receiver<bool>) -> JobOutcome {
        let policy = self.client.policy;
        let started = Instant::now();
        let mut interval = tokio::time::interval(policy.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; the first poll waits one full interval.
        interval.tick().await;

        let mut attempts: u32 = 0;
        let mut last_rank = JobStatus::Pending.rank();

        tracing::info!(
            job_id = %self.job_id,
            interval_ms = policy.interval.as_millis() as u64,
            max_attempts = policy.max_attempts,
            "Polling job status"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => return self.cancelled(attempts),
                _ = interval.tick() => {}
            }

            attempts += 1;
            metrics::counter!("analysis_polls_total").increment(1);

            let fetched = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => return self.cancelled(attempts),
                fetched = self.client.api.job_status(&self.job_id) => fetched,
            };

            match fetched {
                Ok(snapshot) => {
                    if snapshot.status.rank() < last_rank {
                        tracing::warn!(
                            job_id = %self.job_id,
                            status = %snapshot.status,
                            "Ignoring snapshot that moves the job backwards"
                        );
                    } else {
                        match snapshot.progress() {
                            Ok(JobProgress::InFlight(phase)) => {
                                if phase.rank() > last_rank {
                                    tracing::info!(job_id = %self.job_id, phase = %phase, "Job progressed");
                                    self.client.set_state(self.generation, WorkflowState::Polling(phase));
                                    let _ = self.events.send(JobEvent::Progress(phase));
                                }
                                last_rank = phase.rank();
                                self.snapshot.send_replace(snapshot);
                            }
                            Ok(JobProgress::Completed(result)) => {
                                self.snapshot.send_replace(snapshot);
                                return self.completed(result, started);
                            }
                            Ok(JobProgress::Failed(message)) => {
                                self.snapshot.send_replace(snapshot);
                                return self.failed(message, started);
                            }
                            Err(e) => {
                                tracing::warn!(job_id = %self.job_id, error = %e, "Unusable job snapshot, will poll again");
                            }
                        }
                    }
                }
                Err(e) if e.requires_login() => return self.auth_required(),
                Err(e) if e.is_permanent() => {
                    tracing::warn!(job_id = %self.job_id, attempt = attempts, error = %e, "Status check cannot succeed, giving up");
                    return self.failed(e.user_message(), started);
                }
                Err(e) => {
                    tracing::warn!(job_id = %self.job_id, attempt = attempts, error = %e, "Status check failed, will poll again");
                }
            }

            if policy.exhausted(attempts, started.elapsed()) {
                return self.timed_out(attempts);
            }
        }
    }

    fn completed(&self, result: AnalysisResult, started: Instant) -> JobOutcome {
        let client = &self.client;
        client.set_state(self.generation, WorkflowState::Completed);
        metrics::counter!("analysis_jobs_completed_total").increment(1);
        metrics::histogram!("analysis_job_seconds").record(started.elapsed().as_secs_f64());

        if let Err(e) = client.handoff.stash(&result) {
            tracing::error!(job_id = %self.job_id, error = %e, "Failed to store pending analysis result");
        }
        let _ = self.events.send(JobEvent::Completed(result.clone()));

        // The upload now counts against the weekly allowance.
        let quota = client.quota.clone();
        let job_id = self.job_id.clone();
        tokio::spawn(async move {
            if let Err(e) = quota.refresh().await {
                tracing::warn!(job_id = %job_id, error = %e, "Quota refresh after completion failed");
            }
        });

        let found = result.item_count();
        tracing::info!(job_id = %self.job_id, items = found, "Analysis completed");
        client.notifier.notify(Notification::success(format!(
            "Analysis complete! Found {found} item(s)."
        )));
        JobOutcome::Completed(result)
    }

    fn failed(&self, message: String, started: Instant) -> JobOutcome {
        let client = &self.client;
        client.set_state(self.generation, WorkflowState::Failed);
        metrics::counter!("analysis_jobs_failed_total").increment(1);
        metrics::histogram!("analysis_job_seconds").record(started.elapsed().as_secs_f64());

        tracing::warn!(job_id = %self.job_id, error = %message, "Analysis failed");
        client.notifier.notify(Notification::error(message.clone()));
        let _ = self.events.send(JobEvent::Failed(message.clone()));
        JobOutcome::Failed(message)
    }

    fn auth_required(&self) -> JobOutcome {
        tracing::warn!(job_id = %self.job_id, "Stopped polling, session expired");
        self.client.set_state(self.generation, WorkflowState::AuthRequired);
        self.client.notify_login_required();
        let _ = self.events.send(JobEvent::AuthRequired);
        JobOutcome::AuthRequired
    }

    fn timed_out(&self, attempts: u32) -> JobOutcome {
        tracing::warn!(job_id = %self.job_id, attempts, "Gave up polling before the job finished");
        self.client.set_state(self.generation, WorkflowState::TimedOut);
        self.client.notifier.notify(Notification::info(
            "Analysis is taking longer than expected. Check your analysis history later.",
        ));
        let _ = self.events.send(JobEvent::TimedOut { attempts });
        JobOutcome::TimedOut { attempts }
    }

    fn cancelled(&self, attempts: u32) -> JobOutcome {
        tracing::info!(job_id = %self.job_id, attempts, "Polling cancelled");
        self.client.set_state(self.generation, WorkflowState::Cancelled);
        let _ = self.events.send(JobEvent::Cancelled);
        JobOutcome::Cancelled
    }
}

/// Resolves once cancellation is requested or the handle is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}
