//! Submit-then-poll tracking of a remote document processing job.
//!
//! A submitted document becomes an [`UploadJob`] that is checked on a fixed
//! period until the remote side reports a terminal phase. Each tracking run
//! lives in its own task, registered with the [`SessionRegistry`] so that a
//! session reset cancels it, and resolves to exactly one [`UploadOutcome`].

use crate::api::Backend;
use crate::config::Config;
use crate::document::Document;
use crate::models::{FileId, JobPhase, UploadJob};
use crate::session::{SessionRegistry, TrackingTicket};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const SUBMIT_ERROR: &str = "The file could not be uploaded.";
pub const CONNECTIVITY_ERROR: &str =
    "Lost connection to the server while checking the upload status.";
pub const TIMEOUT_ERROR: &str = "Processing the file took too long.";
const JOB_FAILED_FALLBACK: &str = "Processing the file failed.";

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: Option<u32>,
    pub max_duration: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: None,
            max_duration: None,
        }
    }
}

impl From<&Config> for PollConfig {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.poll_interval,
            max_attempts: config.max_poll_attempts,
            max_duration: config.max_poll_duration,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadFailure {
    /// The document never reached the server.
    Submission(String),
    /// The server reported the job as failed.
    Job(String),
    /// A status check itself failed.
    Connectivity(String),
    TimedOut,
}

impl UploadFailure {
    pub fn user_message(&self) -> String {
        match self {
            UploadFailure::Submission(_) => SUBMIT_ERROR.to_string(),
            UploadFailure::Job(message) => message.clone(),
            UploadFailure::Connectivity(_) => CONNECTIVITY_ERROR.to_string(),
            UploadFailure::TimedOut => TIMEOUT_ERROR.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Completed(FileId),
    Failed(UploadFailure),
    /// Tracking was stopped before the job finished.
    Cancelled,
}

pub struct UploadPoller<B: Backend> {
    backend: Arc<B>,
    session: SessionRegistry,
    config: PollConfig,
}

impl<B: Backend> UploadPoller<B> {
    pub fn new(backend: Arc<B>, session: SessionRegistry, config: PollConfig) -> Self {
        Self {
            backend,
            session,
            config,
        }
    }

    pub async fn submit(&self, document: &Document) -> Result<UploadJob, UploadFailure> {
        match self.backend.submit(document).await {
            Ok(id) => {
                info!(file_id = %id, filename = %document.filename, bytes = document.len(), "document submitted");
                Ok(UploadJob::submitted(id))
            }
            Err(e) => {
                warn!(filename = %document.filename, error = %e, "document submission failed");
                Err(UploadFailure::Submission(e.to_string()))
            }
        }
    }

    /// Spawn the repeating status check for `job`. Any earlier tracking run
    /// registered with the session is cancelled.
    pub fn start_tracking(&self, job: UploadJob) -> UploadTracker {
        let cancel = CancellationToken::new();
        let ticket = self.session.attach_tracking(cancel.clone());
        self.spawn_run(job, ticket, cancel)
    }

    /// Submit the document and start tracking it. No tracking starts if the
    /// submission fails, and `Ok(None)` means the session was reset while the
    /// submission was in flight.
    pub async fn upload(&self, document: &Document) -> Result<Option<UploadTracker>, UploadFailure> {
        let generation = self.session.generation();
        let job = self.submit(document).await?;

        let cancel = CancellationToken::new();
        match self.session.attach_tracking_at(generation, cancel.clone()) {
            Some(ticket) => Ok(Some(self.spawn_run(job, ticket, cancel))),
            None => {
                info!(file_id = %job.id, "session reset during submission, discarding upload");
                Ok(None)
            }
        }
    }

    fn spawn_run(&self, job: UploadJob, ticket: TrackingTicket, cancel: CancellationToken) -> UploadTracker {
        let file_id = job.id.clone();
        let (tx, rx) = watch::channel(job);

        let run = TrackingRun {
            backend: self.backend.clone(),
            session: self.session.clone(),
            config: self.config.clone(),
            ticket,
            cancel: cancel.clone(),
            updates: tx,
            file_id: file_id.clone(),
        };
        let task = tokio::spawn(run.drive());

        UploadTracker {
            file_id,
            updates: rx,
            cancel,
            task: Some(task),
            outcome: None,
        }
    }
}

/// Handle to one tracking run. Dropping it stops the run.
pub struct UploadTracker {
    file_id: FileId,
    updates: watch::Receiver<UploadJob>,
    cancel: CancellationToken,
    task: Option<JoinHandle<UploadOutcome>>,
    outcome: Option<UploadOutcome>,
}

impl UploadTracker {
    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }

    pub fn subscribe(&self) -> watch::Receiver<UploadJob> {
        self.updates.clone()
    }

    pub fn snapshot(&self) -> UploadJob {
        self.updates.borrow().clone()
    }

    /// Wait for the run to resolve. Later calls return the same outcome.
    pub async fn outcome(&mut self) -> UploadOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let outcome = match self.task.take() {
            Some(task) => task.await.unwrap_or_else(|e| {
                warn!(file_id = %self.file_id, error = %e, "upload tracking task aborted");
                UploadOutcome::Cancelled
            }),
            None => UploadOutcome::Cancelled,
        };
        self.outcome = Some(outcome.clone());
        outcome
    }
}

impl Drop for UploadTracker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct TrackingRun<B: Backend> {
    backend: Arc<B>,
    session: SessionRegistry,
    config: PollConfig,
    ticket: TrackingTicket,
    cancel: CancellationToken,
    updates: watch::Sender<UploadJob>,
    file_id: FileId,
}

impl<B: Backend> TrackingRun<B> {
    async fn drive(self) -> UploadOutcome {
        let period = self.config.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        // A slow check delays the next one instead of piling up ticks.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let deadline = self.config.max_duration.map(|d| Instant::now() + d);
        let mut attempt: u32 = 0;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.cancelled(),
                _ = wait_until(deadline) => return self.timed_out(attempt),
                _ = ticker.tick() => {}
            }

            attempt += 1;
            debug!(file_id = %self.file_id, attempt, "checking upload status");
            let response = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.cancelled(),
                _ = wait_until(deadline) => return self.timed_out(attempt),
                response = self.backend.status(&self.file_id) => response,
            };

            let report = match response {
                Ok(report) => report,
                Err(e) => {
                    warn!(file_id = %self.file_id, attempt, error = %e, "status check failed");
                    return self.fail(UploadFailure::Connectivity(e.to_string()));
                }
            };
            if self.cancel.is_cancelled() {
                return self.cancelled();
            }

            let progress = report.clamped_progress();
            self.updates.send_modify(|job| {
                if progress < job.progress {
                    debug!(file_id = %job.id, from = job.progress, to = progress, "progress went backwards");
                }
                job.phase = report.phase.clone();
                job.progress = progress;
                job.message = report.message.clone();
            });

            match report.phase {
                JobPhase::Completed => return self.complete(attempt),
                JobPhase::Failed => {
                    let message = if report.message.trim().is_empty() {
                        JOB_FAILED_FALLBACK.to_string()
                    } else {
                        report.message
                    };
                    warn!(file_id = %self.file_id, attempt, %message, "processing failed");
                    return self.fail(UploadFailure::Job(message));
                }
                _ => {}
            }

            if self.config.max_attempts.is_some_and(|max| attempt >= max) {
                return self.timed_out(attempt);
            }
        }
    }

    fn complete(&self, attempt: u32) -> UploadOutcome {
        if self.session.complete(self.ticket, self.file_id.clone()) {
            info!(file_id = %self.file_id, attempts = attempt, "document ready");
            UploadOutcome::Completed(self.file_id.clone())
        } else {
            UploadOutcome::Cancelled
        }
    }

    fn fail(&self, failure: UploadFailure) -> UploadOutcome {
        if self.session.fail(self.ticket, failure.user_message()) {
            UploadOutcome::Failed(failure)
        } else {
            UploadOutcome::Cancelled
        }
    }

    fn timed_out(&self, attempt: u32) -> UploadOutcome {
        if self.cancel.is_cancelled() {
            return self.cancelled();
        }
        warn!(file_id = %self.file_id, attempts = attempt, "giving up on upload tracking");
        self.updates.send_modify(|job| {
            job.phase = JobPhase::Failed;
            job.message = TIMEOUT_ERROR.to_string();
        });
        self.fail(UploadFailure::TimedOut)
    }

    fn cancelled(&self) -> UploadOutcome {
        debug!(file_id = %self.file_id, "upload tracking cancelled");
        self.session.detach(self.ticket);
        UploadOutcome::Cancelled
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
