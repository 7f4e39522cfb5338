//! Sequential execution of actionable jobs.
//!
//! A pass checks connectivity, lists the actionable jobs in priority order and runs the due
//! ones one at a time through their [`crate::handler::SyncHandler`], committing every
//! transition to the [`JobStore`] before moving on. At most one pass runs at a time.
//!
//! The engine is the only worker of its store, so a job still `Processing` when a pass
//! starts belongs to a process that died mid-execution. Each pass returns such jobs to
//! `Pending` before listing.
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{instrument, Instrument};

use crate::{
    backoff::{Strategy, DEFAULT_BACKOFF},
    handler::{HandlerError, Handlers},
    job::{JobId, SyncJob},
    network::NetworkMonitor,
    store::{JobStore, Retry},
    tracker::{EntityRef, EntityStateTracker, SyncState},
    trigger::TriggerSource,
    EngineError,
};

const REPORT_CAPACITY: usize = 16;

/// The result of asking the scheduler for a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Another pass was active; nothing was done.
    AlreadyRunning,
    /// The API was not reachable; no job was touched.
    Offline,
    Completed(PassReport),
}

/// Aggregate counts of a finished pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub source: TriggerSource,
    /// Jobs completed.
    pub synced: usize,
    /// Jobs that failed and will be retried.
    pub failed: usize,
    /// Jobs that failed for good, either by a terminal error or on their final attempt.
    pub discarded: usize,
    /// Jobs listed but not executed: terminal, still backing off, or not claimable.
    pub skipped: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl PassReport {
    fn new(source: TriggerSource, started_at: DateTime<Utc>) -> Self {
        Self {
            source,
            synced: 0,
            failed: 0,
            discarded: 0,
            skipped: 0,
            started_at,
            finished_at: started_at,
        }
    }

    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Synced => self.synced += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::Discarded => self.discarded += 1,
            JobOutcome::NotStarted => self.skipped += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Synced,
    Failed,
    Discarded,
    NotStarted,
}

/// Holds the running flag for the duration of a pass. Dropping releases it, including when
/// the pass unwinds.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(running: &'a AtomicBool) -> Option<Self> {
        running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(running))
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Selects, gates and executes jobs.
pub struct Scheduler<S: JobStore> {
    store: S,
    network: Arc<dyn NetworkMonitor>,
    tracker: Arc<dyn EntityStateTracker>,
    handlers: Handlers,
    backoff: Arc<dyn Strategy + Send + Sync>,
    running: AtomicBool,
    reports: broadcast::Sender<PassReport>,
}

impl<S: JobStore> std::fmt::Debug for Scheduler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("handlers", &self.handlers)
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl<S: JobStore> Scheduler<S> {
    pub fn new(
        store: S,
        network: Arc<dyn NetworkMonitor>,
        tracker: Arc<dyn EntityStateTracker>,
        handlers: Handlers,
    ) -> Self {
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);
        Self {
            store,
            network,
            tracker,
            handlers,
            backoff: Arc::new(DEFAULT_BACKOFF),
            running: AtomicBool::new(false),
            reports,
        }
    }

    pub fn with_backoff(mut self, backoff: impl Strategy + Send + Sync + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn network(&self) -> &dyn NetworkMonitor {
        self.network.as_ref()
    }

    /// Whether a pass is currently active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Receives a [`PassReport`] after every completed pass.
    pub fn subscribe(&self) -> broadcast::Receiver<PassReport> {
        self.reports.subscribe()
    }

    /// Runs one pass over the actionable jobs.
    ///
    /// Returns [`PassOutcome::AlreadyRunning`] without waiting if another pass is active, and
    /// [`PassOutcome::Offline`] without touching any job if the API is not reachable. Handler
    /// failures are recorded on their job; only a failure to list the jobs aborts the pass.
    #[instrument(skip(self))]
    pub async fn run_pass(&self, source: TriggerSource) -> Result<PassOutcome, EngineError> {
        let Some(_guard) = PassGuard::acquire(&self.running) else {
            tracing::debug!("Sync pass already running");
            return Ok(PassOutcome::AlreadyRunning);
        };

        let connectivity = self.network.connectivity();
        if !connectivity.is_online() {
            tracing::debug!(?connectivity, "Skipping sync pass while offline");
            return Ok(PassOutcome::Offline);
        }

        let mut report = PassReport::new(source, Utc::now());
        self.recover_interrupted().await;
        let jobs = self.store.list_actionable().await.inspect_err(|err| {
            tracing::error!(?err, "Failed to list actionable jobs, error: {err}")
        })?;

        for job in jobs {
            if job.is_terminal() || !job.is_due(Utc::now()) {
                report.skipped += 1;
                continue;
            }
            let outcome = self.execute_job(job).await;
            report.record(outcome);
        }

        report.finished_at = Utc::now();
        tracing::info!(
            synced = report.synced,
            failed = report.failed,
            discarded = report.discarded,
            skipped = report.skipped,
            "Sync pass finished: {} synced, {} failed",
            report.synced,
            report.failed + report.discarded,
        );
        // No subscribers is fine.
        let _ = self.reports.send(report.clone());
        Ok(PassOutcome::Completed(report))
    }

    #[instrument(skip(self, job), fields(job_id, kind = %job.kind))]
    async fn execute_job(&self, job: SyncJob) -> JobOutcome {
        let job_id = job.id;
        tracing::Span::current().record("job_id", tracing::field::display(&job_id));

        let job = match self.store.mark_processing(job_id).await {
            Ok(job) => job,
            Err(err) => {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to mark job {job_id} as processing, error: {err:?}",
                );
                return JobOutcome::NotStarted;
            }
        };
        let entity = job.entity();
        self.mirror(&entity, SyncState::Uploading).await;

        tracing::debug!(%job_id, attempt = job.attempts, "Executing job {job_id}");
        let result = match self.handlers.get(job.kind) {
            None => Err(HandlerError::terminal(format!(
                "no handler registered for {} jobs",
                job.kind
            ))),
            Some(handler) => {
                let job = job.clone();
                tokio::spawn(async move { handler.execute(&job).await }.in_current_span())
                    .await
                    .unwrap_or_else(|err| Err(HandlerError::from(err)))
            }
        };

        match result {
            Ok(()) => {
                if self.handle_job_complete(job_id).await {
                    self.mirror(&entity, SyncState::Uploaded).await;
                    JobOutcome::Synced
                } else {
                    // Left processing; the next pass recovers and reruns it.
                    JobOutcome::NotStarted
                }
            }
            Err(error) => {
                let outcome = self.handle_job_error(&job, error).await;
                let state = match outcome {
                    JobOutcome::Failed => SyncState::Pending,
                    _ => SyncState::Failed,
                };
                self.mirror(&entity, state).await;
                outcome
            }
        }
    }

    /// Returns whether the completion was committed.
    async fn handle_job_complete(&self, job_id: JobId) -> bool {
        tracing::debug!(%job_id, "Job complete {job_id}");
        self.store
            .mark_completed(job_id)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to mark job {job_id} as complete, error: {err:?}",
                )
            })
            .is_ok()
    }

    async fn handle_job_error(&self, job: &SyncJob, error: HandlerError) -> JobOutcome {
        let job_id = job.id;
        let (retry, outcome) = if error.is_terminal() {
            tracing::error!(
                %job_id,
                ?error,
                "Job {job_id} failed with a terminal error and will be discarded: {error}",
            );
            (Retry::Discard, JobOutcome::Discarded)
        } else if job.is_final_attempt() {
            tracing::error!(
                %job_id,
                ?error,
                "Job {job_id} failed on its final attempt ({}/{}): {error}",
                job.attempts,
                job.max_attempts,
            );
            (Retry::Never, JobOutcome::Discarded)
        } else {
            let delay = self.retry_delay(job);
            tracing::warn!(
                %job_id,
                ?error,
                "Job {job_id} failed and will be retried in {delay}: {error}",
            );
            (Retry::At(Utc::now() + delay), JobOutcome::Failed)
        };

        let _ = self
            .store
            .mark_failed(job_id, &error.message, retry)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to mark job {job_id} as failed, error: {err:?}",
                )
            });
        outcome
    }

    /// The wait after the job's latest failed attempt.
    fn retry_delay(&self, job: &SyncJob) -> TimeDelta {
        self.backoff.backoff(job.attempts.saturating_sub(1))
    }

    /// Writes the entity mirror. Failures are logged and never affect the job.
    async fn mirror(&self, entity: &EntityRef, state: SyncState) {
        let _ = self
            .tracker
            .set_state(entity, state, None)
            .await
            .inspect_err(|err| {
                tracing::warn!(?err, %entity, %state, "Failed to mirror sync state of {entity}")
            });
    }

    /// Recovers every `Processing` job, however recently it started. Only valid while the
    /// pass guard is held. Failures are logged so that the remaining jobs still run.
    async fn recover_interrupted(&self) {
        let _ = self
            .recover_before(DateTime::<Utc>::MAX_UTC)
            .await
            .inspect_err(|err| {
                tracing::error!(?err, "Failed to recover interrupted jobs, error: {err}")
            });
    }

    /// Returns jobs left `Processing` by a previous process to `Pending`.
    ///
    /// Only jobs whose last attempt started more than `grace` ago are recovered.
    pub async fn recover_abandoned(&self, grace: TimeDelta) -> Result<Vec<JobId>, EngineError> {
        self.recover_before(Utc::now() - grace).await
    }

    async fn recover_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobId>, EngineError> {
        let recovered = self.store.recover_abandoned(cutoff).await?;
        for &job_id in &recovered {
            tracing::warn!(%job_id, "Recovered job {job_id} interrupted while processing");
            match self.store.get(job_id).await {
                Ok(Some(job)) => self.mirror(&job.entity(), SyncState::Pending).await,
                Ok(None) => {}
                Err(err) => tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to load recovered job {job_id}, error: {err:?}",
                ),
            }
        }
        Ok(recovered)
    }
}
