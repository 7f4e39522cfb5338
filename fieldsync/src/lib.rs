//! A durable offline-first synchronization engine.
//!
//! Producers enqueue [`job::SyncJob`]s describing evidence captured on a device: photos,
//! project edits and metadata patches. The [`SyncEngine`] moves them to the remote system of
//! record whenever the API is reachable, one job at a time in priority order, retrying
//! failures with backoff and surviving crashes through its [`store::JobStore`].
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! use fieldsync::prelude::*;
//! use fieldsync::network::ManualNetworkMonitor;
//! use fieldsync::remote::{http::HttpRemoteApi, StaticToken};
//! use fieldsync::store::memory::InMemoryJobStore;
//! use fieldsync::tracker::InMemoryEntityStateTracker;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let remote = HttpRemoteApi::new(
//!     "https://api.example.com/api",
//!     Duration::from_secs(30),
//!     Arc::new(StaticToken("token".to_owned())),
//! )?;
//! let engine = SyncEngine::builder(
//!     InMemoryJobStore::new(),
//!     Arc::new(ManualNetworkMonitor::default()),
//!     Arc::new(InMemoryEntityStateTracker::new()),
//! )
//! .with_default_handlers(Arc::new(remote))
//! .start()
//! .await?;
//!
//! engine
//!     .enqueue(JobBuilder::project(ProjectSnapshot {
//!         id: "project-1".to_owned(),
//!         body: serde_json::json!({ "name": "North ridge" }),
//!     }))
//!     .await?;
//!
//! engine.graceful_shutdown().await?;
//! # Ok(())
//! # }
//! ```
use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

pub mod backoff;
pub mod config;
pub mod handler;
pub mod job;
pub mod network;
pub mod prelude;
pub mod remote;
pub mod saga;
pub mod scheduler;
pub mod store;
pub mod tracker;
pub mod trigger;

use backoff::Strategy;
use config::EngineConfig;
use handler::{Handlers, SyncHandler};
use job::{builder::JobBuilder, query::Query, JobId, JobStatus, SyncJob};
use network::NetworkMonitor;
use remote::RemoteApi;
use scheduler::{PassOutcome, PassReport, Scheduler};
use store::{JobStore, StatusCounts, StoreError};
use tracker::EntityStateTracker;
use trigger::{
    wake_channel, ConnectivityTrigger, IntervalTrigger, SchedulerTrigger, TriggerSource,
    WakeHandle,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Error communicating with the job store: {0}")]
    Store(#[from] StoreError),
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
}

/// Assembles a [`SyncEngine`].
///
/// Besides any triggers added with [`SyncEngineBuilder::with_trigger`], a started engine
/// always listens to an interval trigger, its own [`WakeHandle`] and connectivity changes of
/// its [`NetworkMonitor`].
pub struct SyncEngineBuilder<S: JobStore> {
    store: S,
    network: Arc<dyn NetworkMonitor>,
    tracker: Arc<dyn EntityStateTracker>,
    handlers: Handlers,
    config: EngineConfig,
    backoff: Option<Arc<dyn Strategy + Send + Sync>>,
    triggers: Vec<Box<dyn SchedulerTrigger>>,
}

impl<S> SyncEngineBuilder<S>
where
    S: JobStore + 'static,
{
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_handler(mut self, handler: impl SyncHandler + 'static) -> Self {
        self.handlers.register(Arc::new(handler));
        self
    }

    /// Registers the built-in sagas for every job kind against `remote`.
    pub fn with_default_handlers(mut self, remote: Arc<dyn RemoteApi>) -> Self {
        self.handlers
            .merge(saga::default_handlers(remote, self.tracker.clone()));
        self
    }

    pub fn with_backoff(mut self, backoff: impl Strategy + Send + Sync + 'static) -> Self {
        self.backoff = Some(Arc::new(backoff));
        self
    }

    /// Adds a host-provided wake-up source, e.g. an OS background-execution slot.
    pub fn with_trigger(mut self, trigger: impl SchedulerTrigger + 'static) -> Self {
        self.triggers.push(Box::new(trigger));
        self
    }

    /// Recovers jobs interrupted by a previous process and starts listening to the triggers.
    pub async fn start(self) -> Result<SyncEngine<S>, EngineError> {
        let mut scheduler =
            Scheduler::new(self.store, self.network.clone(), self.tracker, self.handlers);
        if let Some(backoff) = self.backoff {
            scheduler = scheduler.with_backoff(backoff);
        }
        let scheduler = Arc::new(scheduler);

        let recovered = scheduler
            .recover_abandoned(self.config.processing_grace())
            .await?;
        if !recovered.is_empty() {
            tracing::info!(count = recovered.len(), "Recovered interrupted jobs");
        }

        let (wake, wake_trigger) = wake_channel();
        let mut engine = SyncEngine {
            scheduler,
            config: self.config,
            wake,
            cancellation_token: CancellationToken::new(),
            passes: TaskTracker::new(),
            handles: Vec::new(),
        };
        engine.spawn_trigger(Box::new(IntervalTrigger::new(self.config.sync_interval())));
        engine.spawn_trigger(Box::new(wake_trigger));
        engine.spawn_trigger(Box::new(ConnectivityTrigger::new(self.network.subscribe())));
        for trigger in self.triggers {
            engine.spawn_trigger(trigger);
        }
        tracing::debug!("Sync engine started");
        Ok(engine)
    }
}

/// A running synchronization engine.
#[derive(Debug)]
pub struct SyncEngine<S: JobStore> {
    scheduler: Arc<Scheduler<S>>,
    config: EngineConfig,
    wake: WakeHandle,
    cancellation_token: CancellationToken,
    passes: TaskTracker,
    handles: Vec<JoinHandle<()>>,
}

impl<S> SyncEngine<S>
where
    S: JobStore + 'static,
{
    pub fn builder(
        store: S,
        network: Arc<dyn NetworkMonitor>,
        tracker: Arc<dyn EntityStateTracker>,
    ) -> SyncEngineBuilder<S> {
        SyncEngineBuilder {
            store,
            network,
            tracker,
            handlers: Handlers::new(),
            config: EngineConfig::default(),
            backoff: None,
            triggers: Vec::new(),
        }
    }

    fn spawn_trigger(&mut self, mut trigger: Box<dyn SchedulerTrigger>) {
        let scheduler = self.scheduler.clone();
        let cancellation_token = self.cancellation_token.clone();
        let passes = self.passes.clone();
        let handle = tokio::spawn(async move {
            loop {
                let source = tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    source = trigger.next() => source,
                };
                let Some(source) = source else {
                    break;
                };
                let scheduler = scheduler.clone();
                // Errors are logged by the scheduler.
                passes.spawn(async move { scheduler.run_pass(source).await });
            }
            tracing::debug!("Scheduler trigger stopped");
        });
        self.handles.push(handle);
    }

    pub fn store(&self) -> &S {
        self.scheduler.store()
    }

    pub fn scheduler(&self) -> &Scheduler<S> {
        &self.scheduler
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A handle for waking the engine from outside, e.g. from OS callbacks.
    pub fn wake_handle(&self) -> WakeHandle {
        self.wake.clone()
    }

    /// Receives a [`PassReport`] after every completed pass.
    pub fn subscribe(&self) -> broadcast::Receiver<PassReport> {
        self.scheduler.subscribe()
    }

    fn wake_if_online(&self, source: TriggerSource) {
        if self.scheduler.network().connectivity().is_online() {
            self.wake.wake(source);
        }
    }

    /// Persists a job and, when the API is reachable, requests an immediate pass.
    ///
    /// Jobs built without an explicit attempt limit get [`EngineConfig::max_attempts`].
    pub async fn enqueue(&self, job: JobBuilder) -> Result<JobId, EngineError> {
        let job_id = job
            .max_attempts_or(self.config.max_attempts)
            .enqueue_to_store(self.store())
            .await?;
        tracing::debug!(%job_id, "Enqueued job {job_id}");
        self.wake_if_online(TriggerSource::Enqueued);
        Ok(job_id)
    }

    /// Runs a pass to completion, for OS background-execution callbacks that must report
    /// when they are done.
    pub async fn run_background_task(&self) -> Result<PassOutcome, EngineError> {
        self.scheduler.run_pass(TriggerSource::BackgroundWake).await
    }

    /// Runs a pass to completion on user request.
    pub async fn run_pass_now(&self) -> Result<PassOutcome, EngineError> {
        self.scheduler.run_pass(TriggerSource::Manual).await
    }

    /// Resets the given jobs so they run on the next pass regardless of backoff or exhaustion.
    /// Jobs currently processing are left alone.
    pub async fn reset_for_retry(&self, ids: &[JobId]) -> Result<u64, EngineError> {
        let reset = self.store().reset_for_retry(ids).await?;
        if reset > 0 {
            tracing::info!(count = reset, "Reset jobs for retry");
            self.wake_if_online(TriggerSource::Manual);
        }
        Ok(reset)
    }

    /// Resets every failed job, the "retry all" action.
    pub async fn retry_failed(&self) -> Result<u64, EngineError> {
        let ids: Vec<_> = self
            .store()
            .query(&Query::status_equal(JobStatus::Failed))
            .await?
            .into_iter()
            .map(|job| job.id)
            .collect();
        self.reset_for_retry(&ids).await
    }

    pub async fn prune(&self, query: &Query<'_>) -> Result<u64, EngineError> {
        let pruned = self.store().prune(query).await?;
        tracing::debug!(count = pruned, "Pruned jobs");
        Ok(pruned)
    }

    /// Removes every completed job.
    pub async fn clear_completed(&self) -> Result<u64, EngineError> {
        self.prune(&Query::status_equal(JobStatus::Completed)).await
    }

    /// The queue view: jobs matching `query` in execution order.
    pub async fn queue(&self, query: &Query<'_>) -> Result<Vec<SyncJob>, EngineError> {
        Ok(self.store().query(query).await?)
    }

    pub async fn counts(&self) -> Result<StatusCounts, EngineError> {
        Ok(self.store().counts().await?)
    }

    /// Stops every trigger and waits for an active pass to finish. In-flight jobs are not
    /// cancelled.
    pub async fn graceful_shutdown(self) -> Result<(), EngineError> {
        tracing::debug!("Shutting down the sync engine");
        self.cancellation_token.cancel();
        join_all(self.handles)
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| {
                tracing::error!(?err, "Scheduler trigger task failed: {err}");
                EngineError::GracefulShutdownFailed
            })?;
        self.passes.close();
        self.passes.wait().await;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::*;
    use crate::{
        handler::{test::ScriptedHandler, HandlerError},
        job::{JobKind, Priority, ProjectSnapshot},
        network::{Connectivity, ManualNetworkMonitor},
        store::{memory::InMemoryJobStore, testing::fixtures},
        tracker::InMemoryEntityStateTracker,
    };

    struct Setup {
        store: InMemoryJobStore,
        network: ManualNetworkMonitor,
        executed: Arc<Mutex<Vec<JobId>>>,
    }

    impl Setup {
        fn new(connectivity: Connectivity) -> Self {
            Self {
                store: InMemoryJobStore::new(),
                network: ManualNetworkMonitor::new(connectivity),
                executed: Default::default(),
            }
        }

        fn builder(&self) -> SyncEngineBuilder<InMemoryJobStore> {
            SyncEngine::builder(
                self.store.clone(),
                Arc::new(self.network.clone()),
                Arc::new(InMemoryEntityStateTracker::new()),
            )
        }

        fn project_handler(&self) -> ScriptedHandler {
            ScriptedHandler::new(JobKind::Project, self.executed.clone())
        }
    }

    fn project() -> JobBuilder {
        JobBuilder::project(ProjectSnapshot {
            id: "project-1".to_owned(),
            body: serde_json::json!({ "name": "North ridge" }),
        })
    }

    async fn next_report(reports: &mut broadcast::Receiver<PassReport>) -> PassReport {
        tokio::time::timeout(Duration::from_secs(5), reports.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn enqueue_while_online_syncs_immediately() {
        let setup = Setup::new(Connectivity::Reachable);
        let engine = setup
            .builder()
            .with_handler(setup.project_handler())
            .start()
            .await
            .unwrap();
        let mut reports = engine.subscribe();
        let startup = next_report(&mut reports).await;
        assert_eq!(startup.source, TriggerSource::Interval);

        let id = engine.enqueue(project()).await.unwrap();

        let report = next_report(&mut reports).await;
        assert_eq!(report.source, TriggerSource::Enqueued);
        assert_eq!(report.synced, 1);
        assert_eq!(
            engine.store().get(id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
        engine.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn regained_connectivity_syncs_jobs_enqueued_offline() {
        let setup = Setup::new(Connectivity::Offline);
        let engine = setup
            .builder()
            .with_handler(setup.project_handler())
            .start()
            .await
            .unwrap();
        let mut reports = engine.subscribe();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let id = engine.enqueue(project()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(setup.executed.lock().unwrap().is_empty());

        setup.network.set(Connectivity::Reachable);

        let report = next_report(&mut reports).await;
        assert_eq!(report.synced, 1);
        assert_eq!(*setup.executed.lock().unwrap(), [id]);
        engine.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn retry_failed_reruns_discarded_jobs() {
        let setup = Setup::new(Connectivity::Reachable);
        let engine = setup
            .builder()
            .with_handler(
                setup
                    .project_handler()
                    .then(Err(HandlerError::terminal("rejected"))),
            )
            .start()
            .await
            .unwrap();
        let mut reports = engine.subscribe();
        next_report(&mut reports).await;

        let id = engine.enqueue(project()).await.unwrap();
        assert_eq!(next_report(&mut reports).await.discarded, 1);

        assert_eq!(engine.retry_failed().await.unwrap(), 1);

        assert_eq!(next_report(&mut reports).await.synced, 1);
        let job = engine.store().get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 1);
        engine.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn start_recovers_interrupted_jobs() {
        let setup = Setup::new(Connectivity::Offline);
        let id = setup
            .store
            .enqueue(fixtures::project_job(Priority::Normal))
            .await
            .unwrap();
        setup.store.mark_processing(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let engine = setup
            .builder()
            .with_config(EngineConfig::new().with_processing_grace(Duration::ZERO))
            .start()
            .await
            .unwrap();

        let job = engine.store().get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        engine.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn job_interrupted_just_before_restart_runs_on_first_pass() {
        let setup = Setup::new(Connectivity::Reachable);
        let id = setup
            .store
            .enqueue(fixtures::project_job(Priority::Normal))
            .await
            .unwrap();
        setup.store.mark_processing(id).await.unwrap();

        let engine = setup
            .builder()
            .with_handler(setup.project_handler())
            .start()
            .await
            .unwrap();
        let mut reports = engine.subscribe();

        let report = next_report(&mut reports).await;
        assert_eq!(report.synced, 1);
        assert_eq!(*setup.executed.lock().unwrap(), [id]);
        let job = engine.store().get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 2);
        engine.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn configured_max_attempts_applies_to_unlimited_jobs() {
        let setup = Setup::new(Connectivity::Offline);
        let engine = setup
            .builder()
            .with_config(EngineConfig::new().with_max_attempts(7))
            .start()
            .await
            .unwrap();

        let default = engine.enqueue(project()).await.unwrap();
        let explicit = engine
            .enqueue(project().with_max_attempts(2))
            .await
            .unwrap();

        let default = engine.store().get(default).await.unwrap().unwrap();
        let explicit = engine.store().get(explicit).await.unwrap().unwrap();
        assert_eq!(default.max_attempts, 7);
        assert_eq!(explicit.max_attempts, 2);
        engine.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn run_pass_now_reports_offline() {
        let setup = Setup::new(Connectivity::Offline);
        let engine = setup.builder().start().await.unwrap();

        assert_eq!(engine.run_pass_now().await.unwrap(), PassOutcome::Offline);
        assert_eq!(
            engine.run_background_task().await.unwrap(),
            PassOutcome::Offline
        );
        engine.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn clear_completed_keeps_other_jobs() {
        let setup = Setup::new(Connectivity::Offline);
        let engine = setup
            .builder()
            .with_handler(setup.project_handler())
            .start()
            .await
            .unwrap();
        let done = engine.enqueue(project()).await.unwrap();
        let waiting = engine.enqueue(project()).await.unwrap();
        engine.store().mark_processing(done).await.unwrap();
        engine.store().mark_completed(done).await.unwrap();

        assert_eq!(engine.clear_completed().await.unwrap(), 1);

        let remaining: Vec<_> = engine
            .queue(&Query::All)
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.id)
            .collect();
        assert_eq!(remaining, [waiting]);
        assert_eq!(engine.counts().await.unwrap().pending, 1);
        engine.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn host_triggers_start_passes() {
        let setup = Setup::new(Connectivity::Reachable);
        let (handle, trigger) = wake_channel();
        let engine = setup
            .builder()
            .with_handler(setup.project_handler())
            .with_trigger(trigger)
            .start()
            .await
            .unwrap();
        let mut reports = engine.subscribe();
        next_report(&mut reports).await;
        setup.store.enqueue(project().build()).await.unwrap();

        assert!(handle.wake(TriggerSource::BackgroundWake));

        let report = next_report(&mut reports).await;
        assert_eq!(report.source, TriggerSource::BackgroundWake);
        assert_eq!(report.synced, 1);
        engine.graceful_shutdown().await.unwrap();
    }
}
