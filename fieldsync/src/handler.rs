//! The per-kind execution seam of the engine.
//!
//! A [`SyncHandler`] performs the remote submission for one [`JobKind`]. Handlers never touch
//! job state: they report success or a classified [`HandlerError`] and the scheduler records
//! the outcome in the [`crate::store::JobStore`].
use std::{fmt::Display, sync::Arc};

use async_trait::async_trait;
use fxhash::FxHashMap;
use thiserror::Error;

use crate::{
    job::{JobKind, SyncJob},
    remote::RemoteError,
    tracker::TrackerError,
};

/// Executes the remote side effects of one kind of [`SyncJob`].
///
/// Implementations must be idempotent with respect to full re-execution: a failed attempt is
/// retried from the first step.
#[async_trait]
pub trait SyncHandler: Send + Sync {
    /// The kind of job this handler executes.
    fn kind(&self) -> JobKind;

    async fn execute(&self, job: &SyncJob) -> Result<(), HandlerError>;
}

/// Whether a failed job may succeed if attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient failure; the job is retried after its backoff while attempts remain.
    Retryable,
    /// The job can never succeed as submitted; it is discarded immediately.
    Terminal,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retryable => f.write_str("retryable"),
            Self::Terminal => f.write_str("terminal"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl HandlerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Terminal,
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == ErrorKind::Terminal
    }

    pub(crate) fn payload_mismatch(expected: JobKind, job: &SyncJob) -> Self {
        Self::terminal(format!(
            "{expected} handler received a {} payload for job {}",
            job.payload.kind(),
            job.id
        ))
    }
}

impl From<RemoteError> for HandlerError {
    fn from(error: RemoteError) -> Self {
        if error.is_retryable() {
            Self::retryable(error.to_string())
        } else {
            Self::terminal(error.to_string())
        }
    }
}

impl From<TrackerError> for HandlerError {
    fn from(error: TrackerError) -> Self {
        Self::retryable(format!("failed to update entity state: {error}"))
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound => Self::terminal(format!("local file missing: {error}")),
            _ => Self::retryable(format!("failed to read local file: {error}")),
        }
    }
}

impl From<tokio::task::JoinError> for HandlerError {
    fn from(value: tokio::task::JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self::retryable(format!("handler panicked: {message}"))
    }
}

/// Handlers keyed by the job kind they execute.
#[derive(Clone, Default)]
pub struct Handlers {
    handlers: FxHashMap<JobKind, Arc<dyn SyncHandler>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler`, replacing any handler previously registered for its kind.
    pub fn register(&mut self, handler: Arc<dyn SyncHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn with(mut self, handler: impl SyncHandler + 'static) -> Self {
        self.register(Arc::new(handler));
        self
    }

    /// Registers every handler of `other`, replacing existing handlers of the same kinds.
    pub fn merge(&mut self, other: Handlers) {
        self.handlers.extend(other.handlers);
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn SyncHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> impl Iterator<Item = JobKind> + '_ {
        self.handlers.keys().copied()
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.kinds()).finish()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use assert_matches::assert_matches;

    use super::*;
    use crate::job::JobId;

    /// Records executions and replays scripted results, defaulting to success.
    #[derive(Clone)]
    pub(crate) struct ScriptedHandler {
        kind: JobKind,
        results: Arc<Mutex<VecDeque<Result<(), HandlerError>>>>,
        executed: Arc<Mutex<Vec<JobId>>>,
    }

    impl ScriptedHandler {
        pub(crate) fn new(kind: JobKind, executed: Arc<Mutex<Vec<JobId>>>) -> Self {
            Self {
                kind,
                results: Default::default(),
                executed,
            }
        }

        pub(crate) fn then(self, result: Result<(), HandlerError>) -> Self {
            self.results.lock().unwrap().push_back(result);
            self
        }
    }

    #[async_trait]
    impl SyncHandler for ScriptedHandler {
        fn kind(&self) -> JobKind {
            self.kind
        }

        async fn execute(&self, job: &SyncJob) -> Result<(), HandlerError> {
            self.executed.lock().unwrap().push(job.id);
            self.results.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    pub(crate) struct PanickingHandler;

    #[async_trait]
    impl SyncHandler for PanickingHandler {
        fn kind(&self) -> JobKind {
            JobKind::Project
        }

        async fn execute(&self, _job: &SyncJob) -> Result<(), HandlerError> {
            panic!("handler exploded")
        }
    }

    #[test]
    fn remote_errors_are_classified() {
        let error: HandlerError = RemoteError::Timeout.into();
        assert_eq!(error.kind, ErrorKind::Retryable);

        let error: HandlerError = RemoteError::Status {
            status: 503,
            body: String::new(),
        }
        .into();
        assert_eq!(error.kind, ErrorKind::Retryable);

        let error: HandlerError = RemoteError::Status {
            status: 422,
            body: "invalid polygon".to_owned(),
        }
        .into();
        assert!(error.is_terminal());
        assert!(error.message.contains("invalid polygon"));

        let error: HandlerError = RemoteError::Unauthorized.into();
        assert!(error.is_terminal());
    }

    #[test]
    fn io_errors_are_classified() {
        let error: HandlerError = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert!(error.is_terminal());

        let error: HandlerError = std::io::Error::from(std::io::ErrorKind::Interrupted).into();
        assert_matches!(error.kind, ErrorKind::Retryable);
    }

    #[tokio::test]
    async fn panics_become_retryable_errors() {
        let join_error = tokio::spawn(async { panic!("boom") }).await.unwrap_err();
        let error = HandlerError::from(join_error);

        assert_eq!(error.kind, ErrorKind::Retryable);
        assert!(error.message.contains("boom"));
    }

    #[test]
    fn registering_replaces_by_kind() {
        let executed = Arc::new(Mutex::new(vec![]));
        let handlers = Handlers::new()
            .with(ScriptedHandler::new(JobKind::Photo, executed.clone()))
            .with(ScriptedHandler::new(JobKind::Photo, executed))
            .with(PanickingHandler);

        let mut kinds: Vec<_> = handlers.kinds().map(JobKind::as_str).collect();
        kinds.sort();
        assert_eq!(kinds, ["photo", "project"]);
        assert!(handlers.get(JobKind::Metadata).is_none());
    }
}
