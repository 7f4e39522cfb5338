//! The purpose of this module is to alleviate the need to import many of the `[fieldsync]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use fieldsync::prelude::*;
//! ```
pub use crate::backoff::BackoffStrategy;
pub use crate::backoff::Jitter;
pub use crate::backoff::Strategy;
pub use crate::config::EngineConfig;
pub use crate::handler::{ErrorKind, HandlerError, Handlers, SyncHandler};
pub use crate::job::builder::JobBuilder;
pub use crate::job::query::Query;
pub use crate::job::{
    JobId, JobKind, JobPayload, JobStatus, MetadataPatch, PhotoSnapshot, Priority,
    ProjectSnapshot, SyncJob,
};
pub use crate::network::{Connectivity, NetworkMonitor};
pub use crate::scheduler::{PassOutcome, PassReport};
pub use crate::store::{JobStore, Retry};
pub use crate::tracker::{EntityRef, EntityStateTracker, SyncState};
pub use crate::trigger::{SchedulerTrigger, TriggerSource, WakeHandle};
pub use crate::{EngineError, SyncEngine};
