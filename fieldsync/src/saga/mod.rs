//! The built-in sync handlers: one multi-step submission per [`JobKind`].
//!
//! Each saga re-runs from its first step on every attempt. Failing any step fails the whole
//! attempt, which is safe because the remote treats repeated submissions as upserts.
//!
//! [`JobKind`]: crate::job::JobKind
use std::sync::Arc;

use crate::{handler::Handlers, remote::RemoteApi, tracker::EntityStateTracker};

mod metadata;
mod photo;
mod project;

pub use metadata::MetadataPatchSaga;
pub use photo::PhotoUploadSaga;
pub use project::ProjectSubmitSaga;

/// Handlers for every built-in job kind, sharing one remote and tracker.
pub fn default_handlers(
    remote: Arc<dyn RemoteApi>,
    tracker: Arc<dyn EntityStateTracker>,
) -> Handlers {
    Handlers::new()
        .with(PhotoUploadSaga::new(remote.clone(), tracker))
        .with(ProjectSubmitSaga::new(remote.clone()))
        .with(MetadataPatchSaga::new(remote))
}
