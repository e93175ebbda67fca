//! Injectable debug logging for session operations

use std::fmt;
use std::future::Future;
use tracing::instrument::{WithDispatch, WithSubscriber};
use tracing::subscriber::NoSubscriber;
use tracing::Dispatch;

/// Where a session's diagnostics go. Defaults to the caller's current
/// subscriber; tests install their own to capture or silence output.
#[derive(Clone, Default)]
pub struct Diagnostics {
    dispatch: Option<Dispatch>,
}

impl Diagnostics {
    pub fn inherit() -> Self {
        Self::default()
    }

    pub fn silent() -> Self {
        Self::to(Dispatch::new(NoSubscriber::default()))
    }

    pub fn to(dispatch: Dispatch) -> Self {
        Self {
            dispatch: Some(dispatch),
        }
    }

    /// Run synchronous work under this sink
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        match &self.dispatch {
            Some(dispatch) => tracing::dispatcher::with_default(dispatch, f),
            None => f(),
        }
    }

    /// Attach this sink to a future
    pub fn instrument<F: Future>(&self, fut: F) -> WithDispatch<F> {
        match &self.dispatch {
            Some(dispatch) => fut.with_subscriber(dispatch.clone()),
            None => fut.with_current_subscriber(),
        }
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Diagnostics")
            .field("custom", &self.dispatch.is_some())
            .finish()
    }
}
