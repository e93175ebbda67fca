#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tether_pty::store::Session;
use tether_pty::{PtyError, PtyOptions, PtySession};
use tokio::task::JoinHandle;

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Create a session and start its run loop on a task
pub fn start(
    session: Arc<Session>,
    options: PtyOptions,
) -> (Arc<PtySession>, JoinHandle<Result<(), PtyError>>) {
    let pty = Arc::new(PtySession::create(session, options).expect("Should create session"));
    let runner = tokio::spawn({
        let pty = pty.clone();
        async move { pty.run().await }
    });
    (pty, runner)
}

/// Wait for the run loop to finish and return its result
pub async fn finish(runner: JoinHandle<Result<(), PtyError>>) -> Result<(), PtyError> {
    tokio::time::timeout(TIMEOUT, runner)
        .await
        .expect("Run loop should finish in time")
        .expect("Run task should not panic")
}
