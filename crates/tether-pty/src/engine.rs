//! Session run loop
//!
//! One task multiplexes PTY output, the stdin FIFO, the control FIFO and
//! subprocess exit with `tokio::select!`. Output goes to the recorder in the
//! order it is read; stdin bytes are buffered and written to the PTY as it
//! becomes writable, so a slow subprocess never stalls the output path.

use crate::control::{ControlError, ControlMessage};
use crate::fifo::FifoReader;
use crate::pty::{AsyncPtyMaster, WindowSize};
use crate::reaper::{exit_code, reap_orphans, UNKNOWN_EXIT_CODE};
use crate::session::PtySession;
use crate::{lock, ControlDecoder, PtyError};
use std::io;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace, warn};

const MAX_WRITE_RETRIES: u32 = 5;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(10);
const STDIN_ERROR_BACKOFF: Duration = Duration::from_millis(1);
/// How long the drain waits for more output after the subprocess exits
const DRAIN_QUIET_PERIOD: Duration = Duration::from_millis(100);
/// Stdin reads pause while this much input is waiting for the PTY
const MAX_PENDING_INPUT: usize = 64 * 1024;
const STDIN_CHUNK: usize = 4096;
const CONTROL_CHUNK: usize = 1024;

/// How a PTY write error is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoClass {
    /// Retried, never surfaced
    Transient,
    /// Ends the run loop
    Fatal,
}

impl IoClass {
    pub(crate) fn of_write_error(e: &io::Error) -> Self {
        // EIO is how Linux reports a slave hangup racing the write
        if e.raw_os_error() == Some(libc::EIO) {
            return IoClass::Transient;
        }
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted => IoClass::Transient,
            _ => IoClass::Fatal,
        }
    }
}

/// What to do with pending input after a PTY write fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    /// Back off and try the same bytes again
    Retry,
    /// Give up on the pending bytes and keep running
    Discard,
    /// End the run loop
    Fatal,
}

/// Consecutive transient write failures for the pending input
#[derive(Debug, Default)]
pub(crate) struct WriteRetries {
    failures: u32,
}

impl WriteRetries {
    pub(crate) fn succeeded(&mut self) {
        self.failures = 0;
    }

    pub(crate) fn failed(&mut self, e: &io::Error) -> WriteOutcome {
        if IoClass::of_write_error(e) == IoClass::Fatal {
            return WriteOutcome::Fatal;
        }
        self.failures += 1;
        if self.failures > MAX_WRITE_RETRIES {
            self.failures = 0;
            WriteOutcome::Discard
        } else {
            WriteOutcome::Retry
        }
    }
}

impl PtySession {
    /// Drive the session until the subprocess terminates or an
    /// unrecoverable I/O error occurs.
    ///
    /// Teardown always runs: the exit code is recorded, `session.json` is
    /// persisted, orphans are reaped and the session is closed. The first
    /// error encountered is returned. May only be called once.
    pub async fn run(&self) -> Result<(), PtyError> {
        let diagnostics = self.options.diagnostics.clone();
        diagnostics.instrument(self.run_inner()).await
    }

    async fn run_inner(&self) -> Result<(), PtyError> {
        let mut child = lock(&self.child).take().ok_or(PtyError::AlreadyRunning)?;
        info!(session = %self.session().id(), pid = self.pid(), "Run loop started");

        let mut status = None;
        let result = self.pump(&mut child, &mut status).await;
        if let Err(e) = &result {
            error!(session = %self.session().id(), "Run loop failed: {}", e);
        }

        let code = self.await_exit(&mut child, status, result.is_err()).await;
        self.finish(code, result)
    }

    async fn pump(
        &self,
        child: &mut Child,
        status: &mut Option<ExitStatus>,
    ) -> Result<(), PtyError> {
        let master = self.async_master()?;
        let stdin_path = self.session().stdin_path();
        let mut stdin = FifoReader::open(&stdin_path).map_err(|source| PtyError::Channel {
            path: stdin_path.clone(),
            source,
        })?;
        let mut control = self.open_control();
        let mut decoder = ControlDecoder::new();

        let mut output = vec![0u8; self.options.read_buffer_size.max(1)];
        let mut input = vec![0u8; STDIN_CHUNK];
        let mut control_buf = [0u8; CONTROL_CHUNK];
        let mut pending: Vec<u8> = Vec::new();
        let mut retries = WriteRetries::default();

        loop {
            tokio::select! {
                read = master.read_some(&mut output) => match read {
                    Ok(0) => {
                        debug!("PTY reached EOF");
                        return Ok(());
                    }
                    Ok(n) => self.record_output(&output[..n])?,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(PtyError::fatal("PTY read failed", e)),
                },

                written = master.write_some(&pending), if !pending.is_empty() => match written {
                    Ok(n) => {
                        trace!(bytes = n, "Wrote input to PTY");
                        pending.drain(..n);
                        retries.succeeded();
                    }
                    Err(e) => match retries.failed(&e) {
                        WriteOutcome::Retry => sleep(WRITE_RETRY_DELAY).await,
                        WriteOutcome::Discard => {
                            warn!(
                                "Dropping {} bytes of input after {} retries: {}",
                                pending.len(),
                                MAX_WRITE_RETRIES,
                                e
                            );
                            pending.clear();
                        }
                        WriteOutcome::Fatal => return Err(PtyError::fatal("PTY write failed", e)),
                    },
                },

                read = stdin.read(&mut input), if pending.len() < MAX_PENDING_INPUT => match read {
                    Ok(n) => {
                        trace!(bytes = n, "Received stdin");
                        pending.extend_from_slice(&input[..n]);
                    }
                    Err(e) => {
                        warn!("Stdin read failed (non-fatal): {}", e);
                        sleep(STDIN_ERROR_BACKOFF).await;
                    }
                },

                read = read_control(&mut control, &mut control_buf) => match read {
                    Ok(n) => {
                        for message in decoder.feed(&control_buf[..n]) {
                            self.dispatch_control(message);
                        }
                    }
                    Err(e) => {
                        warn!("Control channel failed, disabling it: {}", e);
                        control = None;
                    }
                },

                exited = child.wait() => {
                    match exited {
                        Ok(exit) => {
                            debug!(?exit, "Subprocess exited");
                            *status = Some(exit);
                        }
                        Err(e) => warn!("Failed to collect subprocess status: {}", e),
                    }
                    return self.drain(&master, &mut output).await;
                }
            }
        }
    }

    fn open_control(&self) -> Option<FifoReader> {
        if !self.control_enabled() {
            return None;
        }
        let path = self.session().control_path();
        match FifoReader::open(&path) {
            Ok(reader) => Some(reader),
            Err(e) => {
                warn!("Failed to open control FIFO {}: {}", path.display(), e);
                None
            }
        }
    }

    pub(crate) fn record_output(&self, data: &[u8]) -> Result<(), PtyError> {
        trace!(bytes = data.len(), "PTY output");
        lock(&self.recorder).write_output(data)?;
        Ok(())
    }

    fn dispatch_control(&self, message: Result<ControlMessage, ControlError>) {
        match message {
            Ok(ControlMessage::Resize { cols, rows }) => {
                if let Err(e) = self.apply_resize(WindowSize::new(cols, rows)) {
                    warn!("Control resize to {}x{} failed: {}", cols, rows, e);
                }
            }
            Ok(ControlMessage::Kill { signal }) => {
                if let Err(e) = self.kill(ControlMessage::kill_signal(signal)) {
                    warn!("Control kill failed: {}", e);
                }
            }
            Err(e) => warn!("Ignoring control message: {}", e),
        }
    }

    /// Record output still buffered in the PTY after the subprocess exited.
    ///
    /// Ends at EOF, or once no output has arrived for the quiet period
    /// (a surviving grandchild can keep the slave open).
    async fn drain(&self, master: &AsyncPtyMaster, buf: &mut [u8]) -> Result<(), PtyError> {
        loop {
            match timeout(DRAIN_QUIET_PERIOD, master.read_some(buf)).await {
                Err(_) | Ok(Ok(0)) => return Ok(()),
                Ok(Ok(n)) => self.record_output(&buf[..n])?,
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                Ok(Err(e)) => {
                    debug!("Drain stopped: {}", e);
                    return Ok(());
                }
            }
        }
    }

    async fn await_exit(&self, child: &mut Child, status: Option<ExitStatus>, failed: bool) -> i32 {
        if let Some(status) = status {
            return exit_code(status);
        }
        if failed {
            if let Err(e) = child.start_kill() {
                debug!("Could not kill subprocess: {}", e);
            }
        }
        match child.wait().await {
            Ok(status) => exit_code(status),
            Err(e) => {
                warn!("Exit status unavailable, recording {}: {}", UNKNOWN_EXIT_CODE, e);
                UNKNOWN_EXIT_CODE
            }
        }
    }

    fn finish(&self, code: i32, result: Result<(), PtyError>) -> Result<(), PtyError> {
        let session = self.session();
        if !session.mark_exited(code) {
            debug!(session = %session.id(), "Exit code already recorded");
        }

        {
            let mut recorder = lock(&self.recorder);
            if !recorder.is_closed() {
                if let Err(e) = recorder.write_exit(code) {
                    warn!(session = %session.id(), "Failed to record exit: {}", e);
                }
            }
        }

        let persisted = session.save();
        if let Err(e) = &persisted {
            error!(session = %session.id(), "{}", e);
        }

        let reaped = reap_orphans();
        if reaped > 0 {
            debug!(reaped, "Reaped orphaned processes");
        }

        let closed = self.close();
        info!(session = %session.id(), exit_code = code, "Session exited");
        result.and(persisted).and(closed)
    }
}

async fn read_control(control: &mut Option<FifoReader>, buf: &mut [u8]) -> io::Result<usize> {
    match control {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{PtyOptions, SessionBuilder};
    use crate::store::{Session, SessionStatus};
    use serial_test::serial;

    #[test]
    fn broken_pipe_is_transient() {
        for kind in [
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::WouldBlock,
            io::ErrorKind::Interrupted,
        ] {
            assert_eq!(IoClass::of_write_error(&io::Error::from(kind)), IoClass::Transient);
        }
    }

    #[test]
    fn other_write_errors_are_fatal() {
        let e = io::Error::from_raw_os_error(libc::EBADF);
        assert_eq!(IoClass::of_write_error(&e), IoClass::Fatal);
        let e = io::Error::from_raw_os_error(libc::ENOSPC);
        assert_eq!(IoClass::of_write_error(&e), IoClass::Fatal);
    }

    #[test]
    fn hangup_during_write_is_transient() {
        let e = io::Error::from_raw_os_error(libc::EIO);
        assert_eq!(IoClass::of_write_error(&e), IoClass::Transient);
    }

    #[test]
    fn transient_failures_retry_then_discard() {
        let mut retries = WriteRetries::default();
        let hangup = io::Error::from_raw_os_error(libc::EIO);
        for _ in 0..MAX_WRITE_RETRIES {
            assert_eq!(retries.failed(&hangup), WriteOutcome::Retry);
        }
        assert_eq!(retries.failed(&hangup), WriteOutcome::Discard);

        // the next chunk gets a fresh budget
        assert_eq!(
            retries.failed(&io::Error::from(io::ErrorKind::BrokenPipe)),
            WriteOutcome::Retry
        );
    }

    #[test]
    fn successful_write_resets_retries() {
        let mut retries = WriteRetries::default();
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        for _ in 0..MAX_WRITE_RETRIES {
            retries.failed(&reset);
        }
        retries.succeeded();
        assert_eq!(retries.failed(&reset), WriteOutcome::Retry);
    }

    #[test]
    fn fatal_write_error_ends_loop() {
        let mut retries = WriteRetries::default();
        let e = io::Error::from_raw_os_error(libc::EBADF);
        assert_eq!(retries.failed(&e), WriteOutcome::Fatal);
    }

    #[tokio::test]
    #[serial]
    async fn recording_failure_kills_subprocess_and_keeps_exit_code() {
        let control = tempfile::tempdir().unwrap();
        let session = SessionBuilder::new()
            .command(["sh", "-c", "while :; do echo tick; sleep 0.05; done"])
            .build(control.path());
        let pty = PtySession::create(session.clone(), PtyOptions::default()).unwrap();
        let full = std::fs::OpenOptions::new()
            .write(true)
            .open("/dev/full")
            .unwrap();
        lock(&pty.recorder).redirect(full);

        let result = timeout(Duration::from_secs(10), pty.run())
            .await
            .expect("Run loop should stop on a recording failure");
        assert!(matches!(result, Err(PtyError::Recording(_))), "got {result:?}");

        let killed = Some(128 + libc::SIGKILL);
        assert_eq!(session.status(), SessionStatus::Exited);
        assert_eq!(session.exit_code(), killed);
        let persisted = Session::load(session.dir()).unwrap();
        assert_eq!(persisted.status(), SessionStatus::Exited);
        assert_eq!(persisted.exit_code(), killed);
    }
}
