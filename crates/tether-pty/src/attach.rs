//! Bridging a local terminal to a running session
//!
//! An attachment borrows the PTY for as long as it lasts and never touches
//! the subprocess or the session state; detaching leaves both running.
//! While attached, the bridge is the PTY's only output consumer, so it
//! records what it forwards.

use crate::pty::{read_fd, WindowSize};
use crate::session::PtySession;
use crate::PtyError;
use crossterm::terminal;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use std::io::{self, IsTerminal};
use std::os::fd::{AsRawFd, RawFd};
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::task::{ready, Context, Poll};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::debug;

/// RAII guard for the local terminal's raw mode.
///
/// Whatever path leaves the attachment, dropping the guard restores the
/// terminal to the mode it had before.
#[derive(Debug, Default)]
pub struct TerminalGuard {
    raw_mode_enabled: bool,
}

impl TerminalGuard {
    pub fn acquire() -> Self {
        Self::default()
    }

    /// Enable raw mode on the terminal.
    pub fn enable_raw_mode(&mut self) -> Result<(), PtyError> {
        if !self.raw_mode_enabled {
            terminal::enable_raw_mode()?;
            self.raw_mode_enabled = true;
        }
        Ok(())
    }

    /// Disable raw mode on the terminal.
    pub fn disable_raw_mode(&mut self) -> Result<(), PtyError> {
        if self.raw_mode_enabled {
            terminal::disable_raw_mode()?;
            self.raw_mode_enabled = false;
        }
        Ok(())
    }

    pub fn is_raw_mode(&self) -> bool {
        self.raw_mode_enabled
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if self.raw_mode_enabled {
            let _ = terminal::disable_raw_mode();
        }
    }
}

/// Refuse anything that is not an interactive terminal
pub fn ensure_terminal(stream: &impl IsTerminal) -> Result<(), PtyError> {
    if stream.is_terminal() {
        Ok(())
    } else {
        Err(PtyError::NotATerminal)
    }
}

/// Put the local terminal back into the mode it had before raw mode
pub fn restore_local_terminal() {
    if let Err(e) = terminal::disable_raw_mode() {
        debug!("Failed to restore local terminal: {}", e);
    }
}

/// Readiness-driven reader over an inherited descriptor such as stdin.
///
/// Dropping it cancels any read in progress; nothing stays parked on a
/// blocking thread. The descriptor is switched to non-blocking mode for the
/// reader's lifetime and its original flags are restored on drop.
pub struct NonBlockingInput<T: AsRawFd> {
    inner: AsyncFd<T>,
    flags: OFlag,
}

impl<T: AsRawFd> NonBlockingInput<T> {
    pub fn new(source: T) -> io::Result<Self> {
        let fd = source.as_raw_fd();
        let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
        fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
        match AsyncFd::new(source) {
            Ok(inner) => Ok(Self { inner, flags }),
            Err(e) => {
                let _ = fcntl(fd, FcntlArg::F_SETFL(flags));
                Err(e)
            }
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.inner.get_ref().as_raw_fd()
    }
}

impl NonBlockingInput<io::Stdin> {
    pub fn stdin() -> io::Result<Self> {
        Self::new(io::stdin())
    }
}

impl<T: AsRawFd + Unpin> AsyncRead for NonBlockingInput<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            let mut guard = ready!(this.inner.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| read_fd(inner.get_ref().as_raw_fd(), unfilled)) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl<T: AsRawFd> Drop for NonBlockingInput<T> {
    fn drop(&mut self) {
        if let Err(e) = fcntl(self.raw_fd(), FcntlArg::F_SETFL(self.flags)) {
            debug!("Failed to restore descriptor flags: {}", e);
        }
    }
}

fn local_size() -> Option<WindowSize> {
    terminal::size()
        .ok()
        .map(|(cols, rows)| WindowSize::new(cols, rows))
        .filter(|size| size.cols > 0 && size.rows > 0)
}

impl PtySession {
    /// Bridge the local terminal to this session until either direction
    /// finishes or the process receives `SIGTERM`/`SIGHUP`.
    ///
    /// The local terminal is in raw mode for the duration and restored on
    /// every exit path. Its size is pushed to the PTY now and on every
    /// `SIGWINCH`.
    pub async fn attach(&self) -> Result<(), PtyError> {
        let diagnostics = self.options.diagnostics.clone();
        diagnostics.instrument(self.attach_inner()).await
    }

    async fn attach_inner(&self) -> Result<(), PtyError> {
        ensure_terminal(&io::stdin())?;

        let mut guard = TerminalGuard::acquire();
        guard.enable_raw_mode()?;
        self.raw_mode.store(true, Ordering::SeqCst);
        debug!(session = %self.session().id(), "Attached");

        let result = self.attach_terminal().await;

        if self.raw_mode.swap(false, Ordering::SeqCst) {
            if let Err(e) = guard.disable_raw_mode() {
                debug!("Failed to leave raw mode: {}", e);
            }
        }
        debug!(session = %self.session().id(), "Detached");
        result
    }

    async fn attach_terminal(&self) -> Result<(), PtyError> {
        if let Some(size) = local_size() {
            if let Err(e) = self.apply_resize(size) {
                debug!("Initial resize to {} failed: {}", size, e);
            }
        }

        let mut window_changes = signal(SignalKind::window_change())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;

        let input = NonBlockingInput::stdin()?;
        let (size_tx, size_rx) = mpsc::channel(8);
        let watcher = async move {
            while window_changes.recv().await.is_some() {
                if let Some(size) = local_size() {
                    if size_tx.send(size).await.is_err() {
                        break;
                    }
                }
            }
        };

        tokio::select! {
            result = self.bridge(input, tokio::io::stdout(), size_rx) => result,
            _ = watcher => Ok(()),
            _ = terminate.recv() => {
                debug!("Attachment interrupted by SIGTERM");
                Ok(())
            }
            _ = hangup.recv() => {
                debug!("Attachment interrupted by SIGHUP");
                Ok(())
            }
        }
    }

    /// Copy `input` into the PTY and PTY output into `output` until either
    /// direction finishes, applying every size received on `sizes`.
    ///
    /// Forwarded output is recorded before it is written out; a recording
    /// failure ends the bridge. Resize failures are logged and otherwise
    /// ignored.
    pub async fn bridge<R, W>(
        &self,
        mut input: R,
        mut output: W,
        mut sizes: mpsc::Receiver<WindowSize>,
    ) -> Result<(), PtyError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let master = self.async_master()?;
        let (mut pty_reader, mut pty_writer) = tokio::io::split(master);

        let resizer = async {
            while let Some(size) = sizes.recv().await {
                if let Err(e) = self.apply_resize(size) {
                    debug!("Resize to {} failed: {}", size, e);
                }
            }
            std::future::pending::<()>().await
        };

        let forward = async {
            let mut buf = vec![0u8; self.options.read_buffer_size.max(1)];
            let mut total = 0u64;
            loop {
                let n = pty_reader.read(&mut buf).await?;
                if n == 0 {
                    return Ok::<u64, PtyError>(total);
                }
                self.record_output(&buf[..n])?;
                output.write_all(&buf[..n]).await?;
                output.flush().await?;
                total += n as u64;
            }
        };

        tokio::select! {
            copied = tokio::io::copy(&mut input, &mut pty_writer) => {
                let bytes = copied?;
                debug!(bytes, "Local input finished");
            }
            forwarded = forward => {
                let bytes = forwarded?;
                debug!(bytes, "PTY output finished");
            }
            _ = resizer => {}
        }
        Ok(())
    }
}
