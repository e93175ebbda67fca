//! High-level PTY session management
//!
//! A [`PtySession`] owns one subprocess running on a freshly allocated PTY,
//! the session's recording stream and its input conduits. It is shared as
//! `Arc<PtySession>` so that [`PtySession::resize`] and
//! [`PtySession::attach`] can be used while [`PtySession::run`] is active.
//!
//! Only one consumer should read PTY output at a time: either the run loop
//! or an attachment. Both reading concurrently splits the output between
//! them unpredictably.

use crate::diagnostics::Diagnostics;
use crate::fifo::create_fifo;
use crate::launch::LaunchSpec;
use crate::pty::{AsyncPtyMaster, Pty, PtyMaster, WindowSize};
use crate::recorder::{AsciinemaHeader, StreamRecorder};
use crate::store::{Session, SessionStatus};
use crate::{lock, PtyError};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::process::Child;
use tracing::{debug, info, warn};

const DEFAULT_READ_BUFFER: usize = 32 * 1024;

/// Runtime options for a PTY session
#[derive(Debug, Clone)]
pub struct PtyOptions {
    /// Sink for the session's diagnostics
    pub diagnostics: Diagnostics,

    /// Whether to create the control FIFO
    pub control_channel: bool,

    /// Size of the PTY read buffer used by the run loop
    pub read_buffer_size: usize,
}

impl Default for PtyOptions {
    fn default() -> Self {
        Self {
            diagnostics: Diagnostics::inherit(),
            control_channel: true,
            read_buffer_size: DEFAULT_READ_BUFFER,
        }
    }
}

/// A subprocess on a PTY with its recording and conduits
pub struct PtySession {
    session: Arc<Session>,
    pid: u32,
    master: Mutex<Option<PtyMaster>>,
    pub(crate) child: Mutex<Option<Child>>,
    pub(crate) recorder: Mutex<StreamRecorder>,
    resize_lock: Mutex<()>,
    control_enabled: bool,
    pub(crate) raw_mode: AtomicBool,
    pub(crate) options: PtyOptions,
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("session", &self.session.id())
            .field("pid", &self.pid)
            .field("control_enabled", &self.control_enabled)
            .finish_non_exhaustive()
    }
}

impl PtySession {
    /// Start the session's subprocess.
    ///
    /// Either everything (PTY, subprocess, recording, conduits and
    /// `session.json`) is in place on return, or nothing this call created
    /// is left behind. Must be called from within a Tokio runtime.
    pub fn create(session: Arc<Session>, options: PtyOptions) -> Result<Self, PtyError> {
        let diagnostics = options.diagnostics.clone();
        diagnostics.in_scope(|| Self::create_inner(session, options))
    }

    fn create_inner(session: Arc<Session>, options: PtyOptions) -> Result<Self, PtyError> {
        let launch = session.launch();
        launch.validate()?;

        let argv = launch.resolve_command();
        let size = launch.window_size();
        debug!(session = %session.id(), command = ?argv, %size, "Creating PTY session");

        let mut cleanup = CreationCleanup::default();
        let dir = session.dir();
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(|e| PtyError::allocation("session directory", e))?;
            cleanup.dir = Some(dir.to_path_buf());
        }

        let pty = Pty::new()?;
        pty.configure_line_discipline()?;
        pty.resize(size)?;

        let (master, child) = pty.spawn(launch.build_command(&argv))?;
        let pid = child.id().unwrap_or(0);
        cleanup.pid = pid;
        debug!(session = %session.id(), pid, "Subprocess spawned");

        let recording_path = session.stream_out_path();
        let mut recorder = StreamRecorder::create(&recording_path)
            .map_err(|e| PtyError::allocation("recording stream", e))?;
        cleanup.files.push(recording_path);
        let header = AsciinemaHeader::new(size, argv.join(" "), launch.env.clone());
        recorder
            .write_header(&header)
            .map_err(|e| PtyError::allocation("recording header", io::Error::other(e)))?;

        let stdin_path = session.stdin_path();
        create_fifo(&stdin_path).map_err(|source| PtyError::Channel {
            path: stdin_path.clone(),
            source,
        })?;
        cleanup.files.push(stdin_path);

        let control_enabled = options.control_channel && {
            let control_path = session.control_path();
            match create_fifo(&control_path) {
                Ok(()) => {
                    cleanup.files.push(control_path);
                    true
                }
                Err(e) => {
                    warn!(
                        "Failed to create control FIFO {}, continuing without it: {}",
                        control_path.display(),
                        e
                    );
                    false
                }
            }
        };

        session.mark_running(pid)?;
        cleanup.disarm();
        info!(session = %session.id(), pid, "Session running");

        Ok(Self {
            session,
            pid,
            master: Mutex::new(Some(master)),
            child: Mutex::new(Some(child)),
            recorder: Mutex::new(recorder),
            resize_lock: Mutex::new(()),
            control_enabled,
            raw_mode: AtomicBool::new(false),
            options,
        })
    }

    /// Subprocess id, 0 if unknown
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn recording_path(&self) -> PathBuf {
        self.session.stream_out_path()
    }

    pub fn control_enabled(&self) -> bool {
        self.control_enabled
    }

    /// Effective PTY dimensions
    pub fn window_size(&self) -> Result<WindowSize, PtyError> {
        let master = lock(&self.master);
        let master = master.as_ref().ok_or(PtyError::Closed)?;
        Ok(master.window_size()?)
    }

    /// Resize the PTY and record the change.
    ///
    /// The new size is in effect when this returns. Recording the event is
    /// best-effort; errors here never affect the run loop.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.options
            .diagnostics
            .in_scope(|| self.apply_resize(WindowSize::new(cols, rows)))
    }

    pub(crate) fn apply_resize(&self, size: WindowSize) -> Result<(), PtyError> {
        if size.cols == 0 || size.rows == 0 {
            return Err(PtyError::Resize(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid size {size}"),
            )));
        }

        let _serialized = lock(&self.resize_lock);
        // Held across the ioctl so output caused by the resize is recorded after it
        let mut recorder = lock(&self.recorder);
        {
            let master = lock(&self.master);
            let master = master.as_ref().ok_or(PtyError::Closed)?;
            master.set_window_size(size).map_err(PtyError::Resize)?;
        }
        if !recorder.is_closed() {
            if let Err(e) = recorder.write_resize(size) {
                warn!(session = %self.session.id(), "Failed to record resize to {}: {}", size, e);
            }
        }
        debug!(session = %self.session.id(), %size, "PTY resized");
        Ok(())
    }

    /// Send `signal` to the subprocess
    ///
    /// Fails with [`PtyError::Closed`] once the session has exited, since the
    /// pid may belong to another process by then.
    pub fn kill(&self, signal: i32) -> Result<(), PtyError> {
        if self.pid == 0 || self.session.status() == SessionStatus::Exited {
            return Err(PtyError::Closed);
        }
        let signal = Signal::try_from(signal).map_err(io::Error::from)?;
        debug!(session = %self.session.id(), pid = self.pid, ?signal, "Signalling subprocess");
        kill(Pid::from_raw(self.pid as i32), signal).map_err(io::Error::from)?;
        Ok(())
    }

    /// A new async handle on the PTY master, for output consumers
    pub fn async_master(&self) -> Result<AsyncPtyMaster, PtyError> {
        let master = lock(&self.master);
        let master = master.as_ref().ok_or(PtyError::Closed)?;
        Ok(AsyncPtyMaster::new(master.try_clone()?)?)
    }

    /// Close the recording and the PTY, restoring the local terminal if an
    /// attachment left it raw. Safe to call more than once.
    pub fn close(&self) -> Result<(), PtyError> {
        let recorded = lock(&self.recorder).close();
        if lock(&self.master).take().is_some() {
            debug!(session = %self.session.id(), "PTY closed");
        }
        if self.raw_mode.swap(false, Ordering::SeqCst) {
            crate::attach::restore_local_terminal();
        }
        recorded.map_err(PtyError::from)
    }
}

/// Undoes a partially completed [`PtySession::create`] unless disarmed
#[derive(Default)]
struct CreationCleanup {
    dir: Option<PathBuf>,
    files: Vec<PathBuf>,
    pid: u32,
    disarmed: bool,
}

impl CreationCleanup {
    fn disarm(&mut self) {
        self.disarmed = true;
    }
}

impl Drop for CreationCleanup {
    fn drop(&mut self) {
        if self.disarmed {
            return;
        }
        if self.pid > 0 {
            let _ = kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL);
        }
        for file in self.files.iter().rev() {
            if let Err(e) = fs::remove_file(file) {
                debug!("Cleanup could not remove {}: {}", file.display(), e);
            }
        }
        if let Some(dir) = &self.dir {
            if let Err(e) = fs::remove_dir_all(dir) {
                debug!("Cleanup could not remove {}: {}", dir.display(), e);
            }
        }
    }
}

/// Builder for session launch specs
#[derive(Debug, Default)]
pub struct SessionBuilder {
    name: Option<String>,
    launch: LaunchSpec,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the command and its arguments; the default shell runs otherwise
    pub fn command<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.launch.cmdline = argv.into_iter().map(Into::into).collect();
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.launch.cwd = Some(cwd.into());
        self
    }

    /// Set terminal dimensions
    pub fn size(mut self, cols: u16, rows: u16) -> Self {
        self.launch.width = cols;
        self.launch.height = rows;
        self
    }

    pub fn term(mut self, term: impl Into<String>) -> Self {
        self.launch.term = term.into();
        self
    }

    /// Add an entry to the recorded environment snapshot
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.launch.env.insert(key.into(), value.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn launch_spec(&self) -> &LaunchSpec {
        &self.launch
    }

    /// Allocate a session under `control_dir`
    pub fn build(self, control_dir: impl AsRef<Path>) -> Arc<Session> {
        Arc::new(Session::new(control_dir, self.name, self.launch))
    }
}
