//! Low-level PTY allocation and management
//!
//! Provides platform-specific PTY handling for Unix-like systems

use crate::PtyError;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::termios::{self, InputFlags, LocalFlags, OutputFlags, SetArg, Termios};
use nix::unistd::setsid;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::pin::Pin;
use std::process::{Command, Stdio};
use std::task::{ready, Context, Poll};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::Child;

/// Terminal dimensions in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
}

impl WindowSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    fn to_winsize(self) -> Winsize {
        Winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }
}

impl std::fmt::Display for WindowSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// A pseudo-terminal pair
pub struct Pty {
    /// Master side, kept by the parent
    master: PtyMaster,

    /// Slave side, handed to the child as its controlling terminal
    slave: OwnedFd,
}

/// Master side of a PTY
#[derive(Debug)]
pub struct PtyMaster {
    fd: OwnedFd,
}

impl Pty {
    /// Allocate a new PTY pair
    ///
    /// The master is non-blocking and neither side leaks into spawned children.
    pub fn new() -> Result<Self, PtyError> {
        let OpenptyResult { master, slave } =
            openpty(None::<&Winsize>, None::<&Termios>).map_err(|e| PtyError::allocation("PTY", e))?;

        set_cloexec(master.as_raw_fd()).map_err(|e| PtyError::allocation("PTY", e))?;
        set_cloexec(slave.as_raw_fd()).map_err(|e| PtyError::allocation("PTY", e))?;
        set_nonblocking(master.as_raw_fd()).map_err(|e| PtyError::allocation("PTY", e))?;

        Ok(Self {
            master: PtyMaster { fd: master },
            slave,
        })
    }

    /// Configure the slave for interactive use: signal keys, line editing and echo.
    ///
    /// Raw mode is never applied here; only an attaching client puts its own
    /// terminal into raw mode.
    pub fn configure_line_discipline(&self) -> Result<(), PtyError> {
        let mut attrs = termios::tcgetattr(self.slave.as_fd())
            .map_err(|e| PtyError::allocation("PTY line discipline", e))?;

        attrs.local_flags |= LocalFlags::ISIG
            | LocalFlags::ICANON
            | LocalFlags::ECHO
            | LocalFlags::ECHOE
            | LocalFlags::ECHOK
            | LocalFlags::IEXTEN;
        attrs.input_flags |= InputFlags::ICRNL;
        attrs.output_flags |= OutputFlags::OPOST | OutputFlags::ONLCR;

        termios::tcsetattr(self.slave.as_fd(), SetArg::TCSANOW, &attrs)
            .map_err(|e| PtyError::allocation("PTY line discipline", e))
    }

    /// Resize the PTY
    pub fn resize(&self, size: WindowSize) -> Result<(), PtyError> {
        self.master
            .set_window_size(size)
            .map_err(|e| PtyError::allocation(format!("PTY size {size}"), e))
    }

    /// Get the master side of the PTY
    pub fn master(&self) -> &PtyMaster {
        &self.master
    }

    /// Spawn a process in the PTY
    ///
    /// The child gets a new session with the slave as its controlling
    /// terminal and stdio. The parent's copies of the slave are closed before
    /// this returns so the master sees EOF once the child side hangs up.
    pub fn spawn(self, mut command: Command) -> Result<(PtyMaster, Child), PtyError> {
        let Pty { master, slave } = self;

        let stdin = slave
            .try_clone()
            .map_err(|e| PtyError::allocation("PTY slave", e))?;
        let stdout = slave
            .try_clone()
            .map_err(|e| PtyError::allocation("PTY slave", e))?;
        command
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(slave));

        // SAFETY: the closure only issues async-signal-safe syscalls
        unsafe {
            command.pre_exec(|| {
                setsid().map_err(io::Error::from)?;
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut command = tokio::process::Command::from(command);
        let spawned = command.spawn();
        // Drops the slave descriptors held by the command
        drop(command);

        match spawned {
            Ok(child) => Ok((master, child)),
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied) => {
                Err(PtyError::Configuration(format!("cannot execute command: {e}")))
            }
            Err(e) => Err(PtyError::allocation("subprocess", e)),
        }
    }
}

impl PtyMaster {
    /// Apply a new window size to the PTY
    pub fn set_window_size(&self, size: WindowSize) -> io::Result<()> {
        let winsize = size.to_winsize();

        // SAFETY: TIOCSWINSZ reads a winsize struct that outlives the call
        let ret = unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                libc::TIOCSWINSZ as _,
                &winsize as *const Winsize,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Current window size as seen by the kernel
    pub fn window_size(&self) -> io::Result<WindowSize> {
        let mut winsize = WindowSize::default().to_winsize();

        // SAFETY: TIOCGWINSZ writes into a winsize struct we own
        let ret = unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                libc::TIOCGWINSZ as _,
                &mut winsize as *mut Winsize,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(WindowSize::new(winsize.ws_col, winsize.ws_row))
    }

    /// Duplicate the master descriptor
    ///
    /// The copy shares the open file description, including `O_NONBLOCK`.
    pub fn try_clone(&self) -> io::Result<PtyMaster> {
        Ok(PtyMaster {
            fd: self.fd.try_clone()?,
        })
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

impl AsRawFd for PtyMaster {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl AsFd for PtyMaster {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Async wrapper for PTY master
///
/// Registers the (non-blocking) master with the tokio reactor so reads and
/// writes wait on readiness instead of occupying a blocking thread.
pub struct AsyncPtyMaster {
    inner: AsyncFd<PtyMaster>,
}

impl AsyncPtyMaster {
    /// Create from a PtyMaster
    pub fn new(master: PtyMaster) -> io::Result<Self> {
        Ok(Self {
            inner: AsyncFd::new(master)?,
        })
    }

    /// Read whatever output is available, waiting for readiness first.
    ///
    /// Returns `Ok(0)` once the slave side has hung up.
    pub async fn read_some(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|inner| read_fd(inner.as_raw_fd(), buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write as much of `data` as the PTY accepts, waiting for readiness first.
    pub async fn write_some(&self, data: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.writable().await?;
            match guard.try_io(|inner| write_fd(inner.as_raw_fd(), data)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Access the wrapped master
    pub fn get_ref(&self) -> &PtyMaster {
        self.inner.get_ref()
    }
}

impl AsyncRead for AsyncPtyMaster {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            let mut guard = ready!(this.inner.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| read_fd(inner.as_raw_fd(), unfilled)) {
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

impl AsyncWrite for AsyncPtyMaster {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            let mut guard = ready!(this.inner.poll_write_ready(cx))?;
            match guard.try_io(|inner| write_fd(inner.as_raw_fd(), buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

pub(crate) fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: buf is valid for writes of buf.len() bytes
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len()) };
    if n < 0 {
        let err = io::Error::last_os_error();
        // Linux reports a hung-up slave as EIO rather than EOF
        if err.raw_os_error() == Some(libc::EIO) {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(n as usize)
}

fn write_fd(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    // SAFETY: data is valid for reads of data.len() bytes
    let n = unsafe { libc::write(fd, data.as_ptr().cast::<libc::c_void>(), data.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}
