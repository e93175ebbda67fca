//! PTY session core for Tether
//!
//! Runs a subprocess inside a pseudo-terminal whose whole lifetime (input,
//! output, resizes and exit) is recorded to an asciicast stream, independent
//! of any attached viewer. Input arrives through named FIFOs so that detached
//! clients can drive the session.

pub mod attach;
pub mod control;
pub mod diagnostics;
pub mod engine;
pub mod fifo;
pub mod launch;
pub mod pty;
pub mod reaper;
pub mod recorder;
pub mod session;
pub mod store;

pub use attach::{ensure_terminal, NonBlockingInput, TerminalGuard};
pub use control::{ControlDecoder, ControlError, ControlMessage};
pub use diagnostics::Diagnostics;
pub use fifo::FifoReader;
pub use launch::LaunchSpec;
pub use pty::{AsyncPtyMaster, Pty, PtyMaster, WindowSize};
pub use recorder::{AsciinemaHeader, EventKind, RecordedEvent, Recording, RecorderError, StreamRecorder};
pub use session::{PtyOptions, PtySession, SessionBuilder};
pub use store::{list_sessions, Session, SessionInfo, SessionStatus};

use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Invalid launch configuration: {0}")]
    Configuration(String),

    #[error("Failed to allocate {context}: {source}")]
    ResourceAllocation {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to create conduit {}: {source}", path.display())]
    Channel {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{context}: {source}")]
    FatalIo {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Recording failed: {0}")]
    Recording(#[from] RecorderError),

    #[error("Failed to persist session state to {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to resize PTY: {0}")]
    Resize(#[source] io::Error),

    #[error("Standard input is not a terminal")]
    NotATerminal,

    #[error("PTY session is closed")]
    Closed,

    #[error("Session run loop already started")]
    AlreadyRunning,

    #[error("PTY I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl PtyError {
    pub(crate) fn allocation(context: impl Into<String>, source: impl Into<io::Error>) -> Self {
        PtyError::ResourceAllocation {
            context: context.into(),
            source: source.into(),
        }
    }

    pub(crate) fn fatal(context: impl Into<String>, source: io::Error) -> Self {
        PtyError::FatalIo {
            context: context.into(),
            source,
        }
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
