//! On-disk session directories and their persisted metadata
//!
//! Each session owns `<control_dir>/<id>/` holding:
//!
//! - `session.json`: the [`SessionInfo`] snapshot
//! - `stream-out`: the asciicast recording
//! - `stdin`: input FIFO
//! - `control`: control FIFO (resize/kill messages)

use crate::launch::LaunchSpec;
use crate::{lock, PtyError};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use uuid::Uuid;

pub const SESSION_FILE: &str = "session.json";
pub const STREAM_OUT_FILE: &str = "stream-out";
pub const STDIN_FIFO: &str = "stdin";
pub const CONTROL_FIFO: &str = "control";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Exited,
}

/// Persisted description of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub launch: LaunchSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Seconds since the Unix epoch
    pub started_at: u64,
}

/// A session directory and its in-memory metadata
#[derive(Debug)]
pub struct Session {
    id: String,
    dir: PathBuf,
    info: Mutex<SessionInfo>,
}

impl Session {
    /// Allocate a fresh identifier under `control_dir`. Nothing touches the
    /// filesystem until the PTY session is created.
    pub fn new(control_dir: impl AsRef<Path>, name: Option<String>, launch: LaunchSpec) -> Self {
        let id = Uuid::new_v4().to_string();
        let dir = control_dir.as_ref().join(&id);
        let info = SessionInfo {
            id: id.clone(),
            name,
            launch,
            pid: None,
            status: SessionStatus::Starting,
            exit_code: None,
            started_at: unix_now(),
        };
        Self {
            id,
            dir,
            info: Mutex::new(info),
        }
    }

    /// Load a session from its directory
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, PtyError> {
        let dir = dir.as_ref().to_path_buf();
        let path = dir.join(SESSION_FILE);
        let contents = fs::read(&path).map_err(|source| PtyError::Persistence {
            path: path.clone(),
            source,
        })?;
        let info: SessionInfo =
            serde_json::from_slice(&contents).map_err(|e| PtyError::Persistence {
                path: path.clone(),
                source: io::Error::new(io::ErrorKind::InvalidData, e),
            })?;
        Ok(Self {
            id: info.id.clone(),
            dir,
            info: Mutex::new(info),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn info_path(&self) -> PathBuf {
        self.dir.join(SESSION_FILE)
    }

    pub fn stream_out_path(&self) -> PathBuf {
        self.dir.join(STREAM_OUT_FILE)
    }

    pub fn stdin_path(&self) -> PathBuf {
        self.dir.join(STDIN_FIFO)
    }

    pub fn control_path(&self) -> PathBuf {
        self.dir.join(CONTROL_FIFO)
    }

    /// Snapshot of the current metadata
    pub fn info(&self) -> SessionInfo {
        lock(&self.info).clone()
    }

    pub fn launch(&self) -> LaunchSpec {
        lock(&self.info).launch.clone()
    }

    pub fn status(&self) -> SessionStatus {
        lock(&self.info).status
    }

    pub fn exit_code(&self) -> Option<i32> {
        lock(&self.info).exit_code
    }

    pub fn pid(&self) -> Option<u32> {
        lock(&self.info).pid
    }

    /// Persist the running state. Memory is only updated once the snapshot
    /// is on disk.
    pub(crate) fn mark_running(&self, pid: u32) -> Result<(), PtyError> {
        let mut next = self.info();
        next.pid = Some(pid);
        next.status = SessionStatus::Running;
        write_info(&self.info_path(), &next)?;
        *lock(&self.info) = next;
        Ok(())
    }

    /// Record the exit code. Returns `false` if one was already recorded.
    pub(crate) fn mark_exited(&self, code: i32) -> bool {
        let mut info = lock(&self.info);
        if info.exit_code.is_some() {
            return false;
        }
        info.exit_code = Some(code);
        info.status = SessionStatus::Exited;
        true
    }

    /// Write `session.json` atomically
    pub fn save(&self) -> Result<(), PtyError> {
        let info = self.info();
        write_info(&self.info_path(), &info)
    }

    /// Whether the recorded process still exists
    pub fn is_alive(&self) -> bool {
        match self.pid() {
            Some(pid) if pid > 0 => kill(Pid::from_raw(pid as i32), None).is_ok(),
            _ => false,
        }
    }
}

fn write_info(path: &Path, info: &SessionInfo) -> Result<(), PtyError> {
    let persistence = |source: io::Error| PtyError::Persistence {
        path: path.to_path_buf(),
        source,
    };
    let json = serde_json::to_vec_pretty(info)
        .map_err(|e| persistence(io::Error::new(io::ErrorKind::InvalidData, e)))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(persistence)?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        persistence(e)
    })
}

/// All sessions found under `control_dir`, oldest first. Directories without
/// a readable `session.json` are skipped.
pub fn list_sessions(control_dir: impl AsRef<Path>) -> Result<Vec<Session>, PtyError> {
    let control_dir = control_dir.as_ref();
    let entries = match fs::read_dir(control_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(PtyError::Persistence {
                path: control_dir.to_path_buf(),
                source,
            })
        }
    };

    let mut sessions = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.join(SESSION_FILE).exists() {
            continue;
        }
        match Session::load(&path) {
            Ok(session) => sessions.push(session),
            Err(e) => warn!("Skipping unreadable session at {}: {}", path.display(), e),
        }
    }
    sessions.sort_by_key(|session| session.info().started_at);
    debug!("Found {} sessions in {}", sessions.len(), control_dir.display());
    Ok(sessions)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn launch() -> LaunchSpec {
        LaunchSpec {
            cmdline: vec!["cat".to_string()],
            ..LaunchSpec::default()
        }
    }

    #[test]
    fn new_session_is_starting_without_touching_disk() {
        let control = tempdir().unwrap();
        let session = Session::new(control.path(), None, launch());
        assert_eq!(session.status(), SessionStatus::Starting);
        assert!(session.dir().starts_with(control.path()));
        assert!(!session.dir().exists());
    }

    #[test]
    fn running_state_round_trips_through_disk() {
        let control = tempdir().unwrap();
        let session = Session::new(control.path(), Some("build".to_string()), launch());
        fs::create_dir_all(session.dir()).unwrap();
        session.mark_running(4242).unwrap();

        let loaded = Session::load(session.dir()).unwrap();
        assert_eq!(loaded.id(), session.id());
        assert_eq!(loaded.status(), SessionStatus::Running);
        assert_eq!(loaded.pid(), Some(4242));
        assert_eq!(loaded.info().name.as_deref(), Some("build"));
        assert_eq!(loaded.launch().cmdline, vec!["cat".to_string()]);
    }

    #[test]
    fn failed_persist_leaves_memory_untouched() {
        let control = tempdir().unwrap();
        let session = Session::new(control.path(), None, launch());
        // directory was never created
        assert!(matches!(
            session.mark_running(1),
            Err(PtyError::Persistence { .. })
        ));
        assert_eq!(session.status(), SessionStatus::Starting);
        assert_eq!(session.pid(), None);
    }

    #[test]
    fn exit_code_is_set_once() {
        let control = tempdir().unwrap();
        let session = Session::new(control.path(), None, launch());
        assert!(session.mark_exited(3));
        assert!(!session.mark_exited(0));
        assert_eq!(session.exit_code(), Some(3));
        assert_eq!(session.status(), SessionStatus::Exited);
    }

    #[test]
    fn status_serializes_lowercase() {
        let control = tempdir().unwrap();
        let session = Session::new(control.path(), None, launch());
        let json = serde_json::to_value(session.info()).unwrap();
        assert_eq!(json["status"], "starting");
        assert_eq!(json["term"], "xterm-256color");
        assert_eq!(json["width"], 80);
    }

    #[test]
    fn list_skips_foreign_directories() {
        let control = tempdir().unwrap();
        fs::create_dir(control.path().join("not-a-session")).unwrap();
        let session = Session::new(control.path(), None, launch());
        fs::create_dir_all(session.dir()).unwrap();
        session.save().unwrap();

        let sessions = list_sessions(control.path()).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id(), session.id());
    }

    #[test]
    fn list_of_missing_directory_is_empty() {
        let control = tempdir().unwrap();
        let sessions = list_sessions(control.path().join("absent")).unwrap();
        assert!(sessions.is_empty());
    }

    #[test]
    fn dead_pid_is_not_alive() {
        let control = tempdir().unwrap();
        let session = Session::new(control.path(), None, launch());
        assert!(!session.is_alive());
    }
}
