//! Launch specifications and subprocess environment hygiene

use crate::pty::WindowSize;
use crate::PtyError;
use nix::unistd::{access, AccessFlags};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Variables copied from the parent environment; everything else is dropped.
pub const ENV_ALLOWLIST: &[&str] = &["TERM", "SHELL", "LANG", "LC_ALL", "PATH", "USER", "HOME"];

pub const DEFAULT_TERM: &str = "xterm-256color";

/// Tried in order when `SHELL` is unset
const FALLBACK_SHELLS: &[&str] = &["/bin/bash", "/bin/sh"];

/// Everything needed to start a session's subprocess
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchSpec {
    /// Command and arguments; empty means the default shell
    #[serde(default)]
    pub cmdline: Vec<String>,
    /// Working directory; `None` inherits the caller's
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    pub term: String,
    pub width: u16,
    pub height: u16,
    /// Environment snapshot recorded in the session header
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for LaunchSpec {
    fn default() -> Self {
        let size = WindowSize::default();
        Self {
            cmdline: Vec::new(),
            cwd: None,
            term: DEFAULT_TERM.to_string(),
            width: size.cols,
            height: size.rows,
            env: BTreeMap::new(),
        }
    }
}

impl LaunchSpec {
    pub fn window_size(&self) -> WindowSize {
        WindowSize::new(self.width, self.height)
    }

    /// The argument vector to execute
    pub fn resolve_command(&self) -> Vec<String> {
        if self.cmdline.is_empty() {
            vec![default_shell()]
        } else {
            self.cmdline.clone()
        }
    }

    /// Reject specs that can never start, before anything is allocated
    pub fn validate(&self) -> Result<(), PtyError> {
        if self.width == 0 || self.height == 0 {
            return Err(PtyError::Configuration(format!(
                "terminal size {}x{} must be non-zero",
                self.width, self.height
            )));
        }
        if self.cmdline.first().is_some_and(|program| program.is_empty()) {
            return Err(PtyError::Configuration("command must not be empty".to_string()));
        }
        if let Some(cwd) = &self.cwd {
            let metadata = std::fs::metadata(cwd).map_err(|e| {
                PtyError::Configuration(format!(
                    "working directory '{}' not accessible: {e}",
                    cwd.display()
                ))
            })?;
            if !metadata.is_dir() {
                return Err(PtyError::Configuration(format!(
                    "working directory '{}' is not a directory",
                    cwd.display()
                )));
            }
            access(cwd.as_path(), AccessFlags::X_OK).map_err(|e| {
                PtyError::Configuration(format!(
                    "working directory '{}' not accessible: {e}",
                    cwd.display()
                ))
            })?;
        }
        Ok(())
    }

    /// Build the command for `argv` with a sanitized environment
    pub(crate) fn build_command(&self, argv: &[String]) -> Command {
        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command.env_clear();
        command.envs(filter_environment(std::env::vars_os(), &self.term, &argv[0]));
        command
    }
}

/// The user's default shell, falling back to `/bin/bash` or `/bin/sh`
pub fn default_shell() -> String {
    pick_shell(std::env::var("SHELL").ok(), FALLBACK_SHELLS)
}

/// `shell` if set, else the first existing candidate, else the last one
fn pick_shell(shell: Option<String>, candidates: &[&str]) -> String {
    if let Some(shell) = shell.filter(|shell| !shell.is_empty()) {
        return shell;
    }
    candidates
        .iter()
        .find(|candidate| Path::new(candidate).exists())
        .or(candidates.last())
        .map(|candidate| candidate.to_string())
        .unwrap_or_default()
}

/// Keep only allow-listed variables, then synthesize `TERM` and `SHELL` if
/// the parent did not provide them.
pub fn filter_environment<I>(vars: I, term: &str, shell: &str) -> Vec<(OsString, OsString)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut env: Vec<(OsString, OsString)> = vars
        .into_iter()
        .filter(|(key, _)| {
            key.to_str()
                .is_some_and(|key| ENV_ALLOWLIST.contains(&key))
        })
        .collect();

    let has = |env: &[(OsString, OsString)], name: &str| env.iter().any(|(key, _)| key == OsStr::new(name));
    if !has(&env, "TERM") {
        env.push(("TERM".into(), term.into()));
    }
    if !has(&env, "SHELL") {
        env.push(("SHELL".into(), shell.into()));
    }
    env
}
