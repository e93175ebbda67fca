use crate::cli::{Args, Command, SpawnArgs};
use anyhow::{bail, Context, Result};
use std::io;
use std::path::Path;
use std::sync::Arc;
use tether_pty::fifo::open_sender;
use tether_pty::reaper::UNKNOWN_EXIT_CODE;
use tether_pty::recorder::read_recording;
use tether_pty::{
    list_sessions, ControlMessage, Diagnostics, PtyOptions, PtySession, Session, SessionBuilder,
    SessionStatus,
};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Parent variables copied into the recorded environment snapshot
const SNAPSHOT_ENV: &[&str] = &["TERM", "SHELL"];

/// Execute a parsed command line, returning the process exit code
pub async fn execute(args: Args) -> Result<i32> {
    let control_dir = args.control_dir()?;
    match args.command {
        Command::Spawn(spawn) => spawn_session(&control_dir, spawn).await,
        Command::List => {
            list(&control_dir)?;
            Ok(0)
        }
        Command::Send {
            session,
            text,
            no_newline,
        } => {
            let session = find_session(&control_dir, &session)?;
            let mut data = text.into_bytes();
            if !no_newline {
                data.push(b'\n');
            }
            send_to_fifo(&session.stdin_path(), &data).await?;
            Ok(0)
        }
        Command::Resize {
            session,
            cols,
            rows,
        } => {
            let session = find_session(&control_dir, &session)?;
            send_control(&session, ControlMessage::Resize { cols, rows }).await?;
            Ok(0)
        }
        Command::Kill { session, signal } => {
            let session = find_session(&control_dir, &session)?;
            send_control(&session, ControlMessage::Kill { signal }).await?;
            Ok(0)
        }
        Command::Cat { session } => {
            let session = find_session(&control_dir, &session)?;
            let recording = read_recording(session.stream_out_path())
                .with_context(|| format!("Failed to read recording of {}", session.id()))?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&recording.output_bytes()).await?;
            stdout.flush().await?;
            Ok(0)
        }
    }
}

async fn spawn_session(control_dir: &Path, spawn: SpawnArgs) -> Result<i32> {
    let mut builder = SessionBuilder::new()
        .command(spawn.command)
        .size(spawn.cols, spawn.rows)
        .term(spawn.term);
    if let Some(cwd) = spawn.cwd {
        builder = builder.cwd(cwd);
    }
    if let Some(name) = spawn.name {
        builder = builder.name(name);
    }
    for key in SNAPSHOT_ENV {
        if let Ok(value) = std::env::var(key) {
            builder = builder.env(*key, value);
        }
    }

    let session = builder.build(control_dir);
    let options = PtyOptions {
        control_channel: !spawn.no_control,
        ..PtyOptions::default()
    };
    let pty = Arc::new(
        PtySession::create(session.clone(), options).context("Failed to start session")?,
    );
    println!("{}", session.id());

    if spawn.attach {
        // Logging would corrupt the raw terminal
        let attached = Diagnostics::silent().instrument(pty.attach()).await;
        match attached {
            Ok(()) => info!(session = %session.id(), "Detached, session continues"),
            Err(e) => warn!(session = %session.id(), "Attachment ended: {}", e),
        }
    }

    pty.run().await.context("Session failed")?;
    Ok(session.exit_code().unwrap_or(UNKNOWN_EXIT_CODE))
}

fn list(control_dir: &Path) -> Result<()> {
    let sessions = list_sessions(control_dir)?;
    if sessions.is_empty() {
        println!("No sessions in {}", control_dir.display());
        return Ok(());
    }

    println!(
        "{:<36}  {:<12}  {:<8}  {:>7}  {:>4}  COMMAND",
        "ID", "NAME", "STATUS", "PID", "EXIT"
    );
    for session in sessions {
        let info = session.info();
        let status = status_label(&session);
        let pid = info.pid.map(|p| p.to_string()).unwrap_or_default();
        let exit = info.exit_code.map(|c| c.to_string()).unwrap_or_default();
        println!(
            "{:<36}  {:<12}  {:<8}  {:>7}  {:>4}  {}",
            info.id,
            info.name.as_deref().unwrap_or("-"),
            status,
            pid,
            exit,
            info.launch.resolve_command().join(" ")
        );
    }
    Ok(())
}

/// Display status, noting sessions whose process vanished without an exit record
fn status_label(session: &Session) -> &'static str {
    match session.status() {
        SessionStatus::Starting => "starting",
        SessionStatus::Running if !session.is_alive() => "dead",
        SessionStatus::Running => "running",
        SessionStatus::Exited => "exited",
    }
}

/// Resolve a session by exact id, unique id prefix or name
pub fn find_session(control_dir: &Path, key: &str) -> Result<Session> {
    let sessions = list_sessions(control_dir)?;
    let mut matches: Vec<Session> = Vec::new();
    for session in sessions {
        if session.id() == key {
            return Ok(session);
        }
        let named = session.info().name.as_deref() == Some(key);
        if named || session.id().starts_with(key) {
            matches.push(session);
        }
    }
    match matches.len() {
        0 => bail!("No session matches '{key}'"),
        1 => Ok(matches.remove(0)),
        n => bail!("'{key}' is ambiguous ({n} sessions match)"),
    }
}

async fn send_control(session: &Session, message: ControlMessage) -> Result<()> {
    let line = message.to_line()?;
    send_to_fifo(&session.control_path(), line.as_bytes()).await
}

async fn send_to_fifo(path: &Path, data: &[u8]) -> Result<()> {
    let mut fifo = match open_sender(path) {
        Ok(fifo) => fifo,
        Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
            bail!("Session is not running ({} has no reader)", path.display())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            bail!("{} does not exist", path.display())
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to open {}", path.display())),
    };
    fifo.write_all(data)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
