use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tether_pty::launch::DEFAULT_TERM;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Filter directive for this level
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Tether - persistent, recorded terminal sessions")]
pub struct Args {
    /// Directory holding session directories [default: ~/.tether/control]
    #[arg(long, env = "TETHER_CONTROL_DIR", global = true)]
    pub control_path: Option<PathBuf>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    /// The control directory to use
    pub fn control_dir(&self) -> Result<PathBuf> {
        if let Some(path) = &self.control_path {
            return Ok(path.clone());
        }
        let home = dirs::home_dir().context("Cannot determine home directory; pass --control-path")?;
        Ok(home.join(".tether").join("control"))
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a new session and run it until the command exits
    Spawn(SpawnArgs),

    /// List sessions
    List,

    /// Send text to a session's stdin
    Send {
        /// Session id, id prefix or name
        session: String,

        /// Text to send
        text: String,

        /// Don't append a newline
        #[arg(long)]
        no_newline: bool,
    },

    /// Resize a session's terminal
    Resize {
        /// Session id, id prefix or name
        session: String,
        cols: u16,
        rows: u16,
    },

    /// Signal a session's process
    Kill {
        /// Session id, id prefix or name
        session: String,

        /// Signal number [default: SIGTERM]
        #[arg(short, long)]
        signal: Option<i32>,
    },

    /// Print a session's recorded output
    Cat {
        /// Session id, id prefix or name
        session: String,
    },
}

#[derive(clap::Args, Debug)]
pub struct SpawnArgs {
    /// Display name for the session
    #[arg(long)]
    pub name: Option<String>,

    /// Working directory for the command
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Terminal width
    #[arg(long, default_value_t = 80)]
    pub cols: u16,

    /// Terminal height
    #[arg(long, default_value_t = 24)]
    pub rows: u16,

    /// Terminal type
    #[arg(long, default_value = DEFAULT_TERM)]
    pub term: String,

    /// Don't create the control FIFO
    #[arg(long)]
    pub no_control: bool,

    /// Attach this terminal before running headless
    #[arg(long)]
    pub attach: bool,

    /// Command to run [default: $SHELL]
    #[arg(last = true)]
    pub command: Vec<String>,
}
