//! Command-line front end for tether sessions

pub mod cli;
pub mod commands;
pub mod logging;

use anyhow::Result;
use clap::Parser;

/// Parse the command line, set up logging and execute the command.
///
/// Returns the process exit code.
pub async fn run() -> Result<i32> {
    let args = cli::Args::parse();
    logging::init(args.log_level, args.log_file.as_deref())?;
    commands::execute(args).await
}
