use anyhow::{bail, Context, Result};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Temporary control directory holding session directories
pub struct TestControlDir {
    temp_dir: TempDir,
}

impl TestControlDir {
    pub fn new() -> Result<Self> {
        Ok(Self {
            temp_dir: TempDir::new()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Names of every entry under the control directory
    pub fn entries(&self) -> Result<Vec<PathBuf>> {
        let mut entries = std::fs::read_dir(self.path())?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<io::Result<Vec<_>>>()?;
        entries.sort();
        Ok(entries)
    }
}

/// Write `data` to a session FIFO, waiting up to `timeout` for a reader
pub async fn write_to_fifo(path: &Path, data: &[u8], timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut fifo = loop {
        match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
        {
            Ok(file) => break file,
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) && Instant::now() < deadline => {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to open {}", path.display()))
            }
        }
    };

    let mut written = 0;
    while written < data.len() {
        match fifo.write(&data[written..]) {
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock && Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to write {}", path.display()))
            }
        }
    }
    Ok(())
}

/// Concatenated output events of an asciicast recording
pub async fn recorded_output(path: &Path) -> Result<String> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let mut output = String::new();
    for line in contents.lines().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let event: serde_json::Value = serde_json::from_str(line)
            .with_context(|| format!("Malformed recording line: {line}"))?;
        if event[1] == "o" {
            if let Some(data) = event[2].as_str() {
                output.push_str(data);
            }
        }
    }
    Ok(output)
}

/// Poll a recording until its output, with ANSI escapes stripped, contains
/// `pattern`. Returns the raw output.
pub async fn wait_for_recording(path: &Path, pattern: &str, timeout: Duration) -> Result<String> {
    let start = Instant::now();
    loop {
        let output = recorded_output(path).await.unwrap_or_default();
        let stripped = strip_ansi_escapes::strip(&output);
        if String::from_utf8_lossy(&stripped).contains(pattern) {
            return Ok(output);
        }
        if start.elapsed() > timeout {
            bail!("Timeout waiting for {pattern:?} in recording; output so far: {output:?}");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
