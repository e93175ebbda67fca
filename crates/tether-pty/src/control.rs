//! Out-of-band control messages carried over the control FIFO
//!
//! One JSON object per line, e.g. `{"cmd":"resize","cols":120,"rows":40}`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lines longer than this are discarded rather than buffered forever
pub const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum ControlMessage {
    Resize {
        cols: u16,
        rows: u16,
    },
    Kill {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
    },
}

impl ControlMessage {
    /// Encode as a single newline-terminated line
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Signal to deliver for a kill request
    pub fn kill_signal(signal: Option<i32>) -> i32 {
        signal.unwrap_or(libc::SIGTERM)
    }
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Malformed control message {line:?}: {source}")]
    Parse {
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Control line exceeded {0} bytes")]
    LineTooLong(usize),
}

/// Splits a byte stream into control messages
#[derive(Debug, Default)]
pub struct ControlDecoder {
    buf: Vec<u8>,
    discarding: bool,
}

impl ControlDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every complete line decoded
    pub fn feed(&mut self, data: &[u8]) -> Vec<Result<ControlMessage, ControlError>> {
        let mut messages = Vec::new();
        for &byte in data {
            if byte != b'\n' {
                if !self.discarding {
                    self.buf.push(byte);
                    if self.buf.len() > MAX_LINE_LEN {
                        self.buf.clear();
                        self.discarding = true;
                        messages.push(Err(ControlError::LineTooLong(MAX_LINE_LEN)));
                    }
                }
                continue;
            }

            if std::mem::take(&mut self.discarding) {
                continue;
            }
            let line = std::mem::take(&mut self.buf);
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches('\r').trim();
            if line.is_empty() {
                continue;
            }
            messages.push(
                serde_json::from_str(line).map_err(|source| ControlError::Parse {
                    line: line.to_string(),
                    source,
                }),
            );
        }
        messages
    }
}
