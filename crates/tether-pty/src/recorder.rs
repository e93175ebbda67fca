//! Asciicast session recording
//!
//! Writes an asciicast v2 stream: one JSON header line followed by
//! `[time, code, data]` event lines, each timestamped in seconds since the
//! header was written. Every event is flushed immediately so that external
//! tools can tail the recording while the session is live.
//!
//! Output that is not valid UTF-8 is written as text with U+FFFD
//! substitutions for players, plus a fourth element holding the chunk's raw
//! bytes in base64: `[time, "o", text, raw]`. Concatenating the raw bytes of
//! every output event reproduces the subprocess output exactly.

use crate::pty::WindowSize;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, trace};

/// Asciicast format version written by this recorder
pub const ASCIICAST_VERSION: u32 = 2;

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Recording I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to encode recording entry: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Recording header already written")]
    HeaderAlreadyWritten,

    #[error("Recording header must be written before any event")]
    HeaderMissing,

    #[error("Recording is closed")]
    Closed,

    #[error("Malformed recording at line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

/// First line of a recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsciinemaHeader {
    pub version: u32,
    pub width: u32,
    pub height: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl AsciinemaHeader {
    /// Header for a recording starting now
    pub fn new(size: WindowSize, command: impl Into<String>, env: BTreeMap<String, String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .ok();
        Self {
            version: ASCIICAST_VERSION,
            width: u32::from(size.cols),
            height: u32::from(size.rows),
            timestamp,
            command: Some(command.into()),
            title: None,
            env,
        }
    }
}

/// Event type codes used on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Terminal output (`"o"`)
    Output,
    /// Terminal resize (`"r"`, data is `COLSxROWS`)
    Resize,
    /// Process exit (`"x"`, data is the exit code)
    Exit,
}

impl EventKind {
    pub fn code(self) -> &'static str {
        match self {
            EventKind::Output => "o",
            EventKind::Resize => "r",
            EventKind::Exit => "x",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "o" => Some(EventKind::Output),
            "r" => Some(EventKind::Resize),
            "x" => Some(EventKind::Exit),
            _ => None,
        }
    }
}

/// One event read back from a recording
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    /// Seconds since the header
    pub time: f64,
    pub kind: EventKind,
    pub data: String,
    /// Exact output bytes, present when `data` had to substitute U+FFFD
    pub raw: Option<Vec<u8>>,
}

impl RecordedEvent {
    /// The bytes this event carries
    pub fn bytes(&self) -> &[u8] {
        self.raw.as_deref().unwrap_or(self.data.as_bytes())
    }

    /// Parse the size carried by a resize event
    pub fn window_size(&self) -> Option<WindowSize> {
        if self.kind != EventKind::Resize {
            return None;
        }
        let (cols, rows) = self.data.split_once('x')?;
        Some(WindowSize::new(cols.parse().ok()?, rows.parse().ok()?))
    }

    /// Parse the code carried by an exit event
    pub fn exit_code(&self) -> Option<i32> {
        match self.kind {
            EventKind::Exit => self.data.parse().ok(),
            _ => None,
        }
    }
}

/// A fully parsed recording
#[derive(Debug, Clone)]
pub struct Recording {
    pub header: AsciinemaHeader,
    pub events: Vec<RecordedEvent>,
}

impl Recording {
    /// All output events concatenated in order
    pub fn output(&self) -> String {
        self.events
            .iter()
            .filter(|e| e.kind == EventKind::Output)
            .map(|e| e.data.as_str())
            .collect()
    }

    /// The subprocess output exactly as it was read from the PTY
    pub fn output_bytes(&self) -> Vec<u8> {
        self.events
            .iter()
            .filter(|e| e.kind == EventKind::Output)
            .flat_map(|e| e.bytes().iter().copied())
            .collect()
    }

    /// The exit code, if the recording saw the process exit
    pub fn exit_code(&self) -> Option<i32> {
        self.events.iter().rev().find_map(RecordedEvent::exit_code)
    }
}

/// Event line as read back; the raw-bytes element is optional
#[derive(Deserialize)]
struct EventLine(f64, String, String, #[serde(default)] Option<String>);

/// Session recorder writing asciicast events to `W`
pub struct StreamRecorder<W: Write = BufWriter<File>> {
    /// `None` once closed
    writer: Option<W>,
    header_written: bool,
    start: Instant,
    /// Incomplete UTF-8 sequence carried over from the previous output chunk
    pending: Vec<u8>,
}

impl StreamRecorder<BufWriter<File>> {
    /// Create (or truncate) a recording file
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::create(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "recording opened");
        Ok(Self::new(BufWriter::new(file)))
    }

    /// Send further events to `file`
    #[cfg(test)]
    pub(crate) fn redirect(&mut self, file: File) {
        self.writer = Some(BufWriter::new(file));
    }
}

impl<W: Write> StreamRecorder<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Some(writer),
            header_written: false,
            start: Instant::now(),
            pending: Vec::new(),
        }
    }

    /// Write the header. Must be called exactly once, before any event.
    pub fn write_header(&mut self, header: &AsciinemaHeader) -> Result<(), RecorderError> {
        if self.header_written {
            return Err(RecorderError::HeaderAlreadyWritten);
        }
        let line = serde_json::to_string(header)?;
        self.write_line(&line)?;
        self.header_written = true;
        self.start = Instant::now();
        Ok(())
    }

    /// Append an output event carrying `data`
    ///
    /// A multi-byte character split across two calls is emitted whole with
    /// the second call. Invalid sequences are replaced with U+FFFD in the
    /// text and kept verbatim in the event's raw bytes.
    pub fn write_output(&mut self, data: &[u8]) -> Result<(), RecorderError> {
        self.ensure_writable()?;
        self.pending.extend_from_slice(data);
        let (text, raw) = take_utf8(&mut self.pending);
        if text.is_empty() {
            trace!(carried = self.pending.len(), "output chunk held for UTF-8 completion");
            return Ok(());
        }
        self.write_output_event(&text, raw.as_deref())
    }

    /// Append a resize event
    pub fn write_resize(&mut self, size: WindowSize) -> Result<(), RecorderError> {
        self.ensure_writable()?;
        self.flush_pending()?;
        self.write_event(EventKind::Resize, &size.to_string())
    }

    /// Append an exit event
    pub fn write_exit(&mut self, code: i32) -> Result<(), RecorderError> {
        self.ensure_writable()?;
        self.flush_pending()?;
        self.write_event(EventKind::Exit, &code.to_string())
    }

    /// Flush and finalize the stream. Safe to call more than once.
    pub fn close(&mut self) -> Result<(), RecorderError> {
        if self.writer.is_none() {
            return Ok(());
        }
        let result = if self.header_written {
            self.flush_pending()
        } else {
            Ok(())
        };
        let flushed = match self.writer.take() {
            Some(mut writer) => writer.flush(),
            None => Ok(()),
        };
        debug!("recording closed");
        result?;
        flushed?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    /// Seconds elapsed since the header was written
    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    fn ensure_writable(&self) -> Result<(), RecorderError> {
        if self.writer.is_none() {
            return Err(RecorderError::Closed);
        }
        if !self.header_written {
            return Err(RecorderError::HeaderMissing);
        }
        Ok(())
    }

    /// Emit any carried bytes so they stay ahead of the next non-output event
    fn flush_pending(&mut self) -> Result<(), RecorderError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        // only an incomplete sequence is ever carried, so this is never valid text
        let raw = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&raw).into_owned();
        self.write_output_event(&text, Some(&raw))
    }

    fn write_output_event(&mut self, text: &str, raw: Option<&[u8]>) -> Result<(), RecorderError> {
        match raw {
            Some(raw) => {
                let code = EventKind::Output.code();
                let line = serde_json::to_string(&(self.elapsed(), code, text, BASE64.encode(raw)))?;
                self.write_line(&line)
            }
            None => self.write_event(EventKind::Output, text),
        }
    }

    fn write_event(&mut self, kind: EventKind, data: &str) -> Result<(), RecorderError> {
        let line = serde_json::to_string(&(self.elapsed(), kind.code(), data))?;
        self.write_line(&line)
    }

    fn write_line(&mut self, line: &str) -> Result<(), RecorderError> {
        let writer = self.writer.as_mut().ok_or(RecorderError::Closed)?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

/// Decode the longest complete prefix of `pending`, leaving an incomplete
/// trailing sequence in place. The consumed bytes are returned alongside the
/// text when it needed substitutions.
fn take_utf8(pending: &mut Vec<u8>) -> (String, Option<Vec<u8>>) {
    let mut text = String::with_capacity(pending.len());
    let mut lossy = false;
    let mut rest: &[u8] = pending;
    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                text.push_str(valid);
                rest = &[];
                break;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                text.push_str(&String::from_utf8_lossy(valid));
                match e.error_len() {
                    Some(len) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        lossy = true;
                        rest = &after[len..];
                    }
                    None => {
                        rest = after;
                        break;
                    }
                }
            }
        }
    }
    let consumed = pending.len() - rest.len();
    let taken: Vec<u8> = pending.drain(..consumed).collect();
    (text, lossy.then_some(taken))
}

/// Load a recording from file (for replay)
pub fn read_recording(path: impl AsRef<Path>) -> Result<Recording, RecorderError> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    parse_recording(reader)
}

/// Parse a recording from any buffered reader
pub fn parse_recording(reader: impl BufRead) -> Result<Recording, RecorderError> {
    let mut lines = reader.lines().enumerate();

    let header = loop {
        let Some((index, line)) = lines.next() else {
            return Err(RecorderError::Malformed {
                line: 1,
                reason: "missing header".to_string(),
            });
        };
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        break serde_json::from_str::<AsciinemaHeader>(&line).map_err(|e| {
            RecorderError::Malformed {
                line: index + 1,
                reason: e.to_string(),
            }
        })?;
    };

    let mut events = Vec::new();
    for (index, line) in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let malformed = |reason: String| RecorderError::Malformed {
            line: index + 1,
            reason,
        };
        let EventLine(time, code, data, raw) =
            serde_json::from_str(&line).map_err(|e| malformed(e.to_string()))?;
        let raw = raw
            .map(|encoded| BASE64.decode(encoded))
            .transpose()
            .map_err(|e| malformed(format!("bad raw output: {e}")))?;
        match EventKind::from_code(&code) {
            Some(kind) => events.push(RecordedEvent {
                time,
                kind,
                data,
                raw,
            }),
            None => debug!(line = index + 1, code = %code, "skipping unknown recording event"),
        }
    }

    Ok(Recording { header, events })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn recording(&self) -> Recording {
            parse_recording(self.0.borrow().as_slice()).unwrap()
        }
    }

    fn recorder() -> (StreamRecorder<SharedBuf>, SharedBuf) {
        let buf = SharedBuf::default();
        let mut recorder = StreamRecorder::new(buf.clone());
        recorder.write_header(&header()).unwrap();
        (recorder, buf)
    }

    fn header() -> AsciinemaHeader {
        AsciinemaHeader::new(WindowSize::new(80, 24), "sh", BTreeMap::new())
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn header_is_first_line() {
        let buf = SharedBuf::default();
        let mut recorder = StreamRecorder::new(buf.clone());
        let mut env = BTreeMap::new();
        env.insert("TERM".to_string(), "xterm-256color".to_string());
        recorder
            .write_header(&AsciinemaHeader::new(WindowSize::new(120, 40), "bash -l", env))
            .unwrap();

        let first = String::from_utf8(buf.0.borrow().clone()).unwrap();
        let value: serde_json::Value = serde_json::from_str(first.lines().next().unwrap()).unwrap();
        assert_eq!(value["version"], 2);
        assert_eq!(value["width"], 120);
        assert_eq!(value["height"], 40);
        assert_eq!(value["command"], "bash -l");
        assert_eq!(value["env"]["TERM"], "xterm-256color");
    }

    #[test]
    fn events_require_header() {
        let mut recorder = StreamRecorder::new(Vec::new());
        assert!(matches!(
            recorder.write_output(b"hi"),
            Err(RecorderError::HeaderMissing)
        ));
    }

    #[test]
    fn header_written_once() {
        let (mut recorder, _buf) = recorder();
        assert!(matches!(
            recorder.write_header(&header()),
            Err(RecorderError::HeaderAlreadyWritten)
        ));
    }

    #[test]
    fn resize_is_ordered_between_output() {
        let (mut recorder, buf) = recorder();
        recorder.write_output(b"before").unwrap();
        recorder.write_resize(WindowSize::new(120, 40)).unwrap();
        recorder.write_output(b"after").unwrap();
        recorder.write_exit(3).unwrap();

        let recording = buf.recording();
        let kinds: Vec<_> = recording.events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::Output, EventKind::Resize, EventKind::Output, EventKind::Exit]
        );
        assert_eq!(recording.events[1].window_size(), Some(WindowSize::new(120, 40)));
        assert_eq!(recording.exit_code(), Some(3));
        assert_eq!(recording.output(), "beforeafter");
    }

    #[test]
    fn timestamps_are_monotonic() {
        let (mut recorder, buf) = recorder();
        for chunk in ["a", "b", "c"] {
            recorder.write_output(chunk.as_bytes()).unwrap();
        }
        let recording = buf.recording();
        let times: Vec<f64> = recording.events.iter().map(|e| e.time).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
        assert!(times[0] >= 0.0);
    }

    #[test]
    fn split_multibyte_character_is_carried() {
        let (mut recorder, buf) = recorder();
        let crab = "🦀".as_bytes();
        recorder.write_output(&crab[..2]).unwrap();
        recorder.write_output(&crab[2..]).unwrap();

        let recording = buf.recording();
        assert_eq!(recording.events.len(), 1);
        assert_eq!(recording.output(), "🦀");
    }

    #[test]
    fn invalid_bytes_keep_raw_copy() {
        let (mut recorder, buf) = recorder();
        recorder.write_output(b"a\xffb").unwrap();
        let recording = buf.recording();
        assert_eq!(recording.output(), "a\u{FFFD}b");
        assert_eq!(recording.output_bytes(), b"a\xffb");
    }

    #[test]
    fn non_utf8_output_round_trips() {
        let (mut recorder, buf) = recorder();
        recorder.write_output(b"a\xff").unwrap();
        recorder.write_output(b"\xfeb").unwrap();
        recorder.write_output(b" plain").unwrap();

        let recording = buf.recording();
        assert_eq!(recording.output_bytes(), b"a\xff\xfeb plain");
        // valid chunks stay plain three-element events
        assert_eq!(recording.events.last().unwrap().raw, None);
        let text = String::from_utf8(buf.0.borrow().clone()).unwrap();
        assert!(text.lines().last().unwrap().ends_with("\" plain\"]"));
    }

    #[test]
    fn corrupt_raw_output_is_malformed() {
        let text = "{\"version\":2,\"width\":80,\"height\":24}\n[0.1,\"o\",\"x\",\"!!not base64\"]\n";
        assert!(matches!(
            parse_recording(text.as_bytes()),
            Err(RecorderError::Malformed { line: 2, .. })
        ));
    }

    #[test]
    fn close_flushes_carried_bytes_and_is_idempotent() {
        let (mut recorder, buf) = recorder();
        recorder.write_output(&"é".as_bytes()[..1]).unwrap();
        recorder.close().unwrap();
        recorder.close().unwrap();
        assert!(recorder.is_closed());
        assert!(matches!(recorder.write_output(b"x"), Err(RecorderError::Closed)));
        assert_eq!(buf.recording().output_bytes(), &"é".as_bytes()[..1]);
    }

    #[test]
    fn close_without_events_is_fine() {
        let (mut recorder, _buf) = recorder();
        recorder.close().unwrap();
    }

    #[test]
    fn write_failure_is_escalated() {
        let mut recorder = StreamRecorder::new(FailingWriter);
        assert!(matches!(
            recorder.write_header(&header()),
            Err(RecorderError::Io(_))
        ));
    }

    #[test]
    fn unknown_event_codes_are_skipped() {
        let text = "{\"version\":2,\"width\":80,\"height\":24}\n[0.1,\"i\",\"ls\"]\n[0.2,\"o\",\"out\"]\n";
        let recording = parse_recording(text.as_bytes()).unwrap();
        assert_eq!(recording.events.len(), 1);
        assert_eq!(recording.output(), "out");
    }

    #[test]
    fn malformed_event_reports_line() {
        let text = "{\"version\":2,\"width\":80,\"height\":24}\nnot json\n";
        match parse_recording(text.as_bytes()) {
            Err(RecorderError::Malformed { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected malformed error, got {other:?}"),
        }
    }

    proptest! {
        #[test]
        fn chunked_utf8_output_reconstructs(text in "\\PC{0,64}", cuts in prop::collection::vec(0usize..256, 0..8)) {
            let bytes = text.as_bytes();
            let mut points: Vec<usize> = cuts.into_iter().map(|c| c % (bytes.len() + 1)).collect();
            points.sort_unstable();

            let (mut recorder, buf) = recorder();
            let mut start = 0;
            for point in points {
                recorder.write_output(&bytes[start..point]).unwrap();
                start = point;
            }
            recorder.write_output(&bytes[start..]).unwrap();
            recorder.close().unwrap();

            let recording = buf.recording();
            prop_assert_eq!(recording.output(), text);
        }

        #[test]
        fn chunked_binary_output_reconstructs(bytes in prop::collection::vec(any::<u8>(), 0..64), cuts in prop::collection::vec(0usize..256, 0..8)) {
            let mut points: Vec<usize> = cuts.into_iter().map(|c| c % (bytes.len() + 1)).collect();
            points.sort_unstable();

            let (mut recorder, buf) = recorder();
            let mut start = 0;
            for point in points {
                recorder.write_output(&bytes[start..point]).unwrap();
                start = point;
            }
            recorder.write_output(&bytes[start..]).unwrap();
            recorder.close().unwrap();

            prop_assert_eq!(buf.recording().output_bytes(), bytes);
        }
    }
}
