//! Named pipes that let detached clients feed a session

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tracing::trace;

/// Pause before reopening a FIFO whose last writer went away
const REOPEN_DELAY: Duration = Duration::from_micros(500);

/// Create an owner-only FIFO at `path`
pub fn create_fifo(path: &Path) -> io::Result<()> {
    mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(io::Error::from)
}

/// Reader end of a FIFO that outlives any individual writer
#[derive(Debug)]
pub struct FifoReader {
    path: PathBuf,
    rx: pipe::Receiver,
}

impl FifoReader {
    /// Open without blocking for a writer. Must be called inside a runtime.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let rx = open_receiver(&path)?;
        Ok(Self { path, rx })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the next chunk. Writer disconnects are absorbed by reopening, so
    /// this never reports end-of-file.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.rx.read(buf).await?;
            if n > 0 {
                return Ok(n);
            }
            trace!("Writer closed {}, reopening", self.path.display());
            tokio::time::sleep(REOPEN_DELAY).await;
            self.rx = open_receiver(&self.path)?;
        }
    }
}

fn open_receiver(path: &Path) -> io::Result<pipe::Receiver> {
    let mut options = pipe::OpenOptions::new();
    // Holding a write handle ourselves keeps the pipe from hitting EOF
    #[cfg(target_os = "linux")]
    options.read_write(true);
    options.open_receiver(path)
}

/// Open the writer end of a session FIFO. Fails with `ENXIO` when no session
/// is reading it.
pub fn open_sender(path: &Path) -> io::Result<pipe::Sender> {
    pipe::OpenOptions::new().open_sender(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::{FileTypeExt, PermissionsExt};
    use tokio::io::AsyncWriteExt;

    #[test]
    fn fifo_is_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdin");
        create_fifo(&path).unwrap();
        let metadata = std::fs::metadata(&path).unwrap();
        assert!(metadata.file_type().is_fifo());
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn create_over_existing_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdin");
        create_fifo(&path).unwrap();
        assert!(create_fifo(&path).is_err());
    }

    #[tokio::test]
    async fn reader_survives_successive_writers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdin");
        create_fifo(&path).unwrap();
        let mut reader = FifoReader::open(&path).unwrap();

        let mut buf = [0u8; 64];
        for message in [&b"first"[..], &b"second"[..]] {
            let mut tx = open_sender(&path).unwrap();
            tx.write_all(message).await.unwrap();
            drop(tx);
            let n = reader.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], message);
        }
    }

    #[tokio::test]
    async fn reader_waits_without_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdin");
        create_fifo(&path).unwrap();
        let mut reader = FifoReader::open(&path).unwrap();

        let mut buf = [0u8; 16];
        let pending =
            tokio::time::timeout(Duration::from_millis(50), reader.read(&mut buf)).await;
        assert!(pending.is_err(), "read should still be waiting");
    }
}
