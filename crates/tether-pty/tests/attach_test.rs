//! Attachment bridging, exercised without a real terminal

mod common;

use common::{finish, TIMEOUT};
use serial_test::serial;
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;
use tether_pty::recorder::read_recording;
use tether_pty::{PtyError, PtyOptions, PtySession, SessionBuilder, SessionStatus, WindowSize};
use tether_test_utils::TestControlDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

#[tokio::test]
#[serial]
async fn test_attach_resize_detach_leaves_session_running() {
    let control = TestControlDir::new().unwrap();
    let session = SessionBuilder::new()
        .command(["cat"])
        .build(control.path());
    let pty = Arc::new(PtySession::create(session.clone(), PtyOptions::default()).unwrap());

    let (mut local_input, bridge_input) = tokio::io::duplex(1024);
    let (bridge_output, mut local_output) = tokio::io::duplex(64 * 1024);
    let (sizes, size_rx) = mpsc::channel(4);
    let bridge = tokio::spawn({
        let pty = pty.clone();
        async move { pty.bridge(bridge_input, bridge_output, size_rx).await }
    });

    local_input.write_all(b"ping\n").await.unwrap();
    let mut seen = Vec::new();
    timeout(TIMEOUT, async {
        let mut buf = [0u8; 256];
        while !String::from_utf8_lossy(&seen).contains("ping\r\nping\r\n") {
            let n = local_output.read(&mut buf).await.unwrap();
            assert!(n > 0, "PTY output ended early");
            seen.extend_from_slice(&buf[..n]);
        }
    })
    .await
    .expect("Should see the echo and cat's copy");

    sizes.send(WindowSize::new(90, 30)).await.unwrap();
    timeout(TIMEOUT, async {
        while pty.window_size().unwrap() != WindowSize::new(90, 30) {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Resize from the attachment should apply");

    // detach by closing local input
    drop(local_input);
    timeout(TIMEOUT, bridge)
        .await
        .expect("Bridge should end when local input closes")
        .unwrap()
        .expect("Bridge should finish cleanly");

    assert_eq!(session.status(), SessionStatus::Running);
    assert!(session.is_alive(), "Detaching must not stop the subprocess");
    assert_eq!(session.exit_code(), None);

    // the engine can still take over the session afterwards
    let runner = tokio::spawn({
        let pty = pty.clone();
        async move { pty.run().await }
    });
    pty.kill(libc::SIGTERM).unwrap();
    finish(runner).await.unwrap();
    assert_eq!(session.exit_code(), Some(128 + libc::SIGTERM));

    let recording = read_recording(pty.recording_path()).unwrap();
    assert!(recording
        .events
        .iter()
        .any(|e| e.window_size() == Some(WindowSize::new(90, 30))));
    // output forwarded while attached is part of the recording
    assert!(recording.output().contains("ping\r\nping\r\n"));
}

#[tokio::test]
#[serial]
async fn test_bridge_ends_when_subprocess_exits() {
    let control = TestControlDir::new().unwrap();
    let session = SessionBuilder::new()
        .command(["sh", "-c", "echo bye"])
        .build(control.path());
    let pty = Arc::new(PtySession::create(session.clone(), PtyOptions::default()).unwrap());

    // local input that never closes
    let (_local_input, bridge_input) = tokio::io::duplex(64);
    let (bridge_output, mut local_output) = tokio::io::duplex(4096);
    let (_sizes, size_rx) = mpsc::channel(1);

    timeout(TIMEOUT, pty.bridge(bridge_input, bridge_output, size_rx))
        .await
        .expect("Bridge should end at PTY EOF")
        .unwrap();

    let mut seen = String::new();
    local_output.read_to_string(&mut seen).await.unwrap();
    assert!(seen.contains("bye"), "got {seen:?}");

    pty.run().await.unwrap();
    assert_eq!(session.exit_code(), Some(0));
    let recording = read_recording(pty.recording_path()).unwrap();
    assert!(recording.output().contains("bye"), "attached output must be recorded");
    assert_eq!(recording.exit_code(), Some(0));
}

#[tokio::test]
#[serial]
async fn test_attach_requires_terminal() {
    if std::io::stdin().is_terminal() {
        // Attaching for real would take over the developer's terminal
        return;
    }
    let control = TestControlDir::new().unwrap();
    let session = SessionBuilder::new()
        .command(["true"])
        .build(control.path());
    let pty = PtySession::create(session, PtyOptions::default()).unwrap();

    assert!(matches!(pty.attach().await, Err(PtyError::NotATerminal)));
    pty.run().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_bridge_on_closed_session_fails() {
    let control = TestControlDir::new().unwrap();
    let session = SessionBuilder::new()
        .command(["true"])
        .build(control.path());
    let pty = PtySession::create(session, PtyOptions::default()).unwrap();
    pty.run().await.unwrap();

    let (_input, bridge_input) = tokio::io::duplex(64);
    let (bridge_output, _output) = tokio::io::duplex(64);
    let (_sizes, size_rx) = mpsc::channel(1);
    let result = pty.bridge(bridge_input, bridge_output, size_rx).await;
    assert!(matches!(result, Err(PtyError::Closed)));
}
