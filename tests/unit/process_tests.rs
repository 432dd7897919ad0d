//! Unit tests for local process launch.
//!
//! The shell-driven cases run on Unix only.

use tokio::sync::mpsc;

use vm_relay::agent::process::{decode_line, run_process};
use vm_relay::protocol::{ExecuteRequest, ExecuteStreamFrame, FailureKind};

#[test]
fn decode_line_strips_terminators() {
    assert_eq!(decode_line(b"plain\n"), "plain");
    assert_eq!(decode_line(b"windows\r\n"), "windows");
    assert_eq!(decode_line(b"unterminated"), "unterminated");
    assert_eq!(decode_line(b"\n"), "");
}

#[test]
fn decode_line_replaces_invalid_utf8() {
    assert_eq!(decode_line(b"bad \xff byte\n"), "bad \u{fffd} byte");
}

#[tokio::test]
async fn empty_executable_is_invalid_request() {
    let (tx, _rx) = mpsc::channel(1);
    let err = run_process(&ExecuteRequest::default(), None, tx)
        .await
        .expect_err("empty executable");
    assert_eq!(err.kind, FailureKind::InvalidRequest);
}

/// A missing executable is a launch failure, never an exit code.
#[tokio::test]
async fn missing_executable_is_launch_failure() {
    let (tx, _rx) = mpsc::channel(1);
    let request = ExecuteRequest {
        executable: "vm-relay-definitely-not-a-program".into(),
        ..ExecuteRequest::default()
    };

    let err = run_process(&request, None, tx).await.expect_err("must fail");
    assert_eq!(err.kind, FailureKind::LaunchFailed);
    assert!(err.detail.is_some());
}

#[cfg(unix)]
fn sh(script: &str) -> ExecuteRequest {
    ExecuteRequest {
        executable: "sh".into(),
        arguments: Some(vec!["-c".into(), script.into()]),
        ..ExecuteRequest::default()
    }
}

#[cfg(unix)]
async fn collect(mut rx: mpsc::Receiver<ExecuteStreamFrame>) -> (Vec<String>, Vec<String>) {
    let mut out = Vec::new();
    let mut err = Vec::new();
    while let Some(frame) = rx.recv().await {
        match frame {
            ExecuteStreamFrame::Stdout(line) => out.push(line),
            ExecuteStreamFrame::Stderr(line) => err.push(line),
        }
    }
    (out, err)
}

#[cfg(unix)]
#[tokio::test]
async fn streams_both_outputs_in_order() {
    let (tx, rx) = mpsc::channel(8);
    let request = sh("for i in 1 2 3 4 5; do echo out$i; echo err$i >&2; done; exit 3");

    let (result, (out, err)) = tokio::join!(run_process(&request, None, tx), collect(rx));

    assert_eq!(result.expect("runs").exit_code, 3);
    assert_eq!(out, vec!["out1", "out2", "out3", "out4", "out5"]);
    assert_eq!(err, vec!["err1", "err2", "err3", "err4", "err5"]);
}

#[cfg(unix)]
#[tokio::test]
async fn applies_working_directory_and_environment() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (tx, rx) = mpsc::channel(8);
    let mut request = sh("pwd; echo \"$VM_RELAY_MARKER\"");
    request.working_directory = Some(temp.path().to_string_lossy().into_owned());
    request.environment = Some([("VM_RELAY_MARKER".to_owned(), "marker-value".to_owned())].into());

    let (result, (out, _)) = tokio::join!(run_process(&request, None, tx), collect(rx));

    assert_eq!(result.expect("runs").exit_code, 0);
    let canonical = temp.path().canonicalize().expect("canonicalize");
    assert_eq!(
        std::path::Path::new(&out[0]).canonicalize().expect("pwd exists"),
        canonical
    );
    assert_eq!(out[1], "marker-value");
}

#[cfg(unix)]
#[tokio::test]
async fn default_directory_applies_when_unset() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (tx, rx) = mpsc::channel(8);

    let request = sh("pwd");
    let (result, (out, _)) =
        tokio::join!(run_process(&request, Some(temp.path()), tx), collect(rx));

    result.expect("runs");
    assert_eq!(
        std::path::Path::new(&out[0]).canonicalize().expect("pwd exists"),
        temp.path().canonicalize().expect("canonicalize")
    );
}

/// A timed-out process is killed with its children and reported as such.
#[cfg(unix)]
#[tokio::test]
async fn timeout_kills_process_group() {
    let temp = tempfile::tempdir().expect("tempdir");
    let marker = temp.path().join("survived");
    let (tx, rx) = mpsc::channel(8);
    let mut request = sh(&format!(
        "echo started; (sleep 3; touch '{}') & sleep 30",
        marker.display()
    ));
    request.timeout_seconds = Some(1);

    let started = std::time::Instant::now();
    let (result, (out, _)) = tokio::join!(run_process(&request, None, tx), collect(rx));

    let err = result.expect_err("must time out");
    assert_eq!(err.kind, FailureKind::TimedOut);
    assert!(err.is_timeout());
    assert_eq!(out, vec!["started"]);
    assert!(started.elapsed() < std::time::Duration::from_secs(10));

    tokio::time::sleep(std::time::Duration::from_secs(4)).await;
    assert!(!marker.exists(), "background child must have been killed");
}

#[cfg(unix)]
#[tokio::test]
async fn zero_timeout_kills_immediately() {
    let (tx, rx) = mpsc::channel(8);
    let mut request = sh("sleep 30");
    request.timeout_seconds = Some(0);

    let (result, _) = tokio::join!(run_process(&request, None, tx), collect(rx));
    assert_eq!(result.expect_err("must time out").kind, FailureKind::TimedOut);
}

#[cfg(unix)]
#[tokio::test]
async fn signal_exit_maps_to_128_plus_signal() {
    let (tx, rx) = mpsc::channel(8);
    let request = sh("kill -9 $$");
    let (result, _) = tokio::join!(run_process(&request, None, tx), collect(rx));
    assert_eq!(result.expect("runs").exit_code, 128 + 9);
}
