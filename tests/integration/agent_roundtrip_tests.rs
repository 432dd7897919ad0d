//! Integration tests driving a real agent through the real client.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vm_relay::protocol::codec::DEFAULT_MAX_LINE_BYTES;
use vm_relay::protocol::{ExecuteRequest, ExecuteStreamFrame, FailureKind, ItemKind};
use vm_relay::proxy::{
    AgentClient, LineCallbacks, LocalProcessRunner, NullSink, ProcessRunner, ProcessSpec,
    RemoteProcessRunner,
};
use vm_relay::session::Controller;
use vm_relay::vm::VmStatus;
use vm_relay::AppError;

use super::test_helpers::{spawn_agent, RecordingDriver};

/// Deterministic payload with a period that does not divide any chunk size.
fn patterned(len: usize) -> Vec<u8> {
    (0..=250u8).cycle().take(len).collect()
}

// ── File operations ──────────────────────────────────────────────────────────

#[tokio::test]
async fn file_operations_round_trip() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = spawn_agent(temp.path()).await;
    let client = agent.client().await;

    client.create_directory("out/logs").await.expect("mkdir");
    client.create_directory("out/logs").await.expect("mkdir again");
    client
        .write_file("out/logs/a.log", b"alpha\n".to_vec(), false)
        .await
        .expect("write a.log");
    client
        .write_file("out/logs/b.txt", vec![0xde, 0xad, 0xbe, 0xef], false)
        .await
        .expect("write b.txt");

    let read = client.read_file("out/logs/b.txt").await.expect("read");
    assert_eq!(read, vec![0xde, 0xad, 0xbe, 0xef]);

    let items = client.enumerate("out/logs/*.log", false).await.expect("enumerate");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].kind, ItemKind::File);
    assert_eq!(items[0].relative_path, "a.log");
}

/// Overwrite refusal travels as an operation failure and leaves the file.
#[tokio::test]
async fn write_without_overwrite_fails_remotely() {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::write(temp.path().join("keep"), b"original").expect("seed");
    let agent = spawn_agent(temp.path()).await;
    let client = agent.client().await;

    let err = client
        .write_file("keep", b"clobber".to_vec(), false)
        .await
        .expect_err("must refuse");

    match err {
        AppError::Operation(failure) => assert_eq!(failure.kind, FailureKind::AlreadyExists),
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(std::fs::read(temp.path().join("keep")).expect("read"), b"original");
}

#[tokio::test]
async fn read_missing_file_is_operation_failure() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = spawn_agent(temp.path()).await;
    let client = agent.client().await;

    let err = client.read_file("nope.txt").await.expect_err("missing");
    assert!(matches!(err, AppError::Operation(ref f) if f.kind == FailureKind::NotFound));
}

/// Files bigger than one protocol line move in chunks over one connection,
/// which stays usable afterwards.
#[tokio::test]
async fn files_larger_than_line_cap_round_trip() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = spawn_agent(temp.path()).await;
    let client = agent.client().await;
    let payload = patterned(DEFAULT_MAX_LINE_BYTES + 4 * 1_048_576 + 17);

    client
        .write_file("big/upload.bin", payload.clone(), false)
        .await
        .expect("large write");
    let on_disk = std::fs::read(temp.path().join("big/upload.bin")).expect("written");
    assert!(on_disk == payload, "uploaded bytes differ");

    std::fs::write(temp.path().join("download.bin"), &payload).expect("seed");
    let read = client.read_file("download.bin").await.expect("large read");
    assert_eq!(read.len(), payload.len());
    assert!(read == payload, "downloaded bytes differ");

    assert!(!client.is_closed().await, "connection must survive large transfers");
    client.create_directory("still/alive").await.expect("mkdir after transfer");
}

/// A small profile chunk size splits even modest files, including an exact
/// multiple of the chunk.
#[tokio::test]
async fn profile_chunk_size_splits_transfers() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = spawn_agent(temp.path()).await;
    let mut profile = agent.profile("vm-chunks");
    profile.transfer_chunk_bytes = 1000;
    let client = AgentClient::connect_profile(&profile).await.expect("connect");
    assert_eq!(client.chunk_bytes(), 1000);

    for len in [0, 999, 3000, 3001] {
        let payload = patterned(len);
        let path = format!("chunks/{len}.bin");
        client
            .write_file(&path, payload.clone(), true)
            .await
            .expect("chunked write");
        assert_eq!(client.read_file(&path).await.expect("chunked read"), payload);
    }
}

/// A cached connection that dropped is replaced on the next request.
#[tokio::test]
async fn controller_replaces_closed_connection() {
    let temp = tempfile::tempdir().expect("tempdir");
    let first = spawn_agent(temp.path()).await;
    let second = spawn_agent(temp.path()).await;

    let stale = first.client().await;
    let controller = Controller::with_agent(
        second.profile("vm-reconnect"),
        RecordingDriver::with_status(VmStatus::Running),
        stale.clone(),
    );
    assert_eq!(controller.agent().await.expect("cached").peer(), stale.peer());

    drop(first);
    let deadline = Instant::now() + Duration::from_secs(5);
    while !stale.is_closed().await {
        assert!(Instant::now() < deadline, "connection never closed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let fresh = controller.agent().await.expect("reconnected");
    assert_eq!(fresh.peer(), format!("127.0.0.1:{}", second.addr.port()));
    fresh.create_directory("after-reconnect").await.expect("fresh client works");
    assert!(temp.path().join("after-reconnect").is_dir());
}

// ── Execution ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_executable_fails_without_exit_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = spawn_agent(temp.path()).await;
    let runner = RemoteProcessRunner::new(agent.client().await);

    let spec = ProcessSpec::new("vm-relay-definitely-not-a-program");
    let err = runner
        .run(&spec, &mut NullSink)
        .await
        .expect_err("launch must fail");

    assert!(matches!(err, AppError::Operation(ref f) if f.kind == FailureKind::LaunchFailed));
}

/// N stdout and M stderr lines arrive complete and in per-stream order,
/// and each line reaches the sink before the call completes.
#[cfg(unix)]
#[tokio::test]
async fn remote_streaming_preserves_per_stream_order() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = spawn_agent(temp.path()).await;
    let runner = RemoteProcessRunner::new(agent.client().await);

    let spec = ProcessSpec::new("sh").args([
        "-c",
        "i=0; while [ $i -lt 200 ]; do echo o$i; if [ $((i % 3)) -eq 0 ]; then echo e$i >&2; fi; i=$((i+1)); done; exit 7",
    ]);

    let out = Arc::new(Mutex::new(Vec::new()));
    let err = Arc::new(Mutex::new(Vec::new()));
    let (o, e) = (Arc::clone(&out), Arc::clone(&err));
    let mut sink = LineCallbacks::new(
        move |line: &str| o.lock().expect("lock").push(line.to_owned()),
        move |line: &str| e.lock().expect("lock").push(line.to_owned()),
    );

    let result = runner.run(&spec, &mut sink).await.expect("runs");

    let expected_out: Vec<String> = (0..200).map(|i| format!("o{i}")).collect();
    let expected_err: Vec<String> = (0..200).filter(|i| i % 3 == 0).map(|i| format!("e{i}")).collect();
    assert_eq!(*out.lock().expect("lock"), expected_out);
    assert_eq!(*err.lock().expect("lock"), expected_err);
    assert_eq!(result.exit_code, Some(7));
    assert!(result.failed, "exit 7 fails the default predicate");
    assert!(!result.timed_out);
    assert_eq!(result.stdout.lines().count(), 200);
    assert!(result.stdout.starts_with("o0\no1\n"));
}

/// Output is forwarded while the process is still running.
#[cfg(unix)]
#[tokio::test]
async fn frames_arrive_before_completion() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = spawn_agent(temp.path()).await;
    let client = agent.client().await;

    let request = ExecuteRequest {
        executable: "sh".into(),
        arguments: Some(vec!["-c".into(), "echo early; sleep 2; echo late".into()]),
        ..ExecuteRequest::default()
    };

    let started = Instant::now();
    let mut arrivals = Vec::new();
    let response = client
        .execute(request, |frame| {
            if let ExecuteStreamFrame::Stdout(line) = frame {
                arrivals.push((line, started.elapsed()));
            }
        })
        .await
        .expect("runs");

    assert_eq!(response.exit_code, 0);
    assert_eq!(arrivals.len(), 2);
    assert_eq!(arrivals[0].0, "early");
    assert!(
        arrivals[0].1 < Duration::from_millis(1500),
        "first line must not wait for the process to end: {:?}",
        arrivals[0].1
    );
}

/// A timed-out process yields a timed-out, failed result with no exit code.
#[cfg(unix)]
#[tokio::test]
async fn remote_timeout_reports_timed_out() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = spawn_agent(temp.path()).await;
    let runner = RemoteProcessRunner::new(agent.client().await);

    let spec = ProcessSpec::new("sh")
        .args(["-c", "echo begin; sleep 30"])
        .timeout(Duration::from_secs(1));

    let started = Instant::now();
    let result = runner.run(&spec, &mut NullSink).await.expect("timeout is a result");

    assert!(result.timed_out);
    assert!(result.failed);
    assert_eq!(result.exit_code, None);
    assert_eq!(result.stdout, "begin\n");
    assert!(started.elapsed() < Duration::from_secs(10));
}

/// Several calls share one connection without mixing their replies.
#[cfg(unix)]
#[tokio::test]
async fn concurrent_calls_are_multiplexed() {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::write(temp.path().join("f"), b"contents").expect("seed");
    let agent = spawn_agent(temp.path()).await;
    let client = agent.client().await;

    let slow = ExecuteRequest {
        executable: "sh".into(),
        arguments: Some(vec!["-c".into(), "sleep 1; echo done".into()]),
        ..ExecuteRequest::default()
    };

    let mut lines = Vec::new();
    let (exec, read) = tokio::join!(
        client.execute(slow, |frame| lines.push(frame)),
        client.read_file("f")
    );

    assert_eq!(exec.expect("exec").exit_code, 0);
    assert_eq!(read.expect("read"), b"contents");
    assert_eq!(lines, vec![ExecuteStreamFrame::Stdout("done".into())]);
}

/// Dropping the agent fails a pending call with a transport error.
#[cfg(unix)]
#[tokio::test]
async fn connection_drop_fails_pending_call() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = spawn_agent(temp.path()).await;
    let client = agent.client().await;
    let ct = agent.ct.clone();

    let request = ExecuteRequest {
        executable: "sh".into(),
        arguments: Some(vec!["-c".into(), "sleep 30".into()]),
        ..ExecuteRequest::default()
    };

    let call = tokio::spawn({
        let client = client.clone();
        async move { client.execute(request, |_| {}).await }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    ct.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(5), call)
        .await
        .expect("call must not hang")
        .expect("join");
    assert!(matches!(outcome, Err(AppError::Transport(_))), "got {outcome:?}");
    assert!(client.is_closed().await);
}

#[tokio::test]
async fn connect_to_closed_port_is_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);

    let err = vm_relay::proxy::AgentClient::connect("127.0.0.1", port, Duration::from_secs(2))
        .await
        .expect_err("nothing listens");
    assert!(matches!(err, AppError::Transport(_)));
}

// ── Local runner ─────────────────────────────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn local_runner_matches_remote_contract() {
    let spec = ProcessSpec::new("sh")
        .args(["-c", "echo one; echo two >&2; exit 1"])
        .success_when(|code| code <= 1);

    let result = LocalProcessRunner
        .run(&spec, &mut NullSink)
        .await
        .expect("runs");

    assert_eq!(result.stdout, "one\n");
    assert_eq!(result.stderr, "two\n");
    assert_eq!(result.exit_code, Some(1));
    assert!(!result.failed, "custom predicate accepts exit 1");
}

#[cfg(unix)]
#[tokio::test]
async fn local_runner_reports_timeout_as_result() {
    let spec = ProcessSpec::new("sleep")
        .arg("30")
        .timeout(Duration::from_millis(200));

    let result = LocalProcessRunner
        .run(&spec, &mut NullSink)
        .await
        .expect("timeout is a result");
    assert!(result.timed_out && result.failed);
}
