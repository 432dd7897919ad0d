//! Unit tests for the agent's file operations.

use std::fs;

use tokio::sync::mpsc;

use vm_relay::agent::Agent;
use vm_relay::protocol::codec::max_chunk_bytes;
use vm_relay::protocol::{Completion, FailureKind, ReadFileRequest, Request, WriteFileRequest};

fn agent_in(dir: &std::path::Path) -> Agent {
    Agent::new(dir.to_path_buf())
}

/// Writing over an existing file with `overwrite = false` fails and leaves
/// the original bytes in place.
#[tokio::test]
async fn write_without_overwrite_keeps_existing_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let target = temp.path().join("keep.txt");
    fs::write(&target, b"original").expect("seed file");
    let agent = agent_in(temp.path());

    let err = agent
        .write_file("keep.txt", b"replacement".to_vec(), false)
        .await
        .expect_err("overwrite refused");

    assert_eq!(err.kind, FailureKind::AlreadyExists);
    assert_eq!(fs::read(&target).expect("read back"), b"original");
}

#[tokio::test]
async fn write_with_overwrite_replaces_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let target = temp.path().join("out.bin");
    fs::write(&target, b"old").expect("seed file");
    let agent = agent_in(temp.path());

    agent
        .write_file(target.to_str().expect("utf8"), vec![0, 1, 2, 255], true)
        .await
        .expect("write succeeds");

    assert_eq!(fs::read(&target).expect("read back"), vec![0, 1, 2, 255]);
}

#[tokio::test]
async fn write_creates_missing_parent_directories() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = agent_in(temp.path());

    agent
        .write_file("a/b/c.txt", b"deep".to_vec(), false)
        .await
        .expect("write succeeds");

    assert_eq!(
        fs::read(temp.path().join("a/b/c.txt")).expect("read back"),
        b"deep"
    );
    let leftovers: Vec<_> = fs::read_dir(temp.path().join("a/b"))
        .expect("list")
        .collect();
    assert_eq!(leftovers.len(), 1, "no temporary files may remain");
}

#[tokio::test]
async fn read_returns_whole_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("in.txt"), b"line1\nline2\n").expect("seed file");
    let agent = agent_in(temp.path());

    let bytes = agent.read_file("in.txt").await.expect("read succeeds");
    assert_eq!(bytes, b"line1\nline2\n");
}

#[tokio::test]
async fn read_missing_file_is_not_found() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = agent_in(temp.path());

    let err = agent.read_file("absent.txt").await.expect_err("missing");
    assert_eq!(err.kind, FailureKind::NotFound);
    assert!(err.reason.contains("absent.txt"));
}

/// Creating the same directory twice succeeds both times.
#[tokio::test]
async fn create_directory_is_idempotent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = agent_in(temp.path());

    agent.create_directory("x/y").await.expect("first create");
    agent.create_directory("x/y").await.expect("second create");
    assert!(temp.path().join("x/y").is_dir());
}

#[tokio::test]
async fn create_directory_over_file_fails() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("taken"), b"").expect("seed file");
    let agent = agent_in(temp.path());

    assert!(agent.create_directory("taken").await.is_err());
}

#[tokio::test]
async fn handle_dispatches_to_operation() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("f"), b"data").expect("seed file");
    let agent = agent_in(temp.path());
    let (tx, _rx) = mpsc::channel(1);

    let completion = agent
        .handle(Request::ReadFile(ReadFileRequest::new("f")), tx)
        .await
        .expect("handled");

    match completion {
        Completion::ReadFile(file) => {
            assert_eq!(file.contents, b"data");
            assert_eq!(file.size, 4);
        }
        other => panic!("unexpected completion {other:?}"),
    }
}

// ── Chunked transfer ─────────────────────────────────────────────────────────

#[tokio::test]
async fn read_range_returns_slice_and_total_size() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("r.bin"), b"0123456789").expect("seed file");
    let agent = agent_in(temp.path());

    let middle = agent.read_range("r.bin", 3, 4).await.expect("middle");
    assert_eq!(middle.contents, b"3456");
    assert_eq!(middle.size, 10);

    let tail = agent.read_range("r.bin", 8, 100).await.expect("tail");
    assert_eq!(tail.contents, b"89");

    let past_end = agent.read_range("r.bin", 50, 4).await.expect("past end");
    assert!(past_end.contents.is_empty());
    assert_eq!(past_end.size, 10);
}

/// A `read_file` reply never carries more than the agent's chunk budget.
#[tokio::test]
async fn read_file_reply_is_clamped_to_line_budget() {
    let temp = tempfile::tempdir().expect("tempdir");
    let budget = max_chunk_bytes(64 * 1024);
    fs::write(temp.path().join("big.bin"), vec![7u8; budget * 2 + 5]).expect("seed file");
    let agent = agent_in(temp.path()).with_max_line_bytes(64 * 1024);
    assert_eq!(agent.max_chunk_bytes(), budget);
    let (tx, _rx) = mpsc::channel(1);

    let completion = agent
        .handle(Request::ReadFile(ReadFileRequest::new("big.bin")), tx)
        .await
        .expect("handled");

    match completion {
        Completion::ReadFile(file) => {
            assert_eq!(file.contents.len(), budget);
            assert_eq!(file.size, u64::try_from(budget * 2 + 5).expect("fits"));
        }
        other => panic!("unexpected completion {other:?}"),
    }
}

/// Chunks are staged beside the target, which only appears after the last.
#[tokio::test]
async fn chunked_write_appears_after_last_chunk() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = agent_in(temp.path());
    let target = temp.path().join("nested/out.bin");

    agent
        .write_chunk(WriteFileRequest::chunk("nested/out.bin", b"abc".to_vec(), false, 0, false))
        .await
        .expect("first chunk");
    assert!(!target.exists(), "target must not appear before the last chunk");

    agent
        .write_chunk(WriteFileRequest::chunk("nested/out.bin", b"def".to_vec(), false, 3, true))
        .await
        .expect("last chunk");

    assert_eq!(fs::read(&target).expect("written"), b"abcdef");
    let leftovers: Vec<_> = fs::read_dir(temp.path().join("nested"))
        .expect("list")
        .map(|entry| entry.expect("entry").file_name())
        .collect();
    assert_eq!(leftovers.len(), 1, "staging file left behind: {leftovers:?}");
}

#[tokio::test]
async fn chunk_at_wrong_offset_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = agent_in(temp.path());

    agent
        .write_chunk(WriteFileRequest::chunk("gap.bin", b"abc".to_vec(), true, 0, false))
        .await
        .expect("first chunk");
    let err = agent
        .write_chunk(WriteFileRequest::chunk("gap.bin", b"xyz".to_vec(), true, 10, true))
        .await
        .expect_err("gap refused");

    assert_eq!(err.kind, FailureKind::InvalidRequest);
    assert!(!temp.path().join("gap.bin").exists());
}

#[tokio::test]
async fn chunk_without_started_transfer_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let agent = agent_in(temp.path());

    let err = agent
        .write_chunk(WriteFileRequest::chunk("orphan.bin", b"x".to_vec(), true, 4, true))
        .await
        .expect_err("no transfer in progress");

    assert_eq!(err.kind, FailureKind::InvalidRequest);
}

#[tokio::test]
async fn chunked_write_without_overwrite_refuses_at_first_chunk() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("keep.bin"), b"original").expect("seed file");
    let agent = agent_in(temp.path());

    let err = agent
        .write_chunk(WriteFileRequest::chunk("keep.bin", b"new".to_vec(), false, 0, false))
        .await
        .expect_err("overwrite refused");

    assert_eq!(err.kind, FailureKind::AlreadyExists);
    assert_eq!(fs::read(temp.path().join("keep.bin")).expect("read"), b"original");
}
