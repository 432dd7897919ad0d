//! Local process launch with line streaming and timeout enforcement.
//!
//! Spawns the requested executable with:
//! - `kill_on_drop(true)` so an abandoned call never leaks a child.
//! - Its own process group on Unix, so a timeout kills grandchildren that
//!   still hold the output pipes.
//! - Two reader tasks that split stdout and stderr into lines and push
//!   them, tagged, into the caller's frame channel. Each reader owns one
//!   stream, which keeps per-stream order.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::{
    ExecuteRequest, ExecuteResponse, ExecuteStreamFrame, FailureKind, OperationFailure,
};

/// How long output readers may keep draining after the child exits.
///
/// A background process that inherited the pipes would otherwise keep the
/// call open forever.
const READER_DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Launch `request` and stream its output into `frames` until it exits.
///
/// `request.working_directory` falls back to `default_dir`, then to the
/// agent's own working directory. Environment entries are applied on top of
/// the inherited environment.
///
/// # Errors
///
/// - [`FailureKind::InvalidRequest`]: empty executable name.
/// - [`FailureKind::LaunchFailed`]: the OS refused to start the process.
/// - [`FailureKind::TimedOut`]: the timeout elapsed; the child (and its
///   process group on Unix) has been killed and reaped.
/// - [`FailureKind::Io`]: waiting on the child failed.
pub async fn run_process(
    request: &ExecuteRequest,
    default_dir: Option<&Path>,
    frames: mpsc::Sender<ExecuteStreamFrame>,
) -> Result<ExecuteResponse, OperationFailure> {
    if request.executable.trim().is_empty() {
        return Err(OperationFailure::new(
            FailureKind::InvalidRequest,
            "executable must not be empty",
        ));
    }

    let mut cmd = Command::new(&request.executable);
    if let Some(ref arguments) = request.arguments {
        cmd.args(arguments);
    }
    match (request.working_directory.as_deref(), default_dir) {
        (Some(dir), _) => {
            cmd.current_dir(dir);
        }
        (None, Some(dir)) => {
            cmd.current_dir(dir);
        }
        (None, None) => {}
    }
    if let Some(ref environment) = request.environment {
        cmd.envs(environment);
    }

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|err| {
        OperationFailure::new(
            FailureKind::LaunchFailed,
            format!("failed to launch `{}`", request.executable),
        )
        .with_detail(err.to_string())
    })?;

    let stdout = child.stdout.take().ok_or_else(|| {
        OperationFailure::new(FailureKind::LaunchFailed, "failed to capture child stdout")
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        OperationFailure::new(FailureKind::LaunchFailed, "failed to capture child stderr")
    })?;

    let readers = [
        tokio::spawn(pump_lines(stdout, frames.clone(), ExecuteStreamFrame::Stdout)),
        tokio::spawn(pump_lines(stderr, frames, ExecuteStreamFrame::Stderr)),
    ];

    let waited = match request.timeout_seconds {
        Some(secs) => {
            let limit = Duration::from_secs(secs);
            if let Ok(waited) = tokio::time::timeout(limit, child.wait()).await {
                waited
            } else {
                kill_process_tree(&mut child).await;
                drain_readers(readers).await;
                return Err(OperationFailure::new(
                    FailureKind::TimedOut,
                    format!(
                        "`{}` exceeded its {secs}s timeout and was killed",
                        request.executable
                    ),
                ));
            }
        }
        None => child.wait().await,
    };

    let status = waited
        .map_err(|err| OperationFailure::from_io("failed waiting for child process", &err))?;
    drain_readers(readers).await;

    Ok(ExecuteResponse {
        exit_code: exit_code(status),
    })
}

/// Read `stream` line by line and push each line as a frame.
///
/// Bytes are decoded lossily; the trailing `\n` or `\r\n` is stripped.
async fn pump_lines<R>(
    stream: R,
    frames: mpsc::Sender<ExecuteStreamFrame>,
    tag: fn(String) -> ExecuteStreamFrame,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if frames.send(tag(decode_line(&buf))).await.is_err() {
                    debug!("frame receiver dropped, stopping output reader");
                    break;
                }
            }
            Err(err) => {
                warn!(%err, "child output read failed");
                break;
            }
        }
    }
}

/// Strip the line terminator and decode as UTF-8, replacing invalid bytes.
#[must_use]
pub fn decode_line(raw: &[u8]) -> String {
    let mut end = raw.len();
    if end > 0 && raw[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && raw[end - 1] == b'\r' {
        end -= 1;
    }
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

async fn drain_readers(readers: [JoinHandle<()>; 2]) {
    for mut reader in readers {
        if tokio::time::timeout(READER_DRAIN_GRACE, &mut reader)
            .await
            .is_err()
        {
            warn!("output reader still open after child exit, abandoning it");
            reader.abort();
        }
    }
}

/// Kill the child and, on Unix, every process in its group; then reap it.
async fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
            if let Err(err) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                debug!(%err, pid, "killpg failed, falling back to single kill");
            }
        }
    }

    if let Err(err) = child.kill().await {
        warn!(%err, "failed to kill timed-out child");
    }
}

/// Map an exit status to a code; signals become `128 + signal`.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    -1
}
