//! Location-agnostic process execution.
//!
//! A step describes a process with [`ProcessSpec`] and hands it to a
//! [`ProcessRunner`] together with an [`OutputSink`]. The runner streams
//! every output line into the sink as it arrives and returns a
//! [`ProcessResult`] once the process ends. [`RemoteProcessRunner`] runs the
//! process through an agent; [`LocalProcessRunner`] runs it on this machine
//! with the same machinery the agent uses.

pub mod client;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::agent::process;
use crate::protocol::{ExecuteRequest, ExecuteResponse, ExecuteStreamFrame};
use crate::{AppError, Result};

pub use client::{AgentClient, PendingCall};

/// Exit-code predicate deciding whether a run succeeded.
pub type SuccessPredicate = Arc<dyn Fn(i32) -> bool + Send + Sync>;

/// Description of a process to run.
///
/// Unset optional fields are left to the executing side's defaults.
#[derive(Clone)]
pub struct ProcessSpec {
    /// Program to launch.
    pub executable: String,
    /// Argument list; `Some(vec![])` passes no arguments explicitly.
    pub arguments: Option<Vec<String>>,
    /// Working directory of the child.
    pub working_directory: Option<String>,
    /// Variables the child must see.
    pub environment: Option<HashMap<String, String>>,
    /// Wall-clock limit, rounded up to whole seconds on the wire.
    pub timeout: Option<Duration>,
    success: SuccessPredicate,
}

impl ProcessSpec {
    /// Describe `executable` with everything else unset; exit code `0`
    /// counts as success.
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            arguments: None,
            working_directory: None,
            environment: None,
            timeout: None,
            success: Arc::new(|code| code == 0),
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.get_or_insert_with(Vec::new).push(arg.into());
        self
    }

    /// Set the argument list, replacing any previous one.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = Some(args.into_iter().map(Into::into).collect());
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Add one environment variable.
    #[must_use]
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment
            .get_or_insert_with(HashMap::new)
            .insert(name.into(), value.into());
        self
    }

    /// Set the timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replace the exit-code success predicate.
    #[must_use]
    pub fn success_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(i32) -> bool + Send + Sync + 'static,
    {
        self.success = Arc::new(predicate);
        self
    }

    /// Whether `exit_code` counts as success.
    #[must_use]
    pub fn is_success(&self, exit_code: i32) -> bool {
        (self.success)(exit_code)
    }

    /// Timeout in whole seconds, rounded up.
    #[must_use]
    pub fn timeout_seconds(&self) -> Option<u64> {
        self.timeout
            .map(|limit| limit.as_secs() + u64::from(limit.subsec_nanos() > 0))
    }

    /// Request carrying exactly the fields that are set.
    #[must_use]
    pub fn to_request(&self) -> ExecuteRequest {
        ExecuteRequest {
            executable: self.executable.clone(),
            arguments: self.arguments.clone(),
            working_directory: self.working_directory.clone(),
            environment: self.environment.clone(),
            timeout_seconds: self.timeout_seconds(),
        }
    }
}

impl fmt::Debug for ProcessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSpec")
            .field("executable", &self.executable)
            .field("arguments", &self.arguments)
            .field("working_directory", &self.working_directory)
            .field("environment", &self.environment)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Outcome of a finished or timed-out process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessResult {
    /// Every stdout line, each terminated by `\n`.
    pub stdout: String,
    /// Every stderr line, each terminated by `\n`.
    pub stderr: String,
    /// Exit code; `None` when the process was killed for timing out.
    pub exit_code: Option<i32>,
    /// The executing side killed the process after its timeout.
    pub timed_out: bool,
    /// Timed out, or the exit code failed the success predicate.
    pub failed: bool,
}

/// Receiver of live output lines.
pub trait OutputSink: Send {
    /// A line arrived on stdout.
    fn stdout_line(&mut self, line: &str);
    /// A line arrived on stderr.
    fn stderr_line(&mut self, line: &str);
}

/// Sink discarding all output.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn stdout_line(&mut self, _line: &str) {}
    fn stderr_line(&mut self, _line: &str) {}
}

/// Sink forwarding each stream to its own closure.
pub struct LineCallbacks<O, E> {
    on_stdout: O,
    on_stderr: E,
}

impl<O, E> LineCallbacks<O, E>
where
    O: FnMut(&str) + Send,
    E: FnMut(&str) + Send,
{
    /// Pair two line callbacks.
    pub fn new(on_stdout: O, on_stderr: E) -> Self {
        Self {
            on_stdout,
            on_stderr,
        }
    }
}

impl<O, E> OutputSink for LineCallbacks<O, E>
where
    O: FnMut(&str) + Send,
    E: FnMut(&str) + Send,
{
    fn stdout_line(&mut self, line: &str) {
        (self.on_stdout)(line);
    }

    fn stderr_line(&mut self, line: &str) {
        (self.on_stderr)(line);
    }
}

/// Anything that can run a [`ProcessSpec`].
pub trait ProcessRunner: Send + Sync {
    /// Run `spec`, streaming output into `sink` until the process ends.
    ///
    /// A timed-out process yields `Ok` with `timed_out` set; every other
    /// failure to run is an error.
    ///
    /// # Errors
    ///
    /// `AppError::Operation` when the process could not be run;
    /// `AppError::Transport` when a remote channel failed.
    fn run<'a>(
        &'a self,
        spec: &'a ProcessSpec,
        sink: &'a mut dyn OutputSink,
    ) -> Pin<Box<dyn Future<Output = Result<ProcessResult>> + Send + 'a>>;
}

/// Keep only the variables `baseline` does not already carry with the same
/// value.
///
/// Names compare case-insensitively on Windows and exactly elsewhere;
/// values always compare exactly.
#[must_use]
pub fn filter_environment<I>(
    requested: &HashMap<String, String>,
    baseline: I,
) -> HashMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let baseline: HashMap<String, String> = baseline
        .into_iter()
        .map(|(name, value)| (env_key(&name), value))
        .collect();

    requested
        .iter()
        .filter(|(name, value)| baseline.get(&env_key(name)) != Some(*value))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn env_key(name: &str) -> String {
    if cfg!(windows) {
        name.to_uppercase()
    } else {
        name.to_owned()
    }
}

/// The environment a locally launched child would inherit, UTF-8 entries
/// only.
#[must_use]
pub fn process_environment() -> Vec<(String, String)> {
    std::env::vars_os()
        .filter_map(|(name, value)| Some((name.into_string().ok()?, value.into_string().ok()?)))
        .collect()
}

/// Build the wire request for `spec`, dropping variables `baseline` already
/// sets identically.
#[must_use]
pub fn build_execute_request<I>(spec: &ProcessSpec, baseline: I) -> ExecuteRequest
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut request = spec.to_request();
    request.environment = spec
        .environment
        .as_ref()
        .map(|env| filter_environment(env, baseline))
        .filter(|env| !env.is_empty());
    request
}

/// Accumulates frames into a result while forwarding them to a sink.
struct Capture<'a> {
    sink: &'a mut dyn OutputSink,
    stdout: String,
    stderr: String,
}

impl<'a> Capture<'a> {
    fn new(sink: &'a mut dyn OutputSink) -> Self {
        Self {
            sink,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    fn accept(&mut self, frame: ExecuteStreamFrame) {
        match frame {
            ExecuteStreamFrame::Stdout(line) => {
                self.sink.stdout_line(&line);
                self.stdout.push_str(&line);
                self.stdout.push('\n');
            }
            ExecuteStreamFrame::Stderr(line) => {
                self.sink.stderr_line(&line);
                self.stderr.push_str(&line);
                self.stderr.push('\n');
            }
        }
    }

    fn finish(self, spec: &ProcessSpec, outcome: Result<ExecuteResponse>) -> Result<ProcessResult> {
        match outcome {
            Ok(response) => Ok(ProcessResult {
                stdout: self.stdout,
                stderr: self.stderr,
                exit_code: Some(response.exit_code),
                timed_out: false,
                failed: !spec.is_success(response.exit_code),
            }),
            Err(AppError::Operation(failure)) if failure.is_timeout() => {
                info!(executable = %spec.executable, reason = %failure, "process timed out");
                Ok(ProcessResult {
                    stdout: self.stdout,
                    stderr: self.stderr,
                    exit_code: None,
                    timed_out: true,
                    failed: true,
                })
            }
            Err(err) => Err(err),
        }
    }
}

/// Runs processes inside the VM through its agent.
#[derive(Debug, Clone)]
pub struct RemoteProcessRunner {
    client: AgentClient,
}

impl RemoteProcessRunner {
    /// Wrap an open agent connection.
    #[must_use]
    pub fn new(client: AgentClient) -> Self {
        Self { client }
    }

    /// The underlying connection.
    #[must_use]
    pub fn client(&self) -> &AgentClient {
        &self.client
    }
}

impl ProcessRunner for RemoteProcessRunner {
    fn run<'a>(
        &'a self,
        spec: &'a ProcessSpec,
        sink: &'a mut dyn OutputSink,
    ) -> Pin<Box<dyn Future<Output = Result<ProcessResult>> + Send + 'a>> {
        Box::pin(async move {
            let request = build_execute_request(spec, process_environment());
            debug!(
                peer = self.client.peer(),
                executable = %request.executable,
                environment_vars = request.environment.as_ref().map_or(0, HashMap::len),
                "running remote process"
            );

            let mut capture = Capture::new(sink);
            let outcome = self
                .client
                .execute(request, |frame| capture.accept(frame))
                .await;
            capture.finish(spec, outcome)
        })
    }
}

/// Runs processes on this machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalProcessRunner;

impl ProcessRunner for LocalProcessRunner {
    fn run<'a>(
        &'a self,
        spec: &'a ProcessSpec,
        sink: &'a mut dyn OutputSink,
    ) -> Pin<Box<dyn Future<Output = Result<ProcessResult>> + Send + 'a>> {
        Box::pin(async move {
            let request = spec.to_request();
            debug!(executable = %request.executable, "running local process");

            let (frames_tx, mut frames_rx) = mpsc::channel(64);
            let mut capture = Capture::new(sink);
            let drain = async {
                while let Some(frame) = frames_rx.recv().await {
                    capture.accept(frame);
                }
            };
            let (outcome, ()) = tokio::join!(process::run_process(&request, None, frames_tx), drain);
            capture.finish(spec, outcome.map_err(AppError::Operation))
        })
    }
}
