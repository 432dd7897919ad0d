//! Wire contract between the master-side proxy and the in-VM agent.
//!
//! Every message is one JSON object per line (see [`codec`]). The client
//! sends a [`RequestEnvelope`] carrying a call id it chose; the agent
//! answers with one or more [`ReplyEnvelope`]s carrying the same id.
//!
//! ## Call shape
//!
//! ```json
//! {"id":7,"request":{"op":"execute","params":{"executable":"make","arguments":["all"]}}}
//! {"id":7,"reply":{"kind":"stream","body":{"stream":"stdout","line":"cc -c main.c"}}}
//! {"id":7,"reply":{"kind":"stream","body":{"stream":"stderr","line":"warning: unused"}}}
//! {"id":7,"reply":{"kind":"complete","body":{"op":"execute","result":{"exit_code":0}}}}
//! ```
//!
//! Only `execute` calls produce `stream` replies. Every call ends with
//! exactly one terminal reply: `complete` or `failed`.
//!
//! ## File transfer
//!
//! A single line is capped (see [`codec::DEFAULT_MAX_LINE_BYTES`]), so file
//! bodies move in chunks. `read_file` takes an optional byte range and
//! answers with at most one chunk plus the file's total size. `write_file`
//! carries the chunk's `offset` and whether it is the `last` one; chunks are
//! staged beside the target and renamed into place after the last one.

pub mod codec;

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::io;

use serde::{Deserialize, Serialize};

/// Default TCP port the agent listens on.
pub const DEFAULT_RPC_PORT: u16 = 6500;

/// Inbound call from the proxy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestEnvelope {
    /// Client-chosen call id, echoed on every reply.
    pub id: u64,
    /// Operation to perform.
    pub request: Request,
}

/// The five agent operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", content = "params", rename_all = "snake_case")]
pub enum Request {
    /// Run a process, streaming its output lines.
    Execute(ExecuteRequest),
    /// Read a file, or one chunk of it.
    ReadFile(ReadFileRequest),
    /// Create or replace a file, possibly over several chunks.
    WriteFile(WriteFileRequest),
    /// Create a directory and any missing parents.
    CreateDirectory(CreateDirectoryRequest),
    /// List paths matching a glob.
    Enumerate(EnumerateRequest),
}

impl Request {
    /// Wire name of the operation, used for log fields.
    #[must_use]
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::Execute(_) => "execute",
            Self::ReadFile(_) => "read_file",
            Self::WriteFile(_) => "write_file",
            Self::CreateDirectory(_) => "create_directory",
            Self::Enumerate(_) => "enumerate",
        }
    }
}

/// Parameters for `execute`.
///
/// Every field except `executable` is optional-present: `None` means "use
/// the agent's own default", while `Some(vec![])` or `Some(0)` are explicit
/// values that are honored as given.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecuteRequest {
    /// Program to launch, resolved through the agent's `PATH`.
    pub executable: String,
    /// Argument list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<String>>,
    /// Working directory for the child.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    /// Variables set on top of the agent's inherited environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<HashMap<String, String>>,
    /// Wall-clock limit; `Some(0)` kills the child immediately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// Parameters for `read_file`.
///
/// Without `length` the agent returns as much as fits in one reply; the
/// caller compares the returned bytes with [`FileContents::size`] to know
/// whether more remain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadFileRequest {
    /// File to read.
    pub path: String,
    /// First byte to return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    /// Maximum number of bytes to return.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
}

impl ReadFileRequest {
    /// Read from the start of `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            offset: None,
            length: None,
        }
    }

    /// Read at most `length` bytes of `path` starting at `offset`.
    pub fn range(path: impl Into<String>, offset: u64, length: u64) -> Self {
        Self {
            path: path.into(),
            offset: Some(offset),
            length: Some(length),
        }
    }
}

/// Parameters for `write_file`.
///
/// A whole file is one request with `offset == 0` and `last == true`, which
/// is also what an absent `offset`/`last` means on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteFileRequest {
    /// File to create or replace.
    pub path: String,
    /// Bytes of this chunk.
    #[serde(with = "base64_bytes")]
    pub contents: Vec<u8>,
    /// Whether an existing file may be replaced.
    pub overwrite: bool,
    /// Position of this chunk in the file; must equal the bytes already
    /// staged.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset: u64,
    /// Whether this chunk completes the file.
    #[serde(default = "yes", skip_serializing_if = "is_true")]
    pub last: bool,
}

impl WriteFileRequest {
    /// Write all of `contents` in one request.
    pub fn whole(path: impl Into<String>, contents: Vec<u8>, overwrite: bool) -> Self {
        Self {
            path: path.into(),
            contents,
            overwrite,
            offset: 0,
            last: true,
        }
    }

    /// One chunk of a file written over several requests.
    pub fn chunk(
        path: impl Into<String>,
        contents: Vec<u8>,
        overwrite: bool,
        offset: u64,
        last: bool,
    ) -> Self {
        Self {
            path: path.into(),
            contents,
            overwrite,
            offset,
            last,
        }
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(value: &u64) -> bool {
    *value == 0
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_true(value: &bool) -> bool {
    *value
}

fn yes() -> bool {
    true
}

/// Parameters for `create_directory`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateDirectoryRequest {
    /// Directory to create.
    pub path: String,
}

/// Parameters for `enumerate`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnumerateRequest {
    /// Base directory followed by a glob, e.g. `C:/build/out/*.log`.
    pub pattern: String,
    /// Whether to descend into subdirectories of the base directory.
    pub recursive: bool,
}

/// Outbound reply from the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyEnvelope {
    /// Call id this reply belongs to.
    pub id: u64,
    /// Reply payload.
    pub reply: Reply,
}

/// One reply within a call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Reply {
    /// Output line pushed while an `execute` call is pending.
    Stream(ExecuteStreamFrame),
    /// Terminal success.
    Complete(Completion),
    /// Terminal failure.
    Failed(OperationFailure),
}

impl Reply {
    /// Whether this reply ends its call.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Stream(_))
    }
}

/// A single line of process output, tagged with its stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "stream", content = "line", rename_all = "snake_case")]
pub enum ExecuteStreamFrame {
    /// Line written to stdout.
    Stdout(String),
    /// Line written to stderr.
    Stderr(String),
}

/// Success payload of each operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", content = "result", rename_all = "snake_case")]
pub enum Completion {
    /// Process exited.
    Execute(ExecuteResponse),
    /// File contents.
    ReadFile(FileContents),
    /// File written.
    WriteFile,
    /// Directory present.
    CreateDirectory,
    /// Matched paths.
    Enumerate(EnumerateResponse),
}

/// Result of `execute`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecuteResponse {
    /// Exit code; `128 + signal` when the child was killed by a signal.
    pub exit_code: i32,
}

/// Result of `read_file`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileContents {
    /// Raw bytes of the requested range.
    #[serde(with = "base64_bytes")]
    pub contents: Vec<u8>,
    /// Total file size at the time of the read.
    #[serde(default)]
    pub size: u64,
}

/// Result of `enumerate`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnumerateResponse {
    /// Matched entries; order is not stable across calls.
    pub items: Vec<EnumeratedItem>,
}

/// Kind of an enumerated entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemKind {
    /// Regular file (or symlink to one).
    File,
    /// Directory.
    Directory,
}

/// One entry matched by `enumerate`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnumeratedItem {
    /// File or directory.
    pub kind: ItemKind,
    /// Path relative to the pattern's base directory, `/`-separated.
    pub relative_path: String,
    /// Absolute path on the agent's machine.
    pub absolute_path: String,
}

/// Machine-readable failure category.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Path or executable does not exist.
    NotFound,
    /// The agent lacks permission.
    PermissionDenied,
    /// Target exists and overwrite was not allowed.
    AlreadyExists,
    /// The process could not be started.
    LaunchFailed,
    /// The process exceeded its timeout and was killed.
    TimedOut,
    /// The request itself is unusable (bad glob, empty executable).
    InvalidRequest,
    /// Any other I/O failure.
    Io,
}

/// The single failure shape for every agent operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationFailure {
    /// Failure category.
    pub kind: FailureKind,
    /// Human-readable reason.
    pub reason: String,
    /// Underlying error text, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl OperationFailure {
    /// Construct a failure without detail.
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            detail: None,
        }
    }

    /// Attach underlying error text.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Categorize an I/O error raised while working on `reason`.
    pub fn from_io(reason: impl Into<String>, err: &io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => FailureKind::NotFound,
            io::ErrorKind::PermissionDenied => FailureKind::PermissionDenied,
            io::ErrorKind::AlreadyExists => FailureKind::AlreadyExists,
            _ => FailureKind::Io,
        };
        Self::new(kind, reason).with_detail(err.to_string())
    }

    /// Whether this failure reports a killed, timed-out process.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.kind == FailureKind::TimedOut
    }
}

impl Display for OperationFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.detail {
            Some(ref detail) => write!(f, "{} ({detail})", self.reason),
            None => write!(f, "{}", self.reason),
        }
    }
}

impl std::error::Error for OperationFailure {}

/// Base64 text encoding for byte payloads inside JSON.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

