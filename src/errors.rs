//! Error types shared across the application.

use std::fmt::{Display, Formatter};

use crate::protocol::OperationFailure;

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Agent channel unreachable, or dropped while a call was pending.
    Transport(String),
    /// Malformed or unexpected message on the agent channel.
    Protocol(String),
    /// The agent could not complete an operation.
    Operation(OperationFailure),
    /// A remote step ran outside any bound VM session.
    NoActiveSession(String),
    /// A session was bound while another one was still active in the flow.
    SessionAlreadyBound(String),
    /// VM driver failure while reading status or performing a start action.
    Vm(String),
    /// The configured stop action failed; the VM may still be running.
    StopAction(String),
    /// A step could not run to completion.
    Step(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Build the loud, non-transient error for a lookup outside a session.
    #[must_use]
    pub fn no_active_session() -> Self {
        Self::NoActiveSession(
            "this step must be nested inside a VM session run; \
             open the session through the orchestrator before running remote steps"
                .into(),
        )
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Operation(failure) => write!(f, "operation failed: {failure}"),
            Self::NoActiveSession(msg) => write!(f, "no active session: {msg}"),
            Self::SessionAlreadyBound(msg) => write!(f, "session already bound: {msg}"),
            Self::Vm(msg) => write!(f, "vm: {msg}"),
            Self::StopAction(msg) => write!(f, "stop action: {msg}"),
            Self::Step(msg) => write!(f, "step: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("invalid message: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<OperationFailure> for AppError {
    fn from(failure: OperationFailure) -> Self {
        Self::Operation(failure)
    }
}
