//! Configuration parsing and validation.
//!
//! Three documents are understood: [`AgentConfig`] for the in-VM agent
//! binary, [`ProfileConfig`] describing how to reach one VM and its agent,
//! and [`SessionPolicy`] choosing the start/stop actions of a run. The core
//! only consumes validated values; the TOML helpers exist for the agent
//! binary and for embedders that keep profiles in TOML.

use std::fmt::{Display, Formatter};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::codec::{DEFAULT_MAX_LINE_BYTES, DEFAULT_TRANSFER_CHUNK_BYTES};
use crate::protocol::DEFAULT_RPC_PORT;
use crate::{AppError, Result};

fn default_bind_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_rpc_port() -> u16 {
    DEFAULT_RPC_PORT
}

fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_LINE_BYTES
}

fn default_connect_timeout_seconds() -> u64 {
    30
}

fn default_transfer_chunk_bytes() -> usize {
    DEFAULT_TRANSFER_CHUNK_BYTES
}

/// Smallest accepted line limit; leaves room for a useful file chunk.
const MIN_LINE_BYTES: usize = 64 * 1024;

/// Agent configuration parsed from `agent.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Address the RPC listener binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    /// RPC listener port; `0` picks an ephemeral port.
    #[serde(default = "default_rpc_port")]
    pub port: u16,
    /// Largest accepted protocol line, in bytes.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// Base for relative paths and the default child working directory.
    #[serde(default)]
    pub default_working_directory: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_rpc_port(),
            max_line_bytes: default_max_line_bytes(),
            default_working_directory: None,
        }
    }
}

impl AgentConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate values and canonicalize the default working directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` when a value is unusable.
    pub fn validate(&mut self) -> Result<()> {
        if self.max_line_bytes < MIN_LINE_BYTES {
            return Err(AppError::Config(format!(
                "max_line_bytes must be at least {MIN_LINE_BYTES}"
            )));
        }

        if let Some(ref dir) = self.default_working_directory {
            let canonical = dir.canonicalize().map_err(|err| {
                AppError::Config(format!("default_working_directory invalid: {err}"))
            })?;
            self.default_working_directory = Some(canonical);
        }

        Ok(())
    }
}

/// How to reach one VM and the agent running inside it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProfileConfig {
    /// Profile name used in logs.
    pub name: String,
    /// Hypervisor identifier of the VM.
    pub vm_id: String,
    /// Host name or address of the agent inside the VM.
    pub agent_host: String,
    /// Agent RPC port.
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,
    /// Snapshot the VM is restored from; changes the `auto` actions.
    #[serde(default)]
    pub snapshot: Option<String>,
    /// Time allowed for opening the agent connection.
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
    /// Local directory artifacts copied out of the VM land in.
    #[serde(default)]
    pub artifact_directory: Option<PathBuf>,
    /// Default working directory for remote processes.
    #[serde(default)]
    pub working_directory: Option<String>,
    /// Raw bytes moved per `read_file`/`write_file` request.
    #[serde(default = "default_transfer_chunk_bytes")]
    pub transfer_chunk_bytes: usize,
}

impl ProfileConfig {
    /// Build a profile with defaults for everything but the identity fields.
    pub fn new(
        name: impl Into<String>,
        vm_id: impl Into<String>,
        agent_host: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            vm_id: vm_id.into(),
            agent_host: agent_host.into(),
            rpc_port: default_rpc_port(),
            snapshot: None,
            connect_timeout_seconds: default_connect_timeout_seconds(),
            artifact_directory: None,
            working_directory: None,
            transfer_chunk_bytes: default_transfer_chunk_bytes(),
        }
    }

    /// Parse and validate a profile from TOML.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the profile is usable.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.vm_id.trim().is_empty() {
            return Err(AppError::Config("vm_id must not be empty".into()));
        }
        if self.agent_host.trim().is_empty() {
            return Err(AppError::Config("agent_host must not be empty".into()));
        }
        if self.rpc_port == 0 {
            return Err(AppError::Config("rpc_port must be greater than zero".into()));
        }
        if self.connect_timeout_seconds == 0 {
            return Err(AppError::Config(
                "connect_timeout_seconds must be greater than zero".into(),
            ));
        }
        if self.transfer_chunk_bytes == 0 {
            return Err(AppError::Config(
                "transfer_chunk_bytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Whether the VM is restored from a snapshot.
    #[must_use]
    pub fn has_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Connection timeout as a [`Duration`].
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

/// Power action performed before the steps run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StartAction {
    /// Leave the VM as it is.
    None,
    /// `restart` with a snapshot, otherwise `start_or_resume`.
    #[default]
    Auto,
    /// Resume a paused VM, start a stopped or saved one.
    StartOrResume,
    /// Power off a running or paused VM, then start it.
    Restart,
}

/// Power action performed after the steps, whatever their outcome.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopAction {
    /// Leave the VM running.
    None,
    /// `power_off` with a snapshot, otherwise `save_state`.
    #[default]
    Auto,
    /// Save the machine state to disk.
    SaveState,
    /// Pause execution.
    Pause,
    /// ACPI shutdown.
    Shutdown,
    /// Hard power off.
    PowerOff,
}

impl Display for StartAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Auto => "auto",
            Self::StartOrResume => "start_or_resume",
            Self::Restart => "restart",
        };
        f.write_str(name)
    }
}

impl Display for StopAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Auto => "auto",
            Self::SaveState => "save_state",
            Self::Pause => "pause",
            Self::Shutdown => "shutdown",
            Self::PowerOff => "power_off",
        };
        f.write_str(name)
    }
}

/// Start/stop pair chosen for one run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionPolicy {
    /// Action before the steps.
    #[serde(default)]
    pub start_action: StartAction,
    /// Action after the steps.
    #[serde(default)]
    pub stop_action: StopAction,
}

impl SessionPolicy {
    /// Construct a policy from an explicit pair.
    #[must_use]
    pub fn new(start_action: StartAction, stop_action: StopAction) -> Self {
        Self {
            start_action,
            stop_action,
        }
    }
}
