//! Step result scopes.
//!
//! Every step writes into its own [`ResultScope`], cloned from the run's
//! scope, and the orchestrator merges it back afterwards. The first
//! non-success status wins.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Outcome class of a step or run, ordered by severity.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Everything so far succeeded.
    #[default]
    Success,
    /// The work ran and reported failure (non-zero exit, missing file).
    Failure,
    /// The work could not run (transport, missing session, panic).
    Error,
}

/// Accumulated status, log lines, artifacts and properties.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultScope {
    status: StepStatus,
    failure_reason: Option<String>,
    messages: Vec<String>,
    artifacts: Vec<PathBuf>,
    properties: BTreeMap<String, String>,
}

impl ResultScope {
    /// Empty, successful scope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Independent scope for one step, inheriting properties only.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            properties: self.properties.clone(),
            ..Self::default()
        }
    }

    /// Fold a step's scope into this one.
    ///
    /// Messages and artifacts are appended and properties overwritten.
    /// Status and reason are only taken if this scope is still successful.
    pub fn merge(&mut self, other: Self) {
        if self.is_success() && !other.is_success() {
            self.status = other.status;
            self.failure_reason = other.failure_reason;
        }
        self.messages.extend(other.messages);
        self.artifacts.extend(other.artifacts);
        self.properties.extend(other.properties);
    }

    /// Mark as failed unless already non-successful.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.degrade(StepStatus::Failure, reason.into());
    }

    /// Mark as errored unless already non-successful.
    pub fn error(&mut self, reason: impl Into<String>) {
        self.degrade(StepStatus::Error, reason.into());
    }

    fn degrade(&mut self, status: StepStatus, reason: String) {
        if self.is_success() {
            self.status = status;
            self.failure_reason = Some(reason);
        }
    }

    /// Append a log line.
    pub fn log(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    /// Record a produced file.
    pub fn add_artifact(&mut self, path: impl Into<PathBuf>) {
        self.artifacts.push(path.into());
    }

    /// Set a named property.
    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(name.into(), value.into());
    }

    /// Whether nothing failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> StepStatus {
        self.status
    }

    /// Reason given by the first failure.
    #[must_use]
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Log lines in order.
    #[must_use]
    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    /// Recorded artifacts in order.
    #[must_use]
    pub fn artifacts(&self) -> &[PathBuf] {
        &self.artifacts
    }

    /// Property lookup.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }
}
