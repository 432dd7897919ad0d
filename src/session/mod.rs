//! VM session: the controller of one VM plus per-run overrides.

pub mod registry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ProfileConfig;
use crate::proxy::{AgentClient, RemoteProcessRunner};
use crate::vm::{VmDriver, VmOperation, VmStatus};
use crate::Result;

/// Handle on one VM: its hypervisor driver and, once needed, its agent
/// connection.
pub struct Controller {
    profile: ProfileConfig,
    driver: Arc<dyn VmDriver>,
    agent: Mutex<Option<AgentClient>>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("profile", &self.profile.name)
            .field("vm_id", &self.profile.vm_id)
            .field("connected", &self.agent.try_lock().ok().map(|slot| slot.is_some()))
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Controller that connects to the agent on first use.
    #[must_use]
    pub fn new(profile: ProfileConfig, driver: Arc<dyn VmDriver>) -> Self {
        Self {
            profile,
            driver,
            agent: Mutex::new(None),
        }
    }

    /// Controller using an already open agent connection.
    #[must_use]
    pub fn with_agent(profile: ProfileConfig, driver: Arc<dyn VmDriver>, client: AgentClient) -> Self {
        Self {
            profile,
            driver,
            agent: Mutex::new(Some(client)),
        }
    }

    /// Profile this controller was built from.
    #[must_use]
    pub fn profile(&self) -> &ProfileConfig {
        &self.profile
    }

    /// Hypervisor id of the VM.
    #[must_use]
    pub fn vm_id(&self) -> &str {
        &self.profile.vm_id
    }

    /// Read the VM's power state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Vm` from the driver.
    pub async fn status(&self) -> Result<VmStatus> {
        self.driver.status(&self.profile.vm_id).await
    }

    /// Perform one power operation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Vm` from the driver.
    pub async fn perform(&self, operation: VmOperation) -> Result<()> {
        info!(vm_id = %self.profile.vm_id, %operation, "performing vm operation");
        self.driver.perform(&self.profile.vm_id, operation).await
    }

    /// Agent connection, opened on first call and reused while it stays
    /// open.
    ///
    /// A connection found closed is replaced by a fresh one. A failed
    /// attempt is not cached, but nothing retries on its own.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the agent is unreachable.
    pub async fn agent(&self) -> Result<AgentClient> {
        let mut slot = self.agent.lock().await;
        if let Some(ref client) = *slot {
            if !client.is_closed().await {
                return Ok(client.clone());
            }
            warn!(
                vm_id = %self.profile.vm_id,
                peer = client.peer(),
                "agent connection lost, reconnecting"
            );
        }

        let client = AgentClient::connect_profile(&self.profile).await?;
        *slot = Some(client.clone());
        Ok(client)
    }

    /// Process runner executing inside the VM.
    ///
    /// # Errors
    ///
    /// See [`Controller::agent`].
    pub async fn remote_runner(&self) -> Result<RemoteProcessRunner> {
        Ok(RemoteProcessRunner::new(self.agent().await?))
    }
}

/// The VM session of one orchestrated run.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    controller: Arc<Controller>,
    artifact_directory: Option<PathBuf>,
    working_directory: Option<String>,
    opened_at: DateTime<Utc>,
}

impl Session {
    /// Open a session, seeding the overrides from the controller's profile.
    #[must_use]
    pub fn new(controller: Arc<Controller>) -> Self {
        let artifact_directory = controller.profile().artifact_directory.clone();
        let working_directory = controller.profile().working_directory.clone();
        Self {
            id: Uuid::new_v4(),
            controller,
            artifact_directory,
            working_directory,
            opened_at: Utc::now(),
        }
    }

    /// Override the local artifact directory.
    #[must_use]
    pub fn with_artifact_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.artifact_directory = Some(dir.into());
        self
    }

    /// Override the default remote working directory.
    #[must_use]
    pub fn with_working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Unique id of this session, used in logs.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The VM controller; always present.
    #[must_use]
    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    /// Local directory for artifacts copied out of the VM.
    #[must_use]
    pub fn artifact_directory(&self) -> Option<&Path> {
        self.artifact_directory.as_deref()
    }

    /// Default working directory for remote processes.
    #[must_use]
    pub fn working_directory(&self) -> Option<&str> {
        self.working_directory.as_deref()
    }

    /// When the session was opened.
    #[must_use]
    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }
}
