//! VM session orchestration.
//!
//! [`SessionOrchestrator::run`] drives one run through
//! `Unopened → Starting → Running → Stopping → Closed`:
//!
//! 1. Open a [`Session`] for the profile and bind it in a fresh registry flow.
//! 2. Read the VM status and perform the planned start operations.
//! 3. Run the steps in order, each into its own child scope, stopping at the
//!    first one that does not succeed.
//! 4. Perform the stop operation. This happens after a start failure, a step
//!    failure and a step panic alike.
//! 5. Unbind the session.
//!
//! A start failure skips the steps. A stop failure is always returned, even
//! when the run had already failed, because it can leave the VM running.
//!
//! If the `run` future is dropped after the session was bound and before
//! the stop action returned, the stop operation is spawned onto the current
//! runtime instead.

pub mod result;
pub mod step;

use std::fmt::{Display, Formatter};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::{ProfileConfig, SessionPolicy, StartAction, StopAction};
use crate::session::{registry, Controller, Session};
use crate::vm::{VmDriver, VmOperation, VmStatus};
use crate::{AppError, Result};

pub use result::{ResultScope, StepStatus};
pub use step::Step;

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Nothing happened yet.
    Unopened,
    /// Session bound; start action in progress.
    Starting,
    /// Steps executing.
    Running,
    /// Stop action in progress.
    Stopping,
    /// Session unbound; run over.
    Closed,
}

impl Display for RunState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unopened => "unopened",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Operations to perform before the steps.
///
/// `Auto` restarts from the snapshot when there is one, otherwise it starts
/// or resumes. `Restart` only powers off a VM that is running or paused.
#[must_use]
pub fn plan_start(action: StartAction, status: VmStatus, has_snapshot: bool) -> Vec<VmOperation> {
    let action = match action {
        StartAction::Auto if has_snapshot => StartAction::Restart,
        StartAction::Auto => StartAction::StartOrResume,
        other => other,
    };

    match (action, status) {
        (StartAction::StartOrResume, VmStatus::Paused) => vec![VmOperation::Resume],
        (StartAction::StartOrResume | StartAction::Restart, VmStatus::Off | VmStatus::Saved) => {
            vec![VmOperation::Start]
        }
        (StartAction::Restart, VmStatus::Running | VmStatus::Paused) => {
            vec![VmOperation::PowerOff, VmOperation::Start]
        }
        _ => Vec::new(),
    }
}

/// Operation to perform after the steps.
///
/// `Auto` powers off a snapshot-based VM, discarding its state, and saves
/// the state of any other.
#[must_use]
pub fn plan_stop(action: StopAction, has_snapshot: bool) -> Option<VmOperation> {
    match action {
        StopAction::None => None,
        StopAction::Auto if has_snapshot => Some(VmOperation::PowerOff),
        StopAction::Auto | StopAction::SaveState => Some(VmOperation::SaveState),
        StopAction::Pause => Some(VmOperation::Pause),
        StopAction::Shutdown => Some(VmOperation::Shutdown),
        StopAction::PowerOff => Some(VmOperation::PowerOff),
    }
}

/// Runs a step sequence inside one VM session.
pub struct SessionOrchestrator {
    profile: ProfileConfig,
    policy: SessionPolicy,
    driver: Arc<dyn VmDriver>,
    steps: Vec<Box<dyn Step>>,
    state: Arc<watch::Sender<RunState>>,
}

impl std::fmt::Debug for SessionOrchestrator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOrchestrator")
            .field("profile", &self.profile.name)
            .field("policy", &self.policy)
            .field("steps", &self.steps.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SessionOrchestrator {
    /// Orchestrator with no steps.
    #[must_use]
    pub fn new(profile: ProfileConfig, policy: SessionPolicy, driver: Arc<dyn VmDriver>) -> Self {
        let (state, _) = watch::channel(RunState::Unopened);
        Self {
            profile,
            policy,
            driver,
            steps: Vec::new(),
            state: Arc::new(state),
        }
    }

    /// Append a step.
    #[must_use]
    pub fn with_step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Append an already boxed step.
    pub fn push_step(&mut self, step: Box<dyn Step>) {
        self.steps.push(step);
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Watch lifecycle transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Run the whole session, returning the merged step results.
    ///
    /// A panicking step resumes its panic after the stop action ran.
    ///
    /// # Errors
    ///
    /// - `AppError::Config` for an invalid profile; nothing is touched.
    /// - `AppError::Vm` when reading status or the start action failed; the
    ///   steps did not run but the stop action did.
    /// - `AppError::StopAction` when the stop action failed, regardless of
    ///   how the rest of the run went.
    pub async fn run(&self, scope: ResultScope) -> Result<ResultScope> {
        let span = info_span!(
            "vm_session",
            profile = %self.profile.name,
            vm_id = %self.profile.vm_id
        );
        registry::flow(self.run_in_flow(scope)).instrument(span).await
    }

    async fn run_in_flow(&self, mut overall: ResultScope) -> Result<ResultScope> {
        self.profile.validate()?;

        let controller = Arc::new(Controller::new(
            self.profile.clone(),
            Arc::clone(&self.driver),
        ));
        let session = Arc::new(Session::new(Arc::clone(&controller)));
        let binding = registry::bind_scoped(Arc::clone(&session))?;
        info!(session_id = %session.id(), "session opened");
        let mut guard = StopGuard {
            controller: Arc::clone(&controller),
            operation: plan_stop(self.policy.stop_action, self.profile.has_snapshot()),
            state: Arc::clone(&self.state),
            armed: true,
        };

        self.transition(RunState::Starting);
        let started = self.start_vm(&controller).await;

        let steps = match started {
            Ok(()) => {
                self.transition(RunState::Running);
                AssertUnwindSafe(self.run_steps(&mut overall))
                    .catch_unwind()
                    .await
            }
            Err(ref err) => {
                warn!(%err, "start action failed, skipping steps");
                Ok(())
            }
        };

        self.transition(RunState::Stopping);
        let stopped = self.stop_vm(&controller).await;
        guard.disarm();

        drop(binding);
        drop(session);
        self.transition(RunState::Closed);

        if let Err(panic) = steps {
            error!("step panicked; vm stop action already performed");
            std::panic::resume_unwind(panic);
        }

        match (started, stopped) {
            (Err(start_err), Err(stop_err)) => {
                error!(%start_err, "start action failed before the stop action failure");
                Err(stop_err)
            }
            (_, Err(stop_err)) => Err(stop_err),
            (Err(start_err), Ok(())) => Err(start_err),
            (Ok(()), Ok(())) => {
                info!(status = ?overall.status(), "session closed");
                Ok(overall)
            }
        }
    }

    async fn start_vm(&self, controller: &Controller) -> Result<()> {
        let action = self.policy.start_action;
        if action == StartAction::None {
            info!("start action is none, leaving vm as is");
            return Ok(());
        }

        let status = controller.status().await?;
        let plan = plan_start(action, status, self.profile.has_snapshot());
        info!(%status, start_action = %action, ?plan, "start planned");

        for operation in plan {
            if let Err(err) = controller.perform(operation).await {
                warn!(%operation, %err, "start operation failed");
                return Err(err);
            }
        }
        Ok(())
    }

    async fn run_steps(&self, overall: &mut ResultScope) {
        for (index, step) in self.steps.iter().enumerate() {
            let mut scope = overall.child();
            let span = info_span!("step", index, name = step.name());
            step.run(&mut scope).instrument(span).await;

            let succeeded = scope.is_success();
            let reason = scope.failure_reason().map(str::to_owned);
            overall.merge(scope);

            if succeeded {
                info!(step = step.name(), "step succeeded");
            } else {
                warn!(
                    step = step.name(),
                    reason = reason.as_deref().unwrap_or(""),
                    skipped = self.steps.len() - index - 1,
                    "step failed, skipping remaining steps"
                );
                break;
            }
        }
    }

    async fn stop_vm(&self, controller: &Controller) -> Result<()> {
        let action = self.policy.stop_action;
        let Some(operation) = plan_stop(action, self.profile.has_snapshot()) else {
            info!("stop action is none, leaving vm running");
            return Ok(());
        };

        info!(stop_action = %action, %operation, "stop planned");
        controller.perform(operation).await.map_err(|err| {
            error!(%operation, %err, vm_id = %self.profile.vm_id, "stop action failed, vm may still be running");
            AppError::StopAction(format!(
                "{operation} failed for vm {}: {err}",
                self.profile.vm_id
            ))
        })
    }

    fn transition(&self, next: RunState) {
        transition(&self.state, next);
    }
}

fn transition(state: &watch::Sender<RunState>, next: RunState) {
    let previous = state.send_replace(next);
    info!(from = %previous, to = %next, "run state changed");
}

/// Stops the VM from a background task when a run is dropped before its
/// own stop action returned.
struct StopGuard {
    controller: Arc<Controller>,
    operation: Option<VmOperation>,
    state: Arc<watch::Sender<RunState>>,
    armed: bool,
}

impl StopGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let vm_id = self.controller.vm_id().to_owned();
        let Some(operation) = self.operation else {
            warn!(%vm_id, "run cancelled; stop action is none, leaving vm as is");
            transition(&self.state, RunState::Closed);
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(%vm_id, %operation, "run cancelled outside a runtime, vm may still be running");
            transition(&self.state, RunState::Closed);
            return;
        };

        error!(%vm_id, %operation, "run cancelled before its stop action, stopping vm in background");
        transition(&self.state, RunState::Stopping);
        let controller = Arc::clone(&self.controller);
        let state = Arc::clone(&self.state);
        let span = info_span!("vm_session_cleanup", %vm_id);
        runtime.spawn(
            async move {
                match controller.perform(operation).await {
                    Ok(()) => info!(%operation, "background stop action completed"),
                    Err(err) => error!(
                        %operation,
                        %err,
                        "background stop action failed, vm may still be running"
                    ),
                }
                transition(&state, RunState::Closed);
            }
            .instrument(span),
        );
    }
}
