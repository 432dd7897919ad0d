//! Flow-scoped registry of the active VM session.
//!
//! Steps are constructed and invoked independently of the orchestrator, so
//! they find their session here instead of receiving it as a parameter. The
//! slot lives in a tokio task-local established by [`flow`] (or
//! [`flow_sync`]); it follows the logical call chain of that future, not an
//! OS thread. Separate runs use separate flows and never see each other's
//! session.
//!
//! A task spawned from inside a flow starts with no slot at all. Wrap its
//! future in [`propagate`] to hand it the current session.

use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use crate::session::Session;
use crate::{AppError, Result};

tokio::task_local! {
    static ACTIVE: RefCell<Option<Arc<Session>>>;
}

/// Run `fut` with a fresh, empty session slot.
pub async fn flow<F: Future>(fut: F) -> F::Output {
    ACTIVE.scope(RefCell::new(None), fut).await
}

/// Run `f` synchronously with a fresh, empty session slot.
pub fn flow_sync<R>(f: impl FnOnce() -> R) -> R {
    ACTIVE.sync_scope(RefCell::new(None), f)
}

/// Run `fut` in a new flow that starts bound to the caller's session.
///
/// Use for futures handed to `tokio::spawn`; outside a flow, or with no
/// session bound, the new flow starts empty.
pub fn propagate<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    let inherited = ACTIVE.try_with(|slot| slot.borrow().clone()).ok().flatten();
    ACTIVE.scope(RefCell::new(inherited), fut)
}

/// Make `session` the active session of the current flow.
///
/// # Errors
///
/// - `AppError::SessionAlreadyBound` if another session is still bound.
/// - `AppError::Config` if called outside [`flow`]/[`flow_sync`].
pub fn bind(session: Arc<Session>) -> Result<()> {
    ACTIVE
        .try_with(|slot| {
            let mut slot = slot.borrow_mut();
            if let Some(ref existing) = *slot {
                return Err(AppError::SessionAlreadyBound(format!(
                    "session {} is still active; unbind it before binding {}",
                    existing.id(),
                    session.id()
                )));
            }
            debug!(session_id = %session.id(), "session bound");
            *slot = Some(session);
            Ok(())
        })
        .map_err(|_| outside_flow())?
}

/// Bind `session` and return a guard that unbinds it when dropped.
///
/// # Errors
///
/// See [`bind`].
pub fn bind_scoped(session: Arc<Session>) -> Result<BindingGuard> {
    bind(session)?;
    Ok(BindingGuard { _private: () })
}

/// Clear the active session, returning it. Idempotent.
pub fn unbind() -> Option<Arc<Session>> {
    let released = ACTIVE
        .try_with(|slot| slot.borrow_mut().take())
        .ok()
        .flatten();
    if let Some(ref session) = released {
        debug!(session_id = %session.id(), "session unbound");
    }
    released
}

/// The active session of the current flow.
///
/// # Errors
///
/// Returns `AppError::NoActiveSession` when nothing is bound, including
/// outside any flow. This is a wiring mistake, never a transient condition.
pub fn current() -> Result<Arc<Session>> {
    ACTIVE
        .try_with(|slot| slot.borrow().clone())
        .ok()
        .flatten()
        .ok_or_else(AppError::no_active_session)
}

/// Whether a session is bound in the current flow.
#[must_use]
pub fn has_current() -> bool {
    ACTIVE
        .try_with(|slot| slot.borrow().is_some())
        .unwrap_or(false)
}

/// Unbinds the active session on drop, including during unwinding.
#[derive(Debug)]
#[must_use = "dropping the guard unbinds the session immediately"]
pub struct BindingGuard {
    _private: (),
}

impl Drop for BindingGuard {
    fn drop(&mut self) {
        unbind();
    }
}

fn outside_flow() -> AppError {
    AppError::Config(
        "session registry used outside a flow; run the caller inside registry::flow".into(),
    )
}
