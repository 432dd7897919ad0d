//! Step abstraction run by the orchestrator.

use std::future::Future;
use std::pin::Pin;

use crate::orchestrator::result::ResultScope;

/// One unit of work in a run.
///
/// A step reports its outcome through the scope: a failed step calls
/// [`ResultScope::fail`] or [`ResultScope::error`]. Steps needing the VM
/// look up the active session themselves through
/// [`crate::session::registry::current`].
pub trait Step: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Do the work, recording the outcome in `scope`.
    fn run<'a>(&'a self, scope: &'a mut ResultScope) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}
