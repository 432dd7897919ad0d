//! Hypervisor boundary.
//!
//! The orchestrator never powers a VM itself; it calls a [`VmDriver`]
//! supplied by the embedding application. Snapshot restore, if any, is the
//! driver's business when it performs [`VmOperation::Start`].

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Power state reported by the hypervisor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    /// Powered off.
    Off,
    /// Running.
    Running,
    /// Execution paused, memory resident.
    Paused,
    /// Memory saved to disk.
    Saved,
}

impl Display for VmStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Off => "off",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Saved => "saved",
        };
        f.write_str(name)
    }
}

/// Single power operation the driver performs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VmOperation {
    /// Boot, or restore a saved state.
    Start,
    /// Continue a paused VM.
    Resume,
    /// Save memory to disk and stop.
    SaveState,
    /// Pause execution.
    Pause,
    /// ACPI shutdown.
    Shutdown,
    /// Hard power off.
    PowerOff,
}

impl Display for VmOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::Resume => "resume",
            Self::SaveState => "save_state",
            Self::Pause => "pause",
            Self::Shutdown => "shutdown",
            Self::PowerOff => "power_off",
        };
        f.write_str(name)
    }
}

/// Hypervisor control for one or more VMs, addressed by id.
///
/// Errors are reported as `AppError::Vm`; the orchestrator decides whether
/// they abort the run or are fatal.
pub trait VmDriver: Send + Sync {
    /// Read the current power state.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Vm` when the hypervisor cannot be queried.
    fn status<'a>(
        &'a self,
        vm_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<VmStatus>> + Send + 'a>>;

    /// Boot the VM, restoring its snapshot or saved state when configured.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Vm` on hypervisor failure.
    fn start<'a>(&'a self, vm_id: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Continue a paused VM.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Vm` on hypervisor failure.
    fn resume<'a>(&'a self, vm_id: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Save memory to disk.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Vm` on hypervisor failure.
    fn save_state<'a>(
        &'a self,
        vm_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Pause execution.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Vm` on hypervisor failure.
    fn pause<'a>(&'a self, vm_id: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Request an orderly guest shutdown.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Vm` on hypervisor failure.
    fn shutdown<'a>(
        &'a self,
        vm_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Cut power.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Vm` on hypervisor failure.
    fn power_off<'a>(
        &'a self,
        vm_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Dispatch `operation` to the matching method.
    ///
    /// # Errors
    ///
    /// Whatever the dispatched method returns.
    fn perform<'a>(
        &'a self,
        vm_id: &'a str,
        operation: VmOperation,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        match operation {
            VmOperation::Start => self.start(vm_id),
            VmOperation::Resume => self.resume(vm_id),
            VmOperation::SaveState => self.save_state(vm_id),
            VmOperation::Pause => self.pause(vm_id),
            VmOperation::Shutdown => self.shutdown(vm_id),
            VmOperation::PowerOff => self.power_off(vm_id),
        }
    }
}
