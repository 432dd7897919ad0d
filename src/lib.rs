#![forbid(unsafe_code)]

//! Disposable VM sessions for CI.
//!
//! An in-VM [`agent`] executes processes and file operations on request; the
//! master-side [`proxy`] drives it over the [`protocol`]; the
//! [`orchestrator`] starts the VM, runs [`steps`] that find their session
//! through the [`session::registry`], and always performs the stop action.

pub mod agent;
pub mod config;
pub mod errors;
pub mod orchestrator;
pub mod protocol;
pub mod proxy;
pub mod session;
pub mod steps;
pub mod vm;

pub use config::{AgentConfig, ProfileConfig, SessionPolicy};
pub use errors::{AppError, Result};
