//! Process lifecycle
//!
//! A communicator does not care how the peer process comes to life. It
//! hands a [`ProcessControl`] the exchange id and the endpoint to connect
//! back to, and later asks it to go away again. [`LocalProcess`] forks a
//! host binary; [`ContainerProcess`] delegates to a [`ContainerRuntime`].
//!
//! Forced termination happens off the async runtime in the
//! [`DestructionSupervisor`] thread.

mod container;
mod launch;
mod local;
mod supervisor;

pub use container::{ContainerProcess, ContainerRuntime};
pub use launch::LaunchOptions;
pub use local::LocalProcess;
pub use supervisor::DestructionSupervisor;

use crate::communicator::ConnectionOrigin;
use crate::transport::Endpoint;
use crate::types::{ConnectionId, Result};

/// How hard to ask a process to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGTERM or the runtime's equivalent
    Soft,
    /// SIGKILL; the process is reaped afterwards
    Hard,
}

/// Launches and stops the process behind a connection
pub trait ProcessControl: Send {
    /// Start the process; it must connect to `connector` and announce
    /// itself with `exchange_id`. Returns its pid.
    fn launch(&mut self, exchange_id: ConnectionId, connector: &Endpoint) -> Result<u32>;

    /// Pid of the running process, once launched
    fn remote_id(&self) -> Option<u32>;

    /// Whether the process is still running; reaps it if it exited
    fn is_active(&mut self) -> bool;

    fn terminate(&mut self, mode: Termination) -> Result<()>;

    /// Collect diagnostics before a hard kill
    fn post_mortem(&mut self) {}

    fn origin(&self) -> ConnectionOrigin {
        ConnectionOrigin::Spawned
    }
}
