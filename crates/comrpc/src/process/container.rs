//! Container-backed processes

use super::{LaunchOptions, ProcessControl, Termination};
use crate::communicator::ConnectionOrigin;
use crate::transport::Endpoint;
use crate::types::{ConnectionId, Result};
use tracing::{debug, info};

/// Starts and stops a host inside some container technology
///
/// The runtime receives the same argument vector a locally forked host
/// would get and reports the pid of the process inside the container.
pub trait ContainerRuntime: Send {
    fn launch(&mut self, options: &LaunchOptions, args: &[String]) -> Result<u32>;

    fn is_active(&mut self) -> bool;

    /// Stop the container
    fn terminate(&mut self) -> Result<()>;

    fn post_mortem(&mut self) {}

    fn remote_id(&self) -> Option<u32>;
}

/// [`ProcessControl`] on top of a [`ContainerRuntime`]
pub struct ContainerProcess<R> {
    options: LaunchOptions,
    runtime: R,
}

impl<R: ContainerRuntime> ContainerProcess<R> {
    pub fn new(options: LaunchOptions, runtime: R) -> Self {
        Self { options, runtime }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }
}

impl<R: ContainerRuntime> ProcessControl for ContainerProcess<R> {
    fn launch(&mut self, exchange_id: ConnectionId, connector: &Endpoint) -> Result<u32> {
        let args = self.options.command_line(exchange_id, connector);
        let pid = self.runtime.launch(&self.options, &args)?;
        info!(
            "Container for {} started, pid {}, exchange {}",
            self.options.callsign, pid, exchange_id
        );
        Ok(pid)
    }

    fn remote_id(&self) -> Option<u32> {
        self.runtime.remote_id()
    }

    fn is_active(&mut self) -> bool {
        self.runtime.is_active()
    }

    fn terminate(&mut self, mode: Termination) -> Result<()> {
        // Containers have no soft/hard distinction; stopping one is final
        if mode == Termination::Soft {
            debug!("Stopping container for {}", self.options.callsign);
        }
        self.runtime.terminate()
    }

    fn post_mortem(&mut self) {
        self.runtime.post_mortem();
    }

    fn origin(&self) -> ConnectionOrigin {
        ConnectionOrigin::Container
    }
}
