//! Locally forked host processes

use super::{LaunchOptions, ProcessControl, Termination};
use crate::transport::Endpoint;
use crate::types::{ConnectionId, Error, Result};
use std::process::Child;
use tracing::{debug, info, warn};

/// Host binary started with [`std::process::Command`]
pub struct LocalProcess {
    options: LaunchOptions,
    child: Option<Child>,
    exited: bool,
}

impl LocalProcess {
    pub fn new(options: LaunchOptions) -> Self {
        Self {
            options,
            child: None,
            exited: false,
        }
    }

    pub fn options(&self) -> &LaunchOptions {
        &self.options
    }

    #[cfg(unix)]
    fn signal(&self, signal: nix::sys::signal::Signal) -> Result<()> {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Some(pid) = self.remote_id() else {
            return Ok(());
        };
        match kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(Error::Io(std::io::Error::from(e))),
        }
    }
}

impl ProcessControl for LocalProcess {
    fn launch(&mut self, exchange_id: ConnectionId, connector: &Endpoint) -> Result<u32> {
        let mut command = self.options.command(exchange_id, connector);
        let child = command.spawn().map_err(|e| {
            Error::Launch(format!("{}: {}", self.options.binary.display(), e))
        })?;
        let pid = child.id();
        info!(
            "Launched {} ({}) as pid {}, exchange {}",
            self.options.class_name,
            self.options.binary.display(),
            pid,
            exchange_id
        );
        self.child = Some(child);
        Ok(pid)
    }

    fn remote_id(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    fn is_active(&mut self) -> bool {
        if self.exited {
            return false;
        }
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!("Process {} exited: {}", child.id(), status);
                self.exited = true;
                false
            }
            Err(e) => {
                warn!("Cannot query process {}: {}", child.id(), e);
                false
            }
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self, mode: Termination) -> Result<()> {
        use nix::sys::signal::Signal;

        if !self.is_active() {
            return Ok(());
        }
        match mode {
            Termination::Soft => {
                debug!("Sending SIGTERM to {:?}", self.remote_id());
                self.signal(Signal::SIGTERM)
            }
            Termination::Hard => {
                debug!("Sending SIGKILL to {:?}", self.remote_id());
                self.signal(Signal::SIGKILL)?;
                if let Some(child) = self.child.as_mut() {
                    child.wait()?;
                }
                self.exited = true;
                Ok(())
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self, mode: Termination) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        if mode == Termination::Hard {
            if let Some(child) = self.child.as_mut() {
                child.kill()?;
                child.wait()?;
            }
            self.exited = true;
        }
        Ok(())
    }

    fn post_mortem(&mut self) {
        let Some(pid) = self.remote_id() else {
            return;
        };
        match &self.options.post_mortem_path {
            #[cfg(unix)]
            Some(path) => {
                warn!(
                    "Process {} unresponsive, requesting core dump into {}",
                    pid,
                    path.display()
                );
                if let Err(e) = self.signal(nix::sys::signal::Signal::SIGABRT) {
                    warn!("Post-mortem signal to {} failed: {}", pid, e);
                }
            }
            _ => warn!("Process {} unresponsive, killing it", pid),
        }
    }
}
