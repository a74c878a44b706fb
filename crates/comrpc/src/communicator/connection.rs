//! Server-side connection record

use super::{acquire_over, ConnectionInfo, ConnectionOrigin, ConnectionState};
use crate::channel::Channel;
use crate::config::CommunicatorConfig;
use crate::interface::{InterfacePtr, Unknown};
use crate::interfaces::RemoteConnection;
use crate::message::AnnounceRequest;
use crate::process::{DestructionSupervisor, ProcessControl};
use crate::types::{ConnectionId, Error, InterfaceId, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

struct Inner {
    state: ConnectionState,
    channel: Option<Arc<Channel>>,
    remote_id: Option<u32>,
    class_name: String,
    callsign: String,
}

/// One peer process as seen by the [`Communicator`](super::Communicator)
pub struct Connection {
    id: ConnectionId,
    origin: ConnectionOrigin,
    inner: Mutex<Inner>,
    process: Mutex<Option<Box<dyn ProcessControl>>>,
    supervisor: DestructionSupervisor,
    soft_grace: Duration,
    hard_grace: Duration,
    announce_timeout: Duration,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        origin: ConnectionOrigin,
        supervisor: DestructionSupervisor,
        config: &CommunicatorConfig,
    ) -> Arc<Self> {
        let state = match origin {
            ConnectionOrigin::Client => ConnectionState::AwaitingAnnounce,
            ConnectionOrigin::Spawned | ConnectionOrigin::Container => ConnectionState::Spawning,
        };
        Arc::new(Self {
            id,
            origin,
            inner: Mutex::new(Inner {
                state,
                channel: None,
                remote_id: None,
                class_name: String::new(),
                callsign: String::new(),
            }),
            process: Mutex::new(None),
            supervisor,
            soft_grace: config.soft_kill_grace,
            hard_grace: config.hard_kill_grace,
            announce_timeout: config.announce_timeout,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn origin(&self) -> ConnectionOrigin {
        self.origin
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn remote_id(&self) -> Option<u32> {
        self.inner.lock().remote_id
    }

    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.inner.lock().channel.clone()
    }

    pub fn info(&self) -> ConnectionInfo {
        let inner = self.inner.lock();
        ConnectionInfo {
            id: self.id,
            origin: self.origin,
            state: inner.state,
            remote_id: inner.remote_id,
            channel: inner.channel.as_ref().map(|channel| channel.id()),
            class_name: inner.class_name.clone(),
            callsign: inner.callsign.clone(),
        }
    }

    pub(crate) fn attach_process(&self, process: Box<dyn ProcessControl>, pid: u32) {
        *self.process.lock() = Some(process);
        let mut inner = self.inner.lock();
        inner.remote_id = Some(pid);
        if inner.state == ConnectionState::Spawning {
            inner.state = ConnectionState::AwaitingAnnounce;
        }
    }

    /// Bind the announcing channel; false if already bound or closing
    pub(crate) fn link(&self, channel: &Arc<Channel>, request: &AnnounceRequest) -> bool {
        let mut inner = self.inner.lock();
        if inner.channel.is_some()
            || matches!(inner.state, ConnectionState::Closing | ConnectionState::Closed)
        {
            return false;
        }
        inner.channel = Some(channel.clone());
        inner.remote_id.get_or_insert(request.pid);
        inner.class_name = request.class_name.clone();
        inner.callsign = request.callsign.clone();
        inner.state = ConnectionState::Operational;
        true
    }

    /// Move to Closed; true the first time
    pub(crate) fn mark_closed(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Closed {
            return false;
        }
        inner.state = ConnectionState::Closed;
        true
    }

    /// Hand the process to the supervisor with the configured grace periods
    pub(crate) fn release_process(&self) {
        self.schedule_process(self.soft_grace, self.hard_grace);
    }

    /// Hand the process to the supervisor for immediate termination
    pub(crate) fn abandon_process(&self) {
        self.schedule_process(Duration::ZERO, self.hard_grace);
    }

    fn schedule_process(&self, soft: Duration, hard: Duration) {
        let process = self.process.lock().take();
        if let Some(process) = process {
            debug!("Connection {}: process handed to supervisor", self.id);
            self.supervisor.schedule(process, soft, hard);
        }
    }

    /// Close the connection
    ///
    /// The channel closes first, which ends the peer's host loop; the
    /// process is only forced down if it outlives the grace periods.
    pub async fn terminate(&self) {
        let channel = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Closed {
                return;
            }
            inner.state = ConnectionState::Closing;
            inner.channel.clone()
        };
        if let Some(channel) = channel {
            channel.close().await;
        }
        self.release_process();
        self.mark_closed();
    }

    /// Wait until the connection's channel closed
    pub async fn closed(&self) {
        if let Some(channel) = self.channel() {
            channel.closed().await;
        }
    }

    /// Instantiate a class in the peer process
    pub async fn acquire(
        &self,
        class_name: &str,
        interface: InterfaceId,
        version: u32,
    ) -> Result<Option<InterfacePtr>> {
        let channel = self.channel().ok_or(Error::Unavailable)?;
        acquire_over(&channel, class_name, interface, version, self.announce_timeout).await
    }
}

impl Unknown for Connection {}

#[async_trait]
impl RemoteConnection for Connection {
    async fn id(&self) -> Result<ConnectionId> {
        Ok(self.id)
    }

    async fn remote_id(&self) -> Result<u32> {
        Ok(Connection::remote_id(self).unwrap_or(0))
    }

    async fn terminate(&self) -> Result<()> {
        Connection::terminate(self).await;
        Ok(())
    }

    async fn acquire(&self, class_name: &str, interface: InterfaceId, version: u32) -> Result<Option<InterfacePtr>> {
        Connection::acquire(self, class_name, interface, version).await
    }
}
