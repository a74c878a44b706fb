//! Connections between processes
//!
//! The [`Communicator`] is the server side: it listens, spawns processes
//! and waits for them to announce themselves, and accepts clients that
//! connect on their own. The [`CommunicatorClient`] is the other end.
//!
//! ```text
//!  create() ──▶ Spawning ──launch──▶ AwaitingAnnounce ──announce──▶ Operational
//!                  │                        │                           │
//!                  └──── failure/timeout ───┴──────▶ Closing ◀── close ─┘
//!                                                       │
//!                                                       ▼
//!                                                    Closed
//! ```
//!
//! Exactly one announce round trip makes a connection operational.

mod client;
mod connection;
mod server;
mod waiter;

pub use client::CommunicatorClient;
pub use connection::Connection;
pub use server::{Communicator, CommunicatorStats, CommunicatorStatsSnapshot};

use crate::administrator::InterfaceRef;
use crate::channel::Channel;
use crate::interface::InterfacePtr;
use crate::message::{AnnounceKind, AnnounceRequest};
use crate::proxy::Accounting;
use crate::types::{ChannelId, ConnectionId, Error, ErrorCode, InterfaceId, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How the peer process came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOrigin {
    /// Forked locally by `create`
    Spawned,
    /// Started through a container runtime
    Container,
    /// Connected on its own
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Spawning,
    AwaitingAnnounce,
    Operational,
    Closing,
    Closed,
}

/// Snapshot of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub origin: ConnectionOrigin,
    pub state: ConnectionState,
    /// Pid of the peer process, once known
    pub remote_id: Option<u32>,
    pub channel: Option<ChannelId>,
    pub class_name: String,
    pub callsign: String,
}

/// Serves announces arriving from peers
#[async_trait]
pub trait AnnounceHandler: Send + Sync {
    /// Instantiate `class_name`; the returned pointer carries one reference
    async fn acquire(&self, class_name: &str, interface: InterfaceId, version: u32) -> Option<InterfacePtr> {
        let _ = (class_name, interface, version);
        None
    }

    /// A peer handed over an interface; the handler owns one reference
    async fn offer(&self, connection: &ConnectionInfo, callsign: &str, ptr: InterfacePtr) {
        debug!(
            "Ignoring {:#010x} offered by connection {} ({})",
            ptr.id(),
            connection.id,
            callsign
        );
        ptr.release().await;
    }

    /// A peer withdrew an interface it offered earlier
    ///
    /// `ptr` is only valid for the duration of the call.
    async fn revoke(&self, connection: &ConnectionInfo, ptr: &InterfacePtr) {
        let _ = (connection, ptr);
    }
}

/// Gets told about connections coming and going
pub trait ConnectionObserver: Send + Sync {
    fn activated(&self, connection: &ConnectionInfo) {
        let _ = connection;
    }

    fn deactivated(&self, connection: &ConnectionInfo) {
        let _ = connection;
    }
}

/// Ask the peer on `channel` to instantiate a class and proxy the result
pub(crate) async fn acquire_over(
    channel: &Arc<Channel>,
    class_name: &str,
    interface: InterfaceId,
    version: u32,
    timeout: Duration,
) -> Result<Option<InterfacePtr>> {
    let mut request = AnnounceRequest::new(AnnounceKind::Acquire);
    request.class_name = class_name.to_string();
    request.interface = interface;
    request.version = version;

    let response = channel.announce(request, timeout).await?;
    match response.result {
        ErrorCode::None => {}
        ErrorCode::UnknownKey => {
            debug!("Peer has no class {} for {:#010x}", class_name, interface);
            return Ok(None);
        }
        code => return Err(Error::Remote(code)),
    }
    if response.implementation.is_null() {
        return Ok(None);
    }

    let reference = InterfaceRef::sender(response.implementation, response.interface);
    let imported = channel
        .administrator()
        .import(channel, reference, Accounting::RefCounted)
        .await?;
    Ok(imported.map(|imported| imported.ptr))
}
