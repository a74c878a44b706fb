//! Communicator server
//!
//! Listens on an [`Endpoint`], turns every accepted stream into a
//! [`Channel`] and binds channels to [`Connection`]s as announces arrive.
//!
//! # Scalability Features
//!
//! - Each channel runs its own reader task and worker pool
//! - Semaphore-based connection limiting
//! - Waiters for spawned processes are independent of the accept loop

use super::connection::Connection;
use super::waiter::WaiterTable;
use super::{AnnounceHandler, ConnectionInfo, ConnectionObserver, ConnectionOrigin};
use crate::administrator::{Administrator, InterfaceRef};
use crate::channel::{AnnounceReply, AnnounceSink, Channel};
use crate::config::CommunicatorConfig;
use crate::interface::InterfacePtr;
use crate::interfaces::RemoteConnection;
use crate::message::{AnnounceKind, AnnounceRequest, AnnounceResponse};
use crate::process::{DestructionSupervisor, ProcessControl};
use crate::proxy::Accounting;
use crate::transport::{Endpoint, Listener};
use crate::types::{ChannelId, ConnectionId, Error, ErrorCode, InstanceId, InterfaceId, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Communicator statistics
#[derive(Debug, Default)]
pub struct CommunicatorStats {
    pub connections_accepted: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub announces: AtomicU64,
    pub spawn_timeouts: AtomicU64,
}

impl CommunicatorStats {
    pub fn snapshot(&self) -> CommunicatorStatsSnapshot {
        CommunicatorStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            announces: self.announces.load(Ordering::Relaxed),
            spawn_timeouts: self.spawn_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of communicator statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommunicatorStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub announces: u64,
    pub spawn_timeouts: u64,
}

#[derive(Default)]
struct Connections {
    by_id: HashMap<ConnectionId, Arc<Connection>>,
    by_channel: HashMap<ChannelId, ConnectionId>,
}

struct ServerInner {
    config: CommunicatorConfig,
    admin: Arc<Administrator>,
    handler: Arc<dyn AnnounceHandler>,
    observers: RwLock<Vec<Arc<dyn ConnectionObserver>>>,
    connections: Mutex<Connections>,
    waiters: WaiterTable,
    supervisor: DestructionSupervisor,
    next_id: AtomicU32,
    stats: CommunicatorStats,
}

/// Server end of the announce protocol
pub struct Communicator {
    inner: Arc<ServerInner>,
    endpoint: Endpoint,
    accept: JoinHandle<()>,
}

impl Communicator {
    /// Bind the configured endpoint and start accepting
    pub async fn open(
        config: CommunicatorConfig,
        admin: Arc<Administrator>,
        handler: Arc<dyn AnnounceHandler>,
    ) -> Result<Self> {
        let listener = Listener::bind(&config.endpoint).await?;
        let endpoint = listener.local_endpoint()?;
        info!(
            "Communicator listening on {} (max_connections: {})",
            endpoint, config.max_connections
        );

        let inner = Arc::new(ServerInner {
            config,
            admin,
            handler,
            observers: RwLock::new(Vec::new()),
            connections: Mutex::new(Connections::default()),
            waiters: WaiterTable::default(),
            supervisor: DestructionSupervisor::new(),
            next_id: AtomicU32::new(1),
            stats: CommunicatorStats::default(),
        });
        let accept = tokio::spawn(inner.clone().accept_loop(listener));

        Ok(Self {
            inner,
            endpoint,
            accept,
        })
    }

    /// Where clients connect; TCP port 0 is resolved
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn administrator(&self) -> &Arc<Administrator> {
        &self.inner.admin
    }

    pub fn stats(&self) -> &CommunicatorStats {
        &self.inner.stats
    }

    pub fn supervisor(&self) -> &DestructionSupervisor {
        &self.inner.supervisor
    }

    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.inner.observers.write().push(observer);
    }

    /// Launch a process and wait for it to announce itself
    ///
    /// Returns the connection together with the root interface the process
    /// announced, if any. The caller owns one reference on the root. When
    /// the process does not announce within `timeout` the connection is
    /// dropped, the process is handed to forced destruction and
    /// [`Error::Timeout`] is returned.
    pub async fn create(
        &self,
        process: Box<dyn ProcessControl>,
        timeout: Duration,
    ) -> Result<(Arc<Connection>, Option<InterfacePtr>)> {
        self.inner.create(process, &self.endpoint, timeout).await
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner.connections.lock().by_id.get(&id).cloned()
    }

    /// Connection as a marshalable interface
    pub fn remote_connection(&self, id: ConnectionId) -> Option<Arc<dyn RemoteConnection>> {
        self.connection(id)
            .map(|connection| connection as Arc<dyn RemoteConnection>)
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let connections: Vec<Arc<Connection>> =
            self.inner.connections.lock().by_id.values().cloned().collect();
        connections.iter().map(|connection| connection.info()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().by_id.len()
    }

    /// Spawned processes still expected to announce
    pub fn pending_announces(&self) -> usize {
        self.inner.waiters.len()
    }

    /// Stop accepting and close every connection
    pub async fn shutdown(&self) {
        self.accept.abort();
        let connections: Vec<Arc<Connection>> =
            self.inner.connections.lock().by_id.values().cloned().collect();
        for connection in connections {
            connection.terminate().await;
        }
        info!("Communicator on {} shut down", self.endpoint);
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

impl ServerInner {
    async fn accept_loop(self: Arc<Self>, listener: Listener) {
        let limit = Arc::new(Semaphore::new(self.config.max_connections));
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let permit = match limit.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                    warn!("Connection limit reached, rejecting connection from {}", peer);
                    drop(stream);
                    continue;
                }
            };
            self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);

            let sink: Weak<dyn AnnounceSink> = Arc::downgrade(&self) as Weak<dyn AnnounceSink>;
            let channel = Channel::open(
                stream,
                peer,
                self.admin.clone(),
                Some(sink),
                self.config.channel.clone(),
            );
            tokio::spawn(async move {
                // Permit is held until the channel is gone
                let _permit = permit;
                channel.closed().await;
            });
        }
    }

    fn allocate_id(&self) -> ConnectionId {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut connections = self.connections.lock();
        connections.by_channel.retain(|_, connection| *connection != id);
        connections.by_id.remove(&id)
    }

    fn by_channel(&self, channel: ChannelId) -> Option<Arc<Connection>> {
        let connections = self.connections.lock();
        let id = connections.by_channel.get(&channel)?;
        connections.by_id.get(id).cloned()
    }

    async fn create(
        &self,
        mut process: Box<dyn ProcessControl>,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<(Arc<Connection>, Option<InterfacePtr>)> {
        let id = self.allocate_id();
        let connection = Connection::new(id, process.origin(), self.supervisor.clone(), &self.config);
        self.connections.lock().by_id.insert(id, connection.clone());
        let waiter = self.waiters.register(id);

        let pid = match process.launch(id, endpoint) {
            Ok(pid) => pid,
            Err(e) => {
                warn!("Connection {}: launch failed: {}", id, e);
                self.waiters.cancel(id);
                self.remove(id);
                connection.mark_closed();
                return Err(e);
            }
        };
        connection.attach_process(process, pid);
        debug!("Connection {}: waiting for pid {} to announce", id, pid);

        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(root)) => Ok((connection, root)),
            Ok(Err(_)) => {
                self.remove(id);
                connection.mark_closed();
                connection.abandon_process();
                Err(Error::Unavailable)
            }
            Err(_) => {
                self.stats.spawn_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Connection {}: pid {} did not announce within {:?}",
                    id, pid, timeout
                );
                self.waiters.cancel(id);
                self.remove(id);
                connection.mark_closed();
                connection.abandon_process();
                Err(Error::Timeout)
            }
        }
    }

    /// Connection bound to `channel`, created as a bare client if there is none
    fn client_for(&self, channel: &Arc<Channel>, request: &AnnounceRequest) -> Option<Arc<Connection>> {
        if let Some(connection) = self.by_channel(channel.id()) {
            return Some(connection);
        }
        let connection = Connection::new(
            self.allocate_id(),
            ConnectionOrigin::Client,
            self.supervisor.clone(),
            &self.config,
        );
        if !connection.link(channel, request) {
            return None;
        }
        self.bind(channel, &connection);
        Some(connection)
    }

    fn bind(&self, channel: &Arc<Channel>, connection: &Arc<Connection>) {
        {
            let mut connections = self.connections.lock();
            connections.by_id.insert(connection.id(), connection.clone());
            connections.by_channel.insert(channel.id(), connection.id());
        }
        if channel.is_closed() {
            // Closed before the binding existed; clean up as the close would have
            self.channel_closed(channel.id());
            return;
        }
        let info = connection.info();
        info!(
            "Connection {} operational ({:?}, pid {:?}, channel {})",
            info.id,
            info.origin,
            info.remote_id,
            channel.id()
        );
        for observer in self.observers.read().iter() {
            observer.activated(&info);
        }
    }

    async fn import_root(&self, channel: &Arc<Channel>, request: &AnnounceRequest) -> Option<InterfacePtr> {
        if request.implementation.is_null() {
            return None;
        }
        let reference = InterfaceRef::sender(request.implementation, request.interface);
        match self.admin.import(channel, reference, Accounting::RefCounted).await {
            Ok(imported) => imported.map(|imported| imported.ptr),
            Err(e) => {
                warn!(
                    "Cannot import {} ({:#010x}) announced on channel {}: {}",
                    request.implementation,
                    request.interface,
                    channel.id(),
                    e
                );
                None
            }
        }
    }

    fn accepted(&self) -> AnnounceReply {
        self.accepted_with(InstanceId::NULL, 0)
    }

    fn accepted_with(&self, implementation: InstanceId, interface: InterfaceId) -> AnnounceReply {
        AnnounceReply::accept(AnnounceResponse {
            result: ErrorCode::None,
            implementation,
            interface,
            proxy_stub_path: self.config.proxy_stub_path.clone(),
        })
    }

    /// Instantiate the class a client asked for and lend it over `channel`
    async fn lend_class(&self, channel: &Arc<Channel>, request: &AnnounceRequest) -> Option<(InstanceId, InterfaceId)> {
        let acquired = self
            .handler
            .acquire(&request.class_name, request.interface, request.version)
            .await;
        let Some(ptr) = acquired else {
            debug!(
                "No class {} ({:#010x}) for channel {}",
                request.class_name,
                request.interface,
                channel.id()
            );
            return None;
        };
        let instance = self.admin.register_external(channel, &ptr);
        Some((instance, ptr.id()))
    }

    async fn on_request(&self, channel: &Arc<Channel>, request: AnnounceRequest) -> AnnounceReply {
        if self.by_channel(channel.id()).is_some() {
            warn!("Channel {} announced twice", channel.id());
            return AnnounceReply {
                response: AnnounceResponse::failure(ErrorCode::AlreadyConnected),
                close: false,
            };
        }

        if request.exchange_id == 0 {
            let Some(connection) = self.client_for(channel, &request) else {
                return AnnounceReply::reject(ErrorCode::Unavailable);
            };
            // A NULL implementation with an interface asks for a class instance
            if request.implementation.is_null() && request.interface != 0 {
                return match self.lend_class(channel, &request).await {
                    Some((instance, interface)) => self.accepted_with(instance, interface),
                    None => self.accepted(),
                };
            }
            if let Some(root) = self.import_root(channel, &request).await {
                self.handler.offer(&connection.info(), &request.callsign, root).await;
            }
            return self.accepted();
        }

        let Some(waiter) = self.waiters.take(request.exchange_id) else {
            warn!(
                "Announce for unknown exchange {} from pid {}",
                request.exchange_id, request.pid
            );
            return AnnounceReply::reject(ErrorCode::Unavailable);
        };
        let connection = self
            .connections
            .lock()
            .by_id
            .get(&request.exchange_id)
            .cloned();
        let Some(connection) = connection.filter(|connection| connection.link(channel, &request)) else {
            return AnnounceReply::reject(ErrorCode::Unavailable);
        };

        let root = self.import_root(channel, &request).await;
        // Bound before the creator sees the root, so calls back are admitted
        self.bind(channel, &connection);
        if let Err(root) = waiter.send(root) {
            debug!("Connection {}: creator gave up waiting", connection.id());
            if let Some(root) = root {
                root.release().await;
            }
            return AnnounceReply::reject(ErrorCode::Unavailable);
        }
        self.accepted()
    }

    async fn on_acquire(&self, channel: &Arc<Channel>, request: AnnounceRequest) -> AnnounceReply {
        if self.client_for(channel, &request).is_none() {
            return AnnounceReply::reject(ErrorCode::Unavailable);
        }
        match self.lend_class(channel, &request).await {
            Some((instance, interface)) => self.accepted_with(instance, interface),
            None => AnnounceReply {
                response: AnnounceResponse::failure(ErrorCode::UnknownKey),
                close: false,
            },
        }
    }

    async fn on_offer(&self, channel: &Arc<Channel>, request: AnnounceRequest) -> AnnounceReply {
        let Some(connection) = self.by_channel(channel.id()) else {
            return AnnounceReply {
                response: AnnounceResponse::failure(ErrorCode::BadRequest),
                close: false,
            };
        };
        match self.import_root(channel, &request).await {
            Some(ptr) => {
                self.handler.offer(&connection.info(), &request.callsign, ptr).await;
                self.accepted()
            }
            None => AnnounceReply {
                response: AnnounceResponse::failure(ErrorCode::UnknownKey),
                close: false,
            },
        }
    }

    async fn on_revoke(&self, channel: &Arc<Channel>, request: AnnounceRequest) -> AnnounceReply {
        let Some(connection) = self.by_channel(channel.id()) else {
            return AnnounceReply {
                response: AnnounceResponse::failure(ErrorCode::BadRequest),
                close: false,
            };
        };
        let proxy = self
            .admin
            .find_live_proxy(channel.id(), request.implementation, request.interface);
        match proxy {
            Some(ptr) => {
                self.handler.revoke(&connection.info(), &ptr).await;
                ptr.release().await;
                self.accepted()
            }
            None => AnnounceReply {
                response: AnnounceResponse::failure(ErrorCode::UnknownKey),
                close: false,
            },
        }
    }
}

#[async_trait]
impl AnnounceSink for ServerInner {
    async fn announce(&self, channel: &Arc<Channel>, request: AnnounceRequest) -> AnnounceReply {
        self.stats.announces.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Announce {:?} on channel {} (exchange {}, pid {})",
            request.kind,
            channel.id(),
            request.exchange_id,
            request.pid
        );
        match request.kind {
            AnnounceKind::Request => self.on_request(channel, request).await,
            AnnounceKind::Acquire => self.on_acquire(channel, request).await,
            AnnounceKind::Offer => self.on_offer(channel, request).await,
            AnnounceKind::Revoke => self.on_revoke(channel, request).await,
        }
    }

    fn admits_invoke(&self, channel: ChannelId) -> bool {
        self.by_channel(channel).is_some()
    }

    fn channel_closed(&self, channel: ChannelId) {
        let connection = {
            let mut connections = self.connections.lock();
            let Some(id) = connections.by_channel.remove(&channel) else {
                return;
            };
            connections.by_id.remove(&id)
        };
        let Some(connection) = connection else {
            return;
        };

        connection.release_process();
        connection.mark_closed();
        let info = connection.info();
        info!("Connection {} closed (channel {})", info.id, channel);
        for observer in self.observers.read().iter() {
            observer.deactivated(&info);
        }
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.supervisor.shutdown();
    }
}
