//! Communicator client
//!
//! Connects to a [`Communicator`](super::Communicator) and performs the
//! announce handshake. A spawned host announces with the exchange id it
//! was started with; an unrelated client announces with exchange 0.

use super::{acquire_over, AnnounceHandler};
use crate::administrator::{Administrator, InterfaceRef};
use crate::channel::{AnnounceReply, AnnounceSink, Channel};
use crate::config::ChannelConfig;
use crate::interface::{InterfacePtr, InterfaceType};
use crate::message::{AnnounceKind, AnnounceRequest, AnnounceResponse};
use crate::proxy::Accounting;
use crate::transport::Endpoint;
use crate::types::{Error, ErrorCode, InterfaceId, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Serves Acquire announces the server sends back over the channel
struct ClientSink {
    handler: Option<Arc<dyn AnnounceHandler>>,
}

#[async_trait]
impl AnnounceSink for ClientSink {
    async fn announce(&self, channel: &Arc<Channel>, request: AnnounceRequest) -> AnnounceReply {
        if request.kind != AnnounceKind::Acquire {
            warn!("Unexpected {:?} announce on client channel {}", request.kind, channel.id());
            return AnnounceReply {
                response: AnnounceResponse::failure(ErrorCode::BadRequest),
                close: false,
            };
        }

        let acquired = match &self.handler {
            Some(handler) => {
                handler
                    .acquire(&request.class_name, request.interface, request.version)
                    .await
            }
            None => None,
        };
        let Some(ptr) = acquired else {
            return AnnounceReply {
                response: AnnounceResponse::failure(ErrorCode::UnknownKey),
                close: false,
            };
        };

        let instance = channel.administrator().register_external(channel, &ptr);
        AnnounceReply::accept(AnnounceResponse {
            result: ErrorCode::None,
            implementation: instance,
            interface: ptr.id(),
            proxy_stub_path: String::new(),
        })
    }
}

/// Client end of the announce protocol
pub struct CommunicatorClient {
    endpoint: Endpoint,
    admin: Arc<Administrator>,
    config: ChannelConfig,
    sink: Arc<ClientSink>,
    class_name: String,
    callsign: String,
    channel: tokio::sync::Mutex<Option<Arc<Channel>>>,
    proxy_stub_path: Mutex<String>,
}

impl CommunicatorClient {
    pub fn new(endpoint: Endpoint, admin: Arc<Administrator>) -> Self {
        Self {
            endpoint,
            admin,
            config: ChannelConfig::default(),
            sink: Arc::new(ClientSink { handler: None }),
            class_name: String::new(),
            callsign: String::new(),
            channel: tokio::sync::Mutex::new(None),
            proxy_stub_path: Mutex::new(String::new()),
        }
    }

    pub fn with_channel_config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    /// Serve classes the server acquires from this process
    pub fn with_handler(mut self, handler: Arc<dyn AnnounceHandler>) -> Self {
        self.sink = Arc::new(ClientSink {
            handler: Some(handler),
        });
        self
    }

    /// Class name and callsign reported in the handshake
    pub fn with_identity(mut self, class_name: impl Into<String>, callsign: impl Into<String>) -> Self {
        self.class_name = class_name.into();
        self.callsign = callsign.into();
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn administrator(&self) -> &Arc<Administrator> {
        &self.admin
    }

    /// Proxy/stub search path the server handed out in the handshake
    pub fn proxy_stub_path(&self) -> String {
        self.proxy_stub_path.lock().clone()
    }

    /// Current channel, if connected
    pub async fn channel(&self) -> Option<Arc<Channel>> {
        self.channel
            .lock()
            .await
            .as_ref()
            .filter(|channel| !channel.is_closed())
            .cloned()
    }

    async fn connect(&self) -> Result<Arc<Channel>> {
        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.as_ref().filter(|channel| !channel.is_closed()) {
            return Ok(channel.clone());
        }

        let stream = self.endpoint.connect().await?;
        let sink: Weak<dyn AnnounceSink> = Arc::downgrade(&self.sink) as Weak<dyn AnnounceSink>;
        let channel = Channel::open(
            stream,
            self.endpoint.to_string(),
            self.admin.clone(),
            Some(sink),
            self.config.clone(),
        );
        debug!("Connected to {} on channel {}", self.endpoint, channel.id());
        *slot = Some(channel.clone());
        Ok(channel)
    }

    /// Handshake as an unrelated client
    pub async fn open(&self, timeout: Duration) -> Result<Option<InterfacePtr>> {
        self.announce(timeout, 0, None).await
    }

    /// Handshake and instantiate `class_name` in the server process
    ///
    /// The class rides on the announce itself, so this takes a single
    /// round trip. `None` if the server has no such class.
    pub async fn open_acquire(
        &self,
        timeout: Duration,
        class_name: &str,
        interface: InterfaceId,
        version: u32,
    ) -> Result<Option<InterfacePtr>> {
        let channel = self.connect().await?;
        let mut request = AnnounceRequest::new(AnnounceKind::Request);
        request.class_name = class_name.to_string();
        request.callsign = self.callsign.clone();
        request.interface = interface;
        request.version = version;
        self.handshake(&channel, timeout, request).await
    }

    /// Handshake, optionally lending `root` to the server
    ///
    /// `exchange_id` is the connection id a spawned process received on its
    /// command line. Returns the interface the server lent back, if any.
    pub async fn announce(
        &self,
        timeout: Duration,
        exchange_id: u32,
        root: Option<&InterfacePtr>,
    ) -> Result<Option<InterfacePtr>> {
        let channel = self.connect().await?;

        let mut request = AnnounceRequest::new(AnnounceKind::Request);
        request.exchange_id = exchange_id;
        request.class_name = self.class_name.clone();
        request.callsign = self.callsign.clone();
        if let Some(root) = root {
            root.add_ref();
            request.implementation = self.admin.register_external(&channel, root);
            request.interface = root.id();
        }
        self.handshake(&channel, timeout, request).await
    }

    async fn handshake(
        &self,
        channel: &Arc<Channel>,
        timeout: Duration,
        request: AnnounceRequest,
    ) -> Result<Option<InterfacePtr>> {
        let exchange_id = request.exchange_id;
        let response = match channel.announce(request, timeout).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Announce to {} failed: {}", self.endpoint, e);
                channel.close().await;
                return Err(e);
            }
        };
        if response.result != ErrorCode::None {
            warn!("Announce to {} rejected: {:?}", self.endpoint, response.result);
            channel.close().await;
            return Err(Error::Remote(response.result));
        }

        *self.proxy_stub_path.lock() = response.proxy_stub_path.clone();
        info!(
            "Announced to {} on channel {} (exchange {})",
            self.endpoint,
            channel.id(),
            exchange_id
        );

        if response.implementation.is_null() {
            return Ok(None);
        }
        let reference = InterfaceRef::sender(response.implementation, response.interface);
        let imported = self
            .admin
            .import(channel, reference, Accounting::RefCounted)
            .await?;
        Ok(imported.map(|imported| imported.ptr))
    }

    /// Instantiate a class in the server process
    ///
    /// Connects first if needed. `None` if the server has no such class.
    pub async fn acquire(
        &self,
        timeout: Duration,
        class_name: &str,
        interface: InterfaceId,
        version: u32,
    ) -> Result<Option<InterfacePtr>> {
        let channel = self.connect().await?;
        acquire_over(&channel, class_name, interface, version, timeout).await
    }

    pub async fn acquire_as<I: ?Sized + InterfaceType>(
        &self,
        timeout: Duration,
        class_name: &str,
        version: u32,
    ) -> Result<Option<Arc<I>>> {
        let acquired = self.acquire(timeout, class_name, I::ID, version).await?;
        Ok(acquired.and_then(|ptr| ptr.query::<I>()))
    }

    /// Hand `ptr` to the server after the handshake
    ///
    /// The server takes one reference, returned when it releases its proxy.
    pub async fn offer(&self, timeout: Duration, callsign: &str, ptr: &InterfacePtr) -> Result<()> {
        let channel = self.channel().await.ok_or(Error::Unavailable)?;
        let mut request = AnnounceRequest::new(AnnounceKind::Offer);
        request.callsign = callsign.to_string();
        ptr.add_ref();
        request.implementation = self.admin.register_external(&channel, ptr);
        request.interface = ptr.id();

        let response = channel.announce(request, timeout).await?;
        response.result.into_result()
    }

    /// Withdraw an interface offered earlier
    pub async fn revoke(&self, timeout: Duration, ptr: &InterfacePtr) -> Result<()> {
        let channel = self.channel().await.ok_or(Error::Unavailable)?;
        let mut request = AnnounceRequest::new(AnnounceKind::Revoke);
        request.implementation = self.admin.register_instance(ptr);
        request.interface = ptr.id();

        let response = channel.announce(request, timeout).await?;
        response.result.into_result()
    }

    pub async fn close(&self) {
        let channel = self.channel.lock().await.take();
        if let Some(channel) = channel {
            channel.close().await;
        }
    }

    /// Wait until the server side closed the channel
    pub async fn closed(&self) {
        let channel = self.channel.lock().await.clone();
        if let Some(channel) = channel {
            channel.closed().await;
        }
    }
}
