//! COM-RPC: inter-process object RPC
//!
//! A process hands out references to interfaces it implements; a peer
//! process calls methods on them through proxies as if they were local,
//! passes callback interfaces back, and the reference counts stay
//! consistent across the process boundary, including when a peer dies.
//!
//! # Architecture
//!
//! ```text
//!   caller                                                 implementation
//!     │                                                          ▲
//!     ▼                                                          │
//! ┌────────┐  Invoke   ┌─────────┐   frames   ┌─────────┐  ┌──────────┐
//! │ Proxy  │──────────▶│ Channel │◀══════════▶│ Channel │─▶│   Stub   │
//! └────────┘           └─────────┘            └─────────┘  └──────────┘
//!     ▲                     │                      │             ▲
//!     │              ┌──────┴────────┐      ┌──────┴────────┐    │
//!     └──────────────│ Administrator │      │ Administrator │────┘
//!                    └───────────────┘      └───────────────┘
//!                            ▲                      ▲
//!                    ┌───────┴──────┐ Announce ┌────┴───────────────┐
//!                    │ Communicator │◀─────────│ CommunicatorClient │
//!                    └──────────────┘          └────────────────────┘
//! ```
//!
//! - [`Administrator`]: interface registrations, local instances, lent
//!   references and proxies, per process
//! - [`Channel`]: one framed stream with request/response correlation
//! - [`Communicator`] / [`CommunicatorClient`]: the announce handshake,
//!   process spawning and connection lifecycle
//! - [`DestructionSupervisor`]: forced termination of processes that do
//!   not go away on their own
//!
//! # Example
//!
//! ```no_run
//! use comrpc::{Administrator, AnnounceHandler, Communicator, CommunicatorConfig};
//! use std::sync::Arc;
//!
//! struct NoClasses;
//! impl AnnounceHandler for NoClasses {}
//!
//! #[tokio::main]
//! async fn main() -> comrpc::Result<()> {
//!     let admin = Administrator::new();
//!     let config = CommunicatorConfig::new("127.0.0.1:0".parse()?);
//!     let communicator = Communicator::open(config, admin, Arc::new(NoClasses)).await?;
//!     println!("listening on {}", communicator.endpoint());
//!     Ok(())
//! }
//! ```

pub mod administrator;
pub mod channel;
pub mod communicator;
pub mod config;
pub mod host;
pub mod interface;
pub mod interfaces;
pub mod message;
pub mod process;
pub mod proxy;
pub mod stub;
pub mod transport;
pub mod types;

pub use administrator::{Administrator, ChannelTeardown, InterfaceRef, ProxyFactory};
pub use channel::{Channel, ChannelState, ChannelStats, ChannelStatsSnapshot};
pub use communicator::{
    AnnounceHandler, Communicator, CommunicatorClient, CommunicatorStats, CommunicatorStatsSnapshot,
    Connection, ConnectionInfo, ConnectionObserver, ConnectionOrigin, ConnectionState,
};
pub use config::{
    ChannelConfig, CommunicatorConfig, DEFAULT_ANNOUNCE_TIMEOUT, DEFAULT_CALL_TIMEOUT,
    DEFAULT_LATE_REPLY_WINDOW,
};
pub use host::{run_host, ClassRegistry, HostArgs};
pub use interface::{InterfacePtr, InterfaceType, Unknown, WeakInterfacePtr};
pub use interfaces::{RemoteConnection, RemoteIterator, VecIterator, FIRST_USER_INTERFACE};
pub use process::{
    ContainerProcess, ContainerRuntime, DestructionSupervisor, LaunchOptions, LocalProcess,
    ProcessControl, Termination,
};
pub use proxy::{ProxyCall, ProxyCore, ProxyState, Reply};
pub use stub::{CallContext, Stub};
pub use transport::Endpoint;
pub use types::{
    method, ChannelId, ConnectionId, Error, ErrorCode, InstanceId, InterfaceId, MethodIndex, Result,
};

pub use comrpc_frame::{Frame, FrameReader, FrameValue};

// Used by `proxy_unknown!`
pub use async_trait::async_trait;
pub use futures::future::BoxFuture;
