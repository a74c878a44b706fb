//! Host side of a spawned process
//!
//! A host binary parses its command line into [`HostArgs`], registers the
//! classes it can instantiate in a [`ClassRegistry`] and calls
//! [`run_host`]. That connects back to the communicator, announces the
//! requested class as the root interface and serves calls until the
//! server closes the channel.

use crate::administrator::Administrator;
use crate::communicator::{AnnounceHandler, CommunicatorClient};
use crate::config::{ChannelConfig, DEFAULT_ANNOUNCE_TIMEOUT};
use crate::interface::InterfacePtr;
use crate::transport::Endpoint;
use crate::types::{ConnectionId, InterfaceId, Result};
use async_trait::async_trait;
use clap::Parser;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};

/// Command line every spawned host understands
#[derive(Parser, Debug, Clone)]
#[command(name = "comrpc-host", about = "COM-RPC out-of-process host")]
#[command(disable_version_flag = true)]
pub struct HostArgs {
    /// Library or module holding the class
    #[arg(short = 'l')]
    pub locator: String,

    #[arg(short = 'c')]
    pub class_name: String,

    #[arg(short = 'C')]
    pub callsign: String,

    /// Communicator endpoint to connect back to
    #[arg(short = 'r')]
    pub connector: Endpoint,

    /// Interface to announce the root object as
    #[arg(short = 'i', value_parser = parse_number)]
    pub interface: InterfaceId,

    /// Connection id to announce with
    #[arg(short = 'x')]
    pub exchange_id: ConnectionId,

    #[arg(short = 'V')]
    pub version: Option<u32>,

    #[arg(short = 'u')]
    pub user: Option<String>,

    #[arg(short = 'g')]
    pub group: Option<String>,

    #[arg(short = 'p')]
    pub persistent_path: Option<PathBuf>,

    #[arg(short = 's')]
    pub system_path: Option<PathBuf>,

    #[arg(short = 'd')]
    pub data_path: Option<PathBuf>,

    #[arg(short = 'a')]
    pub app_path: Option<PathBuf>,

    #[arg(short = 'v')]
    pub volatile_path: Option<PathBuf>,

    #[arg(short = 'm')]
    pub proxy_stub_path: Option<PathBuf>,

    #[arg(short = 'P')]
    pub post_mortem_path: Option<PathBuf>,

    /// Inbound calls dispatched concurrently
    #[arg(short = 't')]
    pub threads: Option<usize>,

    /// Logging bitmask
    #[arg(short = 'e', value_parser = parse_number)]
    pub logging: Option<u32>,
}

/// Decimal or `0x`-prefixed hexadecimal
fn parse_number(value: &str) -> std::result::Result<u32, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", value, e))
}

impl HostArgs {
    pub fn channel_config(&self) -> ChannelConfig {
        let config = ChannelConfig::default();
        match self.threads {
            Some(threads) => config.with_worker_threads(threads),
            None => config,
        }
    }

    /// Verbosity selected by the highest bit of the logging mask
    pub fn log_level(&self) -> Level {
        match self.logging {
            None => Level::INFO,
            Some(mask) if mask >= 0x8 => Level::TRACE,
            Some(mask) if mask >= 0x4 => Level::DEBUG,
            Some(mask) if mask >= 0x2 => Level::INFO,
            Some(mask) if mask >= 0x1 => Level::WARN,
            Some(_) => Level::ERROR,
        }
    }
}

type ClassFactory = Arc<dyn Fn(InterfaceId, u32) -> Option<InterfacePtr> + Send + Sync>;

/// Classes a process can instantiate by name
#[derive(Clone, Default)]
pub struct ClassRegistry {
    classes: Arc<RwLock<HashMap<String, ClassFactory>>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`; it gets the requested interface id
    /// and version and returns a pointer carrying one reference
    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(InterfaceId, u32) -> Option<InterfacePtr> + Send + Sync + 'static,
    {
        self.classes.write().insert(name.into(), Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.classes.read().contains_key(name)
    }

    pub fn create(&self, name: &str, interface: InterfaceId, version: u32) -> Option<InterfacePtr> {
        let factory = self.classes.read().get(name).cloned()?;
        let created = factory(interface, version)?;
        if created.id() != interface {
            warn!(
                "Class {} produced {:#010x}, expected {:#010x}",
                name,
                created.id(),
                interface
            );
            return None;
        }
        Some(created)
    }
}

#[async_trait]
impl AnnounceHandler for ClassRegistry {
    async fn acquire(&self, class_name: &str, interface: InterfaceId, version: u32) -> Option<InterfacePtr> {
        self.create(class_name, interface, version)
    }
}

/// Connect back, announce the requested class and serve until closed
pub async fn run_host(args: HostArgs, admin: Arc<Administrator>, registry: ClassRegistry) -> Result<()> {
    let root = registry.create(&args.class_name, args.interface, args.version.unwrap_or(0));
    if root.is_none() {
        warn!(
            "Class {} ({:#010x}) not available in {}",
            args.class_name, args.interface, args.locator
        );
    }

    let client = CommunicatorClient::new(args.connector.clone(), admin)
        .with_channel_config(args.channel_config())
        .with_handler(Arc::new(registry))
        .with_identity(args.class_name.clone(), args.callsign.clone());

    if let Some(lent) = client
        .announce(DEFAULT_ANNOUNCE_TIMEOUT, args.exchange_id, root.as_ref())
        .await?
    {
        lent.release().await;
    }
    info!(
        "Host {} serving {} as {} (exchange {})",
        std::process::id(),
        args.class_name,
        args.callsign,
        args.exchange_id
    );

    client.closed().await;
    if let Some(root) = root {
        root.release().await;
    }
    info!("Channel to {} closed, host exiting", args.connector);
    Ok(())
}
