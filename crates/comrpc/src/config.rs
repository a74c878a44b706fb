//! Runtime configuration

use crate::transport::{Endpoint, DEFAULT_MAX_MESSAGE_SIZE};
use std::time::Duration;

/// Default time a spawned process gets to announce itself
pub const DEFAULT_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(3);

/// Default time a proxy waits for a reply
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(3);

/// Default time a timed-out call keeps waiting for a late reply
pub const DEFAULT_LATE_REPLY_WINDOW: Duration = Duration::from_secs(30);

/// Default number of concurrently dispatched inbound calls per channel
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Per-channel settings
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Inbound calls dispatched concurrently
    pub worker_threads: usize,
    pub max_message_size: usize,
    /// How long proxies on this channel wait for a reply
    pub call_timeout: Duration,
    /// How long a timed-out call stays registered before it is dropped
    pub late_reply_window: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            late_reply_window: DEFAULT_LATE_REPLY_WINDOW,
        }
    }
}

impl ChannelConfig {
    pub fn with_worker_threads(mut self, workers: usize) -> Self {
        self.worker_threads = workers.max(1);
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_late_reply_window(mut self, window: Duration) -> Self {
        self.late_reply_window = window;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }
}

/// Server/communicator settings
#[derive(Debug, Clone)]
pub struct CommunicatorConfig {
    pub endpoint: Endpoint,
    /// How long `create` waits for the spawned process to announce
    pub announce_timeout: Duration,
    pub channel: ChannelConfig,
    /// Grace period between a graceful close and SIGTERM
    pub soft_kill_grace: Duration,
    /// Grace period between a graceful close and SIGKILL
    pub hard_kill_grace: Duration,
    /// Reported to clients in the announce response
    pub proxy_stub_path: String,
    /// Maximum concurrent connections
    pub max_connections: usize,
}

impl CommunicatorConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            announce_timeout: DEFAULT_ANNOUNCE_TIMEOUT,
            channel: ChannelConfig::default(),
            soft_kill_grace: Duration::from_secs(5),
            hard_kill_grace: Duration::from_secs(10),
            proxy_stub_path: String::new(),
            max_connections: 256,
        }
    }

    pub fn with_announce_timeout(mut self, timeout: Duration) -> Self {
        self.announce_timeout = timeout;
        self
    }

    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    /// Set both kill grace periods; `hard` is clamped to be no earlier than `soft`
    pub fn with_kill_grace(mut self, soft: Duration, hard: Duration) -> Self {
        self.soft_kill_grace = soft;
        self.hard_kill_grace = hard.max(soft);
        self
    }

    pub fn with_proxy_stub_path(mut self, path: impl Into<String>) -> Self {
        self.proxy_stub_path = path.into();
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }
}
