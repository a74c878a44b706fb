//! Spawn command line
//!
//! A spawned host receives everything it needs on its command line:
//!
//! ```text
//! -l locator -c class -C callsign -r connector -i interface -x exchange
//! [-V version] [-u user] [-g group] [-p persistent] [-s system] [-d data]
//! [-a app] [-v volatile] [-m proxystubs] [-P postmortem] [-t threads]
//! [-e logging]
//! ```
//!
//! The host side parses the same flags with [`HostArgs`](crate::host::HostArgs).

use crate::transport::Endpoint;
use crate::types::{ConnectionId, InterfaceId};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// What to start and how to configure it
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Host executable
    pub binary: PathBuf,
    /// Library or module holding the class
    pub locator: String,
    pub class_name: String,
    pub callsign: String,
    /// Interface the root object is announced as
    pub interface: InterfaceId,
    pub version: Option<u32>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub persistent_path: Option<PathBuf>,
    pub system_path: Option<PathBuf>,
    pub data_path: Option<PathBuf>,
    pub app_path: Option<PathBuf>,
    pub volatile_path: Option<PathBuf>,
    pub proxy_stub_path: Option<PathBuf>,
    pub post_mortem_path: Option<PathBuf>,
    pub threads: Option<usize>,
    /// Logging bitmask handed to the host
    pub logging: Option<u32>,
    pub environment: Vec<(String, String)>,
}

impl LaunchOptions {
    pub fn new(binary: impl Into<PathBuf>, class_name: impl Into<String>, interface: InterfaceId) -> Self {
        let class_name = class_name.into();
        Self {
            binary: binary.into(),
            locator: class_name.clone(),
            callsign: class_name.clone(),
            class_name,
            interface,
            ..Default::default()
        }
    }

    pub fn with_locator(mut self, locator: impl Into<String>) -> Self {
        self.locator = locator.into();
        self
    }

    pub fn with_callsign(mut self, callsign: impl Into<String>) -> Self {
        self.callsign = callsign.into();
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_identity(mut self, user: impl Into<String>, group: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.group = Some(group.into());
        self
    }

    pub fn with_data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = Some(path.into());
        self
    }

    pub fn with_volatile_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.volatile_path = Some(path.into());
        self
    }

    pub fn with_proxy_stub_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.proxy_stub_path = Some(path.into());
        self
    }

    pub fn with_post_mortem_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.post_mortem_path = Some(path.into());
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn with_logging(mut self, mask: u32) -> Self {
        self.logging = Some(mask);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.push((key.into(), value.into()));
        self
    }

    /// Arguments for the host, without the binary itself
    pub fn command_line(&self, exchange_id: ConnectionId, connector: &Endpoint) -> Vec<String> {
        let mut args = vec![
            "-l".to_string(),
            self.locator.clone(),
            "-c".to_string(),
            self.class_name.clone(),
            "-C".to_string(),
            self.callsign.clone(),
            "-r".to_string(),
            connector.to_string(),
            "-i".to_string(),
            format!("{:#x}", self.interface),
            "-x".to_string(),
            exchange_id.to_string(),
        ];

        fn push(args: &mut Vec<String>, flag: &str, value: Option<String>) {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(value);
            }
        }
        let path = |path: &Option<PathBuf>| path.as_deref().map(|p: &Path| p.display().to_string());

        push(&mut args, "-V", self.version.map(|v| v.to_string()));
        push(&mut args, "-u", self.user.clone());
        push(&mut args, "-g", self.group.clone());
        push(&mut args, "-p", path(&self.persistent_path));
        push(&mut args, "-s", path(&self.system_path));
        push(&mut args, "-d", path(&self.data_path));
        push(&mut args, "-a", path(&self.app_path));
        push(&mut args, "-v", path(&self.volatile_path));
        push(&mut args, "-m", path(&self.proxy_stub_path));
        push(&mut args, "-P", path(&self.post_mortem_path));
        push(&mut args, "-t", self.threads.map(|t| t.to_string()));
        push(&mut args, "-e", self.logging.map(|mask| mask.to_string()));
        args
    }

    /// Ready-to-spawn command for the host
    pub fn command(&self, exchange_id: ConnectionId, connector: &Endpoint) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .args(self.command_line(exchange_id, connector))
            .envs(self.environment.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null());
        command
    }
}
