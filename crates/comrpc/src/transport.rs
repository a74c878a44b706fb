//! Transport layer
//!
//! Channels run over any ordered byte stream. Messages are self-delimiting
//! via the length field of their header. Endpoints are either Unix domain
//! sockets (`unix:/path` or any absolute path) or TCP (`host:port`).

use crate::message::{Envelope, MessageHeader, HEADER_SIZE};
use crate::types::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Maximum message size (1 MiB default)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Any bidirectional stream a channel can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Reads and writes whole messages on a byte stream
pub struct MessageTransport<T> {
    inner: T,
    max_message_size: usize,
    read_buf: BytesMut,
}

impl<T> MessageTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            read_buf: BytesMut::with_capacity(8192),
        }
    }

    pub fn with_max_message_size(mut self, max_size: usize) -> Self {
        self.max_message_size = max_size;
        self
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: AsyncRead + Unpin> MessageTransport<T> {
    /// Read one complete message
    ///
    /// Cancel safe: partially received data stays buffered for the next call.
    pub async fn read_message(&mut self) -> Result<Envelope> {
        let data = self.read_frame().await?;
        Envelope::decode(&data)
    }

    /// Read the raw bytes of one message, header included
    ///
    /// Only the header is validated, so a caller can still answer a
    /// message whose body fails to decode.
    pub async fn read_frame(&mut self) -> Result<Bytes> {
        while self.read_buf.len() < HEADER_SIZE {
            if self.fill_buf().await? == 0 {
                if self.read_buf.is_empty() {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed",
                    )));
                }
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "incomplete message header",
                )));
            }
        }

        let header = MessageHeader::decode(&self.read_buf)?;
        let length = header.length as usize;
        if length > self.max_message_size {
            return Err(Error::MessageTooLarge {
                size: length,
                max: self.max_message_size,
            });
        }

        while self.read_buf.len() < length {
            if self.fill_buf().await? == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "incomplete message: expected {} bytes, got {}",
                        length,
                        self.read_buf.len()
                    ),
                )));
            }
        }

        Ok(self.read_buf.split_to(length).freeze())
    }

    async fn fill_buf(&mut self) -> Result<usize> {
        if self.read_buf.capacity() - self.read_buf.len() < 4096 {
            self.read_buf.reserve(8192);
        }
        Ok(self.inner.read_buf(&mut self.read_buf).await?)
    }
}

impl<T: AsyncWrite + Unpin> MessageTransport<T> {
    pub async fn write_message(&mut self, envelope: &Envelope) -> Result<()> {
        let data = envelope.encode()?;
        if data.len() > self.max_message_size {
            return Err(Error::MessageTooLarge {
                size: data.len(),
                max: self.max_message_size,
            });
        }
        self.inner.write_all(&data).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Where a communicator listens and where clients connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl Endpoint {
    pub async fn connect(&self) -> Result<BoxedStream> {
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Box::new(stream))
            }
            #[cfg(not(unix))]
            Endpoint::Unix(path) => Err(Error::InvalidEndpoint(format!(
                "unix sockets unsupported: {}",
                path.display()
            ))),
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(Error::InvalidEndpoint(s.to_string()));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if s.starts_with('/') {
            return Ok(Endpoint::Unix(PathBuf::from(s)));
        }
        s.parse::<SocketAddr>()
            .map(Endpoint::Tcp)
            .map_err(|_| Error::InvalidEndpoint(s.to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "{}", addr),
        }
    }
}

/// Bound listening socket
pub enum Listener {
    #[cfg(unix)]
    Unix(tokio::net::UnixListener, PathBuf),
    Tcp(TcpListener),
}

impl Listener {
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                if path.exists() {
                    debug!("Removing stale socket {}", path.display());
                    std::fs::remove_file(path)?;
                }
                let listener = tokio::net::UnixListener::bind(path)?;
                Ok(Listener::Unix(listener, path.clone()))
            }
            #[cfg(not(unix))]
            Endpoint::Unix(path) => Err(Error::InvalidEndpoint(format!(
                "unix sockets unsupported: {}",
                path.display()
            ))),
            Endpoint::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr).await?)),
        }
    }

    /// Actual bound endpoint (resolves TCP port 0)
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        match self {
            #[cfg(unix)]
            Listener::Unix(_, path) => Ok(Endpoint::Unix(path.clone())),
            Listener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?)),
        }
    }

    pub async fn accept(&self) -> Result<(BoxedStream, String)> {
        match self {
            #[cfg(unix)]
            Listener::Unix(listener, path) => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), path.display().to_string()))
            }
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Box::new(stream), peer.to_string()))
            }
        }
    }
}

#[cfg(unix)]
impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}
