// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::path::{Path, PathBuf};
use std::str::FromStr;

use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use crate::transport::{Incoming, IncomingConnection, TransportError};
use crate::util::tunnel_stream::WrappedStream;

/// Which side of the tunnel listens for connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardType {
  /// Listen on the local endpoint, dial the remote endpoint through the server
  Local,
  /// Ask the server to listen on the remote endpoint, dial the local endpoint directly
  Remote,
}

impl Default for ForwardType {
  fn default() -> Self {
    ForwardType::Local
  }
}

impl std::fmt::Display for ForwardType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      ForwardType::Local => "local",
      ForwardType::Remote => "remote",
    })
  }
}

/// A TCP `host:port` pair or a local socket path
///
/// Serialized as its display form, so `"localhost:22"`, `"[::1]:22"`, and
/// `"unix:/run/app.sock"` (or any absolute path) are all accepted in config files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Endpoint {
  Tcp { host: String, port: u16 },
  Unix { path: PathBuf },
}

impl Endpoint {
  pub fn tcp(host: impl Into<String>, port: u16) -> Self {
    Endpoint::Tcp {
      host: host.into(),
      port,
    }
  }

  pub fn unix(path: impl Into<PathBuf>) -> Self {
    Endpoint::Unix { path: path.into() }
  }

  /// Network name in the form used by socket APIs and error messages
  pub fn network(&self) -> &'static str {
    match self {
      Endpoint::Tcp { .. } => "tcp",
      Endpoint::Unix { .. } => "unix",
    }
  }

  pub fn host(&self) -> Option<&str> {
    match self {
      Endpoint::Tcp { host, .. } => Some(host),
      Endpoint::Unix { .. } => None,
    }
  }

  pub fn port(&self) -> Option<u16> {
    match self {
      Endpoint::Tcp { port, .. } => Some(*port),
      Endpoint::Unix { .. } => None,
    }
  }

  pub fn path(&self) -> Option<&Path> {
    match self {
      Endpoint::Tcp { .. } => None,
      Endpoint::Unix { path } => Some(path),
    }
  }

  /// Replaces the host of a TCP endpoint; returns false and leaves socket endpoints untouched
  pub fn set_host(&mut self, new_host: impl Into<String>) -> bool {
    match self {
      Endpoint::Tcp { host, .. } => {
        *host = new_host.into();
        true
      }
      Endpoint::Unix { .. } => false,
    }
  }

  /// Replaces the port of a TCP endpoint; returns false and leaves socket endpoints untouched
  pub fn set_port(&mut self, new_port: u16) -> bool {
    match self {
      Endpoint::Tcp { port, .. } => {
        *port = new_port;
        true
      }
      Endpoint::Unix { .. } => false,
    }
  }

  /// Binds a listener on this endpoint and exposes its accepted connections as a stream
  ///
  /// Socket files created for unix endpoints are removed when the stream is dropped.
  pub async fn listen(&self) -> Result<Incoming, std::io::Error> {
    let listener = LocalListener::bind(self).await?;
    Ok(
      futures::stream::unfold(listener, |listener| async move {
        let next = listener.accept().await;
        Some((next, listener))
      })
      .boxed(),
    )
  }

  /// Dials this endpoint directly from the local host
  pub async fn connect(&self) -> Result<WrappedStream, std::io::Error> {
    match self {
      Endpoint::Tcp { host, port } => Ok(TcpStream::connect((host.as_str(), *port)).await?.into()),
      #[cfg(unix)]
      Endpoint::Unix { path } => Ok(UnixStream::connect(path).await?.into()),
      #[cfg(not(unix))]
      Endpoint::Unix { .. } => Err(unix_unsupported()),
    }
  }
}

#[cfg(not(unix))]
fn unix_unsupported() -> std::io::Error {
  std::io::Error::new(
    std::io::ErrorKind::Unsupported,
    "unix sockets are not available on this platform",
  )
}

/// IPv6 literals are bracketed so the port separator stays unambiguous
fn write_host(host: &str, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
  if host.contains(':') && !host.starts_with('[') {
    write!(f, "[{}]", host)
  } else {
    f.write_str(host)
  }
}

impl std::fmt::Display for Endpoint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Endpoint::Tcp { host, port } => {
        write_host(host, f)?;
        write!(f, ":{}", port)
      }
      Endpoint::Unix { path } => write!(f, "{}", path.display()),
    }
  }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum EndpointParseError {
  #[error("Endpoint must not be empty")]
  Empty,
  #[error("TCP endpoints must be written as host:port")]
  MissingPort,
  #[error("Invalid port {0:?}")]
  InvalidPort(String),
}

impl FromStr for Endpoint {
  type Err = EndpointParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if s.is_empty() {
      return Err(EndpointParseError::Empty);
    }
    if let Some(path) = s.strip_prefix("unix:") {
      if path.is_empty() {
        return Err(EndpointParseError::Empty);
      }
      return Ok(Endpoint::unix(path));
    }
    if s.starts_with('/') || s.starts_with('.') {
      return Ok(Endpoint::unix(s));
    }
    let (host, port) = s.rsplit_once(':').ok_or(EndpointParseError::MissingPort)?;
    let port = port
      .parse::<u16>()
      .map_err(|_| EndpointParseError::InvalidPort(port.to_owned()))?;
    let host = host
      .strip_prefix('[')
      .and_then(|h| h.strip_suffix(']'))
      .unwrap_or(host);
    Ok(Endpoint::tcp(host, port))
  }
}

impl TryFrom<String> for Endpoint {
  type Error = EndpointParseError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    value.parse()
  }
}

impl From<Endpoint> for String {
  fn from(endpoint: Endpoint) -> Self {
    match endpoint {
      // Relative socket paths would otherwise read back as host:port pairs
      Endpoint::Unix { path } if !path.starts_with("/") && !path.starts_with(".") => {
        format!("unix:{}", path.display())
      }
      other => other.to_string(),
    }
  }
}

enum LocalListener {
  Tcp(TcpListener),
  #[cfg(unix)]
  Unix(UnixListener, PathBuf),
}

impl LocalListener {
  async fn bind(endpoint: &Endpoint) -> Result<Self, std::io::Error> {
    match endpoint {
      Endpoint::Tcp { host, port } => Ok(LocalListener::Tcp(
        TcpListener::bind((host.as_str(), *port)).await?,
      )),
      #[cfg(unix)]
      Endpoint::Unix { path } => Ok(LocalListener::Unix(UnixListener::bind(path)?, path.clone())),
      #[cfg(not(unix))]
      Endpoint::Unix { .. } => Err(unix_unsupported()),
    }
  }

  async fn accept(&self) -> Result<IncomingConnection, TransportError> {
    match self {
      LocalListener::Tcp(listener) => {
        let (stream, peer) = listener.accept().await?;
        Ok(IncomingConnection::new(stream, peer.to_string()))
      }
      #[cfg(unix)]
      LocalListener::Unix(listener, path) => {
        let (stream, peer) = listener.accept().await?;
        let peer = peer
          .as_pathname()
          .map(|p| p.display().to_string())
          .unwrap_or_else(|| format!("{}#peer", path.display()));
        Ok(IncomingConnection::new(stream, peer))
      }
    }
  }
}

impl Drop for LocalListener {
  fn drop(&mut self) {
    match self {
      LocalListener::Tcp(_) => {}
      #[cfg(unix)]
      LocalListener::Unix(_, path) => {
        if let Err(error) = std::fs::remove_file(path.as_path()) {
          tracing::debug!(?error, path = %path.display(), "Failed to remove socket file");
        }
      }
    }
  }
}
