// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The secure-transport seam
//!
//! A [Transport] opens authenticated sessions to a server. Sessions either
//! open channels to destinations on the far side or ask the server to listen
//! on an address and hand back the connections it accepts.
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::common::authentication::{AlgorithmPreferences, Credentials};
use crate::common::endpoint::Endpoint;
use crate::util::tunnel_stream::WrappedStream;

pub mod memory;
#[cfg(feature = "ssh")]
pub mod ssh;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
  #[error("I/O failure: {0}")]
  Io(#[from] std::io::Error),
  #[error("Timed out after {0:?}")]
  TimedOut(Duration),
  #[error("Authentication failed: {0}")]
  Authentication(String),
  #[error("Request rejected: {0}")]
  Rejected(String),
  #[error("Session closed")]
  Closed,
  #[error("Protocol error: {0}")]
  Protocol(String),
}

/// Everything a transport needs to open and authenticate a session
#[derive(Debug, Clone)]
pub struct TransportConfig {
  pub user: String,
  pub credentials: Credentials,
  pub algorithms: AlgorithmPreferences,
  pub timeout: Duration,
}

/// A connection accepted by a listener, local or remote
#[derive(Debug)]
pub struct IncomingConnection {
  pub stream: WrappedStream,
  /// Address of the connecting peer, as reported by the listener
  pub peer: String,
}

impl IncomingConnection {
  pub fn new(stream: impl Into<WrappedStream>, peer: impl Into<String>) -> Self {
    Self {
      stream: stream.into(),
      peer: peer.into(),
    }
  }
}

/// Connections accepted by a listener; the listener closes when the stream is dropped
pub type Incoming = BoxStream<'static, Result<IncomingConnection, TransportError>>;

pub trait Transport: Send + Sync {
  /// Opens and authenticates a session to `server`
  fn dial<'a>(
    &'a self,
    server: &'a Endpoint,
    config: &'a TransportConfig,
  ) -> BoxFuture<'a, Result<Box<dyn TransportSession>, TransportError>>;
}

pub trait TransportSession: Send + Sync {
  /// Asks the server to listen on `address`, yielding the connections it forwards back
  fn listen<'a>(&'a self, address: &'a Endpoint) -> BoxFuture<'a, Result<Incoming, TransportError>>;

  /// Opens a channel to `address` as seen from the server
  fn dial_channel<'a>(
    &'a self,
    address: &'a Endpoint,
  ) -> BoxFuture<'a, Result<WrappedStream, TransportError>>;

  /// Ends the session; channels still open on it are torn down
  fn close<'a>(&'a self) -> BoxFuture<'a, ()>;
}

pub type SharedSession = Arc<dyn TransportSession>;

/// Dials `server`, giving up after `timeout`
pub(crate) async fn dial_with_timeout(
  transport: &dyn Transport,
  server: &Endpoint,
  config: &TransportConfig,
  timeout: Duration,
) -> Result<SharedSession, TransportError> {
  match tokio::time::timeout(timeout, transport.dial(server, config)).await {
    Ok(Ok(session)) => Ok(Arc::from(session)),
    Ok(Err(e)) => Err(e),
    Err(_elapsed) => Err(TransportError::TimedOut(timeout)),
  }
}
