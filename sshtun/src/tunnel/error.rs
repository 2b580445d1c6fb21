// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::path::PathBuf;
use std::sync::Arc;

use crate::common::endpoint::ForwardType;
use crate::transport::TransportError;

/// Failures that end a tunnel run or prevent it from starting
#[derive(thiserror::Error, Debug)]
pub enum TunnelError {
  #[error("Tunnel is already started")]
  AlreadyStarted,
  #[error("{side} transport configuration failed: {source}")]
  Config {
    side: ForwardType,
    #[source]
    source: ConfigError,
  },
  #[error("{side} dial {network} to {address} failed: {source}")]
  Dial {
    side: ForwardType,
    network: &'static str,
    address: String,
    #[source]
    source: TransportError,
  },
  #[error("{side} listen {network} on {address} failed: {source}")]
  Listen {
    side: ForwardType,
    network: &'static str,
    address: String,
    #[source]
    source: TransportError,
  },
  #[error("{side} accept {network} on {address} failed: {source}")]
  Accept {
    side: ForwardType,
    network: &'static str,
    address: String,
    #[source]
    source: TransportError,
  },
}

/// Failures of a single forwarded connection, reported only through notifications
#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
  #[error("Session dial failed: {0}")]
  Dial(#[source] TransportError),
  #[error("Channel open failed: {0}")]
  Channel(#[source] TransportError),
  #[error("Connect failed: {0}")]
  Connect(#[source] std::io::Error),
  #[error("Forwarding failed: {0}")]
  Forward(#[source] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
  #[error("Failed to read key file {}: {source}", path.display())]
  KeyFile {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Failed to read key material: {0}")]
  KeyReader(#[source] Arc<std::io::Error>),
  #[error("No key files found in the default locations")]
  NoDefaultKeys,
  #[error("No default key files found and no SSH agent is available")]
  NoAuthenticationAvailable,
  #[error("SSH agent requested but {} is not set", crate::common::authentication::AGENT_SOCKET_ENV)]
  AgentUnavailable,
  #[error("No transport is configured for this tunnel")]
  NoTransport,
  #[error("Environment variable {0} is not set")]
  MissingEnvironment(String),
  #[error("Credential resolution was aborted")]
  Aborted,
}
