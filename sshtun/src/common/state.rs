// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use serde::{Deserializer, Serializer};

use crate::tunnel::ConnectionError;

/// Human-readable tunnel identity carried by every notification
#[derive(Clone, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct TunnelName(Arc<String>);

impl serde::Serialize for TunnelName {
  fn serialize<S>(&self, serializer: S) -> Result<<S as Serializer>::Ok, <S as Serializer>::Error>
  where
    S: Serializer,
  {
    serializer.serialize_str(&self.0)
  }
}

impl<'de> serde::de::Deserialize<'de> for TunnelName {
  fn deserialize<D>(deserializer: D) -> Result<Self, <D as Deserializer<'de>>::Error>
  where
    D: Deserializer<'de>,
  {
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    Ok(TunnelName::new(s))
  }
}

impl TunnelName {
  pub fn new<T: std::convert::Into<String>>(t: T) -> TunnelName {
    TunnelName(t.into().into())
  }

  pub fn raw(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Debug for TunnelName {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("TunnelName").field(&self.0).finish()
  }
}

impl std::fmt::Display for TunnelName {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

/// Lifecycle of the tunnel as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
  Stopped,
  Starting,
  Started,
}

impl Default for ConnState {
  fn default() -> Self {
    ConnState::Stopped
  }
}

impl std::fmt::Display for ConnState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      ConnState::Stopped => "stopped",
      ConnState::Starting => "starting",
      ConnState::Started => "started",
    })
  }
}

/// Identifies one forwarded connection across its notifications
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
  pub fn new() -> Self {
    Self(uuid::Uuid::new_v4())
  }

  pub fn inner(&self) -> uuid::Uuid {
    self.0
  }
}

impl Default for ConnectionId {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for ConnectionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "ConnectionId({})", self.0)
  }
}

impl std::fmt::Display for ConnectionId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    std::fmt::Display::fmt(&self.0, f)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
  Started,
  Stopped,
  Error,
}

/// Snapshot of one forwarded connection, delivered when it starts and when it ends
#[derive(Debug, Clone)]
pub struct TunneledConnState {
  pub id: ConnectionId,
  pub source: String,
  pub destination: String,
  pub state: ConnectionState,
  pub error: Option<Arc<ConnectionError>>,
}

impl TunneledConnState {
  pub fn is_error(&self) -> bool {
    self.state == ConnectionState::Error
  }
}

impl std::fmt::Display for TunneledConnState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match (&self.state, &self.error) {
      (ConnectionState::Started, _) => write!(f, "{} -> {} started", self.source, self.destination),
      (ConnectionState::Stopped, _) => write!(f, "{} -> {} stopped", self.source, self.destination),
      (ConnectionState::Error, Some(e)) => {
        write!(f, "{} -> {} failed: {}", self.source, self.destination, e)
      }
      (ConnectionState::Error, None) => write!(f, "{} -> {} failed", self.source, self.destination),
    }
  }
}

/// Receives tunnel and connection state transitions
///
/// Calls are made synchronously on the task performing the transition, so
/// implementations should hand heavy work off elsewhere.
pub trait TunnelObserver: Send + Sync {
  fn tunnel_state_changed(&self, tunnel: &TunnelName, state: ConnState);

  fn connection_state_changed(&self, tunnel: &TunnelName, state: &TunneledConnState);
}

pub type ConnStateCallback = Arc<dyn Fn(&TunnelName, ConnState) + Send + Sync>;
pub type TunneledConnStateCallback = Arc<dyn Fn(&TunnelName, &TunneledConnState) + Send + Sync>;

/// Fans notifications out to the closures and the observer registered on a tunnel
#[derive(Clone, Default)]
pub(crate) struct Notifier {
  pub conn_state: Option<ConnStateCallback>,
  pub tunneled_conn_state: Option<TunneledConnStateCallback>,
  pub observer: Option<Arc<dyn TunnelObserver>>,
}

impl Notifier {
  pub fn tunnel_state(&self, tunnel: &TunnelName, state: ConnState) {
    tracing::debug!(tunnel = %tunnel, %state, "Tunnel state changed");
    if let Some(callback) = &self.conn_state {
      callback(tunnel, state);
    }
    if let Some(observer) = &self.observer {
      observer.tunnel_state_changed(tunnel, state);
    }
  }

  pub fn connection_state(&self, tunnel: &TunnelName, state: &TunneledConnState) {
    tracing::trace!(tunnel = %tunnel, id = %state.id, ?state.state, "Connection state changed");
    if let Some(callback) = &self.tunneled_conn_state {
      callback(tunnel, state);
    }
    if let Some(observer) = &self.observer {
      observer.connection_state_changed(tunnel, state);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::{ConnState, ConnectionId, ConnectionState, Notifier, TunnelName, TunneledConnState};
  use std::sync::{Arc, Mutex};

  #[test]
  fn tunnel_names_serialize_as_strings() {
    let name = TunnelName::new("db");
    assert_eq!(serde_json::to_string(&name).unwrap(), "\"db\"");
    let back: TunnelName = serde_json::from_str("\"db\"").unwrap();
    assert_eq!(back, name);
    assert_eq!(back.raw(), "db");
  }

  #[test]
  fn connection_ids_are_unique() {
    assert_ne!(ConnectionId::new(), ConnectionId::new());
  }

  #[test]
  fn notifier_invokes_callbacks() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let notifier = Notifier {
      conn_state: Some({
        let seen = seen.clone();
        Arc::new(move |name: &TunnelName, state: ConnState| {
          seen.lock().unwrap().push(format!("{}:{}", name, state))
        })
      }),
      tunneled_conn_state: Some({
        let seen = seen.clone();
        Arc::new(move |_: &TunnelName, state: &TunneledConnState| {
          seen.lock().unwrap().push(state.to_string())
        })
      }),
      observer: None,
    };
    let name = TunnelName::new("t");
    notifier.tunnel_state(&name, ConnState::Starting);
    notifier.connection_state(
      &name,
      &TunneledConnState {
        id: ConnectionId::new(),
        source: "a".into(),
        destination: "b".into(),
        state: ConnectionState::Started,
        error: None,
      },
    );
    assert_eq!(
      *seen.lock().unwrap(),
      vec!["t:starting".to_string(), "a -> b started".to_string()]
    );
  }
}
