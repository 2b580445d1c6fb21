// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! SSH sessions backed by russh
//!
//! Host keys are accepted without verification.
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use russh::client::{self, AuthResult, Handle, Msg};
use russh::keys::{decode_secret_key, PrivateKeyWithHashAlg};
use russh::Channel;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{Incoming, IncomingConnection, Transport, TransportConfig, TransportError, TransportSession};
use crate::common::authentication::{AlgorithmPreferences, Credentials, KeyMaterial};
use crate::common::endpoint::Endpoint;
use crate::util::tunnel_stream::WrappedStream;

impl From<russh::Error> for TransportError {
  fn from(e: russh::Error) -> Self {
    match e {
      russh::Error::IO(e) => TransportError::Io(e),
      russh::Error::RequestDenied => TransportError::Rejected("request denied by server".into()),
      russh::Error::ChannelOpenFailure(reason) => {
        TransportError::Rejected(format!("channel open failed: {reason:?}"))
      }
      russh::Error::Disconnect => TransportError::Closed,
      other => TransportError::Protocol(other.to_string()),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RouteKey {
  Port(u32),
  Socket(String),
}

type RouteSender = mpsc::UnboundedSender<Result<IncomingConnection, TransportError>>;

/// Remote listeners waiting for forwarded channels, keyed by what the server reports
#[derive(Default)]
struct Routes {
  senders: Mutex<HashMap<RouteKey, RouteSender>>,
}

impl Routes {
  fn register(&self, key: RouteKey) -> UnboundedReceiverStream<Result<IncomingConnection, TransportError>> {
    let (sender, receiver) = mpsc::unbounded_channel();
    self
      .senders
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(key, sender);
    UnboundedReceiverStream::new(receiver)
  }

  /// Hands a forwarded channel to its listener, returning it when nobody is listening
  fn deliver(&self, key: &RouteKey, channel: Channel<Msg>, peer: String) -> Option<Channel<Msg>> {
    let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(sender) = senders.get(key) else {
      return Some(channel);
    };
    let stream = WrappedStream::boxed(channel.into_stream());
    if sender.send(Ok(IncomingConnection::new(stream, peer))).is_err() {
      senders.remove(key);
    }
    None
  }

  fn close_all(&self) {
    let drained: Vec<_> = self
      .senders
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .drain()
      .collect();
    for (_, sender) in drained {
      let _ = sender.send(Err(TransportError::Closed));
    }
  }
}

struct ClientHandler {
  routes: Arc<Routes>,
}

impl ClientHandler {
  async fn route(&self, key: RouteKey, channel: Channel<Msg>, peer: String) {
    if let Some(unclaimed) = self.routes.deliver(&key, channel, peer) {
      tracing::debug!(route = ?key, "Rejecting forwarded channel with no listener");
      let _ = unclaimed.close().await;
    }
  }
}

impl client::Handler for ClientHandler {
  type Error = russh::Error;

  async fn check_server_key(
    &mut self,
    _server_public_key: &russh::keys::PublicKey,
  ) -> Result<bool, Self::Error> {
    Ok(true)
  }

  async fn server_channel_open_forwarded_tcpip(
    &mut self,
    channel: Channel<Msg>,
    _connected_address: &str,
    connected_port: u32,
    originator_address: &str,
    originator_port: u32,
    _session: &mut client::Session,
  ) -> Result<(), Self::Error> {
    let peer = format!("{originator_address}:{originator_port}");
    self.route(RouteKey::Port(connected_port), channel, peer).await;
    Ok(())
  }

  async fn server_channel_open_forwarded_streamlocal(
    &mut self,
    channel: Channel<Msg>,
    socket_path: &str,
    _session: &mut client::Session,
  ) -> Result<(), Self::Error> {
    self
      .route(RouteKey::Socket(socket_path.to_string()), channel, socket_path.to_string())
      .await;
    Ok(())
  }
}

impl Drop for ClientHandler {
  fn drop(&mut self) {
    // The handler lives exactly as long as the session's connection
    self.routes.close_all();
  }
}

fn preferred(algorithms: &AlgorithmPreferences) -> Result<russh::Preferred, TransportError> {
  fn names<N: for<'a> TryFrom<&'a str>>(kind: &str, requested: &[String]) -> Result<Vec<N>, TransportError> {
    requested
      .iter()
      .map(|name| {
        N::try_from(name.as_str())
          .map_err(|_| TransportError::Protocol(format!("Unsupported {kind} algorithm {name:?}")))
      })
      .collect()
  }

  let mut preferred = russh::Preferred::default();
  if !algorithms.key_exchanges.is_empty() {
    preferred.kex = Cow::Owned(names::<russh::kex::Name>("key exchange", &algorithms.key_exchanges)?);
  }
  if !algorithms.ciphers.is_empty() {
    preferred.cipher = Cow::Owned(names::<russh::cipher::Name>("cipher", &algorithms.ciphers)?);
  }
  if !algorithms.macs.is_empty() {
    preferred.mac = Cow::Owned(names::<russh::mac::Name>("MAC", &algorithms.macs)?);
  }
  Ok(preferred)
}

fn client_config(algorithms: &AlgorithmPreferences) -> Result<client::Config, TransportError> {
  Ok(client::Config {
    inactivity_timeout: None,
    preferred: preferred(algorithms)?,
    ..Default::default()
  })
}

/// Dials servers over TCP, or over a local socket for `unix:` server endpoints
#[derive(Debug, Default, Clone)]
pub struct SshTransport;

impl SshTransport {
  async fn connect(
    server: &Endpoint,
    config: Arc<client::Config>,
    handler: ClientHandler,
  ) -> Result<Handle<ClientHandler>, TransportError> {
    match server {
      Endpoint::Tcp { host, port } => {
        let stream = tokio::net::TcpStream::connect((host.as_str(), *port)).await?;
        stream.set_nodelay(true)?;
        Ok(client::connect_stream(config, stream, handler).await?)
      }
      #[cfg(unix)]
      Endpoint::Unix { path } => {
        let stream = tokio::net::UnixStream::connect(path).await?;
        Ok(client::connect_stream(config, stream, handler).await?)
      }
      #[cfg(not(unix))]
      Endpoint::Unix { .. } => Err(TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "unix sockets are unavailable on this platform",
      ))),
    }
  }
}

impl Transport for SshTransport {
  fn dial<'a>(
    &'a self,
    server: &'a Endpoint,
    config: &'a TransportConfig,
  ) -> BoxFuture<'a, Result<Box<dyn TransportSession>, TransportError>> {
    async move {
      let client_config = Arc::new(client_config(&config.algorithms)?);
      let routes = Arc::new(Routes::default());
      let handler = ClientHandler {
        routes: routes.clone(),
      };
      let mut handle = Self::connect(server, client_config, handler).await?;
      tracing::debug!(%server, user = %config.user, "SSH handshake complete");

      if let Err(e) = authenticate(&mut handle, &config.user, &config.credentials).await {
        let _ = handle
          .disconnect(russh::Disconnect::ByApplication, "", "en")
          .await;
        return Err(e);
      }
      tracing::debug!(%server, user = %config.user, "SSH authentication succeeded");

      let session: Box<dyn TransportSession> = Box::new(SshSession {
        handle: tokio::sync::Mutex::new(handle),
        routes,
      });
      Ok(session)
    }
    .boxed()
  }
}

async fn authenticate(
  handle: &mut Handle<ClientHandler>,
  user: &str,
  credentials: &Credentials,
) -> Result<(), TransportError> {
  let accepted = match credentials {
    Credentials::Password(password) => handle.authenticate_password(user, password).await?.success(),
    Credentials::Agent => authenticate_with_agent(handle, user).await?,
    Credentials::Keys {
      keys,
      agent_fallback,
    } => {
      let mut accepted = false;
      for key in keys {
        if authenticate_with_key(handle, user, key).await? {
          accepted = true;
          break;
        }
      }
      if !accepted && *agent_fallback {
        accepted = authenticate_with_agent(handle, user).await?;
      }
      accepted
    }
  };
  if accepted {
    Ok(())
  } else {
    Err(TransportError::Authentication(format!(
      "server rejected every credential offered for {user:?}"
    )))
  }
}

async fn authenticate_with_key(
  handle: &mut Handle<ClientHandler>,
  user: &str,
  key: &KeyMaterial,
) -> Result<bool, TransportError> {
  let private_key = decode_secret_key(&key.pem, key.passphrase.as_deref()).map_err(|e| {
    TransportError::Authentication(format!("unable to decode key from {}: {e}", key.origin))
  })?;
  let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
  let result = handle
    .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(private_key), hash_alg))
    .await?;
  if let AuthResult::Failure {
    partial_success, ..
  } = &result
  {
    tracing::debug!(origin = %key.origin, partial_success, "Server declined key");
  }
  Ok(result.success())
}

#[cfg(unix)]
async fn authenticate_with_agent(handle: &mut Handle<ClientHandler>, user: &str) -> Result<bool, TransportError> {
  use russh::keys::agent::client::AgentClient;

  let mut agent = AgentClient::connect_env()
    .await
    .map_err(|e| TransportError::Authentication(format!("unable to reach the SSH agent: {e}")))?;
  let identities = agent
    .request_identities()
    .await
    .map_err(|e| TransportError::Authentication(format!("SSH agent listing failed: {e}")))?;
  let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
  for identity in identities {
    let result = handle
      .authenticate_publickey_with(user, identity, hash_alg, &mut agent)
      .await
      .map_err(|e| TransportError::Authentication(format!("SSH agent signing failed: {e}")))?;
    if result.success() {
      return Ok(true);
    }
  }
  Ok(false)
}

#[cfg(not(unix))]
async fn authenticate_with_agent(_handle: &mut Handle<ClientHandler>, _user: &str) -> Result<bool, TransportError> {
  Err(TransportError::Authentication(
    "SSH agent authentication is unavailable on this platform".into(),
  ))
}

struct SshSession {
  handle: tokio::sync::Mutex<Handle<ClientHandler>>,
  routes: Arc<Routes>,
}

impl TransportSession for SshSession {
  fn listen<'a>(&'a self, address: &'a Endpoint) -> BoxFuture<'a, Result<Incoming, TransportError>> {
    async move {
      let mut handle = self.handle.lock().await;
      let key = match address {
        Endpoint::Tcp { host, port } => {
          let assigned = handle.tcpip_forward(host.as_str(), u32::from(*port)).await?;
          RouteKey::Port(if *port == 0 { assigned } else { u32::from(*port) })
        }
        Endpoint::Unix { path } => {
          let path = path.to_string_lossy().into_owned();
          handle.streamlocal_forward(path.as_str()).await?;
          RouteKey::Socket(path)
        }
      };
      tracing::debug!(%address, route = ?key, "Remote listener established");
      let incoming: Incoming = self.routes.register(key).boxed();
      Ok(incoming)
    }
    .boxed()
  }

  fn dial_channel<'a>(&'a self, address: &'a Endpoint) -> BoxFuture<'a, Result<WrappedStream, TransportError>> {
    async move {
      let handle = self.handle.lock().await;
      let channel = match address {
        Endpoint::Tcp { host, port } => {
          handle
            .channel_open_direct_tcpip(host.as_str(), u32::from(*port), "127.0.0.1", 0)
            .await?
        }
        Endpoint::Unix { path } => {
          handle
            .channel_open_direct_streamlocal(path.to_string_lossy().as_ref())
            .await?
        }
      };
      Ok(WrappedStream::boxed(channel.into_stream()))
    }
    .boxed()
  }

  fn close<'a>(&'a self) -> BoxFuture<'a, ()> {
    async move {
      let handle = self.handle.lock().await;
      if let Err(e) = handle
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await
      {
        tracing::trace!(error = %e, "Disconnect on an already-closed session");
      }
      self.routes.close_all();
    }
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_preferences_keep_defaults() {
    let preferred = preferred(&AlgorithmPreferences::default()).unwrap();
    let defaults = russh::Preferred::default();
    assert_eq!(preferred.kex.len(), defaults.kex.len());
    assert_eq!(preferred.cipher.len(), defaults.cipher.len());
    assert_eq!(preferred.mac.len(), defaults.mac.len());
  }

  #[test]
  fn client_configs_never_time_out_idle_sessions() {
    let config = client_config(&AlgorithmPreferences::default()).unwrap();
    assert!(config.inactivity_timeout.is_none());
    assert_eq!(config.preferred.cipher.len(), russh::Preferred::default().cipher.len());
  }

  #[test]
  fn unknown_algorithms_are_rejected() {
    let algorithms = AlgorithmPreferences {
      ciphers: vec!["rot13".into()],
      ..Default::default()
    };
    match preferred(&algorithms) {
      Err(TransportError::Protocol(message)) => assert!(message.contains("rot13")),
      other => panic!("expected a protocol error, got {:?}", other.map(|_| ())),
    }
  }

  #[test]
  fn denied_requests_map_to_rejections() {
    assert!(matches!(
      TransportError::from(russh::Error::RequestDenied),
      TransportError::Rejected(_)
    ));
  }

  #[tokio::test]
  async fn closing_routes_fails_waiting_listeners() {
    let routes = Routes::default();
    let mut incoming = routes.register(RouteKey::Port(2222));
    routes.close_all();
    assert!(matches!(incoming.next().await, Some(Err(TransportError::Closed))));
    assert!(incoming.next().await.is_none());
  }
}
