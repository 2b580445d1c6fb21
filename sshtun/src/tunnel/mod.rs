// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::common::authentication::{AlgorithmPreferences, AuthMethod, KeyReader};
use crate::common::endpoint::{Endpoint, ForwardType};
use crate::common::state::{ConnState, Notifier, TunnelName, TunnelObserver, TunneledConnState};
use crate::transport::{
  dial_with_timeout, Incoming, SharedSession, Transport, TransportConfig, TransportError,
};
use crate::util::cancellation::{cancellable, CancellationListener};
use crate::util::dropkick::Dropkick;

mod acceptor;
mod error;
mod forwarder;
mod pool;

pub use error::{ConfigError, ConnectionError, TunnelError};
pub(crate) use pool::ClientPool;

pub const DEFAULT_SERVER_PORT: u16 = 22;
pub const DEFAULT_USER: &str = "root";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_HOST: &str = "localhost";

/// Immutable view of a tunnel's configuration shared by the tasks of one run
pub(crate) struct RunContext {
  pub name: TunnelName,
  pub forward_type: ForwardType,
  pub dial_endpoint: Endpoint,
  pub timeout: Duration,
  pub notifier: Notifier,
  /// Present only for local forwards
  pub pool: Option<ClientPool>,
}

#[derive(Default)]
struct RunState {
  started: bool,
  cancel: Option<CancellationToken>,
}

struct ListenSide {
  incoming: Incoming,
  /// The session carrying a remote listener, closed once the run ends
  session: Option<SharedSession>,
}

/// A single port forward through a secure transport
///
/// Configure with the setters, then drive with [Tunnel::start], which runs
/// until [Tunnel::stop] is called, the shutdown listener fires, or the
/// listener fails. A stopped tunnel can be started again.
pub struct Tunnel {
  name: TunnelName,
  forward_type: ForwardType,
  local: Endpoint,
  remote: Endpoint,
  server: Endpoint,
  user: String,
  auth: AuthMethod,
  algorithms: AlgorithmPreferences,
  timeout: Duration,
  notifier: Notifier,
  transport: Option<Arc<dyn Transport>>,
  run_state: Mutex<RunState>,
}

impl Tunnel {
  fn with_endpoints(
    forward_type: ForwardType,
    local: Endpoint,
    server_host: String,
    remote: Endpoint,
  ) -> Self {
    Self {
      name: TunnelName::default(),
      forward_type,
      local,
      remote,
      server: Endpoint::tcp(server_host, DEFAULT_SERVER_PORT),
      user: String::from(DEFAULT_USER),
      auth: AuthMethod::Auto,
      algorithms: AlgorithmPreferences::default(),
      timeout: DEFAULT_TIMEOUT,
      notifier: Notifier::default(),
      transport: default_transport(),
      run_state: Mutex::new(RunState::default()),
    }
  }

  /// Forwards `localhost:local_port` to `localhost:remote_port` as seen from `server`
  pub fn new(local_port: u16, server: impl Into<String>, remote_port: u16) -> Self {
    Self::with_endpoints(
      ForwardType::Local,
      Endpoint::tcp(DEFAULT_HOST, local_port),
      server.into(),
      Endpoint::tcp(DEFAULT_HOST, remote_port),
    )
  }

  /// Has `server` listen on `localhost:remote_port` and forwards back to `localhost:local_port`
  pub fn new_remote(local_port: u16, server: impl Into<String>, remote_port: u16) -> Self {
    Self::with_endpoints(
      ForwardType::Remote,
      Endpoint::tcp(DEFAULT_HOST, local_port),
      server.into(),
      Endpoint::tcp(DEFAULT_HOST, remote_port),
    )
  }

  /// Forwards a local socket to a socket on `server`
  pub fn new_unix(
    local_socket: impl Into<PathBuf>,
    server: impl Into<String>,
    remote_socket: impl Into<PathBuf>,
  ) -> Self {
    Self::with_endpoints(
      ForwardType::Local,
      Endpoint::unix(local_socket),
      server.into(),
      Endpoint::unix(remote_socket),
    )
  }

  /// Has `server` listen on a socket and forwards back to a local socket
  pub fn new_unix_remote(
    local_socket: impl Into<PathBuf>,
    server: impl Into<String>,
    remote_socket: impl Into<PathBuf>,
  ) -> Self {
    Self::with_endpoints(
      ForwardType::Remote,
      Endpoint::unix(local_socket),
      server.into(),
      Endpoint::unix(remote_socket),
    )
  }

  pub fn set_port(&mut self, port: u16) {
    if !self.server.set_port(port) {
      tracing::warn!(server = %self.server, "Ignoring port for a socket server endpoint");
    }
  }

  pub fn set_key_exchanges<I, S>(&mut self, key_exchanges: I)
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.algorithms.key_exchanges = key_exchanges.into_iter().map(Into::into).collect();
  }

  pub fn set_ciphers<I, S>(&mut self, ciphers: I)
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.algorithms.ciphers = ciphers.into_iter().map(Into::into).collect();
  }

  pub fn set_macs<I, S>(&mut self, macs: I)
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.algorithms.macs = macs.into_iter().map(Into::into).collect();
  }

  pub fn set_algorithms(&mut self, algorithms: AlgorithmPreferences) {
    self.algorithms = algorithms;
  }

  pub fn set_user(&mut self, user: impl Into<String>) {
    self.user = user.into();
  }

  /// Authenticates with an unencrypted key file; an empty path probes the default key files
  pub fn set_key_file(&mut self, path: impl Into<PathBuf>) {
    self.auth = AuthMethod::KeyFile {
      path: non_empty_path(path.into()),
      passphrase: None,
    };
  }

  /// Authenticates with a passphrase-protected key file; an empty path probes the default key files
  pub fn set_encrypted_key_file(&mut self, path: impl Into<PathBuf>, passphrase: impl Into<String>) {
    self.auth = AuthMethod::KeyFile {
      path: non_empty_path(path.into()),
      passphrase: Some(passphrase.into()),
    };
  }

  pub fn set_key_reader<R: Read + Send + 'static>(&mut self, reader: R) {
    self.auth = AuthMethod::KeyReader {
      reader: KeyReader::new(reader),
      passphrase: None,
    };
  }

  pub fn set_encrypted_key_reader<R: Read + Send + 'static>(
    &mut self,
    reader: R,
    passphrase: impl Into<String>,
  ) {
    self.auth = AuthMethod::KeyReader {
      reader: KeyReader::new(reader),
      passphrase: Some(passphrase.into()),
    };
  }

  pub fn set_ssh_agent(&mut self) {
    self.auth = AuthMethod::Agent;
  }

  pub fn set_password(&mut self, password: impl Into<String>) {
    self.auth = AuthMethod::Password(password.into());
  }

  pub fn set_auth(&mut self, auth: AuthMethod) {
    self.auth = auth;
  }

  pub fn set_forward_type(&mut self, forward_type: ForwardType) {
    self.forward_type = forward_type;
  }

  pub fn set_local_host(&mut self, host: impl Into<String>) {
    if !self.local.set_host(host) {
      tracing::warn!(local = %self.local, "Ignoring host for a socket endpoint");
    }
  }

  pub fn set_remote_host(&mut self, host: impl Into<String>) {
    if !self.remote.set_host(host) {
      tracing::warn!(remote = %self.remote, "Ignoring host for a socket endpoint");
    }
  }

  pub fn set_local_endpoint(&mut self, endpoint: Endpoint) {
    self.local = endpoint;
  }

  pub fn set_remote_endpoint(&mut self, endpoint: Endpoint) {
    self.remote = endpoint;
  }

  pub fn set_server_endpoint(&mut self, endpoint: Endpoint) {
    self.server = endpoint;
  }

  /// Bounds the server dial and every outbound connection attempt
  pub fn set_timeout(&mut self, timeout: Duration) {
    self.timeout = timeout;
  }

  pub fn set_conn_state<F>(&mut self, callback: F)
  where
    F: Fn(&TunnelName, ConnState) + Send + Sync + 'static,
  {
    self.notifier.conn_state = Some(Arc::new(callback));
  }

  pub fn set_tunneled_conn_state<F>(&mut self, callback: F)
  where
    F: Fn(&TunnelName, &TunneledConnState) + Send + Sync + 'static,
  {
    self.notifier.tunneled_conn_state = Some(Arc::new(callback));
  }

  pub fn set_observer(&mut self, observer: Arc<dyn TunnelObserver>) {
    self.notifier.observer = Some(observer);
  }

  pub fn set_name(&mut self, name: impl Into<String>) {
    self.name = TunnelName::new(name);
  }

  pub fn set_transport(&mut self, transport: Arc<dyn Transport>) {
    self.transport = Some(transport);
  }

  pub fn name(&self) -> &TunnelName {
    &self.name
  }

  pub fn forward_type(&self) -> ForwardType {
    self.forward_type
  }

  pub fn local_endpoint(&self) -> &Endpoint {
    &self.local
  }

  pub fn remote_endpoint(&self) -> &Endpoint {
    &self.remote
  }

  pub fn server_endpoint(&self) -> &Endpoint {
    &self.server
  }

  /// The endpoint connections are accepted on
  pub fn listen_endpoint(&self) -> &Endpoint {
    match self.forward_type {
      ForwardType::Local => &self.local,
      ForwardType::Remote => &self.remote,
    }
  }

  /// The endpoint accepted connections are forwarded to
  pub fn dial_endpoint(&self) -> &Endpoint {
    match self.forward_type {
      ForwardType::Local => &self.remote,
      ForwardType::Remote => &self.local,
    }
  }

  pub fn user(&self) -> &str {
    &self.user
  }

  pub fn auth(&self) -> &AuthMethod {
    &self.auth
  }

  pub fn algorithms(&self) -> &AlgorithmPreferences {
    &self.algorithms
  }

  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  pub fn is_started(&self) -> bool {
    self.run_state().started
  }

  /// Runs the tunnel until it is stopped or fails
  ///
  /// Returns `Ok(())` when the run ended because of [Tunnel::stop] or
  /// `shutdown`, including cancellation before the listener came up. Dropping
  /// the returned future stops the run and allows another start.
  pub async fn start(&self, shutdown: CancellationListener) -> Result<(), TunnelError> {
    let cancel = self.begin(&shutdown)?;
    let _finish = Dropkick::callback(|| self.finish());
    self.notifier.tunnel_state(&self.name, ConnState::Starting);
    let span = tracing::span!(
      tracing::Level::DEBUG,
      "tunnel",
      name = %self.name,
      forward = %self.forward_type
    );
    let res = self.run(&cancel).instrument(span).await;
    if let Err(error) = &res {
      tracing::warn!(name = %self.name, %error, "Tunnel run failed");
    }
    res
  }

  /// Cancels the current run without waiting for it; does nothing when not started
  pub fn stop(&self) {
    let state = self.run_state();
    if state.started {
      if let Some(cancel) = &state.cancel {
        cancel.cancel();
      }
    }
  }

  fn run_state(&self) -> MutexGuard<'_, RunState> {
    self.run_state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn begin(&self, shutdown: &CancellationListener) -> Result<CancellationToken, TunnelError> {
    let mut state = self.run_state();
    if state.started {
      return Err(TunnelError::AlreadyStarted);
    }
    let cancel = shutdown.child_token();
    state.started = true;
    state.cancel = Some(cancel.clone());
    Ok(cancel)
  }

  fn finish(&self) {
    {
      let mut state = self.run_state();
      state.started = false;
      if let Some(cancel) = state.cancel.take() {
        cancel.cancel();
      }
    }
    self.notifier.tunnel_state(&self.name, ConnState::Stopped);
  }

  /// Resolves credentials on the blocking pool, since key files and readers do synchronous I/O
  async fn transport_config(&self) -> Result<TransportConfig, ConfigError> {
    let auth = self.auth.clone();
    let credentials = match tokio::task::spawn_blocking(move || auth.resolve()).await {
      Ok(res) => res?,
      Err(e) => match e.try_into_panic() {
        Ok(panic) => std::panic::resume_unwind(panic),
        Err(_) => return Err(ConfigError::Aborted),
      },
    };
    Ok(TransportConfig {
      user: self.user.clone(),
      credentials,
      algorithms: self.algorithms.clone(),
      timeout: self.timeout,
    })
  }

  fn config_error(&self, source: ConfigError) -> TunnelError {
    TunnelError::Config {
      side: self.forward_type,
      source,
    }
  }

  async fn run(&self, cancel: &CancellationToken) -> Result<(), TunnelError> {
    let transport = self
      .transport
      .clone()
      .ok_or_else(|| self.config_error(ConfigError::NoTransport))?;
    let config = match cancellable(cancel, self.transport_config()).await {
      Some(res) => Arc::new(res.map_err(|e| self.config_error(e))?),
      None => {
        tracing::debug!("Cancelled while resolving credentials");
        return Ok(());
      }
    };

    let ListenSide { incoming, session } =
      match cancellable(cancel, self.open_listener(&*transport, &config)).await {
        Some(res) => res?,
        None => {
          tracing::debug!("Cancelled before the listener came up");
          return Ok(());
        }
      };

    self.notifier.tunnel_state(&self.name, ConnState::Started);
    tracing::info!(listen = %self.listen_endpoint(), dial = %self.dial_endpoint(), "Tunnel started");

    let pool = match self.forward_type {
      ForwardType::Local => Some(ClientPool::new(
        transport.clone(),
        self.server.clone(),
        config.clone(),
        self.timeout,
      )),
      ForwardType::Remote => None,
    };
    let run = Arc::new(RunContext {
      name: self.name.clone(),
      forward_type: self.forward_type,
      dial_endpoint: self.dial_endpoint().clone(),
      timeout: self.timeout,
      notifier: self.notifier.clone(),
      pool,
    });
    let res = acceptor::accept_connections(run, incoming, cancel.child_token()).await;
    if let Some(session) = session {
      session.close().await;
    }

    match res {
      Ok(()) => Ok(()),
      Err(error) if cancel.is_cancelled() => {
        tracing::debug!(%error, "Listener failed during shutdown");
        Ok(())
      }
      Err(source) => {
        let endpoint = self.listen_endpoint();
        Err(TunnelError::Accept {
          side: self.forward_type,
          network: endpoint.network(),
          address: endpoint.to_string(),
          source,
        })
      }
    }
  }

  async fn open_listener(
    &self,
    transport: &dyn Transport,
    config: &TransportConfig,
  ) -> Result<ListenSide, TunnelError> {
    match self.forward_type {
      ForwardType::Local => {
        let incoming = self
          .local
          .listen()
          .await
          .map_err(|e| self.listen_error(e.into()))?;
        Ok(ListenSide {
          incoming,
          session: None,
        })
      }
      ForwardType::Remote => {
        let session = dial_with_timeout(transport, &self.server, config, self.timeout)
          .await
          .map_err(|source| TunnelError::Dial {
            side: self.forward_type,
            network: self.server.network(),
            address: self.server.to_string(),
            source,
          })?;
        match session.listen(&self.remote).await {
          Ok(incoming) => Ok(ListenSide {
            incoming,
            session: Some(session),
          }),
          Err(source) => {
            session.close().await;
            Err(self.listen_error(source))
          }
        }
      }
    }
  }

  fn listen_error(&self, source: TransportError) -> TunnelError {
    let endpoint = self.listen_endpoint();
    TunnelError::Listen {
      side: self.forward_type,
      network: endpoint.network(),
      address: endpoint.to_string(),
      source,
    }
  }
}

impl std::fmt::Debug for Tunnel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Tunnel")
      .field("name", &self.name)
      .field("forward_type", &self.forward_type)
      .field("local", &self.local)
      .field("remote", &self.remote)
      .field("server", &self.server)
      .field("user", &self.user)
      .field("auth", &self.auth)
      .field("started", &self.is_started())
      .finish_non_exhaustive()
  }
}

fn non_empty_path(path: PathBuf) -> Option<PathBuf> {
  if path.as_os_str().is_empty() {
    None
  } else {
    Some(path)
  }
}

#[cfg(feature = "ssh")]
fn default_transport() -> Option<Arc<dyn Transport>> {
  Some(Arc::new(crate::transport::ssh::SshTransport::default()))
}

#[cfg(not(feature = "ssh"))]
fn default_transport() -> Option<Arc<dyn Transport>> {
  None
}
