// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::common::endpoint::Endpoint;
use crate::transport::{dial_with_timeout, SharedSession, Transport, TransportConfig, TransportError};

struct PoolState {
  active: usize,
  session: Option<SharedSession>,
}

/// One server session shared by every connection of a local-forward run
///
/// The session is dialed by the first `acquire` and closed by the `release`
/// that drops the active count back to zero. Both boundaries run under the
/// pool's lock, so a close can never interleave with a concurrent open.
pub(crate) struct ClientPool {
  transport: Arc<dyn Transport>,
  server: Endpoint,
  config: Arc<TransportConfig>,
  timeout: Duration,
  state: tokio::sync::Mutex<PoolState>,
  active: AtomicUsize,
}

impl ClientPool {
  pub fn new(
    transport: Arc<dyn Transport>,
    server: Endpoint,
    config: Arc<TransportConfig>,
    timeout: Duration,
  ) -> Self {
    Self {
      transport,
      server,
      config,
      timeout,
      state: tokio::sync::Mutex::new(PoolState {
        active: 0,
        session: None,
      }),
      active: AtomicUsize::new(0),
    }
  }

  /// Returns the shared session, dialing it if no connection currently holds it
  ///
  /// A failed dial leaves the count untouched. Dropping the returned future
  /// part-way through a dial abandons that dial without side effects.
  pub async fn acquire(&self) -> Result<SharedSession, TransportError> {
    let mut state = self.state.lock().await;
    let session = match &state.session {
      Some(session) => session.clone(),
      None => {
        tracing::debug!(server = %self.server, "Dialing shared session");
        let session = dial_with_timeout(&*self.transport, &self.server, &self.config, self.timeout).await?;
        state.session = Some(session.clone());
        session
      }
    };
    state.active += 1;
    self.active.store(state.active, Ordering::SeqCst);
    Ok(session)
  }

  /// Gives back one reference; the last one closes the session
  pub async fn release(&self) {
    let mut state = self.state.lock().await;
    if state.active == 0 {
      tracing::warn!("Released a pool that holds no references");
      return;
    }
    state.active -= 1;
    self.active.store(state.active, Ordering::SeqCst);
    if state.active == 0 {
      if let Some(session) = state.session.take() {
        tracing::debug!(server = %self.server, "Closing shared session");
        session.close().await;
      }
    }
  }

  /// Connections currently holding the session
  pub fn active(&self) -> usize {
    self.active.load(Ordering::SeqCst)
  }
}

#[cfg(test)]
mod tests {
  use super::ClientPool;
  use crate::common::authentication::{AlgorithmPreferences, Credentials};
  use crate::common::endpoint::Endpoint;
  use crate::transport::memory::MemoryTransport;
  use crate::transport::{TransportConfig, TransportError};
  use std::sync::Arc;
  use std::time::Duration;

  fn pool(transport: &MemoryTransport, timeout: Duration) -> Arc<ClientPool> {
    let config = TransportConfig {
      user: "root".into(),
      credentials: Credentials::Agent,
      algorithms: AlgorithmPreferences::default(),
      timeout,
    };
    Arc::new(ClientPool::new(
      Arc::new(transport.clone()),
      Endpoint::tcp("server", 22),
      Arc::new(config),
      timeout,
    ))
  }

  #[tokio::test]
  async fn concurrent_acquires_share_one_dial() {
    let transport = MemoryTransport::new();
    transport.set_dial_delay(Duration::from_millis(50));
    let pool = pool(&transport, Duration::from_secs(5));

    let acquires = (0..8).map(|_| {
      let pool = pool.clone();
      tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
    });
    for res in futures::future::join_all(acquires).await {
      res.unwrap().unwrap();
    }
    assert_eq!(transport.dial_count(), 1);
    assert_eq!(pool.active(), 8);

    for remaining in (0..8).rev() {
      pool.release().await;
      assert_eq!(pool.active(), remaining);
      let expected_closes = if remaining == 0 { 1 } else { 0 };
      assert_eq!(transport.close_count(), expected_closes);
    }
    assert_eq!(transport.open_sessions(), 0);
  }

  #[tokio::test]
  async fn failed_dials_do_not_count() {
    let transport = MemoryTransport::new();
    transport.set_fail_dials(true);
    let pool = pool(&transport, Duration::from_secs(5));
    assert!(matches!(pool.acquire().await, Err(TransportError::Io(_))));
    assert_eq!(pool.active(), 0);

    // The next acquire dials again and succeeds
    transport.set_fail_dials(false);
    pool.acquire().await.unwrap();
    assert_eq!(transport.dial_count(), 2);
    assert_eq!(pool.active(), 1);
    pool.release().await;
    assert_eq!(transport.close_count(), 1);
  }

  #[tokio::test]
  async fn slow_dials_time_out() {
    let transport = MemoryTransport::new();
    transport.set_dial_delay(Duration::from_secs(60));
    let pool = pool(&transport, Duration::from_millis(20));
    assert!(matches!(
      pool.acquire().await,
      Err(TransportError::TimedOut(_))
    ));
    assert_eq!(pool.active(), 0);
  }

  #[tokio::test]
  async fn reopens_after_the_last_release() {
    let transport = MemoryTransport::new();
    let pool = pool(&transport, Duration::from_secs(5));
    pool.acquire().await.unwrap();
    pool.release().await;
    pool.acquire().await.unwrap();
    pool.release().await;
    assert_eq!(transport.dial_count(), 2);
    assert_eq!(transport.close_count(), 2);

    // Extra releases are ignored
    pool.release().await;
    assert_eq!(pool.active(), 0);
    assert_eq!(transport.close_count(), 2);
  }
}
