// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::Result;
use sshtun::{ConnectionState, Tunnel};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const RESTART_BACKOFF: Duration = Duration::from_secs(1);

fn log_states(tunnel: &mut Tunnel) {
  tunnel.set_conn_state(|name, state| {
    tracing::info!(tunnel = %name, %state, "tunnel_state");
  });
  tunnel.set_tunneled_conn_state(|name, conn| match conn.state {
    ConnectionState::Error => tracing::warn!(tunnel = %name, connection = %conn, "connection_state"),
    _ => tracing::info!(tunnel = %name, connection = %conn, "connection_state"),
  });
}

/// Keeps the tunnel running until `shutdown` fires
///
/// Failed runs are retried after a short back-off. With `cycle` set, each run
/// is stopped once the period elapses and started again.
pub async fn run_until_shutdown(
  mut tunnel: Tunnel,
  shutdown: CancellationToken,
  cycle: Option<Duration>,
) -> Result<()> {
  log_states(&mut tunnel);
  let tunnel = Arc::new(tunnel);
  while !shutdown.is_cancelled() {
    let cycler = cycle.map(|period| {
      let tunnel = Arc::clone(&tunnel);
      tokio::spawn(async move {
        tokio::time::sleep(period).await;
        tracing::info!(tunnel = %tunnel.name(), "Cycling tunnel");
        tunnel.stop();
      })
    });
    let res = tunnel.start((&shutdown).into()).await;
    if let Some(cycler) = cycler {
      cycler.abort();
    }
    if let Err(error) = res {
      tracing::warn!(tunnel = %tunnel.name(), %error, "Tunnel failed, restarting after back-off");
      tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(RESTART_BACKOFF) => {}
      }
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use sshtun::transport::memory::MemoryTransport;

  fn remote_tunnel(transport: &MemoryTransport) -> Tunnel {
    let mut tunnel = Tunnel::new_remote(0, "bastion", 9000);
    tunnel.set_password("hunter2");
    tunnel.set_transport(Arc::new(transport.clone()));
    tunnel
  }

  #[tokio::test]
  async fn failed_runs_are_retried() {
    let transport = MemoryTransport::new();
    transport.set_fail_dials(true);
    let shutdown = CancellationToken::new();
    let runner = tokio::spawn(run_until_shutdown(remote_tunnel(&transport), shutdown.clone(), None));
    tokio::time::sleep(Duration::from_millis(1500)).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), runner)
      .await
      .expect("runner must stop after shutdown")
      .unwrap()
      .unwrap();
    assert!(transport.dial_count() >= 2, "dials: {}", transport.dial_count());
  }

  #[tokio::test]
  async fn cycled_runs_reopen_the_session() {
    let transport = MemoryTransport::new();
    let shutdown = CancellationToken::new();
    let runner = tokio::spawn(run_until_shutdown(
      remote_tunnel(&transport),
      shutdown.clone(),
      Some(Duration::from_secs(1)),
    ));
    tokio::time::sleep(Duration::from_millis(2500)).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), runner)
      .await
      .expect("runner must stop after shutdown")
      .unwrap()
      .unwrap();
    assert!(transport.dial_count() >= 2, "dials: {}", transport.dial_count());
    assert_eq!(transport.open_sessions(), 0);
  }
}
