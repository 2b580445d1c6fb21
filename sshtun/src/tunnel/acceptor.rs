// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use super::forwarder::forward_connection;
use super::RunContext;
use crate::common::state::ConnectionId;
use crate::transport::{Incoming, TransportError};

/// Accepts connections until `scope` is cancelled or the listener fails
///
/// Each connection is forwarded on its own task under a child of `scope`.
/// The listener is closed and every forwarder joined before this returns, so
/// nothing spawned here outlives the call. Returns `Ok(())` only when `scope`
/// was cancelled; a listener that ends on its own is reported as
/// [TransportError::Closed].
pub(crate) async fn accept_connections(
  run: Arc<RunContext>,
  mut incoming: Incoming,
  scope: CancellationToken,
) -> Result<(), TransportError> {
  let mut forwarders = JoinSet::new();
  let res = loop {
    tokio::select! {
      biased;
      _ = scope.cancelled() => break Ok(()),
      Some(joined) = forwarders.join_next(), if !forwarders.is_empty() => {
        if let Err(e) = joined {
          tracing::error!(error = %e, "Forwarder task failed");
        }
      }
      next = incoming.next() => match next {
        Some(Ok(conn)) => {
          let id = ConnectionId::new();
          let span = tracing::span!(tracing::Level::DEBUG, "connection", %id, peer = %conn.peer);
          forwarders.spawn(forward_connection(run.clone(), id, conn, scope.child_token()).instrument(span));
        }
        Some(Err(e)) => break Err(e),
        None => break Err(TransportError::Closed),
      },
    }
  };

  drop(incoming);
  scope.cancel();
  while let Some(joined) = forwarders.join_next().await {
    if let Err(e) = joined {
      tracing::error!(error = %e, "Forwarder task failed");
    }
  }
  tracing::debug!(graceful = res.is_ok(), "Acceptor finished");
  res
}
