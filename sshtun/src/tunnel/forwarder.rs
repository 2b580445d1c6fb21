// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{ClientPool, ConnectionError, RunContext};
use crate::common::endpoint::ForwardType;
use crate::common::state::{ConnectionId, ConnectionState, TunneledConnState};
use crate::transport::{IncomingConnection, TransportError};
use crate::util::cancellation::cancellable;
use crate::util::tunnel_stream::WrappedStream;
use crate::util::{forward_streams, ForwardOutcome};

struct Outbound<'a> {
  stream: WrappedStream,
  /// Set when the stream rides on the shared session and a reference must be given back
  lease: Option<&'a ClientPool>,
}

/// Forwards one accepted connection to the run's dial-side endpoint
///
/// Every connection produces exactly one terminal notification. Connections
/// whose outbound side opened also produce a `Started` notification first.
pub(crate) async fn forward_connection(
  run: Arc<RunContext>,
  id: ConnectionId,
  incoming: IncomingConnection,
  cancel: CancellationToken,
) {
  let IncomingConnection { mut stream, peer } = incoming;
  let mut conn = TunneledConnState {
    id,
    source: peer,
    destination: run.dial_endpoint.to_string(),
    state: ConnectionState::Started,
    error: None,
  };

  let outbound = match open_outbound(&run, &cancel).await {
    Ok(Some(outbound)) => outbound,
    Ok(None) => {
      tracing::debug!("Cancelled before the outbound side opened");
      report(&run, &mut conn, Ok(()));
      return;
    }
    Err(e) => {
      report(&run, &mut conn, Err(e));
      return;
    }
  };
  let Outbound {
    stream: mut outbound,
    lease,
  } = outbound;

  run.notifier.connection_state(&run.name, &conn);
  let res = forward_streams(&mut stream, &mut outbound, &cancel).await;
  drop(outbound);
  drop(stream);
  if let Some(pool) = lease {
    pool.release().await;
  }

  let res = match res {
    Ok(ForwardOutcome::Completed { a_to_b, b_to_a }) => {
      tracing::trace!(sent = a_to_b, received = b_to_a, "Connection closed");
      Ok(())
    }
    Ok(ForwardOutcome::Cancelled) => {
      tracing::trace!("Connection cancelled");
      Ok(())
    }
    Err(e) => Err(ConnectionError::Forward(e)),
  };
  report(&run, &mut conn, res);
}

/// Opens the dial side, yielding `None` if `cancel` fires first
async fn open_outbound<'a>(
  run: &'a RunContext,
  cancel: &CancellationToken,
) -> Result<Option<Outbound<'a>>, ConnectionError> {
  match (run.forward_type, &run.pool) {
    (ForwardType::Local, Some(pool)) => {
      let session = match cancellable(cancel, pool.acquire()).await {
        None => return Ok(None),
        Some(res) => res.map_err(ConnectionError::Dial)?,
      };
      let channel = cancellable(
        cancel,
        tokio::time::timeout(run.timeout, session.dial_channel(&run.dial_endpoint)),
      )
      .await;
      drop(session);
      let res = match channel {
        Some(Ok(Ok(stream))) => {
          return Ok(Some(Outbound {
            stream,
            lease: Some(pool),
          }))
        }
        None => Ok(None),
        Some(Ok(Err(e))) => Err(ConnectionError::Channel(e)),
        Some(Err(_elapsed)) => Err(ConnectionError::Channel(TransportError::TimedOut(run.timeout))),
      };
      pool.release().await;
      res
    }
    (ForwardType::Local, None) => Err(ConnectionError::Dial(TransportError::Closed)),
    (ForwardType::Remote, _) => {
      match cancellable(cancel, tokio::time::timeout(run.timeout, run.dial_endpoint.connect())).await {
        None => Ok(None),
        Some(Ok(Ok(stream))) => Ok(Some(Outbound { stream, lease: None })),
        Some(Ok(Err(e))) => Err(ConnectionError::Connect(e)),
        Some(Err(_elapsed)) => Err(ConnectionError::Connect(std::io::Error::new(
          std::io::ErrorKind::TimedOut,
          format!("connect to {} timed out after {:?}", run.dial_endpoint, run.timeout),
        ))),
      }
    }
  }
}

fn report(run: &RunContext, conn: &mut TunneledConnState, res: Result<(), ConnectionError>) {
  match res {
    Ok(()) => {
      conn.state = ConnectionState::Stopped;
      conn.error = None;
    }
    Err(e) => {
      tracing::warn!(error = %e, source = %conn.source, destination = %conn.destination, "Connection failed");
      conn.state = ConnectionState::Error;
      conn.error = Some(Arc::new(e));
    }
  }
  run.notifier.connection_state(&run.name, conn);
}
