// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

pub mod cancellation;
pub mod dropkick;
pub mod tunnel_stream;

const COPY_BUFFER_SIZE: usize = 8 * 1024;

/// How a bidirectional forward came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
  /// One direction reached EOF; carries the byte counts copied `a -> b` and `b -> a` so far
  Completed { a_to_b: u64, b_to_a: u64 },
  /// The cancellation token fired before either side closed
  Cancelled,
}

async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, copied: &mut u64) -> Result<(), std::io::Error>
where
  R: AsyncRead + Unpin + ?Sized,
  W: AsyncWrite + Unpin + ?Sized,
{
  let mut buf = vec![0u8; COPY_BUFFER_SIZE];
  loop {
    let read = reader.read(&mut buf).await?;
    if read == 0 {
      return Ok(());
    }
    writer.write_all(&buf[..read]).await?;
    writer.flush().await?;
    *copied += read as u64;
  }
}

/// Copies bytes between `a` and `b` until either side closes or fails, or
/// `cancel` fires
///
/// Both streams are shut down before returning, whichever way forwarding ended.
#[tracing::instrument(level = "trace", err, skip(a, b, cancel))]
pub async fn forward_streams<A, B>(
  a: &mut A,
  b: &mut B,
  cancel: &CancellationToken,
) -> Result<ForwardOutcome, std::io::Error>
where
  A: AsyncRead + AsyncWrite + Unpin + ?Sized,
  B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
  tracing::trace!("polling");
  let (mut a_to_b, mut b_to_a) = (0u64, 0u64);
  let res = {
    let (mut a_read, mut a_write) = tokio::io::split(&mut *a);
    let (mut b_read, mut b_write) = tokio::io::split(&mut *b);
    let upstream = copy_counted(&mut a_read, &mut b_write, &mut a_to_b);
    let downstream = copy_counted(&mut b_read, &mut a_write, &mut b_to_a);
    tokio::select! {
      res = upstream => res.map(|()| true),
      res = downstream => res.map(|()| true),
      _ = cancel.cancelled() => Ok(false),
    }
  };
  // Shutdown failures on an already-broken stream carry no new information
  let _ = a.shutdown().await;
  let _ = b.shutdown().await;
  match res {
    Ok(true) => Ok(ForwardOutcome::Completed { a_to_b, b_to_a }),
    Ok(false) => Ok(ForwardOutcome::Cancelled),
    Err(e) => {
      tracing::debug!(error = ?e, a_to_b, b_to_a, "Forwarded connection copy ended with error {:#?}", e);
      Err(e)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::{forward_streams, ForwardOutcome};
  use std::time::Duration;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio_util::sync::CancellationToken;

  #[tokio::test]
  async fn forwards_both_directions_until_one_side_closes() {
    let (mut client, mut client_side) = tokio::io::duplex(1024);
    let (mut server_side, mut server) = tokio::io::duplex(1024);
    let cancel = CancellationToken::new();

    let forward = tokio::task::spawn(async move {
      forward_streams(&mut client_side, &mut server_side, &cancel).await
    });

    client.write_all(b"ping").await.unwrap();
    let mut request = [0u8; 4];
    server.read_exact(&mut request).await.unwrap();
    assert_eq!(&request, b"ping");

    server.write_all(b"pong!").await.unwrap();
    let mut response = [0u8; 5];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(&response, b"pong!");

    // The server never closes its end; the client closing is enough
    drop(client);
    let outcome = tokio::time::timeout(Duration::from_secs(5), forward)
      .await
      .expect("forward must finish once either side closes")
      .unwrap()
      .unwrap();
    assert_eq!(
      outcome,
      ForwardOutcome::Completed {
        a_to_b: 4,
        b_to_a: 5
      }
    );
    let mut rest = Vec::new();
    server.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
  }

  #[tokio::test]
  async fn a_closing_destination_ends_the_forward() {
    let (mut client, mut client_side) = tokio::io::duplex(1024);
    let (mut server_side, server) = tokio::io::duplex(1024);
    let cancel = CancellationToken::new();

    let forward = tokio::task::spawn(async move {
      forward_streams(&mut client_side, &mut server_side, &cancel).await
    });
    drop(server);
    let outcome = tokio::time::timeout(Duration::from_secs(5), forward)
      .await
      .expect("forward must finish once the destination closes")
      .unwrap();
    assert!(matches!(
      outcome,
      Ok(ForwardOutcome::Completed { .. }) | Err(_)
    ));
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
  }

  #[tokio::test]
  async fn cancellation_ends_an_idle_forward() {
    let (_client, mut client_side) = tokio::io::duplex(1024);
    let (mut server_side, mut server) = tokio::io::duplex(1024);
    let cancel = CancellationToken::new();

    let forward = {
      let cancel = cancel.clone();
      tokio::task::spawn(async move {
        forward_streams(&mut client_side, &mut server_side, &cancel).await
      })
    };
    cancel.cancel();
    let outcome = tokio::time::timeout(Duration::from_secs(5), forward)
      .await
      .expect("cancelled forward must finish")
      .unwrap()
      .unwrap();
    assert_eq!(outcome, ForwardOutcome::Cancelled);

    // The server end observes the shutdown
    let mut rest = Vec::new();
    server.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
  }
}
