// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io::Error as IOError;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

/// A duplex stream abstracting over a connection, allowing use of sockets,
/// memory streams, and transport channels interchangeably
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> TunnelStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Either end of a forwarded connection
pub enum WrappedStream {
  Tcp(TcpStream),
  #[cfg(unix)]
  Unix(UnixStream),
  DuplexStream(tokio::io::DuplexStream),
  Boxed(Box<dyn TunnelStream + 'static>),
}

impl WrappedStream {
  #[cfg(test)]
  /// Asserts that WrappedStream complies with TunnelStream, Send, and Unpin traits
  fn _assert_traits() {
    let _x: &(dyn TunnelStream + Send + Unpin) =
      &WrappedStream::DuplexStream(tokio::io::duplex(64).0);
    unreachable!("Compile-time static assertion function should never be called");
  }

  pub fn duplex(max_buf_size: usize) -> (WrappedStream, WrappedStream) {
    let (a, b) = tokio::io::duplex(max_buf_size);
    (a.into(), b.into())
  }

  pub fn boxed<S: TunnelStream + 'static>(stream: S) -> Self {
    WrappedStream::Boxed(Box::new(stream))
  }

  fn as_dyn_mut(&mut self) -> Pin<&mut (dyn TunnelStream + '_)> {
    match self {
      WrappedStream::Tcp(s) => Pin::new(s),
      #[cfg(unix)]
      WrappedStream::Unix(s) => Pin::new(s),
      WrappedStream::DuplexStream(s) => Pin::new(s),
      WrappedStream::Boxed(s) => Pin::new(&mut **s),
    }
  }
}

impl std::fmt::Debug for WrappedStream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let kind = match self {
      WrappedStream::Tcp(_) => "Tcp",
      #[cfg(unix)]
      WrappedStream::Unix(_) => "Unix",
      WrappedStream::DuplexStream(_) => "DuplexStream",
      WrappedStream::Boxed(_) => "Boxed",
    };
    f.debug_tuple("WrappedStream").field(&kind).finish()
  }
}

impl From<tokio::io::DuplexStream> for WrappedStream {
  fn from(stream: tokio::io::DuplexStream) -> Self {
    WrappedStream::DuplexStream(stream)
  }
}

impl From<TcpStream> for WrappedStream {
  fn from(stream: TcpStream) -> Self {
    WrappedStream::Tcp(stream)
  }
}

#[cfg(unix)]
impl From<UnixStream> for WrappedStream {
  fn from(stream: UnixStream) -> Self {
    WrappedStream::Unix(stream)
  }
}

impl AsyncRead for WrappedStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    self.get_mut().as_dyn_mut().poll_read(cx, buf)
  }
}

impl AsyncWrite for WrappedStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    self.get_mut().as_dyn_mut().poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    self.get_mut().as_dyn_mut().poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    self.get_mut().as_dyn_mut().poll_shutdown(cx)
  }
}

#[cfg(test)]
mod tests {
  use super::WrappedStream;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  #[tokio::test]
  async fn boxed_streams_pass_bytes_through() {
    let (a, b) = tokio::io::duplex(64);
    let mut a = WrappedStream::boxed(a);
    let mut b = WrappedStream::from(b);
    a.write_all(b"hello").await.unwrap();
    a.shutdown().await.unwrap();
    let mut out = Vec::new();
    b.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"hello");
  }
}
