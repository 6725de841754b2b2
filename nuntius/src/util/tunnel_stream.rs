// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io::Error as IOError;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

/// A duplex byte stream abstracting over a gateway transport, allowing use of memory streams and sockets
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<'stream, TInner: TunnelStream + ?Sized + 'stream> TunnelStream for &'stream mut TInner {}
impl<TInner: TunnelStream + ?Sized> TunnelStream for Box<TInner> {}

pub enum WrappedStream {
  Tcp(TcpStream),
  DuplexStream(DuplexStream),
}

impl WrappedStream {
  #[cfg(test)]
  /// Asserts that WrappedStream complies with TunnelStream, Send, and Unpin traits
  fn _assert_traits() {
    let _x: &(dyn TunnelStream + Send + Sync + Unpin) =
      &WrappedStream::DuplexStream(tokio::io::duplex(64).0);
    unreachable!("Compile-time static assertion function should never be called");
  }

  pub fn duplex(max_buf_size: usize) -> (WrappedStream, WrappedStream) {
    let (a, b) = tokio::io::duplex(max_buf_size);
    (a.into(), b.into())
  }

  /// Local socket address, when the stream is backed by a socket
  pub fn local_addr(&self) -> Option<SocketAddr> {
    match self {
      WrappedStream::Tcp(s) => s.local_addr().ok(),
      _ => None,
    }
  }

  /// Remote socket address, when the stream is backed by a socket
  pub fn peer_addr(&self) -> Option<SocketAddr> {
    match self {
      WrappedStream::Tcp(s) => s.peer_addr().ok(),
      _ => None,
    }
  }
}

impl std::fmt::Debug for WrappedStream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      WrappedStream::Tcp(s) => f.debug_tuple("WrappedStream::Tcp").field(s).finish(),
      WrappedStream::DuplexStream(_) => f.write_str("WrappedStream::DuplexStream"),
    }
  }
}

impl From<DuplexStream> for WrappedStream {
  fn from(stream: DuplexStream) -> Self {
    WrappedStream::DuplexStream(stream)
  }
}

impl From<TcpStream> for WrappedStream {
  fn from(stream: TcpStream) -> Self {
    WrappedStream::Tcp(stream)
  }
}

impl AsyncRead for WrappedStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      WrappedStream::Tcp(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
      WrappedStream::DuplexStream(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
    }
  }
}

impl AsyncWrite for WrappedStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    match self.get_mut() {
      WrappedStream::Tcp(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
      WrappedStream::DuplexStream(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      WrappedStream::Tcp(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
      WrappedStream::DuplexStream(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      WrappedStream::Tcp(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
      WrappedStream::DuplexStream(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
    }
  }
}

impl TunnelStream for WrappedStream {}

#[cfg(test)]
mod tests {
  use super::WrappedStream;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  #[tokio::test]
  async fn duplex_pair_carries_bytes_both_ways() {
    let (mut a, mut b) = WrappedStream::duplex(64);
    a.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    b.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    b.write_all(b"pong").await.unwrap();
    a.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
    assert!(a.peer_addr().is_none());
  }

  #[tokio::test]
  async fn tcp_stream_reports_addresses() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, server) = futures::future::join(
      tokio::net::TcpStream::connect(addr),
      listener.accept(),
    )
    .await;
    let client: WrappedStream = client.unwrap().into();
    let (_server, client_addr) = server.unwrap();
    assert_eq!(client.peer_addr(), Some(addr));
    assert_eq!(client.local_addr(), Some(client_addr));
  }
}
