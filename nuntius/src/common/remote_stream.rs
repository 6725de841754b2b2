// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The byte stream to a remote peer, left over once signaling has been handed off.
use std::{
  future::Future,
  net::SocketAddr,
  pin::Pin,
  task::{Context, Poll},
};

use tokio::{
  io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
  time::{Instant, Sleep},
};

use super::protocol::PublicId;
use crate::util::tunnel_stream::{TunnelStream, WrappedStream};

/// A bidirectional stream to one peer, relayed through the gateway
///
/// Deadlines are absolute; once one passes, every pending and later operation in that direction
/// fails with [`std::io::ErrorKind::TimedOut`] until the deadline is cleared or moved.
pub struct RemoteStream {
  stream: WrappedStream,
  remote_id: PublicId,
  read_deadline: Option<Pin<Box<Sleep>>>,
  write_deadline: Option<Pin<Box<Sleep>>>,
}

impl RemoteStream {
  /// Wraps a transport already handed over from signaling
  pub fn from_parts(stream: WrappedStream, remote_id: PublicId) -> Self {
    Self {
      stream,
      remote_id,
      read_deadline: None,
      write_deadline: None,
    }
  }

  /// The public id of the peer at the other end
  pub fn remote_id(&self) -> &PublicId {
    &self.remote_id
  }

  /// Local address of the underlying gateway transport, when it has one
  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.stream.local_addr()
  }

  /// Gateway address of the underlying transport; the peer itself is never directly addressable
  pub fn peer_addr(&self) -> Option<SocketAddr> {
    self.stream.peer_addr()
  }

  pub fn set_deadline(&mut self, deadline: Option<Instant>) {
    self.set_read_deadline(deadline);
    self.set_write_deadline(deadline);
  }

  pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
    self.read_deadline = deadline.map(|d| Box::pin(tokio::time::sleep_until(d)));
  }

  pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
    self.write_deadline = deadline.map(|d| Box::pin(tokio::time::sleep_until(d)));
  }

  /// Shuts down the sending direction, then releases the transport
  ///
  /// The peer observes end-of-stream even if the shutdown fails.
  pub async fn close(mut self) -> Result<(), std::io::Error> {
    self.stream.shutdown().await
  }

  pub fn into_inner(self) -> WrappedStream {
    self.stream
  }
}

fn deadline_elapsed(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> bool {
  match deadline {
    Some(sleep) => sleep.deadline() <= Instant::now() || sleep.as_mut().poll(cx).is_ready(),
    None => false,
  }
}

fn timed_out(direction: &'static str) -> std::io::Error {
  std::io::Error::new(
    std::io::ErrorKind::TimedOut,
    format!("{} deadline exceeded", direction),
  )
}

impl std::fmt::Debug for RemoteStream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RemoteStream")
      .field("remote_id", &self.remote_id)
      .field("stream", &self.stream)
      .finish_non_exhaustive()
  }
}

impl AsyncRead for RemoteStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    if deadline_elapsed(&mut this.read_deadline, cx) {
      return Poll::Ready(Err(timed_out("read")));
    }
    Pin::new(&mut this.stream).poll_read(cx, buf)
  }
}

impl AsyncWrite for RemoteStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, std::io::Error>> {
    let this = self.get_mut();
    if deadline_elapsed(&mut this.write_deadline, cx) {
      return Poll::Ready(Err(timed_out("write")));
    }
    Pin::new(&mut this.stream).poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
    let this = self.get_mut();
    if deadline_elapsed(&mut this.write_deadline, cx) {
      return Poll::Ready(Err(timed_out("write")));
    }
    Pin::new(&mut this.stream).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
    Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
  }
}

impl TunnelStream for RemoteStream {}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::RemoteStream;
  use crate::common::protocol::PublicId;
  use crate::util::tunnel_stream::WrappedStream;

  #[tokio::test]
  async fn bytes_pass_through_and_close_ends_stream() {
    let (near, mut far) = WrappedStream::duplex(1024);
    let mut stream = RemoteStream::from_parts(near, PublicId::new("bob"));
    assert_eq!(stream.remote_id().raw(), "bob");
    assert_eq!(stream.local_addr(), None);
    stream.write_all(b"hello").await.unwrap();
    stream.close().await.unwrap();
    let mut received = Vec::new();
    far.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"hello");
    // The whole transport is gone, not just our sending half
    let err = far.write_all(b"late").await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
  }

  #[tokio::test]
  async fn read_deadline_interrupts_idle_read() {
    let (near, mut far) = WrappedStream::duplex(1024);
    let mut stream = RemoteStream::from_parts(near, PublicId::new("bob"));
    stream.set_read_deadline(Some(tokio::time::Instant::now() + Duration::from_millis(20)));
    let mut buf = [0u8; 4];
    let result = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
      .await
      .expect("deadline must fire before the outer timeout");
    assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::TimedOut);

    // Clearing the deadline restores normal reads
    stream.set_read_deadline(None);
    far.write_all(b"ok").await.unwrap();
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ok");
  }

  #[tokio::test]
  async fn expired_write_deadline_refuses_writes() {
    let (near, _far) = WrappedStream::duplex(1024);
    let mut stream = RemoteStream::from_parts(near, PublicId::new("bob"));
    stream.set_deadline(Some(tokio::time::Instant::now()));
    let err = stream.write_all(b"late").await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
  }
}
