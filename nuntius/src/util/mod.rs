// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod framed;
pub mod tunnel_stream;
pub mod validators;

const PROXY_BUFFER_CAPACITY: usize = 1024 * 32;

/// Copies `a`'s reader into `b`'s sender and `b`'s reader into `a`'s sender until both directions end
///
/// Each direction shuts down its sender once its reader reaches end-of-stream.
#[tracing::instrument(level = "trace", err, skip(a, b))]
pub async fn proxy_generic_tokio_streams<
  SenderA: AsyncWrite + Unpin,
  ReaderA: AsyncRead + Unpin,
  SenderB: AsyncWrite + Unpin,
  ReaderB: AsyncRead + Unpin,
>(
  a: (&mut SenderA, &mut ReaderA),
  b: (&mut SenderB, &mut ReaderB),
) -> Result<(u64, u64), std::io::Error> {
  let (sender_a, reader_a) = a;
  let (sender_b, reader_b) = b;
  let mut reader_a = tokio::io::BufReader::with_capacity(PROXY_BUFFER_CAPACITY, reader_a);
  let mut reader_b = tokio::io::BufReader::with_capacity(PROXY_BUFFER_CAPACITY, reader_b);
  let proxy_a2b = copy_then_shutdown(&mut reader_a, sender_b).fuse();
  let proxy_b2a = copy_then_shutdown(&mut reader_b, sender_a).fuse();
  match futures::future::try_join(proxy_a2b, proxy_b2a).await {
    Ok((a_to_b, b_to_a)) => Ok((a_to_b, b_to_a)),
    Err(e) => {
      tracing::debug!(error = ?e, "Proxy connection copy with error {:#?}", e);
      Err(e)
    }
  }
}

async fn copy_then_shutdown<R, W>(reader: &mut R, writer: &mut W) -> Result<u64, std::io::Error>
where
  R: tokio::io::AsyncBufRead + Unpin,
  W: AsyncWrite + Unpin,
{
  use tokio::io::AsyncWriteExt;
  let copied = tokio::io::copy_buf(reader, writer).await?;
  writer.shutdown().await?;
  Ok(copied)
}
