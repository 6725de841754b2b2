// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use anyhow::Result;
use futures::StreamExt;
use nuntius::{common::config::GatewayConfig, Connecting, RemoteStream};
use std::sync::Arc;
use tokio::{io::AsyncWriteExt, sync::mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::Identity;

pub async fn listen_main(config: Arc<GatewayConfig>, identity: Identity) -> Result<()> {
  let session = crate::open_authenticated(config, &identity).await?;
  let (accepted, accepted_recv) = mpsc::unbounded_channel::<Connecting>();
  session.on_incoming_connection(move |incoming| {
    tracing::info!(peer = %incoming.remote_id(), connection = %incoming.connection_id(), "accepting");
    match incoming.accept() {
      Ok(connecting) => {
        let _ = accepted.send(connecting);
      }
      Err(e) => tracing::warn!(error = %e, "Could not accept connection"),
    }
  });
  tracing::info!(id = %identity.public_id, "listening");

  let stop = async {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
      _ = session.closed() => tracing::warn!("Gateway session closed"),
    }
  };
  UnboundedReceiverStream::new(accepted_recv)
    .take_until(stop)
    .for_each_concurrent(None, |connecting| async move {
      match connecting.await {
        Ok(stream) => {
          if let Err(e) = echo(stream).await {
            tracing::warn!(error = %e, "Peer stream failed");
          }
        }
        Err(e) => tracing::warn!(error = %e, "Accepted connection failed"),
      }
    })
    .await;
  session.close();
  Ok(())
}

async fn echo(stream: RemoteStream) -> Result<u64, std::io::Error> {
  let peer = stream.remote_id().clone();
  tracing::info!(%peer, "peer connected");
  let (mut reader, mut writer) = tokio::io::split(stream);
  let copied = tokio::io::copy(&mut reader, &mut writer).await?;
  writer.shutdown().await?;
  tracing::info!(%peer, bytes = copied, "peer finished");
  Ok(copied)
}
