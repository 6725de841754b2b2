// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use anyhow::{Context as AnyhowContext, Result};
use nuntius::{common::config::GatewayConfig, util, PublicId};
use std::sync::Arc;

use crate::Identity;

#[derive(Clone, Debug)]
pub struct ConnectArgs {
  pub identity: Identity,
  pub peer: PublicId,
}

pub async fn connect_main(config: Arc<GatewayConfig>, args: ConnectArgs) -> Result<()> {
  let session = crate::open_authenticated(config, &args.identity).await?;
  let connecting = session.connect_to(args.peer.clone());
  tracing::debug!(correlation_id = ?connecting.correlation_id(), "awaiting gateway match");
  let stream = connecting
    .await
    .with_context(|| format!("Connecting to {} failed", args.peer))?;
  tracing::info!(peer = %stream.remote_id(), "connected");

  let (mut remote_reader, mut remote_writer) = tokio::io::split(stream);
  let mut stdin = tokio::io::stdin();
  let mut stdout = tokio::io::stdout();
  let (sent, received) = util::proxy_generic_tokio_streams(
    (&mut stdout, &mut stdin),
    (&mut remote_writer, &mut remote_reader),
  )
  .await
  .context("Peer stream failed")?;
  tracing::info!(sent, received, "peer stream finished");
  session.close();
  Ok(())
}
