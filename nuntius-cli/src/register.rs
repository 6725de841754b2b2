// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

use anyhow::{Context as AnyhowContext, Result};
use nuntius::{common::config::GatewayConfig, AppId, PublicId};
use std::{path::PathBuf, sync::Arc};

pub struct RegisterArgs {
  pub app_id: AppId,
  pub public_id: PublicId,
  pub registration_key: Vec<u8>,
  pub output: Option<PathBuf>,
}

pub async fn register_main(config: Arc<GatewayConfig>, args: RegisterArgs) -> Result<()> {
  let session = crate::open_session(config).await?;
  let secret = session
    .register(args.app_id, args.public_id.clone(), args.registration_key)
    .await
    .with_context(|| format!("Registering {} failed", args.public_id))?;
  match args.output {
    Some(path) => {
      std::fs::write(&path, &secret)
        .with_context(|| format!("Failed writing secret to {}", path.display()))?;
      tracing::info!(path = %path.display(), "secret written");
    }
    None => println!("{}", serde_json::to_string(&secret)?),
  }
  session.close();
  session.closed().await;
  Ok(())
}
