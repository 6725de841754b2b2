// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use super::{
  messages::GatewayRequest,
  rpc::{RpcChannel, RpcError},
};

/// Signaling protocol revision this client speaks
pub const PROTOCOL_VERSION: u8 = 2;

#[derive(thiserror::Error, Debug, Clone)]
pub enum NegotiationError {
  #[error("Gateway refused protocol version {version}: {reason}")]
  Refused { version: u8, reason: String },
  #[error("Version negotiation failed: {0}")]
  Rpc(RpcError),
}

/// Announces `version` to the gateway; `on_complete` runs once the gateway answers.
///
/// The announcement must be the first call issued on a signaling channel.
pub fn announce_version<F>(rpc: &RpcChannel, version: u8, on_complete: F)
where
  F: FnOnce(Result<(), NegotiationError>) + Send + Sync + 'static,
{
  rpc.call_with(GatewayRequest::Version { version }, move |reply| {
    let result = match reply {
      Ok(_) => Ok(()),
      Err(RpcError::Remote(reason)) => Err(NegotiationError::Refused { version, reason }),
      Err(other) => Err(NegotiationError::Rpc(other)),
    };
    on_complete(result);
  });
}
