// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Client for negotiating peer-to-peer streams through a rendezvous gateway.
//!
//! A client authenticates a [`Session`] with the gateway, then either requests a connection to
//! another client by public id or accepts connections offered to it. Each established connection
//! is carried on its own transport to the gateway, surfaced as a [`RemoteStream`].

pub mod common;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;

pub use common::{
  config::GatewayConfig,
  connector::{GatewayConnector, TcpGatewayConnector},
  protocol::{AppId, ConnectionId, CorrelationId, PublicId},
  remote_stream::RemoteStream,
  session::{ConnectError, Connecting, IncomingConnection, Session, SessionError},
};
