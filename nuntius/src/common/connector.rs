// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Transports used to open signaling connections to the gateway.
use futures::future::{BoxFuture, FutureExt};
use tokio::net::TcpStream;

use crate::util::tunnel_stream::WrappedStream;

/// Opens a fresh transport to the gateway each time it is called
///
/// Every session, including those dedicated to a single accepted connection, dials through the
/// connector of the session that spawned it.
#[cfg_attr(test, mockall::automock)]
pub trait GatewayConnector: Send + Sync {
  fn connect(&self) -> BoxFuture<'static, Result<WrappedStream, std::io::Error>>;
}

#[derive(Debug, Clone)]
pub struct TcpGatewayConnector {
  address: String,
  nodelay: bool,
}

impl TcpGatewayConnector {
  pub fn new<T: Into<String>>(address: T) -> Self {
    Self {
      address: address.into(),
      nodelay: true,
    }
  }

  pub fn with_nodelay(mut self, nodelay: bool) -> Self {
    self.nodelay = nodelay;
    self
  }

  pub fn address(&self) -> &str {
    &self.address
  }
}

impl GatewayConnector for TcpGatewayConnector {
  fn connect(&self) -> BoxFuture<'static, Result<WrappedStream, std::io::Error>> {
    let address = self.address.clone();
    let nodelay = self.nodelay;
    async move {
      let stream = TcpStream::connect(address.as_str()).await?;
      stream.set_nodelay(nodelay)?;
      tracing::trace!(gateway = %address, "gateway transport connected");
      Ok(WrappedStream::Tcp(stream))
    }
    .boxed()
  }
}
