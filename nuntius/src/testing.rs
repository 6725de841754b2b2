// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! In-memory gateway used by tests to script signaling frame by frame.
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::mpsc;

use crate::common::{
  config::{CorrelationIdSource, GatewayConfig},
  connector::GatewayConnector,
  protocol::{
    messages::{ClientFrame, GatewayFrame, GatewayRequest, Notification, Reply},
    negotiation::PROTOCOL_VERSION,
    AppId, PublicId,
  },
  session::Session,
};
use crate::util::{framed, tunnel_stream::WrappedStream};

pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Routes library logs to the test harness; `RUST_LOG` selects what is shown
pub fn init_logging() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

pub fn test_config() -> Arc<GatewayConfig> {
  Arc::new(GatewayConfig {
    gateway_address: String::from("memory"),
    correlation_ids: CorrelationIdSource::Monotonic,
    ..Default::default()
  })
}

/// Hands each dialed transport's far end to the paired [`MemoryGateway`]
pub struct MemoryConnector {
  accepted: mpsc::UnboundedSender<WrappedStream>,
}

impl GatewayConnector for MemoryConnector {
  fn connect(&self) -> BoxFuture<'static, Result<WrappedStream, std::io::Error>> {
    let (near, far) = WrappedStream::duplex(64 * 1024);
    let result = self
      .accepted
      .send(far)
      .map(|()| near)
      .map_err(|_| std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "gateway gone"));
    futures::future::ready(result).boxed()
  }
}

pub struct MemoryGateway {
  accepted: mpsc::UnboundedReceiver<WrappedStream>,
}

pub fn memory_gateway() -> (Arc<MemoryConnector>, MemoryGateway) {
  let (send, recv) = mpsc::unbounded_channel();
  (
    Arc::new(MemoryConnector { accepted: send }),
    MemoryGateway { accepted: recv },
  )
}

impl MemoryGateway {
  pub async fn next_connection(&mut self) -> GatewayPeer {
    let stream = tokio::time::timeout(STEP_TIMEOUT, self.accepted.recv())
      .await
      .expect("timed out waiting for a client to dial the gateway")
      .expect("connector dropped");
    GatewayPeer { stream }
  }

  /// True if a transport was dialed and not yet picked up
  pub fn has_pending_connection(&mut self) -> bool {
    self.accepted.try_recv().is_ok()
  }
}

/// The gateway's side of one client transport
pub struct GatewayPeer {
  stream: WrappedStream,
}

impl From<WrappedStream> for GatewayPeer {
  fn from(stream: WrappedStream) -> Self {
    Self { stream }
  }
}

impl GatewayPeer {
  pub async fn expect_call(&mut self) -> (u64, GatewayRequest) {
    let frame: ClientFrame = tokio::time::timeout(
      STEP_TIMEOUT,
      framed::read_framed_json(&mut self.stream, None),
    )
    .await
    .expect("timed out waiting for a call")
    .expect("client transport failed");
    match frame {
      ClientFrame::Call { id, request } => (id, request),
    }
  }

  pub async fn respond(&mut self, id: u64, result: Reply) {
    self.send(&GatewayFrame::Reply { id, result }).await
  }

  pub async fn notify(&mut self, notification: Notification) {
    self.send(&GatewayFrame::from(notification)).await
  }

  async fn send(&mut self, frame: &GatewayFrame) {
    framed::write_framed_json(&mut self.stream, frame, None)
      .await
      .expect("gateway write failed");
  }

  /// Acknowledges the client's version announcement
  pub async fn handshake(&mut self) {
    let (id, request) = self.expect_call().await;
    assert_eq!(
      request,
      GatewayRequest::Version {
        version: PROTOCOL_VERSION
      }
    );
    self.respond(id, Reply::ok()).await;
  }

  pub fn into_stream(self) -> WrappedStream {
    self.stream
  }
}

/// Connects a session through `gateway` and completes its handshake
pub async fn ready_session(
  connector: &Arc<MemoryConnector>,
  gateway: &mut MemoryGateway,
) -> (Session, GatewayPeer) {
  let session = Session::connect(test_config(), connector.clone())
    .await
    .expect("memory connector never fails while its gateway lives");
  let mut peer = gateway.next_connection().await;
  peer.handshake().await;
  tokio::time::timeout(STEP_TIMEOUT, session.ready())
    .await
    .expect("timed out waiting for readiness")
    .expect("session closed before becoming ready");
  (session, peer)
}

/// Authenticates `session` as `name` within the test application
pub async fn authenticate_as(session: &Session, peer: &mut GatewayPeer, name: &str) {
  let gateway = async {
    let (id, request) = peer.expect_call().await;
    assert!(matches!(
      request,
      GatewayRequest::Authenticate { ref public_id, .. } if public_id.raw() == name
    ));
    peer.respond(id, Reply::ok()).await;
  };
  let (result, ()) = tokio::join!(
    session.authenticate(AppId::new("test-app"), PublicId::new(name), b"secret".to_vec()),
    gateway
  );
  result.expect("authentication failed");
  assert_eq!(session.public_id(), Some(PublicId::new(name)));
}
