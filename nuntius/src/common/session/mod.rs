// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Sessions with the gateway, and the connections brokered through them.
//!
//! A [`Session`] owns one transport to the gateway. A background task drives its signaling and
//! performs the version handshake; the session becomes ready once the gateway acknowledges it.
//! Accepting a brokered connection opens a second, dedicated session whose transport becomes the
//! [`RemoteStream`] once the gateway hands it over.
use std::sync::{
  atomic::{AtomicU64, Ordering},
  Arc, Mutex, MutexGuard,
};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{
  config::GatewayConfig,
  connector::GatewayConnector,
  protocol::{
    negotiation::{self, NegotiationError},
    rpc, AppId, GatewayRequest, Notification, NotificationHandler, PublicId, RpcChannel, RpcDriver,
    RpcError,
  },
  remote_stream::RemoteStream,
};
use crate::util::tunnel_stream::WrappedStream;

pub mod broker;
pub mod handoff;
pub mod incoming;

pub use broker::{Connecting, ConnectionBroker};
use handoff::{AcceptingConnection, HandoffStep, StreamHandoff};
pub use incoming::IncomingConnection;

/// Resolution of a requested or accepted connection
pub type Completion = oneshot::Sender<Result<RemoteStream, ConnectError>>;

type ReadyCallback = Box<dyn FnOnce() + Send + 'static>;
type IncomingHandler = Arc<dyn Fn(&IncomingConnection) + Send + Sync + 'static>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum SessionError {
  #[error("Failed to connect to the gateway: {0}")]
  Connect(Arc<std::io::Error>),
  #[error("Session is not ready")]
  NotReady,
  #[error("Gateway error: {0}")]
  Gateway(String),
  #[error("Version negotiation failed: {0}")]
  Handshake(#[from] NegotiationError),
  #[error(transparent)]
  Rpc(RpcError),
  #[error("Gateway reply to {0} was missing its payload")]
  UnexpectedReply(&'static str),
  #[error("Session closed")]
  Closed,
}

impl From<RpcError> for SessionError {
  fn from(e: RpcError) -> Self {
    match e {
      RpcError::Remote(message) => SessionError::Gateway(message),
      RpcError::Closed | RpcError::Halted => SessionError::Closed,
      other => SessionError::Rpc(other),
    }
  }
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum ConnectError {
  #[error("Connection already handled")]
  AlreadyHandled,
  #[error("Gateway error: {0}")]
  Gateway(String),
  #[error("Connection aborted by the gateway: {0}")]
  Rejected(String),
  #[error("Failed to open a session for the connection: {0}")]
  Session(SessionError),
  #[error("Session closed")]
  SessionClosed,
}

impl ConnectError {
  pub(crate) fn from_rpc(e: RpcError) -> Self {
    match e {
      RpcError::Remote(message) => ConnectError::Gateway(message),
      RpcError::Closed | RpcError::Halted => ConnectError::SessionClosed,
      other => ConnectError::Session(SessionError::Rpc(other)),
    }
  }
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Default)]
struct SessionState {
  ready: bool,
  ready_callbacks: Vec<ReadyCallback>,
  app_id: Option<AppId>,
  public_id: Option<PublicId>,
  handlers: Vec<IncomingHandler>,
  handoff: StreamHandoff,
  streaming: bool,
  closed: bool,
  failure: Option<SessionError>,
}

struct SessionInner {
  id: u64,
  config: Arc<GatewayConfig>,
  connector: Arc<dyn GatewayConnector>,
  runtime: tokio::runtime::Handle,
  rpc: RpcChannel,
  broker: ConnectionBroker,
  state: Mutex<SessionState>,
  shutdown: CancellationToken,
  terminated: CancellationToken,
}

/// A signaling session with the gateway; clones share the session
#[derive(Clone)]
pub struct Session {
  inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Session")
      .field("id", &self.inner.id)
      .field("gateway", &self.inner.config.gateway_address)
      .finish_non_exhaustive()
  }
}

impl Session {
  /// Opens a transport through `connector` and starts the session on the current runtime
  ///
  /// Fails only if the transport cannot be opened; the handshake completes in the background.
  pub async fn connect(
    config: Arc<GatewayConfig>,
    connector: Arc<dyn GatewayConnector>,
  ) -> Result<Session, SessionError> {
    let transport = connector
      .connect()
      .await
      .map_err(|e| SessionError::Connect(Arc::new(e)))?;
    Ok(Self::start(config, connector, transport))
  }

  fn start(
    config: Arc<GatewayConfig>,
    connector: Arc<dyn GatewayConnector>,
    transport: WrappedStream,
  ) -> Session {
    let (rpc, driver) = rpc::channel(transport, config.max_frame_length);
    let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
    let runtime = tokio::runtime::Handle::current();
    let session = Session {
      inner: Arc::new(SessionInner {
        id,
        broker: ConnectionBroker::new(config.correlation_ids.build()),
        config,
        connector,
        runtime: runtime.clone(),
        rpc,
        state: Default::default(),
        shutdown: CancellationToken::new(),
        terminated: CancellationToken::new(),
      }),
    };
    // The version call is the first frame on the wire, ahead of anything a caller issues
    let handshake = session.clone();
    negotiation::announce_version(
      &session.inner.rpc,
      session.inner.config.protocol_version,
      move |result| match result {
        Ok(()) => handshake.mark_ready(),
        Err(e) => {
          tracing::warn!(session = handshake.id(), error = %e, "Version handshake failed; closing session");
          handshake.state().failure = Some(SessionError::Handshake(e));
          handshake.close();
        }
      },
    );
    let span = tracing::debug_span!("session", id);
    runtime.spawn(session.clone().run(driver).instrument(span));
    session
  }

  async fn run(self, driver: RpcDriver) {
    tracing::debug!("session started");
    match driver.run(&self, self.inner.shutdown.clone()).await {
      Ok(stream) => self.begin_streaming(stream),
      Err(RpcError::Closed) => tracing::debug!("session transport closed"),
      Err(e) => tracing::warn!(error = %e, "Session ended with error"),
    }
    self.teardown();
    self.inner.terminated.cancel();
    tracing::debug!("session finished");
  }

  fn state(&self) -> MutexGuard<'_, SessionState> {
    self.inner.state.lock().expect("Mutex poisoned")
  }

  pub fn id(&self) -> u64 {
    self.inner.id
  }

  pub fn config(&self) -> &Arc<GatewayConfig> {
    &self.inner.config
  }

  pub(crate) fn rpc(&self) -> &RpcChannel {
    &self.inner.rpc
  }

  pub(crate) fn broker(&self) -> &ConnectionBroker {
    &self.inner.broker
  }

  pub fn is_ready(&self) -> bool {
    self.state().ready
  }

  pub fn is_streaming(&self) -> bool {
    self.state().streaming
  }

  pub fn is_closed(&self) -> bool {
    self.state().closed
  }

  /// Identity stored by the last successful authentication
  pub fn public_id(&self) -> Option<PublicId> {
    self.state().public_id.clone()
  }

  pub fn app_id(&self) -> Option<AppId> {
    self.state().app_id.clone()
  }

  /// Number of outgoing connection attempts still waiting on the gateway
  pub fn pending_count(&self) -> usize {
    self.inner.broker.len()
  }

  /// Runs `callback` once the handshake completes, or now if it already has
  ///
  /// Callbacks run in registration order. A session that closes before becoming ready drops them.
  pub fn on_ready<F>(&self, callback: F)
  where
    F: FnOnce() + Send + 'static,
  {
    let mut state = self.state();
    if state.ready {
      drop(state);
      callback();
    } else if !state.closed {
      state.ready_callbacks.push(Box::new(callback));
    }
  }

  /// Waits for the handshake to complete
  pub async fn ready(&self) -> Result<(), SessionError> {
    let (send, recv) = oneshot::channel();
    self.on_ready(move || {
      let _ = send.send(());
    });
    recv
      .await
      .map_err(|_| self.state().failure.clone().unwrap_or(SessionError::Closed))
  }

  fn mark_ready(&self) {
    let callbacks = {
      let mut state = self.state();
      if state.closed {
        return;
      }
      state.ready = true;
      std::mem::take(&mut state.ready_callbacks)
    };
    tracing::debug!(callbacks = callbacks.len(), "session ready");
    for callback in callbacks {
      callback();
    }
  }

  /// Registers a handler consulted, in registration order, for each inbound connection
  pub fn on_incoming_connection<F>(&self, handler: F)
  where
    F: Fn(&IncomingConnection) + Send + Sync + 'static,
  {
    self.state().handlers.push(Arc::new(handler));
  }

  pub(crate) fn incoming_handlers(&self) -> Vec<IncomingHandler> {
    self.state().handlers.clone()
  }

  /// Registers `public_id` under `app_id`, returning the secret the gateway issues for it
  #[tracing::instrument(level = "debug", skip(self, registration_key), fields(session = self.inner.id), err)]
  pub async fn register(
    &self,
    app_id: AppId,
    public_id: PublicId,
    registration_key: Vec<u8>,
  ) -> Result<Vec<u8>, SessionError> {
    if !self.is_ready() {
      return Err(SessionError::NotReady);
    }
    let reply = self
      .inner
      .rpc
      .call(GatewayRequest::Register {
        app_id,
        public_id,
        registration_key,
      })
      .await?;
    reply.ok_or(SessionError::UnexpectedReply("register"))
  }

  /// Authenticates as `public_id`; on success the session assumes that identity
  #[tracing::instrument(level = "debug", skip(self, secret_key), fields(session = self.inner.id), err)]
  pub async fn authenticate(
    &self,
    app_id: AppId,
    public_id: PublicId,
    secret_key: Vec<u8>,
  ) -> Result<(), SessionError> {
    if !self.is_ready() {
      return Err(SessionError::NotReady);
    }
    let (send, recv) = oneshot::channel();
    let session = self.clone();
    let request = GatewayRequest::Authenticate {
      app_id: app_id.clone(),
      public_id: public_id.clone(),
      secret_key,
    };
    // Identity is stored on the dispatch task so that notifications after the reply see it
    self.inner.rpc.call_with(request, move |reply| {
      let result = match reply {
        Ok(_) => {
          let mut state = session.state();
          state.app_id = Some(app_id);
          state.public_id = Some(public_id);
          Ok(())
        }
        Err(e) => Err(SessionError::from(e)),
      };
      let _ = send.send(result);
    });
    recv.await.unwrap_or(Err(SessionError::Closed))
  }

  /// Requests a connection to `target`, resolving once the gateway brokers it
  pub fn connect_to<T: Into<PublicId>>(&self, target: T) -> Connecting {
    let target = target.into();
    if self.is_closed() {
      let (send, recv) = oneshot::channel();
      let _ = send.send(Err(ConnectError::SessionClosed));
      return Connecting::new(recv);
    }
    self.inner.broker.connect_to(&self.inner.rpc, target)
  }

  /// Ends the session; outstanding operations fail with a closed-session error
  pub fn close(&self) {
    self.inner.shutdown.cancel();
  }

  /// Waits until the session's background task has finished
  pub async fn closed(&self) {
    self.inner.terminated.cancelled().await
  }

  /// Opens the dedicated session that will carry `accepting`, delivering failures to its completion
  pub(crate) fn spawn_dedicated(&self, accepting: AcceptingConnection) {
    let config = Arc::clone(&self.inner.config);
    let connector = Arc::clone(&self.inner.connector);
    let span = tracing::debug_span!(
      "accept",
      parent_session = self.inner.id,
      connection_id = %accepting.connection_id
    );
    self.inner.runtime.spawn(
      async move {
        match Session::connect(config, connector).await {
          Ok(dedicated) => {
            tracing::debug!(session = dedicated.id(), "dedicated session opened");
            let accepting_session = dedicated.clone();
            dedicated.on_ready(move || accepting_session.begin_accept(accepting));
          }
          Err(e) => {
            tracing::warn!(error = %e, "Failed to open dedicated session");
            let _ = accepting.completion.send(Err(ConnectError::Session(e)));
          }
        }
      }
      .instrument(span),
    );
  }

  fn begin_accept(&self, accepting: AcceptingConnection) {
    let connection_id = accepting.connection_id.clone();
    {
      let mut state = self.state();
      if state.closed {
        drop(state);
        let _ = accepting.completion.send(Err(ConnectError::SessionClosed));
        return;
      }
      if let Err(refused) = state.handoff.begin(accepting) {
        tracing::warn!(
          connection_id = %refused.connection_id,
          "Session is already accepting a connection; ignoring"
        );
        return;
      }
    }
    let session = self.clone();
    self.inner.rpc.call_with(
      GatewayRequest::AcceptConnection { connection_id },
      move |reply| {
        let reply = match reply {
          Ok(_) => Ok(()),
          Err(RpcError::Remote(message)) => Err(message),
          // Transport loss is reported to the accept by teardown
          Err(_) => return,
        };
        let step = session.state().handoff.accept_returned(reply);
        session.apply_handoff_step(step);
      },
    );
  }

  fn apply_handoff_step(&self, step: HandoffStep) {
    match step {
      HandoffStep::Wait => {}
      HandoffStep::Ignored => tracing::debug!("handoff signal ignored"),
      HandoffStep::Halt => {
        tracing::debug!("both handoff signals received; halting signaling");
        self.state().streaming = true;
        self.inner.rpc.halt();
      }
      HandoffStep::Fail(completion, error) => {
        tracing::debug!(error = %error, "handoff abandoned");
        let _ = completion.send(Err(error));
        self.close();
      }
    }
  }

  fn begin_streaming(&self, stream: WrappedStream) {
    let accepting = self.state().handoff.take_streaming();
    match accepting {
      Some(accepting) => {
        tracing::debug!(connection_id = %accepting.connection_id, remote = %accepting.remote_id, "streaming");
        let remote = RemoteStream::from_parts(stream, accepting.remote_id);
        if accepting.completion.send(Ok(remote)).is_err() {
          tracing::debug!("accepted stream was no longer awaited; dropping it");
        }
      }
      None => tracing::warn!("Signaling halted without a connection to hand off"),
    }
  }

  fn teardown(&self) {
    let (abandoned, dropped_callbacks) = {
      let mut state = self.state();
      state.closed = true;
      (
        state.handoff.abandon(),
        std::mem::take(&mut state.ready_callbacks),
      )
    };
    // Callbacks may own completions; dropping them outside the lock resolves those as closed
    drop(dropped_callbacks);
    if let Some(accepting) = abandoned {
      let _ = accepting.completion.send(Err(ConnectError::SessionClosed));
    }
    self.inner.broker.fail_all(ConnectError::SessionClosed);
  }
}

impl NotificationHandler for Session {
  fn handle_notification(&self, notification: Notification) {
    match notification {
      Notification::IncomingConnection {
        connection_id,
        correlation_id,
        remote_id,
      } => incoming::arbitrate(self, connection_id, correlation_id, remote_id),
      Notification::InitializeConnection { connection_id } => {
        let step = self.state().handoff.initialize(&connection_id);
        self.apply_handoff_step(step);
      }
      Notification::ErrorConnection {
        connection_id,
        message,
      } => {
        tracing::debug!(%connection_id, %message, "gateway reported connection error");
        let step = self.state().handoff.error(&connection_id, message);
        self.apply_handoff_step(step);
      }
    }
  }
}
