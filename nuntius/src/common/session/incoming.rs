// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Inbound connection offers, and how each is routed to a single decision.
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::oneshot;

use super::{handoff::AcceptingConnection, Completion, ConnectError, Connecting, Session};
use crate::common::protocol::{ConnectionId, CorrelationId, GatewayRequest, PublicId};

/// A connection the gateway offers to this client; it is accepted or rejected exactly once
pub struct IncomingConnection {
  connection_id: ConnectionId,
  remote_id: PublicId,
  handled: AtomicBool,
  session: Session,
}

impl IncomingConnection {
  pub(crate) fn new(session: Session, connection_id: ConnectionId, remote_id: PublicId) -> Self {
    Self {
      connection_id,
      remote_id,
      handled: AtomicBool::new(false),
      session,
    }
  }

  pub fn connection_id(&self) -> &ConnectionId {
    &self.connection_id
  }

  /// The peer on the other end
  pub fn remote_id(&self) -> &PublicId {
    &self.remote_id
  }

  pub fn is_handled(&self) -> bool {
    self.handled.load(Ordering::Acquire)
  }

  /// Accepts the connection; the returned future resolves to the stream
  pub fn accept(&self) -> Result<Connecting, ConnectError> {
    let (completion, receiver) = oneshot::channel();
    self.accept_with(completion)?;
    Ok(Connecting::new(receiver))
  }

  /// Accepts the connection, resolving `completion` with the stream or the reason it failed
  ///
  /// A fresh session to the gateway is opened to carry the stream.
  pub fn accept_with(&self, completion: Completion) -> Result<(), ConnectError> {
    if self.handled.swap(true, Ordering::AcqRel) {
      return Err(ConnectError::AlreadyHandled);
    }
    tracing::debug!(connection_id = %self.connection_id, remote = %self.remote_id, "accepting connection");
    self.session.spawn_dedicated(AcceptingConnection {
      connection_id: self.connection_id.clone(),
      remote_id: self.remote_id.clone(),
      completion,
    });
    Ok(())
  }

  /// Declines the connection on the session that offered it
  pub fn reject(&self) -> Result<(), ConnectError> {
    if self.handled.swap(true, Ordering::AcqRel) {
      return Err(ConnectError::AlreadyHandled);
    }
    let connection_id = self.connection_id.clone();
    tracing::debug!(%connection_id, remote = %self.remote_id, "rejecting connection");
    self.session.rpc().call_with(
      GatewayRequest::RejectConnection {
        connection_id: connection_id.clone(),
      },
      move |reply| {
        if let Err(e) = reply {
          tracing::debug!(%connection_id, error = %e, "reject was not acknowledged");
        }
      },
    );
    Ok(())
  }
}

impl std::fmt::Debug for IncomingConnection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("IncomingConnection")
      .field("connection_id", &self.connection_id)
      .field("remote_id", &self.remote_id)
      .field("handled", &self.is_handled())
      .finish_non_exhaustive()
  }
}

/// Routes an inbound offer: to our own pending request when we are the requester, otherwise to the
/// application's handlers in registration order until one claims it
pub(super) fn arbitrate(
  session: &Session,
  connection_id: ConnectionId,
  correlation_id: CorrelationId,
  remote_id: PublicId,
) {
  let own_id = session.public_id();
  if own_id.as_ref() == Some(&remote_id) {
    match session.broker().remove(&correlation_id) {
      Some(pending) => {
        tracing::debug!(%correlation_id, %connection_id, target = %pending.target, "matched requested connection");
        let incoming = IncomingConnection::new(session.clone(), connection_id, pending.target);
        if let Err(e) = incoming.accept_with(pending.completion) {
          tracing::error!(error = %e, "Fresh connection could not be accepted");
        }
      }
      None => {
        tracing::warn!(%correlation_id, %connection_id, "No pending request matches the gateway's offer; rejecting");
        let incoming = IncomingConnection::new(session.clone(), connection_id, remote_id);
        let _ = incoming.reject();
      }
    }
    return;
  }

  let incoming = IncomingConnection::new(session.clone(), connection_id, remote_id);
  for handler in session.incoming_handlers() {
    handler(&incoming);
    if incoming.is_handled() {
      return;
    }
  }
  tracing::debug!(connection_id = %incoming.connection_id, remote = %incoming.remote_id, "no handler claimed connection");
  let _ = incoming.reject();
}
