// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Transition of a dedicated session from signaling to streaming.
//!
//! Two signals must both arrive before the transport carries peer bytes: the reply to our
//! `accept_connection` call, and the gateway's `initialize_connection` notification. They race, so
//! the machine joins them in either order.
use super::{Completion, ConnectError};
use crate::common::protocol::{ConnectionId, PublicId};

/// The one connection a dedicated session is accepting
pub struct AcceptingConnection {
  pub connection_id: ConnectionId,
  pub remote_id: PublicId,
  pub completion: Completion,
}

impl std::fmt::Debug for AcceptingConnection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("AcceptingConnection")
      .field("connection_id", &self.connection_id)
      .field("remote_id", &self.remote_id)
      .finish_non_exhaustive()
  }
}

#[derive(Debug)]
pub enum StreamHandoff {
  Idle,
  AwaitingBoth(AcceptingConnection),
  AcceptReturned(AcceptingConnection),
  Initialized(AcceptingConnection),
  /// Both signals seen; holds the connection until the dispatcher releases the transport
  Streaming(AcceptingConnection),
  Finished,
}

/// What the session must do after feeding a signal into the handoff
#[derive(Debug)]
pub enum HandoffStep {
  Wait,
  /// Stop signaling dispatch so the transport can be taken over
  Halt,
  Fail(Completion, ConnectError),
  Ignored,
}

impl Default for StreamHandoff {
  fn default() -> Self {
    StreamHandoff::Idle
  }
}

impl StreamHandoff {
  /// Starts accepting; hands the connection back if one is already in progress or done
  pub fn begin(&mut self, accepting: AcceptingConnection) -> Result<(), AcceptingConnection> {
    match self {
      StreamHandoff::Idle => {
        *self = StreamHandoff::AwaitingBoth(accepting);
        Ok(())
      }
      _ => Err(accepting),
    }
  }

  pub fn accepting(&self) -> Option<&AcceptingConnection> {
    match self {
      StreamHandoff::AwaitingBoth(a)
      | StreamHandoff::AcceptReturned(a)
      | StreamHandoff::Initialized(a)
      | StreamHandoff::Streaming(a) => Some(a),
      StreamHandoff::Idle | StreamHandoff::Finished => None,
    }
  }

  pub fn is_streaming(&self) -> bool {
    matches!(self, StreamHandoff::Streaming(_))
  }

  pub fn accept_returned(&mut self, reply: Result<(), String>) -> HandoffStep {
    match (std::mem::replace(self, StreamHandoff::Finished), reply) {
      (StreamHandoff::AwaitingBoth(a), Ok(())) => {
        *self = StreamHandoff::AcceptReturned(a);
        HandoffStep::Wait
      }
      (StreamHandoff::Initialized(a), Ok(())) => {
        *self = StreamHandoff::Streaming(a);
        HandoffStep::Halt
      }
      (StreamHandoff::AwaitingBoth(a), Err(message))
      | (StreamHandoff::Initialized(a), Err(message)) => {
        HandoffStep::Fail(a.completion, ConnectError::Gateway(message))
      }
      (other, _) => {
        *self = other;
        HandoffStep::Ignored
      }
    }
  }

  pub fn initialize(&mut self, connection_id: &ConnectionId) -> HandoffStep {
    if !self.is_for(connection_id) {
      return HandoffStep::Ignored;
    }
    match std::mem::replace(self, StreamHandoff::Finished) {
      StreamHandoff::AwaitingBoth(a) => {
        *self = StreamHandoff::Initialized(a);
        HandoffStep::Wait
      }
      StreamHandoff::AcceptReturned(a) => {
        *self = StreamHandoff::Streaming(a);
        HandoffStep::Halt
      }
      other => {
        *self = other;
        HandoffStep::Ignored
      }
    }
  }

  pub fn error(&mut self, connection_id: &ConnectionId, message: String) -> HandoffStep {
    if !self.is_for(connection_id) {
      return HandoffStep::Ignored;
    }
    match std::mem::replace(self, StreamHandoff::Finished) {
      StreamHandoff::AwaitingBoth(a)
      | StreamHandoff::AcceptReturned(a)
      | StreamHandoff::Initialized(a) => {
        HandoffStep::Fail(a.completion, ConnectError::Rejected(message))
      }
      other => {
        *self = other;
        HandoffStep::Ignored
      }
    }
  }

  /// Claims the connection once streaming; the handoff is finished afterward
  pub fn take_streaming(&mut self) -> Option<AcceptingConnection> {
    match std::mem::replace(self, StreamHandoff::Finished) {
      StreamHandoff::Streaming(a) => Some(a),
      other => {
        *self = other;
        None
      }
    }
  }

  /// Gives up on whatever connection is in progress
  pub fn abandon(&mut self) -> Option<AcceptingConnection> {
    match std::mem::replace(self, StreamHandoff::Finished) {
      StreamHandoff::Idle => {
        *self = StreamHandoff::Idle;
        None
      }
      StreamHandoff::Finished => None,
      StreamHandoff::AwaitingBoth(a)
      | StreamHandoff::AcceptReturned(a)
      | StreamHandoff::Initialized(a)
      | StreamHandoff::Streaming(a) => Some(a),
    }
  }

  fn is_for(&self, connection_id: &ConnectionId) -> bool {
    self
      .accepting()
      .map(|a| &a.connection_id == connection_id)
      .unwrap_or(false)
  }
}

#[cfg(test)]
mod tests {
  use tokio::sync::oneshot;

  use super::{AcceptingConnection, HandoffStep, StreamHandoff};
  use crate::common::{
    protocol::{ConnectionId, PublicId},
    remote_stream::RemoteStream,
    session::ConnectError,
  };

  fn accepting(
    id: &str,
  ) -> (
    AcceptingConnection,
    oneshot::Receiver<Result<RemoteStream, ConnectError>>,
  ) {
    let (completion, recv) = oneshot::channel();
    (
      AcceptingConnection {
        connection_id: ConnectionId::new(id),
        remote_id: PublicId::new("alice"),
        completion,
      },
      recv,
    )
  }

  #[test]
  fn accept_reply_then_initialize() {
    let mut handoff = StreamHandoff::default();
    let (a, _recv) = accepting("c1");
    handoff.begin(a).unwrap();
    assert!(matches!(handoff.accept_returned(Ok(())), HandoffStep::Wait));
    assert!(!handoff.is_streaming());
    assert!(matches!(
      handoff.initialize(&ConnectionId::new("c1")),
      HandoffStep::Halt
    ));
    assert!(handoff.is_streaming());
    let taken = handoff.take_streaming().unwrap();
    assert_eq!(taken.remote_id, PublicId::new("alice"));
    assert!(matches!(handoff, StreamHandoff::Finished));
  }

  #[test]
  fn initialize_then_accept_reply() {
    let mut handoff = StreamHandoff::default();
    let (a, _recv) = accepting("c1");
    handoff.begin(a).unwrap();
    assert!(matches!(
      handoff.initialize(&ConnectionId::new("c1")),
      HandoffStep::Wait
    ));
    assert!(matches!(handoff.accept_returned(Ok(())), HandoffStep::Halt));
    assert_eq!(
      handoff.take_streaming().unwrap().connection_id,
      ConnectionId::new("c1")
    );
  }

  #[test]
  fn second_begin_is_refused() {
    let mut handoff = StreamHandoff::default();
    let (first, _r1) = accepting("c1");
    let (second, _r2) = accepting("c2");
    handoff.begin(first).unwrap();
    let returned = handoff.begin(second).unwrap_err();
    assert_eq!(returned.connection_id, ConnectionId::new("c2"));
    assert_eq!(
      handoff.accepting().unwrap().connection_id,
      ConnectionId::new("c1")
    );
  }

  #[test]
  fn signals_for_other_connections_are_ignored() {
    let mut handoff = StreamHandoff::default();
    let (a, _recv) = accepting("c1");
    handoff.begin(a).unwrap();
    assert!(matches!(
      handoff.initialize(&ConnectionId::new("other")),
      HandoffStep::Ignored
    ));
    assert!(matches!(
      handoff.error(&ConnectionId::new("other"), "nope".into()),
      HandoffStep::Ignored
    ));
    assert!(matches!(handoff, StreamHandoff::AwaitingBoth(_)));
  }

  #[test]
  fn failures_release_the_completion() {
    let mut handoff = StreamHandoff::default();
    let (a, _recv) = accepting("c1");
    handoff.begin(a).unwrap();
    match handoff.accept_returned(Err("gone".into())) {
      HandoffStep::Fail(_, ConnectError::Gateway(message)) => assert_eq!(message, "gone"),
      other => panic!("unexpected step {:?}", other),
    }
    assert!(handoff.abandon().is_none());

    let mut handoff = StreamHandoff::default();
    let (a, _recv) = accepting("c1");
    handoff.begin(a).unwrap();
    handoff.accept_returned(Ok(()));
    assert!(matches!(
      handoff.error(&ConnectionId::new("c1"), "peer left".into()),
      HandoffStep::Fail(_, ConnectError::Rejected(_))
    ));
    // Late signals after a failure change nothing
    assert!(matches!(
      handoff.initialize(&ConnectionId::new("c1")),
      HandoffStep::Ignored
    ));
  }

  #[test]
  fn abandon_returns_in_progress_connection() {
    let mut handoff = StreamHandoff::default();
    assert!(handoff.abandon().is_none());
    assert!(matches!(handoff, StreamHandoff::Idle));
    let (a, _recv) = accepting("c1");
    handoff.begin(a).unwrap();
    handoff.initialize(&ConnectionId::new("c1"));
    assert!(handoff.abandon().is_some());
    assert!(handoff.accepting().is_none());
  }
}
