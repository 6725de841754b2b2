// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Outgoing connection attempts waiting for the gateway to match them.
use std::{
  future::Future,
  pin::Pin,
  sync::Arc,
  task::{Context, Poll},
};

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::oneshot;

use super::{Completion, ConnectError};
use crate::common::{
  protocol::{CorrelationId, CorrelationIdGenerator, GatewayRequest, PublicId, RpcChannel},
  remote_stream::RemoteStream,
};

pub struct PendingConnect {
  pub target: PublicId,
  pub completion: Completion,
}

#[derive(Clone)]
pub struct ConnectionBroker {
  pending: Arc<DashMap<CorrelationId, PendingConnect>>,
  ids: Arc<dyn CorrelationIdGenerator + Send + Sync>,
}

impl ConnectionBroker {
  pub fn new(ids: Arc<dyn CorrelationIdGenerator + Send + Sync>) -> Self {
    Self {
      pending: Default::default(),
      ids,
    }
  }

  /// Records an attempt under a fresh correlation id, drawing again whenever the id is taken
  pub fn insert(&self, target: PublicId, completion: Completion) -> CorrelationId {
    let pending = PendingConnect { target, completion };
    loop {
      let id = self.ids.next();
      match self.pending.entry(id) {
        Entry::Vacant(vacant) => {
          vacant.insert(pending);
          return id;
        }
        Entry::Occupied(_) => {
          tracing::trace!(correlation_id = %id, "correlation id in use, drawing another");
        }
      }
    }
  }

  pub fn remove(&self, id: &CorrelationId) -> Option<PendingConnect> {
    self.pending.remove(id).map(|(_, pending)| pending)
  }

  /// Resolves every outstanding attempt with `error`
  pub fn fail_all(&self, error: ConnectError) {
    let ids: Vec<CorrelationId> = self.pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
      if let Some(pending) = self.remove(&id) {
        let _ = pending.completion.send(Err(error.clone()));
      }
    }
  }

  pub fn len(&self) -> usize {
    self.pending.len()
  }

  pub fn is_empty(&self) -> bool {
    self.pending.is_empty()
  }

  /// Asks the gateway to connect us to `target`
  ///
  /// The attempt stays pending until the gateway's incoming-connection notification claims it, the
  /// gateway refuses it, or the session is torn down.
  pub fn connect_to(&self, rpc: &RpcChannel, target: PublicId) -> Connecting {
    let (completion, receiver) = oneshot::channel();
    let correlation_id = self.insert(target.clone(), completion);
    tracing::debug!(%correlation_id, target = %target, "requesting connection");
    let broker = self.clone();
    rpc.call_with(
      GatewayRequest::ConnectTo {
        public_id: target,
        correlation_id,
      },
      move |reply| {
        if let Err(e) = reply {
          if let Some(pending) = broker.remove(&correlation_id) {
            tracing::debug!(%correlation_id, error = %e, "connection request failed");
            let _ = pending.completion.send(Err(ConnectError::from_rpc(e)));
          }
        }
      },
    );
    Connecting {
      correlation_id: Some(correlation_id),
      receiver,
    }
  }
}

/// Resolves to the stream once a requested or accepted connection is established
#[must_use = "futures do nothing unless polled"]
pub struct Connecting {
  correlation_id: Option<CorrelationId>,
  receiver: oneshot::Receiver<Result<RemoteStream, ConnectError>>,
}

impl Connecting {
  pub(crate) fn new(receiver: oneshot::Receiver<Result<RemoteStream, ConnectError>>) -> Self {
    Self {
      correlation_id: None,
      receiver,
    }
  }

  /// The correlation id, for attempts started with `connect_to`
  pub fn correlation_id(&self) -> Option<CorrelationId> {
    self.correlation_id
  }
}

impl Future for Connecting {
  type Output = Result<RemoteStream, ConnectError>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    Pin::new(&mut self.receiver)
      .poll(cx)
      .map(|result| result.unwrap_or(Err(ConnectError::SessionClosed)))
  }
}

impl std::fmt::Debug for Connecting {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connecting")
      .field("correlation_id", &self.correlation_id)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use std::collections::HashSet;
  use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
  };

  use tokio::sync::oneshot;

  use super::ConnectionBroker;
  use crate::common::{
    protocol::{CorrelationId, CorrelationIdGenerator, PublicId},
    session::ConnectError,
  };

  /// Yields each scripted id in turn, then counts upward from the last
  struct Scripted {
    ids: Vec<u64>,
    calls: AtomicUsize,
  }

  impl CorrelationIdGenerator for Scripted {
    fn next(&self) -> CorrelationId {
      let call = self.calls.fetch_add(1, Ordering::SeqCst);
      let last = self.ids.len() - 1;
      CorrelationId::new(self.ids[call.min(last)] + call.saturating_sub(last) as u64)
    }
  }

  #[test]
  fn collisions_draw_again() {
    let broker = ConnectionBroker::new(Arc::new(Scripted {
      ids: vec![7, 7, 7, 8],
      calls: AtomicUsize::new(0),
    }));
    let (first, _r1) = oneshot::channel();
    let (second, _r2) = oneshot::channel();
    assert_eq!(broker.insert(PublicId::new("bob"), first).inner(), 7);
    assert_eq!(broker.insert(PublicId::new("bob"), second).inner(), 8);
    assert_eq!(broker.len(), 2);
    assert_eq!(
      broker.remove(&CorrelationId::new(7)).unwrap().target,
      PublicId::new("bob")
    );
    assert!(broker.remove(&CorrelationId::new(7)).is_none());
  }

  /// Hands out every id twice in a row, so concurrent inserts race for the same slot
  struct Doubled {
    calls: AtomicU64,
  }

  impl CorrelationIdGenerator for Doubled {
    fn next(&self) -> CorrelationId {
      CorrelationId::new(self.calls.fetch_add(1, Ordering::SeqCst) / 2 % 32)
    }
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn concurrent_inserts_get_distinct_ids() {
    let generator = Arc::new(Doubled {
      calls: AtomicU64::new(0),
    });
    let broker = ConnectionBroker::new(generator.clone());
    let start = Arc::new(tokio::sync::Barrier::new(32));
    let tasks: Vec<_> = (0..32)
      .map(|_| {
        let broker = broker.clone();
        let start = Arc::clone(&start);
        tokio::spawn(async move {
          start.wait().await;
          let (completion, receiver) = oneshot::channel();
          (broker.insert(PublicId::new("bob"), completion), receiver)
        })
      })
      .collect();
    let mut ids = HashSet::new();
    let mut receivers = Vec::new();
    for task in tasks {
      let (id, receiver) = task.await.unwrap();
      assert!(ids.insert(id), "duplicate correlation id {}", id);
      receivers.push(receiver);
    }
    assert_eq!(broker.len(), 32);
    assert_eq!(ids, (0..32).map(CorrelationId::new).collect::<HashSet<_>>());
    // Every id but the last was drawn a second time and refused
    assert!(generator.calls.load(Ordering::SeqCst) >= 63);

    broker.fail_all(ConnectError::SessionClosed);
    assert!(broker.is_empty());
    for receiver in receivers {
      assert!(matches!(
        receiver.await.unwrap(),
        Err(ConnectError::SessionClosed)
      ));
    }
  }
}
