// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Request/reply signaling over a framed byte stream.
//!
//! An [`RpcChannel`] issues calls; its paired [`RpcDriver`] owns the stream, writes queued calls,
//! and dispatches inbound frames one at a time. Reply callbacks and notifications both run on the
//! driver's task, in arrival order. Once [`RpcChannel::halt`] is requested from that task, the
//! driver stops before reading another frame and hands the untouched stream back.
use std::sync::{
  atomic::{AtomicU64, Ordering},
  Arc,
};

use dashmap::DashMap;
use futures::future::{Future, FutureExt};
use tokio::{
  io::{ReadHalf, WriteHalf},
  sync::{mpsc, oneshot},
};
use tokio_util::sync::CancellationToken;

use crate::util::{
  framed::{self, JsonReadError, JsonWriteError},
  tunnel_stream::WrappedStream,
};

use super::messages::{ClientFrame, GatewayFrame, GatewayRequest, Notification};

pub type ReplyResult = Result<Option<Vec<u8>>, RpcError>;
type ReplyCallback = Box<dyn FnOnce(ReplyResult) + Send + Sync + 'static>;
type PendingReplies = DashMap<u64, ReplyCallback>;

#[derive(thiserror::Error, Debug, Clone)]
pub enum RpcError {
  #[error("Gateway refused the call: {0}")]
  Remote(String),
  #[error("Signaling channel closed")]
  Closed,
  #[error("Signaling halted; the channel now carries a peer stream")]
  Halted,
  #[error("Signaling protocol violation: {0}")]
  ProtocolViolation(String),
  #[error("Signaling transport failure: {0}")]
  Transport(Arc<std::io::Error>),
}

impl From<JsonReadError> for RpcError {
  fn from(e: JsonReadError) -> Self {
    match e {
      JsonReadError::Read(read_error) if read_error.is_clean_eof() => RpcError::Closed,
      JsonReadError::Read(framed::ReadError::UnexpectedEnd { error, .. }) => {
        RpcError::Transport(Arc::new(error))
      }
      JsonReadError::Read(max_length @ framed::ReadError::MaxLengthExceeded { .. }) => {
        RpcError::ProtocolViolation(max_length.to_string())
      }
      JsonReadError::Deserialization(e) => RpcError::ProtocolViolation(e.to_string()),
    }
  }
}

impl From<JsonWriteError> for RpcError {
  fn from(e: JsonWriteError) -> Self {
    match e {
      JsonWriteError::Write(framed::WriteError::UnexpectedEnd(error)) => {
        RpcError::Transport(Arc::new(error))
      }
      other => RpcError::ProtocolViolation(other.to_string()),
    }
  }
}

/// Receives gateway notifications on the driver's task
pub trait NotificationHandler: Send + Sync {
  fn handle_notification(&self, notification: Notification);
}

pub struct RpcChannel {
  outbound: mpsc::UnboundedSender<ClientFrame>,
  pending: Arc<PendingReplies>,
  next_call_id: AtomicU64,
  halt: CancellationToken,
}

pub struct RpcDriver {
  stream: WrappedStream,
  outbound: mpsc::UnboundedReceiver<ClientFrame>,
  pending: Arc<PendingReplies>,
  halt: CancellationToken,
  max_frame_length: Option<usize>,
}

pub fn channel(stream: WrappedStream, max_frame_length: Option<usize>) -> (RpcChannel, RpcDriver) {
  let (outbound_send, outbound_recv) = mpsc::unbounded_channel();
  let pending: Arc<PendingReplies> = Default::default();
  let halt = CancellationToken::new();
  (
    RpcChannel {
      outbound: outbound_send,
      pending: Arc::clone(&pending),
      next_call_id: AtomicU64::new(0),
      halt: halt.clone(),
    },
    RpcDriver {
      stream,
      outbound: outbound_recv,
      pending,
      halt,
      max_frame_length,
    },
  )
}

impl RpcChannel {
  /// Queues a call; `on_reply` runs exactly once, with the reply or the reason none will come
  ///
  /// `on_reply` may run inline when the channel is already closed, so callers must not hold locks
  /// that the callback takes.
  pub fn call_with<F>(&self, request: GatewayRequest, on_reply: F)
  where
    F: FnOnce(ReplyResult) + Send + Sync + 'static,
  {
    if self.halt.is_cancelled() {
      on_reply(Err(RpcError::Halted));
      return;
    }
    let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
    tracing::trace!(id, method = request.method(), "call");
    self.pending.insert(id, Box::new(on_reply));
    if self.outbound.send(ClientFrame::Call { id, request }).is_err() {
      // The driver has already drained the pending table, or is about to; whoever removes wins
      if let Some((_, on_reply)) = self.pending.remove(&id) {
        on_reply(Err(RpcError::Closed));
      }
    }
  }

  pub fn call(&self, request: GatewayRequest) -> impl Future<Output = ReplyResult> + Send + 'static {
    let (send, recv) = oneshot::channel();
    self.call_with(request, move |result| {
      let _ = send.send(result);
    });
    recv.map(|result| result.unwrap_or(Err(RpcError::Closed)))
  }

  /// Stops dispatch after the frame currently being handled
  pub fn halt(&self) {
    self.halt.cancel();
  }

  pub fn is_halted(&self) -> bool {
    self.halt.is_cancelled()
  }

  pub fn outstanding_calls(&self) -> usize {
    self.pending.len()
  }
}

impl RpcDriver {
  /// Dispatches frames until halted, closed, or failed.
  ///
  /// Returns the reassembled stream when halted; every reply still outstanding at exit is failed.
  pub async fn run<H>(self, handler: &H, shutdown: CancellationToken) -> Result<WrappedStream, RpcError>
  where
    H: NotificationHandler + ?Sized,
  {
    let RpcDriver {
      stream,
      outbound,
      pending,
      halt,
      max_frame_length,
    } = self;
    let (mut reader, writer) = tokio::io::split(stream);
    let stop = shutdown.child_token();
    let write_task = tokio::task::spawn(write_loop(
      writer,
      outbound,
      stop.clone(),
      max_frame_length,
    ));

    let read_result = read_loop(
      &mut reader,
      &pending,
      handler,
      &halt,
      &stop,
      max_frame_length,
    )
    .await;
    stop.cancel();

    let (writer, write_result) = match write_task.await {
      Ok((writer, write_result)) => (Some(writer), write_result),
      Err(join_error) if join_error.is_panic() => std::panic::resume_unwind(join_error.into_panic()),
      Err(_cancelled) => (None, Err(RpcError::Closed)),
    };

    let exit = match (read_result, write_result, writer) {
      (Ok(()), Ok(()), Some(writer)) => Ok(reader.unsplit(writer)),
      // A failed write stops the reader; report the write failure rather than the stop
      (_, Err(write_error), _) => Err(write_error),
      (Err(read_error), _, _) => Err(read_error),
      (Ok(()), Ok(()), None) => Err(RpcError::Closed),
    };

    let reason = match &exit {
      Ok(_) => RpcError::Halted,
      Err(e) => e.clone(),
    };
    let outstanding: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in outstanding {
      if let Some((_, on_reply)) = pending.remove(&id) {
        on_reply(Err(reason.clone()));
      }
    }
    exit
  }
}

async fn read_loop<H>(
  reader: &mut ReadHalf<WrappedStream>,
  pending: &PendingReplies,
  handler: &H,
  halt: &CancellationToken,
  stop: &CancellationToken,
  max_frame_length: Option<usize>,
) -> Result<(), RpcError>
where
  H: NotificationHandler + ?Sized,
{
  loop {
    if halt.is_cancelled() {
      tracing::debug!("signaling halted");
      return Ok(());
    }
    let frame: GatewayFrame = tokio::select! {
      biased;
      _ = stop.cancelled() => return Err(RpcError::Closed),
      frame = framed::read_framed_json(&mut *reader, max_frame_length) => frame?,
    };
    match frame {
      GatewayFrame::Reply { id, result } => match pending.remove(&id) {
        Some((_, on_reply)) => on_reply(result.into_result().map_err(RpcError::Remote)),
        None => {
          tracing::error!(id, "Gateway replied to a call that was never made");
          return Err(RpcError::ProtocolViolation(format!(
            "reply for unknown call {}",
            id
          )));
        }
      },
      GatewayFrame::IncomingConnection {
        connection_id,
        correlation_id,
        remote_id,
      } => handler.handle_notification(Notification::IncomingConnection {
        connection_id,
        correlation_id,
        remote_id,
      }),
      GatewayFrame::InitializeConnection { connection_id } => {
        handler.handle_notification(Notification::InitializeConnection { connection_id })
      }
      GatewayFrame::ErrorConnection {
        connection_id,
        message,
      } => handler.handle_notification(Notification::ErrorConnection {
        connection_id,
        message,
      }),
    }
  }
}

async fn write_loop(
  mut writer: WriteHalf<WrappedStream>,
  mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
  stop: CancellationToken,
  max_frame_length: Option<usize>,
) -> (WriteHalf<WrappedStream>, Result<(), RpcError>) {
  let result = loop {
    let frame = tokio::select! {
      biased;
      _ = stop.cancelled() => break Ok(()),
      frame = outbound.recv() => match frame {
        Some(frame) => frame,
        None => break Ok(()),
      },
    };
    if let Err(e) = framed::write_framed_json(&mut writer, &frame, max_frame_length).await {
      tracing::warn!(error = %e, "Signaling write failed");
      stop.cancel();
      break Err(RpcError::from(e));
    }
  };
  (writer, result)
}
