// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Signaling frames exchanged with the gateway.
use serde::{Deserialize, Serialize};

use super::{AppId, ConnectionId, CorrelationId, PublicId};

/// Remote calls a client makes against the gateway
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GatewayRequest {
  Version {
    version: u8,
  },
  Register {
    app_id: AppId,
    public_id: PublicId,
    registration_key: Vec<u8>,
  },
  Authenticate {
    app_id: AppId,
    public_id: PublicId,
    secret_key: Vec<u8>,
  },
  ConnectTo {
    public_id: PublicId,
    correlation_id: CorrelationId,
  },
  AcceptConnection {
    connection_id: ConnectionId,
  },
  RejectConnection {
    connection_id: ConnectionId,
  },
}

impl GatewayRequest {
  pub fn method(&self) -> &'static str {
    match self {
      GatewayRequest::Version { .. } => "version",
      GatewayRequest::Register { .. } => "register",
      GatewayRequest::Authenticate { .. } => "authenticate",
      GatewayRequest::ConnectTo { .. } => "connect_to",
      GatewayRequest::AcceptConnection { .. } => "accept_connection",
      GatewayRequest::RejectConnection { .. } => "reject_connection",
    }
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientFrame {
  Call { id: u64, request: GatewayRequest },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
  Ok {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Vec<u8>>,
  },
  Err {
    message: String,
  },
}

impl Reply {
  pub fn ok() -> Self {
    Reply::Ok { payload: None }
  }

  pub fn with_payload(payload: Vec<u8>) -> Self {
    Reply::Ok {
      payload: Some(payload),
    }
  }

  pub fn err<T: Into<String>>(message: T) -> Self {
    Reply::Err {
      message: message.into(),
    }
  }

  pub fn into_result(self) -> Result<Option<Vec<u8>>, String> {
    match self {
      Reply::Ok { payload } => Ok(payload),
      Reply::Err { message } => Err(message),
    }
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatewayFrame {
  Reply {
    id: u64,
    result: Reply,
  },
  IncomingConnection {
    connection_id: ConnectionId,
    correlation_id: CorrelationId,
    remote_id: PublicId,
  },
  InitializeConnection {
    connection_id: ConnectionId,
  },
  ErrorConnection {
    connection_id: ConnectionId,
    message: String,
  },
}

/// Gateway-initiated events, delivered in order on the session that received them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
  IncomingConnection {
    connection_id: ConnectionId,
    correlation_id: CorrelationId,
    remote_id: PublicId,
  },
  InitializeConnection {
    connection_id: ConnectionId,
  },
  ErrorConnection {
    connection_id: ConnectionId,
    message: String,
  },
}

impl From<Notification> for GatewayFrame {
  fn from(notification: Notification) -> Self {
    match notification {
      Notification::IncomingConnection {
        connection_id,
        correlation_id,
        remote_id,
      } => GatewayFrame::IncomingConnection {
        connection_id,
        correlation_id,
        remote_id,
      },
      Notification::InitializeConnection { connection_id } => {
        GatewayFrame::InitializeConnection { connection_id }
      }
      Notification::ErrorConnection {
        connection_id,
        message,
      } => GatewayFrame::ErrorConnection {
        connection_id,
        message,
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::{ClientFrame, GatewayFrame, GatewayRequest, Reply};
  use crate::common::protocol::{ConnectionId, CorrelationId, PublicId};

  #[test]
  fn call_frame_layout() {
    let frame = ClientFrame::Call {
      id: 3,
      request: GatewayRequest::ConnectTo {
        public_id: PublicId::new("bob"),
        correlation_id: CorrelationId::new(99),
      },
    };
    let json = serde_json::to_value(&frame).unwrap();
    assert_eq!(
      json,
      serde_json::json!({
        "kind": "call",
        "id": 3,
        "request": { "connect_to": { "public_id": "bob", "correlation_id": 99 } }
      })
    );
  }

  #[test]
  fn gateway_frames_parse() {
    let reply: GatewayFrame = serde_json::from_value(serde_json::json!({
      "kind": "reply",
      "id": 1,
      "result": { "err": { "message": "unknown peer" } }
    }))
    .unwrap();
    assert_eq!(
      reply,
      GatewayFrame::Reply {
        id: 1,
        result: Reply::err("unknown peer")
      }
    );

    let bare_ok: Reply = serde_json::from_value(serde_json::json!({ "ok": {} })).unwrap();
    assert_eq!(bare_ok.into_result(), Ok(None));

    let incoming: GatewayFrame = serde_json::from_value(serde_json::json!({
      "kind": "incoming_connection",
      "connection_id": "c-7",
      "correlation_id": 5,
      "remote_id": "alice"
    }))
    .unwrap();
    assert_eq!(
      incoming,
      GatewayFrame::IncomingConnection {
        connection_id: ConnectionId::new("c-7"),
        correlation_id: CorrelationId::new(5),
        remote_id: PublicId::new("alice"),
      }
    );
  }
}
