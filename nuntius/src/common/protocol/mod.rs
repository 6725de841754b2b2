// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Signaling protocol spoken between clients and the gateway.

pub mod id;
pub mod identity;
pub mod messages;
pub mod negotiation;
pub mod rpc;

pub use id::{CorrelationId, CorrelationIdGenerator, MonotonicAtomicGenerator, RandomGenerator};
pub use identity::{AppId, ConnectionId, PublicId};
pub use messages::{GatewayRequest, Notification};
pub use rpc::{NotificationHandler, RpcChannel, RpcDriver, RpcError};
