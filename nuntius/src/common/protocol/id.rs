// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use serde::{Deserialize, Serialize};

/// Ties an outgoing connect request to the incoming notification that resolves it
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
  pub fn new(inner: u64) -> CorrelationId {
    Self(inner)
  }

  pub fn inner(&self) -> u64 {
    self.0
  }
}

impl From<u64> for CorrelationId {
  fn from(inner: u64) -> Self {
    Self::new(inner)
  }
}

impl From<CorrelationId> for u64 {
  fn from(id: CorrelationId) -> Self {
    id.inner()
  }
}

impl std::fmt::Debug for CorrelationId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("CorrelationId").field(&self.0).finish()
  }
}

impl std::fmt::Display for CorrelationId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    std::fmt::Display::fmt(&self.0, f)
  }
}

/// Source of candidate correlation ids.
///
/// Candidates need not be unique on their own; the pending table rejects occupied ids and asks
/// for another.
pub trait CorrelationIdGenerator {
  fn next(&self) -> CorrelationId;
}

pub struct MonotonicAtomicGenerator {
  next: std::sync::atomic::AtomicU64,
}

impl MonotonicAtomicGenerator {
  pub fn new(next: u64) -> Self {
    Self {
      next: std::sync::atomic::AtomicU64::new(next),
    }
  }

  pub fn next(&self) -> CorrelationId {
    CorrelationId::new(self.next.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
  }
}

impl CorrelationIdGenerator for MonotonicAtomicGenerator {
  fn next(&self) -> CorrelationId {
    MonotonicAtomicGenerator::next(self)
  }
}

/// Draws ids from the v4 UUID random source, keeping the numeric range the gateway expects
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomGenerator;

impl RandomGenerator {
  pub fn new() -> Self {
    Self
  }
}

impl CorrelationIdGenerator for RandomGenerator {
  fn next(&self) -> CorrelationId {
    let (high, _) = uuid::Uuid::new_v4().as_u64_pair();
    // Positive range of a signed 64-bit integer
    CorrelationId::new(high >> 1)
  }
}
