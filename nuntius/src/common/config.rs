// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Client-side settings for reaching and speaking to a gateway.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::protocol::{
  negotiation::PROTOCOL_VERSION, CorrelationIdGenerator, MonotonicAtomicGenerator, RandomGenerator,
};

pub const DEFAULT_GATEWAY_ADDRESS: &str = "127.0.0.1:4444";
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationIdSource {
  Random,
  /// Sequential ids starting from zero; predictable, so only suited to testing
  Monotonic,
}

impl Default for CorrelationIdSource {
  fn default() -> Self {
    CorrelationIdSource::Random
  }
}

impl CorrelationIdSource {
  pub fn build(self) -> Arc<dyn CorrelationIdGenerator + Send + Sync> {
    match self {
      CorrelationIdSource::Random => Arc::new(RandomGenerator::new()),
      CorrelationIdSource::Monotonic => Arc::new(MonotonicAtomicGenerator::new(0)),
    }
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
  pub gateway_address: String,
  pub protocol_version: u8,
  pub max_frame_length: Option<usize>,
  pub correlation_ids: CorrelationIdSource,
  pub nodelay: bool,
}

impl Default for GatewayConfig {
  fn default() -> Self {
    Self {
      gateway_address: String::from(DEFAULT_GATEWAY_ADDRESS),
      protocol_version: PROTOCOL_VERSION,
      max_frame_length: Some(DEFAULT_MAX_FRAME_LENGTH),
      correlation_ids: CorrelationIdSource::default(),
      nodelay: true,
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
  #[error("Failed to read config file {path:?}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Failed to parse config file {path:?}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
  #[error("Invalid gateway address {0:?}")]
  InvalidAddress(String),
  #[error("Maximum frame length must be set and nonzero")]
  InvalidMaxFrameLength,
}

impl GatewayConfig {
  /// Loads a JSON config file; omitted fields keep their defaults
  pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let config: GatewayConfig =
      serde_json::from_slice(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
      })?;
    config.validate()?;
    Ok(config)
  }

  pub fn with_gateway_address<T: Into<String>>(mut self, address: T) -> Self {
    self.gateway_address = address.into();
    self
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.gateway_address.trim().is_empty() {
      return Err(ConfigError::InvalidAddress(self.gateway_address.clone()));
    }
    // Frame lengths are chosen by the gateway and size our read buffers
    match self.max_frame_length {
      Some(length) if length > 0 => Ok(()),
      _ => Err(ConfigError::InvalidMaxFrameLength),
    }
  }
}
