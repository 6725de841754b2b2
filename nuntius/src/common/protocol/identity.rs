// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Names the gateway uses to address applications, peers, and brokered connections.
use std::sync::Arc;

use serde::{Deserializer, Serializer};

macro_rules! shared_name {
  ($(#[$meta:meta])* $name:ident, $debug_name:literal) => {
    $(#[$meta])*
    #[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Clone)]
    #[repr(transparent)]
    pub struct $name(Arc<String>);

    impl $name {
      pub fn new<T: Into<String>>(t: T) -> $name {
        $name(Arc::new(t.into()))
      }

      pub fn raw(&self) -> &str {
        &self.0
      }
    }

    impl serde::Serialize for $name {
      fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
      where
        S: Serializer,
      {
        serializer.serialize_str(&self.0)
      }
    }

    impl<'de> serde::de::Deserialize<'de> for $name {
      fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
      where
        D: Deserializer<'de>,
      {
        let s: String = serde::Deserialize::deserialize(deserializer)?;
        Ok($name::new(s))
      }
    }

    impl From<&str> for $name {
      fn from(s: &str) -> Self {
        $name::new(s)
      }
    }

    impl From<String> for $name {
      fn from(s: String) -> Self {
        $name::new(s)
      }
    }

    impl std::fmt::Debug for $name {
      fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple($debug_name).field(&self.0).finish()
      }
    }

    impl std::fmt::Display for $name {
      fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
      }
    }
  };
}

shared_name!(
  /// The application namespace a client registers and authenticates under
  AppId,
  "AppId"
);

shared_name!(
  /// A client's public identity within an application, used by peers to address it
  PublicId,
  "PublicId"
);

shared_name!(
  /// Gateway-assigned handle for one brokered connection
  ConnectionId,
  "ConnectionId"
);
