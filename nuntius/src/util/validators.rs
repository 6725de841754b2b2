// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::net::SocketAddr;
use std::path::Path;

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).exists() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

/// Resolves a `host:port` pair, taking the first address produced
pub fn parse_socketaddr(v: &str) -> std::io::Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v).and_then(|mut items| {
    items.next().ok_or_else(|| {
      std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "No addresses were resolved from the given host",
      )
    })
  })
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

/// Identifiers sent to the gateway must be non-empty and free of control characters
pub fn validate_identifier(v: &str) -> Result<(), String> {
  if v.is_empty() {
    Err(String::from("Identifier must not be empty"))
  } else if v.chars().any(char::is_control) {
    Err(String::from("Identifier must not contain control characters"))
  } else {
    Ok(())
  }
}
