// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Length-prefixed frames for the signaling channel.
//!
//! Frames are a big-endian `u32` length followed by exactly that many bytes. Reads never consume
//! past the end of a frame, so whatever follows the last signaling frame on a stream is still
//! available to the next reader untouched.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const U32_SIZE: usize = std::mem::size_of::<u32>();

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NextExpected {
  LengthSpecifier,
  Content { length: usize },
}

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
  #[error("Frame length exceeded expectation of {expected} bytes with {received}")]
  MaxLengthExceeded { expected: usize, received: usize },
  #[error("Unexpected end of frame; expected {expected:?}")]
  UnexpectedEnd {
    expected: NextExpected,
    #[source]
    error: ::std::io::Error,
  },
}

impl ReadError {
  /// True when the stream ended cleanly between frames
  pub fn is_clean_eof(&self) -> bool {
    matches!(
      self,
      ReadError::UnexpectedEnd {
        expected: NextExpected::LengthSpecifier,
        error,
      } if error.kind() == std::io::ErrorKind::UnexpectedEof
    )
  }
}

#[derive(thiserror::Error, Debug)]
pub enum JsonReadError {
  #[error("Failure reading JSON from frame: {0}")]
  Read(#[from] ReadError),
  #[error("Failure deserializing JSON from frame: {0}")]
  Deserialization(#[from] ::serde_json::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum WriteError {
  #[error("Frame write failure: {0:?}")]
  UnexpectedEnd(#[from] ::std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum JsonWriteError {
  #[error("Failure writing JSON into frame: {0}")]
  Write(#[from] WriteError),
  #[error("Failure serializing JSON for frame: {0}")]
  Serialization(#[from] ::serde_json::Error),
  /// Nothing is written to the stream when this is returned.
  #[error("Frame length exceeded expectation of {expected} bytes with {produced}")]
  MaxLengthExceeded { expected: usize, produced: usize },
}

pub async fn read_frame<T: AsyncRead + Unpin>(
  mut s: T,
  max_length: Option<usize>,
) -> Result<Vec<u8>, ReadError> {
  let length = s
    .read_u32()
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::LengthSpecifier,
      error,
    })? as usize;
  if let Some(max_length) = max_length {
    if length > max_length {
      return Err(ReadError::MaxLengthExceeded {
        expected: max_length,
        received: length,
      });
    }
  }
  let mut buffer = vec![0u8; length];
  s.read_exact(buffer.as_mut_slice())
    .await
    .map_err(|error| ReadError::UnexpectedEnd {
      expected: NextExpected::Content { length },
      error,
    })?;
  Ok(buffer)
}

/// Writes the length prefix and content in one buffer, then flushes
pub async fn write_frame<T: AsyncWrite + Unpin>(mut s: T, buffer: &[u8]) -> Result<(), WriteError> {
  let mut framed = Vec::with_capacity(buffer.len() + U32_SIZE);
  framed.extend_from_slice(&(buffer.len() as u32).to_be_bytes());
  framed.extend_from_slice(buffer);
  s.write_all(&framed).await?;
  Ok(s.flush().await?)
}

pub async fn read_framed_json<TStream: AsyncRead + Unpin, TOutput: serde::de::DeserializeOwned>(
  s: TStream,
  max_length: Option<usize>,
) -> Result<TOutput, JsonReadError> {
  let buffer = read_frame(s, max_length).await?;
  Ok(serde_json::from_slice::<TOutput>(&buffer)?)
}

pub async fn write_framed_json<TStream: AsyncWrite + Unpin, TInput: serde::Serialize>(
  s: TStream,
  value: TInput,
  max_length: Option<usize>,
) -> Result<(), JsonWriteError> {
  let buffer = serde_json::to_vec(&value)?;
  if let Some(max_length) = max_length {
    if buffer.len() + U32_SIZE > max_length {
      return Err(JsonWriteError::MaxLengthExceeded {
        expected: max_length,
        produced: buffer.len() + U32_SIZE,
      });
    }
  }
  Ok(write_frame(s, &buffer).await?)
}

#[cfg(test)]
mod tests {
  use super::{read_frame, read_framed_json, write_frame, write_framed_json};
  use super::{JsonWriteError, ReadError};
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  #[tokio::test]
  async fn reads_stop_at_frame_boundary() {
    let (mut near, mut far) = tokio::io::duplex(256);
    write_framed_json(&mut near, &("initialize", 7u32), None)
      .await
      .unwrap();
    near.write_all(b"raw payload").await.unwrap();
    drop(near);

    let frame: (String, u32) = read_framed_json(&mut far, None).await.unwrap();
    assert_eq!(frame, (String::from("initialize"), 7));
    let mut rest = Vec::new();
    far.read_to_end(&mut rest).await.unwrap();
    assert_eq!(&rest, b"raw payload");
  }

  #[tokio::test]
  async fn oversized_frames_are_refused_before_reading_content() {
    let mut buffer = Vec::new();
    write_frame(&mut buffer, &[0u8; 32]).await.unwrap();
    let mut cursor = std::io::Cursor::new(buffer);
    assert!(matches!(
      read_frame(&mut cursor, Some(16)).await,
      Err(ReadError::MaxLengthExceeded {
        expected: 16,
        received: 32
      })
    ));
  }

  #[tokio::test]
  async fn exceeding_maximum_length_is_no_op() {
    let mut buffer: Vec<u8> = Vec::new();
    // a single-character string in JSON is 3 bytes long due to quotes
    assert!(matches!(
      write_framed_json(&mut buffer, "a", Some(std::mem::size_of::<u32>() + 2)).await,
      Err(JsonWriteError::MaxLengthExceeded { .. })
    ));
    assert!(buffer.is_empty());
  }

  #[tokio::test]
  async fn clean_eof_is_distinguished_from_truncation() {
    let mut empty = std::io::Cursor::new(Vec::<u8>::new());
    assert!(read_frame(&mut empty, None)
      .await
      .unwrap_err()
      .is_clean_eof());

    let mut truncated = std::io::Cursor::new(vec![0u8, 0, 0, 9, 1, 2]);
    assert!(!read_frame(&mut truncated, None)
      .await
      .unwrap_err()
      .is_clean_eof());
  }
}
