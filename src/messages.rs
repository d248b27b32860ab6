// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed
// licenses.

//! The messages exchanged between two sessions, and their framing.
//!
//! Every message on the wire is an unsigned 32-bit big-endian length prefix
//! followed by that many bytes of bincode-serialized [`SpekeMessage`]. The
//! original implementation wrote a platform `size_t` prefix, which is not
//! portable across peers of different word size or endianness; this codec
//! uses the explicit fixed-width prefix instead.

use crate::{Result, SpekeError, MAX_MESSAGE_SIZE};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A frame payload. The enum representation makes a payload with zero or
/// several variants unrepresentable; undecodable bytes surface as
/// [`SpekeError::Framing`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpekeMessage {
    /// Opens the exchange: the sender's numbered id and public key.
    InitData {
        /// The sender's numbered id.
        id: String,
        /// The sender's public key as minimal big-endian bytes.
        public_key: Vec<u8>,
    },
    /// Proves the sender derived the same encryption key.
    KeyConfirmation {
        /// The sender's key confirmation data.
        data: Vec<u8>,
    },
    /// An application payload authenticated with HMAC.
    SignedData {
        /// HMAC-SHA-256 over `data` under the derived encryption key.
        hmac_signature: Vec<u8>,
        /// The application payload.
        data: Vec<u8>,
    },
}

impl SpekeMessage {
    /// Serializes the message payload.
    ///
    /// # Errors
    ///
    /// Returns [`SpekeError::Framing`] when serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserializes a message payload.
    ///
    /// # Errors
    ///
    /// Returns [`SpekeError::Framing`] when the bytes do not decode to
    /// exactly one variant.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// Writes one length-prefixed frame.
///
/// # Errors
///
/// Returns [`SpekeError::Framing`] for oversized payloads and
/// [`SpekeError::Io`] on transport failure.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &SpekeMessage,
) -> Result<()> {
    let payload = message.to_bytes()?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(SpekeError::Framing(format!(
            "payload of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_MESSAGE_SIZE
        )));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame.
///
/// # Errors
///
/// Returns [`SpekeError::Framing`] for oversized or undecodable frames and
/// [`SpekeError::Io`] on transport failure (including EOF mid-frame).
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<SpekeMessage> {
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix).await?;
    let length = u32::from_be_bytes(prefix) as usize;
    if length > MAX_MESSAGE_SIZE {
        return Err(SpekeError::Framing(format!(
            "frame of {} bytes exceeds the {} byte limit",
            length, MAX_MESSAGE_SIZE
        )));
    }
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    SpekeMessage::from_bytes(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_messages() -> Vec<SpekeMessage> {
        vec![
            SpekeMessage::InitData {
                id: "alice:0".to_owned(),
                public_key: vec![0x04, 0xd2],
            },
            SpekeMessage::KeyConfirmation {
                data: vec![0xaa; 32],
            },
            SpekeMessage::SignedData {
                hmac_signature: vec![0x55; 32],
                data: b"hello".to_vec(),
            },
        ]
    }

    #[test]
    fn test_message_roundtrip() {
        for message in sample_messages() {
            let bytes = message.to_bytes().expect("serialize");
            let decoded = SpekeMessage::from_bytes(&bytes).expect("deserialize");
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_garbage_payload_is_a_framing_error() {
        assert!(matches!(
            SpekeMessage::from_bytes(&[0xff; 16]),
            Err(SpekeError::Framing(_))
        ));
    }

    #[tokio::test]
    async fn test_frame_roundtrip_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        for message in sample_messages() {
            write_message(&mut client, &message).await.expect("write");
            let received = read_message(&mut server).await.expect("read");
            assert_eq!(received, message);
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let prefix = ((MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &prefix)
            .await
            .expect("write prefix");
        assert!(matches!(
            read_message(&mut server).await,
            Err(SpekeError::Framing(_))
        ));
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_io_error() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_all(&mut client, &8u32.to_be_bytes())
            .await
            .expect("write prefix");
        drop(client);
        assert!(matches!(
            read_message(&mut server).await,
            Err(SpekeError::Io(_))
        ));
    }
}
