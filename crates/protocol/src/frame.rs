//! Inner frame encoding: `[type: u8][len: u32 LE][payload]`.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::MessageType;

/// Hard cap on a single payload (16 MiB), matching the outer transport.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Frame header size: one type byte plus a little-endian u32 length.
const HEADER_LEN: usize = 5;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("frame length {declared} does not match remaining {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("payload of {0} bytes exceeds the 16 MiB cap")]
    PayloadTooLarge(usize),
    #[error("payload is not the expected JSON shape: {0}")]
    BadPayload(#[from] serde_json::Error),
}

/// One decoded inner frame. The type tag is kept raw so unknown tags can be
/// skipped instead of failing the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(ty: MessageType, payload: Vec<u8>) -> Self {
        Self {
            tag: ty as u8,
            payload,
        }
    }

    /// Builds a frame whose payload is the JSON encoding of `body`.
    pub fn json<T: Serialize>(ty: MessageType, body: &T) -> Result<Self, ProtocolError> {
        Ok(Self::new(ty, serde_json::to_vec(body)?))
    }

    /// Decodes the JSON payload into the schema struct for this type.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_u8(self.tag)
    }

    /// Serializes to `[type][len LE][payload]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.push(self.tag);
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decodes a full buffer holding exactly one frame. The declared length
    /// must equal the byte count after the header.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::TooShort(buf.len()));
        }
        let tag = buf[0];
        let declared = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if declared > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge(declared));
        }
        let actual = buf.len() - HEADER_LEN;
        if declared != actual {
            return Err(ProtocolError::LengthMismatch { declared, actual });
        }
        Ok(Self {
            tag,
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}
