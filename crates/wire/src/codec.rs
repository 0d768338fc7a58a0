//! Frame encoding/decoding for both sub-protocols.

use crate::message::{Message, MessageBody, MessageKind, Protocol};
use thiserror::Error;

/// Fixed bytes before the payload: tag(2) + kind(1) + timestamp(8) + length(4).
pub const FRAME_HEADER_LEN: usize = 15;

/// Frame size caps, threaded into the codec constructor.
#[derive(Debug, Clone)]
pub struct WireConfig {
    /// Maximum payload bytes on the peer protocol.
    pub peer_max_payload: usize,
    /// Maximum payload bytes on the task protocol.
    pub task_max_payload: usize,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            peer_max_payload: 64 * 1024,
            task_max_payload: 1024 * 1024,
        }
    }
}

impl WireConfig {
    fn max_payload(&self, protocol: Protocol) -> usize {
        match protocol {
            Protocol::Peer => self.peer_max_payload,
            Protocol::Task => self.task_max_payload,
        }
    }
}

/// Errors produced while decoding a frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Frame shorter than its fixed header.
    #[error("truncated frame: need at least {need} bytes, got {got}")]
    Truncated {
        /// Bytes required.
        need: usize,
        /// Bytes available.
        got: usize,
    },

    /// Leading tag names no known protocol.
    #[error("unknown protocol tag {0:02x?}")]
    UnknownProtocol([u8; 2]),

    /// Kind byte not registered for the protocol.
    #[error("unknown kind {code:#04x} on {protocol} protocol")]
    UnknownKind {
        /// Protocol the frame arrived on.
        protocol: Protocol,
        /// Offending kind byte.
        code: u8,
    },

    /// Declared payload length exceeds the configured cap.
    #[error("frame too large: payload {len} bytes exceeds {max} byte cap")]
    FrameTooLarge {
        /// Declared payload length.
        len: usize,
        /// Configured cap.
        max: usize,
    },

    /// Declared payload length disagrees with the bytes present.
    #[error("length mismatch: declared {declared}, got {actual}")]
    LengthMismatch {
        /// Length field value.
        declared: usize,
        /// Bytes actually present after the header.
        actual: usize,
    },

    /// Payload bytes did not parse as the kind's document.
    #[error("malformed payload: {0}")]
    Payload(String),
}

/// Errors produced while encoding a message.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Payload serialization failed.
    #[error("payload serialization failed: {0}")]
    Serialize(String),

    /// Serialized payload exceeds the configured cap.
    #[error("payload too large: {len} bytes exceeds {max} byte cap")]
    PayloadTooLarge {
        /// Serialized payload length.
        len: usize,
        /// Configured cap.
        max: usize,
    },
}

/// Frames and parses protocol messages.
#[derive(Debug, Clone, Default)]
pub struct MessageCodec {
    config: WireConfig,
}

impl MessageCodec {
    /// Create a codec with the given size caps.
    pub fn new(config: WireConfig) -> Self {
        Self { config }
    }

    /// Encode a message into a single frame.
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, EncodeError> {
        let kind = message.kind();
        let payload = encode_payload(&message.body)?;

        let max = self.config.max_payload(kind.protocol());
        if payload.len() > max {
            return Err(EncodeError::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&kind.protocol().tag());
        frame.push(kind.code());
        frame.extend_from_slice(&message.timestamp_ms.to_be_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Decode a frame. Total: any input yields a message or a typed error.
    pub fn decode(&self, bytes: &[u8]) -> Result<Message, DecodeError> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(DecodeError::Truncated {
                need: FRAME_HEADER_LEN,
                got: bytes.len(),
            });
        }

        let tag = [bytes[0], bytes[1]];
        let protocol = Protocol::from_tag(tag).ok_or(DecodeError::UnknownProtocol(tag))?;

        let code = bytes[2];
        let kind = MessageKind::from_code(protocol, code)
            .ok_or(DecodeError::UnknownKind { protocol, code })?;

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[3..11]);
        let timestamp_ms = u64::from_be_bytes(ts);

        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[11..15]);
        let declared = u32::from_be_bytes(len) as usize;

        let max = self.config.max_payload(protocol);
        if declared > max {
            return Err(DecodeError::FrameTooLarge { len: declared, max });
        }

        let actual = bytes.len() - FRAME_HEADER_LEN;
        if declared != actual {
            return Err(DecodeError::LengthMismatch { declared, actual });
        }

        let body = decode_payload(kind, &bytes[FRAME_HEADER_LEN..])?;
        Ok(Message { timestamp_ms, body })
    }
}

fn encode_payload(body: &MessageBody) -> Result<Vec<u8>, EncodeError> {
    let result = match body {
        // Bodyless kinds travel with an empty payload.
        MessageBody::Ping | MessageBody::Pong | MessageBody::GetPeers => return Ok(Vec::new()),
        MessageBody::Hello(p) => serde_json::to_vec(p),
        MessageBody::Peers(p) => serde_json::to_vec(p),
        MessageBody::WantToCompute(p) => serde_json::to_vec(p),
        MessageBody::TaskToCompute(p) => serde_json::to_vec(p),
        MessageBody::ReportComputedTask(p) => serde_json::to_vec(p),
        MessageBody::ResultsAccepted(p) => serde_json::to_vec(p),
        MessageBody::ResultsRejected(p) => serde_json::to_vec(p),
        MessageBody::CannotAssign(p) => serde_json::to_vec(p),
        MessageBody::ForceReport(p) => serde_json::to_vec(p),
    };
    result.map_err(|err| EncodeError::Serialize(err.to_string()))
}

fn decode_payload(kind: MessageKind, payload: &[u8]) -> Result<MessageBody, DecodeError> {
    fn parse<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T, DecodeError> {
        serde_json::from_slice(payload).map_err(|err| DecodeError::Payload(err.to_string()))
    }

    let body = match kind {
        MessageKind::Ping | MessageKind::Pong | MessageKind::GetPeers => {
            if !payload.is_empty() {
                return Err(DecodeError::Payload(format!(
                    "unexpected {} byte payload on bodyless kind",
                    payload.len()
                )));
            }
            match kind {
                MessageKind::Ping => MessageBody::Ping,
                MessageKind::Pong => MessageBody::Pong,
                _ => MessageBody::GetPeers,
            }
        }
        MessageKind::Hello => MessageBody::Hello(parse(payload)?),
        MessageKind::Peers => MessageBody::Peers(parse(payload)?),
        MessageKind::WantToCompute => MessageBody::WantToCompute(parse(payload)?),
        MessageKind::TaskToCompute => MessageBody::TaskToCompute(parse(payload)?),
        MessageKind::ReportComputedTask => MessageBody::ReportComputedTask(parse(payload)?),
        MessageKind::ResultsAccepted => MessageBody::ResultsAccepted(parse(payload)?),
        MessageKind::ResultsRejected => MessageBody::ResultsRejected(parse(payload)?),
        MessageKind::CannotAssign => MessageBody::CannotAssign(parse(payload)?),
        MessageKind::ForceReport => MessageBody::ForceReport(parse(payload)?),
    };
    Ok(body)
}
