//! Message codec: one JSON document per WebSocket text message.

use serde::de::DeserializeOwned;
use serde::Serialize;

pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024; // 16 MiB

/// Encode a message as the text of one WebSocket message.
pub fn encode_message<T: Serialize>(msg: &T) -> Result<String, FrameEncodeError> {
    let text = serde_json::to_string(msg).map_err(FrameEncodeError::Encode)?;
    if text.len() > MAX_MESSAGE_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    Ok(text)
}

/// Error encoding a message (serialization or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("message too large")]
    TooLarge,
}

/// Reject an inbound payload longer than the message limit.
pub fn check_len(len: usize) -> Result<(), FrameDecodeError> {
    if len > MAX_MESSAGE_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(())
}

/// Decode one inbound message payload (text or binary).
pub fn decode_message<T: DeserializeOwned>(payload: &[u8]) -> Result<T, FrameDecodeError> {
    check_len(payload.len())?;
    serde_json::from_slice(payload).map_err(FrameDecodeError::Decode)
}

/// Error decoding a message (too large, or malformed JSON).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("message too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}
