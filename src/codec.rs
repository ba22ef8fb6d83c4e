//! Wire codec interface.
//!
//! Message framing and payload serialization are supplied by the
//! consumer; the connection stack only needs to frame outbound messages
//! and to turn inbound frames back into [`Message`] values. The
//! [`PlainCodec`] here is the reference implementation used by the test
//! suite; a Bitcoin-mainnet codec lives with the node.

use crate::error::Error;
use crate::message::Message;

/// Decoded frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Command string, identifies the payload kind.
    pub command: String,
    /// Payload length in bytes, already bounds-checked by the codec.
    pub payload_len: usize,
}

/// Message framing and payload serialization.
///
/// Every decode failure maps to [`Error::BadStream`]; the channel stops
/// on the first undecodable frame.
pub trait Codec: Send + Sync + 'static {
    /// Fixed size of the frame header in bytes.
    fn header_len(&self) -> usize;

    /// Encode a full frame (header plus payload).
    fn encode(&self, message: &Message) -> Result<Vec<u8>, Error>;

    /// Decode a frame header from exactly [`Codec::header_len`] bytes.
    fn decode_header(&self, bytes: &[u8]) -> Result<FrameHeader, Error>;

    /// Decode a payload of the kind named by `command`.
    fn decode_payload(&self, command: &str, bytes: &[u8]) -> Result<Message, Error>;
}

/// Network magic of the reference codec.
const PLAIN_MAGIC: [u8; 4] = *b"gshk";
/// Zero-padded command field width, matching the Bitcoin header layout.
const COMMAND_LEN: usize = 12;
/// Hard cap on a single payload.
const MAX_PAYLOAD: usize = 1024 * 1024;

/// Reference codec: magic + zero-padded command + length header,
/// postcard-serialized payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCodec;

impl PlainCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for PlainCodec {
    fn header_len(&self) -> usize {
        PLAIN_MAGIC.len() + COMMAND_LEN + 4
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>, Error> {
        let payload = postcard::to_allocvec(message).map_err(|_| Error::BadStream)?;
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::BadStream);
        }

        let command = message.command().as_bytes();
        debug_assert!(command.len() <= COMMAND_LEN);

        let mut frame = Vec::with_capacity(self.header_len() + payload.len());
        frame.extend_from_slice(&PLAIN_MAGIC);
        frame.extend_from_slice(command);
        frame.resize(PLAIN_MAGIC.len() + COMMAND_LEN, 0);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    fn decode_header(&self, bytes: &[u8]) -> Result<FrameHeader, Error> {
        if bytes.len() != self.header_len() || bytes[..4] != PLAIN_MAGIC {
            return Err(Error::BadStream);
        }

        let command_field = &bytes[4..4 + COMMAND_LEN];
        let end = command_field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(COMMAND_LEN);
        let command = std::str::from_utf8(&command_field[..end])
            .map_err(|_| Error::BadStream)?
            .to_owned();

        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[4 + COMMAND_LEN..]);
        let payload_len = u32::from_le_bytes(len) as usize;

        if payload_len > MAX_PAYLOAD {
            return Err(Error::BadStream);
        }

        Ok(FrameHeader {
            command,
            payload_len,
        })
    }

    fn decode_payload(&self, command: &str, bytes: &[u8]) -> Result<Message, Error> {
        let message: Message = postcard::from_bytes(bytes).map_err(|_| Error::BadStream)?;

        // A frame whose header disagrees with its body is corrupt.
        if message.command() != command {
            return Err(Error::BadStream);
        }

        Ok(message)
    }
}
