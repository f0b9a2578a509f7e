//! Framing codec stage
//!
//! [`FramingCodec`] is the boundary the pipeline depends on: any
//! `tokio_util` decoder/encoder pair over [`RpcMessage`] qualifies. One clone
//! is handed to each accepted connection, so codecs may carry per-connection
//! decode state.
//!
//! [`RpcMessageCodec`] is the default length-prefixed framing:
//!
//! ```text
//! 0      4   5          9     10   11   12         16
//! +------+---+----------+-----+----+----+----------+---------+
//! | brpc | v | full len | typ | ser| cmp| req id   | body... |
//! +------+---+----------+-----+----+----+----------+---------+
//! ```
//!
//! `full len` covers the whole frame, header included (big endian).

use crate::transport::message::{MessageType, RpcMessage};
use crate::TransportError;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const MAGIC: [u8; 4] = *b"brpc";
pub const VERSION: u8 = 1;
pub const HEADER_LENGTH: usize = 16;
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;
/// Largest frame the u32 length field can carry
pub const MAX_ENCODABLE_LENGTH: usize = u32::MAX as usize;

/// Decode + encode stage pair over [`RpcMessage`]
pub trait FramingCodec:
    Decoder<Item = RpcMessage, Error = TransportError>
    + Encoder<RpcMessage, Error = TransportError>
    + Clone
    + Send
    + Sync
    + Unpin
    + 'static
{
}

impl<T> FramingCodec for T where
    T: Decoder<Item = RpcMessage, Error = TransportError>
        + Encoder<RpcMessage, Error = TransportError>
        + Clone
        + Send
        + Sync
        + Unpin
        + 'static
{
}

/// Length-prefixed codec for [`RpcMessage`]
#[derive(Debug, Clone)]
pub struct RpcMessageCodec {
    max_frame_length: usize,
}

impl RpcMessageCodec {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    /// Limit is clamped to what the u32 length field can express
    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            max_frame_length: max_frame_length.clamp(HEADER_LENGTH, MAX_ENCODABLE_LENGTH),
        }
    }

    #[inline]
    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl Default for RpcMessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RpcMessageCodec {
    type Item = RpcMessage;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RpcMessage>, TransportError> {
        if src.len() < HEADER_LENGTH {
            // Validate the magic early so garbage is rejected without waiting
            let seen = src.len().min(MAGIC.len());
            if src[..seen] != MAGIC[..seen] {
                return Err(TransportError::InvalidFrame("bad magic".to_string()));
            }
            return Ok(None);
        }

        if src[..4] != MAGIC {
            return Err(TransportError::InvalidFrame("bad magic".to_string()));
        }
        if src[4] != VERSION {
            return Err(TransportError::InvalidFrame(format!(
                "unsupported version {}",
                src[4]
            )));
        }

        let full_length = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) as usize;
        if full_length < HEADER_LENGTH {
            return Err(TransportError::InvalidFrame(format!(
                "frame length {} shorter than header",
                full_length
            )));
        }
        if full_length > self.max_frame_length {
            return Err(TransportError::FrameTooLarge {
                length: full_length,
                max: self.max_frame_length,
            });
        }

        if src.len() < full_length {
            // Partial frame: reserve the rest and wait for more bytes
            src.reserve(full_length - src.len());
            return Ok(None);
        }

        let message_type = MessageType::try_from(src[9]).map_err(|t| {
            TransportError::InvalidFrame(format!("unknown message type {}", t))
        })?;

        let mut frame = src.split_to(full_length);
        frame.advance(10);
        let serialization = frame.get_u8();
        let compression = frame.get_u8();
        let request_id = frame.get_u32();

        Ok(Some(RpcMessage {
            message_type,
            serialization,
            compression,
            request_id,
            body: frame.freeze(),
        }))
    }
}

impl Encoder<RpcMessage> for RpcMessageCodec {
    type Error = TransportError;

    fn encode(&mut self, item: RpcMessage, dst: &mut BytesMut) -> Result<(), TransportError> {
        let full_length = HEADER_LENGTH + item.body.len();
        if full_length > self.max_frame_length {
            return Err(TransportError::FrameTooLarge {
                length: full_length,
                max: self.max_frame_length,
            });
        }

        let length_field = u32::try_from(full_length).map_err(|_| TransportError::FrameTooLarge {
            length: full_length,
            max: MAX_ENCODABLE_LENGTH,
        })?;

        dst.reserve(full_length);
        dst.put_slice(&MAGIC);
        dst.put_u8(VERSION);
        dst.put_u32(length_field);
        dst.put_u8(item.message_type.as_u8());
        dst.put_u8(item.serialization);
        dst.put_u8(item.compression);
        dst.put_u32(item.request_id);
        dst.put_slice(&item.body);
        Ok(())
    }
}
