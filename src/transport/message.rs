//! RPC message exchanged between pipeline stages
//!
//! The body is opaque to the transport: serialization and compression are
//! tags carried for the dispatcher, never interpreted here.

use bytes::Bytes;

/// Kind of frame on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request = 1,
    Response = 2,
    HeartbeatPing = 3,
    HeartbeatPong = 4,
}

impl MessageType {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn is_heartbeat(self) -> bool {
        matches!(self, MessageType::HeartbeatPing | MessageType::HeartbeatPong)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Request),
            2 => Ok(MessageType::Response),
            3 => Ok(MessageType::HeartbeatPing),
            4 => Ok(MessageType::HeartbeatPong),
            other => Err(other),
        }
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcMessage {
    pub message_type: MessageType,
    /// Serialization tag, owned by the dispatcher
    pub serialization: u8,
    /// Compression tag, owned by the dispatcher
    pub compression: u8,
    /// Correlates a response with its request
    pub request_id: u32,
    pub body: Bytes,
}

impl RpcMessage {
    pub fn request(request_id: u32, body: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Request, request_id, body.into())
    }

    pub fn response(request_id: u32, body: impl Into<Bytes>) -> Self {
        Self::new(MessageType::Response, request_id, body.into())
    }

    pub fn ping(request_id: u32) -> Self {
        Self::new(MessageType::HeartbeatPing, request_id, Bytes::new())
    }

    pub fn pong(request_id: u32) -> Self {
        Self::new(MessageType::HeartbeatPong, request_id, Bytes::new())
    }

    fn new(message_type: MessageType, request_id: u32, body: Bytes) -> Self {
        Self {
            message_type,
            serialization: 0,
            compression: 0,
            request_id,
            body,
        }
    }

    /// Response for this request, keeping its serialization/compression tags
    pub fn reply(&self, body: impl Into<Bytes>) -> Self {
        Self {
            message_type: MessageType::Response,
            serialization: self.serialization,
            compression: self.compression,
            request_id: self.request_id,
            body: body.into(),
        }
    }
}
