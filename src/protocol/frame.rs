//! Frame struct and its multipart envelope layout.
//!
//! A frame travels as one multipart message:
//!
//! ```text
//! [ "" (delimiter) | header (8 bytes) | payload (if length > 0) | routing token ]
//! ```
//!
//! The payload part is omitted entirely when the header says `length == 0`,
//! so "no body" is visible at the framing level. On the receive side the
//! header's length decides whether the part after the header is a payload
//! or the routing token.
//!
//! # Example
//!
//! ```
//! use core_gateway::protocol::{ByteOrder, Frame, FrameHeader};
//! use bytes::Bytes;
//!
//! let frame = Frame::new(0x0101, 3, Bytes::from_static(b"abc"), Some(Bytes::from_static(b"u_jdoe")));
//! let parts = frame.to_parts(ByteOrder::BigEndian);
//! assert_eq!(parts.len(), 4);
//!
//! let parsed = Frame::from_parts(parts, ByteOrder::BigEndian).unwrap();
//! assert_eq!(parsed.context_id(), 3);
//! assert_eq!(parsed.payload(), b"abc");
//! ```

use bytes::Bytes;

use super::wire_format::{ByteOrder, FrameHeader, HEADER_SIZE};
use crate::error::{GatewayError, Result};

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Decoded header.
    pub header: FrameHeader,
    /// Payload bytes (empty when the header length is 0).
    pub payload: Bytes,
    /// Routing token naming the backend client/session, if any.
    pub route: Option<Bytes>,
}

impl Frame {
    /// Create a frame for a message type, deriving the length from the payload.
    pub fn new(message_type: u16, context_id: u16, payload: Bytes, route: Option<Bytes>) -> Self {
        let header = FrameHeader::for_message(message_type, context_id, payload.len() as u32);
        Self {
            header,
            payload,
            route,
        }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Combined message type.
    #[inline]
    pub fn message_type(&self) -> u16 {
        self.header.message_type()
    }

    /// Correlation slot.
    #[inline]
    pub fn context_id(&self) -> u16 {
        self.header.context_id
    }

    /// Routing token as text, if it is valid UTF-8.
    pub fn route_str(&self) -> Option<&str> {
        self.route
            .as_deref()
            .and_then(|r| std::str::from_utf8(r).ok())
    }

    /// Build the outbound multipart envelope.
    pub fn to_parts(&self, order: ByteOrder) -> Vec<Bytes> {
        let mut parts = Vec::with_capacity(4);
        parts.push(Bytes::new());
        parts.push(Bytes::copy_from_slice(&self.header.encode(order)));
        if self.header.has_payload() {
            parts.push(self.payload.clone());
        }
        if let Some(route) = &self.route {
            parts.push(route.clone());
        }
        parts
    }

    /// Parse an inbound multipart envelope.
    ///
    /// Leading empty delimiter parts are skipped. Fails only when no header
    /// can be recovered, since without a header the frame cannot be routed.
    /// A payload part whose size disagrees with the header is kept as-is so
    /// the decoder can report it against the right context.
    pub fn from_parts(parts: Vec<Bytes>, order: ByteOrder) -> Result<Self> {
        let mut parts = parts.into_iter().skip_while(|p| p.is_empty());

        let header_part = parts
            .next()
            .ok_or_else(|| GatewayError::Protocol("Envelope has no frame part".to_string()))?;
        if header_part.len() != HEADER_SIZE {
            return Err(GatewayError::Protocol(format!(
                "Frame part is {} bytes, expected {}",
                header_part.len(),
                HEADER_SIZE
            )));
        }
        let header = FrameHeader::decode(&header_part, order)
            .ok_or_else(|| GatewayError::Protocol("Short frame header".to_string()))?;

        let payload = if header.has_payload() {
            let payload = parts.next().unwrap_or_default();
            if payload.len() != header.payload_length as usize {
                tracing::warn!(
                    context_id = header.context_id,
                    declared = header.payload_length,
                    actual = payload.len(),
                    "payload part length disagrees with frame header"
                );
            }
            payload
        } else {
            Bytes::new()
        };

        // An explicit empty part in place of an omitted payload is tolerated.
        let route = parts.find(|p| !p.is_empty());

        Ok(Self {
            header,
            payload,
            route,
        })
    }
}
