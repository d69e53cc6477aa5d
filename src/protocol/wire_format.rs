//! Wire format encoding and decoding.
//!
//! Implements the 8-byte frame header:
//! ```text
//! ┌──────────┬───────────┬──────────┬────────────┐
//! │ Length   │ Proto ID  │ Msg ID   │ Context ID │
//! │ 4 bytes  │ 1 byte    │ 1 byte   │ 2 bytes    │
//! │ uint32   │ uint8     │ uint8    │ uint16     │
//! └──────────┴───────────┴──────────┴────────────┘
//! ```
//!
//! Multi-byte fields use the deployment's [`ByteOrder`]. The same order must
//! be used for every frame sent and received on one connection.

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Header size in bytes (fixed, exactly 8).
pub const HEADER_SIZE: usize = 8;

/// Default maximum payload size (64 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Byte order of the multi-byte header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ByteOrder {
    /// Network byte order.
    #[default]
    BigEndian,
    /// Host order of the x86 deployments.
    LittleEndian,
}

impl ByteOrder {
    #[inline]
    fn put_u32(self, value: u32) -> [u8; 4] {
        match self {
            ByteOrder::BigEndian => value.to_be_bytes(),
            ByteOrder::LittleEndian => value.to_le_bytes(),
        }
    }

    #[inline]
    fn put_u16(self, value: u16) -> [u8; 2] {
        match self {
            ByteOrder::BigEndian => value.to_be_bytes(),
            ByteOrder::LittleEndian => value.to_le_bytes(),
        }
    }

    #[inline]
    fn get_u32(self, bytes: [u8; 4]) -> u32 {
        match self {
            ByteOrder::BigEndian => u32::from_be_bytes(bytes),
            ByteOrder::LittleEndian => u32::from_le_bytes(bytes),
        }
    }

    #[inline]
    fn get_u16(self, bytes: [u8; 2]) -> u16 {
        match self {
            ByteOrder::BigEndian => u16::from_be_bytes(bytes),
            ByteOrder::LittleEndian => u16::from_le_bytes(bytes),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length in bytes (0 = no payload part).
    pub payload_length: u32,
    /// Protocol identifier (high byte of the message type).
    pub protocol_id: u8,
    /// Message offset within the protocol (low byte of the message type).
    pub message_id: u8,
    /// Correlation slot of the request this frame belongs to.
    pub context_id: u16,
}

impl FrameHeader {
    /// Create a new header.
    pub fn new(payload_length: u32, protocol_id: u8, message_id: u8, context_id: u16) -> Self {
        Self {
            payload_length,
            protocol_id,
            message_id,
            context_id,
        }
    }

    /// Create a header from a combined 16-bit message type.
    pub fn for_message(message_type: u16, context_id: u16, payload_length: u32) -> Self {
        Self {
            payload_length,
            protocol_id: (message_type >> 8) as u8,
            message_id: (message_type & 0xFF) as u8,
            context_id,
        }
    }

    /// Combined message type: `(protocol_id << 8) | message_id`.
    #[inline]
    pub fn message_type(&self) -> u16 {
        (u16::from(self.protocol_id) << 8) | u16::from(self.message_id)
    }

    /// Whether the frame is followed by a payload part.
    #[inline]
    pub fn has_payload(&self) -> bool {
        self.payload_length > 0
    }

    /// Encode header to bytes.
    ///
    /// # Example
    ///
    /// ```
    /// use core_gateway::protocol::{ByteOrder, FrameHeader};
    ///
    /// let header = FrameHeader::new(100, 1, 2, 42);
    /// let bytes = header.encode(ByteOrder::BigEndian);
    /// assert_eq!(bytes, [0, 0, 0, 100, 1, 2, 0, 42]);
    /// ```
    pub fn encode(&self, order: ByteOrder) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf, order);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (8 bytes).
    pub fn encode_into(&self, buf: &mut [u8], order: ByteOrder) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&order.put_u32(self.payload_length));
        buf[4] = self.protocol_id;
        buf[5] = self.message_id;
        buf[6..8].copy_from_slice(&order.put_u16(self.context_id));
    }

    /// Decode header from bytes.
    ///
    /// Returns `None` if buffer is too short.
    ///
    /// # Example
    ///
    /// ```
    /// use core_gateway::protocol::{ByteOrder, FrameHeader};
    ///
    /// let bytes = [100, 0, 0, 0, 1, 2, 42, 0];
    /// let header = FrameHeader::decode(&bytes, ByteOrder::LittleEndian).unwrap();
    /// assert_eq!(header.payload_length, 100);
    /// assert_eq!(header.message_type(), 0x0102);
    /// assert_eq!(header.context_id, 42);
    /// ```
    pub fn decode(buf: &[u8], order: ByteOrder) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            payload_length: order.get_u32([buf[0], buf[1], buf[2], buf[3]]),
            protocol_id: buf[4],
            message_id: buf[5],
            context_id: order.get_u16([buf[6], buf[7]]),
        })
    }

    /// Validate the header against the configured payload limit.
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.payload_length > max_payload_size {
            return Err(GatewayError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }
        Ok(())
    }
}
