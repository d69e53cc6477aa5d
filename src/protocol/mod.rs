//! Protocol module - frame header and envelope layout.
//!
//! This module implements the framing carried inside each transport message:
//! - 8-byte header encoding/decoding with a deployment-wide byte order
//! - Frame struct mapping to and from the multipart envelope

mod frame;
mod wire_format;

pub use frame::Frame;
pub use wire_format::{ByteOrder, FrameHeader, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
