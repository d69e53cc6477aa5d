//! ZMTP 3.0 framing for the backend connection.
//!
//! The backend speaks ZMTP 3.0 with the NULL security mechanism. A
//! connection starts with a fixed greeting from both sides, followed by a
//! `READY` command announcing the socket type:
//!
//! ```text
//! ┌──────────┬──────────┬─────────┬────────────┬─────────┬──────────┐
//! │ 0xFF     │ padding  │ 0x7F    │ version    │ "NULL"  │ as-server│
//! │ 1 byte   │ 8 bytes  │ 1 byte  │ 3, 0       │ 20 bytes│ 1 + 31   │
//! └──────────┴──────────┴─────────┴────────────┴─────────┴──────────┘
//! ```
//!
//! After the handshake every frame is one part of a multipart message:
//!
//! ```text
//! ┌─────────┬───────────────────────────┬──────────┐
//! │ flags   │ size (1 byte, or 8 if LONG│ body     │
//! │ 1 byte  │ flag is set; big-endian)  │ size     │
//! └─────────┴───────────────────────────┴──────────┘
//! ```
//!
//! [`MultipartBuffer`] reassembles parts arriving in arbitrary chunks.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{GatewayError, Result};

/// Size of the greeting exchanged by both peers.
pub const GREETING_SIZE: usize = 64;

/// Security mechanism offered in the greeting.
const MECHANISM_NULL: &[u8] = b"NULL";

/// Frame flag bits.
pub mod flags {
    /// More parts follow in the same message.
    pub const MORE: u8 = 0x01;
    /// Size field is 8 bytes instead of 1.
    pub const LONG: u8 = 0x02;
    /// Frame is a command, not a message part.
    pub const COMMAND: u8 = 0x04;
}

/// Socket roles that take part in the dealer/router pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Dealer,
    Router,
}

impl SocketType {
    /// Name announced in the `Socket-Type` property.
    pub fn as_str(self) -> &'static str {
        match self {
            SocketType::Dealer => "DEALER",
            SocketType::Router => "ROUTER",
        }
    }

    /// Parse a `Socket-Type` property value.
    pub fn parse(name: &[u8]) -> Option<Self> {
        match name {
            b"DEALER" => Some(SocketType::Dealer),
            b"ROUTER" => Some(SocketType::Router),
            _ => None,
        }
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the peer announced during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub socket_type: SocketType,
    pub identity: Option<Bytes>,
}

/// Build the local greeting.
pub fn greeting(as_server: bool) -> [u8; GREETING_SIZE] {
    let mut buf = [0u8; GREETING_SIZE];
    buf[0] = 0xFF;
    buf[9] = 0x7F;
    buf[10] = 3;
    buf[11] = 0;
    buf[12..12 + MECHANISM_NULL.len()].copy_from_slice(MECHANISM_NULL);
    buf[32] = u8::from(as_server);
    buf
}

/// Check a peer greeting.
pub fn validate_greeting(buf: &[u8; GREETING_SIZE]) -> Result<()> {
    if buf[0] != 0xFF || buf[9] & 0x01 != 0x01 {
        return Err(GatewayError::Protocol("Peer did not send a ZMTP signature".into()));
    }
    if buf[10] < 3 {
        return Err(GatewayError::Protocol(format!(
            "Peer speaks ZMTP {}.{}, need 3.0 or later",
            buf[10], buf[11]
        )));
    }
    let mechanism = &buf[12..32];
    let end = mechanism.iter().position(|&b| b == 0).unwrap_or(mechanism.len());
    if &mechanism[..end] != MECHANISM_NULL {
        return Err(GatewayError::Protocol(format!(
            "Unsupported security mechanism {}",
            String::from_utf8_lossy(&mechanism[..end])
        )));
    }
    Ok(())
}

fn put_frame_prefix(buf: &mut BytesMut, frame_flags: u8, size: usize) {
    if size > u8::MAX as usize {
        buf.put_u8(frame_flags | flags::LONG);
        buf.put_u64(size as u64);
    } else {
        buf.put_u8(frame_flags);
        buf.put_u8(size as u8);
    }
}

/// Build a complete `READY` command frame.
pub fn ready_command(socket_type: SocketType, identity: Option<&[u8]>) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u8(5);
    body.put_slice(b"READY");
    put_property(&mut body, "Socket-Type", socket_type.as_str().as_bytes());
    if let Some(identity) = identity {
        put_property(&mut body, "Identity", identity);
    }

    let mut frame = BytesMut::with_capacity(body.len() + 9);
    put_frame_prefix(&mut frame, flags::COMMAND, body.len());
    frame.extend_from_slice(&body);
    frame.freeze()
}

fn put_property(buf: &mut BytesMut, name: &str, value: &[u8]) {
    buf.put_u8(name.len() as u8);
    buf.put_slice(name.as_bytes());
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

/// A decoded command frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub body: Bytes,
}

impl Command {
    fn parse(mut body: Bytes) -> Result<Self> {
        if body.is_empty() {
            return Err(GatewayError::Protocol("Empty command frame".into()));
        }
        let name_len = body.get_u8() as usize;
        if body.len() < name_len {
            return Err(GatewayError::Protocol("Truncated command name".into()));
        }
        let name = String::from_utf8_lossy(&body.split_to(name_len)).into_owned();
        Ok(Self { name, body })
    }

    /// Parse the body of a `READY` command into its properties.
    pub fn properties(&self) -> Result<Vec<(String, Bytes)>> {
        let mut body = self.body.clone();
        let mut props = Vec::new();
        while body.has_remaining() {
            let name_len = body.get_u8() as usize;
            if body.len() < name_len + 4 {
                return Err(GatewayError::Protocol("Truncated command property".into()));
            }
            let name = String::from_utf8_lossy(&body.split_to(name_len)).into_owned();
            let value_len = body.get_u32() as usize;
            if body.len() < value_len {
                return Err(GatewayError::Protocol("Truncated property value".into()));
            }
            props.push((name, body.split_to(value_len)));
        }
        Ok(props)
    }
}

/// Encode one multipart message as write segments.
///
/// Every part contributes a small prefix segment and, when non-empty, its
/// body, so payload bytes are never copied.
pub fn encode_message(parts: &[Bytes]) -> Vec<Bytes> {
    let mut segments = Vec::with_capacity(parts.len() * 2);
    let last = parts.len().saturating_sub(1);
    for (i, part) in parts.iter().enumerate() {
        let mut prefix = BytesMut::with_capacity(9);
        let more = if i < last { flags::MORE } else { 0 };
        put_frame_prefix(&mut prefix, more, part.len());
        segments.push(prefix.freeze());
        if !part.is_empty() {
            segments.push(part.clone());
        }
    }
    segments
}

/// Exchange greetings and `READY` commands with the peer.
///
/// Reads exactly the handshake bytes, so the stream is positioned at the
/// first message frame afterwards.
pub async fn handshake<S>(
    stream: &mut S,
    local: SocketType,
    identity: Option<&[u8]>,
) -> Result<PeerInfo>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&greeting(local == SocketType::Router)).await?;
    stream.flush().await?;

    let mut peer_greeting = [0u8; GREETING_SIZE];
    stream.read_exact(&mut peer_greeting).await?;
    validate_greeting(&peer_greeting)?;

    stream.write_all(&ready_command(local, identity)).await?;
    stream.flush().await?;

    let command = read_command(stream).await?;
    if command.name != "READY" {
        return Err(GatewayError::Protocol(format!(
            "Expected READY, got {}",
            command.name
        )));
    }

    let mut socket_type = None;
    let mut peer_identity = None;
    for (name, value) in command.properties()? {
        if name.eq_ignore_ascii_case("Socket-Type") {
            socket_type = Some(SocketType::parse(&value).ok_or_else(|| {
                GatewayError::Protocol(format!(
                    "Peer socket type {} cannot talk to {}",
                    String::from_utf8_lossy(&value),
                    local
                ))
            })?);
        } else if name.eq_ignore_ascii_case("Identity") && !value.is_empty() {
            peer_identity = Some(value);
        }
    }

    let socket_type = socket_type
        .ok_or_else(|| GatewayError::Protocol("Peer READY lacks Socket-Type".into()))?;

    tracing::debug!(peer = %socket_type, "ZMTP handshake complete");

    Ok(PeerInfo {
        socket_type,
        identity: peer_identity,
    })
}

async fn read_command<S>(stream: &mut S) -> Result<Command>
where
    S: AsyncRead + Unpin,
{
    let frame_flags = stream.read_u8().await?;
    if frame_flags & flags::COMMAND == 0 {
        return Err(GatewayError::Protocol("Expected a command frame".into()));
    }
    let size = if frame_flags & flags::LONG != 0 {
        stream.read_u64().await? as usize
    } else {
        stream.read_u8().await? as usize
    };
    if size > MAX_COMMAND_SIZE {
        return Err(GatewayError::Protocol(format!("Command of {} bytes", size)));
    }
    let mut body = vec![0u8; size];
    stream.read_exact(&mut body).await?;
    Command::parse(Bytes::from(body))
}

/// Largest handshake command accepted.
const MAX_COMMAND_SIZE: usize = 64 * 1024;

/// A complete unit read from the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message(Vec<Bytes>),
    Command(Command),
}

#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for the flags byte and size field.
    WaitingForPrefix,
    /// Prefix parsed, waiting for the body.
    WaitingForBody { frame_flags: u8, size: usize },
    /// Consuming the body of an oversized frame without buffering it.
    Skipping { frame_flags: u8, remaining: u64 },
}

/// Buffer that reassembles frames and multipart messages from a byte stream.
///
/// A message with any part larger than the part limit is dropped whole:
/// the size prefix tells how many bytes to skip, so the stream stays in
/// sync and later messages are still delivered.
pub struct MultipartBuffer {
    buffer: BytesMut,
    state: State,
    parts: Vec<Bytes>,
    max_part_size: usize,
    /// Remaining parts of the current message are discarded.
    dropping: bool,
}

impl MultipartBuffer {
    /// Create a buffer that drops messages with parts larger than `max_part_size`.
    pub fn new(max_part_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForPrefix,
            parts: Vec::new(),
            max_part_size,
            dropping: false,
        }
    }

    /// Push bytes read from the socket and extract every complete unit.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Inbound>> {
        self.buffer.extend_from_slice(data);

        let mut out = Vec::new();
        while let Some(unit) = self.try_extract_one()? {
            out.push(unit);
        }
        Ok(out)
    }

    fn try_extract_one(&mut self) -> Result<Option<Inbound>> {
        loop {
            match self.state {
                State::WaitingForPrefix => {
                    let Some(&frame_flags) = self.buffer.first() else {
                        return Ok(None);
                    };
                    let size_len = if frame_flags & flags::LONG != 0 { 8 } else { 1 };
                    if self.buffer.len() < 1 + size_len {
                        return Ok(None);
                    }
                    let size = if size_len == 8 {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(&self.buffer[1..9]);
                        u64::from_be_bytes(raw)
                    } else {
                        u64::from(self.buffer[1])
                    };
                    self.buffer.advance(1 + size_len);
                    if size > self.max_part_size as u64 {
                        tracing::warn!(
                            size,
                            max = self.max_part_size,
                            "Discarding message with oversized part"
                        );
                        if frame_flags & flags::COMMAND == 0 {
                            self.parts.clear();
                            self.dropping = true;
                        }
                        self.state = State::Skipping {
                            frame_flags,
                            remaining: size,
                        };
                        continue;
                    }
                    self.state = State::WaitingForBody {
                        frame_flags,
                        size: size as usize,
                    };
                }
                State::Skipping {
                    frame_flags,
                    remaining,
                } => {
                    let n = remaining.min(self.buffer.len() as u64);
                    self.buffer.advance(n as usize);
                    if n < remaining {
                        self.state = State::Skipping {
                            frame_flags,
                            remaining: remaining - n,
                        };
                        return Ok(None);
                    }
                    self.state = State::WaitingForPrefix;
                    if frame_flags & (flags::COMMAND | flags::MORE) == 0 {
                        self.dropping = false;
                    }
                }
                State::WaitingForBody { frame_flags, size } => {
                    if self.buffer.len() < size {
                        return Ok(None);
                    }
                    let body = self.buffer.split_to(size).freeze();
                    self.state = State::WaitingForPrefix;

                    if frame_flags & flags::COMMAND != 0 {
                        if !self.parts.is_empty() || frame_flags & flags::MORE != 0 {
                            return Err(GatewayError::Protocol(
                                "Command frame inside a multipart message".into(),
                            ));
                        }
                        return Ok(Some(Inbound::Command(Command::parse(body)?)));
                    }

                    if self.dropping {
                        if frame_flags & flags::MORE == 0 {
                            self.dropping = false;
                        }
                        continue;
                    }
                    self.parts.push(body);
                    if frame_flags & flags::MORE == 0 {
                        return Ok(Some(Inbound::Message(std::mem::take(&mut self.parts))));
                    }
                }
            }
        }
    }

    /// Number of buffered bytes not yet part of a complete frame.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.parts.is_empty() && !self.dropping
    }
}
