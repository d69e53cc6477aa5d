//! Transport module - the persistent backend connection.
//!
//! - TCP endpoint parsing and connect
//! - ZMTP 3.0 handshake and multipart framing

mod tcp;
mod zmtp;

pub use tcp::{connect, parse_endpoint, DEFAULT_SERVER_ADDRESS};
pub use zmtp::{
    encode_message, flags, greeting, handshake, ready_command, validate_greeting, Command,
    Inbound, MultipartBuffer, PeerInfo, SocketType, GREETING_SIZE,
};
