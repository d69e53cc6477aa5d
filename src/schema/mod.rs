//! Schema module - message definitions, numeric ids and payload codec.
//!
//! - [`SchemaRegistry`] compiles `.proto` sources with `protox`, assigns
//!   numeric ids and encodes/decodes payloads through `prost-reflect`
//! - [`SchemaVersion`] carries the release stamp and API version

mod payload;
mod registry;
mod source;
mod version;

pub use registry::{
    MessageType, ProtocolUnit, RegistryBuilder, SchemaRegistry, PROTOCOL_ENUM, PROTOCOL_ID_VALUE,
};
pub use version::{ApiVersion, ReleaseStamp, SchemaVersion, MINOR_VERSION_WINDOW};
