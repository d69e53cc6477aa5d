//! # core-gateway
//!
//! Request/reply multiplexing gateway to a schema-typed core service.
//!
//! Many concurrent callers share one persistent connection to the core
//! backend. Each request borrows a context slot whose id travels in the
//! frame header; the backend echoes it so the reply finds its caller.
//!
//! ## Architecture
//!
//! - **Schema** : protocol definition sources, numeric message ids
//!   (`protocol_id << 8 | offset`) and the payload codec
//! - **Dispatch** : bounded context table, request dispatcher and reply
//!   demultiplexer
//! - **Transport** : one ZMTP 3.0 dealer connection carrying
//!   `["", header, payload?, route]` envelopes
//!
//! ## Example
//!
//! ```ignore
//! use core_gateway::{Gateway, GatewayConfig, SchemaRegistry};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> core_gateway::Result<()> {
//!     let config = GatewayConfig::from_file("gateway.toml")?;
//!     let registry = SchemaRegistry::from_config(&config.schema)?;
//!
//!     let gateway = Gateway::builder(registry)
//!         .with_config(&config)
//!         .connect(&config.core.server_address)
//!         .await?;
//!
//!     match gateway.call("PingRequest", &json!({}), Some("u/jdoe")).await {
//!         Ok(reply) => println!("{}", reply.name()),
//!         Err(e) if e.is_retryable() => eprintln!("try again: {}", e),
//!         Err(e) => eprintln!("failed ({}): {}", e.status_code(), e),
//!     }
//!
//!     gateway.shutdown().await
//! }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod protocol;
pub mod schema;
pub mod transport;
pub mod writer;

mod gateway;

pub use config::GatewayConfig;
pub use dispatch::{Reply, ReplyBody};
pub use error::{GatewayError, Result};
pub use gateway::{BackendVersion, Gateway, GatewayBuilder, DEFAULT_CONNECT_TIMEOUT, VERSION_REQUEST};
pub use schema::SchemaRegistry;
pub use writer::{WriterConfig, WriterHandle};
