//! Configuration management for the gateway.
//!
//! Settings come from a TOML or INI file (format chosen by extension) and
//! are overridden by environment variables prefixed `CORE_GATEWAY_`, with
//! `__` separating section and key:
//!
//! ```text
//! CORE_GATEWAY_CORE__SERVER_ADDRESS=tcp://core.local:7513
//! CORE_GATEWAY_DISPATCH__MAX_CONTEXTS=100
//! ```
//!
//! Every key has a default, so an empty file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatch::{DEFAULT_MAX_CONTEXTS, MAX_CONTEXT_CAPACITY};
use crate::error::{GatewayError, Result};
use crate::protocol::{ByteOrder, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::transport::{parse_endpoint, DEFAULT_SERVER_ADDRESS};
use crate::writer::{
    WriterConfig, DEFAULT_BACKPRESSURE_TIMEOUT, DEFAULT_CHANNEL_CAPACITY,
    DEFAULT_MAX_PENDING_FRAMES,
};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "CORE_GATEWAY";

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Backend connection
    pub core: CoreConfig,

    /// Schema sources
    pub schema: SchemaConfig,

    /// Request dispatch limits
    pub dispatch: DispatchConfig,
}

/// Backend connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Backend endpoint, `tcp://host:port`
    pub server_address: String,

    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Identity announced to the backend router
    pub socket_identity: Option<String>,

    /// Byte order of frame header fields
    pub byte_order: ByteOrder,

    /// Refuse to start against an incompatible backend
    pub verify_version: bool,
}

/// Schema source files
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    /// Source declaring the release and API version
    pub version_file: Option<PathBuf>,

    /// Sources with shared types only
    pub type_files: Vec<PathBuf>,

    /// Protocol units, loaded in order
    pub protocol_files: Vec<PathBuf>,
}

/// Request dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum concurrent requests
    pub max_contexts: usize,

    /// Reply timeout in seconds
    pub reply_timeout_secs: u64,

    /// Largest payload accepted in either direction
    pub max_payload_size: u32,

    /// Writer queue capacity
    pub channel_capacity: usize,

    /// Queued messages before senders wait
    pub max_pending_frames: usize,

    /// How long a sender waits for the queue to drain, in milliseconds
    pub backpressure_timeout_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            server_address: DEFAULT_SERVER_ADDRESS.to_string(),
            connect_timeout_secs: 10,
            socket_identity: None,
            byte_order: ByteOrder::default(),
            verify_version: true,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_contexts: DEFAULT_MAX_CONTEXTS,
            reply_timeout_secs: 30,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            backpressure_timeout_ms: DEFAULT_BACKPRESSURE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl CoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl DispatchConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }

    /// Writer settings derived from this section.
    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_pending_frames: self.max_pending_frames,
            channel_capacity: self.channel_capacity,
            backpressure_timeout: Duration::from_millis(self.backpressure_timeout_ms),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be read or parsed
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(environment())
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with defaults and environment variables
    ///
    /// # Errors
    ///
    /// Returns an error if environment variables cannot be parsed
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder().add_source(environment()).build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check limits that deserialization cannot express.
    pub fn validate(&self) -> Result<()> {
        parse_endpoint(&self.core.server_address)?;

        let dispatch = &self.dispatch;
        if dispatch.max_contexts == 0 || dispatch.max_contexts > MAX_CONTEXT_CAPACITY {
            return Err(invalid(format!(
                "dispatch.max_contexts must be between 1 and {}",
                MAX_CONTEXT_CAPACITY
            )));
        }
        if dispatch.reply_timeout_secs == 0 {
            return Err(invalid("dispatch.reply_timeout_secs must be positive".into()));
        }
        if dispatch.channel_capacity == 0 || dispatch.max_pending_frames == 0 {
            return Err(invalid(
                "dispatch.channel_capacity and dispatch.max_pending_frames must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
}

fn invalid(message: String) -> GatewayError {
    GatewayError::Config(config::ConfigError::Message(message))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.core.server_address, "tcp://datafed.ornl.gov:7513");
        assert_eq!(config.dispatch.max_contexts, 50);
        assert_eq!(config.dispatch.reply_timeout(), Duration::from_secs(30));
        assert_eq!(config.core.byte_order, ByteOrder::BigEndian);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[core]
server_address = "tcp://core.local:9000"
byte_order = "little-endian"
socket_identity = "web-01"

[schema]
protocol_files = ["SDMS_Anon.proto", "SDMS_Auth.proto"]

[dispatch]
max_contexts = 8
"#
        )
        .unwrap();

        let config = GatewayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.core.server_address, "tcp://core.local:9000");
        assert_eq!(config.core.byte_order, ByteOrder::LittleEndian);
        assert_eq!(config.core.socket_identity.as_deref(), Some("web-01"));
        assert_eq!(config.schema.protocol_files.len(), 2);
        assert_eq!(config.dispatch.max_contexts, 8);
        // untouched keys keep their defaults
        assert_eq!(config.dispatch.reply_timeout_secs, 30);
        assert!(config.core.verify_version);
    }

    #[test]
    fn test_from_ini_file() {
        let mut file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        writeln!(file, "[core]\nserver_address = tcp://10.0.0.5:7513\n").unwrap();

        let config = GatewayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.core.server_address, "tcp://10.0.0.5:7513");
    }

    #[test]
    fn test_validate_rejects_bad_limits() {
        let mut config = GatewayConfig::default();
        config.dispatch.max_contexts = 0;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.dispatch.max_contexts = MAX_CONTEXT_CAPACITY + 1;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.core.server_address = "ipc:///tmp/core".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let result = GatewayConfig::from_file("/nonexistent/gateway.toml");
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }
}
