//! Gateway builder and runtime loop.
//!
//! The [`GatewayBuilder`] configures limits and the connection; the
//! [`Gateway`] owns the lifecycle:
//! 1. Connect to the backend and complete the ZMTP handshake
//! 2. Spawn the writer task on the write half
//! 3. Spawn the read loop that feeds the demultiplexer
//! 4. Optionally verify the backend's API version
//!
//! # Example
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
//!     let reply = gateway
//!         .call("UserViewRequest", &json!({"uid": "u/jdoe"}), Some("u/jdoe"))
//!         .await?;
//!     println!("{}: {:?}", reply.name(), reply.data());
//!
//!     gateway.shutdown().await
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::GatewayConfig;
use crate::dispatch::{
    pending_table, Demultiplexer, Dispatcher, Reply, DEFAULT_MAX_CONTEXTS, DEFAULT_REPLY_TIMEOUT,
};
use crate::error::{GatewayError, Result};
use crate::protocol::{ByteOrder, DEFAULT_MAX_PAYLOAD_SIZE};
use crate::schema::{ApiVersion, ReleaseStamp, SchemaRegistry};
use crate::transport::{self, Inbound, MultipartBuffer, PeerInfo, SocketType};
use crate::writer::{spawn_writer_task, WriterConfig};

/// Name of the request used for the startup version check.
pub const VERSION_REQUEST: &str = "VersionRequest";

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Smallest per-part limit for inbound frames.
const MIN_PART_LIMIT: usize = 64 * 1024;

/// Builder for configuring and starting a [`Gateway`].
pub struct GatewayBuilder {
    registry: Arc<SchemaRegistry>,
    writer_config: WriterConfig,
    max_contexts: usize,
    reply_timeout: Duration,
    connect_timeout: Duration,
    byte_order: ByteOrder,
    identity: Option<String>,
    max_payload_size: u32,
    verify_version: bool,
}

impl GatewayBuilder {
    /// Create a builder around a loaded registry.
    pub fn new(registry: impl Into<Arc<SchemaRegistry>>) -> Self {
        Self {
            registry: registry.into(),
            writer_config: WriterConfig::default(),
            max_contexts: DEFAULT_MAX_CONTEXTS,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            byte_order: ByteOrder::default(),
            identity: None,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            verify_version: false,
        }
    }

    /// Apply every setting from a loaded configuration.
    pub fn with_config(self, config: &GatewayConfig) -> Self {
        let mut builder = self
            .max_contexts(config.dispatch.max_contexts)
            .reply_timeout(config.dispatch.reply_timeout())
            .connect_timeout(config.core.connect_timeout())
            .byte_order(config.core.byte_order)
            .max_payload_size(config.dispatch.max_payload_size)
            .verify_version(config.core.verify_version);
        builder.writer_config = config.dispatch.writer_config();
        builder.identity = config.core.socket_identity.clone();
        builder
    }

    /// Set the number of context slots.
    ///
    /// Default: 50
    pub fn max_contexts(mut self, limit: usize) -> Self {
        self.max_contexts = limit;
        self
    }

    /// Set how long a request waits for its reply.
    ///
    /// Default: 30 seconds
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Set the TCP connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the byte order of frame header fields.
    ///
    /// Must match the backend. Default: big-endian
    pub fn byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }

    /// Set the identity announced to the backend router.
    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Set the largest payload accepted in either direction.
    ///
    /// Inbound messages with a larger part (never below 64 KiB) are
    /// skipped and their callers time out.
    pub fn max_payload_size(mut self, limit: u32) -> Self {
        self.max_payload_size = limit;
        self
    }

    /// Check the backend's API version during start.
    pub fn verify_version(mut self, verify: bool) -> Self {
        self.verify_version = verify;
        self
    }

    /// Set the maximum queued outbound messages.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.writer_config.max_pending_frames = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.writer_config.channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.writer_config.backpressure_timeout = timeout;
        self
    }

    /// Connect to the backend at `address` and start.
    pub async fn connect(self, address: &str) -> Result<Gateway> {
        let stream = transport::connect(address, self.connect_timeout).await?;
        self.start_with_stream(stream).await
    }

    /// Start over an already-open byte stream.
    pub async fn start_with_stream<S>(self, mut stream: S) -> Result<Gateway>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let contexts = pending_table(self.max_contexts)?;

        let peer = transport::handshake(
            &mut stream,
            SocketType::Dealer,
            self.identity.as_deref().map(str::as_bytes),
        )
        .await?;

        let (reader, write_half) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task(write_half, self.writer_config);

        let dispatcher = Dispatcher::new(
            self.registry.clone(),
            contexts.clone(),
            writer,
            self.byte_order,
            self.reply_timeout,
            self.max_payload_size,
        );
        let demux = Demultiplexer::new(self.registry, contexts, self.byte_order);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let part_limit = (self.max_payload_size as usize).max(MIN_PART_LIMIT);
        let reader_task = tokio::spawn(read_loop(reader, demux.clone(), part_limit, shutdown_rx));

        let gateway = Gateway {
            dispatcher,
            demux,
            peer,
            shutdown_tx: Some(shutdown_tx),
            reader_task,
            writer_task,
        };

        if self.verify_version {
            let checked = gateway.check_backend_version().await;
            if let Err(e) = checked {
                tracing::error!("Backend version check failed: {}", e);
                gateway.shutdown().await?;
                return Err(e);
            }
        }

        Ok(gateway)
    }
}

/// Version reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendVersion {
    pub api: ApiVersion,
    pub release: Option<ReleaseStamp>,
}

impl BackendVersion {
    fn from_reply(data: &Value) -> Result<Self> {
        let field = |name: &str| data.get(name).and_then(Value::as_u64).map(|v| v as u32);

        let api = ApiVersion::new(
            field("api_major").ok_or(GatewayError::EmptyReply)?,
            field("api_minor").ok_or(GatewayError::EmptyReply)?,
            field("api_patch").unwrap_or(0),
        );
        let release = match (
            field("release_year"),
            field("release_month"),
            field("release_day"),
            field("release_hour"),
            field("release_minute"),
        ) {
            (Some(year), Some(month), Some(day), Some(hour), Some(minute)) => Some(ReleaseStamp {
                year,
                month,
                day,
                hour,
                minute,
            }),
            _ => None,
        };

        Ok(Self { api, release })
    }
}

/// A running gateway.
///
/// Calls may be issued concurrently from any number of tasks; share the
/// gateway behind an `Arc` or clone its [`Dispatcher`].
pub struct Gateway {
    dispatcher: Dispatcher,
    demux: Demultiplexer,
    peer: PeerInfo,
    shutdown_tx: Option<oneshot::Sender<()>>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<Result<()>>,
}

impl Gateway {
    /// Create a new gateway builder.
    pub fn builder(registry: impl Into<Arc<SchemaRegistry>>) -> GatewayBuilder {
        GatewayBuilder::new(registry)
    }

    /// Send a request for an authenticated caller and await the reply.
    pub async fn call(&self, name: &str, payload: &Value, identity: Option<&str>) -> Result<Reply> {
        self.dispatcher.call(name, payload, identity).await
    }

    /// Send a system-initiated request and await the raw reply.
    pub async fn call_direct(&self, name: &str, client: &str, payload: &Value) -> Result<Reply> {
        self.dispatcher.call_direct(name, client, payload).await
    }

    /// Send a request and invoke `on_reply` with the outcome.
    ///
    /// A missing identity is reported through `on_reply` before returning.
    pub fn submit<F>(&self, name: &str, payload: Value, identity: Option<&str>, on_reply: F)
    where
        F: FnOnce(Result<Reply>) + Send + 'static,
    {
        let Some(identity) = identity.filter(|id| !id.is_empty()) else {
            on_reply(Err(GatewayError::NotAuthenticated));
            return;
        };

        let dispatcher = self.dispatcher.clone();
        let name = name.to_string();
        let identity = identity.to_string();
        tokio::spawn(async move {
            let result = dispatcher.call(&name, &payload, Some(&identity)).await;
            on_reply(result);
        });
    }

    /// Ask the backend for its version and check it against the schema.
    ///
    /// Fails with `IncompatibleVersion` when the API major version differs
    /// or the backend's minor version is outside the accepted window. A
    /// newer backend release only logs a warning.
    pub async fn check_backend_version(&self) -> Result<BackendVersion> {
        let reply = self
            .dispatcher
            .call_direct(VERSION_REQUEST, "", &json!({}))
            .await?;
        let data = reply.data().ok_or(GatewayError::EmptyReply)?;
        let remote = BackendVersion::from_reply(data)?;

        let Some(local) = self.registry().version() else {
            tracing::debug!(api = %remote.api, "No local version loaded, skipping check");
            return Ok(remote);
        };

        if let Some(local_api) = &local.api {
            if !local_api.is_compatible_with(&remote.api) {
                return Err(GatewayError::IncompatibleVersion(remote.api.to_string()));
            }
        }

        if let Some(release) = remote.release.filter(|r| *r > local.release) {
            tracing::warn!(
                latest = %release,
                running = %local.release,
                "A newer web server may be available"
            );
        }

        tracing::info!(api = %remote.api, "Backend version accepted");
        Ok(remote)
    }

    /// The request dispatcher, for sharing with other tasks.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        self.dispatcher.registry()
    }

    /// What the backend announced during the handshake.
    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    /// Number of requests awaiting a reply.
    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    /// Number of free context slots.
    pub fn available_contexts(&self) -> usize {
        self.dispatcher.available_contexts()
    }

    /// Whether the read loop is still running.
    pub fn is_connected(&self) -> bool {
        !self.reader_task.is_finished()
    }

    /// Stop the read loop, fail outstanding requests and close the writer.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.reader_task).await;
        // Anything still pending after the reader stopped can never complete.
        self.demux.fail_all();
        self.writer_task.abort();
        Ok(())
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Read loop - reassembles messages and routes them to waiting requests.
///
/// On exit every pending request is failed and the context table is
/// closed, so later calls fail with `ConnectionClosed` at once.
async fn read_loop<R>(
    reader: R,
    demux: Demultiplexer,
    part_limit: usize,
    shutdown_rx: oneshot::Receiver<()>,
) where
    R: AsyncRead + Unpin,
{
    match read_messages(reader, &demux, part_limit, shutdown_rx).await {
        Ok(()) => tracing::info!("Backend read loop stopped"),
        Err(e) => tracing::error!("Read loop error: {}", e),
    }
    demux.fail_all();
}

async fn read_messages<R>(
    mut reader: R,
    demux: &Demultiplexer,
    part_limit: usize,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = MultipartBuffer::new(part_limit);
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = tokio::select! {
            _ = &mut shutdown_rx => return Ok(()),
            read = reader.read(&mut buf) => read?,
        };
        if n == 0 {
            return Err(GatewayError::ConnectionClosed);
        }

        for unit in buffer.push(&buf[..n])? {
            match unit {
                Inbound::Message(parts) => {
                    demux.route(parts);
                }
                Inbound::Command(command) => {
                    tracing::debug!(command = %command.name, "Ignoring backend command");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::builder()
            .load("t.proto", "package T; enum Protocol { ID = 1; } message AckReply {}")
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let builder = Gateway::builder(registry());
        assert_eq!(builder.max_contexts, DEFAULT_MAX_CONTEXTS);
        assert_eq!(builder.reply_timeout, DEFAULT_REPLY_TIMEOUT);
        assert_eq!(builder.byte_order, ByteOrder::BigEndian);
        assert!(!builder.verify_version);
    }

    #[test]
    fn test_builder_with_config() {
        let mut config = GatewayConfig::default();
        config.dispatch.max_contexts = 7;
        config.dispatch.reply_timeout_secs = 2;
        config.core.socket_identity = Some("web-7".into());
        config.core.byte_order = ByteOrder::LittleEndian;

        let builder = Gateway::builder(registry()).with_config(&config);
        assert_eq!(builder.max_contexts, 7);
        assert_eq!(builder.reply_timeout, Duration::from_secs(2));
        assert_eq!(builder.identity.as_deref(), Some("web-7"));
        assert_eq!(builder.byte_order, ByteOrder::LittleEndian);
        assert!(builder.verify_version);
    }

    #[test]
    fn test_backend_version_from_reply() {
        let version = BackendVersion::from_reply(&json!({
            "api_major": 1, "api_minor": 4, "api_patch": 2,
            "release_year": 2024, "release_month": 6, "release_day": 17,
            "release_hour": 10, "release_minute": 40
        }))
        .unwrap();

        assert_eq!(version.api, ApiVersion::new(1, 4, 2));
        assert_eq!(version.release.unwrap().to_string(), "2024.6.17.10.40");

        assert!(BackendVersion::from_reply(&json!({"api_major": 1})).is_err());
    }

    #[tokio::test]
    async fn test_start_rejects_zero_contexts() {
        let (client, _server) = tokio::io::duplex(1024);
        let result = Gateway::builder(registry())
            .max_contexts(0)
            .start_with_stream(client)
            .await;
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }
}
