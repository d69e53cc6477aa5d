//! Request dispatcher.
//!
//! Turns a named message into a frame, reserves a context slot for the
//! reply and waits for it:
//!
//! ```text
//! call ─► identity check ─► encode ─► allocate slot ─► writer ─► backend
//!                                          ▲                       │
//!                                          └─ release ◄─ demux ◄───┘
//! ```
//!
//! The waiter is registered before the frame is queued, so a reply that
//! arrives immediately is never missed. Every wait is bounded by the reply
//! timeout; a slot is always given back when its caller stops waiting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::oneshot;

use super::context::Ticket;
use super::demux::{Reply, ReplyBody};
use super::{Pending, PendingTable};
use crate::error::{GatewayError, Result};
use crate::protocol::{ByteOrder, Frame};
use crate::schema::SchemaRegistry;
use crate::writer::{OutboundMessage, WriterHandle};

/// Default time to wait for a reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Field a backend reply uses to report failure.
const ERROR_CODE_FIELD: &str = "err_code";

/// Field carrying the failure text.
const ERROR_MESSAGE_FIELD: &str = "err_msg";

/// Sends requests and awaits their replies.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<SchemaRegistry>,
    contexts: PendingTable,
    writer: WriterHandle,
    order: ByteOrder,
    reply_timeout: Duration,
    max_payload_size: u32,
}

/// Releases a ticket when the waiting caller is done, however it finishes.
struct SlotGuard<'a> {
    contexts: &'a PendingTable,
    ticket: Ticket,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        // No-op when the demultiplexer already released the slot.
        self.contexts.lock().release_ticket(self.ticket);
    }
}

impl Dispatcher {
    pub(crate) fn new(
        registry: Arc<SchemaRegistry>,
        contexts: PendingTable,
        writer: WriterHandle,
        order: ByteOrder,
        reply_timeout: Duration,
        max_payload_size: u32,
    ) -> Self {
        Self {
            registry,
            contexts,
            writer,
            order,
            reply_timeout,
            max_payload_size,
        }
    }

    /// Send a request on behalf of an authenticated caller.
    ///
    /// Fails with `NotAuthenticated` before anything is allocated when no
    /// identity is given. The identity is the routing token of the frame.
    /// Replies without a usable body map to `EmptyReply` and replies with a
    /// non-zero `err_code` map to `BackendError`.
    pub async fn call(&self, name: &str, payload: &Value, identity: Option<&str>) -> Result<Reply> {
        let identity = identity
            .filter(|id| !id.is_empty())
            .ok_or(GatewayError::NotAuthenticated)?;

        let reply = self.exchange(name, payload, Some(identity)).await?;
        screen_reply(reply)
    }

    /// Send a system-initiated request and return whatever comes back.
    ///
    /// `client` names the backend session the request acts for; an empty
    /// string sends no routing token.
    pub async fn call_direct(&self, name: &str, client: &str, payload: &Value) -> Result<Reply> {
        let route = Some(client).filter(|c| !c.is_empty());
        self.exchange(name, payload, route).await
    }

    async fn exchange(&self, name: &str, payload: &Value, route: Option<&str>) -> Result<Reply> {
        let message_type = self
            .registry
            .by_name(name)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownMessageType(name.to_string()))?;

        let body = Bytes::from(message_type.encode(payload)?);
        if body.len() > self.max_payload_size as usize {
            return Err(GatewayError::encode(
                name,
                format!(
                    "payload of {} bytes exceeds maximum {}",
                    body.len(),
                    self.max_payload_size
                ),
            ));
        }

        let (tx, rx) = oneshot::channel();
        let sent_at = Instant::now();
        let ticket = self.contexts.lock().allocate(Pending {
            tx,
            request: Arc::clone(&message_type),
            sent_at,
        })?;
        let _guard = SlotGuard {
            contexts: &self.contexts,
            ticket,
        };

        let frame = Frame::new(
            message_type.numeric_id(),
            ticket.id(),
            body,
            route.map(|r| Bytes::copy_from_slice(r.as_bytes())),
        );
        self.writer
            .send(OutboundMessage::from_frame(&frame, self.order))
            .await?;

        tracing::debug!(
            request = message_type.name(),
            context_id = ticket.id(),
            payload_len = frame.payload.len(),
            "request sent"
        );

        match tokio::time::timeout(self.reply_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(GatewayError::ConnectionClosed),
            Err(_) => {
                let elapsed = sent_at.elapsed();
                tracing::warn!(
                    request = message_type.name(),
                    context_id = ticket.id(),
                    ?elapsed,
                    "request timed out"
                );
                Err(GatewayError::Timeout {
                    context_id: ticket.id(),
                    elapsed,
                })
            }
        }
    }

    /// Number of requests awaiting a reply.
    pub fn in_flight(&self) -> usize {
        self.contexts.lock().in_use()
    }

    /// Number of free context slots.
    pub fn available_contexts(&self) -> usize {
        self.contexts.lock().available()
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }
}

/// Map a reply to the caller-facing result.
pub fn screen_reply(reply: Reply) -> Result<Reply> {
    match &reply.body {
        ReplyBody::Undecodable(_) => Err(GatewayError::EmptyReply),
        ReplyBody::Bare => Ok(reply),
        ReplyBody::Message(value) => match error_code(value) {
            Some(code) => {
                let message = value
                    .get(ERROR_MESSAGE_FIELD)
                    .and_then(Value::as_str)
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("error code: {}", code));
                Err(GatewayError::BackendError { code, message })
            }
            None => Ok(reply),
        },
    }
}

fn error_code(value: &Value) -> Option<i64> {
    value
        .get(ERROR_CODE_FIELD)
        .and_then(Value::as_i64)
        .filter(|&code| code != 0)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::schema::SchemaRegistry;

    fn reply(body: ReplyBody) -> Reply {
        let registry = SchemaRegistry::builder()
            .load(
                "t.proto",
                "package T; enum Protocol { ID = 1; } \
                 message NackReply { optional uint32 err_code = 1; optional string err_msg = 2; }",
            )
            .unwrap()
            .build()
            .unwrap();
        Reply {
            message_type: registry.by_name("NackReply").unwrap().clone(),
            context_id: 0,
            route: None,
            body,
        }
    }

    #[test]
    fn test_screen_error_code_with_message() {
        let result = screen_reply(reply(ReplyBody::Message(
            json!({"err_code": 5, "err_msg": "Record not found"}),
        )));
        match result {
            Err(GatewayError::BackendError { code, message }) => {
                assert_eq!(code, 5);
                assert_eq!(message, "Record not found");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_screen_error_code_without_message() {
        let result = screen_reply(reply(ReplyBody::Message(json!({"err_code": 3}))));
        assert_eq!(result.unwrap_err().to_string(), "Backend error: error code: 3");
    }

    #[test]
    fn test_screen_passes_success() {
        assert!(screen_reply(reply(ReplyBody::Message(json!({"err_code": 0})))).is_ok());
        assert!(screen_reply(reply(ReplyBody::Message(json!({})))).is_ok());
        assert!(screen_reply(reply(ReplyBody::Bare)).is_ok());
    }

    #[test]
    fn test_screen_undecodable_is_empty_reply() {
        let result = screen_reply(reply(ReplyBody::Undecodable("bad".into())));
        assert!(matches!(result, Err(GatewayError::EmptyReply)));
    }
}
