//! Reply demultiplexer.
//!
//! Every reply read from the backend connection is routed back to the
//! request that is waiting in the context slot named by its header. The
//! slot is released before the waiter is woken, so a caller may issue its
//! next request straight from the completion.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;

use super::PendingTable;
use crate::protocol::{ByteOrder, Frame};
use crate::schema::{MessageType, SchemaRegistry};

/// Decoded content of a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyBody {
    /// Payload decoded as the reply's message type.
    Message(Value),
    /// The reply carried no payload; only its type is meaningful.
    Bare,
    /// The payload did not decode; holds the decode error.
    Undecodable(String),
}

/// A reply delivered to a waiting request.
#[derive(Debug, Clone)]
pub struct Reply {
    pub message_type: Arc<MessageType>,
    pub context_id: u16,
    pub route: Option<Bytes>,
    pub body: ReplyBody,
}

impl Reply {
    /// Simple name of the reply's message type.
    #[inline]
    pub fn name(&self) -> &str {
        self.message_type.name()
    }

    /// Decoded message data, if any.
    pub fn data(&self) -> Option<&Value> {
        match &self.body {
            ReplyBody::Message(value) => Some(value),
            _ => None,
        }
    }

    /// Message data, with a bare reply as an empty object.
    pub fn into_data(self) -> Option<Value> {
        match self.body {
            ReplyBody::Message(value) => Some(value),
            ReplyBody::Bare => Some(Value::Object(Default::default())),
            ReplyBody::Undecodable(_) => None,
        }
    }
}

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Decoded and handed to its waiter.
    Delivered,
    /// Handed to its waiter without a decodable body.
    Degraded,
    /// Header names a message id the registry does not know.
    UnknownMessage,
    /// No request is waiting on the context id.
    NoWaiter,
    /// Envelope could not be parsed.
    Malformed,
}

/// Routes inbound envelopes to pending requests.
#[derive(Clone)]
pub struct Demultiplexer {
    registry: Arc<SchemaRegistry>,
    contexts: PendingTable,
    order: ByteOrder,
}

impl Demultiplexer {
    pub(crate) fn new(registry: Arc<SchemaRegistry>, contexts: PendingTable, order: ByteOrder) -> Self {
        Self {
            registry,
            contexts,
            order,
        }
    }

    /// Route one multipart message read from the backend.
    pub fn route(&self, parts: Vec<Bytes>) -> RouteOutcome {
        let frame = match Frame::from_parts(parts, self.order) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Dropping malformed reply: {}", e);
                return RouteOutcome::Malformed;
            }
        };

        let context_id = frame.context_id();
        let message_id = frame.message_type();

        // The slot stays allocated; the waiter's timeout reclaims it.
        let Some(message_type) = self.registry.by_id(message_id).cloned() else {
            tracing::warn!(
                context_id,
                message_id = format_args!("{:#06x}", message_id),
                "Dropping reply with unknown message id"
            );
            return RouteOutcome::UnknownMessage;
        };

        let body = if frame.header.has_payload() {
            match message_type.decode(frame.payload()) {
                Ok(value) => ReplyBody::Message(value),
                Err(e) => {
                    tracing::warn!(context_id, "Reply payload did not decode: {}", e);
                    ReplyBody::Undecodable(e.to_string())
                }
            }
        } else {
            ReplyBody::Bare
        };

        let pending = self.contexts.lock().release(context_id);
        let Some(pending) = pending else {
            tracing::debug!(
                context_id,
                reply = message_type.name(),
                "No request waiting for reply, dropping"
            );
            return RouteOutcome::NoWaiter;
        };

        let outcome = match body {
            ReplyBody::Undecodable(_) => RouteOutcome::Degraded,
            _ => RouteOutcome::Delivered,
        };

        tracing::trace!(
            context_id,
            request = pending.request.name(),
            reply = message_type.name(),
            elapsed = ?pending.sent_at.elapsed(),
            "reply routed"
        );

        let reply = Reply {
            message_type,
            context_id,
            route: frame.route,
            body,
        };
        if pending.tx.send(reply).is_err() {
            tracing::debug!(context_id, "Requester went away before its reply arrived");
        }

        outcome
    }

    /// Fail every pending request and refuse new ones; callers see
    /// `ConnectionClosed`.
    pub fn fail_all(&self) -> usize {
        let drained = self.contexts.lock().close();
        if !drained.is_empty() {
            tracing::warn!(
                pending = drained.len(),
                "Backend connection ended with requests in flight"
            );
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use parking_lot::Mutex;
    use serde_json::json;
    use tokio::sync::oneshot;

    use super::*;
    use crate::dispatch::{ContextTable, Pending};

    const ANON: &str = r#"
        package SDMS.Anon;
        enum Protocol { ID = 1; }
        message AckReply {}
        message NackReply { required uint32 err_code = 1; optional string err_msg = 2; }
        message PingRequest {}
    "#;

    fn setup() -> (Demultiplexer, PendingTable, Arc<SchemaRegistry>) {
        let registry = Arc::new(
            SchemaRegistry::builder()
                .load("anon.proto", ANON)
                .unwrap()
                .build()
                .unwrap(),
        );
        let contexts: PendingTable = Arc::new(Mutex::new(ContextTable::new(4).unwrap()));
        let demux = Demultiplexer::new(registry.clone(), contexts.clone(), ByteOrder::BigEndian);
        (demux, contexts, registry)
    }

    fn pending(registry: &SchemaRegistry) -> (Pending, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        let request = registry.by_name("PingRequest").unwrap().clone();
        (
            Pending {
                tx,
                request,
                sent_at: Instant::now(),
            },
            rx,
        )
    }

    fn reply_parts(message_type: u16, context_id: u16, payload: &[u8]) -> Vec<Bytes> {
        Frame::new(
            message_type,
            context_id,
            Bytes::copy_from_slice(payload),
            None,
        )
        .to_parts(ByteOrder::BigEndian)
    }

    #[tokio::test]
    async fn test_delivers_and_releases() {
        let (demux, contexts, registry) = setup();
        let (entry, rx) = pending(&registry);
        let ticket = contexts.lock().allocate(entry).unwrap();

        let payload = registry
            .encode("NackReply", &json!({"err_code": 2, "err_msg": "no"}))
            .unwrap();
        let outcome = demux.route(reply_parts(0x0101, ticket.id(), &payload));

        assert_eq!(outcome, RouteOutcome::Delivered);
        assert!(!contexts.lock().is_in_use(ticket.id()));
        let reply = rx.await.unwrap();
        assert_eq!(reply.name(), "NackReply");
        assert_eq!(reply.data(), Some(&json!({"err_code": 2, "err_msg": "no"})));
    }

    #[tokio::test]
    async fn test_bare_reply() {
        let (demux, contexts, registry) = setup();
        let (entry, rx) = pending(&registry);
        let ticket = contexts.lock().allocate(entry).unwrap();

        assert_eq!(demux.route(reply_parts(0x0100, ticket.id(), &[])), RouteOutcome::Delivered);
        let reply = rx.await.unwrap();
        assert_eq!(reply.body, ReplyBody::Bare);
        assert_eq!(reply.into_data(), Some(json!({})));
    }

    #[tokio::test]
    async fn test_undecodable_payload_still_frees_slot() {
        let (demux, contexts, registry) = setup();
        let (entry, rx) = pending(&registry);
        let ticket = contexts.lock().allocate(entry).unwrap();

        let outcome = demux.route(reply_parts(0x0101, ticket.id(), &[0x0A, 0x09, 0x01]));

        assert_eq!(outcome, RouteOutcome::Degraded);
        assert_eq!(contexts.lock().available(), 4);
        assert!(matches!(rx.await.unwrap().body, ReplyBody::Undecodable(_)));
    }

    #[test]
    fn test_no_waiter_is_dropped() {
        let (demux, contexts, _) = setup();
        assert_eq!(demux.route(reply_parts(0x0100, 3, &[])), RouteOutcome::NoWaiter);
        assert_eq!(contexts.lock().available(), 4);
    }

    #[test]
    fn test_unknown_message_id_keeps_slot() {
        let (demux, contexts, registry) = setup();
        let (entry, _rx) = pending(&registry);
        let ticket = contexts.lock().allocate(entry).unwrap();

        assert_eq!(
            demux.route(reply_parts(0x0177, ticket.id(), &[])),
            RouteOutcome::UnknownMessage
        );
        assert!(contexts.lock().is_in_use(ticket.id()));
    }

    #[test]
    fn test_malformed_envelope() {
        let (demux, _, _) = setup();
        let outcome = demux.route(vec![Bytes::new(), Bytes::from_static(b"bad")]);
        assert_eq!(outcome, RouteOutcome::Malformed);
    }

    #[tokio::test]
    async fn test_fail_all_closes_waiters() {
        let (demux, contexts, registry) = setup();
        let (entry, rx) = pending(&registry);
        contexts.lock().allocate(entry).unwrap();

        assert_eq!(demux.fail_all(), 1);
        assert!(rx.await.is_err());
        assert_eq!(contexts.lock().in_use(), 0);
    }
}
