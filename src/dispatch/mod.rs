//! Dispatch module - request/reply correlation.
//!
//! - [`ContextTable`]: bounded pool of context slots
//! - [`Dispatcher`]: encodes and sends requests, waits for replies
//! - [`Demultiplexer`]: routes replies back to their waiting requests

mod context;
mod demux;
mod dispatcher;

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::schema::MessageType;

pub use context::{ContextTable, Ticket, DEFAULT_MAX_CONTEXTS, MAX_CONTEXT_CAPACITY};
pub use demux::{Demultiplexer, Reply, ReplyBody, RouteOutcome};
pub use dispatcher::{screen_reply, Dispatcher, DEFAULT_REPLY_TIMEOUT};

/// A request waiting in a context slot.
pub struct Pending {
    pub(crate) tx: oneshot::Sender<Reply>,
    pub(crate) request: Arc<MessageType>,
    pub(crate) sent_at: Instant,
}

/// Context table shared by the dispatcher and the reader task.
pub type PendingTable = Arc<Mutex<ContextTable<Pending>>>;

/// Create an empty shared table.
pub fn pending_table(capacity: usize) -> crate::Result<PendingTable> {
    Ok(Arc::new(Mutex::new(ContextTable::new(capacity)?)))
}
