//! Context table - bounded pool of correlation slots.
//!
//! Each in-flight request owns one slot; its index travels in the frame
//! header as the `context_id` and comes back on the reply. The table is an
//! arena with a stack of free indices, so allocate and release are O(1) and
//! the most recently freed slot is handed out next.
//!
//! A slot's generation changes on every allocation. Holders of a [`Ticket`]
//! can release "their" allocation without ever freeing a slot that has since
//! been handed to another request.
//!
//! Closing the table fails every later allocation with
//! [`GatewayError::ConnectionClosed`]; the connection it served is gone.
//!
//! # Example
//!
//! ```
//! use core_gateway::dispatch::ContextTable;
//! use core_gateway::GatewayError;
//!
//! let mut table = ContextTable::new(2).unwrap();
//! let a = table.allocate("first").unwrap();
//! let _b = table.allocate("second").unwrap();
//!
//! assert!(matches!(table.allocate("third"), Err(GatewayError::Busy)));
//!
//! assert_eq!(table.release(a.id()), Some("first"));
//! assert_eq!(table.allocate("third").unwrap().id(), a.id());
//! ```

use crate::error::{GatewayError, Result};

/// Default number of concurrent requests.
pub const DEFAULT_MAX_CONTEXTS: usize = 50;

/// Largest capacity addressable by a 16-bit context id.
pub const MAX_CONTEXT_CAPACITY: usize = 1 << 16;

/// Proof of one allocation of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket {
    id: u16,
    generation: u32,
}

impl Ticket {
    /// Context id carried on the wire.
    #[inline]
    pub fn id(&self) -> u16 {
        self.id
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

struct Slot<T> {
    generation: u32,
    entry: Option<T>,
}

/// Fixed-capacity table of pending entries keyed by context id.
pub struct ContextTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u16>,
    closed: bool,
}

impl<T> ContextTable<T> {
    /// Create a table with `capacity` slots (1 to 65536).
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity > MAX_CONTEXT_CAPACITY {
            return Err(GatewayError::Config(config::ConfigError::Message(format!(
                "max_contexts must be between 1 and {}, got {}",
                MAX_CONTEXT_CAPACITY, capacity
            ))));
        }

        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                entry: None,
            })
            .collect();
        // Popped from the back, so ids are first handed out in ascending order.
        let free = (0..capacity).rev().map(|i| i as u16).collect();

        Ok(Self {
            slots,
            free,
            closed: false,
        })
    }

    /// Store `entry` in a free slot.
    ///
    /// Fails with [`GatewayError::Busy`] when every slot is in use and with
    /// [`GatewayError::ConnectionClosed`] once the table is closed; the
    /// entry is dropped and nothing is queued.
    pub fn allocate(&mut self, entry: T) -> Result<Ticket> {
        if self.closed {
            return Err(GatewayError::ConnectionClosed);
        }
        let id = self.free.pop().ok_or(GatewayError::Busy)?;
        let slot = &mut self.slots[id as usize];
        slot.generation = slot.generation.wrapping_add(1);
        slot.entry = Some(entry);
        Ok(Ticket {
            id,
            generation: slot.generation,
        })
    }

    /// Free a slot, returning its entry if one was pending.
    ///
    /// Releasing a free or out-of-range id is a no-op.
    pub fn release(&mut self, id: u16) -> Option<T> {
        let slot = self.slots.get_mut(id as usize)?;
        let entry = slot.entry.take()?;
        self.free.push(id);
        Some(entry)
    }

    /// Free a slot only if it still holds the allocation named by `ticket`.
    pub fn release_ticket(&mut self, ticket: Ticket) -> Option<T> {
        let current = self.slots.get(ticket.id as usize)?.generation;
        if current != ticket.generation {
            return None;
        }
        self.release(ticket.id)
    }

    /// Pending entry for an id.
    pub fn get(&self, id: u16) -> Option<&T> {
        self.slots.get(id as usize)?.entry.as_ref()
    }

    /// Whether `id` currently holds a pending entry.
    pub fn is_in_use(&self, id: u16) -> bool {
        self.get(id).is_some()
    }

    /// Number of slots holding a pending entry.
    #[inline]
    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Number of free slots.
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Release every slot and return the pending entries.
    pub fn drain(&mut self) -> Vec<(u16, T)> {
        let mut drained = Vec::with_capacity(self.in_use());
        for id in 0..self.slots.len() {
            if let Some(entry) = self.release(id as u16) {
                drained.push((id as u16, entry));
            }
        }
        drained
    }

    /// Refuse further allocations and return the pending entries.
    pub fn close(&mut self) -> Vec<(u16, T)> {
        self.closed = true;
        self.drain()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_ids_are_unique_until_released() {
        let mut table = ContextTable::new(DEFAULT_MAX_CONTEXTS).unwrap();
        let mut seen = HashSet::new();

        for i in 0..DEFAULT_MAX_CONTEXTS {
            let ticket = table.allocate(i).unwrap();
            assert!(seen.insert(ticket.id()));
        }
        assert_eq!(table.in_use(), DEFAULT_MAX_CONTEXTS);
        assert_eq!(table.available(), 0);
    }

    #[test]
    fn test_first_ids_ascending() {
        let mut table = ContextTable::new(4).unwrap();
        let ids: Vec<u16> = (0..4).map(|i| table.allocate(i).unwrap().id()).collect();
        assert_eq!(ids, [0, 1, 2, 3]);
    }

    #[test]
    fn test_busy_when_full_then_recovers() {
        let mut table = ContextTable::new(DEFAULT_MAX_CONTEXTS).unwrap();
        let tickets: Vec<_> = (0..DEFAULT_MAX_CONTEXTS)
            .map(|i| table.allocate(i).unwrap())
            .collect();

        assert!(matches!(table.allocate(99), Err(GatewayError::Busy)));

        let freed = tickets[17].id();
        assert_eq!(table.release(freed), Some(17));
        let ticket = table.allocate(100).unwrap();
        assert_eq!(ticket.id(), freed);
        assert_eq!(table.get(freed), Some(&100));
    }

    #[test]
    fn test_most_recently_freed_is_reused() {
        let mut table = ContextTable::new(8).unwrap();
        let a = table.allocate('a').unwrap();
        let b = table.allocate('b').unwrap();

        table.release(a.id());
        table.release(b.id());
        assert_eq!(table.allocate('c').unwrap().id(), b.id());
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut table = ContextTable::new(2).unwrap();
        let ticket = table.allocate("x").unwrap();

        assert_eq!(table.release(ticket.id()), Some("x"));
        assert_eq!(table.release(ticket.id()), None);
        assert_eq!(table.release(999), None);
        assert_eq!(table.available(), 2);
    }

    #[test]
    fn test_stale_ticket_does_not_free_new_allocation() {
        let mut table = ContextTable::new(1).unwrap();
        let old = table.allocate("old").unwrap();
        table.release(old.id());
        let new = table.allocate("new").unwrap();

        assert_eq!(old.id(), new.id());
        assert_ne!(old.generation(), new.generation());
        assert_eq!(table.release_ticket(old), None);
        assert!(table.is_in_use(new.id()));
        assert_eq!(table.release_ticket(new), Some("new"));
    }

    #[test]
    fn test_drain_returns_pending() {
        let mut table = ContextTable::new(4).unwrap();
        table.allocate(1).unwrap();
        let t = table.allocate(2).unwrap();
        table.allocate(3).unwrap();
        table.release(t.id());

        let drained = table.drain();
        assert_eq!(drained, vec![(0, 1), (2, 3)]);
        assert_eq!(table.in_use(), 0);
    }

    #[test]
    fn test_capacity_bounds() {
        assert!(ContextTable::<()>::new(0).is_err());
        assert!(ContextTable::<()>::new(MAX_CONTEXT_CAPACITY + 1).is_err());
        let table = ContextTable::<()>::new(MAX_CONTEXT_CAPACITY).unwrap();
        assert_eq!(table.capacity(), MAX_CONTEXT_CAPACITY);
    }

    #[test]
    fn test_closed_table_refuses_allocation() {
        let mut table = ContextTable::new(3).unwrap();
        table.allocate("a").unwrap();

        assert_eq!(table.close(), vec![(0, "a")]);
        assert!(table.is_closed());
        assert!(matches!(table.allocate("b"), Err(GatewayError::ConnectionClosed)));
        assert_eq!(table.available(), 3);
    }
}
