//! Reusable small-integer session identities, one pool per transport.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, PoisonError},
};
use tracing::trace;

use crate::event::TransportKind;

/// Identity numbering for sessions starts here.
pub const FIRST_SESSION_ID: u32 = 1;

/// Hands out the smallest identity not currently outstanding.
#[derive(Debug, Default)]
pub struct IdPool {
    floor: u32,
    next: u32,
    released: BTreeSet<u32>,
}

impl IdPool {
    /// Pool whose first identity is 0.
    #[must_use]
    pub fn new() -> Self {
        Self::with_floor(0)
    }

    #[must_use]
    pub fn with_floor(floor: u32) -> Self {
        Self {
            floor,
            next: floor,
            released: BTreeSet::new(),
        }
    }

    pub fn allocate(&mut self) -> u32 {
        if let Some(id) = self.released.pop_first() {
            return id;
        }
        let id = self.next;
        self.next += 1;
        id
    }

    /// Returns `id` to the pool. Identities that were never handed out, or
    /// are already free, are ignored.
    pub fn release(&mut self, id: u32) {
        if id < self.floor || id >= self.next {
            return;
        }
        if id + 1 == self.next {
            self.next = id;
            // Fold trailing free identities back into the counter.
            while self.next > self.floor && self.released.remove(&(self.next - 1)) {
                self.next -= 1;
            }
        } else {
            self.released.insert(id);
        }
    }

    /// Number of identities currently outstanding.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        (self.next - self.floor) as usize - self.released.len()
    }
}

/// Process-wide session identity pools, keyed by transport.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    pools: Mutex<HashMap<TransportKind, IdPool>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reserves the smallest free identity for `transport`. The identity is
    /// returned to the pool when the lease is dropped.
    pub fn open(self: &Arc<Self>, transport: TransportKind) -> SessionLease {
        let id = self
            .pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(transport)
            .or_insert_with(|| IdPool::with_floor(FIRST_SESSION_ID))
            .allocate();
        trace!(%transport, id, "Session identity allocated");
        SessionLease {
            registry: Arc::clone(self),
            transport,
            id,
        }
    }

    #[must_use]
    pub fn active(&self, transport: TransportKind) -> usize {
        self.pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&transport)
            .map_or(0, IdPool::outstanding)
    }

    fn release(&self, transport: TransportKind, id: u32) {
        if let Some(pool) = self
            .pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&transport)
        {
            pool.release(id);
        }
        trace!(%transport, id, "Session identity released");
    }
}

/// An identity held by one live session.
#[derive(Debug)]
pub struct SessionLease {
    registry: Arc<SessionRegistry>,
    transport: TransportKind,
    id: u32,
}

impl SessionLease {
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub const fn transport(&self) -> TransportKind {
        self.transport
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.registry.release(self.transport, self.id);
    }
}
