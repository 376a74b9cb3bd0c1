//! Routing key -> session registry with bounded size and LRU eviction.
//!
//! One explicitly-owned instance is shared by the control plane (register,
//! unregister) and the HTTP plane (lookup on every public request). Lookups
//! mutate recency, so the whole structure sits behind a single short
//! `parking_lot::Mutex` critical section; no I/O ever happens under the lock,
//! and session teardown triggered by eviction runs after it is released.
//!
//! Recency is an arena of slots threaded on an intrusive doubly-linked list
//! (head = most recent), giving O(1) register, lookup, recency bump and
//! eviction. Recency moves on `lookup` and `register` only; health traffic
//! never touches the registry, so an idle-but-healthy client is not kept
//! alive (or penalized) by probes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use culvert_protocol::CloseReason;

use crate::session::Session;

struct Slot {
    key: String,
    session: Arc<Session>,
    /// Neighbor toward the most-recently-used end.
    prev: Option<usize>,
    /// Neighbor toward the least-recently-used end.
    next: Option<usize>,
}

#[derive(Default)]
struct RegistryInner {
    map: HashMap<String, usize>,
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl RegistryInner {
    fn slot(&self, idx: usize) -> &Slot {
        self.slots[idx].as_ref().expect("occupied slot")
    }

    fn slot_mut(&mut self, idx: usize) -> &mut Slot {
        self.slots[idx].as_mut().expect("occupied slot")
    }

    fn insert_slot(&mut self, slot: Slot) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        }
    }

    fn take_slot(&mut self, idx: usize) -> Slot {
        self.free.push(idx);
        self.slots[idx].take().expect("occupied slot")
    }

    /// Unlink a slot from the recency list without freeing it.
    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = self.slot_mut(idx);
            (slot.prev.take(), slot.next.take())
        };
        match prev {
            Some(p) => self.slot_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slot_mut(n).prev = prev,
            None => self.tail = prev,
        }
    }

    /// Link a detached slot in as the most recently used.
    fn push_front(&mut self, idx: usize) {
        let old_head = self.head.replace(idx);
        {
            let slot = self.slot_mut(idx);
            slot.prev = None;
            slot.next = old_head;
        }
        match old_head {
            Some(h) => self.slot_mut(h).prev = Some(idx),
            None => self.tail = Some(idx),
        }
    }

    /// Detach and return the least recently used slot, if any.
    fn pop_tail(&mut self) -> Option<usize> {
        let idx = self.tail?;
        self.detach(idx);
        Some(idx)
    }
}

/// Bounded mapping from routing key to the live session serving it.
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
    capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(capacity: usize) -> Arc<Self> {
        assert!(capacity > 0, "registry capacity must be at least 1");
        Arc::new(Self {
            inner: Mutex::new(RegistryInner::default()),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a session under its routing key.
    ///
    /// An existing holder of the key is superseded (last writer wins), and if
    /// the registry is at capacity the least-recently-used entry is pushed
    /// out. Either victim is closed after the lock is released, failing its
    /// in-flight exchanges with `SessionEvicted`.
    pub fn register(&self, session: Arc<Session>) {
        let key = session.routing_key().to_string();
        let mut superseded = None;
        let mut evicted = None;

        {
            let mut inner = self.inner.lock();

            if let Some(idx) = inner.map.remove(&key) {
                inner.detach(idx);
                superseded = Some(inner.take_slot(idx).session);
            }

            if inner.map.len() >= self.capacity {
                if let Some(idx) = inner.pop_tail() {
                    let slot = inner.take_slot(idx);
                    inner.map.remove(&slot.key);
                    evicted = Some(slot);
                }
            }

            let idx = inner.insert_slot(Slot {
                key: key.clone(),
                session,
                prev: None,
                next: None,
            });
            inner.push_front(idx);
            inner.map.insert(key, idx);
        }

        if let Some(old) = superseded {
            tracing::info!(routing_key = old.routing_key(), "Superseding existing tunnel");
            old.close(CloseReason::Superseded, "routing key re-registered");
        }
        if let Some(slot) = evicted {
            tracing::info!(routing_key = %slot.key, "Evicting least-recently-used tunnel");
            slot.session
                .close(CloseReason::Evicted, "registry capacity reached");
        }
    }

    /// Look up the session for a routing key, refreshing its recency.
    /// Never blocks on I/O; this sits on every public request's path.
    pub fn lookup(&self, key: &str) -> Option<Arc<Session>> {
        let mut inner = self.inner.lock();
        let idx = *inner.map.get(key)?;
        inner.detach(idx);
        inner.push_front(idx);
        Some(inner.slot(idx).session.clone())
    }

    /// Forcibly evict a key, closing its session. True if it was present.
    pub fn evict(&self, key: &str) -> bool {
        let session = {
            let mut inner = self.inner.lock();
            match inner.map.remove(key) {
                Some(idx) => {
                    inner.detach(idx);
                    inner.take_slot(idx).session
                }
                None => return false,
            }
        };
        session.close(CloseReason::Evicted, "evicted");
        true
    }

    /// Remove a key only if it still belongs to the given session.
    ///
    /// Used by a session's own cleanup; the token guard keeps a slow
    /// teardown from removing the session that superseded it.
    pub fn unregister(&self, key: &str, token: Uuid) -> bool {
        let mut inner = self.inner.lock();
        let Some(&idx) = inner.map.get(key) else {
            return false;
        };
        if inner.slot(idx).session.token() != token {
            return false;
        }
        inner.map.remove(key);
        inner.detach(idx);
        inner.take_slot(idx);
        true
    }

    /// Routing keys ordered most to least recently used.
    pub fn routing_keys(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut keys = Vec::with_capacity(inner.map.len());
        let mut cursor = inner.head;
        while let Some(idx) = cursor {
            let slot = inner.slot(idx);
            keys.push(slot.key.clone());
            cursor = slot.next;
        }
        keys
    }
}
