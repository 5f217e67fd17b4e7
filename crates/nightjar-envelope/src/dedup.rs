//! Bounded remembered-set for inbound event deduplication.

use std::collections::{HashSet, VecDeque};

use crate::ids::EventId;

/// Remembers recently seen event ids, forgetting the oldest once a
/// capacity is reached.
///
/// Transports deliver at least once; this is the "at most once upward"
/// half of the contract.  The window is bounded so a long-lived poller
/// cannot grow without limit; the chain validation upstream catches
/// anything that slips past a full window.
#[derive(Debug)]
pub struct SeenEvents {
    /// Ids currently remembered.
    seen: HashSet<EventId>,
    /// Insertion order, for eviction.
    order: VecDeque<EventId>,
    /// Maximum number of remembered ids.
    capacity: usize,
}

/// Default remembered-set capacity.
const DEFAULT_CAPACITY: usize = 4096;

impl SeenEvents {
    /// Construct a remembered-set with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Construct a remembered-set with a given capacity.
    ///
    /// A zero capacity is treated as 1.
    pub fn with_capacity(capacity: usize) -> Self {
        SeenEvents {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record `id`; return true if it was new, false if already seen.
    pub fn insert(&mut self, id: EventId) -> bool {
        if self.seen.contains(&id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id);
        self.seen.insert(id);
        true
    }

    /// Return true if `id` has been seen (and is still remembered).
    pub fn contains(&self, id: &EventId) -> bool {
        self.seen.contains(id)
    }

    /// Number of ids currently remembered.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True if nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl Default for SeenEvents {
    fn default() -> Self {
        SeenEvents::new()
    }
}
