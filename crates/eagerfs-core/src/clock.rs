// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Monotonic ticket generator for deferred operations

use std::sync::atomic::{AtomicU64, Ordering};

/// Ticket owned by one deferred operation for its whole lifetime.
/// Tickets order all submissions across the filesystem; zero is reserved
/// for "no operation yet" in path records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(pub u64);

impl EventId {
    pub const NONE: EventId = EventId(0);

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-wide event clock. Strictly increasing, never reused.
pub struct EventClock {
    next: AtomicU64,
}

impl EventClock {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> EventId {
        EventId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for EventClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn tickets_are_strictly_increasing() {
        let clock = EventClock::new();
        let mut last = EventId::NONE;
        for _ in 0..1000 {
            let id = clock.next();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn concurrent_allocation_never_reuses_a_ticket() {
        let clock = Arc::new(EventClock::new());
        let mut joins = Vec::new();
        for _ in 0..8 {
            let clock = Arc::clone(&clock);
            joins.push(thread::spawn(move || {
                (0..500).map(|_| clock.next()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for join in joins {
            for id in join.join().expect("clock thread") {
                assert!(seen.insert(id), "ticket {id} issued twice");
            }
        }
        assert_eq!(seen.len(), 8 * 500);
    }
}
