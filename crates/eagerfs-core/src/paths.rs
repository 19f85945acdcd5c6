// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Path directory: one synchronization record per path with pending work

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};

use crate::clock::EventId;

/// Sentinel key for the global barrier used by restrictive-dirs mode.
pub(crate) const SENTINEL: &str = "";

pub(crate) fn sentinel_path() -> &'static Path {
    Path::new(SENTINEL)
}

/// Fields guarded by the record serializer.
pub(crate) struct RecordState {
    /// Whole-path lock ownership; a flag rather than a held guard so a
    /// scoped barrier can travel into a deferred closure.
    pub(crate) locked: bool,
    /// Ticket of the most recently submitted operation on this path.
    pub(crate) last_event: EventId,
    /// Tickets submitted on this path whose closures have not completed.
    pub(crate) pending: BTreeSet<EventId>,
}

/// Per-path synchronization record. Records live until teardown; the
/// directory never garbage-collects them.
pub struct PathRecord {
    state: Mutex<RecordState>,
    signal: Condvar,
}

impl PathRecord {
    fn new() -> Self {
        Self {
            state: Mutex::new(RecordState {
                locked: false,
                last_event: EventId::NONE,
                pending: BTreeSet::new(),
            }),
            signal: Condvar::new(),
        }
    }

    /// Lock the record state, recovering from poisoning so drain signals
    /// still fire after a panicking closure (contract W2).
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wait<'a>(
        &self,
        guard: MutexGuard<'a, RecordState>,
    ) -> MutexGuard<'a, RecordState> {
        self.signal.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn notify_all(&self) {
        self.signal.notify_all();
    }

    /// Release the whole-path lock taken by a `LockWhole` barrier.
    pub(crate) fn unlock(&self) {
        let mut state = self.lock_state();
        debug_assert!(state.locked);
        state.locked = false;
        drop(state);
        self.notify_all();
    }
}

/// Mapping from path to synchronization record. Read-mostly: lookups take
/// the shared side; only first-touch insertion takes the exclusive side.
pub struct PathDirectory {
    map: RwLock<HashMap<PathBuf, Arc<PathRecord>>>,
}

impl PathDirectory {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn lookup(&self, path: &Path) -> Option<Arc<PathRecord>> {
        let map = self.map.read().unwrap_or_else(PoisonError::into_inner);
        map.get(path).cloned()
    }

    pub fn lookup_or_create(&self, path: &Path) -> Arc<PathRecord> {
        if let Some(record) = self.lookup(path) {
            return record;
        }
        let mut map = self.map.write().unwrap_or_else(PoisonError::into_inner);
        // Another writer may have inserted between the phases.
        Arc::clone(
            map.entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(PathRecord::new())),
        )
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PathDirectory {
    fn default() -> Self {
        Self::new()
    }
}
