// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Handle table: stable ids for virtual handles with late-bound descriptors

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};

use crossbeam_queue::SegQueue;

use crate::error::{FsError, FsResult};
use crate::sys;

/// Stable integer id the kernel framework carries in its handle slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandleId(pub u64);

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backing-descriptor lifecycle. `Failed` keeps waiters from blocking
/// forever when a deferred open could not produce a descriptor.
enum BindState {
    Unbound,
    Bound(OwnedFd),
    Failed(i32),
}

struct HandleState {
    descriptor: BindState,
    pipe: Option<(OwnedFd, OwnedFd)>,
}

/// Virtual handle slot. The table owns the slot for the life of the
/// process; its identity is stable across recycling.
pub struct HandleSlot {
    state: Mutex<HandleState>,
    opened: Condvar,
}

impl HandleSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(HandleState {
                descriptor: BindState::Unbound,
                pipe: None,
            }),
            opened: Condvar::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind the backing descriptor. A bound descriptor is never rebound;
    /// a second bind is an impossible state and aborts loudly.
    pub fn bind(&self, fd: OwnedFd) {
        let mut state = self.lock_state();
        match state.descriptor {
            BindState::Unbound => state.descriptor = BindState::Bound(fd),
            _ => panic!("virtual handle bound twice"),
        }
        drop(state);
        self.opened.notify_all();
    }

    /// Record a failed backing open and wake every waiter.
    pub fn bind_failure(&self, errno: i32) {
        let mut state = self.lock_state();
        match state.descriptor {
            BindState::Unbound => state.descriptor = BindState::Failed(errno),
            _ => panic!("virtual handle bound twice"),
        }
        drop(state);
        self.opened.notify_all();
    }

    /// The backing descriptor, blocking until the deferred open binds it.
    pub fn descriptor(&self) -> FsResult<RawFd> {
        let mut state = self.lock_state();
        loop {
            match &state.descriptor {
                BindState::Bound(fd) => return Ok(fd.as_raw_fd()),
                BindState::Failed(errno) => return Err(FsError::from_errno(*errno)),
                BindState::Unbound => {
                    state = self.opened.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Duplicate the bound descriptor (reservoir flush path).
    pub fn dup_descriptor(&self) -> FsResult<OwnedFd> {
        let fd = self.descriptor()?;
        Ok(sys::dup(fd)?)
    }

    /// Adopt the descriptor out of the slot (release path). The slot is
    /// left failed so a use-after-release errors instead of hanging.
    pub fn take_descriptor(&self) -> FsResult<OwnedFd> {
        let mut state = self.lock_state();
        loop {
            match std::mem::replace(&mut state.descriptor, BindState::Failed(libc::EBADF)) {
                BindState::Bound(fd) => return Ok(fd),
                BindState::Failed(errno) => {
                    state.descriptor = BindState::Failed(errno);
                    return Err(FsError::from_errno(errno));
                }
                BindState::Unbound => {
                    state.descriptor = BindState::Unbound;
                    state = self.opened.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Write end of the handle pipe, creating the pair on first use.
    pub fn pipe_write_fd(&self) -> FsResult<RawFd> {
        let mut state = self.lock_state();
        if state.pipe.is_none() {
            state.pipe = Some(sys::pipe()?);
        }
        Ok(state.pipe.as_ref().map(|(_, w)| w.as_raw_fd()).unwrap())
    }

    /// Read end of the handle pipe, creating the pair on first use.
    pub fn pipe_read_fd(&self) -> FsResult<RawFd> {
        let mut state = self.lock_state();
        if state.pipe.is_none() {
            state.pipe = Some(sys::pipe()?);
        }
        Ok(state.pipe.as_ref().map(|(r, _)| r.as_raw_fd()).unwrap())
    }

    fn reset(&self) {
        let mut state = self.lock_state();
        state.descriptor = BindState::Unbound;
        state.pipe = None;
    }
}

/// Append-only slab of slots plus a lock-free free list of recycled ids.
/// Appending never moves existing slots; `get` is concurrent.
pub struct HandleTable {
    slots: RwLock<Vec<Arc<HandleSlot>>>,
    free: SegQueue<u64>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            free: SegQueue::new(),
        }
    }

    /// A fresh or recycled id. Recycled slots are reset before reuse.
    pub fn acquire(&self) -> HandleId {
        if let Some(id) = self.free.pop() {
            let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
            slots[id as usize].reset();
            return HandleId(id);
        }
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots.push(Arc::new(HandleSlot::new()));
        HandleId(slots.len() as u64 - 1)
    }

    pub fn get(&self, id: HandleId) -> FsResult<Arc<HandleSlot>> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots
            .get(id.0 as usize)
            .cloned()
            .ok_or(FsError::BadHandle)
    }

    /// Return the id to the free list. Callers only release after every
    /// pending operation against the id has completed.
    pub fn release(&self, id: HandleId) {
        self.free.push(id.0);
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn acquire_hands_out_distinct_ids() {
        let table = HandleTable::new();
        let a = table.acquire();
        let b = table.acquire();
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn released_ids_are_recycled_with_fresh_state() {
        let table = HandleTable::new();
        let id = table.acquire();
        let (_, write_end) = sys::pipe().expect("pipe");
        table.get(id).expect("slot").bind(write_end.try_clone().expect("dup"));
        table.release(id);

        let again = table.acquire();
        assert_eq!(id, again);
        assert_eq!(table.len(), 1);
        // Recycled slot is unbound again.
        let slot = table.get(again).expect("slot");
        slot.bind_failure(libc::ENOENT);
        assert!(slot.descriptor().is_err());
    }

    #[test]
    fn unknown_ids_are_rejected() {
        let table = HandleTable::new();
        assert!(matches!(table.get(HandleId(42)), Err(FsError::BadHandle)));
    }

    #[test]
    fn descriptor_blocks_until_late_bind() {
        let table = HandleTable::new();
        let id = table.acquire();
        let slot = table.get(id).expect("slot");

        let waiter = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.descriptor().expect("bound descriptor"))
        };
        thread::sleep(Duration::from_millis(20));
        let (read_end, _write_end) = sys::pipe().expect("pipe");
        let expected = read_end.as_raw_fd();
        slot.bind(read_end);
        assert_eq!(waiter.join().expect("waiter"), expected);
    }

    #[test]
    fn bind_failure_unblocks_waiters_with_the_errno() {
        let table = HandleTable::new();
        let slot = table.get(table.acquire()).expect("slot");
        let waiter = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.descriptor())
        };
        thread::sleep(Duration::from_millis(20));
        slot.bind_failure(libc::EACCES);
        let err = waiter.join().expect("waiter").expect_err("must fail");
        assert_eq!(err.errno(), libc::EACCES);
    }

    #[test]
    fn take_descriptor_leaves_the_slot_unusable() {
        let table = HandleTable::new();
        let slot = table.get(table.acquire()).expect("slot");
        let (read_end, _write_end) = sys::pipe().expect("pipe");
        slot.bind(read_end);
        let _fd = slot.take_descriptor().expect("adopt");
        assert!(slot.descriptor().is_err());
    }
}
