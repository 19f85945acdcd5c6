// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Scoped barriers serializing callers against pending deferred work.
//!
//! A reader barrier waits until everything submitted on a path before it
//! has drained. A writer barrier is split across the two ends of the
//! deferred pipeline: the dispatcher registers it at submission time (so
//! later readers observe the operation as pending the moment the client
//! sees success), and the executing side acquires it before running the
//! closure (so same-path closures run in submission order).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock::{EventClock, EventId};
use crate::paths::{sentinel_path, PathDirectory, PathRecord};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierMode {
    /// Wait for pending work, then let go of the path.
    JustBarrier,
    /// Wait for pending work and hold the path lock until drop.
    LockWhole,
}

/// Scoped wait until all prior pending work on one path drains.
///
/// `JustBarrier` construction on an untouched path is free: no record
/// means nothing was ever submitted there.
pub struct ReadBarrier {
    record: Option<Arc<PathRecord>>,
}

impl ReadBarrier {
    pub fn new(directory: &PathDirectory, path: &Path, mode: BarrierMode) -> Self {
        let record = match mode {
            BarrierMode::LockWhole => Some(directory.lookup_or_create(path)),
            BarrierMode::JustBarrier => directory.lookup(path),
        };

        let mut held = None;
        if let Some(record) = record {
            let mut state = record.lock_state();
            let snapshot = state.last_event;
            while state.locked || state.pending.range(..=snapshot).next().is_some() {
                state = record.wait(state);
            }
            if mode == BarrierMode::LockWhole {
                state.locked = true;
                drop(state);
                held = Some(record);
            }
        }
        Self { record: held }
    }

    /// Reader for directory enumeration: keyed on the global sentinel in
    /// restrictive-dirs mode so mutations anywhere drain first.
    pub fn for_directory(
        directory: &PathDirectory,
        path: &Path,
        restrictive: bool,
        mode: BarrierMode,
    ) -> Self {
        let key = if restrictive { sentinel_path() } else { path };
        Self::new(directory, key, mode)
    }
}

impl Drop for ReadBarrier {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            record.unlock();
        }
    }
}

/// Submission-side half of a writer barrier. Dropping it (normally via
/// the `WriteBarrier` that consumed it) erases the ticket from the
/// record's pending list and signals waiters on every exit path.
pub(crate) struct WriteRegistration {
    record: Arc<PathRecord>,
    path: PathBuf,
    ticket: EventId,
    counted: Option<Arc<AtomicU64>>,
}

impl WriteRegistration {
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Execution-side half: wait until no pending ticket on this path
    /// precedes this one, then (for `LockWhole`) hold the path lock.
    pub(crate) fn acquire(self, mode: BarrierMode) -> WriteBarrier {
        {
            let mut state = self.record.lock_state();
            while state.locked || state.pending.range(..self.ticket).next().is_some() {
                state = self.record.wait(state);
            }
            if mode == BarrierMode::LockWhole {
                state.locked = true;
            }
        }
        WriteBarrier {
            locked: mode == BarrierMode::LockWhole,
            registration: self,
        }
    }
}

impl Drop for WriteRegistration {
    fn drop(&mut self) {
        {
            let mut state = self.record.lock_state();
            state.pending.remove(&self.ticket);
        }
        self.record.notify_all();
        if let Some(inflight) = &self.counted {
            inflight.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// An acquired writer barrier. Dropping releases the path lock (if held)
/// and completes the registration.
pub(crate) struct WriteBarrier {
    locked: bool,
    registration: WriteRegistration,
}

impl Drop for WriteBarrier {
    fn drop(&mut self) {
        if self.locked {
            self.registration.record.unlock();
        }
        // The registration field drops next: erase + broadcast.
    }
}

/// One submitted operation: its ticket, the registration per touched
/// path, and the auxiliary sentinel registration restrictive-dirs mode
/// adds to every mutation of a real path.
pub(crate) struct Submission {
    pub(crate) ticket: EventId,
    pub(crate) barriers: Vec<WriteRegistration>,
    pub(crate) sentinel: Option<WriteRegistration>,
}

impl Submission {
    /// Acquire every registered barrier in path order (the fixed order
    /// that keeps two-path operations from deadlocking against each
    /// other). The sentinel registration is never acquired, only held.
    pub(crate) fn acquire_all(self) -> (Vec<WriteBarrier>, Option<WriteRegistration>) {
        let held = self
            .barriers
            .into_iter()
            .map(|registration| registration.acquire(BarrierMode::LockWhole))
            .collect();
        (held, self.sentinel)
    }
}

/// Register one operation against every path it touches and hand the
/// submission to `enqueue` while the record serializers are still held.
///
/// Allocating the ticket and enqueueing inside the same critical section
/// makes per-path queue order equal per-path ticket order; a worker
/// waiting for a predecessor can then rely on that predecessor already
/// being in execution, never parked behind it in the queue.
pub(crate) fn register(
    directory: &PathDirectory,
    clock: &EventClock,
    inflight: &Arc<AtomicU64>,
    restrictive: bool,
    paths: &[&Path],
    enqueue: impl FnOnce(Submission),
) {
    debug_assert!(!paths.is_empty());
    let mut real: Vec<&Path> = paths.to_vec();
    real.sort();
    real.dedup();

    // Lock order: sentinel first (it sorts below every real path), then
    // the real paths in sorted order. Everyone who takes more than one
    // record serializer takes them in this order.
    let mut keys: Vec<&Path> = Vec::with_capacity(real.len() + 1);
    if restrictive {
        keys.push(sentinel_path());
    }
    keys.extend(real.iter().copied());

    let records: Vec<Arc<PathRecord>> = keys.iter().map(|p| directory.lookup_or_create(p)).collect();
    let mut guards: Vec<_> = records.iter().map(|r| r.lock_state()).collect();

    let ticket = clock.next();
    for guard in guards.iter_mut() {
        guard.pending.insert(ticket);
        guard.last_event = ticket;
    }
    inflight.fetch_add(1, Ordering::AcqRel);

    let mut sentinel = None;
    let mut barriers = Vec::with_capacity(real.len());
    for (key, record) in keys.iter().zip(records.iter()) {
        let registration = WriteRegistration {
            record: Arc::clone(record),
            path: key.to_path_buf(),
            ticket,
            counted: None,
        };
        if restrictive && *key == sentinel_path() {
            sentinel = Some(registration);
        } else {
            barriers.push(registration);
        }
    }
    // Exactly one in-flight decrement per submission.
    if let Some(first) = barriers.first_mut() {
        first.counted = Some(Arc::clone(inflight));
    }

    enqueue(Submission {
        ticket,
        barriers,
        sentinel,
    });
    // Guards drop here; the submission is already visible in the queue.
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    fn setup() -> (PathDirectory, EventClock, Arc<AtomicU64>) {
        (PathDirectory::new(), EventClock::new(), Arc::new(AtomicU64::new(0)))
    }

    fn submit_one(
        directory: &PathDirectory,
        clock: &EventClock,
        inflight: &Arc<AtomicU64>,
        path: &Path,
    ) -> Submission {
        let mut stash = None;
        register(directory, clock, inflight, false, &[path], |s| stash = Some(s));
        stash.expect("submission")
    }

    #[test]
    fn read_barrier_on_untouched_path_returns_immediately() {
        let (directory, _, _) = setup();
        let _barrier = ReadBarrier::new(&directory, Path::new("/a"), BarrierMode::JustBarrier);
        assert!(directory.is_empty());
    }

    #[test]
    fn registration_makes_the_operation_visible_as_pending() {
        let (directory, clock, inflight) = setup();
        let submission = submit_one(&directory, &clock, &inflight, Path::new("/a"));

        let record = directory.lookup(Path::new("/a")).expect("record");
        {
            let state = record.lock_state();
            assert_eq!(state.last_event, submission.ticket);
            assert!(state.pending.contains(&submission.ticket));
        }
        assert_eq!(inflight.load(Ordering::Acquire), 1);

        drop(submission);
        assert!(record.lock_state().pending.is_empty());
        assert_eq!(inflight.load(Ordering::Acquire), 0);
    }

    #[test]
    fn read_barrier_waits_for_pending_work() {
        let (directory, clock, inflight) = setup();
        let submission = submit_one(&directory, &clock, &inflight, Path::new("/a"));
        let directory = Arc::new(directory);

        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let directory = Arc::clone(&directory);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let _barrier =
                    ReadBarrier::new(&directory, Path::new("/a"), BarrierMode::JustBarrier);
                done.store(true, Ordering::Release);
            })
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!done.load(Ordering::Acquire), "reader returned early");

        let (held, _) = submission.acquire_all();
        drop(held);
        reader.join().expect("reader");
        assert!(done.load(Ordering::Acquire));
    }

    #[test]
    fn read_barrier_ignores_work_submitted_after_it_started() {
        let (directory, clock, inflight) = setup();
        let first = submit_one(&directory, &clock, &inflight, Path::new("/a"));
        drop(first.acquire_all().0);

        // Nothing pending: the barrier must not wait for the next ticket.
        let _barrier = ReadBarrier::new(&directory, Path::new("/a"), BarrierMode::JustBarrier);
        let _second = submit_one(&directory, &clock, &inflight, Path::new("/a"));
    }

    #[test]
    fn same_path_acquisition_waits_for_the_predecessor() {
        let (directory, clock, inflight) = setup();
        let first = submit_one(&directory, &clock, &inflight, Path::new("/a"));
        let second = submit_one(&directory, &clock, &inflight, Path::new("/a"));

        let order = Arc::new(AtomicU64::new(0));
        let runner = {
            let order = Arc::clone(&order);
            thread::spawn(move || {
                let (held, _) = second.acquire_all();
                let seen = order.load(Ordering::Acquire);
                drop(held);
                seen
            })
        };

        thread::sleep(Duration::from_millis(30));
        order.store(1, Ordering::Release);
        drop(first.acquire_all().0);
        assert_eq!(runner.join().expect("runner"), 1, "second ran before first drained");
    }

    #[test]
    fn cross_path_acquisition_does_not_wait() {
        let (directory, clock, inflight) = setup();
        let _first = submit_one(&directory, &clock, &inflight, Path::new("/a"));
        let second = submit_one(&directory, &clock, &inflight, Path::new("/b"));

        // The /a submission is still pending, but /b has no predecessor.
        let (held, _) = second.acquire_all();
        drop(held);
    }

    #[test]
    fn restrictive_mode_registers_the_sentinel() {
        let (directory, clock, inflight) = setup();
        let mut stash = None;
        register(&directory, &clock, &inflight, true, &[Path::new("/dir/file")], |s| {
            stash = Some(s)
        });
        let submission = stash.expect("submission");
        assert!(submission.sentinel.is_some());

        let sentinel = directory.lookup(sentinel_path()).expect("sentinel record");
        assert_eq!(sentinel.lock_state().last_event, submission.ticket);
        assert_eq!(inflight.load(Ordering::Acquire), 1);

        drop(submission);
        assert!(sentinel.lock_state().pending.is_empty());
        assert_eq!(inflight.load(Ordering::Acquire), 0);
    }

    #[test]
    fn sentinel_reader_blocks_until_the_mutation_completes() {
        let (directory, clock, inflight) = setup();
        let directory = Arc::new(directory);
        let mut stash = None;
        register(&directory, &clock, &inflight, true, &[Path::new("/dir/file")], |s| {
            stash = Some(s)
        });
        let submission = stash.expect("submission");

        let done = Arc::new(AtomicBool::new(false));
        let reader = {
            let directory = Arc::clone(&directory);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let _barrier = ReadBarrier::for_directory(
                    &directory,
                    Path::new("/dir"),
                    true,
                    BarrierMode::JustBarrier,
                );
                done.store(true, Ordering::Release);
            })
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!done.load(Ordering::Acquire), "opendir did not block");
        drop(submission);
        reader.join().expect("reader");
    }

    #[test]
    fn two_path_registration_orders_both_records() {
        let (directory, clock, inflight) = setup();
        let mut stash = None;
        register(
            &directory,
            &clock,
            &inflight,
            false,
            &[Path::new("/b"), Path::new("/a")],
            |s| stash = Some(s),
        );
        let submission = stash.expect("submission");
        assert_eq!(submission.barriers.len(), 2);
        // Acquisition order is sorted path order.
        assert_eq!(submission.barriers[0].path(), Path::new("/a"));
        assert_eq!(submission.barriers[1].path(), Path::new("/b"));

        for key in ["/a", "/b"] {
            let record = directory.lookup(Path::new(key)).expect("record");
            assert_eq!(record.lock_state().last_event, submission.ticket);
        }
        drop(submission);
        assert_eq!(inflight.load(Ordering::Acquire), 0);
    }
}
