// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Bounded worker pool running deferred mutation closures.
//!
//! The pool itself is order-free; per-path submission order comes from
//! the write barrier each job acquires before its closure runs.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use tracing::error;

use crate::barrier::Submission;
use crate::error::FsResult;

pub(crate) struct DeferredOp {
    pub(crate) label: &'static str,
    pub(crate) path: PathBuf,
    pub(crate) submission: Submission,
    pub(crate) run: Box<dyn FnOnce() -> FsResult<()> + Send>,
}

pub(crate) struct DeferredExecutor {
    queue: Arc<SegQueue<DeferredOp>>,
    signal: Arc<(Mutex<bool>, Condvar)>,
    shutdown: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl DeferredExecutor {
    pub(crate) fn new(thread_count: usize) -> Self {
        let queue = Arc::new(SegQueue::<DeferredOp>::new());
        let signal = Arc::new((Mutex::new(false), Condvar::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(thread_count);

        for _ in 0..thread_count {
            let queue_clone = Arc::clone(&queue);
            let signal_clone = Arc::clone(&signal);
            let shutdown_clone = Arc::clone(&shutdown);
            handles.push(thread::spawn(move || {
                loop {
                    match queue_clone.pop() {
                        Some(job) => run_job(job),
                        None => {
                            // Drain before exit: the shutdown check only
                            // runs against an empty queue.
                            if shutdown_clone.load(Ordering::Acquire) {
                                break;
                            }
                            let (lock, cvar) = &*signal_clone;
                            let guard = lock.lock().unwrap();
                            let _ = cvar.wait_timeout(guard, Duration::from_millis(5)).unwrap();
                        }
                    }
                }
            }));
        }

        Self {
            queue,
            signal,
            shutdown,
            handles,
        }
    }

    pub(crate) fn submit(&self, op: DeferredOp) {
        self.queue.push(op);
        let (lock, cvar) = &*self.signal;
        if let Ok(mut pending) = lock.lock() {
            *pending = true;
            cvar.notify_one();
        }
    }

}

fn run_job(job: DeferredOp) {
    let DeferredOp {
        label,
        path,
        submission,
        run,
    } = job;
    let ticket = submission.ticket;
    let (held, aux) = submission.acquire_all();

    let result = panic::catch_unwind(AssertUnwindSafe(run));

    drop(held);
    drop(aux);

    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(
                target: "eagerfs::executor",
                ticket = ticket.as_u64(),
                op = label,
                path = %path.display(),
                errno = err.errno(),
                "deferred operation failed: {err}"
            );
        }
        Err(_) => {
            error!(
                target: "eagerfs::executor",
                ticket = ticket.as_u64(),
                op = label,
                path = %path.display(),
                "deferred operation panicked"
            );
        }
    }
}

impl Drop for DeferredExecutor {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        let (lock, cvar) = &*self.signal;
        if let Ok(mut pending) = lock.lock() {
            *pending = true;
            cvar.notify_all();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
