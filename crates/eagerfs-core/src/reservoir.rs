// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Late-close reservoir: descriptors whose close waits for teardown

use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use crate::sys;

/// Process-wide parking lot for descriptors under the very-late close
/// policy. An optional cap closes oldest-first under pressure so a
/// long-running process cannot exhaust its descriptor table.
pub struct CloseReservoir {
    limit: usize,
    fds: Mutex<VecDeque<OwnedFd>>,
}

impl CloseReservoir {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            fds: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, fd: OwnedFd) {
        let mut fds = self.fds.lock().unwrap_or_else(PoisonError::into_inner);
        if self.limit > 0 && fds.len() >= self.limit {
            if let Some(oldest) = fds.pop_front() {
                debug!(target: "eagerfs::reservoir", "cap reached, closing oldest descriptor");
                if let Err(err) = sys::close(oldest) {
                    warn!(target: "eagerfs::reservoir", "close failed: {err}");
                }
            }
        }
        fds.push_back(fd);
    }

    /// Close everything. Returns how many descriptors were closed.
    pub fn drain(&self) -> usize {
        let drained: VecDeque<OwnedFd> = {
            let mut fds = self.fds.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *fds)
        };
        let count = drained.len();
        for fd in drained {
            if let Err(err) = sys::close(fd) {
                warn!(target: "eagerfs::reservoir", "close failed: {err}");
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.fds.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for CloseReservoir {
    fn drop(&mut self) {
        let count = self.drain();
        if count > 0 {
            debug!(target: "eagerfs::reservoir", count, "closed reservoir at teardown");
        }
    }
}
