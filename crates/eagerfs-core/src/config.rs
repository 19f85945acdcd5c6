// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Tunables selecting eager vs. synchronous behavior per call class

use serde::{Deserialize, Serialize};

/// Option set handed to the engine at mount time. Every `eager_*` flag
/// moves the corresponding call class off the foreground thread; the
/// defaults reflect the batch workload the filesystem targets.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Defer `link`.
    pub eager_link: bool,
    /// Defer `chmod`.
    pub eager_chmod: bool,
    /// `access` returns success with no barrier at all.
    pub very_eager_access: bool,
    /// `access` drops the syscall after draining pending work.
    pub eager_access: bool,
    /// Defer `utimens`.
    pub eager_utimens: bool,
    /// Defer `chown` and `fallocate`.
    pub eager_chown: bool,
    /// Defer `flush`/`release`.
    pub eager_close: bool,
    /// Park descriptors in the reservoir instead of closing them.
    pub close_very_late: bool,
    /// Serialize mutations against directory enumerations through the
    /// global sentinel.
    pub restrictive_dirs: bool,
    /// Defer `fsync`.
    pub eager_fsync: bool,
    /// `fsync` returns success without touching storage.
    pub ignore_fsync: bool,
    /// Executor pool size.
    pub num_threads: usize,
    /// Reservoir descriptor cap; 0 keeps every descriptor until teardown.
    pub reservoir_limit: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            eager_link: true,
            eager_chmod: true,
            very_eager_access: true,
            eager_access: true,
            eager_utimens: true,
            eager_chown: true,
            eager_close: true,
            close_very_late: true,
            restrictive_dirs: false,
            eager_fsync: true,
            ignore_fsync: true,
            num_threads: 16,
            reservoir_limit: 0,
        }
    }
}
