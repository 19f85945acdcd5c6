// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! EagerFS Core — the deferred-operation engine behind a pass-through
//! filesystem that answers clients before the backing storage has
//! applied each mutation.
//!
//! The engine accepts filesystem calls from a kernel-framework adapter,
//! decides which calls run inline and which go to the worker pool,
//! enforces per-path submission order among deferred operations while
//! keeping unrelated paths parallel, and manages virtual file handles
//! whose backing descriptor may not exist yet when the client already
//! holds an open file. Durability is explicitly traded away: failed
//! deferred work is logged, never reported to the client.

pub mod barrier;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
mod executor;
pub mod handles;
pub mod paths;
pub mod reservoir;
mod sys;

pub use barrier::{BarrierMode, ReadBarrier};
pub use clock::{EventClock, EventId};
pub use config::Options;
pub use engine::{DirEntryInfo, Engine, Xattr};
pub use error::{FsError, FsResult};
pub use handles::{HandleId, HandleSlot, HandleTable};
pub use paths::{PathDirectory, PathRecord};
pub use reservoir::CloseReservoir;
