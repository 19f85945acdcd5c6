// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Operation dispatcher: maps each filesystem call to its execution
//! shape (inline vs. deferred, which barrier) and owns the engine state.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::os::unix::fs::DirEntryExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::barrier::{self, BarrierMode, ReadBarrier};
use crate::clock::EventClock;
use crate::config::Options;
use crate::error::{FsError, FsResult};
use crate::executor::{DeferredExecutor, DeferredOp};
use crate::handles::{HandleId, HandleTable};
use crate::paths::PathDirectory;
use crate::reservoir::CloseReservoir;
use crate::sys;

/// One directory entry as the enumeration saw it.
pub struct DirEntryInfo {
    pub name: OsString,
    pub ino: u64,
    pub file_type: fs::FileType,
}

/// Reply to a sized xattr query: the probe form returns the length, the
/// sized form returns the bytes.
pub enum Xattr {
    Size(u32),
    Data(Vec<u8>),
}

/// The deferred-operation engine. All paths are mount-relative; the
/// engine resolves them against the backing root before any syscall.
pub struct Engine {
    root: PathBuf,
    options: Options,
    clock: EventClock,
    directory: PathDirectory,
    handles: Arc<HandleTable>,
    reservoir: Arc<CloseReservoir>,
    executor: Mutex<Option<DeferredExecutor>>,
    inflight: Arc<AtomicU64>,
}

impl Engine {
    pub fn new(root: impl Into<PathBuf>, options: Options) -> FsResult<Self> {
        let root = root.into();
        if !fs::metadata(&root)?.is_dir() {
            return Err(FsError::InvalidArgument);
        }
        let threads = options.num_threads.max(1);
        info!(
            target: "eagerfs::engine",
            root = %root.display(),
            threads,
            restrictive_dirs = options.restrictive_dirs,
            "engine starting"
        );
        Ok(Self {
            root,
            clock: EventClock::new(),
            directory: PathDirectory::new(),
            handles: Arc::new(HandleTable::new()),
            reservoir: Arc::new(CloseReservoir::new(options.reservoir_limit)),
            executor: Mutex::new(Some(DeferredExecutor::new(threads))),
            inflight: Arc::new(AtomicU64::new(0)),
            options,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deferred operations currently registered but not completed.
    pub fn pending_operations(&self) -> u64 {
        self.inflight.load(Ordering::Acquire)
    }

    pub fn reservoir_len(&self) -> usize {
        self.reservoir.len()
    }

    fn full(&self, path: &Path) -> PathBuf {
        let rel = path.strip_prefix("/").unwrap_or(path);
        self.root.join(rel)
    }

    fn read_barrier(&self, path: &Path) -> ReadBarrier {
        ReadBarrier::new(&self.directory, path, BarrierMode::JustBarrier)
    }

    /// Try to queue the closure on the executor. Hands the closure back
    /// when the executor is already torn down.
    fn try_defer(
        &self,
        paths: &[&Path],
        label: &'static str,
        run: Box<dyn FnOnce() -> FsResult<()> + Send>,
    ) -> Option<Box<dyn FnOnce() -> FsResult<()> + Send>> {
        let executor = self.executor.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(executor) = executor.as_ref() else {
            return Some(run);
        };
        let mut run = Some(run);
        let display = paths[0].to_path_buf();
        barrier::register(
            &self.directory,
            &self.clock,
            &self.inflight,
            self.options.restrictive_dirs,
            paths,
            |submission| {
                executor.submit(DeferredOp {
                    label,
                    path: display,
                    submission,
                    run: run.take().expect("submission enqueued once"),
                });
            },
        );
        None
    }

    /// Register, acquire the barriers and run the closure on this thread.
    fn run_inline(&self, paths: &[&Path], run: impl FnOnce() -> FsResult<()>) -> FsResult<()> {
        let mut stash = None;
        barrier::register(
            &self.directory,
            &self.clock,
            &self.inflight,
            self.options.restrictive_dirs,
            paths,
            |submission| stash = Some(submission),
        );
        let submission = stash.expect("submission registered");
        let (_held, _aux) = submission.acquire_all();
        run()
    }

    /// Register the operation against its paths and either queue it on
    /// the executor or run it inline under the acquired barrier. The
    /// deferred form returns success immediately; the inline form
    /// returns the closure's result.
    fn guarded(
        &self,
        defer: bool,
        paths: &[&Path],
        label: &'static str,
        run: impl FnOnce() -> FsResult<()> + Send + 'static,
    ) -> FsResult<()> {
        if defer {
            // Falls back to inline when the executor is already gone.
            match self.try_defer(paths, label, Box::new(run)) {
                None => Ok(()),
                Some(run) => self.run_inline(paths, run),
            }
        } else {
            self.run_inline(paths, run)
        }
    }

    // Reads

    pub fn getattr(&self, path: &Path) -> FsResult<libc::stat> {
        let _barrier = self.read_barrier(path);
        Ok(sys::lstat(&self.full(path))?)
    }

    pub fn getattr_handle(&self, path: &Path, id: HandleId) -> FsResult<libc::stat> {
        let _barrier = self.read_barrier(path);
        let fd = self.handles.get(id)?.descriptor()?;
        Ok(sys::fstat(fd)?)
    }

    pub fn access(&self, path: &Path, mask: i32) -> FsResult<()> {
        if self.options.very_eager_access {
            return Ok(());
        }
        let _barrier = self.read_barrier(path);
        if self.options.eager_access {
            return Ok(());
        }
        Ok(sys::access(&self.full(path), mask)?)
    }

    pub fn readlink(&self, path: &Path) -> FsResult<PathBuf> {
        let _barrier = self.read_barrier(path);
        Ok(fs::read_link(self.full(path))?)
    }

    pub fn statfs(&self, path: &Path) -> FsResult<libc::statvfs> {
        let _barrier = self.read_barrier(path);
        Ok(sys::statvfs(&self.full(path))?)
    }

    /// Enumerate a directory. Under restrictive-dirs this drains every
    /// pending mutation anywhere first; otherwise only work pending on
    /// the directory path itself.
    pub fn read_dir(&self, path: &Path) -> FsResult<Vec<DirEntryInfo>> {
        let _barrier = ReadBarrier::for_directory(
            &self.directory,
            path,
            self.options.restrictive_dirs,
            BarrierMode::JustBarrier,
        );
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.full(path))? {
            let entry = entry?;
            entries.push(DirEntryInfo {
                name: entry.file_name(),
                ino: entry.ino(),
                file_type: entry.file_type()?,
            });
        }
        Ok(entries)
    }

    pub fn read(&self, path: &Path, id: HandleId, offset: i64, size: u32) -> FsResult<Vec<u8>> {
        let _barrier = self.read_barrier(path);
        let fd = self.handles.get(id)?.descriptor()?;
        let mut buf = vec![0u8; size as usize];
        let n = sys::pread(fd, &mut buf, offset)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn getxattr(&self, path: &Path, name: &OsStr, size: u32) -> FsResult<Xattr> {
        let _barrier = self.read_barrier(path);
        let full = self.full(path);
        if size == 0 {
            let n = sys::getxattr(&full, name, &mut [])?;
            return Ok(Xattr::Size(n as u32));
        }
        let mut buf = vec![0u8; size as usize];
        let n = sys::getxattr(&full, name, &mut buf)?;
        buf.truncate(n);
        Ok(Xattr::Data(buf))
    }

    pub fn listxattr(&self, path: &Path, size: u32) -> FsResult<Xattr> {
        let _barrier = self.read_barrier(path);
        let full = self.full(path);
        if size == 0 {
            let n = sys::listxattr(&full, &mut [])?;
            return Ok(Xattr::Size(n as u32));
        }
        let mut buf = vec![0u8; size as usize];
        let n = sys::listxattr(&full, &mut buf)?;
        buf.truncate(n);
        Ok(Xattr::Data(buf))
    }

    pub fn flock(&self, path: &Path, id: HandleId, operation: i32) -> FsResult<()> {
        let _barrier = self.read_barrier(path);
        let fd = self.handles.get(id)?.descriptor()?;
        Ok(sys::flock(fd, operation)?)
    }

    // Synchronous structural mutations

    pub fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> FsResult<()> {
        Ok(sys::mknod(&self.full(path), mode, rdev)?)
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> FsResult<()> {
        Ok(sys::mkdir(&self.full(path), mode)?)
    }

    pub fn unlink(&self, path: &Path) -> FsResult<()> {
        // Pending work against the name keeps running; failures land in
        // the executor log, not here.
        Ok(fs::remove_file(self.full(path))?)
    }

    pub fn rmdir(&self, path: &Path) -> FsResult<()> {
        Ok(fs::remove_dir(self.full(path))?)
    }

    pub fn symlink(&self, target: &Path, link: &Path) -> FsResult<()> {
        Ok(std::os::unix::fs::symlink(target, self.full(link))?)
    }

    /// Rename drains the source first: pending work keyed on the old
    /// name must finish before the name disappears.
    pub fn rename(&self, from: &Path, to: &Path, flags: u32) -> FsResult<()> {
        if flags != 0 {
            return Err(FsError::InvalidArgument);
        }
        let _barrier = ReadBarrier::new(&self.directory, from, BarrierMode::LockWhole);
        Ok(fs::rename(self.full(from), self.full(to))?)
    }

    pub fn truncate(&self, path: &Path, size: i64) -> FsResult<()> {
        Ok(sys::truncate(&self.full(path), size)?)
    }

    pub fn truncate_handle(&self, id: HandleId, size: i64) -> FsResult<()> {
        let fd = self.handles.get(id)?.descriptor()?;
        Ok(sys::ftruncate(fd, size)?)
    }

    pub fn setxattr(&self, path: &Path, name: &OsStr, value: &[u8], flags: i32) -> FsResult<()> {
        let _barrier = self.read_barrier(path);
        Ok(sys::setxattr(&self.full(path), name, value, flags)?)
    }

    pub fn removexattr(&self, path: &Path, name: &OsStr) -> FsResult<()> {
        let _barrier = self.read_barrier(path);
        Ok(sys::removexattr(&self.full(path), name)?)
    }

    // Deferrable metadata mutations

    pub fn link(&self, from: &Path, to: &Path) -> FsResult<()> {
        let from_full = self.full(from);
        let to_full = self.full(to);
        self.guarded(self.options.eager_link, &[from, to], "link", move || {
            fs::hard_link(&from_full, &to_full)?;
            Ok(())
        })
    }

    pub fn chmod(&self, path: &Path, mode: u32) -> FsResult<()> {
        let full = self.full(path);
        self.guarded(self.options.eager_chmod, &[path], "chmod", move || {
            sys::chmod(&full, mode)?;
            Ok(())
        })
    }

    pub fn chown(&self, path: &Path, uid: Option<u32>, gid: Option<u32>) -> FsResult<()> {
        let full = self.full(path);
        self.guarded(self.options.eager_chown, &[path], "chown", move || {
            sys::lchown(&full, uid.unwrap_or(u32::MAX), gid.unwrap_or(u32::MAX))?;
            Ok(())
        })
    }

    pub fn utimens(&self, path: &Path, times: [libc::timespec; 2]) -> FsResult<()> {
        let full = self.full(path);
        self.guarded(self.options.eager_utimens, &[path], "utimens", move || {
            sys::utimens(&full, &times)?;
            Ok(())
        })
    }

    pub fn fallocate(
        &self,
        path: &Path,
        id: HandleId,
        mode: i32,
        offset: i64,
        length: i64,
    ) -> FsResult<()> {
        if mode != 0 {
            return Err(FsError::Unsupported);
        }
        let slot = self.handles.get(id)?;
        self.guarded(self.options.eager_chown, &[path], "fallocate", move || {
            let fd = slot.descriptor()?;
            sys::fallocate(fd, offset, length)?;
            Ok(())
        })
    }

    pub fn fsync(&self, path: &Path, id: HandleId, datasync: bool) -> FsResult<()> {
        if self.options.ignore_fsync {
            return Ok(());
        }
        let slot = self.handles.get(id)?;
        self.guarded(self.options.eager_fsync, &[path], "fsync", move || {
            let fd = slot.descriptor()?;
            sys::fsync(fd, datasync)?;
            Ok(())
        })
    }

    // Handle-producing operations

    /// Allocate the virtual handle, return its id to the caller, and
    /// defer the backing open. The worker binds the descriptor (or the
    /// failure) and wakes everyone blocked on it.
    pub fn create(&self, path: &Path, flags: i32, mode: u32) -> FsResult<HandleId> {
        self.open_with(path, flags | libc::O_CREAT, mode, "create")
    }

    pub fn open(&self, path: &Path, flags: i32) -> FsResult<HandleId> {
        self.open_with(path, flags, 0, "open")
    }

    fn open_with(&self, path: &Path, flags: i32, mode: u32, label: &'static str) -> FsResult<HandleId> {
        let id = self.handles.acquire();
        let slot = self.handles.get(id)?;
        let full = self.full(path);
        self.guarded(true, &[path], label, move || match sys::open(&full, flags, mode) {
            Ok(fd) => {
                slot.bind(fd);
                Ok(())
            }
            Err(err) => {
                slot.bind_failure(err.raw_os_error().unwrap_or(libc::EIO));
                Err(err.into())
            }
        })?;
        Ok(id)
    }

    // Data writes

    /// The pipe-splice hand-off: queue the splice into the late-bound
    /// descriptor first, then feed the caller's buffer into the handle
    /// pipe. A full pipe blocks here, backpressuring the kernel thread
    /// instead of buffering unboundedly.
    pub fn write(&self, path: &Path, id: HandleId, offset: i64, data: &[u8]) -> FsResult<u32> {
        let slot = self.handles.get(id)?;
        let len = data.len();
        let pipe_read = slot.pipe_read_fd()?;
        let pipe_write = slot.pipe_write_fd()?;

        let splice = {
            let slot = Arc::clone(&slot);
            Box::new(move || match slot.descriptor() {
                Ok(fd) => {
                    sys::splice_from_pipe(pipe_read, fd, offset, len)?;
                    Ok(())
                }
                Err(err) => {
                    // The bytes are already promised to the pipe; swallow
                    // them so later writes stay aligned.
                    let _ = sys::drain_pipe(pipe_read, len);
                    Err(err)
                }
            }) as Box<dyn FnOnce() -> FsResult<()> + Send>
        };

        if self.try_defer(&[path], "write", splice).is_none() {
            if let Err(err) = sys::write_all(pipe_write, data) {
                // Losing hand-off bytes desynchronizes every later write
                // on the handle; there is no sane continuation.
                panic!("pipe hand-off failed for {}: {err}", path.display());
            }
            return Ok(len as u32);
        }

        // Executor already torn down: nothing would drain the pipe while
        // this thread fills it, so skip the hand-off and write the buffer
        // directly under the barrier.
        self.run_inline(&[path], || {
            let fd = slot.descriptor()?;
            sys::pwrite_all(fd, data, offset)?;
            Ok(())
        })?;
        Ok(len as u32)
    }

    // Close paths

    pub fn flush(&self, path: &Path, id: HandleId) -> FsResult<()> {
        let slot = self.handles.get(id)?;
        if self.options.close_very_late {
            let fd = slot.dup_descriptor()?;
            self.reservoir.push(fd);
            return Ok(());
        }
        self.guarded(self.options.eager_close, &[path], "flush", move || {
            // flush is called once per close(2) on a shared open file;
            // close a duplicate, never the backing descriptor itself.
            let fd = slot.dup_descriptor()?;
            sys::close(fd)?;
            Ok(())
        })
    }

    /// Last close of the handle. The closure adopts the descriptor (to
    /// the reservoir or a real close) and only then recycles the id, so
    /// the id stays unavailable while operations against it can exist.
    pub fn release(&self, path: &Path, id: HandleId) -> FsResult<()> {
        let slot = self.handles.get(id)?;
        let handles = Arc::clone(&self.handles);
        if self.options.close_very_late {
            let reservoir = Arc::clone(&self.reservoir);
            return self.guarded(true, &[path], "release", move || {
                let adopted = slot.take_descriptor();
                handles.release(id);
                reservoir.push(adopted?);
                Ok(())
            });
        }
        self.guarded(self.options.eager_close, &[path], "release", move || {
            let adopted = slot.take_descriptor();
            handles.release(id);
            sys::close(adopted?)?;
            Ok(())
        })
    }

    // Lifecycle

    /// Block until no deferred operation remains registered.
    pub fn drain(&self) {
        while self.inflight.load(Ordering::Acquire) > 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Stop accepting deferred work, drain the queue, join the workers
    /// and close the reservoir. Safe to call more than once.
    pub fn shutdown(&self) {
        let executor = {
            let mut executor = self.executor.lock().unwrap_or_else(PoisonError::into_inner);
            executor.take()
        };
        let Some(executor) = executor else {
            return;
        };
        drop(executor);

        let leaked = self.inflight.load(Ordering::Acquire);
        if leaked > 0 {
            warn!(target: "eagerfs::engine", leaked, "pending set not empty after drain");
        }
        let closed = self.reservoir.drain();
        info!(target: "eagerfs::engine", closed, "engine shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
