// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! FUSE adapter mapping kernel callbacks onto the EagerFS engine.
//!
//! The engine is path-keyed; inode bookkeeping is this adapter's own.
//! Attribute TTLs are zero throughout because deferred mutations change
//! the backing tree behind the kernel's back.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use eagerfs_core::{DirEntryInfo, Engine, FsError, HandleId, Xattr};
use fuser::{
    FileAttr, FileType, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
    FUSE_ROOT_ID,
};
use libc::{c_int, ENAMETOOLONG, ENOENT, ESTALE};
use tracing::info;

/// First inode handed out for looked-up entries.
const FIRST_DYNAMIC_INO: u64 = FUSE_ROOT_ID + 1;

/// Maximum single path component length.
const NAME_MAX: usize = 255;

const TTL_ZERO: Duration = Duration::ZERO;

struct InodeState {
    next: u64,
    by_ino: HashMap<u64, PathBuf>,
    by_path: HashMap<PathBuf, u64>,
}

struct DirHandle {
    ino: u64,
    parent: u64,
    entries: Vec<DirEntryInfo>,
}

/// The `fuser::Filesystem` implementation over an [`Engine`].
pub struct EagerFuse {
    engine: Arc<Engine>,
    inodes: Mutex<InodeState>,
    dir_handles: Mutex<HashMap<u64, DirHandle>>,
    next_dir_fh: AtomicU64,
}

fn errno_of(err: &FsError) -> c_int {
    err.errno()
}

fn kind_of_mode(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        m if m == libc::S_IFDIR => FileType::Directory,
        m if m == libc::S_IFLNK => FileType::Symlink,
        m if m == libc::S_IFCHR => FileType::CharDevice,
        m if m == libc::S_IFBLK => FileType::BlockDevice,
        m if m == libc::S_IFIFO => FileType::NamedPipe,
        m if m == libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn kind_of_file_type(file_type: &std::fs::FileType) -> FileType {
    use std::os::unix::fs::FileTypeExt;
    if file_type.is_dir() {
        FileType::Directory
    } else if file_type.is_symlink() {
        FileType::Symlink
    } else if file_type.is_char_device() {
        FileType::CharDevice
    } else if file_type.is_block_device() {
        FileType::BlockDevice
    } else if file_type.is_fifo() {
        FileType::NamedPipe
    } else if file_type.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

fn to_system_time(secs: i64, nanos: i64) -> SystemTime {
    UNIX_EPOCH + Duration::new(secs.max(0) as u64, nanos.max(0) as u32)
}

fn stat_to_file_attr(stat: &libc::stat, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: stat.st_size as u64,
        blocks: stat.st_blocks as u64,
        atime: to_system_time(stat.st_atime, stat.st_atime_nsec),
        mtime: to_system_time(stat.st_mtime, stat.st_mtime_nsec),
        ctime: to_system_time(stat.st_ctime, stat.st_ctime_nsec),
        crtime: to_system_time(stat.st_ctime, stat.st_ctime_nsec),
        kind: kind_of_mode(stat.st_mode),
        perm: (stat.st_mode & 0o7777) as u16,
        nlink: stat.st_nlink as u32,
        uid: stat.st_uid,
        gid: stat.st_gid,
        rdev: stat.st_rdev as u32,
        blksize: stat.st_blksize as u32,
        flags: 0,
    }
}

fn timespec_omit() -> libc::timespec {
    libc::timespec {
        tv_sec: 0,
        tv_nsec: libc::UTIME_OMIT,
    }
}

fn timespec_of(time: TimeOrNow) -> libc::timespec {
    match time {
        TimeOrNow::Now => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        TimeOrNow::SpecificTime(t) => {
            let since = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
            libc::timespec {
                tv_sec: since.as_secs() as libc::time_t,
                tv_nsec: since.subsec_nanos() as libc::c_long,
            }
        }
    }
}

impl EagerFuse {
    pub fn new(engine: Arc<Engine>) -> Self {
        let mut by_ino = HashMap::new();
        let mut by_path = HashMap::new();
        by_ino.insert(FUSE_ROOT_ID, PathBuf::from("/"));
        by_path.insert(PathBuf::from("/"), FUSE_ROOT_ID);
        Self {
            engine,
            inodes: Mutex::new(InodeState {
                next: FIRST_DYNAMIC_INO,
                by_ino,
                by_path,
            }),
            dir_handles: Mutex::new(HashMap::new()),
            next_dir_fh: AtomicU64::new(1),
        }
    }

    fn path_of(&self, ino: u64) -> Option<PathBuf> {
        let inodes = self.inodes.lock().unwrap_or_else(PoisonError::into_inner);
        inodes.by_ino.get(&ino).cloned()
    }

    fn ino_of(&self, path: &Path) -> u64 {
        let mut inodes = self.inodes.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(ino) = inodes.by_path.get(path) {
            return *ino;
        }
        let ino = inodes.next;
        inodes.next += 1;
        inodes.by_ino.insert(ino, path.to_path_buf());
        inodes.by_path.insert(path.to_path_buf(), ino);
        ino
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<PathBuf> {
        let parent_path = self.path_of(parent)?;
        Some(parent_path.join(name))
    }

    fn forget_path(&self, path: &Path) {
        let mut inodes = self.inodes.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(ino) = inodes.by_path.remove(path) {
            inodes.by_ino.remove(&ino);
        }
    }

    /// Rewrite every tracked path under `from` to live under `to`.
    fn rename_paths(&self, from: &Path, to: &Path) {
        let mut inodes = self.inodes.lock().unwrap_or_else(PoisonError::into_inner);
        let moved: Vec<(PathBuf, u64)> = inodes
            .by_path
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, ino)| (path.clone(), *ino))
            .collect();
        for (old, ino) in moved {
            let suffix = old.strip_prefix(from).expect("prefix checked").to_path_buf();
            let new = if suffix.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(suffix)
            };
            inodes.by_path.remove(&old);
            inodes.by_path.insert(new.clone(), ino);
            inodes.by_ino.insert(ino, new);
        }
    }

    fn entry_attr(&self, path: &Path) -> Result<FileAttr, c_int> {
        let ino = self.ino_of(path);
        match self.engine.getattr(path) {
            Ok(stat) => Ok(stat_to_file_attr(&stat, ino)),
            Err(err) => Err(errno_of(&err)),
        }
    }
}

impl fuser::Filesystem for EagerFuse {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!(
            target: "eagerfs::fuse",
            root = %self.engine.root().display(),
            "adapter initialized"
        );
        Ok(())
    }

    fn destroy(&mut self) {
        info!(target: "eagerfs::fuse", "unmounting, draining deferred work");
        self.engine.shutdown();
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if name.len() > NAME_MAX {
            reply.error(ENAMETOOLONG);
            return;
        }
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ESTALE);
            return;
        };
        match self.entry_attr(&path) {
            Ok(attr) => reply.entry(&TTL_ZERO, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ESTALE);
            return;
        };
        let stat = match fh {
            Some(fh) => self.engine.getattr_handle(&path, HandleId(fh)),
            None => self.engine.getattr(&path),
        };
        match stat {
            Ok(stat) => reply.attr(&TTL_ZERO, &stat_to_file_attr(&stat, ino)),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ESTALE);
            return;
        };

        // Snapshot attributes first (this drains prior work), then queue
        // the requested mutations and answer from the patched snapshot so
        // the deferred classes stay off the foreground path.
        let stat = match self.engine.getattr(&path) {
            Ok(stat) => stat,
            Err(err) => {
                reply.error(errno_of(&err));
                return;
            }
        };
        let mut attr = stat_to_file_attr(&stat, ino);

        if let Some(size) = size {
            let result = match fh {
                Some(fh) => self.engine.truncate_handle(HandleId(fh), size as i64),
                None => self.engine.truncate(&path, size as i64),
            };
            if let Err(err) = result {
                reply.error(errno_of(&err));
                return;
            }
            attr.size = size;
        }

        if let Some(mode) = mode {
            if let Err(err) = self.engine.chmod(&path, mode & 0o7777) {
                reply.error(errno_of(&err));
                return;
            }
            attr.perm = (mode & 0o7777) as u16;
        }

        if uid.is_some() || gid.is_some() {
            if let Err(err) = self.engine.chown(&path, uid, gid) {
                reply.error(errno_of(&err));
                return;
            }
            if let Some(uid) = uid {
                attr.uid = uid;
            }
            if let Some(gid) = gid {
                attr.gid = gid;
            }
        }

        if atime.is_some() || mtime.is_some() {
            let times = [
                atime.map(timespec_of).unwrap_or_else(timespec_omit),
                mtime.map(timespec_of).unwrap_or_else(timespec_omit),
            ];
            if let Err(err) = self.engine.utimens(&path, times) {
                reply.error(errno_of(&err));
                return;
            }
        }

        reply.attr(&TTL_ZERO, &attr);
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ESTALE);
            return;
        };
        match self.engine.readlink(&path) {
            Ok(target) => {
                use std::os::unix::ffi::OsStrExt;
                reply.data(target.as_os_str().as_bytes());
            }
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        if name.len() > NAME_MAX {
            reply.error(ENAMETOOLONG);
            return;
        }
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ESTALE);
            return;
        };
        if let Err(err) = self.engine.mknod(&path, mode, rdev as u64) {
            reply.error(errno_of(&err));
            return;
        }
        match self.entry_attr(&path) {
            Ok(attr) => reply.entry(&TTL_ZERO, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        if name.len() > NAME_MAX {
            reply.error(ENAMETOOLONG);
            return;
        }
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ESTALE);
            return;
        };
        if let Err(err) = self.engine.mkdir(&path, mode) {
            reply.error(errno_of(&err));
            return;
        }
        match self.entry_attr(&path) {
            Ok(attr) => reply.entry(&TTL_ZERO, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ESTALE);
            return;
        };
        match self.engine.unlink(&path) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ESTALE);
            return;
        };
        match self.engine.rmdir(&path) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        link: &Path,
        reply: ReplyEntry,
    ) {
        if name.len() > NAME_MAX {
            reply.error(ENAMETOOLONG);
            return;
        }
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ESTALE);
            return;
        };
        if let Err(err) = self.engine.symlink(link, &path) {
            reply.error(errno_of(&err));
            return;
        }
        match self.entry_attr(&path) {
            Ok(attr) => reply.entry(&TTL_ZERO, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if name.len() > NAME_MAX || newname.len() > NAME_MAX {
            reply.error(ENAMETOOLONG);
            return;
        }
        let (Some(from), Some(to)) = (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) else {
            reply.error(ESTALE);
            return;
        };
        match self.engine.rename(&from, &to, flags) {
            Ok(()) => {
                self.rename_paths(&from, &to);
                reply.ok();
            }
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        if newname.len() > NAME_MAX {
            reply.error(ENAMETOOLONG);
            return;
        }
        let (Some(from), Some(to)) = (self.path_of(ino), self.child_path(newparent, newname))
        else {
            reply.error(ESTALE);
            return;
        };
        if let Err(err) = self.engine.link(&from, &to) {
            reply.error(errno_of(&err));
            return;
        }
        // The link may still be pending; answer from the source attrs
        // under the new entry's inode.
        let new_ino = self.ino_of(&to);
        match self.engine.getattr(&from) {
            Ok(stat) => reply.entry(&TTL_ZERO, &stat_to_file_attr(&stat, new_ino), 0),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ESTALE);
            return;
        };
        match self.engine.open(&path, flags) {
            Ok(id) => reply.opened(id.0, 0),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        if name.len() > NAME_MAX {
            reply.error(ENAMETOOLONG);
            return;
        }
        let Some(path) = self.child_path(parent, name) else {
            reply.error(ESTALE);
            return;
        };
        let id = match self.engine.create(&path, flags, mode) {
            Ok(id) => id,
            Err(err) => {
                reply.error(errno_of(&err));
                return;
            }
        };
        // The backing open is still in flight; synthesize the attrs the
        // kernel needs now instead of waiting for the descriptor.
        let now = SystemTime::now();
        let attr = FileAttr {
            ino: self.ino_of(&path),
            size: 0,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: FileType::RegularFile,
            perm: (mode & 0o7777) as u16,
            nlink: 1,
            uid: req.uid(),
            gid: req.gid(),
            rdev: 0,
            blksize: 512,
            flags: 0,
        };
        reply.created(&TTL_ZERO, &attr, 0, id.0, 0);
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ESTALE);
            return;
        };
        match self.engine.read(&path, HandleId(fh), offset, size) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ESTALE);
            return;
        };
        match self.engine.write(&path, HandleId(fh), offset, data) {
            Ok(written) => reply.written(written),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn flush(&mut self, _req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ESTALE);
            return;
        };
        match self.engine.flush(&path, HandleId(fh)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ESTALE);
            return;
        };
        match self.engine.release(&path, HandleId(fh)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn fsync(&mut self, _req: &Request, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ESTALE);
            return;
        };
        match self.engine.fsync(&path, HandleId(fh), datasync) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ESTALE);
            return;
        };
        // The dir-reader barrier lives inside read_dir: with restrictive
        // dirs on, this call blocks until pending mutations drain.
        let entries = match self.engine.read_dir(&path) {
            Ok(entries) => entries,
            Err(err) => {
                reply.error(errno_of(&err));
                return;
            }
        };
        let parent = path
            .parent()
            .and_then(|p| {
                let key = if p.as_os_str().is_empty() {
                    Path::new("/")
                } else {
                    p
                };
                self.inodes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .by_path
                    .get(key)
                    .copied()
            })
            .unwrap_or(FUSE_ROOT_ID);
        let fh = self.next_dir_fh.fetch_add(1, Ordering::Relaxed);
        self.dir_handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fh, DirHandle { ino, parent, entries });
        reply.opened(fh, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let handles = self.dir_handles.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(handle) = handles.get(&fh) else {
            reply.error(ESTALE);
            return;
        };

        let mut index = offset;
        loop {
            let full = match index {
                0 => reply.add(handle.ino, 1, FileType::Directory, "."),
                1 => reply.add(handle.parent, 2, FileType::Directory, ".."),
                n => {
                    let Some(entry) = handle.entries.get(n as usize - 2) else {
                        break;
                    };
                    reply.add(
                        entry.ino,
                        n + 1,
                        kind_of_file_type(&entry.file_type),
                        &entry.name,
                    )
                }
            };
            if full {
                break;
            }
            index += 1;
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.dir_handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ENOENT);
            return;
        };
        match self.engine.statfs(&path) {
            Ok(stats) => reply.statfs(
                stats.f_blocks,
                stats.f_bfree,
                stats.f_bavail,
                stats.f_files,
                stats.f_ffree,
                stats.f_bsize as u32,
                stats.f_namemax as u32,
                stats.f_frsize as u32,
            ),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ESTALE);
            return;
        };
        match self.engine.access(&path, mask) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ESTALE);
            return;
        };
        match self.engine.setxattr(&path, name, value, flags) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ESTALE);
            return;
        };
        match self.engine.getxattr(&path, name, size) {
            Ok(Xattr::Size(n)) => reply.size(n),
            Ok(Xattr::Data(data)) => reply.data(&data),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ESTALE);
            return;
        };
        match self.engine.listxattr(&path, size) {
            Ok(Xattr::Size(n)) => reply.size(n),
            Ok(Xattr::Data(data)) => reply.data(&data),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn removexattr(&mut self, _req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ESTALE);
            return;
        };
        match self.engine.removexattr(&path, name) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn fallocate(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(ESTALE);
            return;
        };
        match self.engine.fallocate(&path, HandleId(fh), mode, offset, length) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

}
