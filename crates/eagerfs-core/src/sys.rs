// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Thin safe wrappers over the syscalls the engine relays.
//!
//! Everything returns `io::Result` built from `io::Error::last_os_error()`
//! so the original errno travels unmodified to whoever reports it.

use std::ffi::{CString, OsStr};
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

fn cpath(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn cname(name: &OsStr) -> io::Result<CString> {
    CString::new(name.as_bytes()).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn check_len(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

pub(crate) fn open(path: &Path, flags: i32, mode: u32) -> io::Result<OwnedFd> {
    let c = cpath(path)?;
    let fd = unsafe { libc::open(c.as_ptr(), flags | libc::O_CLOEXEC, mode as libc::c_uint) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub(crate) fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    check(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

pub(crate) fn dup(fd: RawFd) -> io::Result<OwnedFd> {
    let new = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if new < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(new) })
}

/// Close with an observable result, unlike dropping an `OwnedFd`.
pub(crate) fn close(fd: OwnedFd) -> io::Result<()> {
    check(unsafe { libc::close(fd.into_raw_fd()) })
}

pub(crate) fn pread(fd: RawFd, buf: &mut [u8], offset: i64) -> io::Result<usize> {
    loop {
        let ret = unsafe {
            libc::pread(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), offset)
        };
        match check_len(ret) {
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
            other => return other,
        }
    }
}

/// Write the whole buffer, retrying short writes and EINTR. Used to feed
/// the handle pipe; blocks when the pipe buffer is full.
pub(crate) fn write_all(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let ret = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        match check_len(ret) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => buf = &buf[n..],
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Write the whole buffer at `offset`, retrying short writes and EINTR.
pub(crate) fn pwrite_all(fd: RawFd, mut buf: &[u8], mut offset: i64) -> io::Result<()> {
    while !buf.is_empty() {
        let ret = unsafe {
            libc::pwrite(fd, buf.as_ptr() as *const libc::c_void, buf.len(), offset)
        };
        match check_len(ret) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as i64;
            }
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Splice exactly `len` bytes from a pipe into `fd` at `offset`. On a
/// mid-transfer error the remainder is still consumed from the pipe so
/// later hand-offs on the same pipe stay aligned.
pub(crate) fn splice_from_pipe(
    pipe: RawFd,
    fd: RawFd,
    offset: i64,
    len: usize,
) -> io::Result<()> {
    let mut off: libc::loff_t = offset;
    let mut remaining = len;
    while remaining > 0 {
        let ret = unsafe {
            libc::splice(pipe, ptr::null_mut(), fd, &mut off, remaining, 0)
        };
        match check_len(ret) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            Ok(n) => remaining -= n,
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
            Err(err) => {
                let _ = drain_pipe(pipe, remaining);
                return Err(err);
            }
        }
    }
    Ok(())
}

/// Read and discard `len` bytes from a pipe.
pub(crate) fn drain_pipe(pipe: RawFd, len: usize) -> io::Result<()> {
    let mut scratch = [0u8; 8192];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(scratch.len());
        let ret = unsafe {
            libc::read(pipe, scratch.as_mut_ptr() as *mut libc::c_void, want)
        };
        match check_len(ret) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            Ok(n) => remaining -= n,
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

pub(crate) fn lstat(path: &Path) -> io::Result<libc::stat> {
    let c = cpath(path)?;
    let mut st = MaybeUninit::<libc::stat>::uninit();
    check(unsafe { libc::lstat(c.as_ptr(), st.as_mut_ptr()) })?;
    Ok(unsafe { st.assume_init() })
}

pub(crate) fn fstat(fd: RawFd) -> io::Result<libc::stat> {
    let mut st = MaybeUninit::<libc::stat>::uninit();
    check(unsafe { libc::fstat(fd, st.as_mut_ptr()) })?;
    Ok(unsafe { st.assume_init() })
}

pub(crate) fn statvfs(path: &Path) -> io::Result<libc::statvfs> {
    let c = cpath(path)?;
    let mut st = MaybeUninit::<libc::statvfs>::uninit();
    check(unsafe { libc::statvfs(c.as_ptr(), st.as_mut_ptr()) })?;
    Ok(unsafe { st.assume_init() })
}

pub(crate) fn access(path: &Path, mask: i32) -> io::Result<()> {
    let c = cpath(path)?;
    check(unsafe { libc::access(c.as_ptr(), mask) })
}

pub(crate) fn mknod(path: &Path, mode: u32, rdev: u64) -> io::Result<()> {
    let c = cpath(path)?;
    if mode & libc::S_IFMT == libc::S_IFIFO {
        check(unsafe { libc::mkfifo(c.as_ptr(), mode as libc::mode_t) })
    } else {
        check(unsafe { libc::mknod(c.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) })
    }
}

pub(crate) fn mkdir(path: &Path, mode: u32) -> io::Result<()> {
    let c = cpath(path)?;
    check(unsafe { libc::mkdir(c.as_ptr(), mode as libc::mode_t) })
}

pub(crate) fn chmod(path: &Path, mode: u32) -> io::Result<()> {
    let c = cpath(path)?;
    check(unsafe { libc::chmod(c.as_ptr(), mode as libc::mode_t) })
}

pub(crate) fn lchown(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    let c = cpath(path)?;
    check(unsafe { libc::lchown(c.as_ptr(), uid as libc::uid_t, gid as libc::gid_t) })
}

/// utimensat with `AT_SYMLINK_NOFOLLOW`; callers pass `UTIME_OMIT` slots
/// for times they do not change.
pub(crate) fn utimens(path: &Path, times: &[libc::timespec; 2]) -> io::Result<()> {
    let c = cpath(path)?;
    check(unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    })
}

pub(crate) fn truncate(path: &Path, size: i64) -> io::Result<()> {
    let c = cpath(path)?;
    check(unsafe { libc::truncate(c.as_ptr(), size as libc::off_t) })
}

pub(crate) fn ftruncate(fd: RawFd, size: i64) -> io::Result<()> {
    check(unsafe { libc::ftruncate(fd, size as libc::off_t) })
}

/// posix_fallocate reports its errno in the return value.
pub(crate) fn fallocate(fd: RawFd, offset: i64, len: i64) -> io::Result<()> {
    let ret = unsafe { libc::posix_fallocate(fd, offset as libc::off_t, len as libc::off_t) };
    if ret != 0 {
        Err(io::Error::from_raw_os_error(ret))
    } else {
        Ok(())
    }
}

pub(crate) fn fsync(fd: RawFd, datasync: bool) -> io::Result<()> {
    if datasync {
        check(unsafe { libc::fdatasync(fd) })
    } else {
        check(unsafe { libc::fsync(fd) })
    }
}

pub(crate) fn flock(fd: RawFd, operation: i32) -> io::Result<()> {
    check(unsafe { libc::flock(fd, operation) })
}

pub(crate) fn getxattr(path: &Path, name: &OsStr, buf: &mut [u8]) -> io::Result<usize> {
    let c = cpath(path)?;
    let n = cname(name)?;
    check_len(unsafe {
        libc::lgetxattr(
            c.as_ptr(),
            n.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    })
}

pub(crate) fn listxattr(path: &Path, buf: &mut [u8]) -> io::Result<usize> {
    let c = cpath(path)?;
    check_len(unsafe {
        libc::llistxattr(c.as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len())
    })
}

pub(crate) fn setxattr(path: &Path, name: &OsStr, value: &[u8], flags: i32) -> io::Result<()> {
    let c = cpath(path)?;
    let n = cname(name)?;
    check(unsafe {
        libc::lsetxattr(
            c.as_ptr(),
            n.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            flags,
        )
    })
}

pub(crate) fn removexattr(path: &Path, name: &OsStr) -> io::Result<()> {
    let c = cpath(path)?;
    let n = cname(name)?;
    check(unsafe { libc::lremovexattr(c.as_ptr(), n.as_ptr()) })
}
