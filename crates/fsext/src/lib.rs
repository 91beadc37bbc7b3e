#![deny(rustdoc::broken_intra_doc_links)]
#![allow(unsafe_code)]

//! # Overview
//!
//! `fsext` provides the filesystem primitives the backup core needs beyond
//! what `std::fs` exposes portably: an `lstat`-style status call that returns
//! type, permissions, ownership, size, mtime and hardlink count in one
//! syscall; bidirectional uid/gid ↔ name lookup with process-wide caching;
//! and symlink-preserving mtime and ownership updates.
//!
//! # Design
//!
//! - [`symlink_status`] wraps `fs::symlink_metadata` plus
//!   `std::os::unix::fs::MetadataExt`, never following symlinks.
//! - [`set_symlink_mtime`] uses `utimensat` with `UTIME_OMIT` for the access
//!   time so only the modification time changes, and `AT_SYMLINK_NOFOLLOW`
//!   so symlinks themselves are stamped rather than their targets.
//! - Name lookups go through the re-entrant `getpwuid_r` family with an
//!   `ERANGE` retry loop, and populate four maps (uid→name, name→uid,
//!   gid→name, name→gid) guarded by a single process-wide mutex. The caches
//!   are monotonic: entries are never invalidated during a run.
//!
//! # Errors
//!
//! A numeric id unknown to the account database is not an error: the textual
//! form is the decimal number, and the decimal form is cached in both
//! directions so it resolves back within the same process. An unknown *name*
//! fails with [`FsError::UserNotFound`] / [`FsError::GroupNotFound`],
//! because restoring ownership from it would lose information.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::fs;
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Mutex, OnceLock};

use rustix::fs::{AtFlags, Timespec, Timestamps, CWD};
use thiserror::Error;

/// Error produced by the filesystem adapter.
#[derive(Debug, Error)]
pub enum FsError {
    /// A filesystem syscall failed.
    #[error("failed to {op} '{}': {source}", path.display())]
    Io {
        /// Operation being performed when the error occurred.
        op: &'static str,
        /// Path involved in the failing operation.
        path: PathBuf,
        /// Underlying error emitted by the operating system.
        #[source]
        source: io::Error,
    },
    /// A textual user name could not be resolved to a uid.
    #[error("user '{0}' not found in the system account database")]
    UserNotFound(String),
    /// A textual group name could not be resolved to a gid.
    #[error("group '{0}' not found in the system account database")]
    GroupNotFound(String),
}

impl FsError {
    fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// File type classification as seen by [`symlink_status`].
///
/// Sockets, fifos and device nodes all map to [`FileKind::Unknown`]; the
/// backup core reports them and otherwise leaves them alone.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FileKind {
    /// Regular file.
    Regular,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
    /// Any other file type.
    Unknown,
}

/// Snapshot of one directory entry's metadata, captured without following
/// symlinks.
#[derive(Clone, Copy, Debug)]
pub struct FileStatus {
    /// File type.
    pub kind: FileKind,
    /// Permission bits (lower 12 bits of `st_mode`).
    pub mode: u32,
    /// Numeric owner id.
    pub uid: u32,
    /// Numeric group id.
    pub gid: u32,
    /// Size in bytes; only meaningful for regular files.
    pub size: u64,
    /// Modification time, seconds since the UNIX epoch (UTC).
    pub mtime: i64,
    /// Hardlink count.
    pub nlink: u64,
}

/// Queries the status of `path` with a single `lstat`-style call.
pub fn symlink_status(path: &Path) -> Result<FileStatus, FsError> {
    let metadata =
        fs::symlink_metadata(path).map_err(|error| FsError::io("stat", path, error))?;
    let file_type = metadata.file_type();
    let kind = if file_type.is_symlink() {
        FileKind::Symlink
    } else if file_type.is_dir() {
        FileKind::Directory
    } else if file_type.is_file() {
        FileKind::Regular
    } else {
        FileKind::Unknown
    };
    Ok(FileStatus {
        kind,
        mode: metadata.mode() & 0o7777,
        uid: metadata.uid(),
        gid: metadata.gid(),
        size: metadata.size(),
        mtime: metadata.mtime(),
        nlink: metadata.nlink(),
    })
}

/// Reads the literal target of a symbolic link, without resolving it.
pub fn read_link(path: &Path) -> Result<PathBuf, FsError> {
    fs::read_link(path).map_err(|error| FsError::io("read symlink", path, error))
}

/// Sets the modification time of `path` without following symlinks.
///
/// The access time is left untouched (`UTIME_OMIT`).
pub fn set_symlink_mtime(path: &Path, mtime: i64) -> Result<(), FsError> {
    let times = Timestamps {
        last_access: Timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT as _,
        },
        last_modification: Timespec {
            tv_sec: mtime as _,
            tv_nsec: 0,
        },
    };
    rustix::fs::utimensat(CWD, path, &times, AtFlags::SYMLINK_NOFOLLOW)
        .map_err(|errno| FsError::io("set mtime of", path, io::Error::from(errno)))
}

/// Changes the owner and group of `path` without following symlinks.
///
/// Both names are resolved through the process-wide caches first. Failure to
/// change ownership is an error here; callers typically downgrade it to a
/// warning because it is expected when not running as root.
pub fn chown_symlink(path: &Path, user: &str, group: &str) -> Result<(), FsError> {
    let uid = lookup_user_id(user)?;
    let gid = lookup_group_id(group)?;
    rustix::fs::chownat(
        CWD,
        path,
        Some(uid_from_raw(uid)),
        Some(gid_from_raw(gid)),
        AtFlags::SYMLINK_NOFOLLOW,
    )
    .map_err(|errno| FsError::io("change ownership of", path, io::Error::from(errno)))
}

fn uid_from_raw(raw: libc::uid_t) -> rustix::fs::Uid {
    rustix::fs::Uid::from_raw(raw)
}

fn gid_from_raw(raw: libc::gid_t) -> rustix::fs::Gid {
    rustix::fs::Gid::from_raw(raw)
}

#[derive(Default)]
struct IdCaches {
    user_names: HashMap<u32, String>,
    user_ids: HashMap<String, u32>,
    group_names: HashMap<u32, String>,
    group_ids: HashMap<String, u32>,
}

fn caches() -> &'static Mutex<IdCaches> {
    static CACHES: OnceLock<Mutex<IdCaches>> = OnceLock::new();
    CACHES.get_or_init(Mutex::default)
}

/// Resolves a numeric uid to a user name.
///
/// An id unknown to the account database resolves to its decimal string
/// form, which is also cached in the reverse direction.
pub fn lookup_user_name(uid: u32) -> Result<String, FsError> {
    let mut caches = caches().lock().expect("id cache mutex poisoned");
    if let Some(name) = caches.user_names.get(&uid) {
        return Ok(name.clone());
    }
    let name = match getpwuid(uid)? {
        Some(name) => name,
        None => uid.to_string(),
    };
    caches.user_names.insert(uid, name.clone());
    caches.user_ids.insert(name.clone(), uid);
    Ok(name)
}

/// Resolves a user name to a numeric uid, failing with
/// [`FsError::UserNotFound`] when the account database has no such user.
pub fn lookup_user_id(user: &str) -> Result<u32, FsError> {
    let mut caches = caches().lock().expect("id cache mutex poisoned");
    if let Some(uid) = caches.user_ids.get(user) {
        return Ok(*uid);
    }
    let uid = getpwnam(user)?.ok_or_else(|| FsError::UserNotFound(user.to_string()))?;
    caches.user_ids.insert(user.to_string(), uid);
    caches.user_names.insert(uid, user.to_string());
    Ok(uid)
}

/// Resolves a numeric gid to a group name, with the same decimal fallback as
/// [`lookup_user_name`].
pub fn lookup_group_name(gid: u32) -> Result<String, FsError> {
    let mut caches = caches().lock().expect("id cache mutex poisoned");
    if let Some(name) = caches.group_names.get(&gid) {
        return Ok(name.clone());
    }
    let name = match getgrgid(gid)? {
        Some(name) => name,
        None => gid.to_string(),
    };
    caches.group_names.insert(gid, name.clone());
    caches.group_ids.insert(name.clone(), gid);
    Ok(name)
}

/// Resolves a group name to a numeric gid, failing with
/// [`FsError::GroupNotFound`] when the account database has no such group.
pub fn lookup_group_id(group: &str) -> Result<u32, FsError> {
    let mut caches = caches().lock().expect("id cache mutex poisoned");
    if let Some(gid) = caches.group_ids.get(group) {
        return Ok(*gid);
    }
    let gid = getgrnam(group)?.ok_or_else(|| FsError::GroupNotFound(group.to_string()))?;
    caches.group_ids.insert(group.to_string(), gid);
    caches.group_names.insert(gid, group.to_string());
    Ok(gid)
}

fn lookup_io_error(op: &'static str, errno: i32) -> FsError {
    FsError::Io {
        op,
        path: PathBuf::new(),
        source: io::Error::from_raw_os_error(errno),
    }
}

fn getpwuid(uid: u32) -> Result<Option<String>, FsError> {
    let mut buffer = vec![0_u8; 1024];
    loop {
        let mut pwd = MaybeUninit::<libc::passwd>::zeroed();
        let mut result: *mut libc::passwd = ptr::null_mut();
        // SAFETY: all pointers are valid for the duration of the call; `pwd`
        // is written by getpwuid_r and `buffer` provides its string storage.
        let errno = unsafe {
            libc::getpwuid_r(
                uid as libc::uid_t,
                pwd.as_mut_ptr(),
                buffer.as_mut_ptr() as *mut libc::c_char,
                buffer.len(),
                &mut result,
            )
        };
        if errno == 0 {
            if result.is_null() {
                return Ok(None);
            }
            // SAFETY: `result` is non-null, so getpwuid_r initialized `pwd`
            // and `pw_name` points at a NUL-terminated string in `buffer`.
            let name = unsafe { CStr::from_ptr(pwd.assume_init().pw_name) };
            return Ok(Some(name.to_string_lossy().into_owned()));
        }
        if errno == libc::ERANGE {
            buffer.resize(buffer.len().saturating_mul(2), 0);
            continue;
        }
        return Err(lookup_io_error("look up user by uid", errno));
    }
}

fn getpwnam(name: &str) -> Result<Option<u32>, FsError> {
    let Ok(c_name) = CString::new(name) else {
        return Ok(None);
    };
    let mut buffer = vec![0_u8; 1024];
    loop {
        let mut pwd = MaybeUninit::<libc::passwd>::zeroed();
        let mut result: *mut libc::passwd = ptr::null_mut();
        // SAFETY: all pointers are valid for the duration of the call.
        let errno = unsafe {
            libc::getpwnam_r(
                c_name.as_ptr(),
                pwd.as_mut_ptr(),
                buffer.as_mut_ptr() as *mut libc::c_char,
                buffer.len(),
                &mut result,
            )
        };
        if errno == 0 {
            if result.is_null() {
                return Ok(None);
            }
            // SAFETY: `result` is non-null, so getpwnam_r initialized `pwd`.
            return Ok(Some(unsafe { pwd.assume_init() }.pw_uid as u32));
        }
        if errno == libc::ERANGE {
            buffer.resize(buffer.len().saturating_mul(2), 0);
            continue;
        }
        return Err(lookup_io_error("look up user by name", errno));
    }
}

fn getgrgid(gid: u32) -> Result<Option<String>, FsError> {
    let mut buffer = vec![0_u8; 1024];
    loop {
        let mut grp = MaybeUninit::<libc::group>::zeroed();
        let mut result: *mut libc::group = ptr::null_mut();
        // SAFETY: all pointers are valid for the duration of the call.
        let errno = unsafe {
            libc::getgrgid_r(
                gid as libc::gid_t,
                grp.as_mut_ptr(),
                buffer.as_mut_ptr() as *mut libc::c_char,
                buffer.len(),
                &mut result,
            )
        };
        if errno == 0 {
            if result.is_null() {
                return Ok(None);
            }
            // SAFETY: `result` is non-null, so getgrgid_r initialized `grp`
            // and `gr_name` points at a NUL-terminated string in `buffer`.
            let name = unsafe { CStr::from_ptr(grp.assume_init().gr_name) };
            return Ok(Some(name.to_string_lossy().into_owned()));
        }
        if errno == libc::ERANGE {
            buffer.resize(buffer.len().saturating_mul(2), 0);
            continue;
        }
        return Err(lookup_io_error("look up group by gid", errno));
    }
}

fn getgrnam(name: &str) -> Result<Option<u32>, FsError> {
    let Ok(c_name) = CString::new(name) else {
        return Ok(None);
    };
    let mut buffer = vec![0_u8; 1024];
    loop {
        let mut grp = MaybeUninit::<libc::group>::zeroed();
        let mut result: *mut libc::group = ptr::null_mut();
        // SAFETY: all pointers are valid for the duration of the call.
        let errno = unsafe {
            libc::getgrnam_r(
                c_name.as_ptr(),
                grp.as_mut_ptr(),
                buffer.as_mut_ptr() as *mut libc::c_char,
                buffer.len(),
                &mut result,
            )
        };
        if errno == 0 {
            if result.is_null() {
                return Ok(None);
            }
            // SAFETY: `result` is non-null, so getgrnam_r initialized `grp`.
            return Ok(Some(unsafe { grp.assume_init() }.gr_gid as u32));
        }
        if errno == libc::ERANGE {
            buffer.resize(buffer.len().saturating_mul(2), 0);
            continue;
        }
        return Err(lookup_io_error("look up group by name", errno));
    }
}
