//! Value type describing a single filesystem entry, and the metadata
//! manifest line format it serializes to.
//!
//! One element is one line of a manifest, whitespace-separated:
//!
//! ```text
//! <type+9 perms> <user> <group> <yyyy-mm-dd HH:MM:SS +0000> [<size> <hash|*>] [<target>] <path>
//! ```
//!
//! Only UTC timestamps are supported; the `+0000` suffix is matched
//! literally on read. Paths containing whitespace are not supported by the
//! format: the parser reads whitespace-delimited tokens and rejects lines
//! with leftover tokens.

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::error::TreeError;

const MANIFEST_TIME_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Whether a filesystem scan computes content hashes for regular files.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScanOpt {
    /// Compute the SHA-1 of every regular file while scanning.
    ComputeHash,
    /// Skip hashing; affected manifest entries carry `*` instead of a hash.
    OmitHash,
}

/// Per-field mask selecting which attributes a comparison treats as
/// significant.
///
/// `type` and `relativePath` are always significant. An empty hash on
/// either side never causes a hash mismatch, since either tree may have
/// been scanned with hash computation omitted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(clippy::struct_excessive_bools)]
pub struct CompareOpt {
    /// Compare permission bits.
    pub perm: bool,
    /// Compare owner user and group names.
    pub owner: bool,
    /// Compare modification times.
    pub mtime: bool,
    /// Compare regular file sizes.
    pub size: bool,
    /// Compare content hashes (when both sides have one).
    pub hash: bool,
    /// Compare symlink targets.
    pub symlink: bool,
}

impl Default for CompareOpt {
    fn default() -> Self {
        Self {
            perm: true,
            owner: true,
            mtime: true,
            size: true,
            hash: true,
            symlink: true,
        }
    }
}

impl CompareOpt {
    /// Mask that ignores metadata (permissions, owner, mtime) and keeps
    /// only content-bearing fields significant.
    #[must_use]
    pub fn content_only() -> Self {
        Self {
            perm: false,
            owner: false,
            mtime: false,
            ..Self::default()
        }
    }

    /// Mask that ignores content (size, hash, symlink target) and keeps
    /// only metadata significant. Used for bit-rot detection.
    #[must_use]
    pub fn metadata_only() -> Self {
        Self {
            size: false,
            hash: false,
            symlink: false,
            ..Self::default()
        }
    }
}

impl FromStr for CompareOpt {
    type Err = TreeError;

    /// Parses a comma- or whitespace-separated ignore list, e.g.
    /// `"perm,owner"` or `"mtime hash"`. Each named field is *disabled*;
    /// `all` disables every field, reducing comparison to presence and
    /// type.
    fn from_str(ignore: &str) -> Result<Self, Self::Err> {
        let mut opt = Self::default();
        for token in ignore.split([',', ' ', '\t']).filter(|t| !t.is_empty()) {
            match token {
                "perm" => opt.perm = false,
                "owner" => opt.owner = false,
                "mtime" => opt.mtime = false,
                "size" => opt.size = false,
                "hash" => opt.hash = false,
                "symlink" => opt.symlink = false,
                "all" => {
                    opt = Self {
                        perm: false,
                        owner: false,
                        mtime: false,
                        size: false,
                        hash: false,
                        symlink: false,
                    };
                }
                other => return Err(TreeError::InvalidCompareOption(other.to_string())),
            }
        }
        Ok(opt)
    }
}

/// File type of a [`FilesystemElement`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ElementKind {
    /// Regular file (`-` in the manifest).
    Regular,
    /// Directory (`d`).
    Directory,
    /// Symbolic link (`l`).
    Symlink,
    /// Anything else (`?`): fifo, socket, device node.
    Unknown,
}

impl ElementKind {
    const fn as_char(self) -> char {
        match self {
            Self::Regular => '-',
            Self::Directory => 'd',
            Self::Symlink => 'l',
            Self::Unknown => '?',
        }
    }

    /// Human-readable description used in operator-facing messages.
    #[must_use]
    pub const fn describe(self) -> &'static str {
        match self {
            Self::Regular => "file",
            Self::Directory => "directory",
            Self::Symlink => "symbolic link",
            Self::Unknown => "unknown file type",
        }
    }
}

impl From<fsext::FileKind> for ElementKind {
    fn from(kind: fsext::FileKind) -> Self {
        match kind {
            fsext::FileKind::Regular => Self::Regular,
            fsext::FileKind::Directory => Self::Directory,
            fsext::FileKind::Symlink => Self::Symlink,
            fsext::FileKind::Unknown => Self::Unknown,
        }
    }
}

/// Metadata of one entry (file, directory, symlink) inside a directory
/// tree.
///
/// Elements are value types: tree mutations replace whole elements or go
/// through the dedicated per-field setters, which never change the path
/// identity. The hardlink count is captured at scan time only and is not
/// serialized.
#[derive(Clone, Debug)]
pub struct FilesystemElement {
    kind: ElementKind,
    mode: u32,
    user: String,
    group: String,
    mtime: i64,
    size: u64,
    hash: Option<String>,
    relative_path: PathBuf,
    symlink_target: Option<PathBuf>,
    hard_links: u64,
}

impl FilesystemElement {
    /// Builds an element by inspecting `path` on the filesystem, recording
    /// it under `relative_path`.
    ///
    /// Computes the content hash only for regular files when `opt` is
    /// [`ScanOpt::ComputeHash`]. Never follows symlinks.
    pub fn from_scan(
        path: &Path,
        relative_path: PathBuf,
        opt: ScanOpt,
    ) -> Result<Self, TreeError> {
        if relative_path.to_str().is_none() {
            return Err(TreeError::NonUnicodePath {
                path: relative_path,
            });
        }
        let status = fsext::symlink_status(path)?;
        let kind = ElementKind::from(status.kind);
        let mut element = Self {
            kind,
            // Only the nine rwx bits round-trip through the manifest.
            mode: status.mode & 0o777,
            user: fsext::lookup_user_name(status.uid)?,
            group: fsext::lookup_group_name(status.gid)?,
            mtime: status.mtime,
            size: 0,
            hash: None,
            relative_path,
            symlink_target: None,
            hard_links: status.nlink,
        };
        match kind {
            ElementKind::Regular => {
                element.size = status.size;
                if opt == ScanOpt::ComputeHash {
                    element.hash = Some(
                        checksum::hash_file(path)
                            .map_err(|error| TreeError::io("hash", path, error))?,
                    );
                }
            }
            ElementKind::Symlink => {
                let target = fsext::read_link(path)?;
                if target.to_str().is_none() {
                    return Err(TreeError::NonUnicodePath { path: target });
                }
                element.symlink_target = Some(target);
            }
            ElementKind::Directory | ElementKind::Unknown => {}
        }
        Ok(element)
    }

    /// Returns a copy of `self` recorded under a different relative path.
    /// Used when copying subtrees between trees.
    #[must_use]
    pub(crate) fn with_relative_path(&self, relative_path: PathBuf) -> Self {
        let mut element = self.clone();
        element.relative_path = relative_path;
        element
    }

    /// Parses one manifest line. `file` and `line_no` feed error reporting.
    pub fn parse(line: &str, file: &str, line_no: u32) -> Result<Self, TreeError> {
        let fail = |reason: &str| TreeError::parse(file, line_no, reason, line);

        let mut tokens = line.split_whitespace();
        let perm_str = tokens.next().ok_or_else(|| fail("error reading permission string"))?;
        if perm_str.chars().count() != 10 {
            return Err(fail("error reading permission string"));
        }
        let mut chars = perm_str.chars();
        let kind = match chars.next() {
            Some('-') => ElementKind::Regular,
            Some('d') => ElementKind::Directory,
            Some('l') => ElementKind::Symlink,
            Some('?') => ElementKind::Unknown,
            _ => return Err(fail("unrecognized file type")),
        };
        let mut mode = 0_u32;
        for (i, c) in chars.enumerate() {
            let expected = ['r', 'w', 'x'][i % 3];
            match c {
                '-' => {}
                c if c == expected => mode |= 1 << (8 - i),
                _ => return Err(fail("permissions not correct")),
            }
        }

        let user = tokens.next().ok_or_else(|| fail("error reading user/group"))?;
        let group = tokens.next().ok_or_else(|| fail("error reading user/group"))?;

        let date = tokens.next().ok_or_else(|| fail("error reading mtime"))?;
        let clock = tokens.next().ok_or_else(|| fail("error reading mtime"))?;
        let zone = tokens.next().ok_or_else(|| fail("error reading mtime"))?;
        if zone != "+0000" {
            return Err(fail("error reading mtime"));
        }
        let stamp = format!("{date} {clock}");
        let mtime = PrimitiveDateTime::parse(&stamp, MANIFEST_TIME_FORMAT)
            .map_err(|_| fail("error reading mtime"))?
            .assume_utc()
            .unix_timestamp();

        let mut size = 0_u64;
        let mut hash = None;
        let mut symlink_target = None;
        match kind {
            ElementKind::Regular => {
                let size_str = tokens.next().ok_or_else(|| fail("error reading size"))?;
                size = size_str.parse().map_err(|_| fail("error reading size"))?;
                let hash_str = tokens.next().ok_or_else(|| fail("error reading hash"))?;
                if hash_str != "*" {
                    if !checksum::is_valid_hex_digest(hash_str) {
                        return Err(fail("error reading hash"));
                    }
                    hash = Some(hash_str.to_string());
                }
            }
            ElementKind::Symlink => {
                let target = tokens
                    .next()
                    .ok_or_else(|| fail("error reading symlink target"))?;
                symlink_target = Some(PathBuf::from(target));
            }
            ElementKind::Directory | ElementKind::Unknown => {}
        }

        let relative_path = tokens.next().ok_or_else(|| fail("error reading path"))?;
        if tokens.next().is_some() {
            return Err(fail("extra characters at end of line"));
        }

        Ok(Self {
            kind,
            mode,
            user: user.to_string(),
            group: group.to_string(),
            mtime,
            size,
            hash,
            relative_path: PathBuf::from(relative_path),
            symlink_target,
            hard_links: 1,
        })
    }

    /// File type of the element.
    #[must_use]
    pub const fn kind(&self) -> ElementKind {
        self.kind
    }

    /// True when the element is a directory.
    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.kind == ElementKind::Directory
    }

    /// The nine POSIX permission bits.
    #[must_use]
    pub const fn permissions(&self) -> u32 {
        self.mode
    }

    /// Owner user name.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Owner group name.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Modification time, seconds since the UNIX epoch (UTC).
    #[must_use]
    pub const fn mtime(&self) -> i64 {
        self.mtime
    }

    /// File size; only meaningful for regular files.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Content hash as 40 lowercase hex characters, or `None` when hashing
    /// was omitted.
    #[must_use]
    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    /// Path of the element, relative to the tree's top directory. Never
    /// empty and never absolute.
    #[must_use]
    pub fn relative_path(&self) -> &Path {
        &self.relative_path
    }

    /// Literal symlink target; only present for symlinks.
    #[must_use]
    pub fn symlink_target(&self) -> Option<&Path> {
        self.symlink_target.as_deref()
    }

    /// Hardlink count captured at scan time. Not serialized: elements read
    /// from a manifest report 1.
    #[must_use]
    pub const fn hard_link_count(&self) -> u64 {
        self.hard_links
    }

    /// The index key form of the relative path.
    pub(crate) fn path_key(&self) -> &str {
        self.relative_path
            .to_str()
            .expect("element paths are validated as UTF-8 on construction")
    }

    pub(crate) fn set_permissions(&mut self, mode: u32) {
        self.mode = mode & 0o777;
    }

    pub(crate) fn set_owner(&mut self, user: &str, group: &str) {
        self.user = user.to_string();
        self.group = group.to_string();
    }

    pub(crate) fn set_mtime(&mut self, mtime: i64) {
        self.mtime = mtime;
    }

    pub(crate) fn set_hash(&mut self, hash: String) {
        self.hash = Some(hash);
    }

    /// Field-by-field comparison under `opt`. Type and relative path are
    /// always significant; an absent hash on either side never mismatches.
    #[must_use]
    pub fn matches_with(&self, other: &Self, opt: &CompareOpt) -> bool {
        if self.kind != other.kind || self.relative_path != other.relative_path {
            return false;
        }
        if opt.perm && self.mode != other.mode {
            return false;
        }
        if opt.owner && (self.user != other.user || self.group != other.group) {
            return false;
        }
        if opt.mtime && self.mtime != other.mtime {
            return false;
        }
        if opt.size && self.size != other.size {
            return false;
        }
        if opt.hash {
            if let (Some(a), Some(b)) = (&self.hash, &other.hash) {
                if a != b {
                    return false;
                }
            }
        }
        if opt.symlink && self.symlink_target != other.symlink_target {
            return false;
        }
        true
    }

    /// Sort order for sibling listings: directories first, then
    /// alphabetical by path (case-sensitive).
    #[must_use]
    pub fn sibling_cmp(a: &Self, b: &Self) -> Ordering {
        match (a.is_directory(), b.is_directory()) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => a.relative_path.cmp(&b.relative_path),
        }
    }
}

/// Structural equality: all serialized fields must match, except that an
/// absent hash on either side matches any hash. The hardlink count is not
/// part of equality.
///
/// The hash rule makes this relation non-transitive, so [`Eq`] is
/// deliberately not implemented.
impl PartialEq for FilesystemElement {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.mode == other.mode
            && self.user == other.user
            && self.group == other.group
            && self.mtime == other.mtime
            && self.size == other.size
            && self.relative_path == other.relative_path
            && self.symlink_target == other.symlink_target
            && match (&self.hash, &other.hash) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }
}

/// Renders the element in the manifest line format (no trailing newline).
impl fmt::Display for FilesystemElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_manifest_line())
    }
}

impl FilesystemElement {
    fn to_manifest_line(&self) -> String {
        let mut line = String::new();
        line.push(self.kind.as_char());
        for i in 0..9 {
            let bit = 1 << (8 - i);
            let symbol = ['r', 'w', 'x'][i % 3];
            line.push(if self.mode & bit != 0 { symbol } else { '-' });
        }
        let stamp = OffsetDateTime::from_unix_timestamp(self.mtime)
            .ok()
            .and_then(|dt| dt.format(MANIFEST_TIME_FORMAT).ok())
            .unwrap_or_else(|| "1970-01-01 00:00:00".to_string());
        line.push(' ');
        line.push_str(&self.user);
        line.push(' ');
        line.push_str(&self.group);
        line.push(' ');
        line.push_str(&stamp);
        line.push_str(" +0000 ");
        match self.kind {
            ElementKind::Regular => {
                line.push_str(&self.size.to_string());
                line.push(' ');
                line.push_str(self.hash.as_deref().unwrap_or("*"));
                line.push(' ');
            }
            ElementKind::Symlink => {
                if let Some(target) = &self.symlink_target {
                    line.push_str(&target.to_string_lossy());
                    line.push(' ');
                }
            }
            ElementKind::Directory | ElementKind::Unknown => {}
        }
        line.push_str(&self.relative_path.to_string_lossy());
        line
    }
}
