use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Error produced while building, parsing, mutating or serializing a
/// directory tree.
#[derive(Debug, Error)]
pub enum TreeError {
    /// A metadata manifest line or group could not be parsed.
    ///
    /// Unrecoverable for the current manifest; callers typically translate
    /// this to exit code 2 together with a remediation note.
    #[error("{file}: {reason} at line {line}, wrong line is '{raw}'")]
    ManifestParse {
        /// Manifest file name, for error reporting.
        file: String,
        /// One-based line number of the first offending line.
        line: u32,
        /// What was wrong.
        reason: String,
        /// The offending source line, verbatim.
        raw: String,
    },
    /// A metadata manifest could not be opened or read.
    #[error("could not read metadata file '{}': {source}", path.display())]
    ManifestRead {
        /// Manifest path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// A metadata manifest could not be created or written.
    #[error("could not write metadata file '{}': {source}", path.display())]
    ManifestWrite {
        /// Manifest path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// A filesystem operation failed.
    #[error("failed to {op} '{}': {source}", path.display())]
    Io {
        /// Operation being performed when the error occurred.
        op: &'static str,
        /// Path involved in the failing operation.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: io::Error,
    },
    /// User/group name resolution or a symlink-preserving syscall failed.
    #[error(transparent)]
    Fs(#[from] fsext::FsError),
    /// A path expected to be present in the tree was not found.
    #[error("{op}: path '{}' not found in the tree", path.display())]
    PathNotFound {
        /// Operation that required the path.
        op: &'static str,
        /// The missing relative path.
        path: PathBuf,
    },
    /// A destination path that must not exist was already present.
    #[error("path '{}' already exists in the tree", path.display())]
    AlreadyExists {
        /// The conflicting relative path.
        path: PathBuf,
    },
    /// The operation's target exists but is not a directory.
    #[error("{op}: '{}' is not a directory", path.display())]
    NotADirectory {
        /// Operation that required a directory.
        op: &'static str,
        /// The offending path.
        path: PathBuf,
    },
    /// The element passed to a symlink operation is not a symlink.
    #[error("'{}' is not a symbolic link with a target", path.display())]
    NotASymlink {
        /// The offending relative path.
        path: PathBuf,
    },
    /// A filesystem-touching mutation was requested on a tree that was
    /// loaded from a manifest rather than scanned from disk.
    #[error("{op}: tree was not created from a filesystem scan")]
    NotFromScan {
        /// The rejected operation.
        op: &'static str,
    },
    /// An entry with an unsupported file type blocked a copy.
    #[error("cannot copy unsupported file type '{}'", path.display())]
    UnsupportedFileType {
        /// The offending path.
        path: PathBuf,
    },
    /// A file or symlink-target name was not valid UTF-8.
    #[error("path '{}' is not valid UTF-8", path.display())]
    NonUnicodePath {
        /// The offending path.
        path: PathBuf,
    },
    /// An ignore-option token passed to a comparison was not recognized.
    #[error("ignore option '{0}' not valid")]
    InvalidCompareOption(String),
}

impl TreeError {
    pub(crate) fn parse(file: &str, line: u32, reason: impl Into<String>, raw: &str) -> Self {
        Self::ManifestParse {
            file: file.to_string(),
            line,
            reason: reason.into(),
            raw: raw.to_string(),
        }
    }

    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }
}
