use std::io;
use std::path::PathBuf;

use dirtree::TreeError;
use thiserror::Error;

/// Error produced by the scrub/backup engines and the tree manager.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A tree operation failed.
    #[error(transparent)]
    Tree(#[from] TreeError),
    /// A filesystem operation performed by the engine itself failed.
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
    /// One or both directory scan workers failed; the message concatenates
    /// every failure.
    #[error("{0}")]
    Scan(String),
}

/// Verdict of a scrub or backup run, mapped to the process exit code at
/// the CLI boundary.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// No action was needed (exit code 0).
    Clean,
    /// Recoverable inconsistencies were found and fixed (exit code 1).
    Fixed,
    /// Unrecoverable inconsistencies or bit rot (exit code 2).
    Unrecoverable,
}

impl Outcome {
    /// Process exit code for this verdict.
    #[must_use]
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Clean => 0,
            Self::Fixed => 1,
            Self::Unrecoverable => 2,
        }
    }
}
