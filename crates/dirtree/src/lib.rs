#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `dirtree` is the data model of the backup tool: an in-memory directory
//! tree built either by scanning a filesystem or by parsing a metadata
//! manifest, together with the manifest wire format, per-entry and subtree
//! mutations (in-memory only, or mirrored onto the filesystem with precise
//! metadata ordering), and pure two-way/three-way tree diffs.
//!
//! # Design
//!
//! - [`FilesystemElement`] is the value type describing one entry and owns
//!   the manifest line serializer and parser.
//! - [`DirectoryTree`] owns the nodes, a flat path index for O(1) lookup,
//!   and every mutation operation. Filesystem-touching mutations require a
//!   tree whose [`Origin`] records a scanned top path.
//! - [`diff2`] / [`diff3`] compare trees under a caller-supplied
//!   [`CompareOpt`] field mask and yield ordered [`DirectoryDiff`] lists.
//!
//! # Errors
//!
//! All fallible operations return [`TreeError`]. Manifest parse failures
//! carry the file name, line number and offending line; filesystem
//! failures carry the path and operation. Non-fatal conditions (unknown
//! file types, multiple hardlinks, ownership-change failures) go through
//! the tree's [`WarningSink`] instead.

mod diff;
mod element;
mod error;
mod tree;

pub use diff::{diff2, diff3, DiffLine, DirectoryDiff};
pub use element::{CompareOpt, ElementKind, FilesystemElement, ScanOpt};
pub use error::TreeError;
pub use tree::{tracing_warning_sink, DirectoryTree, NodeRef, Origin, WarningSink};
