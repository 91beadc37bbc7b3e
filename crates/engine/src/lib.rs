#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `engine` implements the two reconciliation algorithms of the backup
//! tool on top of [`dirtree`]:
//!
//! - **scrub** compares the backup directory against the two redundant
//!   metadata manifests and repairs whichever witness the other two
//!   outvote, optionally rescuing lost entries from the source directory;
//! - **backup** runs a scrub first, then applies the source↔backup diff so
//!   the backup becomes a byte-faithful mirror, refusing to overwrite
//!   entries that look bit-rotten.
//!
//! [`TreeManager`] owns the trees for a run and performs all manifest file
//! I/O, writing updated manifests (with `.bak` previous versions) in an
//! explicit [`TreeManager::commit`]. Operator decisions go through the
//! [`Prompter`] seam so the engines stay deterministic under test.

mod backup;
mod error;
mod manager;
mod prompt;
mod scrub;

pub use backup::{backup, backup_plain};
pub use error::{EngineError, Outcome};
pub use manager::TreeManager;
pub use prompt::{Prompter, ScriptedPrompter, StdinPrompter};
pub use scrub::scrub;
