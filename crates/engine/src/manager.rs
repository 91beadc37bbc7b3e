//! Scoped owner of the trees used by scrub and backup, responsible for all
//! manifest file I/O.
//!
//! The manager loads both manifest copies up front, optionally scans the
//! source and backup directories (concurrently when asked), and latches
//! save flags that the engines set as they repair trees. Writing the
//! manifests back is an explicit, consuming [`TreeManager::commit`] rather
//! than a destructor side effect: dropping the manager without committing
//! writes nothing.

use std::fs;
use std::path::{Path, PathBuf};

use dirtree::{DirectoryTree, ScanOpt, TreeError, WarningSink};
use tracing::info;

use crate::error::EngineError;

/// Holds the up-to-four trees of a scrub/backup run and the manifest
/// bookkeeping.
pub struct TreeManager {
    pub(crate) src: Option<DirectoryTree>,
    pub(crate) dst: DirectoryTree,
    pub(crate) meta1: DirectoryTree,
    pub(crate) meta2: Option<DirectoryTree>,
    meta1_path: PathBuf,
    meta2_path: PathBuf,
    save: bool,
    meta1_backup: bool,
    meta2_backup: bool,
}

impl TreeManager {
    /// Loads both manifests and scans the source and backup directories,
    /// concurrently when `parallel` is set.
    pub fn with_source(
        src: &Path,
        dst: &Path,
        meta1_path: &Path,
        meta2_path: &Path,
        opt: ScanOpt,
        parallel: bool,
        warnings: &WarningSink,
    ) -> Result<Self, EngineError> {
        let (meta1, meta2) = load_manifests(meta1_path, meta2_path, warnings)?;
        let (src_tree, dst_tree) = scan_source_and_backup(src, dst, opt, parallel, warnings)?;
        Ok(Self {
            src: Some(src_tree),
            dst: dst_tree,
            meta1,
            meta2: Some(meta2),
            meta1_path: meta1_path.to_path_buf(),
            meta2_path: meta2_path.to_path_buf(),
            save: false,
            meta1_backup: false,
            meta2_backup: false,
        })
    }

    /// Loads both manifests and scans only the backup directory.
    pub fn without_source(
        dst: &Path,
        meta1_path: &Path,
        meta2_path: &Path,
        opt: ScanOpt,
        warnings: &WarningSink,
    ) -> Result<Self, EngineError> {
        let (meta1, meta2) = load_manifests(meta1_path, meta2_path, warnings)?;
        info!("scanning backup directory");
        let dst_tree = DirectoryTree::scan_directory(dst, opt, warnings.clone())?;
        Ok(Self {
            src: None,
            dst: dst_tree,
            meta1,
            meta2: Some(meta2),
            meta1_path: meta1_path.to_path_buf(),
            meta2_path: meta2_path.to_path_buf(),
            save: false,
            meta1_backup: false,
            meta2_backup: false,
        })
    }

    /// True when the manager was built with a source tree.
    #[must_use]
    pub fn has_source(&self) -> bool {
        self.src.is_some()
    }

    /// The backup directory tree.
    #[must_use]
    pub fn backup_tree(&self) -> &DirectoryTree {
        &self.dst
    }

    /// The first manifest tree.
    #[must_use]
    pub fn meta1_tree(&self) -> &DirectoryTree {
        &self.meta1
    }

    /// The second manifest tree, unless it has been discarded.
    #[must_use]
    pub fn meta2_tree(&self) -> Option<&DirectoryTree> {
        self.meta2.as_ref()
    }

    /// Releases the second manifest tree after a scrub established that
    /// both copies agree. [`Self::commit`] then writes the first tree to
    /// both manifest paths.
    pub fn discard_meta2(&mut self) {
        self.meta2 = None;
    }

    /// Marks the manifests for writing at commit time.
    pub fn save_metadata_on_exit(&mut self) {
        self.save = true;
    }

    /// Keeps the previous version of manifest 1 as `.bak` when committing.
    pub fn save_meta1_previous_version(&mut self) {
        self.meta1_backup = true;
    }

    /// Keeps the previous version of manifest 2 as `.bak` when committing.
    pub fn save_meta2_previous_version(&mut self) {
        self.meta2_backup = true;
    }

    /// Writes the manifests back to disk if an engine marked them for
    /// saving, preserving previous versions as `.bak` where requested.
    /// Manifest 1 is written first, then manifest 2.
    pub fn commit(self) -> Result<(), EngineError> {
        if !self.save {
            return Ok(());
        }
        info!("updating metadata file 1");
        if self.meta1_backup {
            rename_to_bak(&self.meta1_path)?;
        }
        self.meta1.write_to_path(&self.meta1_path)?;
        info!("updating metadata file 2");
        if self.meta2_backup {
            rename_to_bak(&self.meta2_path)?;
        }
        match &self.meta2 {
            Some(meta2) => meta2.write_to_path(&self.meta2_path)?,
            // After a discard both copies are the same tree.
            None => self.meta1.write_to_path(&self.meta2_path)?,
        }
        Ok(())
    }
}

fn rename_to_bak(path: &Path) -> Result<(), EngineError> {
    let mut bak = path.as_os_str().to_os_string();
    bak.push(".bak");
    fs::rename(path, PathBuf::from(&bak)).map_err(|error| EngineError::Io {
        op: "rename to .bak",
        path: path.to_path_buf(),
        source: error,
    })
}

fn load_manifests(
    meta1_path: &Path,
    meta2_path: &Path,
    warnings: &WarningSink,
) -> Result<(DirectoryTree, DirectoryTree), EngineError> {
    info!("loading metadata files");
    let load = |path: &Path| DirectoryTree::read_from_path(path, warnings.clone());
    match (load(meta1_path), load(meta2_path)) {
        (Ok(meta1), Ok(meta2)) => Ok((meta1, meta2)),
        (first, second) => {
            let error: TreeError = first.err().or_else(|| second.err()).expect("one side failed");
            tracing::error!(
                "{error}\n\
                 It looks like at least one of the metadata files is corrupted to the point \
                 that it cannot be read. The cause may be an unclean unmount of the filesystem \
                 (did you run an fsck?), an attempt to edit a metadata file with a text editor, \
                 or bit rot in the metadata file itself. You will need to manually fix the \
                 backup directory, possibly by recreating metadata files and replacing the \
                 corrupted one(s). The 'ddm diff' command may help to troubleshoot bad metadata."
            );
            Err(error.into())
        }
    }
}

/// Scans the source and backup directories, each in its own worker when
/// `parallel` is set. Worker failures are captured as strings; when both
/// fail the messages are concatenated.
pub(crate) fn scan_source_and_backup(
    src: &Path,
    dst: &Path,
    opt: ScanOpt,
    parallel: bool,
    warnings: &WarningSink,
) -> Result<(DirectoryTree, DirectoryTree), EngineError> {
    info!("scanning source and backup directory");
    if parallel {
        let (src_result, dst_result) = std::thread::scope(|scope| {
            let worker =
                scope.spawn(|| DirectoryTree::scan_directory(src, opt, warnings.clone()));
            let dst_result = DirectoryTree::scan_directory(dst, opt, warnings.clone());
            let src_result = worker.join().expect("scan worker panicked");
            (src_result, dst_result)
        });
        match (src_result, dst_result) {
            (Ok(src_tree), Ok(dst_tree)) => Ok((src_tree, dst_tree)),
            (src_result, dst_result) => {
                let mut message = String::new();
                for error in [
                    dst_result.err().map(|e| e.to_string()),
                    src_result.err().map(|e| e.to_string()),
                ]
                .into_iter()
                .flatten()
                {
                    if !message.is_empty() {
                        message.push(' ');
                    }
                    message.push_str(&error);
                }
                Err(EngineError::Scan(message))
            }
        }
    } else {
        let src_tree = DirectoryTree::scan_directory(src, opt, warnings.clone())?;
        let dst_tree = DirectoryTree::scan_directory(dst, opt, warnings.clone())?;
        Ok((src_tree, dst_tree))
    }
}
