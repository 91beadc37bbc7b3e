//! The scrub algorithm: reconcile the backup directory against the two
//! redundant metadata manifests, optionally rescuing entries from the
//! source directory.
//!
//! Each three-way diff line falls into one of four cases:
//!
//! - backup and manifest 1 agree, manifest 2 disagrees → manifest 2 is
//!   assumed corrupted and rebuilt from the backup;
//! - backup and manifest 2 agree, manifest 1 disagrees → symmetric;
//! - the manifests agree with each other but contradict the backup → the
//!   backup itself needs fixing, which is only attempted in fixup mode and
//!   may consult the source tree and the operator;
//! - all three disagree → unrecoverable.
//!
//! Fixes that add or remove a directory invalidate the pending diff, so
//! the outer loop restarts from a freshly computed diff. The
//! `update_meta1`/`update_meta2` flags latch across restarts: a manifest
//! repaired before a restart still gets its `.bak` at commit time.

use std::path::Path;

use dirtree::{diff3, CompareOpt, DiffLine, DirectoryDiff, DirectoryTree, ElementKind};
use tracing::{info, warn};

use crate::error::{EngineError, Outcome};
use crate::manager::TreeManager;
use crate::prompt::Prompter;

/// Result of one attempted fix.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FixOutcome {
    /// The inconsistency could not be fixed.
    Failed,
    /// Fixed; the remaining diff lines are still valid.
    Success,
    /// Fixed, but a directory was added or removed: the diff must be
    /// recomputed.
    SuccessDiffInvalidated,
    /// Fixed by rewriting manifest state; manifests need saving.
    SuccessMetadataInvalidated,
    /// Both of the above.
    SuccessDiffMetadataInvalidated,
}

fn parent_dir(rel: &Path) -> &Path {
    rel.parent().unwrap_or_else(|| Path::new(""))
}

/// Scrubs the backup directory held by `tm`.
///
/// Returns [`Outcome::Clean`] when the three witnesses already agree,
/// [`Outcome::Fixed`] when every inconsistency was repaired (the manager
/// is then flagged to save manifests at commit), and
/// [`Outcome::Unrecoverable`] otherwise.
pub fn scrub(
    tm: &mut TreeManager,
    fixup: bool,
    prompter: &mut dyn Prompter,
) -> Result<Outcome, EngineError> {
    info!("comparing backup directory with metadata");
    let mut diff = current_diff(tm);
    if diff.is_empty() {
        info!("scrub complete, no differences found");
        return Ok(Outcome::Clean);
    }
    info!(
        "inconsistencies found, processing them one by one \
         (in the following diffs a is the backup directory, b is metadata file 1, \
         c is metadata file 2)"
    );

    let mut unrecoverable = false;
    let mut maybe_recoverable = false;
    let mut update_meta1 = false;
    let mut update_meta2 = false;
    let mut redo = false;
    loop {
        if redo {
            redo = false;
            info!(
                "the fix modified the backup directory content in a way that invalidated \
                 the list of inconsistencies, rechecking"
            );
            diff = current_diff(tm);
        }
        for d in diff.iter() {
            // The comparisons cover missing entries too, which is why the
            // optional elements are compared rather than the elements.
            if d[0] == d[1] && d[0] != d[2] {
                info!("{d}assuming metadata file 2 inconsistent in this case");
                let meta2 = tm.meta2.as_mut().expect("scrub runs with both manifests");
                let result = fix_metadata_entry(&tm.dst, meta2, &d[0], &d[2])?;
                update_meta2 = true;
                if result == FixOutcome::SuccessDiffMetadataInvalidated {
                    redo = true;
                    break;
                }
            } else if d[0] == d[2] && d[0] != d[1] {
                info!("{d}assuming metadata file 1 inconsistent in this case");
                let result = fix_metadata_entry(&tm.dst, &mut tm.meta1, &d[0], &d[1])?;
                update_meta1 = true;
                if result == FixOutcome::SuccessDiffMetadataInvalidated {
                    redo = true;
                    break;
                }
            } else if d[1] == d[2] && d[0] != d[1] {
                info!(
                    "{d}metadata files are consistent between themselves \
                     but differ from the backup directory content"
                );
                if fixup {
                    info!("trying to fix this");
                    match fix_backup_entry(tm, d, prompter)? {
                        FixOutcome::Success => {}
                        FixOutcome::Failed => unrecoverable = true,
                        FixOutcome::SuccessDiffInvalidated => redo = true,
                        FixOutcome::SuccessMetadataInvalidated => {
                            update_meta1 = true;
                            update_meta2 = true;
                        }
                        FixOutcome::SuccessDiffMetadataInvalidated => {
                            update_meta1 = true;
                            update_meta2 = true;
                            redo = true;
                        }
                    }
                    if redo {
                        break;
                    }
                } else {
                    info!("not attempting to fix this because fixup mode is off");
                    maybe_recoverable = true;
                }
            } else if d[0] != d[1] && d[1] != d[2] {
                warn!(
                    "{d}metadata files are inconsistent both among themselves and with \
                     the backup directory content, nothing can be done"
                );
                unrecoverable = true;
            } else {
                unreachable!("diff lines always differ in at least one slot");
            }
        }
        if !redo {
            break;
        }
    }
    info!("inconsistencies processed");

    if !unrecoverable && !maybe_recoverable {
        tm.save_metadata_on_exit();
        if update_meta1 {
            tm.save_meta1_previous_version();
        }
        if update_meta2 {
            tm.save_meta2_previous_version();
        }
        info!(
            "inconsistencies found but it was possible to automatically reconcile them, \
             the backup directory is now good"
        );
        Ok(Outcome::Fixed)
    } else if unrecoverable {
        warn!("unrecoverable inconsistencies found, the backup directory must be fixed manually");
        if maybe_recoverable {
            info!(
                "some inconsistencies may be automatically recoverable by running this \
                 command again with the --fixup option"
            );
            if !tm.has_source() {
                info!("giving access to the source directory as well (-s option) may help");
            }
        }
        Ok(Outcome::Unrecoverable)
    } else {
        warn!(
            "unrecovered inconsistencies found, but it looks like all of them could be \
             recovered automatically by running this command again with the --fixup option"
        );
        if !tm.has_source() {
            info!("giving access to the source directory as well (-s option) may help");
        }
        Ok(Outcome::Unrecoverable)
    }
}

fn current_diff(tm: &TreeManager) -> DirectoryDiff<3> {
    let meta2 = tm.meta2.as_ref().expect("scrub runs with both manifests");
    diff3(&tm.dst, &tm.meta1, meta2, &CompareOpt::default())
}

/// Repairs one inconsistent manifest entry by replacing it with the state
/// of the agreeing majority.
///
/// This always rebuilds the whole entry (subtree included) in memory; the
/// filesystem is not involved, so the simple remove-and-recopy is cheap
/// enough and avoids a per-field analysis.
fn fix_metadata_entry(
    good_tree: &DirectoryTree,
    bad_tree: &mut DirectoryTree,
    good_entry: &Option<dirtree::FilesystemElement>,
    bad_entry: &Option<dirtree::FilesystemElement>,
) -> Result<FixOutcome, EngineError> {
    if let Some(bad) = bad_entry {
        bad_tree.remove_from_tree(bad.relative_path())?;
    }
    if let Some(good) = good_entry {
        let rel = good.relative_path();
        bad_tree.copy_from_tree(good_tree, rel, parent_dir(rel))?;
    }
    let touched_directory = good_entry.as_ref().is_some_and(|e| e.is_directory())
        || bad_entry.as_ref().is_some_and(|e| e.is_directory());
    if touched_directory {
        Ok(FixOutcome::SuccessDiffMetadataInvalidated)
    } else {
        Ok(FixOutcome::SuccessMetadataInvalidated)
    }
}

/// Handles the difficult scrub case: the manifests agree with each other
/// but the backup directory contradicts them.
fn fix_backup_entry(
    tm: &mut TreeManager,
    d: &DiffLine<3>,
    prompter: &mut dyn Prompter,
) -> Result<FixOutcome, EngineError> {
    debug_assert!(d[1] == d[2], "caller established the manifests agree");
    let TreeManager {
        src,
        dst,
        meta1,
        meta2,
        ..
    } = tm;
    let src = src.as_ref();
    let meta2 = meta2.as_mut().expect("scrub runs with both manifests");

    match (&d[0], &d[1]) {
        (None, Some(recorded)) => {
            let rel = recorded.relative_path().to_path_buf();
            let kind = recorded.kind();
            let noun = kind.describe();
            info!(
                "the {noun} {} is missing in the backup directory but the metadata files \
                 agree it should be there",
                rel.display()
            );
            // Symlinks are special: the manifest holds enough information
            // (the recorded target) to recreate them outright.
            if kind == ElementKind::Symlink {
                info!("creating the missing symbolic link");
                dst.add_symlink_to_tree_and_filesystem(recorded.clone())?;
                return Ok(FixOutcome::Success);
            }
            let Some(src) = src else {
                info!(
                    "rerunning the scrub with the source directory (-s option) may allow \
                     recovering the {noun} from there, but until then there is nothing to do"
                );
                return Ok(FixOutcome::Failed);
            };
            info!("looking for the missing {noun} in the source directory");
            let Some(item) = src.search(&rel).cloned() else {
                info!(
                    "the {noun} was not found. Double check the source directory path and \
                     rerun with the correct one if it is wrong. If it is correct, check the \
                     source directory manually: if the {noun} really is not there it may have \
                     been deleted manually both there and in the backup directory, and if \
                     this is the only error the metadata files could be deleted and recreated"
                );
                return Ok(FixOutcome::Failed);
            };
            if item == *recorded {
                info!(
                    "the {noun} was found in the source directory and matches the backup \
                     metadata, copying it back into the backup directory"
                );
                dst.copy_from_tree_and_filesystem(src, &rel, parent_dir(&rel))?;
                return Ok(if kind == ElementKind::Directory {
                    FixOutcome::SuccessDiffInvalidated
                } else {
                    FixOutcome::Success
                });
            }
            info!(
                "an entry was found in the source directory, however its properties\n{item}\n\
                 do not match the missing {noun}"
            );
            if item.matches_with(recorded, &CompareOpt::content_only()) {
                info!("however the content is the same, updating backup");
                dst.copy_from_tree_and_filesystem(src, &rel, parent_dir(&rel))?;
                if item.permissions() != recorded.permissions() {
                    meta1.modify_permissions(&rel, item.permissions())?;
                    meta2.modify_permissions(&rel, item.permissions())?;
                }
                if item.user() != recorded.user() || item.group() != recorded.group() {
                    meta1.modify_owner(&rel, item.user(), item.group())?;
                    meta2.modify_owner(&rel, item.user(), item.group())?;
                }
                if item.mtime() != recorded.mtime() {
                    meta1.modify_mtime(&rel, item.mtime())?;
                    meta2.modify_mtime(&rel, item.mtime())?;
                }
                Ok(if kind == ElementKind::Directory {
                    FixOutcome::SuccessDiffMetadataInvalidated
                } else {
                    FixOutcome::SuccessMetadataInvalidated
                })
            } else {
                info!(
                    "and the difference includes the entry content. The backup entry is \
                     gone and the source directory has changed, so the best option left is \
                     copying the new entry to the backup"
                );
                dst.copy_from_tree_and_filesystem(src, &rel, parent_dir(&rel))?;
                meta1.remove_from_tree(&rel)?;
                meta1.copy_from_tree(src, &rel, parent_dir(&rel))?;
                meta2.remove_from_tree(&rel)?;
                meta2.copy_from_tree(src, &rel, parent_dir(&rel))?;
                Ok(if item.is_directory() || recorded.is_directory() {
                    FixOutcome::SuccessDiffMetadataInvalidated
                } else {
                    FixOutcome::SuccessMetadataInvalidated
                })
            }
        }
        (Some(actual), None) => {
            let rel = actual.relative_path().to_path_buf();
            let noun = actual.kind().describe();
            let question = format!(
                "The {noun} {} is present in the backup directory but the metadata files \
                 agree it should not be there. Do you want to DELETE it?",
                rel.display()
            );
            if !prompter.confirm(&question) {
                return Ok(FixOutcome::Failed);
            }
            info!("removing the {noun}");
            let count = dst.remove_from_tree_and_filesystem(&rel)?;
            info!("removed {count} files or directories");
            Ok(if actual.kind() == ElementKind::Directory {
                FixOutcome::SuccessDiffInvalidated
            } else {
                FixOutcome::Success
            })
        }
        (Some(actual), Some(recorded)) => {
            fix_diverged_backup_entry(src, dst, meta1, meta2, actual, recorded, prompter)
        }
        (None, None) => unreachable!("a diff line always has at least one element"),
    }
}

/// The backup has the entry but it differs from what both manifests
/// record.
#[allow(clippy::too_many_lines)]
fn fix_diverged_backup_entry(
    src: Option<&DirectoryTree>,
    dst: &mut DirectoryTree,
    meta1: &mut DirectoryTree,
    meta2: &mut DirectoryTree,
    actual: &dirtree::FilesystemElement,
    recorded: &dirtree::FilesystemElement,
    prompter: &mut dyn Prompter,
) -> Result<FixOutcome, EngineError> {
    let rel = recorded.relative_path().to_path_buf();
    let kind = recorded.kind();
    let noun = kind.describe();
    info!(
        "the metadata files agree on the properties of the {noun} {} but the entry in \
         the backup directory differs",
        rel.display()
    );
    if actual.matches_with(recorded, &CompareOpt::content_only()) {
        info!("however the content is the same, updating the backup directory");
        if actual.permissions() != recorded.permissions() {
            dst.modify_permissions_in_tree_and_filesystem(&rel, recorded.permissions())?;
        }
        if actual.user() != recorded.user() || actual.group() != recorded.group() {
            dst.modify_owner_in_tree_and_filesystem(&rel, recorded.user(), recorded.group())?;
        }
        if actual.mtime() != recorded.mtime() {
            dst.modify_mtime_in_tree_and_filesystem(&rel, recorded.mtime())?;
        }
        return Ok(FixOutcome::Success);
    }
    info!("and the difference includes the entry content");
    if kind != actual.kind() {
        warn!("also, the types differ!");
    }

    // Same metadata but different content means the file changed behind
    // mtime's back: bit rot. No confirmation is asked before repairing.
    let bitrot = actual.matches_with(recorded, &CompareOpt::metadata_only());
    if bitrot {
        warn!(
            "bit rot in the backup directory detected. The content of a file changed but \
             the modified time did not. A SMART check is advisable, the backup disk may be \
             unreliable"
        );
    }

    // Symlinks can be recreated purely from the manifest record.
    if kind == ElementKind::Symlink && actual.kind() == ElementKind::Symlink {
        if !bitrot {
            let question = format!(
                "Do you want to UPDATE the symbolic link {}?",
                rel.display()
            );
            if !prompter.confirm(&question) {
                return Ok(FixOutcome::Failed);
            }
        }
        info!("first removing the old symbolic link");
        let count = dst.remove_from_tree_and_filesystem(&rel)?;
        info!("removed {count} entry, creating updated symbolic link");
        dst.add_symlink_to_tree_and_filesystem(recorded.clone())?;
        return Ok(FixOutcome::Success);
    }

    let Some(src) = src else {
        info!(
            "rerunning the scrub with the source directory (-s option) may allow \
             recovering the {noun} from there, but until then there is nothing to do"
        );
        return Ok(FixOutcome::Failed);
    };
    info!("looking for the {noun} in the source directory");
    let Some(item) = src.search(&rel).cloned() else {
        info!(
            "the {noun} was not found. Double check the source directory path and rerun \
             with the correct one if it is wrong. If it is correct, check the source \
             directory manually: if the {noun} really is not there it may have been \
             deleted manually both there and in the backup directory, and if this is the \
             only error the metadata files could be deleted and recreated"
        );
        return Ok(FixOutcome::Failed);
    };
    if item == *recorded {
        info!("the {noun} was found in the source directory and matches the backup metadata");
        if !bitrot {
            let question = format!(
                "Do you want to DELETE the {} {} in the backup directory and REPLACE it \
                 with the {noun} in the source directory?",
                actual.kind().describe(),
                rel.display()
            );
            if !prompter.confirm(&question) {
                return Ok(FixOutcome::Failed);
            }
        }
        let count = dst.remove_from_tree_and_filesystem(&rel)?;
        info!(
            "removed {count} files or directories, replacing the content of the backup \
             directory with the one of the source directory"
        );
        dst.copy_from_tree_and_filesystem(src, &rel, parent_dir(&rel))?;
        return Ok(if kind == ElementKind::Directory || actual.is_directory() {
            FixOutcome::SuccessDiffInvalidated
        } else {
            FixOutcome::Success
        });
    }
    info!(
        "an entry was found in the source directory, however its properties\n{item}\n\
         do not match the {noun}"
    );
    if item == *actual {
        info!(
            "but the source directory matches the backup directory. Was a backup done \
             without updating the backup metadata? Assuming the metadata is not up to date"
        );
        meta1.remove_from_tree(&rel)?;
        meta1.copy_from_tree(src, &rel, parent_dir(&rel))?;
        meta2.remove_from_tree(&rel)?;
        meta2.copy_from_tree(src, &rel, parent_dir(&rel))?;
        info!("metadata updated to reflect the source and backup");
        if bitrot {
            warn!(
                "about the bit rot: either a backup was restored, which explains why the \
                 source and backup directory are the same and means the good file was \
                 overwritten, or something strange happened to the mtime"
            );
        }
        return Ok(if item.is_directory() || kind == ElementKind::Directory {
            FixOutcome::SuccessDiffMetadataInvalidated
        } else {
            FixOutcome::SuccessMetadataInvalidated
        });
    }
    if item.kind() != recorded.kind() {
        warn!("also, the types differ!");
    }
    if item.matches_with(actual, &CompareOpt::content_only()) {
        info!("however the content is the same, updating backup");
        if item.permissions() != recorded.permissions() {
            dst.modify_permissions_in_tree_and_filesystem(&rel, item.permissions())?;
        }
        if item.user() != recorded.user() || item.group() != recorded.group() {
            dst.modify_owner_in_tree_and_filesystem(&rel, item.user(), item.group())?;
        }
        if item.mtime() != recorded.mtime() {
            dst.modify_mtime_in_tree_and_filesystem(&rel, item.mtime())?;
        }
        // Source and backup now differ only in metadata, but the manifests
        // differ in content: rewrite them from the source.
        info!("updating metadata files too");
        meta1.remove_from_tree(&rel)?;
        meta1.copy_from_tree(src, &rel, parent_dir(&rel))?;
        meta2.remove_from_tree(&rel)?;
        meta2.copy_from_tree(src, &rel, parent_dir(&rel))?;
        if bitrot {
            warn!(
                "about the bit rot: either a backup was restored, which explains why the \
                 source and backup directory are the same and means the good file was \
                 overwritten, or something strange happened to the mtime"
            );
        }
        Ok(if kind == ElementKind::Directory || actual.is_directory() {
            FixOutcome::SuccessDiffMetadataInvalidated
        } else {
            FixOutcome::SuccessMetadataInvalidated
        })
    } else {
        let question = format!(
            "And the difference includes the entry content. Do you want to DELETE the \
             {} {} in the backup directory and REPLACE it with the {} in the source \
             directory?",
            actual.kind().describe(),
            rel.display(),
            item.kind().describe()
        );
        if !prompter.confirm(&question) {
            return Ok(FixOutcome::Failed);
        }
        let count = dst.remove_from_tree_and_filesystem(&rel)?;
        info!(
            "removed {count} files or directories, replacing the content of the backup \
             directory with the one of the source directory"
        );
        dst.copy_from_tree_and_filesystem(src, &rel, parent_dir(&rel))?;
        meta1.remove_from_tree(&rel)?;
        meta1.copy_from_tree(src, &rel, parent_dir(&rel))?;
        meta2.remove_from_tree(&rel)?;
        meta2.copy_from_tree(src, &rel, parent_dir(&rel))?;
        Ok(
            if kind == ElementKind::Directory || item.is_directory() || actual.is_directory() {
                FixOutcome::SuccessDiffMetadataInvalidated
            } else {
                FixOutcome::SuccessMetadataInvalidated
            },
        )
    }
}
