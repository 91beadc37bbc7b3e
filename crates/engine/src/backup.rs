//! The backup algorithm: make the backup directory equal to the source
//! directory while guarding against bit rot, keeping the metadata
//! manifest in sync.

use std::path::Path;

use dirtree::{diff2, CompareOpt, DirectoryTree, ElementKind, ScanOpt, WarningSink};
use tracing::{info, warn};

use crate::error::{EngineError, Outcome};
use crate::manager::{scan_source_and_backup, TreeManager};
use crate::prompt::Prompter;
use crate::scrub::scrub;

fn parent_dir(rel: &Path) -> &Path {
    rel.parent().unwrap_or_else(|| Path::new(""))
}

/// Full backup: scrub first, then apply the source↔backup diff, then
/// complete the manifest hashes when the scan omitted them.
///
/// `hash_all` mirrors the scan option the manager's trees were built
/// with: when false, unchanged files carry no hash in the freshly scanned
/// trees and the manifest supplies them instead.
pub fn backup(
    tm: &mut TreeManager,
    fixup: bool,
    hash_all: bool,
    prompter: &mut dyn Prompter,
) -> Result<Outcome, EngineError> {
    info!("scrubbing backup directory");
    let scrub_result = scrub(tm, fixup, prompter)?;
    match scrub_result {
        Outcome::Clean => {}
        Outcome::Fixed => {
            if !prompter.confirm("The scrub repaired inconsistencies. Do you want to continue with the backup?") {
                return Ok(scrub_result);
            }
        }
        Outcome::Unrecoverable => {
            warn!("refusing to perform backup to an inconsistent directory");
            return Ok(scrub_result);
        }
    }

    // After the scrub the two metadata trees agree, so one is enough.
    // The kept copy still matters even though it also agrees with the
    // backup tree: with hash omission the backup tree has no hashes for
    // unchanged files, while the manifest does, and dropping both would
    // lose them at write-out time.
    tm.discard_meta2();
    tm.save_metadata_on_exit();

    let backup_result = {
        let TreeManager { src, dst, meta1, .. } = &mut *tm;
        let src = src.as_ref().expect("backup requires a source tree");
        apply_differences(src, dst, Some(meta1), prompter)?
    };
    let mut result = scrub_result;
    if backup_result != Outcome::Clean {
        result = backup_result;
    }

    if !hash_all {
        info!("computing missing hashes in metadata files");
        let backup_root = tm
            .dst
            .top_path()
            .expect("the backup tree was scanned from disk")
            .to_path_buf();
        tm.meta1.bind_to_top_path(&backup_root)?;
        if let Err(error) = tm.meta1.compute_missing_hashes() {
            warn!(
                "an error occurred while computing missing hashes. The metadata files may \
                 be silently incomplete: look for a * instead of a hash, bit rot \
                 protection will not work for those files"
            );
            return Err(error.into());
        }
        info!("done computing hashes");
    }
    Ok(result)
}

/// Backup without metadata manifests: scan both directories and apply the
/// differences.
pub fn backup_plain(
    src: &Path,
    dst: &Path,
    parallel: bool,
    warnings: &WarningSink,
    prompter: &mut dyn Prompter,
) -> Result<Outcome, EngineError> {
    let (src_tree, mut dst_tree) =
        scan_source_and_backup(src, dst, ScanOpt::OmitHash, parallel, warnings)?;
    apply_differences(&src_tree, &mut dst_tree, None, prompter)
}

/// Applies the source↔backup diff so the backup becomes equal to the
/// source, updating `meta` (when given) to match.
fn apply_differences(
    src: &DirectoryTree,
    dst: &mut DirectoryTree,
    mut meta: Option<&mut DirectoryTree>,
    prompter: &mut dyn Prompter,
) -> Result<Outcome, EngineError> {
    info!("performing backup, comparing source directory with backup directory");
    let diff = diff2(src, dst, &CompareOpt::default());
    if diff.is_empty() {
        info!("no differences found");
    }

    let mut bitrot = false;
    let mut left_inconsistent = false;
    for d in diff.iter() {
        // Comparing the optional elements covers the missing-entry cases.
        match (&d[0], &d[1]) {
            (None, Some(extra)) => {
                let rel = extra.relative_path().to_path_buf();
                info!(
                    "removing {} {} from the backup directory",
                    extra.kind().describe(),
                    rel.display()
                );
                dst.remove_from_tree_and_filesystem(&rel)?;
                if let Some(meta) = meta.as_deref_mut() {
                    meta.remove_from_tree(&rel)?;
                }
            }
            (Some(missing), None) => {
                let rel = missing.relative_path().to_path_buf();
                info!(
                    "copying {} {} to the backup directory",
                    missing.kind().describe(),
                    rel.display()
                );
                dst.copy_from_tree_and_filesystem(src, &rel, parent_dir(&rel))?;
                if let Some(meta) = meta.as_deref_mut() {
                    meta.copy_from_tree(src, &rel, parent_dir(&rel))?;
                }
            }
            (Some(wanted), Some(current)) => {
                let rel = wanted.relative_path().to_path_buf();
                let mut opt = CompareOpt {
                    perm: false,
                    owner: false,
                    ..CompareOpt::default()
                };
                if wanted.kind() != ElementKind::Regular
                    || current.kind() != ElementKind::Regular
                {
                    opt.mtime = false;
                } else if wanted.hash().is_some() && current.hash().is_some() {
                    // With both hashes present the digest is authoritative
                    // and a pure mtime change costs only a metadata update.
                    // When either hash is omitted, mtime must stay
                    // significant: a same-size edit would otherwise never
                    // be backed up.
                    opt.mtime = false;
                }
                if wanted.matches_with(current, &opt) {
                    info!(
                        "updating the metadata of the {} {} in the backup directory",
                        wanted.kind().describe(),
                        rel.display()
                    );
                    if wanted.permissions() != current.permissions() {
                        dst.modify_permissions_in_tree_and_filesystem(
                            &rel,
                            wanted.permissions(),
                        )?;
                        if let Some(meta) = meta.as_deref_mut() {
                            meta.modify_permissions(&rel, wanted.permissions())?;
                        }
                    }
                    if wanted.user() != current.user() || wanted.group() != current.group() {
                        dst.modify_owner_in_tree_and_filesystem(
                            &rel,
                            wanted.user(),
                            wanted.group(),
                        )?;
                        if let Some(meta) = meta.as_deref_mut() {
                            meta.modify_owner(&rel, wanted.user(), wanted.group())?;
                        }
                    }
                    if wanted.mtime() != current.mtime() {
                        dst.modify_mtime_in_tree_and_filesystem(&rel, wanted.mtime())?;
                        if let Some(meta) = meta.as_deref_mut() {
                            meta.modify_mtime(&rel, wanted.mtime())?;
                        }
                    }
                } else if wanted.matches_with(current, &CompareOpt::metadata_only()) {
                    // Content changed while the mtime stayed put: the rot
                    // may just as well be in the source, so the backup copy
                    // is left alone.
                    bitrot = true;
                    warn!(
                        "bit rot in the source directory detected. The content of the {} \
                         {} changed but the modified time did not. NOT backing up this \
                         entry, the backup copy may be the good one",
                        wanted.kind().describe(),
                        rel.display()
                    );
                } else {
                    let mut replace = true;
                    if wanted.mtime() < current.mtime() {
                        let question = format!(
                            "{d}The {} {} in the backup directory is newer than the {} in \
                             the source directory (was something written directly into the \
                             backup directory?). Do you want to DELETE the backup entry \
                             and REPLACE it with the entry in the source directory?",
                            current.kind().describe(),
                            rel.display(),
                            wanted.kind().describe()
                        );
                        if !prompter.confirm(&question) {
                            replace = false;
                            left_inconsistent = true;
                            warn!(
                                "leaving backup inconsistent. This must be solved manually; \
                                 note that the {} in the source directory currently has no \
                                 backup",
                                wanted.kind().describe()
                            );
                        }
                    }
                    if replace {
                        info!(
                            "replacing the {} {} in the backup directory with the {} in \
                             the source directory",
                            current.kind().describe(),
                            rel.display(),
                            wanted.kind().describe()
                        );
                        dst.remove_from_tree_and_filesystem(&rel)?;
                        dst.copy_from_tree_and_filesystem(src, &rel, parent_dir(&rel))?;
                        if let Some(meta) = meta.as_deref_mut() {
                            meta.remove_from_tree(&rel)?;
                            meta.copy_from_tree(src, &rel, parent_dir(&rel))?;
                        }
                    }
                }
            }
            (None, None) => unreachable!("a diff line always has at least one element"),
        }
    }
    if bitrot {
        warn!(
            "bit rot was detected in the source directory. The source directory is never \
             written during a backup, so this must be fixed manually: review the listed \
             files and, if bit rot is confirmed, replace the rotten source files with the \
             good copies from the backup directory. A SMART check is advisable, the \
             source disk may be unreliable"
        );
        Ok(Outcome::Unrecoverable)
    } else if left_inconsistent {
        Ok(Outcome::Fixed)
    } else {
        info!("backup complete");
        Ok(Outcome::Clean)
    }
}
