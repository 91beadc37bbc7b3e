//! End-to-end scrub and backup engine tests over real temporary
//! directories, driven by a scripted prompter.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use dirtree::{diff2, diff3, tracing_warning_sink, CompareOpt, DirectoryTree, ScanOpt};
use engine::{backup, backup_plain, scrub, Outcome, ScriptedPrompter, TreeManager};

const T0: i64 = 1_600_000_000;

struct Fixture {
    _temp: tempfile::TempDir,
    src: PathBuf,
    dst: PathBuf,
    meta1: PathBuf,
    meta2: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let src = temp.path().join("source");
        let dst = temp.path().join("backup");
        fs::create_dir(&src).expect("create source");
        fs::create_dir(&dst).expect("create backup");
        Self {
            meta1: temp.path().join("meta1"),
            meta2: temp.path().join("meta2"),
            _temp: temp,
            src,
            dst,
        }
    }

    /// Scans the backup directory and writes the result to both manifest
    /// paths, so all three witnesses agree.
    fn write_manifests_from_backup(&self) {
        let tree = scan(&self.dst);
        tree.write_to_path(&self.meta1).expect("write meta1");
        tree.write_to_path(&self.meta2).expect("write meta2");
    }

    fn scrub_manager(&self) -> TreeManager {
        TreeManager::without_source(
            &self.dst,
            &self.meta1,
            &self.meta2,
            ScanOpt::ComputeHash,
            &tracing_warning_sink(),
        )
        .expect("tree manager")
    }

    fn scrub_manager_with_source(&self) -> TreeManager {
        TreeManager::with_source(
            &self.src,
            &self.dst,
            &self.meta1,
            &self.meta2,
            ScanOpt::ComputeHash,
            false,
            &tracing_warning_sink(),
        )
        .expect("tree manager")
    }
}

fn scan(path: &Path) -> DirectoryTree {
    DirectoryTree::scan_directory(path, ScanOpt::ComputeHash, tracing_warning_sink())
        .expect("scan")
}

fn stamp(path: &Path, mtime: i64) {
    fsext::set_symlink_mtime(path, mtime).expect("stamp mtime");
}

/// Writes `content` and pins the file mtime so content edits can be made
/// detectable (or deliberately undetectable) later.
fn write_file(path: &Path, content: &[u8], mtime: i64) {
    fs::write(path, content).expect("write file");
    stamp(path, mtime);
}

#[test]
fn scrub_is_clean_when_all_witnesses_agree() {
    let fx = Fixture::new();
    fs::create_dir(fx.dst.join("d")).expect("dir");
    write_file(&fx.dst.join("d/f"), b"abc", T0);
    stamp(&fx.dst.join("d"), T0);
    fx.write_manifests_from_backup();

    let mut tm = fx.scrub_manager();
    let mut prompter = ScriptedPrompter::new([]);
    assert_eq!(scrub(&mut tm, false, &mut prompter).expect("scrub"), Outcome::Clean);
    tm.commit().expect("commit");

    // A clean scrub writes nothing.
    assert!(!fx.meta1.with_extension("bak").exists());
    assert!(!PathBuf::from(format!("{}.bak", fx.meta2.display())).exists());
}

#[test]
fn scrub_repairs_a_manifest_that_lost_an_entry() {
    let fx = Fixture::new();
    write_file(&fx.dst.join("x"), b"abc", T0);
    write_file(&fx.dst.join("y"), b"def", T0);

    let tree = scan(&fx.dst);
    tree.write_to_path(&fx.meta1).expect("write meta1");
    let mut broken = scan(&fx.dst);
    broken.remove_from_tree(Path::new("x")).expect("drop x");
    broken.write_to_path(&fx.meta2).expect("write meta2");
    let meta1_bytes = fs::read(&fx.meta1).expect("read meta1");
    let meta2_bytes = fs::read(&fx.meta2).expect("read meta2");

    let mut tm = fx.scrub_manager();
    let mut prompter = ScriptedPrompter::new([]);
    // Manifest-versus-manifest repairs need no fixup flag and no prompts.
    assert_eq!(scrub(&mut tm, false, &mut prompter).expect("scrub"), Outcome::Fixed);
    tm.commit().expect("commit");

    // The repaired second manifest now matches the first, and the previous
    // version was kept as .bak.
    assert_eq!(fs::read(&fx.meta2).expect("read meta2"), meta1_bytes);
    let meta2_bak = PathBuf::from(format!("{}.bak", fx.meta2.display()));
    assert_eq!(fs::read(&meta2_bak).expect("read meta2.bak"), meta2_bytes);
    // The first manifest was rewritten unchanged, without a .bak.
    assert_eq!(fs::read(&fx.meta1).expect("read meta1"), meta1_bytes);
    assert!(!PathBuf::from(format!("{}.bak", fx.meta1.display())).exists());

    // Scrub idempotence: a second run finds nothing to do.
    let mut tm = fx.scrub_manager();
    assert_eq!(scrub(&mut tm, false, &mut prompter).expect("rescrub"), Outcome::Clean);
}

#[test]
fn scrub_reports_bit_rot_and_leaves_the_backup_alone() {
    let fx = Fixture::new();
    write_file(&fx.dst.join("x"), b"abc", T0);
    fx.write_manifests_from_backup();

    // Corrupt the content without touching size or mtime.
    write_file(&fx.dst.join("x"), b"abd", T0);

    let mut tm = fx.scrub_manager();
    let mut prompter = ScriptedPrompter::new([]);
    assert_eq!(
        scrub(&mut tm, true, &mut prompter).expect("scrub"),
        Outcome::Unrecoverable
    );
    tm.commit().expect("commit");

    // Bit rot skips the confirmation entirely, and without a source tree
    // nothing is modified.
    assert!(prompter.asked().is_empty());
    assert_eq!(fs::read(fx.dst.join("x")).expect("read"), b"abd");
    assert!(!PathBuf::from(format!("{}.bak", fx.meta1.display())).exists());
}

#[test]
fn scrub_recreates_a_missing_symlink_from_the_manifest() {
    let fx = Fixture::new();
    fs::create_dir(fx.dst.join("d")).expect("dir");
    symlink("target", fx.dst.join("d/l")).expect("symlink");
    stamp(&fx.dst.join("d/l"), T0);
    stamp(&fx.dst.join("d"), T0);
    fx.write_manifests_from_backup();

    // The link disappears out of band.
    fs::remove_file(fx.dst.join("d/l")).expect("remove");
    stamp(&fx.dst.join("d"), T0);

    let mut tm = fx.scrub_manager();
    let mut prompter = ScriptedPrompter::new([]);
    assert_eq!(scrub(&mut tm, true, &mut prompter).expect("scrub"), Outcome::Fixed);
    tm.commit().expect("commit");

    assert_eq!(
        fs::read_link(fx.dst.join("d/l")).expect("read link"),
        PathBuf::from("target")
    );
    assert_eq!(
        fsext::symlink_status(&fx.dst.join("d/l")).expect("status").mtime,
        T0
    );
    assert_eq!(
        fsext::symlink_status(&fx.dst.join("d")).expect("status").mtime,
        T0
    );
}

#[test]
fn scrub_removes_an_unexpected_entry_only_after_confirmation() {
    let fx = Fixture::new();
    write_file(&fx.dst.join("wanted"), b"abc", T0);
    fx.write_manifests_from_backup();
    write_file(&fx.dst.join("stray"), b"junk", T0);

    // Refusal leaves the entry and makes the scrub unrecoverable.
    let mut tm = fx.scrub_manager();
    let mut refusing = ScriptedPrompter::always(false);
    assert_eq!(
        scrub(&mut tm, true, &mut refusing).expect("scrub"),
        Outcome::Unrecoverable
    );
    tm.commit().expect("commit");
    assert!(fx.dst.join("stray").exists());
    assert_eq!(refusing.asked().len(), 1);
    assert!(refusing.asked()[0].contains("DELETE"));

    // Confirmation removes it.
    let mut tm = fx.scrub_manager();
    let mut accepting = ScriptedPrompter::always(true);
    assert_eq!(scrub(&mut tm, true, &mut accepting).expect("scrub"), Outcome::Fixed);
    tm.commit().expect("commit");
    assert!(!fx.dst.join("stray").exists());
}

#[test]
fn scrub_restarts_after_removing_an_unexpected_directory() {
    let fx = Fixture::new();
    write_file(&fx.dst.join("wanted"), b"abc", T0);
    fx.write_manifests_from_backup();
    fs::create_dir(fx.dst.join("straydir")).expect("dir");
    write_file(&fx.dst.join("straydir/f"), b"junk", T0);
    stamp(&fx.dst.join("straydir"), T0);

    let mut tm = fx.scrub_manager();
    let mut prompter = ScriptedPrompter::always(true);
    assert_eq!(scrub(&mut tm, true, &mut prompter).expect("scrub"), Outcome::Fixed);
    tm.commit().expect("commit");
    assert!(!fx.dst.join("straydir").exists());

    let mut tm = fx.scrub_manager();
    let mut prompter = ScriptedPrompter::new([]);
    assert_eq!(scrub(&mut tm, false, &mut prompter).expect("rescrub"), Outcome::Clean);
}

#[test]
fn scrub_rescues_a_lost_file_from_the_source_directory() {
    let fx = Fixture::new();
    fs::create_dir(fx.dst.join("d")).expect("dir");
    write_file(&fx.dst.join("d/f"), b"abc", T0);
    stamp(&fx.dst.join("d"), T0);
    fx.write_manifests_from_backup();
    // The source mirrors the backup exactly.
    fs::create_dir(fx.src.join("d")).expect("dir");
    write_file(&fx.src.join("d/f"), b"abc", T0);
    stamp(&fx.src.join("d"), T0);

    // The backup copy vanishes.
    fs::remove_file(fx.dst.join("d/f")).expect("remove");
    stamp(&fx.dst.join("d"), T0);

    let mut tm = fx.scrub_manager_with_source();
    let mut prompter = ScriptedPrompter::new([]);
    assert_eq!(scrub(&mut tm, true, &mut prompter).expect("scrub"), Outcome::Fixed);
    tm.commit().expect("commit");

    assert_eq!(fs::read(fx.dst.join("d/f")).expect("read"), b"abc");
    assert_eq!(
        fsext::symlink_status(&fx.dst.join("d/f")).expect("status").mtime,
        T0
    );
}

#[test]
fn scrub_without_fixup_flags_backup_divergence_as_unrecoverable() {
    let fx = Fixture::new();
    write_file(&fx.dst.join("x"), b"abc", T0);
    fx.write_manifests_from_backup();
    write_file(&fx.dst.join("x"), b"xyz", T0 + 10);

    let mut tm = fx.scrub_manager();
    let mut prompter = ScriptedPrompter::new([]);
    assert_eq!(
        scrub(&mut tm, false, &mut prompter).expect("scrub"),
        Outcome::Unrecoverable
    );
    tm.commit().expect("commit");
    // Nothing was saved: fixes were skipped, not applied.
    assert!(!PathBuf::from(format!("{}.bak", fx.meta1.display())).exists());
}

#[test]
fn backup_converges_source_backup_and_manifests() {
    let fx = Fixture::new();
    fs::create_dir(fx.src.join("a")).expect("dir");
    write_file(&fx.src.join("a/file1"), b"abc", T0);
    symlink("file1", fx.src.join("a/link")).expect("symlink");
    stamp(&fx.src.join("a/link"), T0);
    stamp(&fx.src.join("a"), T0);
    write_file(&fx.src.join("top"), b"hello", T0);
    fx.write_manifests_from_backup(); // backup is empty, manifests match it

    let mut tm = TreeManager::with_source(
        &fx.src,
        &fx.dst,
        &fx.meta1,
        &fx.meta2,
        ScanOpt::OmitHash,
        false,
        &tracing_warning_sink(),
    )
    .expect("tree manager");
    let mut prompter = ScriptedPrompter::new([]);
    assert_eq!(
        backup(&mut tm, false, false, &mut prompter).expect("backup"),
        Outcome::Clean
    );
    tm.commit().expect("commit");

    // The backup now mirrors the source byte for byte and metadata for
    // metadata.
    let src_tree = scan(&fx.src);
    let dst_tree = scan(&fx.dst);
    assert!(diff2(&src_tree, &dst_tree, &CompareOpt::default()).is_empty());
    assert_eq!(fs::read(fx.dst.join("a/file1")).expect("read"), b"abc");

    // Both manifests are byte-equal and agree with the backup, with real
    // hashes despite the hash-omitted scan.
    let meta1_bytes = fs::read(&fx.meta1).expect("read meta1");
    assert_eq!(meta1_bytes, fs::read(&fx.meta2).expect("read meta2"));
    let manifest = String::from_utf8(meta1_bytes).expect("utf8");
    assert!(manifest.contains("a9993e364706816aba3e25717850c26c9cd0d89c"));
    assert!(!manifest.contains(" * "));

    let warnings = tracing_warning_sink();
    let meta1_tree =
        DirectoryTree::read_from_path(&fx.meta1, warnings.clone()).expect("read meta1");
    let meta2_tree =
        DirectoryTree::read_from_path(&fx.meta2, warnings).expect("read meta2");
    assert!(diff3(&dst_tree, &meta1_tree, &meta2_tree, &CompareOpt::default()).is_empty());
}

#[test]
fn backup_of_an_empty_source_empties_the_backup() {
    let fx = Fixture::new();
    fs::create_dir(fx.dst.join("d")).expect("dir");
    write_file(&fx.dst.join("d/f"), b"abc", T0);
    write_file(&fx.dst.join("top"), b"xyz", T0);
    stamp(&fx.dst.join("d"), T0);
    fx.write_manifests_from_backup();

    let mut tm = TreeManager::with_source(
        &fx.src,
        &fx.dst,
        &fx.meta1,
        &fx.meta2,
        ScanOpt::ComputeHash,
        false,
        &tracing_warning_sink(),
    )
    .expect("tree manager");
    let mut prompter = ScriptedPrompter::new([]);
    assert_eq!(
        backup(&mut tm, false, true, &mut prompter).expect("backup"),
        Outcome::Clean
    );
    tm.commit().expect("commit");

    assert!(fs::read_dir(&fx.dst).expect("list").next().is_none());
    let src_tree = scan(&fx.src);
    let dst_tree = scan(&fx.dst);
    assert!(diff2(&src_tree, &dst_tree, &CompareOpt::default()).is_empty());
    // The manifests emptied out too.
    assert_eq!(fs::read(&fx.meta1).expect("read meta1"), b"");
}

#[test]
fn backup_refuses_to_overwrite_bit_rotten_source() {
    let fx = Fixture::new();
    write_file(&fx.src.join("f"), b"good data", T0);
    write_file(&fx.dst.join("f"), b"good data", T0);
    fx.write_manifests_from_backup();

    // The source rots: same size, same mtime, different content.
    write_file(&fx.src.join("f"), b"rott data", T0);

    let mut tm = TreeManager::with_source(
        &fx.src,
        &fx.dst,
        &fx.meta1,
        &fx.meta2,
        ScanOpt::ComputeHash,
        false,
        &tracing_warning_sink(),
    )
    .expect("tree manager");
    let mut prompter = ScriptedPrompter::new([]);
    assert_eq!(
        backup(&mut tm, false, true, &mut prompter).expect("backup"),
        Outcome::Unrecoverable
    );
    tm.commit().expect("commit");

    // The possibly-good backup copy was not overwritten.
    assert_eq!(fs::read(fx.dst.join("f")).expect("read"), b"good data");
}

#[test]
fn backup_prompts_before_replacing_a_newer_backup_entry() {
    let fx = Fixture::new();
    write_file(&fx.src.join("f"), b"from source", T0);
    write_file(&fx.dst.join("f"), b"edited in backup!", T0 + 100);
    fx.write_manifests_from_backup();

    // Refusal keeps the backup version and reports a recoverable state.
    let mut tm = TreeManager::with_source(
        &fx.src,
        &fx.dst,
        &fx.meta1,
        &fx.meta2,
        ScanOpt::ComputeHash,
        false,
        &tracing_warning_sink(),
    )
    .expect("tree manager");
    let mut refusing = ScriptedPrompter::always(false);
    assert_eq!(
        backup(&mut tm, false, true, &mut refusing).expect("backup"),
        Outcome::Fixed
    );
    tm.commit().expect("commit");
    assert_eq!(fs::read(fx.dst.join("f")).expect("read"), b"edited in backup!");
    assert_eq!(refusing.asked().len(), 1);
    assert!(refusing.asked()[0].contains("REPLACE"));

    // Confirmation replaces the backup entry with the source entry.
    let mut tm = TreeManager::with_source(
        &fx.src,
        &fx.dst,
        &fx.meta1,
        &fx.meta2,
        ScanOpt::ComputeHash,
        false,
        &tracing_warning_sink(),
    )
    .expect("tree manager");
    let mut accepting = ScriptedPrompter::always(true);
    assert_eq!(
        backup(&mut tm, false, true, &mut accepting).expect("backup"),
        Outcome::Clean
    );
    tm.commit().expect("commit");
    assert_eq!(fs::read(fx.dst.join("f")).expect("read"), b"from source");
    let src_tree = scan(&fx.src);
    let dst_tree = scan(&fx.dst);
    assert!(diff2(&src_tree, &dst_tree, &CompareOpt::default()).is_empty());
}

#[test]
fn plain_backup_synchronizes_without_manifests() {
    let fx = Fixture::new();
    fs::create_dir(fx.src.join("d")).expect("dir");
    write_file(&fx.src.join("d/f"), b"abc", T0);
    stamp(&fx.src.join("d"), T0);
    write_file(&fx.dst.join("obsolete"), b"old", T0);

    let mut prompter = ScriptedPrompter::new([]);
    assert_eq!(
        backup_plain(&fx.src, &fx.dst, true, &tracing_warning_sink(), &mut prompter)
            .expect("backup"),
        Outcome::Clean
    );

    assert_eq!(fs::read(fx.dst.join("d/f")).expect("read"), b"abc");
    assert!(!fx.dst.join("obsolete").exists());
    let src_tree = scan(&fx.src);
    let dst_tree = scan(&fx.dst);
    assert!(diff2(&src_tree, &dst_tree, &CompareOpt::default()).is_empty());
}
