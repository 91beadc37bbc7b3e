//! Tree mutation tests: in-memory subtree surgery and the filesystem
//! variants with their metadata-ordering guarantees.

use std::fs;
use std::io::Cursor;
use std::os::unix::fs::symlink;
use std::path::Path;

use dirtree::{
    diff2, tracing_warning_sink, CompareOpt, DirectoryTree, ScanOpt, TreeError,
};

const OLD_MTIME: i64 = 1_600_000_000;

fn scan(path: &Path) -> DirectoryTree {
    DirectoryTree::scan_directory(path, ScanOpt::ComputeHash, tracing_warning_sink())
        .expect("scan")
}

fn parse(manifest: &str) -> DirectoryTree {
    DirectoryTree::read_from(Cursor::new(manifest), "test", tracing_warning_sink())
        .expect("parse")
}

const MANIFEST: &str = "\
drwxr-xr-x alice users 2025-01-01 00:00:00 +0000 d
-rw-r--r-- alice users 2025-01-01 00:00:00 +0000 3 a9993e364706816aba3e25717850c26c9cd0d89c top

-rw-r--r-- alice users 2025-01-01 00:00:00 +0000 0 * d/f
";

#[test]
fn per_field_mutations_change_state_but_not_identity() {
    let mut tree = parse(MANIFEST);
    tree.modify_permissions(Path::new("d/f"), 0o600).expect("perm");
    tree.modify_owner(Path::new("d/f"), "bob", "staff").expect("owner");
    tree.modify_mtime(Path::new("d/f"), 42).expect("mtime");

    let element = tree.search(Path::new("d/f")).expect("still indexed");
    assert_eq!(element.permissions(), 0o600);
    assert_eq!(element.user(), "bob");
    assert_eq!(element.group(), "staff");
    assert_eq!(element.mtime(), 42);

    assert!(matches!(
        tree.modify_mtime(Path::new("missing"), 0),
        Err(TreeError::PathNotFound { .. })
    ));
}

#[test]
fn remove_from_tree_drops_the_subtree_and_its_index_entries() {
    let mut tree = parse(MANIFEST);
    let removed = tree.remove_from_tree(Path::new("d")).expect("remove");
    assert_eq!(removed, 2);
    assert!(tree.search(Path::new("d")).is_none());
    assert!(tree.search(Path::new("d/f")).is_none());
    assert!(tree.search(Path::new("top")).is_some());
    assert_eq!(tree.len(), 1);
}

#[test]
fn copy_from_tree_rewrites_paths_and_keeps_siblings_sorted() {
    let src = parse(MANIFEST);
    let mut dst = parse(
        "drwxr-xr-x alice users 2025-01-01 00:00:00 +0000 z\n",
    );
    dst.copy_from_tree(&src, Path::new("d"), Path::new("z")).expect("copy");

    let copied = dst.search(Path::new("z/d")).expect("copied dir");
    assert!(copied.is_directory());
    let nested = dst.search(Path::new("z/d/f")).expect("copied file");
    assert_eq!(nested.relative_path(), Path::new("z/d/f"));

    // Copy into the top level as well; listing stays directories-first.
    dst.copy_from_tree(&src, Path::new("top"), Path::new("")).expect("copy top");
    let manifest = dst.render();
    let first_group: Vec<&str> = manifest.lines().take_while(|l| !l.is_empty()).collect();
    assert_eq!(first_group.len(), 2);
    assert!(first_group[0].ends_with(" z"));
    assert!(first_group[1].ends_with(" top"));
}

#[test]
fn copy_from_tree_validates_source_and_destination() {
    let src = parse(MANIFEST);
    let mut dst = parse(MANIFEST);

    assert!(matches!(
        dst.copy_from_tree(&src, Path::new("missing"), Path::new("")),
        Err(TreeError::PathNotFound { .. })
    ));
    assert!(matches!(
        dst.copy_from_tree(&src, Path::new("d/f"), Path::new("missing")),
        Err(TreeError::PathNotFound { .. })
    ));
    assert!(matches!(
        dst.copy_from_tree(&src, Path::new("d/f"), Path::new("top")),
        Err(TreeError::NotADirectory { .. })
    ));
    assert!(matches!(
        dst.copy_from_tree(&src, Path::new("d"), Path::new("")),
        Err(TreeError::AlreadyExists { .. })
    ));
}

#[test]
fn filesystem_mutations_require_a_scanned_tree() {
    let mut tree = parse(MANIFEST);
    assert!(matches!(
        tree.remove_from_tree_and_filesystem(Path::new("d")),
        Err(TreeError::NotFromScan { .. })
    ));
    assert!(matches!(
        tree.modify_mtime_in_tree_and_filesystem(Path::new("d/f"), 0),
        Err(TreeError::NotFromScan { .. })
    ));
}

#[test]
fn copy_between_scanned_trees_replays_content_and_metadata() {
    let temp = tempfile::tempdir().expect("tempdir");
    let src_root = temp.path().join("src");
    let dst_root = temp.path().join("dst");
    fs::create_dir_all(src_root.join("d")).expect("src dirs");
    fs::create_dir_all(dst_root.join("d")).expect("dst dirs");
    fs::write(src_root.join("d/f"), b"abc").expect("write");
    symlink("f", src_root.join("d/l")).expect("symlink");
    fsext::set_symlink_mtime(&src_root.join("d/f"), OLD_MTIME).expect("stamp");
    fsext::set_symlink_mtime(&src_root.join("d/l"), OLD_MTIME).expect("stamp");
    fsext::set_symlink_mtime(&src_root.join("d"), OLD_MTIME).expect("stamp");
    fsext::set_symlink_mtime(&dst_root.join("d"), OLD_MTIME).expect("stamp");

    let src = scan(&src_root);
    let mut dst = scan(&dst_root);

    dst.copy_from_tree_and_filesystem(&src, Path::new("d/f"), Path::new("d"))
        .expect("copy file");
    dst.copy_from_tree_and_filesystem(&src, Path::new("d/l"), Path::new("d"))
        .expect("copy symlink");

    // Content and mtime arrived on disk.
    assert_eq!(fs::read(dst_root.join("d/f")).expect("read"), b"abc");
    assert_eq!(
        fsext::symlink_status(&dst_root.join("d/f")).expect("status").mtime,
        OLD_MTIME
    );
    assert_eq!(
        fs::read_link(dst_root.join("d/l")).expect("read link"),
        Path::new("f").to_path_buf()
    );

    // The copied-into directory keeps the mtime recorded in the tree, not
    // the one the OS stamped while creating children.
    assert_eq!(
        fsext::symlink_status(&dst_root.join("d")).expect("status").mtime,
        OLD_MTIME
    );

    // The trees now agree.
    assert!(diff2(&src, &dst, &CompareOpt::default()).is_empty());
}

#[test]
fn copy_of_a_directory_applies_permissions_after_children() {
    let temp = tempfile::tempdir().expect("tempdir");
    let src_root = temp.path().join("src");
    let dst_root = temp.path().join("dst");
    fs::create_dir_all(src_root.join("d/sub")).expect("src dirs");
    fs::create_dir(&dst_root).expect("dst root");
    fs::write(src_root.join("d/sub/f"), b"abc").expect("write");
    fsext::set_symlink_mtime(&src_root.join("d/sub/f"), OLD_MTIME).expect("stamp");
    fsext::set_symlink_mtime(&src_root.join("d/sub"), OLD_MTIME).expect("stamp");
    fsext::set_symlink_mtime(&src_root.join("d"), OLD_MTIME).expect("stamp");

    let src = scan(&src_root);
    let mut dst = scan(&dst_root);
    dst.copy_from_tree_and_filesystem(&src, Path::new("d"), Path::new(""))
        .expect("copy dir");

    assert_eq!(fs::read(dst_root.join("d/sub/f")).expect("read"), b"abc");
    assert_eq!(
        fsext::symlink_status(&dst_root.join("d")).expect("status").mtime,
        OLD_MTIME
    );
    assert_eq!(
        fsext::symlink_status(&dst_root.join("d/sub")).expect("status").mtime,
        OLD_MTIME
    );
    assert!(diff2(&src, &dst, &CompareOpt::default()).is_empty());
}

#[test]
fn remove_from_tree_and_filesystem_preserves_parent_mtime() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("root");
    fs::create_dir_all(root.join("d")).expect("dirs");
    fs::write(root.join("d/f"), b"abc").expect("write");
    fsext::set_symlink_mtime(&root.join("d/f"), OLD_MTIME).expect("stamp");
    fsext::set_symlink_mtime(&root.join("d"), OLD_MTIME).expect("stamp");

    let mut tree = scan(&root);
    let removed = tree
        .remove_from_tree_and_filesystem(Path::new("d/f"))
        .expect("remove");
    assert_eq!(removed, 1);
    assert!(!root.join("d/f").exists());
    assert_eq!(
        fsext::symlink_status(&root.join("d")).expect("status").mtime,
        OLD_MTIME
    );
}

#[test]
fn add_symlink_recreates_the_link_from_recorded_metadata() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("root");
    fs::create_dir_all(root.join("d")).expect("dirs");
    symlink("target", root.join("d/l")).expect("symlink");
    fsext::set_symlink_mtime(&root.join("d/l"), OLD_MTIME).expect("stamp");
    fsext::set_symlink_mtime(&root.join("d"), OLD_MTIME).expect("stamp");

    let reference = scan(&root);
    let recorded = reference.search(Path::new("d/l")).expect("symlink").clone();

    // Delete the link out of band, then recreate it from the element.
    fs::remove_file(root.join("d/l")).expect("remove");
    fsext::set_symlink_mtime(&root.join("d"), OLD_MTIME).expect("restamp");
    let mut tree = scan(&root);
    tree.add_symlink_to_tree_and_filesystem(recorded).expect("add");

    assert_eq!(
        fs::read_link(root.join("d/l")).expect("read link"),
        Path::new("target").to_path_buf()
    );
    assert_eq!(
        fsext::symlink_status(&root.join("d/l")).expect("status").mtime,
        OLD_MTIME
    );
    assert_eq!(
        fsext::symlink_status(&root.join("d")).expect("status").mtime,
        OLD_MTIME
    );
    assert!(diff2(&reference, &tree, &CompareOpt::default()).is_empty());
}

#[test]
fn modify_mtime_in_tree_and_filesystem_stamps_the_entry() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("root");
    fs::create_dir(&root).expect("root");
    fs::write(root.join("f"), b"abc").expect("write");

    let mut tree = scan(&root);
    tree.modify_mtime_in_tree_and_filesystem(Path::new("f"), OLD_MTIME)
        .expect("mtime");
    assert_eq!(tree.search(Path::new("f")).expect("f").mtime(), OLD_MTIME);
    assert_eq!(
        fsext::symlink_status(&root.join("f")).expect("status").mtime,
        OLD_MTIME
    );
}
