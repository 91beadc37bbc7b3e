//! In-memory representation of the metadata of a directory tree.
//!
//! # Design
//!
//! Nodes live in a slab arena and refer to each other through integer
//! handles; a flat `relative path → handle` index gives O(1) lookup while
//! sibling lists stay sorted (directories first, then alphabetical). The
//! top directory itself is implicit: it has no element and no entry in the
//! index.
//!
//! A tree remembers where it came from. [`Origin::FromScan`] carries the
//! absolute top path and unlocks the mutations that touch the filesystem;
//! trees parsed from a manifest are [`Origin::FromManifest`] and only allow
//! in-memory edits until [`DirectoryTree::bind_to_top_path`] is called.
//!
//! # Invariants
//!
//! - Every node reachable from the root appears in the index exactly once,
//!   keyed by its current relative path.
//! - Every non-top-level node's parent directory is a node of the same
//!   tree.
//! - Sibling lists are kept sorted by [`FilesystemElement::sibling_cmp`].
//!
//! These are checked at mutation seams in debug builds.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::element::{ElementKind, FilesystemElement, ScanOpt};
use crate::error::TreeError;

/// Handle of a node inside the tree's arena.
pub(crate) type NodeId = usize;

/// Callback receiving non-fatal diagnostics: unknown file types, multiple
/// hardlinks, failed ownership changes.
pub type WarningSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Returns the default sink, which routes warnings through
/// [`tracing::warn!`].
#[must_use]
pub fn tracing_warning_sink() -> WarningSink {
    Arc::new(|message| tracing::warn!("{message}"))
}

/// Where the tree's data came from.
#[derive(Clone, Debug)]
pub enum Origin {
    /// Parsed from a metadata manifest; the filesystem location of the
    /// described entries is unknown.
    FromManifest,
    /// Built by scanning a directory; mutations may touch the filesystem
    /// below `top_path`.
    FromScan {
        /// Absolute path of the scanned top directory.
        top_path: PathBuf,
    },
}

#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) element: FilesystemElement,
    pub(crate) children: Vec<NodeId>,
}

/// In-memory tree of [`FilesystemElement`] values with a flat path index.
pub struct DirectoryTree {
    nodes: Vec<Option<Node>>,
    free: Vec<NodeId>,
    top: Vec<NodeId>,
    index: HashMap<String, NodeId>,
    origin: Origin,
    scan_opt: ScanOpt,
    warnings: WarningSink,
}

impl Default for DirectoryTree {
    fn default() -> Self {
        Self::new()
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn parent_of(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| !p.as_os_str().is_empty())
}

impl DirectoryTree {
    /// Creates an empty tree with the default warning sink.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            top: Vec::new(),
            index: HashMap::new(),
            origin: Origin::FromManifest,
            scan_opt: ScanOpt::ComputeHash,
            warnings: tracing_warning_sink(),
        }
    }

    /// Replaces the warning sink.
    pub fn set_warning_sink(&mut self, sink: WarningSink) {
        self.warnings = sink;
    }

    /// Builds a tree by recursively scanning `top_path`.
    ///
    /// Sibling enumeration is resorted so scan order is deterministic.
    /// Directory symlinks are listed but never descended into, which also
    /// rules out filesystem loops. Unknown file types and non-directory
    /// entries with more than one hardlink produce warnings.
    pub fn scan_directory(
        top_path: &Path,
        opt: ScanOpt,
        warnings: WarningSink,
    ) -> Result<Self, TreeError> {
        let top_path = std::path::absolute(top_path)
            .map_err(|error| TreeError::io("resolve", top_path, error))?;
        if !top_path.is_dir() {
            return Err(TreeError::NotADirectory {
                op: "scan",
                path: top_path,
            });
        }
        let mut tree = Self {
            origin: Origin::FromScan { top_path },
            scan_opt: opt,
            warnings,
            ..Self::new()
        };
        tree.scan_level(Path::new(""))?;
        tree.debug_check_index();
        Ok(tree)
    }

    fn scan_level(&mut self, rel: &Path) -> Result<(), TreeError> {
        let top = self
            .top_path()
            .expect("scan_level is only called on scanned trees")
            .to_path_buf();
        let abs = top.join(rel);
        let mut elements = Vec::new();
        let entries =
            fs::read_dir(&abs).map_err(|error| TreeError::io("list directory", &abs, error))?;
        for entry in entries {
            let entry = entry.map_err(|error| TreeError::io("list directory", &abs, error))?;
            let child_rel = rel.join(entry.file_name());
            elements.push(FilesystemElement::from_scan(
                &entry.path(),
                child_rel,
                self.scan_opt,
            )?);
        }
        elements.sort_by(FilesystemElement::sibling_cmp);

        let ids: Vec<NodeId> = elements
            .into_iter()
            .map(|element| {
                self.alloc(Node {
                    element,
                    children: Vec::new(),
                })
            })
            .collect();
        if rel.as_os_str().is_empty() {
            self.top = ids.clone();
        } else {
            let parent = self.index[&path_key(rel)];
            self.node_mut(parent).children = ids.clone();
        }

        for &id in &ids {
            let element = &self.node(id).element;
            let key = element.path_key().to_string();
            let kind = element.kind();
            let links = element.hard_link_count();
            self.index.insert(key.clone(), id);
            if kind == ElementKind::Unknown {
                (self.warnings)(&format!("{key}: unsupported file type"));
            }
            if kind != ElementKind::Directory && links > 1 {
                (self.warnings)(&format!(
                    "{key}: has multiple hardlinks, treating them as independent files"
                ));
            }
        }

        for &id in &ids {
            if self.node(id).element.is_directory() {
                let child_rel = self.node(id).element.relative_path().to_path_buf();
                self.scan_level(&child_rel)?;
            }
        }
        Ok(())
    }

    /// Parses a metadata manifest file.
    pub fn read_from_path(path: &Path, warnings: WarningSink) -> Result<Self, TreeError> {
        let file = fs::File::open(path).map_err(|error| TreeError::ManifestRead {
            path: path.to_path_buf(),
            source: error,
        })?;
        Self::read_from(
            BufReader::new(file),
            &path.to_string_lossy(),
            warnings,
        )
    }

    /// Parses a metadata manifest from a reader.
    ///
    /// One element per non-empty line; a blank line closes a *group*. The
    /// first group lists the top-level directory's children; each further
    /// group lists the content of a previously declared directory. All
    /// elements of a group must share the same parent, the parent must
    /// already be in the index, and at most one group per directory is
    /// accepted. Duplicate paths fail the parse.
    pub fn read_from(
        reader: impl BufRead,
        manifest_name: &str,
        warnings: WarningSink,
    ) -> Result<Self, TreeError> {
        let mut tree = Self {
            warnings,
            ..Self::new()
        };
        let mut pending: Vec<FilesystemElement> = Vec::new();
        let mut line_no = 0_u32;
        for line in reader.lines() {
            let line = line.map_err(|error| TreeError::ManifestRead {
                path: PathBuf::from(manifest_name),
                source: error,
            })?;
            line_no += 1;
            if line.is_empty() {
                tree.attach_group(&mut pending, manifest_name, line_no)?;
            } else {
                pending.push(FilesystemElement::parse(&line, manifest_name, line_no)?);
            }
        }
        tree.attach_group(&mut pending, manifest_name, line_no)?;
        tree.debug_check_index();
        Ok(tree)
    }

    /// Builds a tree from a path that is either a directory (scan) or a
    /// metadata manifest file (parse).
    pub fn from_path(path: &Path, opt: ScanOpt, warnings: WarningSink) -> Result<Self, TreeError> {
        if path.is_dir() {
            Self::scan_directory(path, opt, warnings)
        } else {
            Self::read_from_path(path, warnings)
        }
    }

    fn attach_group(
        &mut self,
        pending: &mut Vec<FilesystemElement>,
        file: &str,
        line_no: u32,
    ) -> Result<(), TreeError> {
        if pending.is_empty() {
            return Ok(());
        }
        let group = std::mem::take(pending);
        let fail = |reason: &str| TreeError::parse(file, line_no, reason, "");

        let parent = parent_of(group[0].relative_path()).map(Path::to_path_buf);
        let ids: Vec<NodeId> = group
            .into_iter()
            .map(|element| -> Result<NodeId, TreeError> {
                if parent_of(element.relative_path()).map(Path::to_path_buf) != parent {
                    return Err(fail("different paths grouped"));
                }
                if element.kind() == ElementKind::Unknown {
                    (self.warnings)(&format!(
                        "{}: unsupported file type",
                        element.relative_path().display()
                    ));
                }
                let key = element.path_key().to_string();
                let id = self.alloc(Node {
                    element,
                    children: Vec::new(),
                });
                if self.index.insert(key.clone(), id).is_some() {
                    return Err(fail(&format!("duplicate path '{key}'")));
                }
                Ok(id)
            })
            .collect::<Result<_, _>>()?;

        if self.top.is_empty() {
            // First group: must list the top-level directory's children.
            if parent.is_some() {
                return Err(fail("file does not start with top level directory"));
            }
            self.top = ids;
        } else {
            let Some(parent) = parent else {
                return Err(fail("second top level directory group"));
            };
            let Some(&parent_id) = self.index.get(&path_key(&parent)) else {
                return Err(fail("directory content not preceded by its directory entry"));
            };
            let parent_node = self.node(parent_id);
            if !parent_node.element.is_directory() {
                return Err(fail("group parent is not a directory"));
            }
            if !parent_node.children.is_empty() {
                return Err(fail("duplicate noncontiguous directory content"));
            }
            self.node_mut(parent_id).children = ids;
        }
        Ok(())
    }

    /// Serializes the tree to a manifest file.
    pub fn write_to_path(&self, path: &Path) -> Result<(), TreeError> {
        let mut file = fs::File::create(path).map_err(|error| TreeError::ManifestWrite {
            path: path.to_path_buf(),
            source: error,
        })?;
        self.write_to(&mut file)
            .map_err(|error| TreeError::ManifestWrite {
                path: path.to_path_buf(),
                source: error,
            })
    }

    /// Serializes the tree in the manifest format: elements in depth-first
    /// order, one group per directory, groups separated by blank lines.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut print_break = false;
        self.write_group(writer, &self.top, &mut print_break)
    }

    fn write_group<W: Write>(
        &self,
        writer: &mut W,
        ids: &[NodeId],
        print_break: &mut bool,
    ) -> io::Result<()> {
        if *print_break {
            writeln!(writer)?;
        }
        for &id in ids {
            writeln!(writer, "{}", self.node(id).element)?;
        }
        *print_break = !ids.is_empty();
        for &id in ids {
            let node = self.node(id);
            if !node.element.is_directory() {
                // Siblings are sorted with directories first.
                break;
            }
            self.write_group(writer, &node.children, print_break)?;
        }
        Ok(())
    }

    /// Renders the manifest serialization into a string.
    #[must_use]
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        self.write_to(&mut buffer)
            .expect("writing to a Vec cannot fail");
        String::from_utf8(buffer).expect("manifest output is UTF-8")
    }

    /// Absolute top path, present only for scanned (or re-bound) trees.
    #[must_use]
    pub fn top_path(&self) -> Option<&Path> {
        match &self.origin {
            Origin::FromManifest => None,
            Origin::FromScan { top_path } => Some(top_path),
        }
    }

    /// Associates a manifest-loaded tree with a directory on disk so that
    /// hash recomputation (and other filesystem operations) can run
    /// against it.
    pub fn bind_to_top_path(&mut self, top_path: &Path) -> Result<(), TreeError> {
        let top_path = std::path::absolute(top_path)
            .map_err(|error| TreeError::io("resolve", top_path, error))?;
        if !top_path.is_dir() {
            return Err(TreeError::NotADirectory {
                op: "bind to top path",
                path: top_path,
            });
        }
        self.origin = Origin::FromScan { top_path };
        Ok(())
    }

    /// True when the tree has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.top.is_empty()
    }

    /// Number of entries in the tree.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Looks up an element by relative path.
    #[must_use]
    pub fn search(&self, path: &Path) -> Option<&FilesystemElement> {
        self.index
            .get(&path_key(path))
            .map(|&id| &self.node(id).element)
    }

    /// Looks up a node by relative path, giving access to its element and
    /// its sorted children.
    #[must_use]
    pub fn search_node(&self, path: &Path) -> Option<NodeRef<'_>> {
        self.index
            .get(&path_key(path))
            .map(|&id| NodeRef { tree: self, id })
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        self.nodes[id]
            .as_ref()
            .expect("tree index references a vacant arena slot")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id]
            .as_mut()
            .expect("tree index references a vacant arena slot")
    }

    pub(crate) fn top_ids(&self) -> &[NodeId] {
        &self.top
    }

    pub(crate) fn node_id_by_key(&self, key: &str) -> Option<NodeId> {
        self.index.get(key).copied()
    }

    fn node_id(&self, path: &Path, op: &'static str) -> Result<NodeId, TreeError> {
        self.index
            .get(&path_key(path))
            .copied()
            .ok_or_else(|| TreeError::PathNotFound {
                op,
                path: path.to_path_buf(),
            })
    }

    fn require_top_path(&self, op: &'static str) -> Result<PathBuf, TreeError> {
        self.top_path()
            .map(Path::to_path_buf)
            .ok_or(TreeError::NotFromScan { op })
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        if let Some(id) = self.free.pop() {
            self.nodes[id] = Some(node);
            id
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn sorted_ids(&self, mut ids: Vec<NodeId>) -> Vec<NodeId> {
        ids.sort_by(|&a, &b| {
            FilesystemElement::sibling_cmp(&self.node(a).element, &self.node(b).element)
        });
        ids
    }

    // ---- tree-only mutations -------------------------------------------

    /// Updates the permission bits of the element at `path`.
    pub fn modify_permissions(&mut self, path: &Path, mode: u32) -> Result<(), TreeError> {
        let id = self.node_id(path, "modify permissions")?;
        self.node_mut(id).element.set_permissions(mode);
        Ok(())
    }

    /// Updates the owner of the element at `path`.
    pub fn modify_owner(&mut self, path: &Path, user: &str, group: &str) -> Result<(), TreeError> {
        let id = self.node_id(path, "modify owner")?;
        self.node_mut(id).element.set_owner(user, group);
        Ok(())
    }

    /// Updates the modification time of the element at `path`.
    pub fn modify_mtime(&mut self, path: &Path, mtime: i64) -> Result<(), TreeError> {
        let id = self.node_id(path, "modify mtime")?;
        self.node_mut(id).element.set_mtime(mtime);
        Ok(())
    }

    /// Removes the node at `path` and, for directories, all descendants
    /// from the tree and the index. Returns the number of entries removed.
    pub fn remove_from_tree(&mut self, path: &Path) -> Result<u64, TreeError> {
        let id = self.node_id(path, "remove")?;
        match parent_of(path) {
            None => self.top.retain(|&n| n != id),
            Some(parent) => {
                let parent_id = self.node_id(parent, "remove")?;
                self.node_mut(parent_id).children.retain(|&n| n != id);
            }
        }
        let mut count = 0_u64;
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let node = self.nodes[current]
                .take()
                .expect("tree index references a vacant arena slot");
            self.index.remove(node.element.path_key());
            stack.extend(node.children);
            self.free.push(current);
            count += 1;
        }
        self.debug_check_index();
        Ok(count)
    }

    /// Copies the subtree rooted at `src[rel_src]` into this tree under
    /// `rel_dst_parent`, rewriting every copied path for its new location.
    ///
    /// `rel_dst_parent` may be empty to copy into the top level. Fails when
    /// the source path is missing, the destination parent is missing or not
    /// a directory, or the destination path already exists.
    pub fn copy_from_tree(
        &mut self,
        src: &DirectoryTree,
        rel_src: &Path,
        rel_dst_parent: &Path,
    ) -> Result<(), TreeError> {
        self.tree_copy(src, rel_src, rel_dst_parent).map(|_| ())
    }

    fn tree_copy(
        &mut self,
        src: &DirectoryTree,
        rel_src: &Path,
        rel_dst_parent: &Path,
    ) -> Result<PathBuf, TreeError> {
        let src_id = src.node_id(rel_src, "copy source")?;
        let name = rel_src
            .file_name()
            .ok_or_else(|| TreeError::PathNotFound {
                op: "copy source",
                path: rel_src.to_path_buf(),
            })?;
        let new_rel = if rel_dst_parent.as_os_str().is_empty() {
            PathBuf::from(name)
        } else {
            rel_dst_parent.join(name)
        };
        if self.index.contains_key(&path_key(&new_rel)) {
            return Err(TreeError::AlreadyExists { path: new_rel });
        }
        // Validate the destination before touching the arena so a failed
        // copy leaves the tree untouched.
        let parent_id = if rel_dst_parent.as_os_str().is_empty() {
            None
        } else {
            let parent_id = self.node_id(rel_dst_parent, "copy destination")?;
            if !self.node(parent_id).element.is_directory() {
                return Err(TreeError::NotADirectory {
                    op: "copy destination",
                    path: rel_dst_parent.to_path_buf(),
                });
            }
            Some(parent_id)
        };

        let new_id = self.clone_subtree(src, src_id, new_rel.clone());
        match parent_id {
            None => {
                let mut top = std::mem::take(&mut self.top);
                top.push(new_id);
                self.top = self.sorted_ids(top);
            }
            Some(parent_id) => {
                let mut children = std::mem::take(&mut self.node_mut(parent_id).children);
                children.push(new_id);
                let children = self.sorted_ids(children);
                self.node_mut(parent_id).children = children;
            }
        }
        self.debug_check_index();
        Ok(new_rel)
    }

    fn clone_subtree(&mut self, src: &DirectoryTree, src_id: NodeId, new_rel: PathBuf) -> NodeId {
        let src_node = src.node(src_id);
        let element = src_node.element.with_relative_path(new_rel.clone());
        let id = self.alloc(Node {
            element,
            children: Vec::new(),
        });
        self.index.insert(path_key(&new_rel), id);
        let mut children = Vec::with_capacity(src_node.children.len());
        for &child in &src_node.children {
            let name = src
                .node(child)
                .element
                .relative_path()
                .file_name()
                .expect("tree elements always have a file name")
                .to_os_string();
            children.push(self.clone_subtree(src, child, new_rel.join(name)));
        }
        self.node_mut(id).children = children;
        id
    }

    /// Inserts a symlink element at the parent directory named by its own
    /// relative path.
    pub fn add_symlink_to_tree(&mut self, symlink: FilesystemElement) -> Result<(), TreeError> {
        if symlink.kind() != ElementKind::Symlink || symlink.symlink_target().is_none() {
            return Err(TreeError::NotASymlink {
                path: symlink.relative_path().to_path_buf(),
            });
        }
        let rel = symlink.relative_path().to_path_buf();
        if self.index.contains_key(&path_key(&rel)) {
            return Err(TreeError::AlreadyExists { path: rel });
        }
        // Resolve the parent before touching the arena so a failed insert
        // leaves the tree untouched.
        let parent_id = match parent_of(&rel) {
            None => None,
            Some(parent) => Some(self.node_id(parent, "add symlink")?),
        };
        let id = self.alloc(Node {
            element: symlink,
            children: Vec::new(),
        });
        self.index.insert(path_key(&rel), id);
        match parent_id {
            None => {
                let mut top = std::mem::take(&mut self.top);
                top.push(id);
                self.top = self.sorted_ids(top);
            }
            Some(parent_id) => {
                let mut children = std::mem::take(&mut self.node_mut(parent_id).children);
                children.push(id);
                let children = self.sorted_ids(children);
                self.node_mut(parent_id).children = children;
            }
        }
        self.debug_check_index();
        Ok(())
    }

    // ---- tree + filesystem mutations -----------------------------------

    /// [`Self::copy_from_tree`] followed by replaying the copy on the
    /// filesystem.
    ///
    /// Filesystem order per entry: create/copy content, then (directories
    /// only, after their children) permissions, then owner (best effort,
    /// warning on failure), then mtime last. Finally the destination
    /// parent's recorded mtime is re-asserted, since creating children
    /// bumped it.
    pub fn copy_from_tree_and_filesystem(
        &mut self,
        src: &DirectoryTree,
        rel_src: &Path,
        rel_dst_parent: &Path,
    ) -> Result<(), TreeError> {
        let dst_top = self.require_top_path("copy")?;
        let src_top = src.require_top_path("copy")?;
        let new_rel = self.tree_copy(src, rel_src, rel_dst_parent)?;
        self.replay_copy(&src_top, rel_src, &dst_top, &new_rel)?;
        self.fixup_dir_mtime(rel_dst_parent)?;
        Ok(())
    }

    fn replay_copy(
        &self,
        src_top: &Path,
        src_rel: &Path,
        dst_top: &Path,
        dst_rel: &Path,
    ) -> Result<(), TreeError> {
        let id = self
            .index
            .get(&path_key(dst_rel))
            .copied()
            .expect("replay_copy runs right after the tree copy");
        let node = self.node(id);
        let element = &node.element;
        let src_abs = src_top.join(src_rel);
        let dst_abs = dst_top.join(dst_rel);
        match element.kind() {
            ElementKind::Regular => {
                fs::copy(&src_abs, &dst_abs)
                    .map_err(|error| TreeError::io("copy file to", &dst_abs, error))?;
            }
            ElementKind::Symlink => {
                let target = element.symlink_target().ok_or_else(|| {
                    TreeError::NotASymlink {
                        path: dst_rel.to_path_buf(),
                    }
                })?;
                std::os::unix::fs::symlink(target, &dst_abs)
                    .map_err(|error| TreeError::io("create symlink", &dst_abs, error))?;
            }
            ElementKind::Directory => {
                fs::create_dir(&dst_abs)
                    .map_err(|error| TreeError::io("create directory", &dst_abs, error))?;
                for &child in &node.children {
                    let child_rel = self.node(child).element.relative_path().to_path_buf();
                    let name = child_rel
                        .file_name()
                        .expect("tree elements always have a file name");
                    self.replay_copy(src_top, &src_rel.join(name), dst_top, &child_rel)?;
                }
                // Permissions go on after the children so a read-only
                // directory does not block its own population.
                fs::set_permissions(&dst_abs, fs::Permissions::from_mode(element.permissions()))
                    .map_err(|error| TreeError::io("set permissions of", &dst_abs, error))?;
            }
            ElementKind::Unknown => {
                return Err(TreeError::UnsupportedFileType { path: src_abs });
            }
        }
        if let Err(error) = fsext::chown_symlink(&dst_abs, element.user(), element.group()) {
            (self.warnings)(&format!(
                "could not change ownership of {}: maybe retry with sudo? ({error})",
                dst_abs.display()
            ));
        }
        // Mtime goes last; for directories the recursion above would have
        // altered it again.
        fsext::set_symlink_mtime(&dst_abs, element.mtime())?;
        Ok(())
    }

    /// [`Self::remove_from_tree`] followed by deleting the entry (and any
    /// descendants) from the filesystem. Returns the number of tree entries
    /// removed.
    pub fn remove_from_tree_and_filesystem(&mut self, path: &Path) -> Result<u64, TreeError> {
        let top = self.require_top_path("remove")?;
        let count = self.remove_from_tree(path)?;
        let abs = top.join(path);
        let metadata = fs::symlink_metadata(&abs)
            .map_err(|error| TreeError::io("stat", &abs, error))?;
        if metadata.is_dir() {
            fs::remove_dir_all(&abs).map_err(|error| TreeError::io("remove", &abs, error))?;
        } else {
            fs::remove_file(&abs).map_err(|error| TreeError::io("remove", &abs, error))?;
        }
        if let Some(parent) = parent_of(path) {
            self.fixup_dir_mtime(parent)?;
        }
        Ok(count)
    }

    /// [`Self::add_symlink_to_tree`] followed by creating the symlink on
    /// the filesystem, setting its owner (best effort) and mtime, then
    /// fixing the parent's mtime.
    pub fn add_symlink_to_tree_and_filesystem(
        &mut self,
        symlink: FilesystemElement,
    ) -> Result<(), TreeError> {
        let top = self.require_top_path("add symlink")?;
        let rel = symlink.relative_path().to_path_buf();
        let target = symlink
            .symlink_target()
            .ok_or_else(|| TreeError::NotASymlink { path: rel.clone() })?
            .to_path_buf();
        let user = symlink.user().to_string();
        let group = symlink.group().to_string();
        let mtime = symlink.mtime();
        self.add_symlink_to_tree(symlink)?;

        let abs = top.join(&rel);
        std::os::unix::fs::symlink(&target, &abs)
            .map_err(|error| TreeError::io("create symlink", &abs, error))?;
        if let Err(error) = fsext::chown_symlink(&abs, &user, &group) {
            (self.warnings)(&format!(
                "could not change ownership of {}: maybe retry with sudo? ({error})",
                abs.display()
            ));
        }
        fsext::set_symlink_mtime(&abs, mtime)?;
        if let Some(parent) = parent_of(&rel) {
            self.fixup_dir_mtime(parent)?;
        }
        Ok(())
    }

    /// [`Self::modify_permissions`] applied to the tree and the filesystem.
    pub fn modify_permissions_in_tree_and_filesystem(
        &mut self,
        path: &Path,
        mode: u32,
    ) -> Result<(), TreeError> {
        let top = self.require_top_path("modify permissions")?;
        self.modify_permissions(path, mode)?;
        let abs = top.join(path);
        fs::set_permissions(&abs, fs::Permissions::from_mode(mode))
            .map_err(|error| TreeError::io("set permissions of", &abs, error))?;
        if let Some(parent) = parent_of(path) {
            self.fixup_dir_mtime(parent)?;
        }
        Ok(())
    }

    /// [`Self::modify_owner`] applied to the tree and the filesystem.
    /// Ownership failures are downgraded to warnings.
    pub fn modify_owner_in_tree_and_filesystem(
        &mut self,
        path: &Path,
        user: &str,
        group: &str,
    ) -> Result<(), TreeError> {
        let top = self.require_top_path("modify owner")?;
        self.modify_owner(path, user, group)?;
        let abs = top.join(path);
        if let Err(error) = fsext::chown_symlink(&abs, user, group) {
            (self.warnings)(&format!(
                "could not change ownership of {}: maybe retry with sudo? ({error})",
                abs.display()
            ));
        }
        if let Some(parent) = parent_of(path) {
            self.fixup_dir_mtime(parent)?;
        }
        Ok(())
    }

    /// [`Self::modify_mtime`] applied to the tree and the filesystem.
    pub fn modify_mtime_in_tree_and_filesystem(
        &mut self,
        path: &Path,
        mtime: i64,
    ) -> Result<(), TreeError> {
        let top = self.require_top_path("modify mtime")?;
        self.modify_mtime(path, mtime)?;
        fsext::set_symlink_mtime(&top.join(path), mtime)?;
        Ok(())
    }

    /// Re-asserts the recorded mtime of the directory at `dir_rel` on the
    /// filesystem. Mutating a directory's content bumps its mtime; the
    /// manifest value is authoritative. An empty path names the implicit
    /// top directory, which carries no recorded mtime.
    fn fixup_dir_mtime(&self, dir_rel: &Path) -> Result<(), TreeError> {
        if dir_rel.as_os_str().is_empty() {
            return Ok(());
        }
        let top = self.require_top_path("fix up directory mtime")?;
        let id = self.node_id(dir_rel, "fix up directory mtime")?;
        let mtime = self.node(id).element.mtime();
        fsext::set_symlink_mtime(&top.join(dir_rel), mtime)?;
        Ok(())
    }

    /// Reads each regular file that lacks a hash from the bound top path
    /// and stamps its SHA-1. Used after a backup that scanned with hash
    /// omission, so manifests stay complete for future runs.
    pub fn compute_missing_hashes(&mut self) -> Result<(), TreeError> {
        let top = self.require_top_path("compute missing hashes")?;
        let mut pending = Vec::new();
        let mut stack: Vec<NodeId> = self.top.clone();
        while let Some(id) = stack.pop() {
            let node = self.node(id);
            if node.element.kind() == ElementKind::Regular && node.element.hash().is_none() {
                pending.push((id, node.element.relative_path().to_path_buf()));
            }
            stack.extend(&node.children);
        }
        for (id, rel) in pending {
            let abs = top.join(&rel);
            let digest =
                checksum::hash_file(&abs).map_err(|error| TreeError::io("hash", &abs, error))?;
            self.node_mut(id).element.set_hash(digest);
        }
        Ok(())
    }

    #[cfg(debug_assertions)]
    fn debug_check_index(&self) {
        let mut seen = 0_usize;
        let mut stack: Vec<NodeId> = self.top.clone();
        while let Some(id) = stack.pop() {
            let node = self.node(id);
            seen += 1;
            debug_assert_eq!(
                self.index.get(node.element.path_key()),
                Some(&id),
                "node '{}' missing from index",
                node.element.relative_path().display()
            );
            stack.extend(&node.children);
        }
        debug_assert_eq!(seen, self.index.len(), "index contains stale entries");
    }

    #[cfg(not(debug_assertions))]
    fn debug_check_index(&self) {}
}

/// Read-only view of one node of a [`DirectoryTree`].
#[derive(Clone, Copy)]
pub struct NodeRef<'a> {
    tree: &'a DirectoryTree,
    id: NodeId,
}

impl<'a> NodeRef<'a> {
    /// The node's element.
    #[must_use]
    pub fn element(&self) -> &'a FilesystemElement {
        &self.tree.node(self.id).element
    }

    /// The node's children in sibling order; empty for non-directories.
    pub fn children(&self) -> impl Iterator<Item = NodeRef<'a>> + '_ {
        let tree = self.tree;
        self.tree
            .node(self.id)
            .children
            .iter()
            .map(move |&id| NodeRef { tree, id })
    }
}

/// Structural equality over the whole tree: same shape, same sibling
/// order, element equality per [`FilesystemElement`] (with its empty-hash
/// wildcard rule).
impl PartialEq for DirectoryTree {
    fn eq(&self, other: &Self) -> bool {
        fn lists_equal(
            a: &DirectoryTree,
            a_ids: &[NodeId],
            b: &DirectoryTree,
            b_ids: &[NodeId],
        ) -> bool {
            a_ids.len() == b_ids.len()
                && a_ids.iter().zip(b_ids).all(|(&na, &nb)| {
                    let node_a = a.node(na);
                    let node_b = b.node(nb);
                    node_a.element == node_b.element
                        && lists_equal(a, &node_a.children, b, &node_b.children)
                })
        }
        lists_equal(self, &self.top, other, &other.top)
    }
}

impl fmt::Debug for DirectoryTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "DirectoryTree ({} entries, origin {:?})", self.len(), self.origin)?;
        f.write_str(&self.render())
    }
}
