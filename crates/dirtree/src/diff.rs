//! Two-way and three-way diffs over directory trees.
//!
//! Diffing is pure: it never mutates the trees. At each level the union of
//! sibling names from every input is visited in sorted order, so the
//! output is deterministic for a given input. When a name exists on only
//! one side the absent subtree is reported as a single line without
//! descending, so removing or adding a whole subtree produces exactly one
//! diff line.
//!
//! For three-way diffs, when one slot is missing (or not a directory) and
//! the other two are directories, the problem reduces to a two-way diff
//! whose lines are projected back into the original slots, keeping the
//! missing slot `None`. When all three slots are present and two of them
//! compare equal, transitivity guarantees the third relation; this is
//! asserted in debug builds.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Index;

use crate::element::{CompareOpt, FilesystemElement};
use crate::tree::{DirectoryTree, NodeId};

/// One disagreement found by a diff: the element as seen by each input
/// tree, `None` when that tree does not have the path at all.
#[derive(Clone, Debug, PartialEq)]
pub struct DiffLine<const N: usize>(pub [Option<FilesystemElement>; N]);

impl<const N: usize> Index<usize> for DiffLine<N> {
    type Output = Option<FilesystemElement>;

    fn index(&self, slot: usize) -> &Self::Output {
        &self.0[slot]
    }
}

fn write_slot(
    f: &mut fmt::Formatter<'_>,
    prefix: &str,
    slot: &Option<FilesystemElement>,
) -> fmt::Result {
    match slot {
        Some(element) => writeln!(f, "{prefix}{element}"),
        None => writeln!(f, "{prefix}/dev/null"),
    }
}

impl fmt::Display for DiffLine<2> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_slot(f, "- ", &self.0[0])?;
        write_slot(f, "+ ", &self.0[1])
    }
}

impl fmt::Display for DiffLine<3> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_slot(f, "a ", &self.0[0])?;
        write_slot(f, "b ", &self.0[1])?;
        write_slot(f, "c ", &self.0[2])
    }
}

/// Ordered list of disagreements between two or three trees.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DirectoryDiff<const N: usize>(pub Vec<DiffLine<N>>);

impl<const N: usize> DirectoryDiff<N> {
    /// True when the inputs agreed everywhere.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of disagreement lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates over the disagreement lines in output order.
    pub fn iter(&self) -> std::slice::Iter<'_, DiffLine<N>> {
        self.0.iter()
    }
}

impl<'a, const N: usize> IntoIterator for &'a DirectoryDiff<N> {
    type Item = &'a DiffLine<N>;
    type IntoIter = std::slice::Iter<'a, DiffLine<N>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<const N: usize> fmt::Display for DirectoryDiff<N>
where
    DiffLine<N>: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.0 {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

/// Two-way diff of `a` against `b` under `opt`.
#[must_use]
pub fn diff2(a: &DirectoryTree, b: &DirectoryTree, opt: &CompareOpt) -> DirectoryDiff<2> {
    let mut result = Vec::new();
    compare_level2(a, a.top_ids(), b, b.top_ids(), opt, &mut result);
    DirectoryDiff(result)
}

fn sibling_names<'t>(trees: &[(&'t DirectoryTree, &[NodeId])]) -> BTreeSet<&'t str> {
    let mut names = BTreeSet::new();
    for (tree, ids) in trees {
        for &id in *ids {
            names.insert(tree.node(id).element.path_key());
        }
    }
    names
}

fn compare_level2(
    a: &DirectoryTree,
    a_ids: &[NodeId],
    b: &DirectoryTree,
    b_ids: &[NodeId],
    opt: &CompareOpt,
    result: &mut Vec<DiffLine<2>>,
) {
    let names = sibling_names(&[(a, a_ids), (b, b_ids)]);
    let mut common_directories = Vec::new();
    for name in names {
        match (a.node_id_by_key(name), b.node_id_by_key(name)) {
            (Some(na), Some(nb)) => {
                let ae = &a.node(na).element;
                let be = &b.node(nb).element;
                if !ae.matches_with(be, opt) {
                    result.push(DiffLine([Some(ae.clone()), Some(be.clone())]));
                }
                // Pruning comparison: descend only into common directories.
                if ae.is_directory() && be.is_directory() {
                    common_directories.push((na, nb));
                }
            }
            (None, Some(nb)) => {
                result.push(DiffLine([None, Some(b.node(nb).element.clone())]));
            }
            (Some(na), None) => {
                result.push(DiffLine([Some(a.node(na).element.clone()), None]));
            }
            (None, None) => unreachable!("name came from one of the sibling lists"),
        }
    }
    for (na, nb) in common_directories {
        compare_level2(
            a,
            &a.node(na).children,
            b,
            &b.node(nb).children,
            opt,
            result,
        );
    }
}

/// Three-way diff: slot 0 is the backup tree, slots 1 and 2 the two
/// manifest trees.
#[must_use]
pub fn diff3(
    a: &DirectoryTree,
    b: &DirectoryTree,
    c: &DirectoryTree,
    opt: &CompareOpt,
) -> DirectoryDiff<3> {
    let mut result = Vec::new();
    compare_level3(
        a,
        a.top_ids(),
        b,
        b.top_ids(),
        c,
        c.top_ids(),
        opt,
        &mut result,
    );
    DirectoryDiff(result)
}

#[allow(clippy::too_many_arguments)]
fn compare_level3(
    a: &DirectoryTree,
    a_ids: &[NodeId],
    b: &DirectoryTree,
    b_ids: &[NodeId],
    c: &DirectoryTree,
    c_ids: &[NodeId],
    opt: &CompareOpt,
    result: &mut Vec<DiffLine<3>>,
) {
    let names = sibling_names(&[(a, a_ids), (b, b_ids), (c, c_ids)]);
    // Directory triples to descend into; a `None` slot is either missing
    // or not a directory there.
    let mut descend = Vec::new();
    for name in names {
        let ids = [
            a.node_id_by_key(name),
            b.node_id_by_key(name),
            c.node_id_by_key(name),
        ];
        let elements = [
            ids[0].map(|id| &a.node(id).element),
            ids[1].map(|id| &b.node(id).element),
            ids[2].map(|id| &c.node(id).element),
        ];
        let existing = elements.iter().flatten().count();
        debug_assert!(existing > 0, "name came from one of the sibling lists");
        if existing == 3 {
            let (ae, be, ce) = (
                elements[0].expect("checked above"),
                elements[1].expect("checked above"),
                elements[2].expect("checked above"),
            );
            let ab = ae.matches_with(be, opt);
            let bc = be.matches_with(ce, opt);
            if !ab || !bc {
                result.push(DiffLine([
                    Some(ae.clone()),
                    Some(be.clone()),
                    Some(ce.clone()),
                ]));
            } else {
                debug_assert!(ae.matches_with(ce, opt), "comparison must be transitive");
            }
            let directories = elements
                .iter()
                .flatten()
                .filter(|e| e.is_directory())
                .count();
            if directories >= 2 {
                descend.push([
                    if ae.is_directory() { ids[0] } else { None },
                    if be.is_directory() { ids[1] } else { None },
                    if ce.is_directory() { ids[2] } else { None },
                ]);
            }
        } else {
            // At least one element is missing: always a difference.
            result.push(DiffLine([
                elements[0].cloned(),
                elements[1].cloned(),
                elements[2].cloned(),
            ]));
            let directories: Vec<bool> = elements
                .iter()
                .map(|e| e.is_some_and(FilesystemElement::is_directory))
                .collect();
            if existing == 2 && directories.iter().filter(|&&d| d).count() == 2 {
                descend.push([
                    directories[0].then_some(ids[0]).flatten(),
                    directories[1].then_some(ids[1]).flatten(),
                    directories[2].then_some(ids[2]).flatten(),
                ]);
            }
        }
    }
    for triple in descend {
        match triple {
            [Some(na), Some(nb), Some(nc)] => compare_level3(
                a,
                &a.node(na).children,
                b,
                &b.node(nb).children,
                c,
                &c.node(nc).children,
                opt,
                result,
            ),
            [None, Some(nb), Some(nc)] => {
                let mut two_way = Vec::new();
                compare_level2(
                    b,
                    &b.node(nb).children,
                    c,
                    &c.node(nc).children,
                    opt,
                    &mut two_way,
                );
                result.extend(
                    two_way
                        .into_iter()
                        .map(|DiffLine([x, y])| DiffLine([None, x, y])),
                );
            }
            [Some(na), None, Some(nc)] => {
                let mut two_way = Vec::new();
                compare_level2(
                    a,
                    &a.node(na).children,
                    c,
                    &c.node(nc).children,
                    opt,
                    &mut two_way,
                );
                result.extend(
                    two_way
                        .into_iter()
                        .map(|DiffLine([x, y])| DiffLine([x, None, y])),
                );
            }
            [Some(na), Some(nb), None] => {
                let mut two_way = Vec::new();
                compare_level2(
                    a,
                    &a.node(na).children,
                    b,
                    &b.node(nb).children,
                    opt,
                    &mut two_way,
                );
                result.extend(
                    two_way
                        .into_iter()
                        .map(|DiffLine([x, y])| DiffLine([x, y, None])),
                );
            }
            _ => unreachable!("descend entries always carry at least two directories"),
        }
    }
}
