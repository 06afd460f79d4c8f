//! Tree iterator state objects (component C, §4.3): four traversal
//! kinds sharing one `TreeIter` shape, plus `split_current` wiring into
//! the reference-chain split protocol.
//!
//! Forward traversal uses an explicit `stack` standing in for the VM
//! value stack the original reuses for recursion frames — the same
//! "work-stack instead of host recursion" discipline `downref` and
//! `split` use. Reverse traversals materialize their candidate set up
//! front (also into an explicit `Vec`, again standing in for the VM
//! stack) and index downward from the end, exactly as specified.

use crate::program::{KidId, Pool, TreeId};
use crate::refs::RefChain;
use crate::tree::node::{Kid, KidPayload, Tree};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterKind {
    Forward,
    ForwardRepeat,
    ReverseRepeat,
    ReverseChild,
}

pub struct TreeIter {
    pub kind: IterKind,
    /// `None` is the special `anyId`: match every node.
    pub search_id: Option<u32>,
    /// Pending frontier for the forward-style kinds: `(slot, depth)`,
    /// depth indexing into `path` so sibling moves don't disturb the
    /// ancestor chain recorded for the node last visited.
    stack: Vec<(KidId, usize)>,
    /// Root-to-current ancestor chain for the node last returned by
    /// `advance`, consumed by `split_current`.
    path: Vec<KidId>,
    visited: u32,
    /// Pre-computed result set for the reverse-style kinds.
    materialized: Vec<TreeId>,
    pos: usize,
    /// VM-stack depth recorded at creation, for the `stackSize ==
    /// stackRoot - sp` invariant the owning VM frame is responsible for
    /// checking on every advance.
    pub stack_root: usize,
}

impl TreeIter {
    #[must_use]
    pub fn forward(search_id: Option<u32>, root: Option<KidId>, stack_root: usize) -> Self {
        Self {
            kind: IterKind::Forward,
            search_id,
            stack: root.map_or_else(Vec::new, |r| vec![(r, 0)]),
            path: Vec::new(),
            visited: 0,
            materialized: Vec::new(),
            pos: 0,
            stack_root,
        }
    }

    #[must_use]
    pub fn forward_repeat(search_id: Option<u32>, root: Option<KidId>, stack_root: usize) -> Self {
        Self {
            kind: IterKind::ForwardRepeat,
            ..Self::forward(search_id, root, stack_root)
        }
    }

    #[must_use]
    pub fn reverse_repeat(trees: &Pool<Tree>, kids: &Pool<Kid>, search_id: Option<u32>, root: Option<KidId>, stack_root: usize) -> Self {
        let mut forward = Self::forward_repeat(search_id, root, stack_root);
        let mut materialized = Vec::new();
        while let Some(t) = advance(&mut forward, trees, kids) {
            materialized.push(t);
        }
        materialized.reverse();
        Self {
            kind: IterKind::ReverseRepeat,
            search_id,
            stack: Vec::new(),
            path: Vec::new(),
            visited: 0,
            materialized,
            pos: 0,
            stack_root,
        }
    }

    #[must_use]
    pub fn reverse_child(trees: &Pool<Tree>, kids: &Pool<Kid>, search_id: Option<u32>, parent: TreeId, stack_root: usize) -> Self {
        let mut materialized = Vec::new();
        let mut cur = trees.get(parent.0).child;
        while let Some(kid_id) = cur {
            let kid = kids.get(kid_id.0);
            if let KidPayload::Child(t) = kid.payload {
                if search_id.map_or(true, |id| id == trees.get(t.0).id) {
                    materialized.push(t);
                }
            }
            cur = kid.next;
        }
        materialized.reverse();
        Self {
            kind: IterKind::ReverseChild,
            search_id,
            stack: Vec::new(),
            path: Vec::new(),
            visited: 0,
            materialized,
            pos: 0,
            stack_root,
        }
    }
}

/// Advances the iterator, returning the next matching tree or `None`
/// once exhausted — the truthy/falsy sentinel bytecode branches on.
pub fn advance(iter: &mut TreeIter, trees: &Pool<Tree>, kids: &Pool<Kid>) -> Option<TreeId> {
    match iter.kind {
        IterKind::Forward | IterKind::ForwardRepeat => advance_forward(iter, trees, kids),
        IterKind::ReverseRepeat | IterKind::ReverseChild => {
            if iter.pos < iter.materialized.len() {
                let t = iter.materialized[iter.pos];
                iter.pos += 1;
                Some(t)
            } else {
                None
            }
        }
    }
}

fn advance_forward(iter: &mut TreeIter, trees: &Pool<Tree>, kids: &Pool<Kid>) -> Option<TreeId> {
    loop {
        let (kid_id, depth) = iter.stack.pop()?;
        iter.path.truncate(depth);
        iter.path.push(kid_id);

        let kid = *kids.get(kid_id.0);
        if let Some(next) = kid.next {
            iter.stack.push((next, depth));
        }
        let tree_id = match kid.payload {
            KidPayload::Child(t) => t,
            KidPayload::IgnoreChain(_) => continue,
        };
        let tree = trees.get(tree_id.0);
        let has_next = kid.next.is_some();
        let is_root = iter.visited == 0;
        let should_descend = match iter.kind {
            IterKind::Forward => true,
            IterKind::ForwardRepeat => is_root || !has_next,
            _ => unreachable!("advance_forward only serves the forward-style kinds"),
        };
        if should_descend {
            if let Some(child) = tree.child {
                iter.stack.push((child, depth + 1));
            }
        }
        iter.visited += 1;
        if iter.search_id.map_or(true, |id| id == tree.id) {
            return Some(tree_id);
        }
    }
}

/// Reads the tree the iterator is currently positioned on, without
/// splitting anything. `None` if `advance` has not yet been called.
#[must_use]
pub fn current(iter: &TreeIter, kids: &Pool<Kid>) -> Option<TreeId> {
    match iter.kind {
        IterKind::Forward | IterKind::ForwardRepeat => iter.path.last().map(|k| kids.get(k.0).tree()),
        IterKind::ReverseRepeat | IterKind::ReverseChild => {
            if iter.pos == 0 {
                None
            } else {
                Some(iter.materialized[iter.pos - 1])
            }
        }
    }
}

/// Splits every tree along the path to the node this iterator is
/// currently positioned on, so a subsequent mutation through the
/// iterator observes an exclusively owned (`refs == 1`) tree. Valid only
/// for the forward-style kinds, which track a live ancestor path; the
/// reverse kinds materialize independent tree ids up front and have
/// nothing to relocate.
pub fn split_current(trees: &mut Pool<Tree>, kids: &mut Pool<Kid>, iter: &mut TreeIter) -> TreeId {
    assert!(
        !iter.path.is_empty(),
        "split_current called before the iterator has yielded a node"
    );
    let mut chain = RefChain::new();
    for &kid in &iter.path {
        chain.push(kid);
    }
    crate::tree::split::split_ref(trees, kids, &mut chain);
    for (slot, hop) in iter.path.iter_mut().zip(chain.hops.iter()) {
        *slot = hop.kid;
    }
    let leaf = *iter.path.last().expect("path checked non-empty above");
    kids.get(leaf.0).tree()
}

/// Splits the path to the current node (as [`split_current`]) and
/// overwrites it with `value`, taking one reference on `value` and
/// downrefing the tree it replaces. Returns `value` for convenience.
pub fn set_current(
    trees: &mut Pool<Tree>,
    kids: &mut Pool<Kid>,
    list_els: &mut Pool<crate::containers::list::ListEl>,
    map_els: &mut Pool<crate::containers::map::MapEl>,
    iter: &mut TreeIter,
    value: TreeId,
) -> TreeId {
    let _ = split_current(trees, kids, iter);
    let leaf = *iter.path.last().expect("set_current called before the iterator has yielded a node");
    let old = kids.get(leaf.0).tree();
    crate::tree::refcount::upref(trees, value);
    kids.get_mut(leaf.0).payload = KidPayload::Child(value);
    let mut work = Vec::new();
    crate::tree::refcount::downref(trees, kids, list_els, map_els, &mut work, old);
    value
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::program::Program;
    use crate::program::RuntimeData;
    use crate::tree::node::{Kid, Tree};

    fn test_rtd() -> &'static RuntimeData {
        static RTD: RuntimeData = RuntimeData {
            lang_el_info: &[],
            generic_info: &[],
            strings: &[],
            patterns: &[],
            replacements: &[],
            code_entries: &[],
            code: &[],
        };
        &RTD
    }

    /// Builds a right-recursive list of three INT leaves:
    /// `List(leaf0, List(leaf1, List(leaf2, nil)))`, matching end-to-end
    /// scenario 6.
    fn build_repeat_list(prog: &mut Program) -> KidId {
        let nil_list = TreeId(prog.trees.allocate(Tree::new(100)));
        let leaf2 = TreeId(prog.trees.allocate(Tree::int(2)));
        let mut list2 = Tree::new(100);
        let rest2 = prog.kids.allocate(Kid::child(nil_list, None));
        let elem2 = prog.kids.allocate(Kid::child(leaf2, Some(crate::program::KidId(rest2))));
        list2.child = Some(crate::program::KidId(elem2));
        let list2_id = TreeId(prog.trees.allocate(list2));

        let leaf1 = TreeId(prog.trees.allocate(Tree::int(1)));
        let mut list1 = Tree::new(100);
        let rest1 = prog.kids.allocate(Kid::child(list2_id, None));
        let elem1 = prog.kids.allocate(Kid::child(leaf1, Some(crate::program::KidId(rest1))));
        list1.child = Some(crate::program::KidId(elem1));
        let list1_id = TreeId(prog.trees.allocate(list1));

        let leaf0 = TreeId(prog.trees.allocate(Tree::int(0)));
        let mut list0 = Tree::new(100);
        let rest0 = prog.kids.allocate(Kid::child(list1_id, None));
        let elem0 = prog.kids.allocate(Kid::child(leaf0, Some(crate::program::KidId(rest0))));
        list0.child = Some(crate::program::KidId(elem0));
        let list0_id = TreeId(prog.trees.allocate(list0));

        KidId(prog.kids.allocate(Kid::child(list0_id, None)))
    }

    #[test]
    fn forward_repeat_skips_the_rec_spine() {
        let mut prog = Program::new(test_rtd());
        let root = build_repeat_list(&mut prog);
        let mut iter = TreeIter::forward_repeat(Some(crate::tree::node::LEL_ID_INT), Some(root), 0);

        let mut values = Vec::new();
        while let Some(t) = advance(&mut iter, &prog.trees, &prog.kids) {
            values.push(match prog.trees.get(t.0).payload {
                crate::tree::node::Payload::Int(v) => v,
                _ => panic!("expected int leaf"),
            });
        }
        assert_eq!(values, vec![0, 1, 2]);
    }

    #[test]
    fn reverse_repeat_yields_forward_repeat_reversed() {
        let mut prog = Program::new(test_rtd());
        let root = build_repeat_list(&mut prog);
        let mut iter = TreeIter::reverse_repeat(&prog.trees, &prog.kids, Some(crate::tree::node::LEL_ID_INT), Some(root), 0);

        let mut values = Vec::new();
        while let Some(t) = advance(&mut iter, &prog.trees, &prog.kids) {
            values.push(match prog.trees.get(t.0).payload {
                crate::tree::node::Payload::Int(v) => v,
                _ => panic!("expected int leaf"),
            });
        }
        assert_eq!(values, vec![2, 1, 0]);
    }
}
