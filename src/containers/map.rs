//! The generic `Map` container: an ordered binary search tree keyed by
//! structural tree comparison (§4.1.3).
//!
//! Balancing (the original keeps the tree AVL-balanced) is deliberately
//! not implemented here — see `DESIGN.md` for why a plain BST is an
//! acceptable scope cut for this core — but the COW `branch copy` the
//! spec requires is: [`copy_branch`] mirrors [`crate::tree::split::split`]'s
//! "clone the backbone, share the leaves" shape one level at a time.

use std::cmp::Ordering;

use crate::program::{MapElId, Pool, TreeId};
use crate::tree::compare::cmp;
use crate::tree::node::{Kid, Tree};
use crate::tree::refcount::upref;

#[derive(Debug, Clone, Copy)]
pub struct MapEl {
    pub key: TreeId,
    pub value: TreeId,
    pub left: Option<MapElId>,
    pub right: Option<MapElId>,
}

impl MapEl {
    #[must_use]
    fn new(key: TreeId, value: TreeId) -> Self {
        Self {
            key,
            value,
            left: None,
            right: None,
        }
    }
}

/// Inserts `(key, value)` if `key` is not already present, taking one
/// reference each on `key` and `value`. Returns `true` if inserted,
/// `false` (map unchanged) if the key already existed.
pub fn insert(
    trees: &mut Pool<Tree>,
    kids: &Pool<Kid>,
    map_els: &mut Pool<MapEl>,
    root: &mut Option<MapElId>,
    len: &mut u32,
    key: TreeId,
    value: TreeId,
) -> bool {
    let mut cur = *root;
    let mut parent: Option<(MapElId, bool)> = None;
    loop {
        match cur {
            None => {
                upref(trees, key);
                upref(trees, value);
                let new_id = MapElId(map_els.allocate(MapEl::new(key, value)));
                set_child(root, map_els, parent, new_id);
                *len += 1;
                return true;
            }
            Some(id) => {
                let existing_key = map_els.get(id.0).key;
                match cmp(trees, kids, Some(key), Some(existing_key)) {
                    Ordering::Equal => return false,
                    Ordering::Less => {
                        parent = Some((id, true));
                        cur = map_els.get(id.0).left;
                    }
                    Ordering::Greater => {
                        parent = Some((id, false));
                        cur = map_els.get(id.0).right;
                    }
                }
            }
        }
    }
}

/// Links a freshly allocated element into the tree at the position
/// recorded by an `insert`/`store` descent (`None` means it becomes the
/// root).
fn set_child(root: &mut Option<MapElId>, map_els: &mut Pool<MapEl>, parent: Option<(MapElId, bool)>, new_id: MapElId) {
    match parent {
        None => *root = Some(new_id),
        Some((pid, true)) => map_els.get_mut(pid.0).left = Some(new_id),
        Some((pid, false)) => map_els.get_mut(pid.0).right = Some(new_id),
    }
}

/// Inserts or overwrites `(key, value)`, returning the prior value if the
/// key already existed (ownership of the old value transfers to the
/// caller; the new value's reference is taken by the map).
pub fn store(
    trees: &mut Pool<Tree>,
    kids: &Pool<Kid>,
    map_els: &mut Pool<MapEl>,
    root: &mut Option<MapElId>,
    len: &mut u32,
    key: TreeId,
    value: TreeId,
) -> Option<TreeId> {
    let mut cur = *root;
    let mut parent: Option<(MapElId, bool)> = None;
    loop {
        match cur {
            None => {
                upref(trees, key);
                upref(trees, value);
                let new_id = MapElId(map_els.allocate(MapEl::new(key, value)));
                set_child(root, map_els, parent, new_id);
                *len += 1;
                return None;
            }
            Some(id) => {
                let existing_key = map_els.get(id.0).key;
                match cmp(trees, kids, Some(key), Some(existing_key)) {
                    Ordering::Equal => {
                        upref(trees, value);
                        let prior = std::mem::replace(&mut map_els.get_mut(id.0).value, value);
                        return Some(prior);
                    }
                    Ordering::Less => {
                        parent = Some((id, true));
                        cur = map_els.get(id.0).left;
                    }
                    Ordering::Greater => {
                        parent = Some((id, false));
                        cur = map_els.get(id.0).right;
                    }
                }
            }
        }
    }
}

#[must_use]
pub fn find(trees: &Pool<Tree>, kids: &Pool<Kid>, map_els: &Pool<MapEl>, root: Option<MapElId>, key: TreeId) -> Option<TreeId> {
    let mut cur = root;
    while let Some(id) = cur {
        let el = map_els.get(id.0);
        match cmp(trees, kids, Some(key), Some(el.key)) {
            Ordering::Equal => return Some(el.value),
            Ordering::Less => cur = el.left,
            Ordering::Greater => cur = el.right,
        }
    }
    None
}

/// Removes `key`, returning the evicted `(key, value)` pair if present.
/// Ownership of both transfers to the caller.
pub fn remove(
    trees: &mut Pool<Tree>,
    kids: &Pool<Kid>,
    map_els: &mut Pool<MapEl>,
    root: &mut Option<MapElId>,
    len: &mut u32,
    key: TreeId,
) -> Option<(TreeId, TreeId)> {
    let mut cur = *root;
    let mut path: Vec<(MapElId, bool)> = Vec::new();
    let target = loop {
        match cur {
            None => return None,
            Some(id) => {
                let existing_key = map_els.get(id.0).key;
                match cmp(trees, kids, Some(key), Some(existing_key)) {
                    Ordering::Equal => break id,
                    Ordering::Less => {
                        path.push((id, true));
                        cur = map_els.get(id.0).left;
                    }
                    Ordering::Greater => {
                        path.push((id, false));
                        cur = map_els.get(id.0).right;
                    }
                }
            }
        }
    };

    let el = *map_els.get(target.0);
    let new_subtree = match (el.left, el.right) {
        (None, None) => {
            map_els.free(target.0);
            None
        }
        (Some(only), None) | (None, Some(only)) => {
            map_els.free(target.0);
            Some(only)
        }
        (Some(_), Some(right)) => {
            let (new_right, succ_key, succ_value) = remove_min(map_els, right);
            let t = map_els.get_mut(target.0);
            t.key = succ_key;
            t.value = succ_value;
            t.right = new_right;
            Some(target)
        }
    };

    match path.pop() {
        None => *root = new_subtree,
        Some((pid, true)) => map_els.get_mut(pid.0).left = new_subtree,
        Some((pid, false)) => map_els.get_mut(pid.0).right = new_subtree,
    }
    *len -= 1;
    Some((el.key, el.value))
}

/// Removes the leftmost (minimum) element of the subtree rooted at
/// `root`, returning the new subtree root and the removed element's
/// key/value. `root` itself may be the minimum, in which case the new
/// subtree root is simply its right child.
fn remove_min(map_els: &mut Pool<MapEl>, root: MapElId) -> (Option<MapElId>, TreeId, TreeId) {
    let mut path: Vec<MapElId> = Vec::new();
    let mut cur = root;
    loop {
        match map_els.get(cur.0).left {
            Some(left) => {
                path.push(cur);
                cur = left;
            }
            None => break,
        }
    }
    let el = map_els.free(cur.0);
    match path.pop() {
        None => (el.right, el.key, el.value),
        Some(parent) => {
            map_els.get_mut(parent.0).left = el.right;
            (Some(root), el.key, el.value)
        }
    }
}

/// Clones the whole tree backbone rooted at `root`, sharing every key and
/// value tree (upref only) rather than deep-cloning them — the map-level
/// analogue of [`crate::tree::split::split`]'s "clone slots, share
/// leaves" rule.
///
/// Walks an explicit work stack rather than recursing: a BST this
/// unbalanced can go as deep as it has elements (see the module doc),
/// so cloning it is under the same no-host-recursion discipline as
/// freeing it in `tree::refcount::free_map_subtree`.
#[must_use]
pub fn copy_branch(trees: &mut Pool<Tree>, map_els: &mut Pool<MapEl>, root: Option<MapElId>) -> Option<MapElId> {
    enum Task {
        Expand(Option<MapElId>),
        Build(TreeId, TreeId),
    }

    let mut tasks = vec![Task::Expand(root)];
    let mut results: Vec<Option<MapElId>> = Vec::new();
    while let Some(task) = tasks.pop() {
        match task {
            Task::Expand(None) => results.push(None),
            Task::Expand(Some(id)) => {
                let el = *map_els.get(id.0);
                upref(trees, el.key);
                upref(trees, el.value);
                tasks.push(Task::Build(el.key, el.value));
                tasks.push(Task::Expand(el.right));
                tasks.push(Task::Expand(el.left));
            }
            Task::Build(key, value) => {
                let right = results.pop().expect("copy_branch: missing right result");
                let left = results.pop().expect("copy_branch: missing left result");
                let new_id = MapElId(map_els.allocate(MapEl { key, value, left, right }));
                results.push(Some(new_id));
            }
        }
    }
    results.pop().expect("copy_branch: missing final result")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::program::Program;
    use crate::program::RuntimeData;
    use crate::tree::node::Tree;

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

    #[test]
    fn insert_then_find_round_trips() {
        let mut prog = Program::new(test_rtd());
        let k = TreeId(prog.trees.allocate(Tree::int(1)));
        let v = TreeId(prog.trees.allocate(Tree::int(100)));
        let mut root = None;
        let mut len = 0;
        assert!(insert(&mut prog.trees, &prog.kids, &mut prog.map_els, &mut root, &mut len, k, v));
        assert_eq!(len, 1);
        assert_eq!(find(&prog.trees, &prog.kids, &prog.map_els, root, k), Some(v));
    }

    #[test]
    fn insert_existing_key_fails_and_leaves_map_unchanged() {
        let mut prog = Program::new(test_rtd());
        let k = TreeId(prog.trees.allocate(Tree::int(1)));
        let v0 = TreeId(prog.trees.allocate(Tree::int(100)));
        let v1 = TreeId(prog.trees.allocate(Tree::int(200)));
        let mut root = None;
        let mut len = 0;
        assert!(insert(&mut prog.trees, &prog.kids, &mut prog.map_els, &mut root, &mut len, k, v0));
        assert!(!insert(&mut prog.trees, &prog.kids, &mut prog.map_els, &mut root, &mut len, k, v1));
        assert_eq!(len, 1);
        assert_eq!(find(&prog.trees, &prog.kids, &prog.map_els, root, k), Some(v0));
    }

    #[test]
    fn store_overwrites_and_returns_prior_value() {
        let mut prog = Program::new(test_rtd());
        let k = TreeId(prog.trees.allocate(Tree::int(1)));
        let v0 = TreeId(prog.trees.allocate(Tree::int(100)));
        let v1 = TreeId(prog.trees.allocate(Tree::int(200)));
        let mut root = None;
        let mut len = 0;
        store(&mut prog.trees, &prog.kids, &mut prog.map_els, &mut root, &mut len, k, v0);
        let prior = store(&mut prog.trees, &prog.kids, &mut prog.map_els, &mut root, &mut len, k, v1);
        assert_eq!(prior, Some(v0));
        assert_eq!(len, 1);
        assert_eq!(find(&prog.trees, &prog.kids, &prog.map_els, root, k), Some(v1));
    }

    #[test]
    fn remove_evicts_and_rebalances_two_child_node() {
        let mut prog = Program::new(test_rtd());
        let mut root = None;
        let mut len = 0;
        let mut keys = Vec::new();
        for v in [5, 2, 8, 1, 3, 7, 9] {
            let k = TreeId(prog.trees.allocate(Tree::int(v)));
            let val = TreeId(prog.trees.allocate(Tree::int(v * 10)));
            insert(&mut prog.trees, &prog.kids, &mut prog.map_els, &mut root, &mut len, k, val);
            keys.push((v, k));
        }
        let (_, root_key) = keys[0]; // value 5, has two children
        let evicted = remove(&mut prog.trees, &prog.kids, &mut prog.map_els, &mut root, &mut len, root_key);
        assert!(evicted.is_some());
        assert_eq!(len, 6);
        assert_eq!(find(&prog.trees, &prog.kids, &prog.map_els, root, root_key), None);
        for (v, k) in &keys[1..] {
            assert!(
                find(&prog.trees, &prog.kids, &prog.map_els, root, *k).is_some(),
                "key {v} should survive removal of the root"
            );
        }
    }
}
