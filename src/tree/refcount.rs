//! Reference counting with iterative, stack-driven deallocation.
//!
//! `downref` must never recurse on the host call stack: a tree can be
//! arbitrarily deep, and the original runtime explicitly pushes owned
//! children onto the VM's value stack and loops instead of recursing.
//! `downref`/`upref` here take an explicit work-stack (`&mut Vec<TreeId>`)
//! for exactly that reason, standing in for the VM stack the original
//! reuses for this purpose (invariant 1, round-trip laws in spec §8).

use crate::program::{MapElId, Pool, TreeId};
use crate::tree::node::{KidPayload, Payload, Tree};

pub fn upref(trees: &mut Pool<Tree>, t: TreeId) {
    trees.get_mut(t.0).refs += 1;
}

/// Decrements `t`'s refcount, freeing it (and recursively downrefing and
/// freeing anything it exclusively owned) when it reaches zero. `work` is
/// reused as scratch space across calls; it is always empty again on
/// return.
pub fn downref(
    trees: &mut Pool<Tree>,
    kids: &mut Pool<crate::tree::node::Kid>,
    list_els: &mut Pool<crate::containers::list::ListEl>,
    map_els: &mut Pool<crate::containers::map::MapEl>,
    work: &mut Vec<TreeId>,
    t: TreeId,
) {
    work.push(t);
    while let Some(cur) = work.pop() {
        let refs = {
            let tree = trees.get_mut(cur.0);
            tree.refs -= 1;
            tree.refs
        };
        if refs > 0 {
            continue;
        }
        free_one(trees, kids, list_els, map_els, work, cur);
    }
}

/// Frees exactly one tree whose refcount has already reached zero, pushing
/// any owned child trees onto `work` for the caller's loop to downref in
/// turn (they are not downrefed here directly, matching the original's
/// "push children, don't recurse" discipline).
fn free_one(
    trees: &mut Pool<Tree>,
    kids: &mut Pool<crate::tree::node::Kid>,
    list_els: &mut Pool<crate::containers::list::ListEl>,
    map_els: &mut Pool<crate::containers::map::MapEl>,
    work: &mut Vec<TreeId>,
    t: TreeId,
) {
    let tree = trees.free(t.0);
    match tree.payload {
        Payload::List { head, .. } => {
            let mut cur = head;
            while let Some(el_id) = cur {
                let el = list_els.free(el_id.0);
                work.push(el.value);
                cur = el.next;
            }
        }
        Payload::Map { root, .. } => {
            free_map_subtree(map_els, root, work);
        }
        Payload::Parser(_) => {
            // The Accum's stream/driver are released by the caller via
            // `containers::accum::destroy_accum` before the tree reaches
            // refcount zero; nothing owned remains on the Tree itself.
        }
        Payload::Stream(_) | Payload::Ptr(_) | Payload::Bool(_) | Payload::Int(_) | Payload::None => {
            free_plain(tree, kids, work);
        }
    }
}

fn free_map_subtree(map_els: &mut Pool<crate::containers::map::MapEl>, root: Option<MapElId>, work: &mut Vec<TreeId>) {
    let mut pending = Vec::new();
    if let Some(id) = root {
        pending.push(id);
    }
    while let Some(id) = pending.pop() {
        let el = map_els.free(id.0);
        work.push(el.key);
        work.push(el.value);
        if let Some(left) = el.left {
            pending.push(left);
        }
        if let Some(right) = el.right {
            pending.push(right);
        }
    }
}

fn free_plain(tree: Tree, kids: &mut Pool<crate::tree::node::Kid>, work: &mut Vec<TreeId>) {
    use crate::tree::node::LEL_ID_STREAM;
    if tree.id == LEL_ID_STREAM {
        // Stream teardown is the host's responsibility (closing the real
        // fd/handle); the core only needs to stop tracking it.
        return;
    }
    let mut cur = tree.child;
    while let Some(kid_id) = cur {
        let kid = kids.free(kid_id.0);
        match kid.payload {
            KidPayload::Child(child) => work.push(child),
            KidPayload::IgnoreChain(chain_head) => {
                let mut ig = chain_head;
                while let Some(ig_id) = ig {
                    let ig_kid = kids.free(ig_id.0);
                    if let KidPayload::Child(t) = ig_kid.payload {
                        work.push(t);
                    }
                    ig = ig_kid.next;
                }
            }
        }
        cur = kid.next;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::program::Program;
    use crate::program::RuntimeData;
    use crate::tree::node::Kid;

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
    fn downref_to_zero_frees_children_iteratively() {
        let mut prog = Program::new(test_rtd());
        let leaf = TreeId(prog.trees.allocate(Tree::int(1)));
        let kid = prog.kids.allocate(Kid::child(leaf, None));
        let mut parent = Tree::new(10);
        parent.child = Some(crate::program::KidId(kid));
        let parent_id = TreeId(prog.trees.allocate(parent));

        let mut work = Vec::new();
        downref(
            &mut prog.trees,
            &mut prog.kids,
            &mut prog.list_els,
            &mut prog.map_els,
            &mut work,
            parent_id,
        );
        assert_eq!(prog.trees.len_allocated(), 0);
        assert_eq!(prog.kids.len_allocated(), 0);
        assert!(work.is_empty());
    }

    #[test]
    fn upref_then_downref_keeps_tree_alive() {
        let mut prog = Program::new(test_rtd());
        let leaf = TreeId(prog.trees.allocate(Tree::int(1)));
        upref(&mut prog.trees, leaf);
        assert_eq!(prog.trees.get(leaf.0).refs, 2);

        let mut work = Vec::new();
        downref(
            &mut prog.trees,
            &mut prog.kids,
            &mut prog.list_els,
            &mut prog.map_els,
            &mut work,
            leaf,
        );
        assert_eq!(prog.trees.get(leaf.0).refs, 1);
        assert_eq!(prog.trees.len_allocated(), 1);
    }

    #[test]
    fn downref_frees_list_elements_and_their_values() {
        let mut prog = Program::new(test_rtd());
        let v0 = TreeId(prog.trees.allocate(Tree::int(1)));
        let v1 = TreeId(prog.trees.allocate(Tree::int(2)));
        let el1 = prog
            .list_els
            .allocate(crate::containers::list::ListEl::new(v1, None));
        let el0 = prog
            .list_els
            .allocate(crate::containers::list::ListEl::new(v0, Some(crate::program::ListElId(el1))));
        let list_tree = Tree {
            payload: Payload::List {
                head: Some(crate::program::ListElId(el0)),
                tail: Some(crate::program::ListElId(el1)),
                len: 2,
            },
            ..Tree::new(crate::tree::node::LEL_RESERVED_COUNT)
        };
        let list_id = TreeId(prog.trees.allocate(list_tree));

        let mut work = Vec::new();
        downref(
            &mut prog.trees,
            &mut prog.kids,
            &mut prog.list_els,
            &mut prog.map_els,
            &mut work,
            list_id,
        );
        assert_eq!(prog.trees.len_allocated(), 0);
        assert_eq!(prog.list_els.len_allocated(), 0);
    }
}
