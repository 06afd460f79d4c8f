//! Copy-on-write split (§4.1.2): `split` for a single tree, `split_ref`
//! for a whole access path.

use crate::program::{KidId, Pool, TreeId};
use crate::refs::RefChain;
use crate::tree::node::{Kid, KidPayload, Tree};
use crate::tree::refcount::upref;

/// Returns a tree equal to `t` with `refs == 1`. If `t` is already
/// exclusively owned it is returned unchanged; otherwise a shallow-deep
/// clone is made: a fresh tree node and a fresh child-slot backbone, but
/// each grandchild tree is *shared* (its refcount incremented) rather than
/// cloned — only the slot objects themselves are unshared.
pub fn split(trees: &mut Pool<Tree>, kids: &mut Pool<Kid>, t: TreeId) -> TreeId {
    if trees.get(t.0).refs == 1 {
        return t;
    }
    let (new_id, _map) = split_with_map(trees, kids, t);
    trees.get_mut(t.0).refs -= 1;
    new_id
}

/// Like [`split`], but also returns the old-slot-id → new-slot-id mapping
/// for every kid in the cloned backbone (including nested ignore chains),
/// so a caller threading a multi-hop reference through the clone can
/// relocate the hop that continues descending into it.
fn split_with_map(trees: &mut Pool<Tree>, kids: &mut Pool<Kid>, t: TreeId) -> (TreeId, Vec<(KidId, KidId)>) {
    let mut new_tree = trees.get(t.0).clone();
    new_tree.refs = 1;
    let mut map = Vec::new();
    new_tree.child = clone_kid_chain(trees, kids, new_tree.child, &mut map);
    let new_id = TreeId(trees.allocate(new_tree));
    (new_id, map)
}

fn clone_kid_chain(
    trees: &mut Pool<Tree>,
    kids: &mut Pool<Kid>,
    head: Option<KidId>,
    map: &mut Vec<(KidId, KidId)>,
) -> Option<KidId> {
    let mut old_ids = Vec::new();
    let mut cur = head;
    while let Some(id) = cur {
        old_ids.push(id);
        cur = kids.get(id.0).next;
    }

    let mut new_next = None;
    for &old_id in old_ids.iter().rev() {
        let old_kid = *kids.get(old_id.0);
        let new_payload = match old_kid.payload {
            KidPayload::Child(child) => {
                upref(trees, child);
                KidPayload::Child(child)
            }
            KidPayload::IgnoreChain(ignore_head) => {
                let new_ignore_head = clone_kid_chain(trees, kids, ignore_head, map);
                KidPayload::IgnoreChain(new_ignore_head)
            }
        };
        let new_id = KidId(kids.allocate(Kid {
            payload: new_payload,
            next: new_next,
        }));
        map.push((old_id, new_id));
        new_next = Some(new_id);
    }
    new_next
}

/// Extends `split` across a whole access path. Walking the chain
/// root-to-leaf, any hop whose referenced tree is shared gets its
/// immediate child backbone cloned in place (the slot it was reached
/// through is rewritten to the clone); the next hop down, if it targeted
/// one of the cloned slots, is relocated onto the new copy so continued
/// descent stays valid. Hops beyond the first shared one that *aren't*
/// part of the cloned backbone (i.e. don't continue straight down) are
/// left alone — only the single "next-down" transition needs relocating,
/// since every other hop in a path chain is an ancestor, not a sibling.
pub fn split_ref(trees: &mut Pool<Tree>, kids: &mut Pool<Kid>, chain: &mut RefChain) {
    let mut relocate: Option<(KidId, KidId)> = None;

    for i in 0..chain.hops.len() {
        if let Some((old, new)) = relocate {
            if chain.hops[i].kid == old {
                chain.hops[i].kid = new;
            }
        }
        relocate = None;

        let kid_id = chain.hops[i].kid;
        let tree_id = kids.get(kid_id.0).tree();
        if trees.get(tree_id.0).refs <= 1 {
            continue;
        }

        let (new_tree_id, map) = split_with_map(trees, kids, tree_id);
        trees.get_mut(tree_id.0).refs -= 1;
        kids.get_mut(kid_id.0).payload = KidPayload::Child(new_tree_id);

        if i + 1 < chain.hops.len() {
            let next_old_kid = chain.hops[i + 1].kid;
            if let Some(&(_, new_kid)) = map.iter().find(|(old, _)| *old == next_old_kid) {
                relocate = Some((next_old_kid, new_kid));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::program::Program;
    use crate::program::RuntimeData;

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
    fn split_of_exclusive_tree_is_a_no_op() {
        let mut prog = Program::new(test_rtd());
        let t = TreeId(prog.trees.allocate(Tree::int(5)));
        let split_id = split(&mut prog.trees, &mut prog.kids, t);
        assert_eq!(split_id, t);
    }

    #[test]
    fn split_of_shared_tree_clones_and_shares_grandchildren() {
        let mut prog = Program::new(test_rtd());
        let grandchild = TreeId(prog.trees.allocate(Tree::int(1)));
        let kid = prog.kids.allocate(Kid::child(grandchild, None));
        let mut parent = Tree::new(10);
        parent.child = Some(KidId(kid));
        let parent_id = TreeId(prog.trees.allocate(parent));
        upref(&mut prog.trees, parent_id); // simulate a second holder

        let new_id = split(&mut prog.trees, &mut prog.kids, parent_id);
        assert_ne!(new_id, parent_id);
        assert_eq!(prog.trees.get(parent_id.0).refs, 1);
        assert_eq!(prog.trees.get(new_id.0).refs, 1);
        // grandchild is shared between old and new backbones
        assert_eq!(prog.trees.get(grandchild.0).refs, 2);
    }

    #[test]
    fn split_ref_relocates_the_continuing_hop() {
        let mut prog = Program::new(test_rtd());
        let leaf = TreeId(prog.trees.allocate(Tree::int(42)));
        let leaf_slot = prog.kids.allocate(Kid::child(leaf, None));
        let mut mid = Tree::new(11);
        mid.child = Some(KidId(leaf_slot));
        let mid_id = TreeId(prog.trees.allocate(mid));
        upref(&mut prog.trees, mid_id); // shared

        let mid_slot = prog.kids.allocate(Kid::child(mid_id, None));

        let mut chain = RefChain::new();
        chain.push(KidId(mid_slot));
        chain.push(KidId(leaf_slot));

        split_ref(&mut prog.trees, &mut prog.kids, &mut chain);

        let relocated_leaf_slot = chain.hops[1].kid;
        assert_ne!(relocated_leaf_slot, KidId(leaf_slot));
        assert_eq!(prog.kids.get(relocated_leaf_slot.0).tree(), leaf);
        assert_eq!(prog.trees.get(mid_id.0).refs, 1);
    }
}
