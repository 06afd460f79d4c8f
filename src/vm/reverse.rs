//! Reverse execution (component E): replays an [`UndoRecord`] log
//! tail-first to restore state a forward `_WV` opcode sequence mutated,
//! and the commit-time cleanup that discards a log without replaying it.

use crate::program::Program;
use crate::tree::node::{get_attr, set_attr};
use crate::tree::refcount::downref;
use crate::vm::opcode::Word;
use crate::vm::rcode::UndoRecord;

/// Replays `records` (already tail-first, as returned by
/// [`RcodeBuf::drain_from`](crate::vm::rcode::RcodeBuf::drain_from)) as
/// `_BKT` operations, restoring the pre-sequence state. `locals` is the
/// call frame's local-slot window the undone reduction ran in, if any —
/// `None` when undoing a top-level sequence with no live frame (e.g. a
/// parser handle being torn down mid-parse).
pub fn rexecute(prog: &mut Program, locals: Option<&mut [Word]>, records: Vec<UndoRecord>) {
    let mut locals = locals;
    for record in records {
        apply_one(prog, locals.as_deref_mut(), record);
    }
}

fn apply_one(prog: &mut Program, locals: Option<&mut [Word]>, record: UndoRecord) {
    match record {
        UndoRecord::SetField { tree, attr, old_value } => {
            let current = get_attr(&prog.kids, &prog.trees, tree, attr);
            set_attr(&mut prog.kids, &prog.trees, tree, attr, old_value);
            let mut work = Vec::new();
            downref(&mut prog.trees, &mut prog.kids, &mut prog.list_els, &mut prog.map_els, &mut work, current);
        }
        UndoRecord::SetLocal { slot, old_value } => {
            if let Some(locals) = locals {
                locals[slot] = old_value;
            }
        }
        UndoRecord::SetGlobal { slot, old_value } => {
            prog.globals[slot] = old_value;
        }
        UndoRecord::MapInsert { map_tree, key } => {
            let (root, len) = map_header_mut(prog, map_tree);
            let evicted = crate::containers::map::remove(&mut prog.trees, &prog.kids, &mut prog.map_els, root, len, key);
            if let Some((k, v)) = evicted {
                let mut work = Vec::new();
                downref(&mut prog.trees, &mut prog.kids, &mut prog.list_els, &mut prog.map_els, &mut work, k);
                downref(&mut prog.trees, &mut prog.kids, &mut prog.list_els, &mut prog.map_els, &mut work, v);
            }
        }
        UndoRecord::MapStore { map_tree, key, old_value } => {
            let (root, len) = map_header_mut(prog, map_tree);
            match old_value {
                Some(v) => {
                    // `store` assumes its caller keeps their own copy of
                    // `v` and takes a fresh reference for the map; here
                    // the log is instead handing its one held reference
                    // off outright, so the surplus `store` just added
                    // must be released. Whatever `store` evicts on this
                    // call (the value being superseded by the restore) is
                    // fully orphaned and is released the same way.
                    let discarded = crate::containers::map::store(&mut prog.trees, &prog.kids, &mut prog.map_els, root, len, key, v);
                    let mut work = Vec::new();
                    downref(&mut prog.trees, &mut prog.kids, &mut prog.list_els, &mut prog.map_els, &mut work, v);
                    if let Some(discarded) = discarded {
                        downref(&mut prog.trees, &mut prog.kids, &mut prog.list_els, &mut prog.map_els, &mut work, discarded);
                    }
                }
                None => {
                    let evicted = crate::containers::map::remove(&mut prog.trees, &prog.kids, &mut prog.map_els, root, len, key);
                    if let Some((k, v)) = evicted {
                        let mut work = Vec::new();
                        downref(&mut prog.trees, &mut prog.kids, &mut prog.list_els, &mut prog.map_els, &mut work, k);
                        downref(&mut prog.trees, &mut prog.kids, &mut prog.list_els, &mut prog.map_els, &mut work, v);
                    }
                }
            }
        }
        UndoRecord::MapRemove { map_tree, key, value } => {
            let (root, len) = map_header_mut(prog, map_tree);
            let inserted = crate::containers::map::insert(&mut prog.trees, &prog.kids, &mut prog.map_els, root, len, key, value);
            debug_assert!(inserted, "rexecute: MapRemove undo found the key already present");
            // `insert` takes its own fresh references on both key and
            // value; the log was handing its held references off
            // outright, so release the surplus.
            let mut work = Vec::new();
            downref(&mut prog.trees, &mut prog.kids, &mut prog.list_els, &mut prog.map_els, &mut work, key);
            downref(&mut prog.trees, &mut prog.kids, &mut prog.list_els, &mut prog.map_els, &mut work, value);
        }
        UndoRecord::ListAppend { list_tree } => {
            let (head, tail, len) = list_header_mut(prog, list_tree);
            if let Some(popped) = crate::containers::list::remove_end(&mut prog.list_els, head, tail, len) {
                let mut work = Vec::new();
                downref(&mut prog.trees, &mut prog.kids, &mut prog.list_els, &mut prog.map_els, &mut work, popped);
            }
        }
        UndoRecord::ListRemoveEnd { list_tree, value } => {
            let (head, tail, len) = list_header_mut(prog, list_tree);
            crate::containers::list::append(&mut prog.trees, &mut prog.list_els, head, tail, len, value);
            // `append` takes its own fresh reference; release the log's.
            let mut work = Vec::new();
            downref(&mut prog.trees, &mut prog.kids, &mut prog.list_els, &mut prog.map_els, &mut work, value);
        }
        UndoRecord::ListSet { list_tree, position, old_value } => {
            let (head, tail, _) = list_header_mut(prog, list_tree);
            let current = crate::containers::list::set(&mut prog.list_els, head, tail, position, old_value);
            let mut work = Vec::new();
            downref(&mut prog.trees, &mut prog.kids, &mut prog.list_els, &mut prog.map_els, &mut work, current);
        }
        UndoRecord::SetKid { kid, old_tree } => {
            let current = prog.kids.get(kid.0).tree();
            prog.kids.get_mut(kid.0).payload = crate::tree::node::KidPayload::Child(old_tree);
            let mut work = Vec::new();
            downref(&mut prog.trees, &mut prog.kids, &mut prog.list_els, &mut prog.map_els, &mut work, current);
        }
        UndoRecord::AccumSetStream { accum, old_stream } => {
            let a = prog.accums.get_mut(accum.0);
            let current = a.stream;
            a.stream = old_stream;
            let mut work = Vec::new();
            downref(&mut prog.trees, &mut prog.kids, &mut prog.list_els, &mut prog.map_els, &mut work, current);
        }
    }
}

fn map_header_mut(prog: &mut Program, tree: crate::program::TreeId) -> (&mut Option<crate::program::MapElId>, &mut u32) {
    match &mut prog.trees.get_mut(tree.0).payload {
        crate::tree::node::Payload::Map { root, len } => (root, len),
        other => panic!("rexecute: expected a Map payload, found {other:?}"),
    }
}

fn list_header_mut(
    prog: &mut Program,
    tree: crate::program::TreeId,
) -> (&mut Option<crate::program::ListElId>, &mut Option<crate::program::ListElId>, &mut u32) {
    match &mut prog.trees.get_mut(tree.0).payload {
        crate::tree::node::Payload::List { head, tail, len } => (head, tail, len),
        other => panic!("rexecute: expected a List payload, found {other:?}"),
    }
}

/// Releases the trees owned by `records` without replaying them —
/// used when a reduction's reverse-code is discarded outright (a parser
/// handle torn down mid-parse, rather than a backtrack that needs the
/// prior state restored).
pub fn rcode_downref_all(prog: &mut Program, records: Vec<UndoRecord>) {
    let mut work = Vec::new();
    for record in records {
        match record {
            // `old_value`/`value` fields the log captured by taking an
            // extra reference at emission time (the live tree/container
            // no longer points at them) are released here. `key` fields
            // are pure locators into state that is *not* being unwound —
            // the map still legitimately owns that same reference — so
            // they must NOT be released.
            UndoRecord::SetField { old_value, .. } => work.push(old_value),
            UndoRecord::MapInsert { .. } => {}
            UndoRecord::MapStore { old_value, .. } => {
                if let Some(v) = old_value {
                    work.push(v);
                }
            }
            UndoRecord::MapRemove { key, value, .. } => {
                work.push(key);
                work.push(value);
            }
            UndoRecord::ListRemoveEnd { value, .. } => work.push(value),
            UndoRecord::ListSet { old_value, .. } => work.push(old_value),
            UndoRecord::SetKid { old_tree, .. } => work.push(old_tree),
            UndoRecord::AccumSetStream { old_stream, .. } => work.push(old_stream),
            UndoRecord::SetLocal { .. } | UndoRecord::SetGlobal { .. } | UndoRecord::ListAppend { .. } => {}
        }
    }
    for t in work {
        let mut scratch = Vec::new();
        downref(&mut prog.trees, &mut prog.kids, &mut prog.list_els, &mut prog.map_els, &mut scratch, t);
    }
}

/// Walks committed parse-tree nodes bottom-up, clearing `COMMITTED` on
/// ancestors and releasing their reverse-code. After this, the undo log
/// for the committed region is empty.
pub fn commit_full(prog: &mut Program, rcode: &mut crate::vm::rcode::RcodeBuf, root: crate::program::TreeId) {
    use crate::tree::node::TreeFlags;
    let mut stack = vec![root];
    while let Some(t) = stack.pop() {
        let tree = prog.trees.get_mut(t.0);
        tree.flags.clear(TreeFlags::COMMITTED);
        let mut cur = tree.child;
        while let Some(kid_id) = cur {
            let kid = prog.kids.get(kid_id.0);
            if let crate::tree::node::KidPayload::Child(child) = kid.payload {
                stack.push(child);
            }
            cur = kid.next;
        }
    }
    let records = rcode.drain_from(0);
    rcode_downref_all(prog, records);
}

#[cfg(test)]
mod test {
    use super::*;
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
    fn rexecute_restores_a_field_write() {
        let mut prog = Program::new(test_rtd());
        let old = crate::program::TreeId(prog.trees.allocate(Tree::int(1)));
        let new = crate::program::TreeId(prog.trees.allocate(Tree::int(2)));
        let attr_slot = prog.kids.allocate(crate::tree::node::Kid::child(new, None));
        let mut holder = Tree::new(crate::tree::node::LEL_RESERVED_COUNT);
        holder.child = Some(crate::program::KidId(attr_slot));
        let holder_id = crate::program::TreeId(prog.trees.allocate(holder));

        assert_eq!(get_attr(&prog.kids, &prog.trees, holder_id, 0), new);

        let records = vec![UndoRecord::SetField {
            tree: holder_id,
            attr: 0,
            old_value: old,
        }];
        rexecute(&mut prog, None, records);

        assert_eq!(get_attr(&prog.kids, &prog.trees, holder_id, 0), old);
    }

    #[test]
    fn commit_full_clears_committed_flag_and_empties_rcode() {
        use crate::tree::node::TreeFlags;
        let mut prog = Program::new(test_rtd());
        let mut root = Tree::new(crate::tree::node::LEL_RESERVED_COUNT);
        root.flags.set(TreeFlags::COMMITTED);
        let root_id = crate::program::TreeId(prog.trees.allocate(root));

        let mut rcode = crate::vm::rcode::RcodeBuf::new();
        rcode.append(UndoRecord::ListAppend {
            list_tree: root_id,
        });

        commit_full(&mut prog, &mut rcode, root_id);
        assert!(!prog.trees.get(root_id.0).flags.has(TreeFlags::COMMITTED));
        assert!(rcode.is_empty());
    }
}
