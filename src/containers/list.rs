//! The generic `List` container.
//!
//! Backed by a doubly linked chain of [`ListEl`] slots pooled in
//! [`Program::list_els`](crate::program::Program), giving O(1) append and
//! O(1) remove-from-end. The container's header (`head`/`tail`/`len`) lives
//! directly on the owning [`Tree`](crate::tree::node::Tree)'s
//! [`Payload::List`](crate::tree::node::Payload::List) variant, not in a
//! separate struct — there is nowhere else to keep it addressable by the
//! same pool-index handles the rest of the value model uses.

use crate::program::{ListElId, Pool, TreeId};
use crate::tree::node::Tree;
use crate::tree::refcount::{downref, upref};

#[derive(Debug, Clone, Copy)]
pub struct ListEl {
    pub value: TreeId,
    pub prev: Option<ListElId>,
    pub next: Option<ListElId>,
}

impl ListEl {
    #[must_use]
    pub fn new(value: TreeId, next: Option<ListElId>) -> Self {
        Self {
            value,
            prev: None,
            next,
        }
    }
}

/// Appends `value` to the tail of the list headed by `head`/`tail`/`len`,
/// taking ownership of one reference to it.
pub fn append(
    trees: &mut Pool<Tree>,
    list_els: &mut Pool<ListEl>,
    head: &mut Option<ListElId>,
    tail: &mut Option<ListElId>,
    len: &mut u32,
    value: TreeId,
) {
    upref(trees, value);
    let mut el = ListEl::new(value, None);
    el.prev = *tail;
    let new_id = ListElId(list_els.allocate(el));
    if let Some(old_tail) = *tail {
        list_els.get_mut(old_tail.0).next = Some(new_id);
    } else {
        *head = Some(new_id);
    }
    *tail = Some(new_id);
    *len += 1;
}

/// Removes the value at the tail of the list and returns it, transferring
/// the container's reference-count contribution to the caller (so the
/// returned id is neither upref'd nor downref'd here). `None` if the list
/// is empty.
pub fn remove_end(
    list_els: &mut Pool<ListEl>,
    head: &mut Option<ListElId>,
    tail: &mut Option<ListElId>,
    len: &mut u32,
) -> Option<TreeId> {
    let old_tail = (*tail)?;
    let el = list_els.free(old_tail.0);
    *tail = el.prev;
    match *tail {
        Some(new_tail) => list_els.get_mut(new_tail.0).next = None,
        None => *head = None,
    }
    *len -= 1;
    Some(el.value)
}

/// Random access to the fixed positions the language surface exposes: 0
/// (head) and 1 (tail). Any other position is a code-generator bug.
#[must_use]
pub fn get(list_els: &Pool<ListEl>, head: Option<ListElId>, tail: Option<ListElId>, position: u32) -> Option<TreeId> {
    match position {
        0 => head.map(|id| list_els.get(id.0).value),
        1 => tail.map(|id| list_els.get(id.0).value),
        _ => panic!("list positional access only supports 0 (head) and 1 (tail), got {position}"),
    }
}

/// Overwrites the element at fixed position `position` (0 = head, 1 =
/// tail) with `value`, returning the prior value. Caller owns the
/// returned reference and is responsible for taking one on `value`
/// beforehand, mirroring [`append`]/[`remove_end`]'s convention of never
/// adjusting refcounts on the caller's behalf implicitly except where
/// the container itself gains or loses an owning edge.
pub fn set(list_els: &mut Pool<ListEl>, head: Option<ListElId>, tail: Option<ListElId>, position: u32, value: TreeId) -> TreeId {
    let el_id = match position {
        0 => head.expect("set: list is empty"),
        1 => tail.expect("set: list is empty"),
        _ => panic!("list positional access only supports 0 (head) and 1 (tail), got {position}"),
    };
    std::mem::replace(&mut list_els.get_mut(el_id.0).value, value)
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
    fn append_then_remove_end_is_lifo() {
        let mut prog = Program::new(test_rtd());
        let v0 = TreeId(prog.trees.allocate(Tree::int(1)));
        let v1 = TreeId(prog.trees.allocate(Tree::int(2)));

        let mut head = None;
        let mut tail = None;
        let mut len = 0;
        append(&mut prog.trees, &mut prog.list_els, &mut head, &mut tail, &mut len, v0);
        append(&mut prog.trees, &mut prog.list_els, &mut head, &mut tail, &mut len, v1);
        assert_eq!(len, 2);
        assert_eq!(get(&prog.list_els, head, tail, 0), Some(v0));
        assert_eq!(get(&prog.list_els, head, tail, 1), Some(v1));

        let popped = remove_end(&mut prog.list_els, &mut head, &mut tail, &mut len);
        assert_eq!(popped, Some(v1));
        assert_eq!(len, 1);
        assert_eq!(tail, head);

        // caller now owns the popped value outright; release it.
        let mut work = Vec::new();
        downref(&mut prog.trees, &mut prog.kids, &mut prog.list_els, &mut prog.map_els, &mut work, v1);
    }
}
