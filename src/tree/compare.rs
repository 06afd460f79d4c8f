//! Structural tree comparison (§4.1.3), used as the map key order and by
//! the pattern matcher's literal-data checks.
//!
//! A tree can be arbitrarily deep (a right-recursive "repeat" production's
//! spine, say), and `containers::map` calls this on every BST probe, so
//! comparison walks an explicit work stack rather than recursing on the
//! host call stack — the same discipline `print.rs`/`tree::refcount`
//! follow for the same reason.

use std::cmp::Ordering;

use crate::program::{KidId, Pool, TreeId};
use crate::tree::node::{KidPayload, Payload, Tree};

/// One pending comparison frame. A tree-pair frame, once its id/payload
/// agree, pushes a single chain-pair frame for its children; a chain-pair
/// frame pushes (in order) the comparison for its head pair and a
/// continuation frame for the rest of the chain, so the stack always
/// resolves the next required comparison on top.
enum Task {
    Trees(Option<TreeId>, Option<TreeId>),
    Chain(Option<KidId>, Option<KidId>),
}

/// Compares `a` and `b` structurally: null < non-null, then `id`, then
/// variant payload, then child lists element-by-element (a shorter list
/// sorts before a longer one that agrees on their common prefix).
#[must_use]
pub fn cmp(trees: &Pool<Tree>, kids: &Pool<crate::tree::node::Kid>, a: Option<TreeId>, b: Option<TreeId>) -> Ordering {
    let mut stack = vec![Task::Trees(a, b)];
    while let Some(task) = stack.pop() {
        match task {
            Task::Trees(a, b) => {
                let (a, b) = match (a, b) {
                    (None, None) => continue,
                    (None, Some(_)) => return Ordering::Less,
                    (Some(_), None) => return Ordering::Greater,
                    (Some(a), Some(b)) => (a, b),
                };
                if a == b {
                    continue;
                }
                let ta = trees.get(a.0);
                let tb = trees.get(b.0);

                let by_id = ta.id.cmp(&tb.id);
                if by_id != Ordering::Equal {
                    return by_id;
                }

                let by_payload = cmp_payload(ta, tb);
                if by_payload != Ordering::Equal {
                    return by_payload;
                }

                stack.push(Task::Chain(ta.child, tb.child));
            }
            Task::Chain(ka, kb) => {
                let (ka, kb) = match (ka, kb) {
                    (None, None) => continue,
                    (None, Some(_)) => return Ordering::Less,
                    (Some(_), None) => return Ordering::Greater,
                    (Some(ka), Some(kb)) => (ka, kb),
                };
                let kid_a = kids.get(ka.0);
                let kid_b = kids.get(kb.0);
                // Push the continuation first so it sits below the head
                // comparison and only runs once the head agrees.
                stack.push(Task::Chain(kid_a.next, kid_b.next));
                match (kid_a.payload, kid_b.payload) {
                    (KidPayload::Child(ta), KidPayload::Child(tb)) => {
                        stack.push(Task::Trees(Some(ta), Some(tb)));
                    }
                    (KidPayload::IgnoreChain(ia), KidPayload::IgnoreChain(ib)) => {
                        stack.push(Task::Chain(ia, ib));
                    }
                    // An ignore header never aligns with a plain child slot
                    // at the same position; treat it as a structural
                    // mismatch ordered by discriminant rather than panic,
                    // since comparison must be a total order even on
                    // malformed input fed to the map.
                    (KidPayload::IgnoreChain(_), KidPayload::Child(_)) => return Ordering::Less,
                    (KidPayload::Child(_), KidPayload::IgnoreChain(_)) => return Ordering::Greater,
                }
            }
        }
    }
    Ordering::Equal
}

fn cmp_payload(a: &Tree, b: &Tree) -> Ordering {
    match (&a.payload, &b.payload) {
        (Payload::Ptr(x), Payload::Ptr(y)) => x.cmp(y),
        (Payload::Int(x), Payload::Int(y)) => x.cmp(y),
        (Payload::Bool(x), Payload::Bool(y)) => x.cmp(y),
        (Payload::Stream(x), Payload::Stream(y)) => x.0.cmp(&y.0),
        (Payload::List { len: x, .. }, Payload::List { len: y, .. }) => x.cmp(y),
        (Payload::Map { len: x, .. }, Payload::Map { len: y, .. }) => x.cmp(y),
        (Payload::Parser(x), Payload::Parser(y)) => x.0.cmp(&y.0),
        _ => a.tokdata.cmp(&b.tokdata),
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
    fn orders_by_id_then_payload() {
        let mut prog = Program::new(test_rtd());
        let a = TreeId(prog.trees.allocate(Tree::int(1)));
        let b = TreeId(prog.trees.allocate(Tree::int(2)));
        assert_eq!(cmp(&prog.trees, &prog.kids, Some(a), Some(a)), Ordering::Equal);
        assert_eq!(cmp(&prog.trees, &prog.kids, Some(a), Some(b)), Ordering::Less);
        assert_eq!(cmp(&prog.trees, &prog.kids, Some(b), Some(a)), Ordering::Greater);
    }

    #[test]
    fn none_sorts_before_some() {
        let mut prog = Program::new(test_rtd());
        let a = TreeId(prog.trees.allocate(Tree::int(1)));
        assert_eq!(cmp(&prog.trees, &prog.kids, None, Some(a)), Ordering::Less);
        assert_eq!(cmp(&prog.trees, &prog.kids, Some(a), None), Ordering::Greater);
    }
}
