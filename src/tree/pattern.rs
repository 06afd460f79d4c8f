//! Static pattern matching and replacement construction (§4.1.4, §4.1.5).
//!
//! `PatternNode`/`ReplNode` tables are host-compiled data living in
//! [`crate::program::RuntimeData`] — the grammar compiler's output, not
//! something this crate builds at runtime. The tables here describe
//! their shape; nothing in this module allocates them.

use crate::program::{KidId, Pool, TreeId};
use crate::tree::node::{alloc_attrs, Kid, KidPayload, Tree, TreeFlags};

/// One node of a static match pattern.
#[derive(Debug, Clone, Copy)]
pub struct PatternNode {
    /// Language-element id this node must match, or `None` to match any id
    /// (used for wildcard capture patterns).
    pub id: Option<u32>,
    /// Literal token text the matched node's `tokdata` must equal exactly.
    pub data: Option<&'static str>,
    /// Non-zero binds the matched subtree into `bindings[bind_id]`.
    pub bind_id: u32,
    /// Terminal dup: match this node but do not descend into its children.
    pub stop: bool,
    /// First child pattern, if this node's children must also match.
    pub child: Option<u32>,
    /// Next-sibling pattern.
    pub next: Option<u32>,
}

/// Walks pattern `pattern_index` against the live kid chain starting at
/// `kid`. `check_next` controls whether sibling (`next`) matching is
/// required at this level — callers descending into a child chain pass
/// `true`; the top-level call from an opcode typically does too.
///
/// Both pattern and kid being absent (`None`) is a successful leaf match.
/// Bindings are recorded as matching proceeds, even along a branch that
/// ultimately fails — the caller must discard `bindings` on overall
/// failure rather than relying on this function to roll them back.
pub fn match_pattern(
    patterns: &[PatternNode],
    trees: &Pool<Tree>,
    kids: &Pool<Kid>,
    pattern_index: Option<u32>,
    kid: Option<KidId>,
    check_next: bool,
    bindings: &mut [Option<TreeId>],
) -> bool {
    match (pattern_index, kid) {
        (None, None) => true,
        (None, Some(_)) | (Some(_), None) => false,
        (Some(pidx), Some(kid_id)) => {
            let node = &patterns[pidx as usize];
            let tree_id = match kids.get(kid_id.0).payload {
                KidPayload::Child(t) => t,
                KidPayload::IgnoreChain(_) => return false,
            };
            let tree = trees.get(tree_id.0);

            if let Some(want_id) = node.id {
                if want_id != tree.id {
                    return false;
                }
            }
            if let Some(data) = node.data {
                if tree.tokdata.as_deref() != Some(data) {
                    return false;
                }
            }
            if node.bind_id > 0 {
                bindings[node.bind_id as usize] = Some(tree_id);
            }

            if !node.stop {
                let child_ok = match_pattern(patterns, trees, kids, node.child, tree.child, true, bindings);
                if !child_ok {
                    return false;
                }
            }

            if check_next {
                let next_kid = kids.get(kid_id.0).next;
                match_pattern(patterns, trees, kids, node.next, next_kid, true, bindings)
            } else {
                true
            }
        }
    }
}

/// One node of a static replacement constructor.
#[derive(Debug, Clone, Copy)]
pub struct ReplNode {
    /// Language-element id to allocate for a fresh node. Ignored for
    /// bound-substitution nodes (`bind_id > 0`).
    pub id: u32,
    pub bind_id: u32,
    pub child: Option<u32>,
    pub next: Option<u32>,
    /// Literal ignore-list token ids to attach as a `LEFT_IGNORE` header,
    /// if any.
    pub ignore: Option<&'static [u32]>,
}

/// Expands replacement pattern `repl_index` using previously captured
/// `bindings`, returning the head of a freshly constructed kid chain (or
/// `None` for an absent optional slot).
pub fn construct_replacement(
    trees: &mut Pool<Tree>,
    kids: &mut Pool<Kid>,
    repls: &[ReplNode],
    object_length: impl Fn(u32) -> u16,
    repl_index: Option<u32>,
    bindings: &[TreeId],
) -> Option<KidId> {
    let ridx = repl_index?;
    let node = &repls[ridx as usize];

    let tree_id = if node.bind_id > 0 {
        let bound = bindings[node.bind_id as usize];
        if let Some(ignore_tokens) = node.ignore {
            let split = crate::tree::split::split(trees, kids, bound);
            prepend_ignore_header(trees, kids, split, ignore_tokens)
        } else {
            bound
        }
    } else {
        let mut tree = Tree::new(node.id);
        let attr_len = object_length(node.id);
        let children = construct_replacement(trees, kids, repls, &object_length, node.child, bindings);
        tree.child = alloc_attrs(trees, kids, attr_len, children);
        let new_id = TreeId(trees.allocate(tree));
        if let Some(ignore_tokens) = node.ignore {
            prepend_ignore_header(trees, kids, new_id, ignore_tokens)
        } else {
            new_id
        }
    };

    let next_head = construct_replacement(trees, kids, repls, &object_length, node.next, bindings);
    let slot = kids.allocate(Kid::child(tree_id, next_head));
    Some(KidId(slot))
}

fn prepend_ignore_header(trees: &mut Pool<Tree>, kids: &mut Pool<Kid>, tree_id: TreeId, ignore_tokens: &'static [u32]) -> TreeId {
    let mut chain = None;
    for &lang_el_id in ignore_tokens.iter().rev() {
        let tok = TreeId(trees.allocate(Tree::new(lang_el_id)));
        let slot = kids.allocate(Kid::child(tok, chain));
        chain = Some(KidId(slot));
    }
    let tree = trees.get_mut(tree_id.0);
    let header = kids.allocate(Kid {
        payload: KidPayload::IgnoreChain(chain),
        next: tree.child,
    });
    tree.child = Some(KidId(header));
    tree.flags.set(TreeFlags::LEFT_IGNORE);
    tree_id
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
    fn both_null_is_a_successful_leaf_match() {
        let prog = Program::new(test_rtd());
        let mut bindings = [None; 1];
        assert!(match_pattern(&[], &prog.trees, &prog.kids, None, None, true, &mut bindings));
    }

    #[test]
    fn id_mismatch_fails_the_match() {
        let mut prog = Program::new(test_rtd());
        let patterns = [PatternNode {
            id: Some(99),
            data: None,
            bind_id: 0,
            stop: true,
            child: None,
            next: None,
        }];
        let leaf = TreeId(prog.trees.allocate(Tree::int(1)));
        let slot = prog.kids.allocate(Kid::child(leaf, None));
        let mut bindings = [None; 1];
        assert!(!match_pattern(
            &patterns,
            &prog.trees,
            &prog.kids,
            Some(0),
            Some(KidId(slot)),
            false,
            &mut bindings
        ));
    }

    #[test]
    fn matching_node_records_its_binding() {
        let mut prog = Program::new(test_rtd());
        let patterns = [PatternNode {
            id: Some(crate::tree::node::LEL_ID_INT),
            data: None,
            bind_id: 1,
            stop: true,
            child: None,
            next: None,
        }];
        let leaf = TreeId(prog.trees.allocate(Tree::int(5)));
        let slot = prog.kids.allocate(Kid::child(leaf, None));
        let mut bindings = [None; 2];
        assert!(match_pattern(
            &patterns,
            &prog.trees,
            &prog.kids,
            Some(0),
            Some(KidId(slot)),
            false,
            &mut bindings
        ));
        assert_eq!(bindings[1], Some(leaf));
    }

    #[test]
    fn construct_replacement_builds_a_fresh_node() {
        let mut prog = Program::new(test_rtd());
        let repls = [ReplNode {
            id: 42,
            bind_id: 0,
            child: None,
            next: None,
            ignore: None,
        }];
        let bindings: Vec<TreeId> = Vec::new();
        let head = construct_replacement(&mut prog.trees, &mut prog.kids, &repls, |_| 0, Some(0), &bindings);
        let kid_id = head.expect("expected a constructed kid");
        let tree_id = prog.kids.get(kid_id.0).tree();
        assert_eq!(prog.trees.get(tree_id.0).id, 42);
    }

    #[test]
    fn construct_replacement_substitutes_bound_subtree() {
        let mut prog = Program::new(test_rtd());
        let bound = TreeId(prog.trees.allocate(Tree::int(7)));
        let repls = [ReplNode {
            id: 0,
            bind_id: 1,
            child: None,
            next: None,
            ignore: None,
        }];
        let bindings = vec![TreeId(0), bound];
        let head = construct_replacement(&mut prog.trees, &mut prog.kids, &repls, |_| 0, Some(0), &bindings);
        let kid_id = head.expect("expected a constructed kid");
        assert_eq!(prog.kids.get(kid_id.0).tree(), bound);
    }
}
