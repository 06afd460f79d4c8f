//! Tree node and child-slot representation.
//!
//! A [`Tree`] is a tagged, reference-counted record. Its children live in a
//! singly linked list of [`Kid`] slots; that list is the concatenation of an
//! optional left-ignore header, an optional right-ignore header, a fixed
//! run of attribute slots, then the grammar children (§3.1 of the data
//! model this crate implements).
//!
//! The original C runtime reused a single `Kid::tree` field for two
//! different roles: a normal child edge, and (for ignore headers) a
//! `Kid*` silently cast to `Tree*` pointing at a *second* kid list of
//! ignored tokens. That conflation is exactly the kind of thing worth
//! untangling in a typed rewrite, so here the two roles are a proper
//! tagged enum: [`KidPayload::Child`] vs [`KidPayload::IgnoreChain`].

use crate::program::{AccumId, KidId, ListElId, MapElId, Pool, TreeId};

/// Reserved language-element ids for the scalar/specialized tree variants.
/// Real grammar productions are numbered starting at [`LEL_RESERVED_COUNT`].
pub const LEL_ID_PTR: u32 = 0;
pub const LEL_ID_BOOL: u32 = 1;
pub const LEL_ID_INT: u32 = 2;
pub const LEL_ID_STR: u32 = 3;
pub const LEL_ID_STREAM: u32 = 4;
pub const LEL_RESERVED_COUNT: u32 = 5;

/// Bitset of per-tree flags. Hand-rolled rather than pulled in from a
/// crate: there are three bits total and they are only ever tested, never
/// iterated or displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TreeFlags(u8);

impl TreeFlags {
    pub const LEFT_IGNORE: u8 = 1 << 0;
    pub const RIGHT_IGNORE: u8 = 1 << 1;
    /// Set on parse-tree nodes that a reduction has committed; cleared by
    /// `commitFull` on ancestors as the commit walk passes over them.
    pub const COMMITTED: u8 = 1 << 2;

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn has(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn set(&mut self, bit: u8) {
        self.0 |= bit;
    }

    pub fn clear(&mut self, bit: u8) {
        self.0 &= !bit;
    }
}

/// Scalar/generic payload for the specialized tree variants. `STR` does not
/// need a payload variant: its value lives in `Tree::tokdata`, the same
/// field a plain token leaf uses.
///
/// The generic containers (§3.3) share the rest of `Tree`'s layout —
/// `id`/`refs`/`flags` — and carry only their header data here: a list's
/// head/tail/length, a map's root element. This is the typed equivalent of
/// the original overlaying `List`/`Map`/`Accum` structs onto the same
/// pool-allocated record as a plain `Tree`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    None,
    Ptr(u64),
    Bool(bool),
    Int(i64),
    Stream(crate::external::StreamId),
    List {
        head: Option<ListElId>,
        tail: Option<ListElId>,
        len: u32,
    },
    Map {
        root: Option<MapElId>,
        len: u32,
    },
    /// Owns a scanner + parser-driver pair, held out-of-line in
    /// `Program::accums` since it is not `Copy`.
    Parser(AccumId),
}

#[derive(Debug, Clone)]
pub struct Tree {
    pub id: u32,
    pub refs: u32,
    pub flags: TreeFlags,
    pub tokdata: Option<String>,
    pub child: Option<KidId>,
    pub payload: Payload,
}

impl Tree {
    #[must_use]
    pub fn new(id: u32) -> Self {
        Self {
            id,
            refs: 1,
            flags: TreeFlags::empty(),
            tokdata: None,
            child: None,
            payload: Payload::None,
        }
    }

    #[must_use]
    pub fn int(value: i64) -> Self {
        Self {
            payload: Payload::Int(value),
            ..Self::new(LEL_ID_INT)
        }
    }

    #[must_use]
    pub fn boolean(value: bool) -> Self {
        Self {
            payload: Payload::Bool(value),
            ..Self::new(LEL_ID_BOOL)
        }
    }

    #[must_use]
    pub fn string(value: String) -> Self {
        let mut t = Self::new(LEL_ID_STR);
        t.tokdata = Some(value);
        t
    }

    #[must_use]
    pub fn ptr(value: u64) -> Self {
        Self {
            payload: Payload::Ptr(value),
            ..Self::new(LEL_ID_PTR)
        }
    }
}

/// One edge in a tree's child linked list.
#[derive(Debug, Clone, Copy)]
pub enum KidPayload {
    /// A normal owning edge to a child tree (attribute slot or grammar
    /// child, or one link of an ignore chain).
    Child(TreeId),
    /// Only ever appears on a left/right ignore *header* slot: the head of
    /// a separate kid chain whose `Child` links are the ignored tokens, in
    /// source order.
    IgnoreChain(Option<KidId>),
}

#[derive(Debug, Clone, Copy)]
pub struct Kid {
    pub payload: KidPayload,
    pub next: Option<KidId>,
}

impl Kid {
    #[must_use]
    pub fn child(tree: TreeId, next: Option<KidId>) -> Self {
        Self {
            payload: KidPayload::Child(tree),
            next,
        }
    }

    #[must_use]
    pub fn tree(&self) -> TreeId {
        match self.payload {
            KidPayload::Child(t) => t,
            KidPayload::IgnoreChain(_) => {
                panic!("Kid::tree called on an ignore-chain header slot")
            }
        }
    }
}

/// Allocates `len` fresh, zero-initialized attribute slots (as a `Kid`
/// chain) ahead of `tail`, each pointing at a freshly allocated nil
/// placeholder tree. Mirrors `alloc_attrs`.
///
/// All `len` slots share the *same* placeholder tree rather than each
/// getting their own: `Tree::new` gives it `refs == 1` for the first
/// owning edge, and every additional slot takes one more reference, so
/// the shared placeholder's count always matches how many attr slots
/// still point at it — overwriting one slot via `set_attr` downrefs the
/// placeholder without disturbing the others. A zero-length attribute
/// list allocates nothing at all, avoiding an unreferenced placeholder
/// that would otherwise never be freed.
pub fn alloc_attrs(trees: &mut Pool<Tree>, kids: &mut Pool<Kid>, len: u16, tail: Option<KidId>) -> Option<KidId> {
    if len == 0 {
        return tail;
    }
    let nil = TreeId(trees.allocate(Tree::new(LEL_ID_PTR)));
    let mut cur = tail;
    for i in 0..len {
        if i > 0 {
            crate::tree::refcount::upref(trees, nil);
        }
        let id = kids.allocate(Kid::child(nil, cur));
        cur = Some(KidId(id));
    }
    cur
}

/// Walks past the left/right ignore headers (if present) to the first
/// attribute or grammar-child slot.
#[must_use]
pub fn skip_ignore_headers(kids: &Pool<Kid>, tree: &Tree, mut cur: Option<KidId>) -> Option<KidId> {
    if tree.flags.has(TreeFlags::LEFT_IGNORE) {
        cur = cur.map(|k| kids.get(k.0).next).flatten();
    }
    if tree.flags.has(TreeFlags::RIGHT_IGNORE) {
        cur = cur.map(|k| kids.get(k.0).next).flatten();
    }
    cur
}

/// Locates the `Kid` slot for attribute `pos` (0-based, after any ignore
/// headers), shared by [`get_attr`]/[`set_attr`] and by the reference
/// family's qualification step.
#[must_use]
pub fn attr_slot(kids: &Pool<Kid>, trees: &Pool<Tree>, tree_id: TreeId, pos: u16) -> KidId {
    let tree = trees.get(tree_id.0);
    let mut kid = skip_ignore_headers(kids, tree, tree.child);
    for _ in 0..pos {
        kid = kid.map(|k| kids.get(k.0).next).flatten();
    }
    kid.expect("attribute index out of range")
}

/// Reads attribute `pos` (0-based, after any ignore headers). Mirrors
/// `get_attr`.
#[must_use]
pub fn get_attr(kids: &Pool<Kid>, trees: &Pool<Tree>, tree_id: TreeId, pos: u16) -> TreeId {
    kids.get(attr_slot(kids, trees, tree_id, pos).0).tree()
}

/// Overwrites attribute `pos` in place. Caller is responsible for having
/// split the tree first (`refs == 1`) and for up/downrefing the old/new
/// values — this function only rewrites the slot pointer, matching
/// `set_attr` in the original, which is itself a raw pointer write.
pub fn set_attr(kids: &mut Pool<Kid>, trees: &Pool<Tree>, tree_id: TreeId, pos: u16, value: TreeId) {
    let kid = attr_slot(kids, trees, tree_id, pos);
    kids.get_mut(kid.0).payload = KidPayload::Child(value);
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
    fn attr_roundtrip_through_ignore_headers() {
        let mut prog = Program::new(test_rtd());
        let nil = TreeId(prog.trees.allocate(Tree::new(LEL_ID_INT)));
        let a0 = TreeId(prog.trees.allocate(Tree::int(10)));
        let a1 = TreeId(prog.trees.allocate(Tree::int(20)));

        // attribute slots: a0, a1 (tail-first, so allocate a1 then a0)
        let tail = prog.kids.allocate(Kid::child(a1, None));
        let head = prog.kids.allocate(Kid::child(a0, Some(KidId(tail))));

        // prepend a left-ignore header
        let ignore_header = prog
            .kids
            .allocate(Kid {
                payload: KidPayload::IgnoreChain(None),
                next: Some(KidId(head)),
            });

        let mut tree = Tree::new(LEL_RESERVED_COUNT);
        tree.flags.set(TreeFlags::LEFT_IGNORE);
        tree.child = Some(KidId(ignore_header));
        let tree_id = TreeId(prog.trees.allocate(tree));

        assert_eq!(get_attr(&prog.kids, &prog.trees, tree_id, 0), a0);
        assert_eq!(get_attr(&prog.kids, &prog.trees, tree_id, 1), a1);

        set_attr(&mut prog.kids, &prog.trees, tree_id, 1, nil);
        assert_eq!(get_attr(&prog.kids, &prog.trees, tree_id, 1), nil);
    }
}
