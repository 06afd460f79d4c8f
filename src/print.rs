//! Tree printing (§4.6): plain reprint, XML with comments-and-attributes,
//! and bare XML skeleton. All three walk the tree iteratively over an
//! explicit work stack rather than the host call stack (design note in
//! spec.md §9), the same discipline [`crate::tree::refcount::downref`]
//! and [`crate::iter`] use for the same reason.

use std::io::{self, Write};

use crate::program::{KidId, Pool, Program, TreeId};
use crate::tree::node::{Kid, KidPayload, Tree, TreeFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintMode {
    /// Faithful source reprint: concatenated token text plus ignore
    /// lists, no structural markup.
    Plain,
    /// One XML element per non-terminal, attribute values and ignore
    /// lists included.
    XmlComments,
    /// Bare structural skeleton: element names only, no token text, no
    /// ignore lists.
    XmlSkeleton,
}

enum Work {
    Tree(TreeId),
    /// Continue flattening a repeat/list spine at the same nesting depth
    /// (no opening/closing tag for the wrapper node itself).
    RepeatTail(TreeId),
    Close(u32),
}

/// Prints the subtree rooted at `root` to `out` in `mode`.
pub fn print_tree(prog: &Program, out: &mut dyn Write, root: TreeId, mode: PrintMode) -> io::Result<()> {
    let mut work = vec![Work::Tree(root)];
    while let Some(item) = work.pop() {
        match item {
            Work::Tree(t) => emit_tree(prog, out, &mut work, t, mode, true)?,
            Work::RepeatTail(t) => emit_tree(prog, out, &mut work, t, mode, false)?,
            Work::Close(id) => {
                if mode != PrintMode::Plain {
                    write!(out, "</{}>", prog.rtd.lang_el_info.get(id as usize).map_or("?", |i| i.name))?;
                }
            }
        }
    }
    Ok(())
}

fn emit_tree(prog: &Program, out: &mut dyn Write, work: &mut Vec<Work>, t: TreeId, mode: PrintMode, own_tag: bool) -> io::Result<()> {
    let tree = prog.trees.get(t.0);

    if mode != PrintMode::XmlSkeleton {
        if tree.flags.has(TreeFlags::LEFT_IGNORE) {
            emit_ignore_header(prog, out, tree.child)?;
        }
        if tree.flags.has(TreeFlags::RIGHT_IGNORE) {
            let after_left = if tree.flags.has(TreeFlags::LEFT_IGNORE) {
                tree.child.and_then(|k| prog.kids.get(k.0).next)
            } else {
                tree.child
            };
            emit_ignore_header(prog, out, after_left)?;
        }
    }

    let real_children = crate::tree::node::skip_ignore_headers(&prog.kids, tree, tree.child);

    if real_children.is_none() {
        return emit_leaf(prog, out, tree, mode);
    }

    if own_tag && prog.rtd.is_repeat(tree.id) {
        // Flatten: first real child is the repeated element, the second
        // is the tail of the spine; recurse into the tail at the same
        // depth instead of nesting another wrapper tag.
        let head_kid = real_children.unwrap();
        let head_tree = kid_tree(&prog.kids, head_kid);
        let tail_kid = prog.kids.get(head_kid.0).next;
        if let Some(tail_kid) = tail_kid {
            let tail_tree = kid_tree(&prog.kids, tail_kid);
            work.push(Work::RepeatTail(tail_tree));
        }
        work.push(Work::Tree(head_tree));
        return Ok(());
    }

    if own_tag && mode != PrintMode::Plain {
        let name = prog.rtd.lang_el_info.get(tree.id as usize).map_or("?", |i| i.name);
        write!(out, "<{name}>")?;
        work.push(Work::Close(tree.id));
    }

    let mut children = Vec::new();
    let mut cur = real_children;
    while let Some(kid_id) = cur {
        children.push(kid_tree(&prog.kids, kid_id));
        cur = prog.kids.get(kid_id.0).next;
    }
    for &child in children.iter().rev() {
        work.push(Work::Tree(child));
    }
    Ok(())
}

fn kid_tree(kids: &Pool<Kid>, kid_id: KidId) -> TreeId {
    match kids.get(kid_id.0).payload {
        KidPayload::Child(t) => t,
        KidPayload::IgnoreChain(_) => panic!("kid_tree called on an ignore-chain header slot"),
    }
}

fn emit_leaf(prog: &Program, out: &mut dyn Write, tree: &Tree, mode: PrintMode) -> io::Result<()> {
    let text = tree.tokdata.as_deref().unwrap_or("");
    match mode {
        PrintMode::Plain => write!(out, "{text}"),
        PrintMode::XmlComments => {
            let name = prog.rtd.lang_el_info.get(tree.id as usize).map_or("?", |i| i.name);
            write!(out, "<{name}>{text}</{name}>")
        }
        PrintMode::XmlSkeleton => {
            let name = prog.rtd.lang_el_info.get(tree.id as usize).map_or("?", |i| i.name);
            write!(out, "<{name}/>")
        }
    }
}

/// Prints the tokens of an ignore chain in reverse order, immediately
/// before the token they precede (§4.6). `header` is the ignore-header
/// slot itself (`IgnoreChain`); absent means no ignores at this
/// position.
fn emit_ignore_header(prog: &Program, out: &mut dyn Write, header: Option<KidId>) -> io::Result<()> {
    let Some(header_id) = header else { return Ok(()) };
    let KidPayload::IgnoreChain(mut chain) = prog.kids.get(header_id.0).payload else {
        return Ok(());
    };
    let mut toks = Vec::new();
    while let Some(kid_id) = chain {
        toks.push(kid_tree(&prog.kids, kid_id));
        chain = prog.kids.get(kid_id.0).next;
    }
    for &t in toks.iter().rev() {
        let tok = prog.trees.get(t.0);
        write!(out, "{}", tok.tokdata.as_deref().unwrap_or(""))?;
    }
    Ok(())
}

/// Renders `root` in plain mode into an owned `String`, for `TREE_TO_STR`.
#[must_use]
pub fn tree_to_string(prog: &Program, root: TreeId) -> String {
    let mut buf = Vec::new();
    print_tree(prog, &mut buf, root, PrintMode::Plain).expect("writing to a Vec<u8> never fails");
    String::from_utf8(buf).expect("token text is always valid UTF-8")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::program::{GenericInfo, LangElInfo, RuntimeData};
    use crate::tree::node::{Kid, Tree, LEL_RESERVED_COUNT};

    fn rtd_with_names(names: &'static [&'static str]) -> RuntimeData {
        // leaked once per test; fine at this scale.
        let info: &'static [LangElInfo] = Box::leak(
            names
                .iter()
                .map(|&name| LangElInfo {
                    name,
                    generic_id: 0,
                    object_length: 0,
                    ignore: false,
                    repeat: false,
                })
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        );
        RuntimeData {
            lang_el_info: info,
            generic_info: &[] as &'static [GenericInfo],
            strings: &[],
            patterns: &[],
            replacements: &[],
            code_entries: &[],
            code: &[],
        }
    }

    #[test]
    fn plain_mode_concatenates_leaf_tokens() {
        let rtd: &'static RuntimeData = Box::leak(Box::new(rtd_with_names(&["ignore", "ignore", "root"])));
        let mut prog = Program::new(rtd);

        let a = TreeId(prog.trees.allocate(Tree::string("ab".into())));
        let b = TreeId(prog.trees.allocate(Tree::string("cd".into())));
        let slot_b = prog.kids.allocate(Kid::child(b, None));
        let slot_a = prog.kids.allocate(Kid::child(a, Some(KidId(slot_b))));
        let mut root = Tree::new(2);
        root.child = Some(KidId(slot_a));
        let root_id = TreeId(prog.trees.allocate(root));

        let out = tree_to_string(&prog, root_id);
        assert_eq!(out, "abcd");
    }

    #[test]
    fn xml_skeleton_has_no_token_text() {
        let rtd: &'static RuntimeData = Box::leak(Box::new(rtd_with_names(&["leaf"])));
        let mut prog = Program::new(rtd);
        let leaf = TreeId(prog.trees.allocate(Tree::string("hello".into())));

        let mut buf = Vec::new();
        print_tree(&prog, &mut buf, leaf, PrintMode::XmlSkeleton).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "<leaf/>");
    }

    #[test]
    fn repeat_nodes_flatten_instead_of_nesting() {
        // id 0 = "item" (a leaf, tokdata carries its text directly), id 1 =
        // "list" (the repeat-flagged spine wrapper).
        let info: &'static [LangElInfo] = Box::leak(Box::new([
            LangElInfo { name: "item", generic_id: 0, object_length: 0, ignore: false, repeat: false },
            LangElInfo { name: "list", generic_id: 0, object_length: 0, ignore: false, repeat: true },
        ]));
        let rtd: &'static RuntimeData = Box::leak(Box::new(RuntimeData {
            lang_el_info: info,
            generic_info: &[],
            strings: &[],
            patterns: &[],
            replacements: &[],
            code_entries: &[],
            code: &[],
        }));
        let mut prog = Program::new(rtd);

        // list(item("a"), list(item("b"), nil))
        let nil_list = TreeId(prog.trees.allocate(Tree::new(1)));
        let item_b = {
            let mut t = Tree::new(0);
            t.tokdata = Some("b".into());
            TreeId(prog.trees.allocate(t))
        };
        let mut inner_list = Tree::new(1);
        let tail_slot = prog.kids.allocate(Kid::child(nil_list, None));
        let head_slot = prog.kids.allocate(Kid::child(item_b, Some(KidId(tail_slot))));
        inner_list.child = Some(KidId(head_slot));
        let inner_list_id = TreeId(prog.trees.allocate(inner_list));

        let item_a = {
            let mut t = Tree::new(0);
            t.tokdata = Some("a".into());
            TreeId(prog.trees.allocate(t))
        };
        let mut outer_list = Tree::new(1);
        let tail2 = prog.kids.allocate(Kid::child(inner_list_id, None));
        let head2 = prog.kids.allocate(Kid::child(item_a, Some(KidId(tail2))));
        outer_list.child = Some(KidId(head2));
        let outer_list_id = TreeId(prog.trees.allocate(outer_list));

        let mut buf = Vec::new();
        print_tree(&prog, &mut buf, outer_list_id, PrintMode::XmlComments).unwrap();
        let out = String::from_utf8(buf).unwrap();
        // flattened: one <item> per element, no nested <list><list>.
        assert_eq!(out, "<item>a</item><item>b</item>");
    }
}
