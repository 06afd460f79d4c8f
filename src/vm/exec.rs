//! The bytecode execution engine (component D, §4.4): a single
//! fetch-decode-dispatch loop shared by top-level program execution and
//! the private driver behind each user-iterator coroutine.
//!
//! # Refcounting discipline on the stack
//!
//! Every `Word::Tree` value sitting on the operand stack, in a local
//! slot, or in a global slot represents exactly one owned reference.
//! Opcodes with an `_R` suffix (read) `upref` before pushing a copy;
//! `_Wc`/`_Wv` (write) opcodes `downref` whatever they discard, or hand
//! an extra reference to the undo log for `_Wv`. `Pop`/`PopN`/
//! `PopLocals` downref every `Word::Tree` they drop. `SaveLhs`/
//! `RestoreLhs`/`SaveRet` relocate ownership between the stack and a
//! side slot without touching any refcount.
//!
//! Field and container accessors that read through a "holder" value
//! (`GetFieldR`, `SetField*`, `MapLength`, `ListLength`, ...) pop the
//! holder, do their work, then push the holder back before the result —
//! so codegen can chain accesses without an explicit `Dup` first.
//!
//! `*_Bkt` opcodes are never dispatched from this loop — reverse
//! execution replays typed [`crate::vm::rcode::UndoRecord`]s directly
//! (see [`crate::vm::reverse`]) instead of re-entering the dispatcher
//! with inverse opcodes. Decoding one here is a code-generator bug.

use crate::containers::{accum, list, map};
use crate::error::{MeldError, Result};
use crate::external::StdioDuplex;
use crate::program::{AccumId, KidId, ListElId, Pool, Program, TreeId};
use crate::refs::RefChain;
use crate::tree::node::{self, Kid, KidPayload, Payload, Tree};
use crate::tree::refcount::{downref, upref};
use crate::vm::frame::{pop_call_frame, push_call_frame, push_iter_frame, FRAME_HEADER_LEN, FR_RV};
use crate::vm::opcode::{Op, Word};
use crate::vm::rcode::{RcodeBuf, UndoRecord};

/// A live multi-hop access path (§4.1.2), produced by `RefFromLocal`/
/// `RefFromRef`/`RefFromQual` and consumed by the `Deref*` family.
///
/// Hop 0 is always a synthetic `Kid::child` slot this handle owns
/// outright — a pure alias, not a real attribute edge — so
/// [`crate::tree::split::split_ref`] can run over the chain unmodified
/// even when the root it describes is a bare local/global variable
/// rather than someone else's child slot. `split_ref` rewrites a hop's
/// *payload* in place rather than relocating the hop itself, so hop 0's
/// `KidId` is stable for the handle's whole life: reading its tree back
/// after a split gives the (possibly relocated) root to write into the
/// local/global slot, and that same id is what gets freed when the
/// handle is torn down. Every other hop is a real attribute slot
/// belonging to live tree structure and must never be freed here.
pub struct RefHandle {
    pub chain: RefChain,
    pub root: RefRoot,
}

/// Where a [`RefHandle`]'s synthetic root hop writes its value back to
/// once a split relocates it.
#[derive(Debug, Clone, Copy)]
pub enum RefRoot {
    Local(usize),
    Global(usize),
}

/// A suspended user-defined generator coroutine (`UiterCreate`): its own
/// private `Vm`, resumed one `UiterAdvance` at a time. Holds its own
/// reverse-code log, the same way [`crate::containers::accum::Accum`]
/// holds its own rather than sharing the driving reduction's.
pub struct UserIterState {
    vm: Vm,
    done: bool,
}

/// Why [`run`] stopped driving the fetch-decode loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Ran off the end of the code buffer, or hit `Op::Halt`.
    Halted,
    /// Hit `Op::Yield`; the yielded value is on top of `vm.stack`.
    Yielded,
}

/// Transient per-invocation state threaded through every opcode. Not
/// stored in `Program`: a fresh `Vm` is built per top-level call and per
/// coroutine.
pub struct Vm {
    pub stack: Vec<Word>,
    pub frame: usize,
    pub iframe: usize,
    pub ip: usize,
    pub rcode: RcodeBuf,
    /// Side slot for `SaveLhs`/`RestoreLhs`: holds a holder expression's
    /// left-hand-side value while the rest of an assignment's operands
    /// are evaluated.
    pub lhs: Vec<Word>,
    /// Scratch capture slots `InitCaptures`/`InitRhsEl` fill in before a
    /// `Construct`/`ConstructTerm` reads them by bind id.
    captures: Vec<Option<TreeId>>,
}

impl Vm {
    #[must_use]
    pub fn new(start_ip: usize) -> Self {
        Self {
            stack: Vec::new(),
            frame: 0,
            iframe: 0,
            ip: start_ip,
            rcode: RcodeBuf::new(),
            lhs: Vec::new(),
            captures: Vec::new(),
        }
    }
}

/// Runs `prog`'s code starting at `start_ip` with `args` as the initial
/// locals, to completion (`Op::Halt` or falling off the code buffer),
/// returning the value left on top of the stack.
pub fn execute(prog: &mut Program, start_ip: usize, args: Vec<Word>) -> Result<Word> {
    let mut vm = Vm::new(start_ip);
    let base = push_call_frame(&mut vm.stack, 0, 0);
    vm.frame = base;
    for a in args {
        vm.stack.push(a);
    }
    run(prog, &mut vm)?;
    Ok(vm.stack.pop().unwrap_or(Word::Tree(None)))
}

fn read_u8(code: &[u8], ip: &mut usize) -> u8 {
    let b = code[*ip];
    *ip += 1;
    b
}

fn read_u16(code: &[u8], ip: &mut usize) -> u16 {
    let b = u16::from_le_bytes([code[*ip], code[*ip + 1]]);
    *ip += 2;
    b
}

fn read_u64(code: &[u8], ip: &mut usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&code[*ip..*ip + 8]);
    *ip += 8;
    u64::from_le_bytes(buf)
}

fn decode_search_id(raw: u64) -> Option<u32> {
    if raw == u64::MAX {
        None
    } else {
        Some(raw as u32)
    }
}

fn downref_word(prog: &mut Program, w: Word) {
    if let Word::Tree(Some(t)) = w {
        let mut work = Vec::new();
        downref(&mut prog.trees, &mut prog.kids, &mut prog.list_els, &mut prog.map_els, &mut work, t);
    }
}

fn upref_word(prog: &mut Program, w: Word) -> Word {
    if let Word::Tree(Some(t)) = w {
        upref(&mut prog.trees, t);
    }
    w
}

fn locals(vm: &Vm) -> &[Word] {
    &vm.stack[vm.frame + FRAME_HEADER_LEN..]
}

fn locals_mut(vm: &mut Vm) -> &mut [Word] {
    &mut vm.stack[vm.frame + FRAME_HEADER_LEN..]
}

fn nil_tree(prog: &mut Program) -> TreeId {
    TreeId(prog.trees.allocate(Tree::new(node::LEL_ID_PTR)))
}

fn list_header_mut(prog: &mut Program, t: TreeId) -> (&mut Option<ListElId>, &mut Option<ListElId>, &mut u32) {
    match &mut prog.trees.get_mut(t.0).payload {
        Payload::List { head, tail, len } => (head, tail, len),
        other => panic!("expected a List payload, found {other:?}"),
    }
}

fn map_header_mut(prog: &mut Program, t: TreeId) -> (&mut Option<crate::program::MapElId>, &mut u32) {
    match &mut prog.trees.get_mut(t.0).payload {
        Payload::Map { root, len } => (root, len),
        other => panic!("expected a Map payload, found {other:?}"),
    }
}

/// Deep-copies a container's element chain when `split()`'s shallow
/// backbone clone would otherwise leave the original and the copy
/// sharing the same live list/map elements: §4.1.2's COW contract only
/// covers the `Kid` backbone, while a list/map header's head/tail/root
/// fields are plain `Copy` ids sitting outside of it.
///
/// Scalar variants and parser handles can never legally reach a split
/// site (the compiler never emits a write through one), so those are
/// asserted against rather than handled.
fn split_tree_deep(prog: &mut Program, t: TreeId) -> TreeId {
    if prog.trees.get(t.0).refs == 1 {
        return t;
    }
    match prog.trees.get(t.0).payload {
        Payload::List { head, len, .. } => {
            let new_chain = copy_list_chain(&mut prog.trees, &mut prog.list_els, head);
            prog.trees.get_mut(t.0).refs -= 1;
            let mut new_tree = prog.trees.get(t.0).clone();
            new_tree.refs = 1;
            new_tree.payload = Payload::List {
                head: new_chain.map(|(h, _)| h),
                tail: new_chain.map(|(_, tl)| tl),
                len,
            };
            TreeId(prog.trees.allocate(new_tree))
        }
        Payload::Map { root, len } => {
            let new_root = map::copy_branch(&mut prog.trees, &mut prog.map_els, root);
            prog.trees.get_mut(t.0).refs -= 1;
            let mut new_tree = prog.trees.get(t.0).clone();
            new_tree.refs = 1;
            new_tree.payload = Payload::Map { root: new_root, len };
            TreeId(prog.trees.allocate(new_tree))
        }
        Payload::Parser(_) => panic!("split_tree_deep: a parser handle can never be shared"),
        Payload::Ptr(_) | Payload::Bool(_) | Payload::Int(_) | Payload::Stream(_) | Payload::None => {
            crate::tree::split::split(&mut prog.trees, &mut prog.kids, t)
        }
    }
}

/// Clones a list's element chain head-to-tail, sharing each element's
/// value tree (upref only). Returns the new `(head, tail)` pair, or
/// `None` for an empty list.
fn copy_list_chain(trees: &mut Pool<Tree>, list_els: &mut Pool<crate::containers::list::ListEl>, head: Option<ListElId>) -> Option<(ListElId, ListElId)> {
    let mut new_head = None;
    let mut prev: Option<ListElId> = None;
    let mut cur = head;
    while let Some(id) = cur {
        let el = *list_els.get(id.0);
        upref(trees, el.value);
        let new_id = ListElId(list_els.allocate(crate::containers::list::ListEl { value: el.value, prev, next: None }));
        if let Some(p) = prev {
            list_els.get_mut(p.0).next = Some(new_id);
        } else {
            new_head = Some(new_id);
        }
        prev = Some(new_id);
        cur = el.next;
    }
    new_head.zip(prev)
}

/// Builds a `RefHandle` rooted at a local or global slot: a synthetic
/// hop-0 aliasing the slot's current tree.
fn ref_from_root(prog: &mut Program, root: RefRoot, root_tree: TreeId) -> RefHandle {
    let synthetic = prog.kids.allocate(Kid::child(root_tree, None));
    let mut chain = RefChain::new();
    chain.push(KidId(synthetic));
    RefHandle { chain, root }
}

/// After a `split_ref` pass over `handle.chain`, writes the (possibly
/// relocated) synthetic root hop's tree back into the local/global slot
/// it describes.
fn reconcile_ref_root(prog: &mut Program, locals: &mut [Word], handle: &RefHandle) {
    let root_kid = handle.chain.hops[0].kid;
    let new_root = prog.kids.get(root_kid.0).tree();
    match handle.root {
        RefRoot::Local(slot) => locals[slot] = Word::Tree(Some(new_root)),
        RefRoot::Global(slot) => prog.globals[slot] = Word::Tree(Some(new_root)),
    }
}

fn free_ref_handle(prog: &mut Program, handle: RefHandle) {
    prog.kids.free(handle.chain.hops[0].kid.0);
}

fn make_iter_root_kid(prog: &mut Program, t: TreeId) -> KidId {
    KidId(prog.kids.allocate(Kid::child(t, None)))
}

/// Runs a read/write callback against a pooled stream, temporarily
/// removing it from the pool so the callback can hold `&mut Program`
/// and `&mut dyn StreamIo` at once, then puts it back at the same slot
/// (guaranteed by the pool's free-list LIFO discipline, since nothing
/// else touches `prog.streams` in between).
fn with_stream<T>(prog: &mut Program, id: u32, f: impl FnOnce(&mut Program, &mut dyn crate::external::StreamIo) -> T) -> T {
    let mut boxed = prog.streams.free(id);
    let result = f(prog, &mut *boxed);
    let reused = prog.streams.allocate(boxed);
    debug_assert_eq!(reused, id, "stream pool slot must be reclaimed immediately");
    result
}

fn stream_id_of(prog: &Program, stream_tree: TreeId) -> crate::external::StreamId {
    match prog.trees.get(stream_tree.0).payload {
        Payload::Stream(s) => s,
        other => panic!("expected a Stream payload, found {other:?}"),
    }
}

fn accum_id_of(prog: &Program, holder: TreeId) -> AccumId {
    match prog.trees.get(holder.0).payload {
        Payload::Parser(a) => a,
        other => panic!("expected a Parser payload, found {other:?}"),
    }
}

enum FmtArg {
    Int(i64),
    Str(String),
}

fn format_sprintf(fmt: &str, args: &[FmtArg]) -> String {
    let mut out = String::new();
    let mut chars = fmt.chars();
    let mut ai = 0;
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('d') => {
                if let Some(FmtArg::Int(v)) = args.get(ai) {
                    out.push_str(&v.to_string());
                }
                ai += 1;
            }
            Some('s') => {
                if let Some(FmtArg::Str(v)) = args.get(ai) {
                    out.push_str(v);
                }
                ai += 1;
            }
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

fn tree_search(trees: &Pool<Tree>, kids: &Pool<Kid>, root: TreeId, search_id: Option<u32>) -> Option<TreeId> {
    let mut stack = vec![root];
    while let Some(t) = stack.pop() {
        let tree = trees.get(t.0);
        if search_id.map_or(true, |id| id == tree.id) {
            return Some(t);
        }
        let mut children = Vec::new();
        let mut cur = tree.child;
        while let Some(kid_id) = cur {
            let kid = kids.get(kid_id.0);
            if let KidPayload::Child(c) = kid.payload {
                children.push(c);
            }
            cur = kid.next;
        }
        for c in children.into_iter().rev() {
            stack.push(c);
        }
    }
    None
}

fn bin_int(vm: &mut Vm, f: impl Fn(i64, i64) -> Word) {
    let b = vm.stack.pop().unwrap().as_int();
    let a = vm.stack.pop().unwrap().as_int();
    vm.stack.push(f(a, b));
}

/// Drives the fetch-decode-dispatch loop until `Op::Halt`, an error, a
/// `Yield`, or the instruction pointer runs off the end of the code
/// buffer. Serves both top-level program execution and a coroutine's
/// private `Vm` — `Ret` never needs to special-case loop exit, since
/// top-level reduction code never itself issues `Ret` (only
/// `CallWc`/`CallWv`-entered functions do) and call/return is otherwise
/// fully self-contained via the saved frame/return-ip words.
pub fn run(prog: &mut Program, vm: &mut Vm) -> Result<StopReason> {
    loop {
        let code = prog.rtd.code;
        if vm.ip >= code.len() {
            return Ok(StopReason::Halted);
        }
        let op = Op::decode(read_u8(code, &mut vm.ip));
        crate::trace_bytecode!(prog.tracer, "{:04} {:?}", vm.ip - 1, op);
        match op {
            // --- Literals & arithmetic ---
            Op::LoadInt => {
                let v = read_u64(prog.rtd.code, &mut vm.ip) as i64;
                vm.stack.push(Word::Int(v));
            }
            Op::LoadStr => {
                let idx = read_u16(prog.rtd.code, &mut vm.ip) as usize;
                let t = TreeId(prog.trees.allocate(Tree::string(prog.rtd.strings[idx].to_string())));
                vm.stack.push(Word::Tree(Some(t)));
            }
            Op::LoadNil => vm.stack.push(Word::Tree(None)),
            Op::LoadTrue => vm.stack.push(Word::Bool(true)),
            Op::LoadFalse => vm.stack.push(Word::Bool(false)),
            Op::AddInt => bin_int(vm, |a, b| Word::Int(a + b)),
            Op::SubInt => bin_int(vm, |a, b| Word::Int(a - b)),
            Op::MulInt => bin_int(vm, |a, b| Word::Int(a * b)),
            Op::DivInt => bin_int(vm, |a, b| Word::Int(a / b)),
            Op::EqInt => bin_int(vm, |a, b| Word::Bool(a == b)),
            Op::LtInt => bin_int(vm, |a, b| Word::Bool(a < b)),
            Op::LeInt => bin_int(vm, |a, b| Word::Bool(a <= b)),
            Op::GtInt => bin_int(vm, |a, b| Word::Bool(a > b)),
            Op::GeInt => bin_int(vm, |a, b| Word::Bool(a >= b)),
            Op::LogicAnd => {
                let b = vm.stack.pop().unwrap().as_bool();
                let a = vm.stack.pop().unwrap().as_bool();
                vm.stack.push(Word::Bool(a && b));
            }
            Op::LogicOr => {
                let b = vm.stack.pop().unwrap().as_bool();
                let a = vm.stack.pop().unwrap().as_bool();
                vm.stack.push(Word::Bool(a || b));
            }
            Op::LogicNot => {
                let a = vm.stack.pop().unwrap().as_bool();
                vm.stack.push(Word::Bool(!a));
            }

            // --- Control ---
            Op::Jmp => vm.ip = read_u64(prog.rtd.code, &mut vm.ip) as usize,
            Op::JmpFalse => {
                let target = read_u64(prog.rtd.code, &mut vm.ip) as usize;
                if !vm.stack.pop().unwrap().as_bool() {
                    vm.ip = target;
                }
            }
            Op::JmpTrue => {
                let target = read_u64(prog.rtd.code, &mut vm.ip) as usize;
                if vm.stack.pop().unwrap().as_bool() {
                    vm.ip = target;
                }
            }
            Op::CallWc | Op::CallWv => {
                let target = read_u64(prog.rtd.code, &mut vm.ip) as usize;
                let saved_frame = vm.frame;
                let return_ip = vm.ip;
                vm.frame = push_call_frame(&mut vm.stack, saved_frame, return_ip);
                vm.ip = target;
            }
            Op::Ret => {
                let locals_len = read_u16(prog.rtd.code, &mut vm.ip) as usize;
                let (saved_frame, return_ip, return_value) = pop_call_frame(&mut vm.stack, vm.frame, locals_len);
                vm.frame = saved_frame;
                vm.ip = return_ip;
                vm.stack.push(return_value);
            }
            Op::Yield => return Ok(StopReason::Yielded),
            Op::Halt => return Ok(StopReason::Halted),
            Op::Stop => return Err(MeldError::ProgramStopped),
            Op::Exit => {
                let status = vm.stack.pop().unwrap().as_int();
                return Err(MeldError::Exited(status));
            }

            // --- Frame ---
            Op::InitLocals => {
                let n = read_u16(prog.rtd.code, &mut vm.ip) as usize;
                for _ in 0..n {
                    vm.stack.push(Word::Tree(None));
                }
            }
            Op::PopLocals | Op::PopN => {
                let n = read_u16(prog.rtd.code, &mut vm.ip) as usize;
                for _ in 0..n {
                    let w = vm.stack.pop().unwrap();
                    downref_word(prog, w);
                }
            }
            Op::Pop => {
                let w = vm.stack.pop().unwrap();
                downref_word(prog, w);
            }
            Op::Dup => {
                let top = *vm.stack.last().unwrap();
                let copy = upref_word(prog, top);
                vm.stack.push(copy);
            }
            Op::DupOff => {
                let off = read_u16(prog.rtd.code, &mut vm.ip) as usize;
                let idx = vm.stack.len() - 1 - off;
                let w = vm.stack[idx];
                let copy = upref_word(prog, w);
                vm.stack.push(copy);
            }
            Op::SaveLhs => {
                let w = vm.stack.pop().unwrap();
                vm.lhs.push(w);
            }
            Op::RestoreLhs => {
                let w = vm.lhs.pop().unwrap();
                vm.stack.push(w);
            }
            Op::SaveRet => {
                let w = vm.stack.pop().unwrap();
                vm.stack[vm.frame + FR_RV] = w;
            }

            // --- Field access ---
            Op::GetFieldR => {
                let attr = read_u16(prog.rtd.code, &mut vm.ip);
                let holder = vm.stack.pop().unwrap().as_tree().expect("GetFieldR: nil holder");
                let value = node::get_attr(&prog.kids, &prog.trees, holder, attr);
                upref(&mut prog.trees, value);
                vm.stack.push(Word::Tree(Some(holder)));
                vm.stack.push(Word::Tree(Some(value)));
            }
            Op::SetFieldWc => {
                let attr = read_u16(prog.rtd.code, &mut vm.ip);
                let value = vm.stack.pop().unwrap().as_tree().expect("SetFieldWc: nil value");
                let holder = vm.stack.pop().unwrap().as_tree().expect("SetFieldWc: nil holder");
                let holder = crate::tree::split::split(&mut prog.trees, &mut prog.kids, holder);
                let old = node::get_attr(&prog.kids, &prog.trees, holder, attr);
                node::set_attr(&mut prog.kids, &prog.trees, holder, attr, value);
                downref_word(prog, Word::Tree(Some(old)));
                vm.stack.push(Word::Tree(Some(holder)));
            }
            Op::SetFieldWv => {
                let attr = read_u16(prog.rtd.code, &mut vm.ip);
                let value = vm.stack.pop().unwrap().as_tree().expect("SetFieldWv: nil value");
                let holder = vm.stack.pop().unwrap().as_tree().expect("SetFieldWv: nil holder");
                let holder = crate::tree::split::split(&mut prog.trees, &mut prog.kids, holder);
                let old = node::get_attr(&prog.kids, &prog.trees, holder, attr);
                node::set_attr(&mut prog.kids, &prog.trees, holder, attr, value);
                upref(&mut prog.trees, old);
                vm.rcode.append(UndoRecord::SetField { tree: holder, attr, old_value: old });
                vm.stack.push(Word::Tree(Some(holder)));
            }
            Op::SetFieldBkt => unreachable!("reverse execution never re-enters the dispatcher"),

            // --- Locals & globals ---
            Op::GetLocalR => {
                let slot = read_u16(prog.rtd.code, &mut vm.ip) as usize;
                let w = locals(vm)[slot];
                let copy = upref_word(prog, w);
                vm.stack.push(copy);
            }
            Op::SetLocalWc => {
                let slot = read_u16(prog.rtd.code, &mut vm.ip) as usize;
                let value = vm.stack.pop().unwrap();
                let old = std::mem::replace(&mut locals_mut(vm)[slot], value);
                downref_word(prog, old);
            }
            Op::SetLocalWv => {
                let slot = read_u16(prog.rtd.code, &mut vm.ip) as usize;
                let value = vm.stack.pop().unwrap();
                let old = std::mem::replace(&mut locals_mut(vm)[slot], value);
                vm.rcode.append(UndoRecord::SetLocal { slot, old_value: old });
            }
            Op::SetLocalBkt => unreachable!("reverse execution never re-enters the dispatcher"),
            Op::GetGlobalR => {
                let slot = read_u16(prog.rtd.code, &mut vm.ip) as usize;
                let w = prog.globals[slot];
                let copy = upref_word(prog, w);
                vm.stack.push(copy);
            }
            Op::SetGlobalWc => {
                let slot = read_u16(prog.rtd.code, &mut vm.ip) as usize;
                let value = vm.stack.pop().unwrap();
                let old = std::mem::replace(&mut prog.globals[slot], value);
                downref_word(prog, old);
            }
            Op::SetGlobalWv => {
                let slot = read_u16(prog.rtd.code, &mut vm.ip) as usize;
                let value = vm.stack.pop().unwrap();
                let old = std::mem::replace(&mut prog.globals[slot], value);
                vm.rcode.append(UndoRecord::SetGlobal { slot, old_value: old });
            }
            Op::SetGlobalBkt => unreachable!("reverse execution never re-enters the dispatcher"),

            // --- References ---
            Op::RefFromLocal => {
                let slot = read_u16(prog.rtd.code, &mut vm.ip) as usize;
                let root_tree = locals(vm)[slot].as_tree().expect("RefFromLocal: nil local");
                let handle = ref_from_root(prog, RefRoot::Local(slot), root_tree);
                let id = prog.ref_chains.allocate(handle);
                vm.stack.push(Word::Ref(id));
            }
            Op::RefFromQual => {
                let slot = read_u16(prog.rtd.code, &mut vm.ip) as usize;
                let root_tree = prog.globals[slot].as_tree().expect("RefFromQual: nil global");
                let handle = ref_from_root(prog, RefRoot::Global(slot), root_tree);
                let id = prog.ref_chains.allocate(handle);
                vm.stack.push(Word::Ref(id));
            }
            Op::RefFromRef => {
                let attr = read_u16(prog.rtd.code, &mut vm.ip);
                let parent_id = vm.stack.pop().unwrap().as_ref_handle();
                let mut handle = prog.ref_chains.free(parent_id);
                let leaf_kid = handle.chain.leaf().expect("RefFromRef: empty chain");
                let leaf_tree = prog.kids.get(leaf_kid.0).tree();
                let next_kid = node::attr_slot(&prog.kids, &prog.trees, leaf_tree, attr);
                handle.chain.push(next_kid);
                let id = prog.ref_chains.allocate(handle);
                vm.stack.push(Word::Ref(id));
            }
            Op::DerefR => {
                let id = vm.stack.pop().unwrap().as_ref_handle();
                let mut handle = prog.ref_chains.free(id);
                crate::tree::split::split_ref(&mut prog.trees, &mut prog.kids, &mut handle.chain);
                reconcile_ref_root(prog, locals_mut(vm), &handle);
                let leaf = handle.chain.leaf().expect("DerefR: empty chain");
                let value = prog.kids.get(leaf.0).tree();
                upref(&mut prog.trees, value);
                free_ref_handle(prog, handle);
                vm.stack.push(Word::Tree(Some(value)));
            }
            Op::DerefWc => {
                let id = vm.stack.pop().unwrap().as_ref_handle();
                let value = vm.stack.pop().unwrap().as_tree().expect("DerefWc: nil value");
                let mut handle = prog.ref_chains.free(id);
                crate::tree::split::split_ref(&mut prog.trees, &mut prog.kids, &mut handle.chain);
                reconcile_ref_root(prog, locals_mut(vm), &handle);
                let leaf = handle.chain.leaf().expect("DerefWc: empty chain");
                let old = prog.kids.get(leaf.0).tree();
                prog.kids.get_mut(leaf.0).payload = KidPayload::Child(value);
                downref_word(prog, Word::Tree(Some(old)));
                free_ref_handle(prog, handle);
            }
            Op::DerefWv => {
                let id = vm.stack.pop().unwrap().as_ref_handle();
                let value = vm.stack.pop().unwrap().as_tree().expect("DerefWv: nil value");
                let mut handle = prog.ref_chains.free(id);
                crate::tree::split::split_ref(&mut prog.trees, &mut prog.kids, &mut handle.chain);
                reconcile_ref_root(prog, locals_mut(vm), &handle);
                let leaf = handle.chain.leaf().expect("DerefWv: empty chain");
                let old = prog.kids.get(leaf.0).tree();
                prog.kids.get_mut(leaf.0).payload = KidPayload::Child(value);
                upref(&mut prog.trees, old);
                vm.rcode.append(UndoRecord::SetKid { kid: leaf, old_tree: old });
                free_ref_handle(prog, handle);
            }
            Op::DerefBkt => unreachable!("reverse execution never re-enters the dispatcher"),

            // --- Iterators ---
            Op::IterCreateForward | Op::IterCreateForwardRepeat => {
                let search_id = decode_search_id(read_u64(prog.rtd.code, &mut vm.ip));
                let root_tree = vm.stack.pop().unwrap().as_tree();
                let stack_root = vm.stack.len();
                let (kid_root, synth, owned) = match root_tree {
                    None => (None, None, None),
                    Some(t) => {
                        upref(&mut prog.trees, t);
                        let k = make_iter_root_kid(prog, t);
                        (Some(k), Some(k), Some(t))
                    }
                };
                let iter = if op == Op::IterCreateForward {
                    crate::iter::TreeIter::forward(search_id, kid_root, stack_root)
                } else {
                    crate::iter::TreeIter::forward_repeat(search_id, kid_root, stack_root)
                };
                let id = prog.iters.allocate((iter, owned, synth));
                vm.stack.push(Word::Iter(id));
            }
            Op::IterCreateReverseRepeat => {
                let search_id = decode_search_id(read_u64(prog.rtd.code, &mut vm.ip));
                let root_tree = vm.stack.pop().unwrap().as_tree();
                let stack_root = vm.stack.len();
                let (kid_root, owned) = match root_tree {
                    None => (None, None),
                    Some(t) => {
                        upref(&mut prog.trees, t);
                        (Some(make_iter_root_kid(prog, t)), Some(t))
                    }
                };
                let iter = crate::iter::TreeIter::reverse_repeat(&prog.trees, &prog.kids, search_id, kid_root, stack_root);
                if let Some(k) = kid_root {
                    prog.kids.free(k.0);
                }
                let id = prog.iters.allocate((iter, owned, None));
                vm.stack.push(Word::Iter(id));
            }
            Op::IterCreateReverseChild => {
                let search_id = decode_search_id(read_u64(prog.rtd.code, &mut vm.ip));
                let root_tree = vm.stack.pop().unwrap().as_tree();
                let t = root_tree.expect("IterCreateReverseChild: nil parent");
                upref(&mut prog.trees, t);
                let stack_root = vm.stack.len();
                let iter = crate::iter::TreeIter::reverse_child(&prog.trees, &prog.kids, search_id, t, stack_root);
                let id = prog.iters.allocate((iter, Some(t), None));
                vm.stack.push(Word::Iter(id));
            }
            Op::IterAdvance | Op::IterNextChild => {
                let id = vm.stack.pop().unwrap().as_iter();
                let (iter, _, _) = prog.iters.get_mut(id);
                let next = crate::iter::advance(iter, &prog.trees, &prog.kids);
                vm.stack.push(Word::Bool(next.is_some()));
            }
            Op::IterGetCurR => {
                let id = vm.stack.pop().unwrap().as_iter();
                let (iter, _, _) = prog.iters.get(id);
                let cur = crate::iter::current(iter, &prog.kids);
                if let Some(t) = cur {
                    upref(&mut prog.trees, t);
                }
                vm.stack.push(Word::Tree(cur));
            }
            Op::IterGetCurWc => {
                let id = vm.stack.pop().unwrap().as_iter();
                let (iter, _, _) = prog.iters.get_mut(id);
                let split = crate::iter::split_current(&mut prog.trees, &mut prog.kids, iter);
                upref(&mut prog.trees, split);
                vm.stack.push(Word::Tree(Some(split)));
            }
            Op::IterSetCur => {
                let id = vm.stack.pop().unwrap().as_iter();
                let value = vm.stack.pop().unwrap().as_tree().expect("IterSetCur: nil value");
                let (iter, _, _) = prog.iters.get_mut(id);
                crate::iter::set_current(&mut prog.trees, &mut prog.kids, &mut prog.list_els, &mut prog.map_els, iter, value);
            }
            Op::IterDestroy => {
                let id = vm.stack.pop().unwrap().as_iter();
                let (_, owned, synth) = prog.iters.free(id);
                if let Some(k) = synth {
                    prog.kids.free(k.0);
                }
                if let Some(t) = owned {
                    let mut work = Vec::new();
                    downref(&mut prog.trees, &mut prog.kids, &mut prog.list_els, &mut prog.map_els, &mut work, t);
                }
            }
            Op::UiterCreate => {
                let nargs = read_u16(prog.rtd.code, &mut vm.ip) as usize;
                let entry = read_u64(prog.rtd.code, &mut vm.ip) as usize;
                let mut args = Vec::with_capacity(nargs);
                for _ in 0..nargs {
                    args.push(vm.stack.pop().unwrap());
                }
                args.reverse();
                let mut sub = Vm::new(entry);
                sub.stack = args;
                let base = push_iter_frame(&mut sub.stack, 0, entry);
                sub.frame = base;
                sub.iframe = base;
                let id = prog.user_iters.allocate(UserIterState { vm: sub, done: false });
                vm.stack.push(Word::UserIter(id));
            }
            Op::UiterAdvance => {
                let id = vm.stack.pop().unwrap().as_user_iter();
                let mut state = prog.user_iters.free(id);
                if state.done {
                    prog.user_iters.allocate(state);
                    vm.stack.push(Word::Tree(None));
                    vm.stack.push(Word::Bool(false));
                } else {
                    match run(prog, &mut state.vm)? {
                        StopReason::Yielded => {
                            let value = state.vm.stack.pop().unwrap();
                            let reused = prog.user_iters.allocate(state);
                            debug_assert_eq!(reused, id, "user-iter pool slot must be reclaimed immediately");
                            vm.stack.push(value);
                            vm.stack.push(Word::Bool(true));
                        }
                        StopReason::Halted => {
                            state.done = true;
                            let reused = prog.user_iters.allocate(state);
                            debug_assert_eq!(reused, id, "user-iter pool slot must be reclaimed immediately");
                            vm.stack.push(Word::Tree(None));
                            vm.stack.push(Word::Bool(false));
                        }
                    }
                }
            }
            Op::UiterDestroy => {
                let id = vm.stack.pop().unwrap().as_user_iter();
                let mut state = prog.user_iters.free(id);
                while let Some(w) = state.vm.stack.pop() {
                    downref_word(prog, w);
                }
            }

            // --- Containers: Map ---
            Op::MapLength => {
                let holder = vm.stack.pop().unwrap().as_tree().expect("MapLength: nil map");
                let len = match prog.trees.get(holder.0).payload {
                    Payload::Map { len, .. } => len,
                    other => panic!("expected a Map payload, found {other:?}"),
                };
                vm.stack.push(Word::Tree(Some(holder)));
                vm.stack.push(Word::Int(len as i64));
            }
            Op::MapFind => {
                let key = vm.stack.pop().unwrap().as_tree().expect("MapFind: nil key");
                let holder = vm.stack.pop().unwrap().as_tree().expect("MapFind: nil map");
                let root = match prog.trees.get(holder.0).payload {
                    Payload::Map { root, .. } => root,
                    other => panic!("expected a Map payload, found {other:?}"),
                };
                let found = map::find(&prog.trees, &prog.kids, &prog.map_els, root, key);
                if let Some(v) = found {
                    upref(&mut prog.trees, v);
                }
                downref_word(prog, Word::Tree(Some(key)));
                vm.stack.push(Word::Tree(Some(holder)));
                vm.stack.push(Word::Tree(found));
            }
            Op::MapInsertWc | Op::MapInsertWv => {
                let value = vm.stack.pop().unwrap().as_tree().expect("MapInsert: nil value");
                let key = vm.stack.pop().unwrap().as_tree().expect("MapInsert: nil key");
                let holder = vm.stack.pop().unwrap().as_tree().expect("MapInsert: nil map");
                let holder = split_tree_deep(prog, holder);
                let (root, len) = map_header_mut(prog, holder);
                let inserted = map::insert(&mut prog.trees, &prog.kids, &mut prog.map_els, root, len, key, value);
                downref_word(prog, Word::Tree(Some(key)));
                downref_word(prog, Word::Tree(Some(value)));
                if op == Op::MapInsertWv && inserted {
                    vm.rcode.append(UndoRecord::MapInsert { map_tree: holder, key });
                }
                vm.stack.push(Word::Tree(Some(holder)));
                vm.stack.push(Word::Bool(inserted));
            }
            Op::MapInsertBkt => unreachable!("reverse execution never re-enters the dispatcher"),
            Op::MapStoreWc | Op::MapStoreWv => {
                let value = vm.stack.pop().unwrap().as_tree().expect("MapStore: nil value");
                let key = vm.stack.pop().unwrap().as_tree().expect("MapStore: nil key");
                let holder = vm.stack.pop().unwrap().as_tree().expect("MapStore: nil map");
                let holder = split_tree_deep(prog, holder);
                let (root, len) = map_header_mut(prog, holder);
                let old = map::store(&mut prog.trees, &prog.kids, &mut prog.map_els, root, len, key, value);
                downref_word(prog, Word::Tree(Some(key)));
                downref_word(prog, Word::Tree(Some(value)));
                if op == Op::MapStoreWv {
                    if let Some(v) = old {
                        upref(&mut prog.trees, v);
                    }
                    vm.rcode.append(UndoRecord::MapStore { map_tree: holder, key, old_value: old });
                } else if let Some(v) = old {
                    downref_word(prog, Word::Tree(Some(v)));
                }
                vm.stack.push(Word::Tree(Some(holder)));
            }
            Op::MapStoreBkt => unreachable!("reverse execution never re-enters the dispatcher"),
            Op::MapRemoveWc | Op::MapRemoveWv => {
                let key = vm.stack.pop().unwrap().as_tree().expect("MapRemove: nil key");
                let holder = vm.stack.pop().unwrap().as_tree().expect("MapRemove: nil map");
                let holder = split_tree_deep(prog, holder);
                let (root, len) = map_header_mut(prog, holder);
                let evicted = map::remove(&mut prog.trees, &prog.kids, &mut prog.map_els, root, len, key);
                downref_word(prog, Word::Tree(Some(key)));
                let result = match evicted {
                    Some((k, v)) => {
                        downref_word(prog, Word::Tree(Some(k)));
                        if op == Op::MapRemoveWv {
                            upref(&mut prog.trees, v);
                            vm.rcode.append(UndoRecord::MapRemove { map_tree: holder, key, value: v });
                        }
                        Some(v)
                    }
                    None => None,
                };
                vm.stack.push(Word::Tree(Some(holder)));
                vm.stack.push(Word::Tree(result));
            }
            Op::MapRemoveBkt => unreachable!("reverse execution never re-enters the dispatcher"),

            // --- Containers: List ---
            Op::ListLength => {
                let holder = vm.stack.pop().unwrap().as_tree().expect("ListLength: nil list");
                let len = match prog.trees.get(holder.0).payload {
                    Payload::List { len, .. } => len,
                    other => panic!("expected a List payload, found {other:?}"),
                };
                vm.stack.push(Word::Tree(Some(holder)));
                vm.stack.push(Word::Int(len as i64));
            }
            Op::ListAppend => {
                let value = vm.stack.pop().unwrap().as_tree().expect("ListAppend: nil value");
                let holder = vm.stack.pop().unwrap().as_tree().expect("ListAppend: nil list");
                let holder = split_tree_deep(prog, holder);
                let (head, tail, len) = list_header_mut(prog, holder);
                list::append(&mut prog.trees, &mut prog.list_els, head, tail, len, value);
                downref_word(prog, Word::Tree(Some(value)));
                vm.rcode.append(UndoRecord::ListAppend { list_tree: holder });
                vm.stack.push(Word::Tree(Some(holder)));
            }
            Op::ListRemoveEnd => {
                let holder = vm.stack.pop().unwrap().as_tree().expect("ListRemoveEnd: nil list");
                let holder = split_tree_deep(prog, holder);
                let (head, tail, len) = list_header_mut(prog, holder);
                let popped = list::remove_end(&mut prog.list_els, head, tail, len);
                if let Some(v) = popped {
                    upref(&mut prog.trees, v);
                    vm.rcode.append(UndoRecord::ListRemoveEnd { list_tree: holder, value: v });
                }
                vm.stack.push(Word::Tree(Some(holder)));
                vm.stack.push(Word::Tree(popped));
            }
            Op::ListGet => {
                let position = read_u16(prog.rtd.code, &mut vm.ip) as u32;
                let holder = vm.stack.pop().unwrap().as_tree().expect("ListGet: nil list");
                let (head, tail) = match prog.trees.get(holder.0).payload {
                    Payload::List { head, tail, .. } => (head, tail),
                    other => panic!("expected a List payload, found {other:?}"),
                };
                let found = list::get(&prog.list_els, head, tail, position);
                if let Some(t) = found {
                    upref(&mut prog.trees, t);
                }
                vm.stack.push(Word::Tree(Some(holder)));
                vm.stack.push(Word::Tree(found));
            }
            Op::ListSet => {
                let position = read_u16(prog.rtd.code, &mut vm.ip) as u32;
                let value = vm.stack.pop().unwrap().as_tree().expect("ListSet: nil value");
                let holder = vm.stack.pop().unwrap().as_tree().expect("ListSet: nil list");
                let holder = split_tree_deep(prog, holder);
                let (head, tail) = match prog.trees.get(holder.0).payload {
                    Payload::List { head, tail, .. } => (head, tail),
                    other => panic!("expected a List payload, found {other:?}"),
                };
                let old = list::set(&mut prog.list_els, head, tail, position, value);
                upref(&mut prog.trees, old);
                vm.rcode.append(UndoRecord::ListSet { list_tree: holder, position, old_value: old });
                vm.stack.push(Word::Tree(Some(holder)));
            }

            // --- String ops ---
            Op::StrLength => {
                let holder = vm.stack.pop().unwrap().as_tree().expect("StrLength: nil string");
                let len = prog.trees.get(holder.0).tokdata.as_deref().unwrap_or("").len();
                vm.stack.push(Word::Tree(Some(holder)));
                vm.stack.push(Word::Int(len as i64));
            }
            Op::StrConcat => {
                let b = vm.stack.pop().unwrap().as_tree().expect("StrConcat: nil rhs");
                let a = vm.stack.pop().unwrap().as_tree().expect("StrConcat: nil lhs");
                let mut s = prog.trees.get(a.0).tokdata.clone().unwrap_or_default();
                s.push_str(prog.trees.get(b.0).tokdata.as_deref().unwrap_or(""));
                downref_word(prog, Word::Tree(Some(a)));
                downref_word(prog, Word::Tree(Some(b)));
                let t = TreeId(prog.trees.allocate(Tree::string(s)));
                vm.stack.push(Word::Tree(Some(t)));
            }
            Op::StrAtoi => {
                let holder = vm.stack.pop().unwrap().as_tree().expect("StrAtoi: nil string");
                let v: i64 = prog.trees.get(holder.0).tokdata.as_deref().unwrap_or("0").parse().expect("StrAtoi: not an integer literal");
                downref_word(prog, Word::Tree(Some(holder)));
                vm.stack.push(Word::Int(v));
            }
            Op::ParseU8 | Op::ParseU16 | Op::ParseU32 | Op::ParseI8 | Op::ParseI16 | Op::ParseI32 => {
                let holder = vm.stack.pop().unwrap().as_tree().expect("Parse*: nil string");
                let text = prog.trees.get(holder.0).tokdata.as_deref().unwrap_or("0");
                let v: i64 = match op {
                    Op::ParseU8 => text.parse::<u8>().expect("ParseU8: out of range") as i64,
                    Op::ParseU16 => text.parse::<u16>().expect("ParseU16: out of range") as i64,
                    Op::ParseU32 => text.parse::<u32>().expect("ParseU32: out of range") as i64,
                    Op::ParseI8 => text.parse::<i8>().expect("ParseI8: out of range") as i64,
                    Op::ParseI16 => text.parse::<i16>().expect("ParseI16: out of range") as i64,
                    Op::ParseI32 => text.parse::<i32>().expect("ParseI32: out of range") as i64,
                    _ => unreachable!(),
                };
                downref_word(prog, Word::Tree(Some(holder)));
                vm.stack.push(Word::Int(v));
            }
            Op::IntToStr => {
                let v = vm.stack.pop().unwrap().as_int();
                let t = TreeId(prog.trees.allocate(Tree::string(v.to_string())));
                vm.stack.push(Word::Tree(Some(t)));
            }
            Op::StrUpper | Op::StrLower => {
                let holder = vm.stack.pop().unwrap().as_tree().expect("StrUpper/Lower: nil string");
                let text = prog.trees.get(holder.0).tokdata.as_deref().unwrap_or("");
                let s = if op == Op::StrUpper { text.to_uppercase() } else { text.to_lowercase() };
                downref_word(prog, Word::Tree(Some(holder)));
                let t = TreeId(prog.trees.allocate(Tree::string(s)));
                vm.stack.push(Word::Tree(Some(t)));
            }
            Op::Sprintf => {
                let nargs = read_u16(prog.rtd.code, &mut vm.ip) as usize;
                let mut raw_args = Vec::with_capacity(nargs);
                for _ in 0..nargs {
                    raw_args.push(vm.stack.pop().unwrap());
                }
                raw_args.reverse();
                let mut args = Vec::with_capacity(nargs);
                for w in raw_args {
                    match w {
                        Word::Int(v) => args.push(FmtArg::Int(v)),
                        Word::Bool(b) => args.push(FmtArg::Int(b as i64)),
                        Word::Tree(Some(t)) => {
                            args.push(FmtArg::Str(prog.trees.get(t.0).tokdata.clone().unwrap_or_default()));
                            downref_word(prog, Word::Tree(Some(t)));
                        }
                        other => panic!("Sprintf: unsupported argument {other:?}"),
                    }
                }
                let fmt_holder = vm.stack.pop().unwrap().as_tree().expect("Sprintf: nil format string");
                let fmt = prog.trees.get(fmt_holder.0).tokdata.clone().unwrap_or_default();
                downref_word(prog, Word::Tree(Some(fmt_holder)));
                let s = format_sprintf(&fmt, &args);
                let t = TreeId(prog.trees.allocate(Tree::string(s)));
                vm.stack.push(Word::Tree(Some(t)));
            }

            // --- Tree construction ---
            Op::TreeNew => {
                let id = read_u64(prog.rtd.code, &mut vm.ip) as u32;
                let attr_len = prog.rtd.object_length(id);
                let mut tree = Tree::new(id);
                tree.child = node::alloc_attrs(&mut prog.trees, &mut prog.kids, attr_len, None);
                let t = TreeId(prog.trees.allocate(tree));
                vm.stack.push(Word::Tree(Some(t)));
            }
            Op::CreateToken => {
                let id = read_u64(prog.rtd.code, &mut vm.ip) as u32;
                let str_idx = read_u16(prog.rtd.code, &mut vm.ip) as usize;
                let mut tree = Tree::new(id);
                tree.tokdata = Some(prog.rtd.strings[str_idx].to_string());
                let t = TreeId(prog.trees.allocate(tree));
                vm.stack.push(Word::Tree(Some(t)));
            }
            Op::MakeTree => {
                let nargs = read_u16(prog.rtd.code, &mut vm.ip) as usize;
                let mut children = Vec::with_capacity(nargs);
                for _ in 0..nargs {
                    children.push(vm.stack.pop().unwrap().as_tree());
                }
                let id = vm.stack.pop().unwrap().as_int() as u32;
                let mut tail = None;
                for child in children {
                    let child = child.unwrap_or_else(|| nil_tree(prog));
                    let slot = prog.kids.allocate(Kid::child(child, tail));
                    tail = Some(KidId(slot));
                }
                let mut tree = Tree::new(id);
                tree.child = tail;
                let t = TreeId(prog.trees.allocate(tree));
                vm.stack.push(Word::Tree(Some(t)));
            }
            Op::MakeToken => {
                let text_tree = vm.stack.pop().unwrap().as_tree().expect("MakeToken: nil text");
                let text = prog.trees.get(text_tree.0).tokdata.clone().unwrap_or_default();
                downref_word(prog, Word::Tree(Some(text_tree)));
                let id = vm.stack.pop().unwrap().as_int() as u32;
                let mut tree = Tree::new(id);
                tree.tokdata = Some(text);
                let t = TreeId(prog.trees.allocate(tree));
                vm.stack.push(Word::Tree(Some(t)));
            }
            Op::InitCaptures => {
                let n = read_u16(prog.rtd.code, &mut vm.ip) as usize;
                vm.captures = vec![None; n];
            }
            Op::InitRhsEl => {
                let bind_id = read_u16(prog.rtd.code, &mut vm.ip) as usize;
                let value = vm.stack.pop().unwrap().as_tree().expect("InitRhsEl: nil capture");
                vm.captures[bind_id] = Some(value);
            }
            Op::Construct | Op::ConstructTerm => {
                let repl_index = read_u64(prog.rtd.code, &mut vm.ip) as u32;
                let bindings: Vec<TreeId> = vm.captures.iter().map(|c| c.unwrap_or(TreeId(0))).collect();
                let head = crate::tree::pattern::construct_replacement(
                    &mut prog.trees,
                    &mut prog.kids,
                    prog.rtd.replacements,
                    |id| prog.rtd.object_length(id),
                    Some(repl_index),
                    &bindings,
                );
                let result = head.map(|k| {
                    let t = prog.kids.get(k.0).tree();
                    prog.kids.free(k.0);
                    t
                });
                vm.captures.clear();
                vm.stack.push(Word::Tree(result));
            }
            Op::TreeSearch => {
                let raw = read_u64(prog.rtd.code, &mut vm.ip);
                let search_id = decode_search_id(raw);
                let root = vm.stack.pop().unwrap().as_tree();
                let result = root.and_then(|r| tree_search(&prog.trees, &prog.kids, r, search_id));
                if let Some(t) = result {
                    upref(&mut prog.trees, t);
                }
                vm.stack.push(Word::Tree(result));
            }
            Op::TreeToStr => {
                let holder = vm.stack.pop().unwrap().as_tree().expect("TreeToStr: nil tree");
                let s = crate::print::tree_to_string(prog, holder);
                downref_word(prog, Word::Tree(Some(holder)));
                let t = TreeId(prog.trees.allocate(Tree::string(s)));
                vm.stack.push(Word::Tree(Some(t)));
            }

            // --- I/O ---
            Op::Print | Op::PrintXmlAc | Op::PrintXmlSkeleton => {
                let holder = vm.stack.pop().unwrap().as_tree().expect("Print*: nil tree");
                let mode = match op {
                    Op::Print => crate::print::PrintMode::Plain,
                    Op::PrintXmlAc => crate::print::PrintMode::XmlComments,
                    Op::PrintXmlSkeleton => crate::print::PrintMode::XmlSkeleton,
                    _ => unreachable!(),
                };
                crate::print::print_tree(prog, &mut std::io::stdout(), holder, mode)?;
                downref_word(prog, Word::Tree(Some(holder)));
            }
            Op::PrintStream => {
                let value = vm.stack.pop().unwrap().as_tree().expect("PrintStream: nil tree");
                let stream_holder = vm.stack.pop().unwrap().as_tree().expect("PrintStream: nil stream");
                let stream_id = stream_id_of(prog, stream_holder);
                with_stream(prog, stream_id.0, |prog, w| crate::print::print_tree(prog, w, value, crate::print::PrintMode::Plain))?;
                downref_word(prog, Word::Tree(Some(value)));
                downref_word(prog, Word::Tree(Some(stream_holder)));
            }
            Op::OpenFile => {
                let mode = read_u8(prog.rtd.code, &mut vm.ip);
                let path_holder = vm.stack.pop().unwrap().as_tree().expect("OpenFile: nil path");
                let path = prog.trees.get(path_holder.0).tokdata.clone().unwrap_or_default();
                downref_word(prog, Word::Tree(Some(path_holder)));
                let file: Box<dyn crate::external::StreamIo> = match mode {
                    0 => Box::new(std::fs::File::open(&path)?),
                    1 => Box::new(std::fs::File::create(&path)?),
                    other => return Err(MeldError::BadOpenMode { mode: other.to_string() }),
                };
                let stream_id = prog.streams.allocate(file);
                let t = TreeId(prog.trees.allocate(Tree { payload: Payload::Stream(crate::external::StreamId(stream_id)), ..Tree::new(node::LEL_ID_STREAM) }));
                vm.stack.push(Word::Tree(Some(t)));
            }
            Op::GetStdin | Op::GetStdout | Op::GetStderr => {
                let io: Box<dyn crate::external::StreamIo> = match op {
                    Op::GetStdin => Box::new(StdioDuplex::stdin()),
                    Op::GetStdout => Box::new(StdioDuplex::stdout()),
                    Op::GetStderr => Box::new(StdioDuplex::stderr()),
                    _ => unreachable!(),
                };
                let stream_id = prog.streams.allocate(io);
                let t = TreeId(prog.trees.allocate(Tree { payload: Payload::Stream(crate::external::StreamId(stream_id)), ..Tree::new(node::LEL_ID_STREAM) }));
                vm.stack.push(Word::Tree(Some(t)));
            }
            Op::LoadArgv => {
                let idx = vm.stack.pop().unwrap().as_int();
                let idx = usize::try_from(idx).map_err(|_| MeldError::ArgvOutOfRange(idx as usize))?;
                let arg = prog.argv.get(idx).cloned().ok_or(MeldError::ArgvOutOfRange(idx))?;
                let t = TreeId(prog.trees.allocate(Tree::string(arg)));
                vm.stack.push(Word::Tree(Some(t)));
            }

            // --- Parsing ---
            Op::ParseFragWc | Op::ParseFragWv => {
                let lang_el_id = read_u64(prog.rtd.code, &mut vm.ip) as u32;
                let text_holder = vm.stack.pop().unwrap().as_tree().expect("ParseFrag*: nil text");
                let holder = vm.stack.pop().unwrap().as_tree().expect("ParseFrag*: nil accum");
                let text = prog.trees.get(text_holder.0).tokdata.clone().unwrap_or_default();
                downref_word(prog, Word::Tree(Some(text_holder)));
                let accum_id = accum_id_of(prog, holder);
                let committed = prog.accums.get_mut(accum_id.0).driver.feed(lang_el_id, &text)?;
                vm.stack.push(Word::Tree(Some(holder)));
                vm.stack.push(Word::Bool(committed));
            }
            Op::ParseFragBkt => unreachable!("reverse execution never re-enters the dispatcher"),
            Op::ParseFinishWc | Op::ParseFinishWv => {
                let holder = vm.stack.pop().unwrap().as_tree().expect("ParseFinish*: nil accum");
                let accum_id = accum_id_of(prog, holder);
                let acc = prog.accums.free(accum_id.0);
                let stream = accum::destroy_accum(prog, acc)?;
                downref_word(prog, Word::Tree(Some(holder)));
                vm.stack.push(Word::Tree(Some(stream)));
            }
            Op::ParseFinishBkt => unreachable!("reverse execution never re-enters the dispatcher"),
            Op::StreamPullR => {
                let holder = vm.stack.pop().unwrap().as_tree().expect("StreamPullR: nil accum");
                let accum_id = accum_id_of(prog, holder);
                let stream_tree = prog.accums.get(accum_id.0).stream;
                let stream_id = stream_id_of(prog, stream_tree);
                let token = prog.accums.get_mut(accum_id.0).scanner.next_token(stream_id)?;
                let result = token.map(|(id, text)| {
                    let mut tree = Tree::new(id);
                    tree.tokdata = Some(text);
                    TreeId(prog.trees.allocate(tree))
                });
                vm.stack.push(Word::Tree(Some(holder)));
                vm.stack.push(Word::Tree(result));
            }
            Op::StreamPullBkt => unreachable!("reverse execution never re-enters the dispatcher"),
            Op::StreamPushWv | Op::StreamPushIgnoreWv => {
                let token_holder = vm.stack.pop().unwrap().as_tree().expect("StreamPush*: nil token");
                let holder = vm.stack.pop().unwrap().as_tree().expect("StreamPush*: nil accum");
                let accum_id = accum_id_of(prog, holder);
                let stream_tree = prog.accums.get(accum_id.0).stream;
                let stream_id = stream_id_of(prog, stream_tree);
                let (lang_el_id, text) = {
                    let t = prog.trees.get(token_holder.0);
                    (t.id, t.tokdata.clone().unwrap_or_default())
                };
                prog.accums.get_mut(accum_id.0).scanner.push_back(stream_id, lang_el_id, &text)?;
                downref_word(prog, Word::Tree(Some(token_holder)));
                vm.stack.push(Word::Tree(Some(holder)));
            }
            Op::StreamPushBkt => unreachable!("reverse execution never re-enters the dispatcher"),
            Op::StreamAppendWc | Op::StreamAppendWv => {
                let text_holder = vm.stack.pop().unwrap().as_tree().expect("StreamAppend*: nil text");
                let stream_holder = vm.stack.pop().unwrap().as_tree().expect("StreamAppend*: nil stream");
                let text = prog.trees.get(text_holder.0).tokdata.clone().unwrap_or_default();
                downref_word(prog, Word::Tree(Some(text_holder)));
                let stream_id = stream_id_of(prog, stream_holder);
                with_stream(prog, stream_id.0, |_prog, w| w.write_all(text.as_bytes()))?;
                vm.stack.push(Word::Tree(Some(stream_holder)));
            }
            Op::StreamAppendBkt => unreachable!("reverse execution never re-enters the dispatcher"),
            Op::ExtractInput | Op::LoadInputR => {
                let holder = vm.stack.pop().unwrap().as_tree().expect("LoadInputR/ExtractInput: nil accum");
                let accum_id = accum_id_of(prog, holder);
                let stream = prog.accums.get(accum_id.0).stream;
                upref(&mut prog.trees, stream);
                vm.stack.push(Word::Tree(Some(holder)));
                vm.stack.push(Word::Tree(Some(stream)));
            }
            Op::SetInput | Op::LoadInputWc => {
                let new_stream = vm.stack.pop().unwrap().as_tree().expect("SetInput/LoadInputWc: nil stream");
                let holder = vm.stack.pop().unwrap().as_tree().expect("SetInput/LoadInputWc: nil accum");
                let accum_id = accum_id_of(prog, holder);
                let old = std::mem::replace(&mut prog.accums.get_mut(accum_id.0).stream, new_stream);
                downref_word(prog, Word::Tree(Some(old)));
                vm.stack.push(Word::Tree(Some(holder)));
            }
            Op::LoadInputWv => {
                let new_stream = vm.stack.pop().unwrap().as_tree().expect("LoadInputWv: nil stream");
                let holder = vm.stack.pop().unwrap().as_tree().expect("LoadInputWv: nil accum");
                let accum_id = accum_id_of(prog, holder);
                let old = std::mem::replace(&mut prog.accums.get_mut(accum_id.0).stream, new_stream);
                upref(&mut prog.trees, old);
                vm.rcode.append(UndoRecord::AccumSetStream { accum: accum_id, old_stream: old });
                vm.stack.push(Word::Tree(Some(holder)));
            }
            Op::LoadInputBkt => unreachable!("reverse execution never re-enters the dispatcher"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::program::{GenericInfo, LangElInfo, RuntimeData};
    use crate::trace::Verbosity;

    fn leak_code(bytes: Vec<u8>) -> &'static [u8] {
        Box::leak(bytes.into_boxed_slice())
    }

    fn push_u64(buf: &mut Vec<u8>, v: u64) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    fn push_u16(buf: &mut Vec<u8>, v: u16) {
        buf.extend_from_slice(&v.to_le_bytes());
    }

    fn empty_rtd(code: &'static [u8]) -> &'static RuntimeData {
        Box::leak(Box::new(RuntimeData {
            lang_el_info: &[] as &'static [LangElInfo],
            generic_info: &[] as &'static [GenericInfo],
            strings: &[],
            patterns: &[],
            replacements: &[],
            code_entries: &[],
            code,
        }))
    }

    #[test]
    fn integer_arithmetic_round_trips() {
        // push 2, push 3, add, halt
        let mut code = vec![Op::LoadInt as u8];
        push_u64(&mut code, 2);
        code.push(Op::LoadInt as u8);
        push_u64(&mut code, 3);
        code.push(Op::AddInt as u8);
        code.push(Op::Halt as u8);
        let rtd = empty_rtd(leak_code(code));
        let mut prog = Program::with_verbosity(rtd, Verbosity::Silent);
        let result = execute(&mut prog, 0, Vec::new()).unwrap();
        assert_eq!(result.as_int(), 5);
    }

    #[test]
    fn string_concat_builds_a_fresh_tree() {
        let mut code = vec![Op::LoadStr as u8];
        push_u16(&mut code, 0);
        code.push(Op::LoadStr as u8);
        push_u16(&mut code, 1);
        code.push(Op::StrConcat as u8);
        code.push(Op::Halt as u8);
        let rtd: &'static RuntimeData = Box::leak(Box::new(RuntimeData {
            lang_el_info: &[],
            generic_info: &[],
            strings: &["foo", "bar"],
            patterns: &[],
            replacements: &[],
            code_entries: &[],
            code: leak_code(code),
        }));
        let mut prog = Program::new(rtd);
        let result = execute(&mut prog, 0, Vec::new()).unwrap();
        let t = result.as_tree().unwrap();
        assert_eq!(prog.trees.get(t.0).tokdata.as_deref(), Some("foobar"));
    }

    #[test]
    fn map_insert_then_find() {
        let mut code = vec![Op::LoadInt as u8];
        push_u64(&mut code, 42); // the language-element id TreeNew will use, N/A here
        code.push(Op::Halt as u8);
        let rtd = empty_rtd(leak_code(code));
        let mut prog = Program::new(rtd);
        let map_tree = TreeId(prog.trees.allocate(Tree { payload: Payload::Map { root: None, len: 0 }, ..Tree::new(node::LEL_RESERVED_COUNT) }));
        let key = TreeId(prog.trees.allocate(Tree::int(1)));
        let value = TreeId(prog.trees.allocate(Tree::int(100)));

        let mut vm = Vm::new(0);
        vm.stack.push(Word::Tree(Some(map_tree)));
        vm.stack.push(Word::Tree(Some(key)));
        vm.stack.push(Word::Tree(Some(value)));
        // drive MapInsertWc manually, bypassing the fetch loop
        let v = vm.stack.pop().unwrap().as_tree().unwrap();
        let k = vm.stack.pop().unwrap().as_tree().unwrap();
        let holder = vm.stack.pop().unwrap().as_tree().unwrap();
        let holder = split_tree_deep(&mut prog, holder);
        let (root, len) = map_header_mut(&mut prog, holder);
        let inserted = map::insert(&mut prog.trees, &prog.kids, &mut prog.map_els, root, len, k, v);
        downref_word(&mut prog, Word::Tree(Some(k)));
        downref_word(&mut prog, Word::Tree(Some(v)));
        assert!(inserted);

        let root = match prog.trees.get(holder.0).payload {
            Payload::Map { root, .. } => root,
            _ => panic!("expected map"),
        };
        assert_eq!(map::find(&prog.trees, &prog.kids, &prog.map_els, root, key), Some(value));
    }

    #[test]
    fn undo_restores_a_setfieldwv_write() {
        let code: Vec<u8> = vec![Op::Halt as u8];
        let rtd = empty_rtd(leak_code(code));
        let mut prog = Program::new(rtd);

        let old = TreeId(prog.trees.allocate(Tree::int(1)));
        let new = TreeId(prog.trees.allocate(Tree::int(2)));
        let attr_slot = prog.kids.allocate(Kid::child(old, None));
        let mut holder = Tree::new(node::LEL_RESERVED_COUNT);
        holder.child = Some(KidId(attr_slot));
        let holder_id = TreeId(prog.trees.allocate(holder));

        let mut vm = Vm::new(0);
        vm.stack.push(Word::Tree(Some(holder_id)));
        vm.stack.push(Word::Tree(Some(new)));
        // drive SetFieldWv manually
        let value = vm.stack.pop().unwrap().as_tree().unwrap();
        let h = vm.stack.pop().unwrap().as_tree().unwrap();
        let h = crate::tree::split::split(&mut prog.trees, &mut prog.kids, h);
        let old_value = node::get_attr(&prog.kids, &prog.trees, h, 0);
        node::set_attr(&mut prog.kids, &prog.trees, h, 0, value);
        upref(&mut prog.trees, old_value);
        vm.rcode.append(UndoRecord::SetField { tree: h, attr: 0, old_value });

        assert_eq!(node::get_attr(&prog.kids, &prog.trees, h, 0), new);
        let records = vm.rcode.drain_from(0);
        crate::vm::reverse::rexecute(&mut prog, None, records);
        assert_eq!(node::get_attr(&prog.kids, &prog.trees, h, 0), old);
    }
}
