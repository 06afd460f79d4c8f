//! The execution context.
//!
//! Everything the original runtime hung off the process-wide `Program`
//! singleton — tree/kid/list-element/map-element pools, global variables,
//! the compiled `RuntimeData` tables, and now the tracer — is gathered here
//! as a single explicit value threaded through every operation. Nothing in
//! this crate reaches for a `static`/`lazy_static`/thread-local; every
//! function that needs program state takes `&Program` or `&mut Program`.

use crate::trace::{Tracer, Verbosity};
use crate::tree::node::{Kid, Tree};

/// Defines a `Copy` newtype handle over a `u32` pool index.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            #[must_use]
            pub const fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

define_id!(
    /// Handle to a pooled [`Tree`](crate::tree::node::Tree).
    TreeId
);
define_id!(
    /// Handle to a pooled child slot ([`Kid`](crate::tree::node::Kid)).
    KidId
);
define_id!(
    /// Handle to a pooled list element.
    ListElId
);
define_id!(
    /// Handle to a pooled map element.
    MapElId
);
define_id!(
    /// Handle to a pooled parser handle ("Accum").
    AccumId
);

/// A slab allocator reused for every pool (tree, kid, list-element,
/// map-element) in the program, mirroring the original's four hand-rolled
/// `FixedAlloc` pools with one generic type.
#[derive(Debug, Default)]
pub struct Pool<T> {
    slots: Vec<Option<T>>,
    free: Vec<u32>,
}

impl<T> Pool<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn allocate(&mut self, value: T) -> u32 {
        if let Some(id) = self.free.pop() {
            self.slots[id as usize] = Some(value);
            id
        } else {
            self.slots.push(Some(value));
            (self.slots.len() - 1) as u32
        }
    }

    pub fn free(&mut self, id: u32) -> T {
        let value = self.slots[id as usize]
            .take()
            .expect("free: slot already empty");
        self.free.push(id);
        value
    }

    pub fn get(&self, id: u32) -> &T {
        self.slots[id as usize]
            .as_ref()
            .expect("get: slot is empty")
    }

    pub fn get_mut(&mut self, id: u32) -> &mut T {
        self.slots[id as usize]
            .as_mut()
            .expect("get_mut: slot is empty")
    }

    pub fn len_allocated(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

/// Per-language-element static info, analogous to `LangElInfo` in the
/// original's compiled runtime data.
#[derive(Debug, Clone, Copy)]
pub struct LangElInfo {
    pub name: &'static str,
    /// Non-zero iff this id names a generic container (list/map/parser);
    /// indexes into [`RuntimeData::generic_info`].
    pub generic_id: u32,
    /// Number of fixed attribute slots this production carries.
    pub object_length: u16,
    /// Whether nodes of this id ever carry an ignore list.
    pub ignore: bool,
    /// Marks a right-recursive "list"/"repeat" production spine. The
    /// printer (§4.6) elides these wrapper nodes and recurses straight
    /// into the repeated element instead of nesting one tag per cell.
    pub repeat: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenericKind {
    List,
    Map,
    Parser,
}

#[derive(Debug, Clone, Copy)]
pub struct GenericInfo {
    pub kind: GenericKind,
    pub lang_el_id: u32,
    /// Only meaningful for `GenericKind::Parser`.
    pub parser_id: u32,
}

/// Static, host-compiled tables describing the language: one per program,
/// never mutated at runtime. The direct analogue of Colm's `Program::rtd`.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeData {
    pub lang_el_info: &'static [LangElInfo],
    pub generic_info: &'static [GenericInfo],
    /// String literal table `LOAD_STR` indexes into; each load allocates a
    /// fresh owned `Tree::string` rather than sharing one pooled instance,
    /// since every tree needs its own independent refcount.
    pub strings: &'static [&'static str],
    pub patterns: &'static [crate::tree::pattern::PatternNode],
    pub replacements: &'static [crate::tree::pattern::ReplNode],
    /// Entry points: code offset for each top-level reduction/function.
    pub code_entries: &'static [u32],
    pub code: &'static [u8],
}

impl RuntimeData {
    #[must_use]
    pub fn object_length(&self, id: u32) -> u16 {
        self.lang_el_info[id as usize].object_length
    }

    #[must_use]
    pub fn generic_id(&self, id: u32) -> u32 {
        self.lang_el_info[id as usize].generic_id
    }

    #[must_use]
    pub fn is_repeat(&self, id: u32) -> bool {
        self.lang_el_info[id as usize].repeat
    }
}

/// The execution context: pools, globals, static tables, and diagnostics.
pub struct Program {
    pub trees: Pool<Tree>,
    pub kids: Pool<Kid>,
    pub list_els: Pool<crate::containers::list::ListEl>,
    pub map_els: Pool<crate::containers::map::MapEl>,
    pub accums: Pool<crate::containers::accum::Accum>,
    /// Active tree iterators (component C), indexed by `Word::Iter`: the
    /// iterator state itself, the tree reference it borrows for its whole
    /// lifetime if any (a reverse-style iterator over a nil root borrows
    /// nothing), and the synthetic root `Kid` slot the forward-style
    /// constructors allocate to alias that root (see `RefHandle`'s module
    /// doc for why `split_ref`/`TreeIter` need a real `Kid` to pivot a
    /// bare tree reference through). All three are released by
    /// `Op::IterDestroy`.
    pub iters: Pool<(crate::iter::TreeIter, Option<TreeId>, Option<KidId>)>,
    /// Active reference chains (§4.1.2's access paths), indexed by
    /// `Word::Ref`.
    pub ref_chains: Pool<crate::vm::exec::RefHandle>,
    /// Open, host-backed streams (files, stdio), indexed by `StreamId`.
    pub streams: Pool<Box<dyn crate::external::StreamIo>>,
    /// Active user-defined generator coroutines, indexed by
    /// `Word::UserIter`.
    pub user_iters: Pool<crate::vm::exec::UserIterState>,
    pub globals: Vec<crate::vm::opcode::Word>,
    /// Command-line arguments `LOAD_ARGV` indexes into. Empty unless the
    /// host driver sets it before running a program.
    pub argv: Vec<String>,
    pub rtd: &'static RuntimeData,
    pub tracer: Tracer,
}

impl Program {
    #[must_use]
    pub fn new(rtd: &'static RuntimeData) -> Self {
        Self {
            trees: Pool::new(),
            kids: Pool::new(),
            list_els: Pool::new(),
            map_els: Pool::new(),
            accums: Pool::new(),
            iters: Pool::new(),
            ref_chains: Pool::new(),
            streams: Pool::new(),
            user_iters: Pool::new(),
            globals: Vec::new(),
            argv: Vec::new(),
            rtd,
            tracer: Tracer::new(Verbosity::Silent),
        }
    }

    #[must_use]
    pub fn with_verbosity(rtd: &'static RuntimeData, level: Verbosity) -> Self {
        let mut prog = Self::new(rtd);
        prog.tracer = Tracer::new(level);
        prog
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pool_allocate_reuses_freed_slots() {
        let mut pool: Pool<i32> = Pool::new();
        let a = pool.allocate(1);
        let b = pool.allocate(2);
        assert_eq!(pool.len_allocated(), 2);
        pool.free(a);
        let c = pool.allocate(3);
        assert_eq!(c, a, "freed slot should be reused before growing");
        assert_eq!(*pool.get(b), 2);
        assert_eq!(*pool.get(c), 3);
    }
}
