//! Opcode table and value-stack word shape (§4.4.1, §4.4.2).
//!
//! The source opcode table has gaps (commented-out and placeholder
//! entries) that this crate omits rather than preserves, packing a dense
//! `#[repr(u8)]` enum instead of matching the historical numeric wire
//! encoding — see `DESIGN.md` for why that's the right call here rather
//! than a compatibility requirement.

use crate::program::{KidId, TreeId};

/// A single value-stack slot. No separate operand/data stack: trees,
/// integers, kid handles, and frame bookkeeping addresses all share one
/// stack of these.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Word {
    Int(i64),
    Bool(bool),
    /// `None` is the nil-tree sentinel pattern matching branches on.
    Tree(Option<TreeId>),
    Kid(KidId),
    /// A saved frame base, return instruction address, or return-value
    /// slot address — the three ABI words every call frame carries.
    Addr(usize),
    /// Handle into the active-iterator table (component C).
    Iter(u32),
    /// Handle into the active reference-chain table, produced by
    /// `RefFromLocal`/`RefFromRef`/`RefFromQual` and consumed by the
    /// `Deref*` family.
    Ref(u32),
    /// Handle into the active user-iterator (generator) table, produced by
    /// `UiterCreate` and consumed by `UiterAdvance`/`UiterDestroy`.
    UserIter(u32),
}

impl Word {
    #[must_use]
    pub fn as_int(self) -> i64 {
        match self {
            Word::Int(v) => v,
            other => panic!("expected Word::Int, found {other:?}"),
        }
    }

    #[must_use]
    pub fn as_bool(self) -> bool {
        match self {
            Word::Bool(v) => v,
            other => panic!("expected Word::Bool, found {other:?}"),
        }
    }

    #[must_use]
    pub fn as_tree(self) -> Option<TreeId> {
        match self {
            Word::Tree(t) => t,
            other => panic!("expected Word::Tree, found {other:?}"),
        }
    }

    #[must_use]
    pub fn as_addr(self) -> usize {
        match self {
            Word::Addr(v) => v,
            other => panic!("expected Word::Addr, found {other:?}"),
        }
    }

    #[must_use]
    pub fn as_iter(self) -> u32 {
        match self {
            Word::Iter(v) => v,
            other => panic!("expected Word::Iter, found {other:?}"),
        }
    }

    #[must_use]
    pub fn as_ref_handle(self) -> u32 {
        match self {
            Word::Ref(v) => v,
            other => panic!("expected Word::Ref, found {other:?}"),
        }
    }

    #[must_use]
    pub fn as_kid(self) -> KidId {
        match self {
            Word::Kid(v) => v,
            other => panic!("expected Word::Kid, found {other:?}"),
        }
    }

    #[must_use]
    pub fn as_user_iter(self) -> u32 {
        match self {
            Word::UserIter(v) => v,
            other => panic!("expected Word::UserIter, found {other:?}"),
        }
    }
}

/// A dense, one-byte opcode. Inline immediates follow in the code
/// stream: a `u16` for small operands (attribute offsets, local slot
/// indices) and a `u64` for pointer-sized ones (code addresses, tree
/// pool indices baked in by the compiler for literals).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    // --- Literals & arithmetic ---
    LoadInt,
    LoadStr,
    LoadNil,
    LoadTrue,
    LoadFalse,
    AddInt,
    SubInt,
    MulInt,
    DivInt,
    EqInt,
    LtInt,
    LeInt,
    GtInt,
    GeInt,
    LogicAnd,
    LogicOr,
    LogicNot,

    // --- Control ---
    Jmp,
    JmpFalse,
    JmpTrue,
    CallWc,
    CallWv,
    Ret,
    Yield,
    Halt,
    Stop,
    Exit,

    // --- Frame ---
    InitLocals,
    PopLocals,
    Pop,
    PopN,
    Dup,
    DupOff,
    SaveLhs,
    RestoreLhs,
    SaveRet,

    // --- Field access (suffix encodes reverse-code policy) ---
    GetFieldR,
    SetFieldWc,
    SetFieldWv,
    SetFieldBkt,

    // --- Locals & globals ---
    GetLocalR,
    SetLocalWc,
    SetLocalWv,
    SetLocalBkt,
    GetGlobalR,
    SetGlobalWc,
    SetGlobalWv,
    SetGlobalBkt,

    // --- References ---
    RefFromLocal,
    RefFromRef,
    RefFromQual,
    DerefR,
    DerefWc,
    DerefWv,
    DerefBkt,

    // --- Iterators ---
    IterCreateForward,
    IterCreateForwardRepeat,
    IterCreateReverseRepeat,
    IterCreateReverseChild,
    IterAdvance,
    IterNextChild,
    IterGetCurR,
    IterGetCurWc,
    IterSetCur,
    IterDestroy,
    /// Creates a user-defined generator function's coroutine handle,
    /// pointing at the `u64` code-address immediate as its entry point.
    UiterCreate,
    /// Advances a user generator, pushing its next yielded value and a
    /// `Bool` truthy/falsy sentinel (`false` once exhausted).
    UiterAdvance,
    UiterDestroy,

    // --- Containers ---
    MapLength,
    MapFind,
    MapInsertWv,
    MapInsertWc,
    MapInsertBkt,
    MapStoreWv,
    MapStoreWc,
    MapStoreBkt,
    MapRemoveWv,
    MapRemoveWc,
    MapRemoveBkt,
    ListLength,
    ListAppend,
    ListRemoveEnd,
    ListGet,
    ListSet,

    // --- String ops ---
    StrLength,
    StrConcat,
    StrAtoi,
    ParseU8,
    ParseU16,
    ParseU32,
    ParseI8,
    ParseI16,
    ParseI32,
    IntToStr,
    StrUpper,
    StrLower,
    Sprintf,

    // --- Tree construction ---
    TreeNew,
    Construct,
    ConstructTerm,
    CreateToken,
    MakeTree,
    MakeToken,
    InitRhsEl,
    InitCaptures,
    TreeSearch,
    TreeToStr,

    // --- I/O ---
    Print,
    PrintXmlAc,
    PrintXmlSkeleton,
    PrintStream,
    OpenFile,
    GetStdin,
    GetStdout,
    GetStderr,
    LoadArgv,

    // --- Parsing ---
    ParseFragWv,
    ParseFragWc,
    ParseFragBkt,
    ParseFinishWv,
    ParseFinishWc,
    ParseFinishBkt,
    StreamPullR,
    StreamPullBkt,
    StreamPushWv,
    StreamPushBkt,
    StreamPushIgnoreWv,
    StreamAppendWv,
    StreamAppendWc,
    StreamAppendBkt,
    ExtractInput,
    SetInput,
    LoadInputR,
    LoadInputWv,
    LoadInputWc,
    LoadInputBkt,
}

impl Op {
    /// One past the last variant's implicit discriminant.
    pub const COUNT: u8 = Op::LoadInputBkt as u8 + 1;

    /// Decodes a raw opcode byte read from the code stream.
    #[must_use]
    pub fn decode(byte: u8) -> Self {
        assert!(byte < Self::COUNT, "invalid opcode byte {byte}");
        // SAFETY: `Op` is `#[repr(u8)]` with no explicit discriminants, so
        // the compiler numbers variants 0..COUNT in declaration order —
        // exactly the dense packing this type exists for (see module docs).
        unsafe { std::mem::transmute(byte) }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decode_round_trips_every_variant() {
        assert_eq!(Op::decode(0), Op::LoadInt);
        assert_eq!(Op::decode(Op::COUNT - 1), Op::LoadInputBkt);
    }

    #[test]
    #[should_panic(expected = "invalid opcode byte")]
    fn decode_rejects_out_of_range_byte() {
        Op::decode(Op::COUNT);
    }
}
