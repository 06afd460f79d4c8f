//! Reverse-code (undo log) buffer (§4.4.4).
//!
//! The source system packs each inverse record as a byte sequence
//! terminated by a `rcodeUnitLen` trailer so tail-first replay can find
//! unit boundaries without a separate index. A `Vec<UndoRecord>` gives
//! the same logical shape — contiguous per-reduction units, a length
//! (`buf.len()`) that serves as the "mark" a commit truncates back to,
//! and `pop()` for tail-first replay — without hand-rolling a trailer
//! parser over raw bytes for a single-process VM that never persists or
//! transmits this buffer. See `DESIGN.md` for why that's an acceptable
//! scope cut here.

use crate::program::TreeId;
use crate::vm::opcode::Word;

/// One inverse operation, enough to undo exactly the forward write that
/// produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum UndoRecord {
    SetField {
        tree: TreeId,
        attr: u16,
        old_value: TreeId,
    },
    SetLocal {
        slot: usize,
        old_value: Word,
    },
    SetGlobal {
        slot: usize,
        old_value: Word,
    },
    MapInsert {
        map_tree: TreeId,
        key: TreeId,
    },
    MapStore {
        map_tree: TreeId,
        key: TreeId,
        old_value: Option<TreeId>,
    },
    MapRemove {
        map_tree: TreeId,
        key: TreeId,
        value: TreeId,
    },
    ListAppend {
        list_tree: TreeId,
    },
    ListRemoveEnd {
        list_tree: TreeId,
        value: TreeId,
    },
    ListSet {
        list_tree: TreeId,
        position: u32,
        old_value: TreeId,
    },
    /// Undoes a write through a `Ref` chain (`DEREF_WV`), which addresses
    /// a `Kid` slot directly rather than an attribute offset.
    SetKid {
        kid: crate::program::KidId,
        old_tree: TreeId,
    },
    /// Undoes `LOAD_INPUT_WV`/`SET_INPUT`: restores the parser handle's
    /// previous input-stream tree.
    AccumSetStream {
        accum: crate::program::AccumId,
        old_stream: TreeId,
    },
}

#[derive(Debug, Default)]
pub struct RcodeBuf {
    units: Vec<UndoRecord>,
}

impl RcodeBuf {
    #[must_use]
    pub fn new() -> Self {
        Self { units: Vec::new() }
    }

    pub fn append(&mut self, record: UndoRecord) {
        self.units.push(record);
    }

    /// A checkpoint a reduction can later [`truncate`](Self::truncate) or
    /// [`drain_from`](Self::drain_from) back to.
    #[must_use]
    pub fn mark(&self) -> usize {
        self.units.len()
    }

    /// Commit: discard every unit appended since `mark`.
    pub fn truncate(&mut self, mark: usize) {
        self.units.truncate(mark);
    }

    /// Backtrack: pops and returns every unit appended since `mark`, in
    /// tail-first (most-recent-first) order, ready for `rexecute`.
    pub fn drain_from(&mut self, mark: usize) -> Vec<UndoRecord> {
        self.units.split_off(mark).into_iter().rev().collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn truncate_discards_everything_past_the_mark() {
        let mut buf = RcodeBuf::new();
        let mark = buf.mark();
        buf.append(UndoRecord::ListAppend { list_tree: TreeId(1) });
        buf.append(UndoRecord::ListAppend { list_tree: TreeId(2) });
        buf.truncate(mark);
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_from_replays_tail_first() {
        let mut buf = RcodeBuf::new();
        let mark = buf.mark();
        buf.append(UndoRecord::ListAppend { list_tree: TreeId(1) });
        buf.append(UndoRecord::ListAppend { list_tree: TreeId(2) });
        let drained = buf.drain_from(mark);
        assert_eq!(
            drained,
            vec![
                UndoRecord::ListAppend { list_tree: TreeId(2) },
                UndoRecord::ListAppend { list_tree: TreeId(1) },
            ]
        );
        assert!(buf.is_empty());
    }
}
