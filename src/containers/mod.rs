//! Generic containers exposed to bytecode as tree-shaped values: the
//! doubly linked [`list`], the structurally-ordered [`map`], and the
//! parser handle [`accum`].

pub mod accum;
pub mod list;
pub mod map;
