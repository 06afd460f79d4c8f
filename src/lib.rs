//! Runtime core for a tree-rewriting language: reference-counted
//! copy-on-write trees (component A), generic containers (component B),
//! multi-hop references and tree iterators (component C), a register-less
//! bytecode stack machine (component D), and reverse-code undo (component
//! E).
//!
//! Everything here hangs off an explicit [`program::Program`] value rather
//! than process-wide state — there is no `static`, no `lazy_static`, no
//! thread-local. A host embeds this crate by building a `Program` from its
//! own compiled [`program::RuntimeData`] tables and driving it through
//! [`vm::exec::Vm`].

pub mod containers;
pub mod error;
pub mod external;
pub mod iter;
pub mod print;
pub mod program;
pub mod refs;
pub mod trace;
pub mod tree;
pub mod vm;

pub use error::{MeldError, Result};
pub use program::{Program, RuntimeData};
