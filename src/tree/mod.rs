//! The tree value model (component A): node/child-slot representation,
//! reference counting, copy-on-write split, structural comparison, and
//! static pattern matching.

pub mod compare;
pub mod node;
pub mod pattern;
pub mod refcount;
pub mod split;
