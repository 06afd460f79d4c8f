//! The bytecode execution engine (component D) and reverse execution
//! (component E): a register-less stack machine with a call-frame ABI,
//! reverse-code emission on write paths, and the undo engine that
//! replays it on parser backtrack.

pub mod exec;
pub mod frame;
pub mod opcode;
pub mod rcode;
pub mod reverse;
