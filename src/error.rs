//! Crate-wide error type.
//!
//! Only the *recoverable* conditions from the error taxonomy become
//! `MeldError` values: I/O failures surfaced through the stream
//! abstraction, and host-driver misuse that the caller can plausibly
//! recover from (e.g. an unsupported file-open mode). Broken runtime
//! invariants (write to a shared tree, unknown container kind, copying a
//! parser) are `debug_assert!`/`panic!` elsewhere in the crate — they
//! indicate a code-generator bug, not a condition a caller can act on.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeldError {
    #[error("open file: unsupported mode {mode:?} (only \"r\" and \"w\" are valid)")]
    BadOpenMode { mode: String },

    #[error("stream io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream closed")]
    StreamClosed,

    #[error("argv index {0} out of range")]
    ArgvOutOfRange(usize),

    /// Raised by `Op::Stop`: a program-level halt that is not a process
    /// exit, just a signal back to the host driver to stop running this
    /// code buffer.
    #[error("program stopped")]
    ProgramStopped,

    /// Raised by `Op::Exit`, carrying the status code the outer driver
    /// should surface. Modeled as an error rather than `std::process::exit`
    /// since this is a library, not a binary: the host decides what an
    /// exit means.
    #[error("program exited with status {0}")]
    Exited(i64),
}

pub type Result<T> = std::result::Result<T, MeldError>;
