//! Granularity-gated diagnostic tracing.
//!
//! The original runtime gated verbose `cerr` dumps of splits and opcode
//! dispatch behind a single `colm_log_bytecode` flag. This crate keeps that
//! shape rather than reaching for a logging facade: a small `Verbosity`
//! level and a `Tracer` that writes lines to any `Write`, owned by
//! [`crate::program::Program`] and threaded through every call site that
//! used to `eprintln!` directly.

use std::io::Write;

/// How much diagnostic detail to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    /// Emit nothing.
    #[default]
    Silent,
    /// Trace high-level operations: splits, commits, backtracks.
    Ops,
    /// Trace every dispatched opcode in addition to `Ops`.
    Bytecode,
}

pub struct Tracer {
    level: Verbosity,
    out: Box<dyn Write>,
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer").field("level", &self.level).finish()
    }
}

impl Tracer {
    pub fn new(level: Verbosity) -> Self {
        Self {
            level,
            out: Box::new(std::io::stderr()),
        }
    }

    pub fn with_writer(level: Verbosity, out: Box<dyn Write>) -> Self {
        Self { level, out }
    }

    pub fn level(&self) -> Verbosity {
        self.level
    }

    pub fn ops(&mut self, line: std::fmt::Arguments<'_>) {
        if self.level >= Verbosity::Ops {
            let _ = writeln!(self.out, "{line}");
        }
    }

    pub fn bytecode(&mut self, line: std::fmt::Arguments<'_>) {
        if self.level >= Verbosity::Bytecode {
            let _ = writeln!(self.out, "{line}");
        }
    }
}

#[macro_export]
macro_rules! trace_ops {
    ($tracer:expr, $($arg:tt)*) => {
        $tracer.ops(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! trace_bytecode {
    ($tracer:expr, $($arg:tt)*) => {
        $tracer.bytecode(format_args!($($arg)*))
    };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn silent_emits_nothing() {
        let buf: Vec<u8> = Vec::new();
        let mut t = Tracer::with_writer(Verbosity::Silent, Box::new(buf));
        trace_ops!(t, "hello");
        // no panics, nothing observable to assert beyond the level gate
        assert_eq!(t.level(), Verbosity::Silent);
    }

    #[test]
    fn ordering_gates_bytecode_under_ops() {
        assert!(Verbosity::Bytecode > Verbosity::Ops);
        assert!(Verbosity::Ops > Verbosity::Silent);
    }
}
