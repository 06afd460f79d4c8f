//! The parser handle ("Accum"): the generic container that wraps a
//! scanner + parse-driver pair over a source stream, appearing to
//! bytecode as an ordinary tree whose id names a parser language
//! element (§3.3, §4.2).

use crate::external::{ParserDriver, Scanner, StreamId};
use crate::program::{Program, TreeId};

pub struct Accum {
    pub scanner: Box<dyn Scanner>,
    pub driver: Box<dyn ParserDriver>,
    pub stream: TreeId,
    /// Reverse-code accumulated by reductions driven through this parser
    /// since the last commit; discarded whole on `destroy_accum`, the
    /// same as a completed top-level parse never needing to backtrack
    /// past its own parser handle.
    pub rcode: crate::vm::rcode::RcodeBuf,
}

impl Accum {
    pub fn new(mut scanner: Box<dyn Scanner>, mut driver: Box<dyn ParserDriver>, stream: TreeId, stream_id: StreamId) -> crate::error::Result<Self> {
        if let Some((id, text)) = scanner.next_token(stream_id)? {
            driver.feed(id, &text)?;
        }
        Ok(Self {
            scanner,
            driver,
            stream,
            rcode: crate::vm::rcode::RcodeBuf::new(),
        })
    }
}

/// Tears down an `Accum`: finishes the parse driver, releases any
/// reverse-code accumulated since the last commit without replaying it
/// (`rcodeDownrefAll`), and returns the stream tree id so the caller can
/// downref it through the normal tree lifecycle.
pub fn destroy_accum(prog: &mut Program, mut accum: Accum) -> crate::error::Result<TreeId> {
    accum.driver.finish()?;
    let records = accum.rcode.drain_from(0);
    crate::vm::reverse::rcode_downref_all(prog, records);
    Ok(accum.stream)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::external::{FakeDriver, FakeScanner};
    use crate::program::Program;
    use crate::program::RuntimeData;
    use crate::tree::node::Tree;

    fn test_rtd() -> &'static RuntimeData {
        static RTD: RuntimeData = RuntimeData {
            lang_el_info: &[],
            generic_info: &[],
            strings: &[],
            patterns: &[],
            replacements: &[],
            code_entries: &[],
            code: &[],
        };
        &RTD
    }

    #[test]
    fn new_posts_initial_token_request() {
        let mut prog = Program::new(test_rtd());
        let stream_tree = TreeId(prog.trees.allocate(Tree::new(crate::tree::node::LEL_ID_STREAM)));

        let mut scanner = FakeScanner::default();
        scanner.tokens.push_back((3, "first".into()));
        let driver = FakeDriver::default();

        let accum = Accum::new(Box::new(scanner), Box::new(driver), stream_tree, StreamId(0)).unwrap();
        let stream = destroy_accum(&mut prog, accum).unwrap();
        assert_eq!(stream, stream_tree);
    }
}
