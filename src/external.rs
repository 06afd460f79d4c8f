//! Interfaces to the collaborators this core consumes but does not
//! define: the lexer/scanner, the LALR parse driver, and open streams.
//!
//! Only the shape of these seams is described here — no scanner, no
//! parse tables, no real I/O backend. A `FakeDriver` is provided for
//! tests that need an `Accum` without a real language front end.

use std::io::{Read, Write};

use crate::error::Result;

/// Handle to an externally managed open stream (file, string buffer, or
/// arbitrary `Read`/`Write` the host wired up). The core never looks
/// inside one; it only holds the id and forwards read/write calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u32);

/// The lexer/scanner ("FsmRun" in the source system): pulls bytes from a
/// stream and produces tokens on demand.
pub trait Scanner {
    /// Requests the next token, returning its language-element id and raw
    /// text, or `None` at end of input.
    fn next_token(&mut self, stream: StreamId) -> Result<Option<(u32, String)>>;

    /// Pushes a token back onto the front of the stream, for
    /// `STREAM_PUSH`/`STREAM_PUSH_IGNORE`: the parser backing out of a
    /// frag and re-presenting text it already consumed. The default
    /// no-op is correct for scanners that always re-derive tokens from
    /// an underlying buffer rather than an exhausted pull queue.
    fn push_back(&mut self, _stream: StreamId, _lang_el_id: u32, _text: &str) -> Result<()> {
        Ok(())
    }
}

/// The LALR parse driver ("PdaRun" in the source system): consumes
/// tokens from a [`Scanner`] and drives reductions, each of which runs a
/// bytecode body against the tree value model.
pub trait ParserDriver {
    /// Feeds one more token in; returns `true` once a top-level reduction
    /// has produced a committed result tree.
    fn feed(&mut self, lang_el_id: u32, text: &str) -> Result<bool>;

    /// Notifies the driver that the underlying stream produced an error
    /// or hit EOF with no more tokens forthcoming.
    fn finish(&mut self) -> Result<()>;
}

/// A byte-oriented open stream, read or write, identified by a
/// [`StreamId`]. The core's stream table holds `Box<dyn StreamIo>`.
pub trait StreamIo: Read + Write {}
impl<T: Read + Write> StreamIo for T {}

/// Wraps a standard stdio handle so it satisfies [`StreamIo`] (`Read +
/// Write`) even though the underlying handle is naturally one-directional.
/// The unsupported direction is inert: `Read` on an output handle reports
/// EOF, `Write` on `Stdin` reports `ErrorKind::Unsupported`.
pub struct StdioDuplex {
    stdin: Option<std::io::Stdin>,
    stdout: Option<std::io::Stdout>,
    stderr: Option<std::io::Stderr>,
}

impl StdioDuplex {
    #[must_use]
    pub fn stdin() -> Self {
        Self { stdin: Some(std::io::stdin()), stdout: None, stderr: None }
    }

    #[must_use]
    pub fn stdout() -> Self {
        Self { stdin: None, stdout: Some(std::io::stdout()), stderr: None }
    }

    #[must_use]
    pub fn stderr() -> Self {
        Self { stdin: None, stdout: None, stderr: Some(std::io::stderr()) }
    }
}

impl Read for StdioDuplex {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.stdin {
            Some(s) => s.read(buf),
            None => Ok(0),
        }
    }
}

impl Write for StdioDuplex {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(s) = &mut self.stdout {
            return s.write(buf);
        }
        if let Some(s) = &mut self.stderr {
            return s.write(buf);
        }
        Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "stdin is not writable"))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Some(s) = &mut self.stdout {
            return s.flush();
        }
        if let Some(s) = &mut self.stderr {
            return s.flush();
        }
        Ok(())
    }
}

/// Minimal scanner/driver pair used only by tests, standing in for a
/// real generated lexer+parser: treats the whole input as a single
/// opaque token and immediately reports completion.
#[derive(Debug, Default)]
pub struct FakeDriver {
    pub fed: Vec<(u32, String)>,
    pub finished: bool,
}

impl ParserDriver for FakeDriver {
    fn feed(&mut self, lang_el_id: u32, text: &str) -> Result<bool> {
        self.fed.push((lang_el_id, text.to_string()));
        Ok(true)
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeScanner {
    pub tokens: std::collections::VecDeque<(u32, String)>,
}

impl Scanner for FakeScanner {
    fn next_token(&mut self, _stream: StreamId) -> Result<Option<(u32, String)>> {
        Ok(self.tokens.pop_front())
    }

    fn push_back(&mut self, _stream: StreamId, lang_el_id: u32, text: &str) -> Result<()> {
        self.tokens.push_front((lang_el_id, text.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fake_driver_reports_completion_on_feed() {
        let mut driver = FakeDriver::default();
        let done = driver.feed(7, "hello").unwrap();
        assert!(done);
        assert_eq!(driver.fed, vec![(7, "hello".to_string())]);
    }

    #[test]
    fn fake_scanner_drains_in_order() {
        let mut scanner = FakeScanner::default();
        scanner.tokens.push_back((1, "a".into()));
        scanner.tokens.push_back((2, "b".into()));
        assert_eq!(scanner.next_token(StreamId(0)).unwrap(), Some((1, "a".into())));
        assert_eq!(scanner.next_token(StreamId(0)).unwrap(), Some((2, "b".into())));
        assert_eq!(scanner.next_token(StreamId(0)).unwrap(), None);
    }
}
