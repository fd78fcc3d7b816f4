//! DATA reader (C3): streams the SMTP message body, undoing RFC 5321 §4.5.2
//! dot-stuffing and detecting the `.CRLF` terminator.
//!
//! A held CR is only flushed once the following byte is known, so an
//! ordinary line ending is passed through unchanged while `CRLF "." CRLF`
//! is recognised and consumed without ever reaching the output. Per-line
//! byte counting (for the 1000-octet cap) excludes the CRLF itself, per
//! §6's "maximum DATA line 1000 bytes (excluding CRLF)".
//!
//! The per-byte state machine (`DotUnstuffer`) is kept separate from the
//! async driving loop so it can be unit tested without an I/O source, the
//! way a dot-stuffing state machine is modelled as a standalone struct with
//! a `process`/`push` method elsewhere in this codebase's reference corpus.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::io::line::MAX_DATA_LINE;

/// Default cap on total message size (§9 design notes): 64 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    BeginLine,
    Dot,
    DotCr,
    Cr,
    Data,
    Eof,
}

#[derive(Debug, thiserror::Error)]
pub enum DataReaderError {
    #[error("DATA line exceeds {MAX_DATA_LINE} octets")]
    LineTooLong,
    #[error("message exceeds the configured maximum size")]
    TooLarge,
    #[error("connection closed before the end-of-data terminator")]
    Incomplete,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

enum Outcome {
    Continue,
    End,
}

/// The per-byte dot-unstuffing state machine described in RFC 5321 §4.5.2.
struct DotUnstuffer {
    state: State,
    line_len: usize,
}

impl DotUnstuffer {
    fn new() -> Self {
        DotUnstuffer {
            state: State::BeginLine,
            line_len: 0,
        }
    }

    fn is_done(&self) -> bool {
        self.state == State::Eof
    }

    /// Counts towards the per-line cap; used for bytes that are genuine
    /// message content.
    fn emit_content(&mut self, byte: u8, out: &mut Vec<u8>) -> Result<(), DataReaderError> {
        self.line_len += 1;
        if self.line_len > MAX_DATA_LINE {
            return Err(DataReaderError::LineTooLong);
        }
        out.push(byte);
        Ok(())
    }

    /// Does not count towards the per-line cap; used for the CRLF pair that
    /// terminates a content line.
    fn emit_raw(&mut self, byte: u8, out: &mut Vec<u8>) {
        out.push(byte);
    }

    /// Feeds one input byte through the state machine, appending any
    /// resulting output bytes to `out`.
    fn push(&mut self, byte: u8, out: &mut Vec<u8>) -> Result<Outcome, DataReaderError> {
        loop {
            match self.state {
                State::BeginLine => match byte {
                    b'.' => {
                        self.state = State::Dot;
                        return Ok(Outcome::Continue);
                    }
                    b'\r' => {
                        self.state = State::Cr;
                        return Ok(Outcome::Continue);
                    }
                    _ => {
                        self.state = State::Data;
                        self.emit_content(byte, out)?;
                        return Ok(Outcome::Continue);
                    }
                },
                State::Dot => match byte {
                    b'\r' => {
                        self.state = State::DotCr;
                        return Ok(Outcome::Continue);
                    }
                    b'\n' => {
                        self.state = State::Eof;
                        return Ok(Outcome::End);
                    }
                    _ => {
                        // The leading '.' was stuffing; this byte is content.
                        self.state = State::Data;
                        self.emit_content(byte, out)?;
                        return Ok(Outcome::Continue);
                    }
                },
                State::DotCr => match byte {
                    b'\n' => {
                        self.state = State::Eof;
                        return Ok(Outcome::End);
                    }
                    _ => {
                        // Not the terminator: the held CR is real content.
                        // Flush it, then reprocess `byte` fresh from Data.
                        self.state = State::Data;
                        self.emit_content(b'\r', out)?;
                        continue;
                    }
                },
                State::Cr => match byte {
                    b'\n' => {
                        // An ordinary line ending: pass CRLF through, not
                        // counted against the line it terminates.
                        self.emit_raw(b'\r', out);
                        self.emit_raw(b'\n', out);
                        self.line_len = 0;
                        self.state = State::BeginLine;
                        return Ok(Outcome::Continue);
                    }
                    _ => {
                        self.state = State::Data;
                        self.emit_content(b'\r', out)?;
                        continue;
                    }
                },
                State::Data => match byte {
                    b'\r' => {
                        self.state = State::Cr;
                        return Ok(Outcome::Continue);
                    }
                    b'\n' => {
                        // Bare LF with no preceding CR; not valid SMTP but
                        // treated as a line boundary rather than content.
                        self.line_len = 0;
                        self.state = State::BeginLine;
                        return Ok(Outcome::Continue);
                    }
                    _ => {
                        self.emit_content(byte, out)?;
                        return Ok(Outcome::Continue);
                    }
                },
                State::Eof => return Ok(Outcome::End),
            }
        }
    }
}

/// Drives a [`DotUnstuffer`] over an async byte source, accumulating the
/// unstuffed message body up to `max_message_size` bytes.
#[derive(Clone)]
pub struct DataReader {
    max_message_size: usize,
}

impl DataReader {
    pub fn new(max_message_size: usize) -> Self {
        DataReader { max_message_size }
    }

    /// Reads the DATA phase to completion, returning the unstuffed body.
    ///
    /// On `Incomplete` (peer closed before the terminator) or `LineTooLong`,
    /// the transaction must be aborted; no partial body is handed to the
    /// handler chain.
    pub async fn read_all<R>(&self, reader: &mut R) -> Result<Vec<u8>, DataReaderError>
    where
        R: AsyncRead + Unpin,
    {
        let mut unstuffer = DotUnstuffer::new();
        let mut out = Vec::new();

        while !unstuffer.is_done() {
            let byte = match reader.read_u8().await {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(DataReaderError::Incomplete);
                }
                Err(e) => return Err(DataReaderError::Io(e)),
            };

            if let Outcome::End = unstuffer.push(byte, &mut out)? {
                break;
            }
            if out.len() > self.max_message_size {
                return Err(DataReaderError::TooLarge);
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn unstuff(input: &[u8]) -> Vec<u8> {
        let mut cursor = Cursor::new(input.to_vec());
        DataReader::new(DEFAULT_MAX_MESSAGE_SIZE)
            .read_all(&mut cursor)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn simple_body_passes_through() {
        let body = unstuff(b"Subject: hi\r\n\r\nhello\r\n.\r\n").await;
        assert_eq!(body, b"Subject: hi\r\n\r\nhello\r\n");
    }

    #[tokio::test]
    async fn leading_dot_is_unstuffed() {
        let body = unstuff(b"..line\r\nline2\r\n.\r\n").await;
        assert_eq!(body, b".line\r\nline2\r\n");
    }

    #[tokio::test]
    async fn terminator_never_appears_in_output() {
        let body = unstuff(b"a\r\n.\r\n").await;
        assert!(!contains_subsequence(&body, b"\r\n.\r\n"));
        assert_eq!(body, b"a\r\n");
    }

    #[tokio::test]
    async fn lone_dot_on_line_is_dropped_when_not_terminator() {
        // ".x" at the start of a line: the dot is stripped, "x" remains.
        let body = unstuff(b".x\r\n.\r\n").await;
        assert_eq!(body, b"x\r\n");
    }

    #[tokio::test]
    async fn bare_cr_not_followed_by_lf_is_preserved_as_data() {
        let body = unstuff(b"a\rb\r\n.\r\n").await;
        assert_eq!(body, b"a\rb\r\n");
    }

    #[tokio::test]
    async fn incomplete_data_reports_error() {
        let mut cursor = Cursor::new(b"no terminator here".to_vec());
        let err = DataReader::new(DEFAULT_MAX_MESSAGE_SIZE)
            .read_all(&mut cursor)
            .await
            .unwrap_err();
        assert!(matches!(err, DataReaderError::Incomplete));
    }

    #[tokio::test]
    async fn data_line_of_1000_is_accepted() {
        let mut data = "a".repeat(1000).into_bytes();
        data.extend_from_slice(b"\r\n.\r\n");
        let mut cursor = Cursor::new(data);
        let result = DataReader::new(DEFAULT_MAX_MESSAGE_SIZE)
            .read_all(&mut cursor)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn data_line_of_1001_is_too_long() {
        let mut data = "a".repeat(1001).into_bytes();
        data.extend_from_slice(b"\r\n.\r\n");
        let mut cursor = Cursor::new(data);
        let err = DataReader::new(DEFAULT_MAX_MESSAGE_SIZE)
            .read_all(&mut cursor)
            .await
            .unwrap_err();
        assert!(matches!(err, DataReaderError::LineTooLong));
    }

    #[tokio::test]
    async fn message_over_size_cap_is_rejected() {
        let mut data = "a".repeat(100).into_bytes();
        data.extend_from_slice(b"\r\n.\r\n");
        let mut cursor = Cursor::new(data);
        let err = DataReader::new(10)
            .read_all(&mut cursor)
            .await
            .unwrap_err();
        assert!(matches!(err, DataReaderError::TooLarge));
    }

    fn contains_subsequence(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }
}
