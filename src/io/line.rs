//! Line reader (C2): reads CRLF-delimited lines with a maximum length.
//!
//! RFC 5321 §4.5.3.1.4 caps command lines at 512 octets; §4.5.3.1.6 caps
//! DATA lines at 1000. Both limits are enforced by calling [`read_until`]
//! with the appropriate `max`.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum length of a command line, per RFC 5321 §4.5.3.1.4.
pub const MAX_CMD_LINE: usize = 512;
/// Maximum length of a DATA line, per RFC 5321 §4.5.3.1.6.
pub const MAX_DATA_LINE: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum LineError {
    #[error("line exceeds maximum length")]
    TooLong,
    #[error("connection closed before delimiter")]
    Eof,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reads bytes one at a time until `delim` is seen or `max` bytes have been
/// accumulated without finding it. The delimiter is included in the
/// returned bytes on success.
pub async fn read_until<R>(delim: u8, max: usize, reader: &mut R) -> Result<Vec<u8>, LineError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(LineError::Eof);
            }
            Err(e) => return Err(LineError::Io(e)),
        };
        if buf.len() == max {
            return Err(LineError::TooLong);
        }
        buf.push(byte);
        if byte == delim {
            return Ok(buf);
        }
    }
}

/// Drains bytes from `reader` until a `\n` is found or the connection
/// closes. Used to resynchronise after a [`LineError::TooLong`] so the next
/// read starts on a fresh line.
pub async fn skip_to_newline<R>(reader: &mut R) -> Result<(), LineError>
where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.read_u8().await {
            Ok(b'\n') => return Ok(()),
            Ok(_) => continue,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(LineError::Io(e)),
        }
    }
}
