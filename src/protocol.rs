//! Protocol adapter (C5): wraps a byte-stream connection (plain TCP or,
//! after `STARTTLS`, TLS) and exposes the SMTP-level `Send`/`GetCmd`/
//! `StartTls`/`Close` operations C6 drives.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::command::{self, Command};
use crate::io::line::{self, LineError, MAX_CMD_LINE};
use crate::reply::Reply;

/// Either a bare TCP socket or, once `STARTTLS` has completed, a TLS stream
/// wrapping that same socket.
enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// Transient placeholder occupied only for the instant `start_tls`
    /// takes ownership of the plain socket to hand it to the acceptor.
    /// Never polled.
    Upgrading,
}

impl Stream {
    /// Drains whatever the peer has already pushed into the socket's
    /// receive buffer, so a command pipelined ahead of the TLS handshake
    /// cannot be smuggled in and misread as post-handshake input.
    fn discard_buffered_plaintext(&self) {
        let Stream::Plain(tcp) = self else { return };
        let mut scratch = [0u8; 4096];
        loop {
            match tcp.try_read(&mut scratch) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }
}

impl AsyncRead for Stream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Stream::Upgrading => unreachable!("stream polled while mid-TLS-upgrade"),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Stream::Upgrading => unreachable!("stream polled while mid-TLS-upgrade"),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Stream::Upgrading => unreachable!("stream polled while mid-TLS-upgrade"),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Stream::Upgrading => unreachable!("stream polled while mid-TLS-upgrade"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("command line exceeds {MAX_CMD_LINE} octets")]
    LineTooLong,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(std::io::Error),
    #[error("STARTTLS requested but TLS is not available or already active")]
    TlsNotAvailable,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wraps one accepted connection; owns the read/write half used by both
/// command parsing and, during `DATA`, the body reader (C3).
pub struct Protocol {
    stream: Stream,
    tls_active: bool,
}

impl Protocol {
    pub fn new(tcp: TcpStream) -> Self {
        Protocol {
            stream: Stream::Plain(tcp),
            tls_active: false,
        }
    }

    pub fn tls_active(&self) -> bool {
        self.tls_active
    }

    /// Serialises `reply` to wire form and writes it, CRLF-terminated.
    pub async fn send(&mut self, reply: &Reply) -> Result<(), ProtocolError> {
        self.stream.write_all(reply.to_wire().as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads one command line and parses it.
    ///
    /// A line over the 512-octet cap is drained to the next newline and
    /// reported as [`ProtocolError::LineTooLong`]; the session survives.
    /// EOF is reported as [`ProtocolError::ConnectionClosed`].
    pub async fn get_cmd(&mut self) -> Result<Command, ProtocolError> {
        match line::read_until(b'\n', MAX_CMD_LINE, &mut self.stream).await {
            Ok(bytes) => {
                let line = String::from_utf8_lossy(&bytes);
                Ok(command::parse(&line))
            }
            Err(LineError::TooLong) => {
                let _ = line::skip_to_newline(&mut self.stream).await;
                Err(ProtocolError::LineTooLong)
            }
            Err(LineError::Eof) => Err(ProtocolError::ConnectionClosed),
            Err(LineError::Io(e)) => Err(ProtocolError::Io(e)),
        }
    }

    /// Reads one raw line without command parsing, for AUTH continuation
    /// exchanges (e.g. the base64 username/password lines of `AUTH LOGIN`).
    pub async fn read_line_raw(&mut self) -> Result<String, ProtocolError> {
        match line::read_until(b'\n', MAX_CMD_LINE, &mut self.stream).await {
            Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).trim_end_matches(['\r', '\n']).to_string()),
            Err(LineError::TooLong) => {
                let _ = line::skip_to_newline(&mut self.stream).await;
                Err(ProtocolError::LineTooLong)
            }
            Err(LineError::Eof) => Err(ProtocolError::ConnectionClosed),
            Err(LineError::Io(e)) => Err(ProtocolError::Io(e)),
        }
    }

    /// Gives the DATA reader (C3) direct access to the underlying stream.
    pub fn reader(&mut self) -> &mut (impl AsyncRead + Unpin) {
        &mut self.stream
    }

    /// Upgrades the connection in place. Any plaintext already sitting in
    /// the socket's receive buffer is discarded first so a pipelined
    /// command cannot cross the TLS boundary.
    pub async fn start_tls(&mut self, acceptor: &TlsAcceptor) -> Result<(), ProtocolError> {
        if self.tls_active {
            return Err(ProtocolError::TlsNotAvailable);
        }
        self.stream.discard_buffered_plaintext();

        let tcp = match std::mem::replace(&mut self.stream, Stream::Upgrading) {
            Stream::Plain(tcp) => tcp,
            Stream::Tls(_) | Stream::Upgrading => unreachable!("tls_active checked above"),
        };
        let tls = acceptor
            .accept(tcp)
            .await
            .map_err(ProtocolError::TlsHandshake)?;
        self.stream = Stream::Tls(Box::new(tls));
        self.tls_active = true;
        Ok(())
    }

    pub async fn close(mut self) -> Result<(), ProtocolError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
