//! Per-connection session state (part of C6's `SessionState` record).

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

use crate::address::MailAddress;

static NEXT_SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Monotonically increasing per-process counter paired with the moment the
/// session was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionId {
    pub counter: u64,
    pub started_at: DateTime<Utc>,
}

impl SessionId {
    pub fn new() -> Self {
        SessionId {
            counter: NEXT_SESSION_COUNTER.fetch_add(1, Ordering::Relaxed),
            started_at: Utc::now(),
        }
    }
}

/// The sender, recipients, body and header accumulator for one in-flight
/// transaction. Cleared after each successful DATA, `RSET`, or `EHLO`/`HELO`.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub from: Option<MailAddress>,
    pub to: Vec<MailAddress>,
    pub data: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl Envelope {
    pub fn reset(&mut self) {
        self.from = None;
        self.to.clear();
        self.data.clear();
        self.headers.clear();
    }

    pub fn can_receive_mail(&self) -> Result<(), &'static str> {
        if self.from.is_some() {
            return Err("Sender already specified");
        }
        Ok(())
    }

    pub fn can_receive_rcpt(&self) -> Result<(), &'static str> {
        if self.from.is_none() {
            return Err("Need mail before RCPT");
        }
        Ok(())
    }

    pub fn can_receive_data(&self) -> Result<(), &'static str> {
        if self.from.is_none() {
            return Err("Need mail before DATA");
        }
        if self.to.is_empty() {
            return Err("Need RCPT before DATA");
        }
        Ok(())
    }
}

/// Per-connection mutable record. Lives on the task stack for the
/// connection's lifetime; never shared across tasks.
pub struct SessionState {
    pub remote_ip: IpAddr,
    pub session_id: SessionId,
    pub peer_hostname: Option<String>,
    pub user: Option<String>,
    pub tls_active: bool,
    pub envelope: Envelope,
}

impl SessionState {
    pub fn new(remote_ip: IpAddr) -> Self {
        SessionState {
            remote_ip,
            session_id: SessionId::new(),
            peer_hostname: None,
            user: None,
            tls_active: false,
            envelope: Envelope::default(),
        }
    }
}
