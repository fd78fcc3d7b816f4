//! SMTP reply values and their wire serialization.
//!
//! A reply is either a single line or a multi-line block; RFC 5321 marks
//! every line but the last with a hyphen after the status code.

use std::fmt;

/// A 3-digit SMTP status code together with one or more message lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    status: u16,
    lines: Vec<String>,
}

impl Reply {
    /// A single-line reply, e.g. `250 OK`.
    pub fn single(status: u16, message: impl Into<String>) -> Self {
        Reply {
            status,
            lines: vec![message.into()],
        }
    }

    /// A multi-line reply; `lines` must be non-empty.
    pub fn multi(status: u16, lines: Vec<String>) -> Self {
        assert!(!lines.is_empty(), "a reply must have at least one line");
        Reply { status, lines }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Serializes to wire form, CRLF-terminated, ready to write to the
    /// socket as-is.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        let last = self.lines.len() - 1;
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            out.push_str(&format!("{}{}{}\r\n", self.status, sep, line));
        }
        out
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire().trim_end())
    }
}

// Common replies used throughout the session state machine and handlers.
impl Reply {
    pub fn service_ready(hostname: &str) -> Self {
        Reply::single(220, format!("{hostname} Service Ready"))
    }

    pub fn ok() -> Self {
        Reply::single(250, "OK")
    }

    pub fn closing() -> Self {
        Reply::single(221, "Bye")
    }

    pub fn start_mail_input() -> Self {
        Reply::single(354, "Start mail input; end with <CRLF>.<CRLF>")
    }

    pub fn not_implemented() -> Self {
        Reply::single(502, "Not implemented")
    }

    pub fn command_not_recognized() -> Self {
        Reply::single(500, "Command not recognized")
    }

    pub fn line_too_long() -> Self {
        Reply::single(500, "Line too long")
    }

    pub fn invalid_cmd(info: &str) -> Self {
        Reply::single(501, info)
    }

    pub fn could_not_parse_mail_data() -> Self {
        Reply::single(501, "Could not parse mail data")
    }

    pub fn out_of_sequence(reason: &str) -> Self {
        Reply::single(503, reason)
    }

    pub fn mailbox_not_available() -> Self {
        Reply::single(550, "Mailbox not available")
    }

    pub fn requested_action_aborted() -> Self {
        Reply::single(451, "Requested action aborted")
    }

    pub fn shutting_down() -> Self {
        Reply::single(421, "shutting down")
    }

    pub fn auth_successful() -> Self {
        Reply::single(235, "Authentication successful")
    }

    pub fn auth_failed() -> Self {
        Reply::single(535, "Authentication credentials invalid")
    }

    pub fn ready_to_start_tls() -> Self {
        Reply::single(220, "Ready to start TLS")
    }

    pub fn blacklisted(reason: &str) -> Self {
        Reply::single(554, reason)
    }

    pub fn auth_required() -> Self {
        Reply::single(530, "Authentication required")
    }

    pub fn too_many_failed_logins() -> Self {
        Reply::single(535, "Too many failed login attempts, try again later")
    }

    pub fn unrecognized_auth_mechanism() -> Self {
        Reply::single(504, "Unrecognized authentication mechanism")
    }

    pub fn auth_continue(payload: &str) -> Self {
        Reply::single(334, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_reply_has_space_separator() {
        let reply = Reply::single(250, "OK");
        assert_eq!(reply.to_wire(), "250 OK\r\n");
    }

    #[test]
    fn multi_line_reply_hyphenates_all_but_last() {
        let reply = Reply::multi(
            250,
            vec![
                "mail.example.com".to_string(),
                "PIPELINING".to_string(),
                "8BITMIME".to_string(),
            ],
        );
        assert_eq!(
            reply.to_wire(),
            "250-mail.example.com\r\n250-PIPELINING\r\n250 8BITMIME\r\n"
        );
    }

    #[test]
    fn single_element_multi_behaves_like_single() {
        let reply = Reply::multi(250, vec!["only line".to_string()]);
        assert_eq!(reply.to_wire(), "250 only line\r\n");
    }
}
