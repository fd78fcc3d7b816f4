//! Message-ID (C9): adds a `Message-ID` header when the message has none.

use async_trait::async_trait;
use uuid::Uuid;

use super::{Handler, HandlerError};
use crate::state::SessionState;

pub struct MessageId {
    our_hostname: String,
}

impl MessageId {
    pub fn new(our_hostname: impl Into<String>) -> Self {
        MessageId {
            our_hostname: our_hostname.into(),
        }
    }
}

#[async_trait]
impl Handler for MessageId {
    fn name(&self) -> &str {
        "message-id"
    }

    async fn handle(&self, state: &mut SessionState) -> Result<(), HandlerError> {
        let already_present = state
            .envelope
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("Message-ID"))
            || header_present_in_body(&state.envelope.data, "Message-ID");
        if already_present {
            return Ok(());
        }
        let value = format!("<{}@{}>", Uuid::new_v4(), self.our_hostname);
        state.envelope.headers.push(("Message-ID".to_string(), value));
        Ok(())
    }
}

/// Scans the header block at the front of a still-unmerged body for `name`,
/// case-insensitively. Handlers run before `HeaderMerge`, so a client-supplied
/// header never shows up in `envelope.headers` — it only exists here.
fn header_present_in_body(data: &[u8], name: &str) -> bool {
    for line in data.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            break;
        }
        if line.first().map(|&b| b == b' ' || b == b'\t').unwrap_or(false) {
            continue;
        }
        match line.iter().position(|&b| b == b':') {
            Some(pos) => {
                let key = &line[..pos];
                if std::str::from_utf8(key).map(|k| k.eq_ignore_ascii_case(name)).unwrap_or(false) {
                    return true;
                }
            }
            None => break,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn adds_message_id_when_absent() {
        let handler = MessageId::new("mail.example.com");
        let mut state = SessionState::new("127.0.0.1".parse().unwrap());
        handler.handle(&mut state).await.unwrap();
        assert_eq!(state.envelope.headers.len(), 1);
        assert!(state.envelope.headers[0].1.ends_with("@mail.example.com>"));
    }

    #[tokio::test]
    async fn does_not_duplicate_existing_message_id() {
        let handler = MessageId::new("mail.example.com");
        let mut state = SessionState::new("127.0.0.1".parse().unwrap());
        state.envelope.headers.push(("Message-ID".to_string(), "<existing@elsewhere>".to_string()));
        handler.handle(&mut state).await.unwrap();
        assert_eq!(state.envelope.headers.len(), 1);
    }

    #[tokio::test]
    async fn does_not_duplicate_message_id_supplied_in_client_body() {
        let handler = MessageId::new("mail.example.com");
        let mut state = SessionState::new("127.0.0.1".parse().unwrap());
        state.envelope.data = b"Subject: hi\r\nMessage-ID: <client@example.com>\r\n\r\nbody\r\n".to_vec();
        handler.handle(&mut state).await.unwrap();
        assert!(state.envelope.headers.is_empty());
    }
}
