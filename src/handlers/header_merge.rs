//! Header-merge (C9): folds the headers accumulated in `envelope.headers`
//! (by `Received`, `MessageId`, `Spf`, `SpamCheck`) into `envelope.data`,
//! since delivery and relay read the raw body, not the side vector.
//!
//! Must run after every handler that pushes to `envelope.headers` and
//! before `ImapDeliver`/`Relay`.

use async_trait::async_trait;

use super::{Handler, HandlerError};
use crate::state::SessionState;

pub struct HeaderMerge;

#[async_trait]
impl Handler for HeaderMerge {
    fn name(&self) -> &str {
        "header-merge"
    }

    async fn handle(&self, state: &mut SessionState) -> Result<(), HandlerError> {
        if state.envelope.headers.is_empty() {
            return Ok(());
        }

        let mut merged = Vec::with_capacity(state.envelope.data.len() + 256);
        for (name, value) in &state.envelope.headers {
            merged.extend_from_slice(name.as_bytes());
            merged.extend_from_slice(b": ");
            merged.extend_from_slice(value.as_bytes());
            merged.extend_from_slice(b"\r\n");
        }
        merged.extend_from_slice(&state.envelope.data);
        state.envelope.data = merged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prepends_headers_in_vector_order() {
        let handler = HeaderMerge;
        let mut state = SessionState::new("127.0.0.1".parse().unwrap());
        state.envelope.headers.push(("Received".to_string(), "from a by b".to_string()));
        state.envelope.headers.push(("Message-ID".to_string(), "<abc@example.com>".to_string()));
        state.envelope.data = b"Subject: hi\r\n\r\nbody\r\n".to_vec();

        handler.handle(&mut state).await.unwrap();

        assert_eq!(
            state.envelope.data,
            b"Received: from a by b\r\nMessage-ID: <abc@example.com>\r\nSubject: hi\r\n\r\nbody\r\n".to_vec()
        );
    }

    #[tokio::test]
    async fn leaves_data_untouched_when_no_headers_accumulated() {
        let handler = HeaderMerge;
        let mut state = SessionState::new("127.0.0.1".parse().unwrap());
        state.envelope.data = b"Subject: hi\r\n\r\nbody\r\n".to_vec();

        handler.handle(&mut state).await.unwrap();

        assert_eq!(state.envelope.data, b"Subject: hi\r\n\r\nbody\r\n".to_vec());
    }
}
