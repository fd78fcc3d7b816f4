//! Handler chain (C8) and standard handlers (C9).
//!
//! A chain is an ordered sequence of handlers; the first to return an
//! error terminates the chain and that error propagates to the session.

pub mod header_merge;
pub mod imap_deliver;
pub mod message_id;
pub mod received;
pub mod relay;
pub mod spamcheck;
pub mod spf;

use async_trait::async_trait;

use crate::reply::Reply;
use crate::state::SessionState;

/// An error raised by a handler. `reply` carries the SMTP status this
/// error should surface as; `None` means "not reply-bearing", which the
/// chain runner maps to `451`.
#[derive(Debug)]
pub struct HandlerError {
    pub reply: Option<Reply>,
    pub message: String,
}

impl HandlerError {
    pub fn with_reply(reply: Reply, message: impl Into<String>) -> Self {
        HandlerError {
            reply: Some(reply),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        HandlerError {
            reply: None,
            message: message.into(),
        }
    }

    /// The chain's unknown-errors-map-to-451 rule.
    pub fn into_reply(self) -> Reply {
        self.reply.unwrap_or_else(Reply::requested_action_aborted)
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HandlerError {}

#[async_trait]
pub trait Handler: Send + Sync {
    /// A short name used in logs.
    fn name(&self) -> &str;

    async fn handle(&self, state: &mut SessionState) -> Result<(), HandlerError>;
}

/// An ordered, stateless-except-for-config sequence of handlers run once
/// per accepted message.
pub struct HandlerChain {
    handlers: Vec<Box<dyn Handler>>,
}

impl HandlerChain {
    pub fn new(handlers: Vec<Box<dyn Handler>>) -> Self {
        HandlerChain { handlers }
    }

    /// Runs the chain, stopping at the first error.
    pub async fn run(&self, state: &mut SessionState) -> Result<(), HandlerError> {
        for handler in &self.handlers {
            handler.handle(state).await.map_err(|e| {
                log::error!("handler {} failed: {}", handler.name(), e.message);
                e
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    struct Ok1;
    #[async_trait]
    impl Handler for Ok1 {
        fn name(&self) -> &str {
            "ok1"
        }
        async fn handle(&self, state: &mut SessionState) -> Result<(), HandlerError> {
            state.envelope.headers.push(("X-Ok1".to_string(), "yes".to_string()));
            Ok(())
        }
    }

    struct Fails;
    #[async_trait]
    impl Handler for Fails {
        fn name(&self) -> &str {
            "fails"
        }
        async fn handle(&self, _state: &mut SessionState) -> Result<(), HandlerError> {
            Err(HandlerError::with_reply(Reply::mailbox_not_available(), "no such mailbox"))
        }
    }

    struct NeverRuns;
    #[async_trait]
    impl Handler for NeverRuns {
        fn name(&self) -> &str {
            "never-runs"
        }
        async fn handle(&self, state: &mut SessionState) -> Result<(), HandlerError> {
            state.envelope.headers.push(("X-Should-Not-Run".to_string(), "".to_string()));
            Ok(())
        }
    }

    fn state() -> SessionState {
        SessionState::new("127.0.0.1".parse::<IpAddr>().unwrap())
    }

    #[tokio::test]
    async fn chain_runs_all_handlers_on_success() {
        let chain = HandlerChain::new(vec![Box::new(Ok1), Box::new(Ok1)]);
        let mut s = state();
        chain.run(&mut s).await.unwrap();
        assert_eq!(s.envelope.headers.len(), 2);
    }

    #[tokio::test]
    async fn chain_stops_at_first_error() {
        let chain = HandlerChain::new(vec![Box::new(Ok1), Box::new(Fails), Box::new(NeverRuns)]);
        let mut s = state();
        let err = chain.run(&mut s).await.unwrap_err();
        assert_eq!(err.into_reply().status(), 550);
        assert_eq!(s.envelope.headers.len(), 1);
    }
}
