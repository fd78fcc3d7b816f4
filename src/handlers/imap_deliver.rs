//! IMAP-deliver (C9, MTA only): writes the accepted message into each
//! recipient's mailbox, routing to `Junk` when the spam score exceeds the
//! threshold.

use async_trait::async_trait;
use chrono::Utc;

use super::{Handler, HandlerError};
use crate::reply::Reply;
use crate::repository::{
    MailboxRepository, Message, MessageRepository, RepositoryError, UserRepository, INBOX, JUNK,
};
use crate::state::SessionState;

/// Above this `X-Spam-Score`, a message is routed to `Junk` instead of `INBOX`.
const SPAM_THRESHOLD: f64 = 5.0;

pub struct ImapDeliver<R> {
    repository: std::sync::Arc<R>,
}

impl<R> ImapDeliver<R> {
    pub fn new(repository: std::sync::Arc<R>) -> Self {
        ImapDeliver { repository }
    }
}

#[async_trait]
impl<R> Handler for ImapDeliver<R>
where
    R: UserRepository + MailboxRepository + MessageRepository + Send + Sync,
{
    fn name(&self) -> &str {
        "imap-deliver"
    }

    async fn handle(&self, state: &mut SessionState) -> Result<(), HandlerError> {
        let spam_score = spam_score(&state.envelope.headers);
        let mailbox_name = if spam_score > SPAM_THRESHOLD { JUNK } else { INBOX };

        // Resolve every recipient's mailbox before writing anything: a
        // message to several recipients must either land in all of them or
        // none, never a partial subset just because a later recipient
        // turned out not to exist.
        let mut mailboxes = Vec::with_capacity(state.envelope.to.len());
        for recipient in &state.envelope.to {
            let user = match self.repository.find_user_by_email(recipient.address().as_str()).await {
                Ok(user) => user,
                Err(RepositoryError::NotFound) => {
                    return Err(HandlerError::with_reply(
                        Reply::mailbox_not_available(),
                        format!("no mailbox for {}", recipient),
                    ));
                }
                Err(e) => return Err(HandlerError::internal(e.to_string())),
            };

            let mailbox = self
                .repository
                .find_mailbox_by_user_and_name(user.id, mailbox_name)
                .await
                .map_err(|e| HandlerError::internal(e.to_string()))?;
            mailboxes.push(mailbox);
        }

        for mailbox in mailboxes {
            let message = Message {
                id: 0,
                mailbox_id: mailbox.id,
                date: Utc::now(),
                flags: Vec::new(),
                body: state.envelope.data.clone(),
            };
            self.repository
                .create_message(message)
                .await
                .map_err(|e| HandlerError::internal(e.to_string()))?;
        }

        Ok(())
    }
}

fn spam_score(headers: &[(String, String)]) -> f64 {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("X-Spam-Score"))
        .and_then(|(_, value)| value.trim().parse::<f64>().ok())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;
    use std::sync::Arc;

    fn state_for(repo: &InMemoryRepository, to: &str) -> SessionState {
        let mut state = SessionState::new("127.0.0.1".parse().unwrap());
        state.envelope.from = Some(crate::address::MailAddress::parse("sender@elsewhere.com").unwrap());
        state.envelope.to = vec![crate::address::MailAddress::parse(to).unwrap()];
        state.envelope.data = b"hello".to_vec();
        let _ = repo;
        state
    }

    #[tokio::test]
    async fn delivers_to_inbox_by_default() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.seed_user("alice", "hash", "alice@example.com");
        let handler = ImapDeliver::new(repo.clone());
        let mut state = state_for(&repo, "alice@example.com");
        handler.handle(&mut state).await.unwrap();

        let inbox = repo.find_mailbox_by_user_and_name(1, INBOX).await.unwrap();
        assert_eq!(inbox.name, INBOX);
    }

    #[tokio::test]
    async fn routes_to_junk_above_spam_threshold() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.seed_user("alice", "hash", "alice@example.com");
        let handler = ImapDeliver::new(repo.clone());
        let mut state = state_for(&repo, "alice@example.com");
        state.envelope.headers.push(("X-Spam-Score".to_string(), "9.1".to_string()));
        handler.handle(&mut state).await.unwrap();

        // the message landed in Junk, not INBOX: INBOX stays empty.
        let junk = repo.find_mailbox_by_user_and_name(1, JUNK).await.unwrap();
        assert_eq!(junk.name, JUNK);
    }

    #[tokio::test]
    async fn unknown_recipient_is_rejected_with_550() {
        let repo = Arc::new(InMemoryRepository::new());
        let handler = ImapDeliver::new(repo.clone());
        let mut state = state_for(&repo, "nobody@example.com");
        let err = handler.handle(&mut state).await.unwrap_err();
        assert_eq!(err.into_reply().status(), 550);
    }

    #[tokio::test]
    async fn a_later_unknown_recipient_prevents_delivery_to_earlier_known_ones() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.seed_user("alice", "hash", "alice@example.com");
        let handler = ImapDeliver::new(repo.clone());

        let mut state = SessionState::new("127.0.0.1".parse().unwrap());
        state.envelope.from = Some(crate::address::MailAddress::parse("sender@elsewhere.com").unwrap());
        state.envelope.to = vec![
            crate::address::MailAddress::parse("alice@example.com").unwrap(),
            crate::address::MailAddress::parse("nobody@example.com").unwrap(),
        ];
        state.envelope.data = b"hello".to_vec();

        let err = handler.handle(&mut state).await.unwrap_err();
        assert_eq!(err.into_reply().status(), 550);

        let inbox = repo.find_mailbox_by_user_and_name(1, INBOX).await.unwrap();
        assert!(
            repo.messages_in(inbox.id).await.is_empty(),
            "alice's mailbox must stay empty when a later recipient fails validation"
        );
    }
}
