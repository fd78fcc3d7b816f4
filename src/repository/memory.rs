//! In-process reference repository. Used by tests and as the default store
//! when no external database is configured; not meant for production use
//! (state is lost on restart).

use async_trait::async_trait;
use parking_lot::Mutex;

use super::traits::{
    Mailbox, MailboxRepository, Message, MessageRepository, RepositoryError, User,
    UserRepository, INBOX, JUNK,
};

#[derive(Default)]
pub struct InMemoryRepository {
    users: Mutex<Vec<User>>,
    mailboxes: Mutex<Vec<Mailbox>>,
    messages: Mutex<Vec<Message>>,
    next_user_id: Mutex<u64>,
    next_mailbox_id: Mutex<u64>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a user along with its `INBOX` and `Junk` mailboxes, the way
    /// account provisioning would in a real store. Returns the created user.
    pub fn seed_user(&self, username: &str, password_hash: &str, email: &str) -> User {
        let mut next_id = self.next_user_id.lock();
        *next_id += 1;
        let user = User {
            id: *next_id,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            email: email.to_string(),
        };
        self.users.lock().push(user.clone());
        drop(next_id);

        for name in [INBOX, JUNK] {
            let mut next_mailbox_id = self.next_mailbox_id.lock();
            *next_mailbox_id += 1;
            self.mailboxes.lock().push(Mailbox {
                id: *next_mailbox_id,
                user_id: user.id,
                name: name.to_string(),
                subscribed: true,
            });
        }
        user
    }

    /// Snapshot of the messages stored in one mailbox. Used by tests to
    /// assert on delivery (or its absence) without going through IMAP.
    pub async fn messages_in(&self, mailbox_id: u64) -> Vec<Message> {
        self.messages.lock().iter().filter(|m| m.mailbox_id == mailbox_id).cloned().collect()
    }
}

#[async_trait]
impl UserRepository for InMemoryRepository {
    async fn find_user_by_email(&self, email: &str) -> Result<User, RepositoryError> {
        self.users
            .lock()
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }

    async fn create_user(&self, mut user: User) -> Result<User, RepositoryError> {
        let mut next_id = self.next_user_id.lock();
        *next_id += 1;
        user.id = *next_id;
        self.users.lock().push(user.clone());
        Ok(user)
    }

    async fn update_user(&self, user: User) -> Result<(), RepositoryError> {
        let mut users = self.users.lock();
        let existing = users.iter_mut().find(|u| u.id == user.id).ok_or(RepositoryError::NotFound)?;
        *existing = user;
        Ok(())
    }

    async fn delete_user(&self, id: u64) -> Result<(), RepositoryError> {
        let mut users = self.users.lock();
        let before = users.len();
        users.retain(|u| u.id != id);
        if users.len() == before {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}

#[async_trait]
impl MailboxRepository for InMemoryRepository {
    async fn find_mailbox_by_user_and_name(
        &self,
        user_id: u64,
        name: &str,
    ) -> Result<Mailbox, RepositoryError> {
        self.mailboxes
            .lock()
            .iter()
            .find(|m| m.user_id == user_id && m.name == name)
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }

    async fn create_mailbox(&self, mailbox: Mailbox) -> Result<Mailbox, RepositoryError> {
        let mut next_id = self.next_mailbox_id.lock();
        *next_id += 1;
        let mut mailbox = mailbox;
        mailbox.id = *next_id;
        self.mailboxes.lock().push(mailbox.clone());
        Ok(mailbox)
    }
}

#[async_trait]
impl MessageRepository for InMemoryRepository {
    async fn create_message(&self, mut message: Message) -> Result<Message, RepositoryError> {
        // IDs are assigned per mailbox, monotonically increasing, so they
        // can double as IMAP UIDs honoring UIDVALIDITY within one mailbox.
        let mut messages = self.messages.lock();
        let next_id = messages
            .iter()
            .filter(|m| m.mailbox_id == message.mailbox_id)
            .map(|m| m.id)
            .max()
            .map(|id| id + 1)
            .unwrap_or(1);
        message.id = next_id;
        messages.push(message.clone());
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn seeded_user_is_findable_by_email() {
        let repo = InMemoryRepository::new();
        repo.seed_user("alice", "hash", "alice@example.com");
        let found = repo.find_user_by_email("alice@example.com").await.unwrap();
        assert_eq!(found.username, "alice");
    }

    #[tokio::test]
    async fn unknown_email_is_not_found() {
        let repo = InMemoryRepository::new();
        let err = repo.find_user_by_email("nobody@example.com").await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn message_ids_are_monotonic_per_mailbox() {
        let repo = InMemoryRepository::new();
        let user = repo.seed_user("bob", "hash", "bob@example.com");
        let inbox = repo.find_mailbox_by_user_and_name(user.id, INBOX).await.unwrap();
        let junk = repo.find_mailbox_by_user_and_name(user.id, JUNK).await.unwrap();

        let m1 = repo
            .create_message(Message { id: 0, mailbox_id: inbox.id, date: Utc::now(), flags: vec![], body: vec![] })
            .await
            .unwrap();
        let m2 = repo
            .create_message(Message { id: 0, mailbox_id: inbox.id, date: Utc::now(), flags: vec![], body: vec![] })
            .await
            .unwrap();
        let j1 = repo
            .create_message(Message { id: 0, mailbox_id: junk.id, date: Utc::now(), flags: vec![], body: vec![] })
            .await
            .unwrap();

        assert_eq!(m1.id, 1);
        assert_eq!(m2.id, 2);
        // A different mailbox's numbering is independent, unlike the
        // globally-ordered `id desc` scheme this store deliberately avoids.
        assert_eq!(j1.id, 1);
    }
}
