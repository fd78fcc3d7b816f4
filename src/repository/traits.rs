//! Entity shapes and the async repository traits handlers depend on (§6).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub const INBOX: &str = "INBOX";
pub const JUNK: &str = "Junk";

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("not found")]
    NotFound,
    #[error("internal repository error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: u64,
    pub username: String,
    pub password_hash: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub id: u64,
    pub user_id: u64,
    pub name: String,
    pub subscribed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u64,
    pub mailbox_id: u64,
    pub date: DateTime<Utc>,
    pub flags: Vec<String>,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_user_by_email(&self, email: &str) -> Result<User, RepositoryError>;
    async fn create_user(&self, user: User) -> Result<User, RepositoryError>;
    async fn update_user(&self, user: User) -> Result<(), RepositoryError>;
    async fn delete_user(&self, id: u64) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait MailboxRepository: Send + Sync {
    async fn find_mailbox_by_user_and_name(
        &self,
        user_id: u64,
        name: &str,
    ) -> Result<Mailbox, RepositoryError>;

    async fn create_mailbox(&self, mailbox: Mailbox) -> Result<Mailbox, RepositoryError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// `message.id` is ignored on input and assigned by the store,
    /// monotonically increasing within `message.mailbox_id`.
    async fn create_message(&self, message: Message) -> Result<Message, RepositoryError>;
}
