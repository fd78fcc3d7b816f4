//! Repository contract (§6): the storage boundary handlers and the session
//! layer consume. `memory` provides an in-process reference implementation
//! used by tests and as the default when no external store is configured.

mod memory;
mod traits;

pub use memory::InMemoryRepository;
pub use traits::{
    Mailbox, MailboxRepository, Message, MessageRepository, RepositoryError, User,
    UserRepository, INBOX, JUNK,
};

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;

/// Hashes a plaintext password for storage.
pub fn hash_password(plain: &str) -> Result<String, RepositoryError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| RepositoryError::Internal(e.to_string()))
}

/// Verifies a plaintext password against a stored hash.
pub fn check_password(hash: &str, plain: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(plain.as_bytes(), &parsed)
        .is_ok()
}
