//! RFC 5321 mail address parsing (C1).
//!
//! Splits a raw address on the *last* `@` so quoted locals containing `@`
//! are tolerated, validates the RFC 5321 §4.5.3.1.1/.2 length limits before
//! doing any semantic parsing, and accepts the angle-bracket forms SMTP
//! commands actually use (`<x@y>`, padded with spaces, or bare `x@y`).

use std::fmt;

/// Maximum length of the local part of an address (RFC 5321 §4.5.3.1.1).
pub const MAX_LOCAL_LEN: usize = 64;
/// Maximum length of the domain part of an address (RFC 5321 §4.5.3.1.2).
pub const MAX_DOMAIN_LEN: usize = 255;

/// A parsed `local@domain` mail address.
///
/// Constructed only through [`MailAddress::parse`]; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MailAddress {
    local: String,
    domain: String,
}

/// Error returned when a raw address string cannot be parsed.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address is missing an '@' separator")]
    MissingAt,
    #[error("local part exceeds {MAX_LOCAL_LEN} octets")]
    LocalTooLong,
    #[error("domain part exceeds {MAX_DOMAIN_LEN} octets")]
    DomainTooLong,
    #[error("local part is empty")]
    EmptyLocal,
    #[error("domain part is empty")]
    EmptyDomain,
}

impl MailAddress {
    /// Parses a raw address, tolerating surrounding whitespace and a single
    /// pair of angle brackets (`MAIL FROM:<a@b>`, `RCPT TO: <a@b> `).
    pub fn parse(raw: &str) -> Result<Self, AddressError> {
        let trimmed = raw.trim();
        let inner = strip_angle_brackets(trimmed);

        let at_index = inner.rfind('@').ok_or(AddressError::MissingAt)?;
        let local = &inner[..at_index];
        let domain = &inner[at_index + 1..];

        if local.is_empty() {
            return Err(AddressError::EmptyLocal);
        }
        if domain.is_empty() {
            return Err(AddressError::EmptyDomain);
        }
        if local.len() > MAX_LOCAL_LEN {
            return Err(AddressError::LocalTooLong);
        }
        if domain.len() > MAX_DOMAIN_LEN {
            return Err(AddressError::DomainTooLong);
        }

        Ok(MailAddress {
            local: local.to_string(),
            domain: domain.to_string(),
        })
    }

    /// The local part (case-sensitive, preserved as written).
    pub fn local(&self) -> &str {
        &self.local
    }

    /// The domain part.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The full `local@domain` address.
    pub fn address(&self) -> String {
        format!("{}@{}", self.local, self.domain)
    }
}

impl fmt::Display for MailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

/// Strips one layer of `<...>` if the string is fully wrapped in angle
/// brackets; a bare local part with an unmatched bracket is left untouched
/// so the length/`@` checks can produce a precise error.
fn strip_angle_brackets(s: &str) -> &str {
    if let Some(stripped) = s.strip_prefix('<') {
        if let Some(stripped) = stripped.strip_suffix('>') {
            return stripped.trim();
        }
    }
    s
}
