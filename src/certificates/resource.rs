//! A CA-issued certificate and its private key, as cached by the store.
//! Field names follow `CertificateResource` from spec.md §3, trimmed down
//! from the original's `certificate_resource.go` (which also carries the
//! `CertURL`/`CSR` bookkeeping fields `lego` needs; we only keep what
//! `GetOrCreateTlsConfig` actually serves).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateResource {
    pub domain: String,
    /// PEM-encoded private key.
    pub private_key: String,
    /// PEM-encoded leaf certificate plus any intermediates, in order.
    pub certificate_chain: String,
    /// PEM-encoded issuer certificate, kept separately for reference.
    pub issuer_cert: String,
    pub not_valid_after: DateTime<Utc>,
}

impl CertificateResource {
    /// Whether this resource is within `threshold` of expiring.
    pub fn needs_renewal(&self, threshold: chrono::Duration) -> bool {
        self.not_valid_after - Utc::now() < threshold
    }
}
