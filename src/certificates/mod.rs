//! Certificate lifecycle (C11): on-disk cache plus ACME issuance/renewal,
//! and the `rustls::ServerConfig` that STARTTLS hands to `tokio_rustls`.
//!
//! Grounded on the original's `backend/services/certificates/*.go`
//! (`CertificateResource`, the `certs.json` cache, and the `lego`-based
//! ACME helper), reworked around `instant-acme` and `rcgen`.

mod acme;
mod http01;
mod resource;
mod store;

pub use acme::{renewal_loop, AcmeClient, AcmeEndpoint, ChallengeKind, Http01Responder};
pub use http01::{run as http01_serve, InMemoryHttp01Responder};
pub use resource::CertificateResource;
pub use store::{CertificateError, CertificateStore};

use std::io::Cursor;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;

/// How close to expiry a cached certificate must be before the renewal loop
/// (or a just-in-time `GetOrCreateTlsConfig` call) replaces it.
pub const DEFAULT_RENEWAL_THRESHOLD_DAYS: i64 = 30;

/// Ties the on-disk store to an (optional) ACME client and builds TLS
/// configs on demand. Without an `acme` client, `tls_config_for` only ever
/// serves certificates that are already cached (e.g. provided via
/// `TLS_CERTIFICATE_FILE`/`TLS_PRIVATE_KEY_FILE`).
pub struct CertificateService {
    store: Arc<CertificateStore>,
    acme: Option<Arc<AcmeClient>>,
    responder: Option<Arc<dyn Http01Responder>>,
}

impl CertificateService {
    pub fn new(store: Arc<CertificateStore>) -> Self {
        CertificateService { store, acme: None, responder: None }
    }

    pub fn with_acme(mut self, acme: Arc<AcmeClient>, responder: Arc<dyn Http01Responder>) -> Self {
        self.acme = Some(acme);
        self.responder = Some(responder);
        self
    }

    /// Installs a statically configured certificate/key pair, bypassing
    /// ACME entirely (the `TLS_CERTIFICATE_FILE`/`TLS_PRIVATE_KEY_FILE` path).
    pub fn install_static(
        &self,
        domain: &str,
        certificate_chain: String,
        private_key: String,
        not_valid_after: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), CertificateError> {
        self.store.add(CertificateResource {
            domain: domain.to_string(),
            private_key,
            certificate_chain,
            issuer_cert: String::new(),
            not_valid_after,
        })
    }

    /// Issues a certificate for `domain` if none is cached (or the cached
    /// one is due for renewal), then returns a `ServerConfig` whose resolver
    /// always re-reads the store, so a background renewal is picked up by
    /// the next handshake without restarting the listener.
    pub async fn get_or_create_tls_config(&self, domain: &str) -> Result<Arc<ServerConfig>, CertificateError> {
        let threshold = chrono::Duration::days(DEFAULT_RENEWAL_THRESHOLD_DAYS);
        if self.store.get(domain).map(|c| c.needs_renewal(threshold)).unwrap_or(true) {
            if let (Some(acme), Some(responder)) = (&self.acme, &self.responder) {
                acme.get_or_create_certificate(domain, threshold, responder.as_ref()).await?;
            } else if self.store.get(domain).is_none() {
                return Err(CertificateError::NotAvailable(domain.to_string()));
            }
        }

        let resolver = DomainCertResolver { store: self.store.clone(), domain: domain.to_string() };
        Ok(Arc::new(
            ServerConfig::builder().with_no_client_auth().with_cert_resolver(Arc::new(resolver)),
        ))
    }
}

/// Resolves the certificate for one fixed domain out of the live store, so
/// ACME renewals become visible to new handshakes without rebuilding the
/// `ServerConfig`.
struct DomainCertResolver {
    store: Arc<CertificateStore>,
    domain: String,
}

impl std::fmt::Debug for DomainCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainCertResolver").field("domain", &self.domain).finish()
    }
}

impl ResolvesServerCert for DomainCertResolver {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let cert = self.store.get(&self.domain)?;
        certified_key_from_pem(&cert.certificate_chain, &cert.private_key)
    }
}

fn certified_key_from_pem(chain_pem: &str, key_pem: &str) -> Option<Arc<CertifiedKey>> {
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut Cursor::new(chain_pem.as_bytes()))
        .filter_map(Result::ok)
        .collect();
    if chain.is_empty() {
        return None;
    }

    let key_der: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut Cursor::new(key_pem.as_bytes())).ok().flatten()?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der).ok()?;
    Some(Arc::new(CertifiedKey::new(chain, signing_key)))
}
