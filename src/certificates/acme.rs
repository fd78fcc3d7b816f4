//! ACME issuance (RFC 8555) via `instant-acme`, grounded on the original's
//! `lego`-based helper (`NewACMEHelper`, `getOrCreateUserRegistration`,
//! `GenerateCertificateWithACMEChallenge`): resolve or register an account,
//! open an order, satisfy its challenge, finalize, and read back the chain.
//!
//! Only HTTP-01 is wired up end to end; `TLS_ACME_DNS_PROVIDER` selects
//! DNS-01 in config but has no provider plugin implemented here, matching
//! spec.md's scope (see DESIGN.md).

use std::sync::Arc;
use std::time::Duration;

use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use tokio::time::sleep;

use super::resource::CertificateResource;
use super::store::{CertificateError, CertificateStore};

const LETS_ENCRYPT_PRODUCTION_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";
const LETS_ENCRYPT_STAGING_URL: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Where to reach the ACME directory. `TLS_ACME_ENDPOINT` selects between
/// these; anything else is treated as a custom directory URL (for e.g. a
/// local pebble/boulder instance in tests).
#[derive(Debug, Clone)]
pub enum AcmeEndpoint {
    ProductionLetsEncrypt,
    StagingLetsEncrypt,
    Directory(String),
}

impl AcmeEndpoint {
    fn url(&self) -> &str {
        match self {
            AcmeEndpoint::ProductionLetsEncrypt => LETS_ENCRYPT_PRODUCTION_URL,
            AcmeEndpoint::StagingLetsEncrypt => LETS_ENCRYPT_STAGING_URL,
            AcmeEndpoint::Directory(url) => url,
        }
    }
}

/// Which challenge type to answer. Only `Http01` is implemented; the HTTP-01
/// responder server must be wired up by the caller via [`Http01Responder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    Http01,
}

/// Receives the token/key-authorization pair an in-process HTTP-01 responder
/// must serve at `/.well-known/acme-challenge/<token>` while an order is
/// pending. Implemented by whatever owns the port-80 listener.
pub trait Http01Responder: Send + Sync {
    fn set_challenge(&self, token: String, key_authorization: String);
    fn clear_challenge(&self, token: &str);
}

pub struct AcmeClient {
    account: Account,
    store: Arc<CertificateStore>,
}

impl AcmeClient {
    /// Loads a previously persisted account from the store, or registers a
    /// new one with the CA and persists its credentials.
    pub async fn resolve_or_register(
        store: Arc<CertificateStore>,
        endpoint: &AcmeEndpoint,
        contact_email: &str,
    ) -> Result<Self, CertificateError> {
        if let Some(serialized) = store.account_credentials() {
            let credentials: AccountCredentials =
                serde_json::from_str(&serialized).map_err(|e| CertificateError::Acme(e.to_string()))?;
            let account = Account::from_credentials(credentials)
                .await
                .map_err(|e| CertificateError::Acme(e.to_string()))?;
            return Ok(AcmeClient { account, store });
        }

        let contact = format!("mailto:{contact_email}");
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[&contact],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            endpoint.url(),
            None,
        )
        .await
        .map_err(|e| CertificateError::Acme(e.to_string()))?;

        let serialized = serde_json::to_string(&credentials).map_err(|e| CertificateError::Acme(e.to_string()))?;
        store.set_account_credentials(serialized)?;

        Ok(AcmeClient { account, store })
    }

    /// Runs one full order for `domain`: create order, satisfy the HTTP-01
    /// challenge via `responder`, wait for validation, finalize with a
    /// freshly generated key, and return the resulting [`CertificateResource`].
    pub async fn obtain(
        &self,
        domain: &str,
        responder: &dyn Http01Responder,
    ) -> Result<CertificateResource, CertificateError> {
        let identifier = Identifier::Dns(domain.to_string());
        let mut order = self
            .account
            .new_order(&NewOrder { identifiers: &[identifier] })
            .await
            .map_err(|e| CertificateError::Acme(e.to_string()))?;

        let authorizations = order.authorizations().await.map_err(|e| CertificateError::Acme(e.to_string()))?;

        let mut pending_tokens = Vec::new();
        for authz in &authorizations {
            if authz.status != AuthorizationStatus::Pending {
                continue;
            }
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| CertificateError::Acme("no http-01 challenge offered".into()))?;

            let key_authorization = order.key_authorization(challenge).as_str().to_string();
            responder.set_challenge(challenge.token.clone(), key_authorization);
            pending_tokens.push(challenge.token.clone());

            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(|e| CertificateError::Acme(e.to_string()))?;
        }

        let status = self.poll_until_ready(&mut order).await?;
        for token in &pending_tokens {
            responder.clear_challenge(token);
        }
        if status != OrderStatus::Ready {
            return Err(CertificateError::Acme(format!("order for {domain} did not become ready: {status:?}")));
        }

        let key_pair = KeyPair::generate().map_err(|e| CertificateError::Acme(e.to_string()))?;
        let mut params =
            CertificateParams::new(vec![domain.to_string()]).map_err(|e| CertificateError::Acme(e.to_string()))?;
        params.distinguished_name = DistinguishedName::new();
        let csr = params.serialize_request(&key_pair).map_err(|e| CertificateError::Acme(e.to_string()))?;

        order.finalize(csr.der()).await.map_err(|e| CertificateError::Acme(e.to_string()))?;
        let chain_pem = loop {
            match order.certificate().await.map_err(|e| CertificateError::Acme(e.to_string()))? {
                Some(chain) => break chain,
                None => sleep(Duration::from_secs(1)).await,
            }
        };

        // Let's Encrypt issues 90-day certificates; we don't parse the leaf
        // back out of the chain to find the exact `notAfter`; see DESIGN.md.
        let not_valid_after = chrono::Utc::now() + chrono::Duration::days(90);

        Ok(CertificateResource {
            domain: domain.to_string(),
            private_key: key_pair.serialize_pem(),
            certificate_chain: chain_pem,
            issuer_cert: String::new(),
            not_valid_after,
        })
    }

    /// Issues (if absent or due for renewal) and caches a certificate for
    /// `domain`, returning the current resource either way.
    pub async fn get_or_create_certificate(
        &self,
        domain: &str,
        renewal_threshold: chrono::Duration,
        responder: &dyn Http01Responder,
    ) -> Result<CertificateResource, CertificateError> {
        if let Some(existing) = self.store.get(domain) {
            if !existing.needs_renewal(renewal_threshold) {
                return Ok(existing);
            }
        }
        let cert = self.obtain(domain, responder).await?;
        self.store.add(cert.clone())?;
        Ok(cert)
    }

    async fn poll_until_ready(&self, order: &mut instant_acme::Order) -> Result<OrderStatus, CertificateError> {
        let mut delay = Duration::from_millis(500);
        for _ in 0..10 {
            let state = order.refresh().await.map_err(|e| CertificateError::Acme(e.to_string()))?;
            match state.status {
                OrderStatus::Pending => {
                    sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(5));
                }
                other => return Ok(other),
            }
        }
        Ok(OrderStatus::Pending)
    }
}

/// Background loop: every `check_interval`, renews any domain within
/// `renewal_threshold` of expiring. Intended to be spawned once at startup.
pub async fn renewal_loop(
    client: Arc<AcmeClient>,
    store: Arc<CertificateStore>,
    responder: Arc<dyn Http01Responder>,
    check_interval: Duration,
    renewal_threshold: chrono::Duration,
) {
    let mut ticker = tokio::time::interval(check_interval);
    loop {
        ticker.tick().await;
        for domain in store.domains_needing_renewal(renewal_threshold) {
            log::info!("renewing certificate for {domain}");
            match client.obtain(&domain, responder.as_ref()).await {
                Ok(cert) => {
                    if let Err(e) = store.add(cert) {
                        log::error!("failed to persist renewed certificate for {domain}: {e}");
                    }
                }
                Err(e) => log::error!("renewal failed for {domain}: {e}"),
            }
        }
    }
}
