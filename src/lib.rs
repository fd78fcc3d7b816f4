//! Orchestrates application startup: configuration, the shared repository
//! and certificate service, the MTA (incoming) and MSA (outgoing/submission)
//! listeners, and the health endpoint — then runs all of them until a
//! shutdown signal arrives, draining in-flight sessions gracefully.

pub mod address;
pub mod blacklist;
pub mod certificates;
pub mod command;
pub mod config;
pub mod handlers;
pub mod health;
pub mod io;
pub mod login_attempts;
pub mod protocol;
pub mod reply;
pub mod repository;
pub mod server;
pub mod session;
pub mod state;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info};
use tokio::select;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use blacklist::{Blacklist, HttpBlacklist, NoBlacklist};
use certificates::{AcmeClient, AcmeEndpoint, CertificateService, CertificateStore, InMemoryHttp01Responder};
use config::{AcmeChallenge, Config, OutgoingMode};
use handlers::header_merge::HeaderMerge;
use handlers::imap_deliver::ImapDeliver;
use handlers::message_id::MessageId;
use handlers::received::Received;
use handlers::relay::{Relay, RelayConfig as RelayHandlerConfig};
use handlers::spamcheck::SpamCheck;
use handlers::spf::{HickoryDnsResolver, Spf};
use handlers::{Handler, HandlerChain};
use io::data::{DataReader, DEFAULT_MAX_MESSAGE_SIZE};
use login_attempts::{LoginAttempts, DEFAULT_BLOCK_DURATION, DEFAULT_MAX_ATTEMPTS};
use repository::InMemoryRepository;
use server::Server;
use session::{Role, SessionConfig};

/// Runs the application: loads configuration, wires the shared repository,
/// certificate service and handler chains, and serves the MTA, MSA and
/// health listeners until `Ctrl-C` (or another external shutdown) arrives.
pub async fn run() -> Result<()> {
    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    let repository = Arc::new(InMemoryRepository::new());
    let login_attempts = Arc::new(LoginAttempts::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BLOCK_DURATION));
    let data_reader = DataReader::new(DEFAULT_MAX_MESSAGE_SIZE);

    let blacklist: Arc<dyn Blacklist> = match &config.blacklist_url {
        Some(url) => Arc::new(HttpBlacklist::fetch(url).await.with_context(|| format!("fetching blacklist from {url}"))?),
        None => Arc::new(NoBlacklist),
    };

    let tls_acceptor = build_tls_acceptor(&config).await?;

    let incoming_chain = Arc::new(HandlerChain::new(build_incoming_handlers(&config, repository.clone())));
    let outgoing_chain = Arc::new(HandlerChain::new(build_outgoing_handlers(&config)?));

    let mta_config = Arc::new(SessionConfig {
        hostname: config.hostname.clone(),
        our_ip: local_ip_hint(&config.smtp_address_incoming),
        role: Role::Mta,
        tls_acceptor: tls_acceptor.clone(),
        handler_chain: incoming_chain,
        login_attempts: login_attempts.clone(),
        user_repository: repository.clone(),
        data_reader: data_reader.clone(),
    });

    let msa_config = Arc::new(SessionConfig {
        hostname: config.hostname.clone(),
        our_ip: local_ip_hint(&config.smtp_address_outgoing),
        role: Role::Msa,
        tls_acceptor,
        handler_chain: outgoing_chain,
        login_attempts,
        user_repository: repository,
        data_reader,
    });

    let mta_server = Server::new(config.smtp_address_incoming.clone(), mta_config, blacklist.clone());
    let msa_server = Server::new(config.smtp_address_outgoing.clone(), msa_config, blacklist);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut mta_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { mta_server.listen_and_serve(shutdown_rx).await }
    });
    let mut msa_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move { msa_server.listen_and_serve(shutdown_rx).await }
    });
    let health_config = config.clone();
    let mut health_handle = tokio::spawn(async move { health::run_health_server(health_config).await });

    select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, draining connections");
            let _ = shutdown_tx.send(true);
            flatten((&mut mta_handle).await, "MTA listener")?;
            flatten((&mut msa_handle).await, "MSA listener")?;
            Ok(())
        }
        res = &mut mta_handle => {
            error!("MTA listener terminated unexpectedly");
            flatten(res, "MTA listener")
        }
        res = &mut msa_handle => {
            error!("MSA listener terminated unexpectedly");
            flatten(res, "MSA listener")
        }
        res = &mut health_handle => {
            error!("health server terminated unexpectedly");
            flatten(res, "health server")
        }
    }
}

fn flatten(res: std::result::Result<Result<()>, tokio::task::JoinError>, component: &str) -> Result<()> {
    match res {
        Ok(Ok(())) => Err(anyhow::anyhow!("{component} exited cleanly, which is unexpected")),
        Ok(Err(e)) => Err(e),
        Err(join_error) => Err(anyhow::anyhow!("{component} panicked: {join_error}")),
    }
}

fn build_incoming_handlers(config: &Config, repository: Arc<InMemoryRepository>) -> Vec<Box<dyn Handler>> {
    let our_ip = local_ip_hint(&config.smtp_address_incoming);
    let mut handlers: Vec<Box<dyn Handler>> = vec![
        Box::new(Received::new(config.hostname.clone(), our_ip)),
        Box::new(MessageId::new(config.hostname.clone())),
    ];
    if let Ok(resolver) = HickoryDnsResolver::new() {
        handlers.push(Box::new(Spf::new(config.hostname.clone(), Box::new(resolver))));
    } else {
        log::warn!("failed to initialize SPF resolver; SPF checking disabled");
    }
    if config.spam_check_enable {
        handlers.push(Box::new(SpamCheck::new(reqwest::Client::new())));
    }
    handlers.push(Box::new(HeaderMerge));
    handlers.push(Box::new(ImapDeliver::new(repository)));
    handlers
}

fn build_outgoing_handlers(config: &Config) -> Result<Vec<Box<dyn Handler>>> {
    let our_ip = local_ip_hint(&config.smtp_address_outgoing);
    let mut handlers: Vec<Box<dyn Handler>> = vec![
        Box::new(Received::new(config.hostname.clone(), our_ip)),
        Box::new(MessageId::new(config.hostname.clone())),
        Box::new(HeaderMerge),
    ];
    if config.smtp_outgoing_mode == OutgoingMode::Relay {
        let relay_config = config.relay.as_ref().expect("validated: relay mode requires relay config");
        let relay = Relay::new(RelayHandlerConfig {
            hostname: relay_config.hostname.clone(),
            port: relay_config.port,
            username: relay_config.username.clone(),
            password: relay_config.password.clone(),
            insecure_skip_verify: relay_config.insecure_skip_verify,
        })
        .map_err(|e| anyhow::anyhow!("failed to build relay transport: {e}"))?;
        handlers.push(Box::new(relay));
    }
    Ok(handlers)
}

/// Builds the shared `TlsAcceptor` from either a static cert/key pair or an
/// ACME-issued certificate, per `config.tls`. `None` when TLS is disabled.
async fn build_tls_acceptor(config: &Config) -> Result<Option<TlsAcceptor>> {
    if config.tls.disable {
        return Ok(None);
    }

    let store = Arc::new(CertificateStore::open(config.tls.certificates_directory.as_str())?);

    let mut service = CertificateService::new(store.clone());

    if let (Some(cert_path), Some(key_path)) = (&config.tls.certificate_file, &config.tls.private_key_file) {
        let certificate_chain = std::fs::read_to_string(cert_path)
            .with_context(|| format!("reading TLS_CERTIFICATE_FILE {cert_path}"))?;
        let private_key = std::fs::read_to_string(key_path)
            .with_context(|| format!("reading TLS_PRIVATE_KEY_FILE {key_path}"))?;
        service.install_static(
            &config.hostname,
            certificate_chain,
            private_key,
            chrono::Utc::now() + chrono::Duration::days(365),
        )?;
    } else if let (Some(challenge), Some(email)) = (&config.tls.acme_challenge, &config.tls.acme_email) {
        let endpoint = match config.tls.acme_endpoint.as_deref() {
            None | Some("") | Some("production") => AcmeEndpoint::ProductionLetsEncrypt,
            Some("staging") => AcmeEndpoint::StagingLetsEncrypt,
            Some(url) => AcmeEndpoint::Directory(url.to_string()),
        };
        let acme = Arc::new(AcmeClient::resolve_or_register(store.clone(), &endpoint, email).await?);

        match challenge {
            AcmeChallenge::Http01 => {
                let responder = Arc::new(InMemoryHttp01Responder::default());
                tokio::spawn({
                    let responder = responder.clone();
                    async move {
                        if let Err(e) = certificates::http01_serve("0.0.0.0:80", responder).await {
                            error!("HTTP-01 responder stopped: {e}");
                        }
                    }
                });
                tokio::spawn(certificates::renewal_loop(
                    acme.clone(),
                    store.clone(),
                    responder.clone(),
                    std::time::Duration::from_secs(24 * 60 * 60),
                    chrono::Duration::days(certificates::DEFAULT_RENEWAL_THRESHOLD_DAYS),
                ));
                service = service.with_acme(acme, responder);
            }
            AcmeChallenge::Dns01 => {
                return Err(anyhow::anyhow!(
                    "TLS_ACME_CHALLENGE=DNS-01 has no provider plugin implemented"
                ));
            }
        }
    }

    let tls_config = service.get_or_create_tls_config(&config.hostname).await?;
    Ok(Some(TlsAcceptor::from(tls_config)))
}

/// Best-effort IP string for the `Received:` header when we only know the
/// bind address (which may be `0.0.0.0`). Good enough for a trace header;
/// not used for any security decision.
fn local_ip_hint(bind_addr: &str) -> String {
    bind_addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(bind_addr).to_string()
}
