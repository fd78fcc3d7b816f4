//! Manages application configuration loaded from environment variables.
//!
//! This module defines the `Config` struct which holds all runtime settings
//! and provides `from_env` to populate it. It supports loading variables
//! from a `.env` file via the `dotenv` crate and applies the original's
//! `config.go Validate()` rules on top of its own defaults.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// How outgoing mail leaves this server. Only `Relay` is implemented;
/// direct outbound MX delivery is an explicit non-goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutgoingMode {
    Disabled,
    Relay,
}

/// Which ACME challenge type to answer when issuing certificates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcmeChallenge {
    Http01,
    Dns01,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub disable: bool,
    pub certificate_file: Option<String>,
    pub private_key_file: Option<String>,
    pub acme_challenge: Option<AcmeChallenge>,
    pub acme_email: Option<String>,
    pub acme_endpoint: Option<String>,
    pub acme_dns_provider: Option<String>,
    pub certificates_directory: String,
}

/// Holds the application's runtime configuration settings, loaded from
/// environment variables via [`Config::from_env`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// `HOSTNAME`: the name this server presents in greetings and `Received:`.
    pub hostname: String,

    /// `SMTP_ADDRESS_INCOMING`: where the MTA listener binds.
    pub smtp_address_incoming: String,
    /// `SMTP_ADDRESS_OUTGOING`: where the MSA (submission) listener binds.
    pub smtp_address_outgoing: String,
    pub smtp_outgoing_mode: OutgoingMode,

    /// `IMAP_ADDRESS`: where the IMAP listener binds (external collaborator;
    /// only the bind address is this crate's concern).
    pub imap_address: String,
    /// `HTTP_ADDRESS`: admin/REST API bind address (external collaborator).
    pub http_address: String,
    /// `METRICS_ADDRESS`: liveness/health bind address.
    pub metrics_address: String,

    /// `DATABASE_URL`: connection string for the external store. Unused by
    /// the in-memory repository but threaded through for completeness.
    pub database_url: Option<String>,
    /// `SECRET`: application-wide secret (session/cookie signing etc).
    pub secret: String,

    pub subdomain_incoming: Option<String>,
    pub subdomain_outgoing: Option<String>,
    pub subdomain_imap: Option<String>,

    pub tls: TlsConfig,
    pub relay: Option<RelayConfig>,

    /// `SPAM_CHECK_ENABLE`: whether the spam-check handler runs at all.
    pub spam_check_enable: bool,
    /// `BLACKLIST_URL`: IP blacklist source; `None` disables blacklisting.
    pub blacklist_url: Option<String>,
    /// `SENTRY_DSN`: error reporting sink, external collaborator.
    pub sentry_dsn: Option<String>,
    /// `LOG_FULL_QUERIES`: verbose SQL logging, external collaborator flag.
    pub log_full_queries: bool,
}

impl Config {
    /// Loads configuration from environment variables, applying the
    /// defaults and validation rules of the original `config.go`.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if a required variable is missing, a typed variable
    /// fails to parse, or [`Config::validate`] rejects the combination.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv::dotenv();

        let hostname = required_env("HOSTNAME")?;
        log::info!("Config: using hostname: {}", hostname);

        let smtp_address_incoming = env_or_default("SMTP_ADDRESS_INCOMING", "0.0.0.0:25");
        let smtp_address_outgoing = env_or_default("SMTP_ADDRESS_OUTGOING", "0.0.0.0:587");

        let smtp_outgoing_mode = match env::var("SMTP_OUTGOING_MODE").ok().as_deref() {
            None | Some("") => OutgoingMode::Disabled,
            Some("RELAY") => OutgoingMode::Relay,
            Some(other) => return Err(anyhow!("SMTP_OUTGOING_MODE must be RELAY, got '{}'", other)),
        };

        let imap_address = env_or_default("IMAP_ADDRESS", "0.0.0.0:143");
        let http_address = env_or_default("HTTP_ADDRESS", "0.0.0.0:8080");
        let metrics_address = env_or_default("METRICS_ADDRESS", "0.0.0.0:9000");

        let database_url = env::var("DATABASE_URL").ok();
        let secret = env::var("SECRET").unwrap_or_default();

        let subdomain_incoming = env::var("SUBDOMAIN_INCOMING").ok();
        let subdomain_outgoing = env::var("SUBDOMAIN_OUTGOING").ok();
        let subdomain_imap = env::var("SUBDOMAIN_IMAP").ok();

        let tls = TlsConfig {
            disable: parse_bool_env("TLS_DISABLE", false)?,
            certificate_file: env::var("TLS_CERTIFICATE_FILE").ok(),
            private_key_file: env::var("TLS_PRIVATE_KEY_FILE").ok(),
            acme_challenge: match env::var("TLS_ACME_CHALLENGE").ok().as_deref() {
                None | Some("") => None,
                Some("HTTP-01") => Some(AcmeChallenge::Http01),
                Some("DNS-01") => Some(AcmeChallenge::Dns01),
                Some(other) => return Err(anyhow!("TLS_ACME_CHALLENGE must be HTTP-01 or DNS-01, got '{}'", other)),
            },
            acme_email: env::var("TLS_ACME_EMAIL").ok(),
            acme_endpoint: env::var("TLS_ACME_ENDPOINT").ok(),
            acme_dns_provider: env::var("TLS_ACME_DNS_PROVIDER").ok(),
            certificates_directory: env_or_default("TLS_CERTIFICATES_DIRECTORY", "./certs"),
        };

        let relay = if smtp_outgoing_mode == OutgoingMode::Relay {
            Some(RelayConfig {
                hostname: required_env("EXTERNAL_RELAY_HOSTNAME")?,
                port: parse_env("EXTERNAL_RELAY_PORT", 587)?,
                username: env::var("EXTERNAL_RELAY_USERNAME").unwrap_or_default(),
                password: env::var("EXTERNAL_RELAY_PASSWORD").unwrap_or_default(),
                insecure_skip_verify: parse_bool_env("EXTERNAL_RELAY_INSECURE_SKIP_VERIFY", false)?,
            })
        } else {
            None
        };

        let spam_check_enable = parse_bool_env("SPAM_CHECK_ENABLE", false)?;
        let blacklist_url = env::var("BLACKLIST_URL").ok();
        let sentry_dsn = env::var("SENTRY_DSN").ok();
        let log_full_queries = parse_bool_env("LOG_FULL_QUERIES", false)?;

        let config = Config {
            hostname,
            smtp_address_incoming,
            smtp_address_outgoing,
            smtp_outgoing_mode,
            imap_address,
            http_address,
            metrics_address,
            database_url,
            secret,
            subdomain_incoming,
            subdomain_outgoing,
            subdomain_imap,
            tls,
            relay,
            spam_check_enable,
            blacklist_url,
            sentry_dsn,
            log_full_queries,
        };

        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations that would fail at runtime anyway, matching
    /// the original's `config.go Validate()`.
    pub fn validate(&self) -> Result<()> {
        if self.smtp_outgoing_mode == OutgoingMode::Relay && self.relay.is_none() {
            return Err(anyhow!("SMTP_OUTGOING_MODE=RELAY requires EXTERNAL_RELAY_HOSTNAME/PORT"));
        }

        if !self.tls.disable {
            let has_static_pair = self.tls.certificate_file.is_some() && self.tls.private_key_file.is_some();
            let has_acme = self.tls.acme_challenge.is_some() && self.tls.acme_email.is_some();
            if !has_static_pair && !has_acme {
                return Err(anyhow!(
                    "TLS is enabled but neither a certificate/key pair nor full ACME config was provided"
                ));
            }
            if self.tls.acme_challenge == Some(AcmeChallenge::Dns01) && self.tls.acme_dns_provider.is_none() {
                return Err(anyhow!("TLS_ACME_CHALLENGE=DNS-01 requires TLS_ACME_DNS_PROVIDER"));
            }
        }

        Ok(())
    }

    pub fn login_attempts_block_duration(&self) -> Duration {
        crate::login_attempts::DEFAULT_BLOCK_DURATION
    }
}

fn required_env(key: &str) -> Result<String> {
    env::var(key).map_err(|e| anyhow!(e).context(format!("{} environment variable must be set", key)))
}

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val.parse::<T>().map_err(|e| anyhow!("{} is invalid: {}", key, e)),
        Err(_) => Ok(default),
    }
}

fn parse_bool_env(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(val) => match val.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(anyhow!("{} must be a boolean, got '{}'", key, other)),
        },
        Err(_) => Ok(default),
    }
}

mod tests;
