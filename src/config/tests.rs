use super::*;
use std::sync::Mutex;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_all() {
    for key in [
        "HOSTNAME",
        "SMTP_ADDRESS_INCOMING",
        "SMTP_ADDRESS_OUTGOING",
        "SMTP_OUTGOING_MODE",
        "EXTERNAL_RELAY_HOSTNAME",
        "EXTERNAL_RELAY_PORT",
        "TLS_DISABLE",
        "TLS_CERTIFICATE_FILE",
        "TLS_PRIVATE_KEY_FILE",
        "TLS_ACME_CHALLENGE",
        "TLS_ACME_EMAIL",
        "TLS_ACME_DNS_PROVIDER",
        "TLS_ACME_ENDPOINT",
    ] {
        env::remove_var(key);
    }
}

#[test]
fn defaults_apply_when_only_hostname_is_set() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_all();
    env::set_var("HOSTNAME", "mail.example.com");
    env::set_var("TLS_DISABLE", "true");

    let config = Config::from_env().unwrap();
    assert_eq!(config.hostname, "mail.example.com");
    assert_eq!(config.smtp_address_incoming, "0.0.0.0:25");
    assert_eq!(config.smtp_outgoing_mode, OutgoingMode::Disabled);
    assert_eq!(config.http_address, "0.0.0.0:8080");
    assert_eq!(config.metrics_address, "0.0.0.0:9000");
    clear_all();
}

#[test]
fn relay_mode_without_hostname_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_all();
    env::set_var("HOSTNAME", "mail.example.com");
    env::set_var("TLS_DISABLE", "true");
    env::set_var("SMTP_OUTGOING_MODE", "RELAY");

    let err = Config::from_env().unwrap_err();
    assert!(err.to_string().contains("EXTERNAL_RELAY_HOSTNAME"));
    clear_all();
}

#[test]
fn tls_enabled_without_cert_or_acme_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_all();
    env::set_var("HOSTNAME", "mail.example.com");

    let err = Config::from_env().unwrap_err();
    assert!(err.to_string().contains("TLS is enabled"));
    clear_all();
}

#[test]
fn dns01_without_provider_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_all();
    env::set_var("HOSTNAME", "mail.example.com");
    env::set_var("TLS_ACME_CHALLENGE", "DNS-01");
    env::set_var("TLS_ACME_EMAIL", "admin@example.com");

    let err = Config::from_env().unwrap_err();
    assert!(err.to_string().contains("TLS_ACME_DNS_PROVIDER"));
    clear_all();
}

#[test]
fn static_cert_pair_satisfies_tls_validation() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_all();
    env::set_var("HOSTNAME", "mail.example.com");
    env::set_var("TLS_CERTIFICATE_FILE", "/tmp/cert.pem");
    env::set_var("TLS_PRIVATE_KEY_FILE", "/tmp/key.pem");

    let config = Config::from_env().unwrap();
    assert!(!config.tls.disable);
    clear_all();
}
