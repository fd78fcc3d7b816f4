//! SPF (C9): evaluates RFC 7208 against the MAIL FROM domain and the peer
//! IP, then writes the two trace headers the original split across three
//! overlapping handlers (`spf`, `authentication_results`, `authentication`).
//! We fold those into one, since they resolve the same record and differ
//! only in which header they write.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;

use super::{Handler, HandlerError};
use crate::state::SessionState;

const MAX_RECURSION: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfResult {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    TempError,
    PermError,
}

impl SpfResult {
    fn as_str(&self) -> &'static str {
        match self {
            SpfResult::Pass => "Pass",
            SpfResult::Fail => "Fail",
            SpfResult::SoftFail => "SoftFail",
            SpfResult::Neutral => "Neutral",
            SpfResult::None => "None",
            SpfResult::TempError => "TempError",
            SpfResult::PermError => "PermError",
        }
    }
}

#[derive(Debug)]
pub enum SpfError {
    Dns(String),
}

impl std::fmt::Display for SpfError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpfError::Dns(msg) => write!(f, "dns error: {}", msg),
        }
    }
}

/// Abstracts DNS lookups so the evaluator can be tested without a resolver.
#[async_trait]
pub trait SpfDnsResolver: Send + Sync {
    async fn lookup_txt(&self, domain: &str) -> Result<Vec<String>, SpfError>;
    async fn lookup_a(&self, domain: &str) -> Result<Vec<Ipv4Addr>, SpfError>;
    async fn lookup_aaaa(&self, domain: &str) -> Result<Vec<Ipv6Addr>, SpfError>;
    async fn lookup_mx(&self, domain: &str) -> Result<Vec<String>, SpfError>;
}

pub struct HickoryDnsResolver {
    resolver: hickory_resolver::TokioAsyncResolver,
}

impl HickoryDnsResolver {
    pub fn new() -> Result<Self, SpfError> {
        let resolver = hickory_resolver::TokioAsyncResolver::tokio(
            hickory_resolver::config::ResolverConfig::default(),
            hickory_resolver::config::ResolverOpts::default(),
        );
        Ok(HickoryDnsResolver { resolver })
    }
}

#[async_trait]
impl SpfDnsResolver for HickoryDnsResolver {
    async fn lookup_txt(&self, domain: &str) -> Result<Vec<String>, SpfError> {
        let lookup = self
            .resolver
            .txt_lookup(domain)
            .await
            .map_err(|e| SpfError::Dns(e.to_string()))?;
        Ok(lookup.iter().map(|txt| txt.to_string()).collect())
    }

    async fn lookup_a(&self, domain: &str) -> Result<Vec<Ipv4Addr>, SpfError> {
        let lookup = self
            .resolver
            .ipv4_lookup(domain)
            .await
            .map_err(|e| SpfError::Dns(e.to_string()))?;
        Ok(lookup.iter().map(|a| a.0).collect())
    }

    async fn lookup_aaaa(&self, domain: &str) -> Result<Vec<Ipv6Addr>, SpfError> {
        let lookup = self
            .resolver
            .ipv6_lookup(domain)
            .await
            .map_err(|e| SpfError::Dns(e.to_string()))?;
        Ok(lookup.iter().map(|a| a.0).collect())
    }

    async fn lookup_mx(&self, domain: &str) -> Result<Vec<String>, SpfError> {
        let lookup = self
            .resolver
            .mx_lookup(domain)
            .await
            .map_err(|e| SpfError::Dns(e.to_string()))?;
        Ok(lookup.iter().map(|mx| mx.exchange().to_string()).collect())
    }
}

struct Qualified<'a> {
    pass_result: SpfResult,
    mechanism: &'a str,
}

fn split_term(term: &str) -> Qualified<'_> {
    match term.as_bytes().first() {
        Some(b'+') => Qualified { pass_result: SpfResult::Pass, mechanism: &term[1..] },
        Some(b'-') => Qualified { pass_result: SpfResult::Fail, mechanism: &term[1..] },
        Some(b'~') => Qualified { pass_result: SpfResult::SoftFail, mechanism: &term[1..] },
        Some(b'?') => Qualified { pass_result: SpfResult::Neutral, mechanism: &term[1..] },
        _ => Qualified { pass_result: SpfResult::Pass, mechanism: term },
    }
}

fn ip4_in_cidr(ip: Ipv4Addr, network: Ipv4Addr, prefix: u32) -> bool {
    if prefix == 0 {
        return true;
    }
    let mask = !0u32 << (32 - prefix);
    u32::from(ip) & mask == u32::from(network) & mask
}

fn ip6_in_cidr(ip: Ipv6Addr, network: Ipv6Addr, prefix: u32) -> bool {
    if prefix == 0 {
        return true;
    }
    let mask = !0u128 << (128 - prefix);
    u128::from(ip) & mask == u128::from(network) & mask
}

/// Evaluates one domain's SPF policy for `ip`, following `include`
/// mechanisms up to `MAX_RECURSION` deep.
pub async fn check_ip(
    resolver: &dyn SpfDnsResolver,
    domain: &str,
    ip: IpAddr,
) -> Result<SpfResult, SpfError> {
    check_ip_rec(resolver, domain, ip, 0).await
}

fn check_ip_rec<'a>(
    resolver: &'a dyn SpfDnsResolver,
    domain: &'a str,
    ip: IpAddr,
    depth: u32,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<SpfResult, SpfError>> + Send + 'a>> {
    Box::pin(async move {
        if depth > MAX_RECURSION {
            return Ok(SpfResult::PermError);
        }

        let records = resolver.lookup_txt(domain).await?;
        let record = match records.iter().find(|r| r.trim().starts_with("v=spf1")) {
            Some(r) => r.clone(),
            None => return Ok(SpfResult::None),
        };

        for term in record.split_whitespace().skip(1) {
            let Qualified { pass_result, mechanism } = split_term(term);

            if mechanism == "all" {
                return Ok(pass_result);
            }

            if let Some(rest) = mechanism.strip_prefix("ip4:") {
                if let IpAddr::V4(v4) = ip {
                    let (network, prefix) = match rest.split_once('/') {
                        Some((addr, p)) => (addr, p.parse().unwrap_or(32)),
                        None => (rest, 32),
                    };
                    if let Ok(network) = network.parse::<Ipv4Addr>() {
                        if ip4_in_cidr(v4, network, prefix) {
                            return Ok(pass_result);
                        }
                    }
                }
                continue;
            }

            if let Some(rest) = mechanism.strip_prefix("ip6:") {
                if let IpAddr::V6(v6) = ip {
                    let (network, prefix) = match rest.split_once('/') {
                        Some((addr, p)) => (addr, p.parse().unwrap_or(128)),
                        None => (rest, 128),
                    };
                    if let Ok(network) = network.parse::<Ipv6Addr>() {
                        if ip6_in_cidr(v6, network, prefix) {
                            return Ok(pass_result);
                        }
                    }
                }
                continue;
            }

            if mechanism == "a" || mechanism.starts_with("a:") || mechanism.starts_with("a/") {
                let target = mechanism.strip_prefix("a:").unwrap_or(domain).split('/').next().unwrap_or(domain);
                if ip_matches_a_record(resolver, target, ip).await? {
                    return Ok(pass_result);
                }
                continue;
            }

            if mechanism == "mx" || mechanism.starts_with("mx:") || mechanism.starts_with("mx/") {
                let target = mechanism.strip_prefix("mx:").unwrap_or(domain).split('/').next().unwrap_or(domain);
                let exchanges = resolver.lookup_mx(target).await.unwrap_or_default();
                for exchange in exchanges {
                    if ip_matches_a_record(resolver, exchange.trim_end_matches('.'), ip).await? {
                        return Ok(pass_result);
                    }
                }
                continue;
            }

            if let Some(included) = mechanism.strip_prefix("include:") {
                let result = check_ip_rec(resolver, included, ip, depth + 1).await?;
                if result == SpfResult::Pass {
                    return Ok(pass_result);
                }
                continue;
            }

            // unsupported or modifier term (redirect=, exp=, ptr, exists): ignored.
        }

        Ok(SpfResult::Neutral)
    })
}

async fn ip_matches_a_record(
    resolver: &dyn SpfDnsResolver,
    domain: &str,
    ip: IpAddr,
) -> Result<bool, SpfError> {
    match ip {
        IpAddr::V4(v4) => Ok(resolver.lookup_a(domain).await.unwrap_or_default().contains(&v4)),
        IpAddr::V6(v6) => Ok(resolver.lookup_aaaa(domain).await.unwrap_or_default().contains(&v6)),
    }
}

pub struct Spf {
    our_hostname: String,
    resolver: Box<dyn SpfDnsResolver>,
}

impl Spf {
    pub fn new(our_hostname: impl Into<String>, resolver: Box<dyn SpfDnsResolver>) -> Self {
        Spf { our_hostname: our_hostname.into(), resolver }
    }
}

#[async_trait]
impl Handler for Spf {
    fn name(&self) -> &str {
        "spf"
    }

    async fn handle(&self, state: &mut SessionState) -> Result<(), HandlerError> {
        let from = match &state.envelope.from {
            Some(from) => from.clone(),
            None => return Ok(()),
        };
        let domain = from.domain().to_string();

        let result = match check_ip(self.resolver.as_ref(), &domain, state.remote_ip).await {
            Ok(result) => result,
            Err(e) => {
                log::info!("spf: could not evaluate {}: {}", domain, e);
                return Ok(());
            }
        };

        let authentication_results = format!(
            "{}; spf={} smtp.mailfrom={};",
            self.our_hostname,
            result.as_str().to_lowercase(),
            domain
        );
        let received_spf = format!(
            "{} client-ip={}; receiver={};",
            result.as_str(),
            state.remote_ip,
            self.our_hostname
        );

        state.envelope.headers.insert(0, ("Received-SPF".to_string(), received_spf));
        state.envelope.headers.insert(0, ("Authentication-Results".to_string(), authentication_results));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeResolver {
        txt: HashMap<String, Vec<String>>,
    }

    #[async_trait]
    impl SpfDnsResolver for FakeResolver {
        async fn lookup_txt(&self, domain: &str) -> Result<Vec<String>, SpfError> {
            Ok(self.txt.get(domain).cloned().unwrap_or_default())
        }
        async fn lookup_a(&self, _domain: &str) -> Result<Vec<Ipv4Addr>, SpfError> {
            Ok(vec![])
        }
        async fn lookup_aaaa(&self, _domain: &str) -> Result<Vec<Ipv6Addr>, SpfError> {
            Ok(vec![])
        }
        async fn lookup_mx(&self, _domain: &str) -> Result<Vec<String>, SpfError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn ip4_mechanism_passes() {
        let mut txt = HashMap::new();
        txt.insert("example.com".to_string(), vec!["v=spf1 ip4:203.0.113.0/24 -all".to_string()]);
        let resolver = FakeResolver { txt };
        let result = check_ip(&resolver, "example.com", "203.0.113.5".parse().unwrap()).await.unwrap();
        assert_eq!(result, SpfResult::Pass);
    }

    #[tokio::test]
    async fn fails_closed_with_all_mechanism() {
        let mut txt = HashMap::new();
        txt.insert("example.com".to_string(), vec!["v=spf1 ip4:203.0.113.0/24 -all".to_string()]);
        let resolver = FakeResolver { txt };
        let result = check_ip(&resolver, "example.com", "198.51.100.1".parse().unwrap()).await.unwrap();
        assert_eq!(result, SpfResult::Fail);
    }

    #[tokio::test]
    async fn no_record_is_none() {
        let resolver = FakeResolver { txt: HashMap::new() };
        let result = check_ip(&resolver, "example.com", "198.51.100.1".parse().unwrap()).await.unwrap();
        assert_eq!(result, SpfResult::None);
    }

    #[tokio::test]
    async fn include_mechanism_follows_to_pass() {
        let mut txt = HashMap::new();
        txt.insert("example.com".to_string(), vec!["v=spf1 include:_spf.provider.com -all".to_string()]);
        txt.insert("_spf.provider.com".to_string(), vec!["v=spf1 ip4:203.0.113.0/24 -all".to_string()]);
        let resolver = FakeResolver { txt };
        let result = check_ip(&resolver, "example.com", "203.0.113.9".parse().unwrap()).await.unwrap();
        assert_eq!(result, SpfResult::Pass);
    }

    #[tokio::test]
    async fn handler_adds_both_headers_on_pass() {
        let mut txt = HashMap::new();
        txt.insert("example.com".to_string(), vec!["v=spf1 ip4:203.0.113.0/24 -all".to_string()]);
        let handler = Spf::new("mail.example.org", Box::new(FakeResolver { txt }));
        let mut state = SessionState::new("203.0.113.5".parse().unwrap());
        state.envelope.from = Some(crate::address::MailAddress::parse("sender@example.com").unwrap());
        handler.handle(&mut state).await.unwrap();
        assert_eq!(state.envelope.headers[0].0, "Authentication-Results");
        assert_eq!(state.envelope.headers[1].0, "Received-SPF");
        assert!(state.envelope.headers[0].1.contains("spf=pass"));
    }

    #[tokio::test]
    async fn handler_passes_through_with_no_sender() {
        let handler = Spf::new("mail.example.org", Box::new(FakeResolver { txt: HashMap::new() }));
        let mut state = SessionState::new("203.0.113.5".parse().unwrap());
        handler.handle(&mut state).await.unwrap();
        assert!(state.envelope.headers.is_empty());
    }
}
