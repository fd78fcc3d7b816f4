//! IP blacklist (checked on accept, spec.md §4.6): an externally supplied
//! denylist the server consults before reading any command from a new
//! connection. Grounded on the original's `helpers/blacklist.go`, which
//! downloads NiX Spam's list into a sorted in-memory vector and binary
//! searches it.

use std::net::IpAddr;

/// A source of blacklisted IPs. Implementations decide how the list is
/// obtained and refreshed; the server only needs a yes/no answer per IP.
pub trait Blacklist: Send + Sync {
    fn is_blacklisted(&self, ip: IpAddr) -> bool;
}

/// The default when no `BLACKLIST_URL` is configured: nothing is blocked.
pub struct NoBlacklist;

impl Blacklist for NoBlacklist {
    fn is_blacklisted(&self, _ip: IpAddr) -> bool {
        false
    }
}

/// Loads a newline-delimited list of blacklisted IPs from an HTTP endpoint
/// once at construction, sorted for binary search.
pub struct HttpBlacklist {
    entries: Vec<IpAddr>,
}

impl HttpBlacklist {
    pub async fn fetch(url: &str) -> Result<Self, reqwest::Error> {
        let body = reqwest::get(url).await?.text().await?;
        let mut entries: Vec<IpAddr> = body
            .lines()
            .filter_map(|line| line.trim().parse::<IpAddr>().ok())
            .collect();
        entries.sort();
        Ok(HttpBlacklist { entries })
    }
}

impl Blacklist for HttpBlacklist {
    fn is_blacklisted(&self, ip: IpAddr) -> bool {
        self.entries.binary_search(&ip).is_ok()
    }
}
