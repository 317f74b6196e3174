pub mod ceph;
pub mod matrix;
pub mod smtp;

pub use ceph::CephProbe;
pub use matrix::MatrixProbe;
pub use smtp::SmtpProbe;

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::ProbeError;

/// Protocol-specific health check of one service.
///
/// Implementations resolve their targets afresh on every call and must give
/// up promptly once `token` is cancelled; the poller relies on that to keep
/// each cycle inside its time budget.
#[async_trait]
pub trait Probe: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn check(&self, token: CancellationToken) -> Result<(), ProbeError>;
}

/// One endpoint of a service: the name it must present, the address we
/// connect to and, for HTTP services, the URL to request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub addr: SocketAddr,
    pub url: Option<Url>,
}

impl Target {
    pub fn new(host: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            host: host.into(),
            addr,
            url: None,
        }
    }

    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.url {
            Some(url) => write!(f, "{url} via {}", self.addr),
            None => write!(f, "{}/{}", self.host, self.addr),
        }
    }
}

/// Concatenate candidate lists, keeping the first occurrence of every target.
pub fn merge_targets<I>(lists: I) -> Vec<Target>
where
    I: IntoIterator<Item = Vec<Target>>,
{
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for target in lists.into_iter().flatten() {
        if seen.insert(target.clone()) {
            merged.push(target);
        }
    }
    merged
}

pub(crate) fn cancelled(target: &str, stage: &str) -> ProbeError {
    ProbeError::connection(target, stage, "cancelled before completion")
}

/// Cancellation while target discovery was still waiting on DNS.
pub(crate) fn resolve_cancelled(domain: &str) -> ProbeError {
    ProbeError::resolution(domain, "resolve", "cancelled before completion")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(host: &str, addr: &str, url: Option<&str>) -> Target {
        let target = Target::new(host, addr.parse().unwrap());
        match url {
            Some(u) => target.with_url(Url::parse(u).unwrap()),
            None => target,
        }
    }

    #[test]
    fn merge_drops_structural_duplicates() {
        let srv = vec![
            t("hs.example.org", "[2001:db8::1]:8448", Some("https://hs.example.org:8448")),
            t("hs.example.org", "[2001:db8::2]:8448", Some("https://hs.example.org:8448")),
        ];
        let well_known = vec![
            t("hs.example.org", "[2001:db8::1]:8448", Some("https://hs.example.org:8448")),
            t("hs.example.org", "[2001:db8::1]:443", Some("https://hs.example.org")),
        ];
        let merged = merge_targets([srv.clone(), well_known.clone()]);
        assert_eq!(merged.len(), 3);
        assert!(merged.len() <= srv.len() + well_known.len());
        assert_eq!(merged[0], srv[0]);
        assert_eq!(merged[2], well_known[1]);
    }

    #[test]
    fn merge_is_idempotent() {
        let list = vec![
            t("a.example.org", "[2001:db8::1]:443", Some("https://a.example.org")),
            t("a.example.org", "[2001:db8::1]:443", Some("https://a.example.org")),
            t("b.example.org", "[2001:db8::1]:443", Some("https://b.example.org")),
        ];
        let once = merge_targets([list.clone(), list]);
        let twice = merge_targets([once.clone(), once.clone()]);
        assert_eq!(once, twice);
        assert_eq!(once.len(), 2);
    }

    #[test]
    fn targets_differing_only_by_url_are_distinct() {
        let a = t("hs.example.org", "[2001:db8::1]:8448", Some("https://hs.example.org:8448"));
        let b = t("hs.example.org", "[2001:db8::1]:8448", Some("https://hs.example.org:8448/_matrix"));
        assert_eq!(merge_targets([vec![a, b]]).len(), 2);
    }

    #[test]
    fn display_prefers_url() {
        let plain = t("mx.example.org", "[2001:db8::25]:25", None);
        assert_eq!(plain.to_string(), "mx.example.org/[2001:db8::25]:25");
        let http = t("hs.example.org", "192.0.2.1:8448", Some("https://hs.example.org:8448"));
        assert_eq!(http.to_string(), "https://hs.example.org:8448/ via 192.0.2.1:8448");
    }
}
