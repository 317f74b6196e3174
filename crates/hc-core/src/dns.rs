//! DNS lookups against one pinned, non-caching resolver endpoint.
//!
//! Health checks must see what the authoritative servers publish right now,
//! not what a local cache remembers, so every query of a check run goes to
//! the same configured server with caching disabled.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::TokioAsyncResolver;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::DnsSettings;
use crate::error::ProbeError;

/// Port assumed for mail exchangers found through MX records.
pub const SMTP_PORT: u16 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn from_ipv4_flag(ipv4: bool) -> Self {
        if ipv4 {
            Self::V4
        } else {
            Self::V6
        }
    }

    pub fn record_type(self) -> RecordType {
        match self {
            Self::V4 => RecordType::A,
            Self::V6 => RecordType::AAAA,
        }
    }

    pub fn matches(self, ip: &IpAddr) -> bool {
        match self {
            Self::V4 => ip.is_ipv4(),
            Self::V6 => ip.is_ipv6(),
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "ipv4"),
            Self::V6 => write!(f, "ipv6"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerKind {
    Mx,
    Srv,
}

impl PointerKind {
    pub fn record_type(self) -> RecordType {
        match self {
            Self::Mx => RecordType::MX,
            Self::Srv => RecordType::SRV,
        }
    }
}

/// Host and port a MX or SRV record points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pointer {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DnsError {
    #[error("no {record_type} records for {name}")]
    Empty { name: String, record_type: RecordType },
    #[error("{record_type} query for {name} failed: {reason}")]
    Exchange {
        name: String,
        record_type: RecordType,
        reason: String,
    },
    #[error("{name}: asked for {expected}, answer contained {actual}")]
    UnexpectedRecord {
        name: String,
        expected: RecordType,
        actual: RecordType,
    },
}

impl DnsError {
    pub fn is_empty_answer(&self) -> bool {
        matches!(self, Self::Empty { .. })
    }

    /// Classify for the probe layer. A mistyped answer breaks the resolver
    /// contract and becomes a fault; everything else is a resolution failure.
    pub fn into_probe_error(self, stage: &str) -> ProbeError {
        match self {
            Self::Empty { ref name, .. } | Self::Exchange { ref name, .. } => {
                ProbeError::resolution(name.clone(), stage, &self)
            }
            Self::UnexpectedRecord { ref name, .. } => ProbeError::fault(name.clone(), &self),
        }
    }
}

/// One question to one DNS server. Implementations must not cache.
///
/// An empty answer is `Ok(vec![])`; interpreting emptiness is up to the caller.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn exchange(&self, name: &str, record_type: RecordType) -> Result<Vec<RData>, DnsError>;
}

/// [`Exchange`] backed by hickory, talking to exactly one name server.
pub struct PinnedServer {
    server: SocketAddr,
    resolver: TokioAsyncResolver,
}

impl PinnedServer {
    pub fn new(settings: &DnsSettings) -> Self {
        let name_servers =
            NameServerConfigGroup::from_ips_clear(&[settings.server.ip()], settings.server.port(), true);
        let config = ResolverConfig::from_parts(None, vec![], name_servers);

        let mut opts = ResolverOpts::default();
        opts.cache_size = 0;
        opts.use_hosts_file = false;
        opts.ndots = 0;
        opts.timeout = settings.timeout();
        opts.attempts = 1;

        Self {
            server: settings.server,
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }
}

#[async_trait]
impl Exchange for PinnedServer {
    async fn exchange(&self, name: &str, record_type: RecordType) -> Result<Vec<RData>, DnsError> {
        match self.resolver.lookup(name, record_type).await {
            Ok(lookup) => Ok(lookup.iter().cloned().collect()),
            Err(err) => match err.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
                _ => Err(DnsError::Exchange {
                    name: name.to_string(),
                    record_type,
                    reason: err.to_string(),
                }),
            },
        }
    }
}

/// Typed lookups on top of an [`Exchange`]. Cheap to clone; all clones share
/// the same server.
#[derive(Clone)]
pub struct Resolver {
    exchange: Arc<dyn Exchange>,
}

impl Resolver {
    pub fn new(exchange: Arc<dyn Exchange>) -> Self {
        Self { exchange }
    }

    pub fn pinned(settings: &DnsSettings) -> Self {
        Self::new(Arc::new(PinnedServer::new(settings)))
    }

    /// A or AAAA addresses of `name`, depending on `family`.
    pub async fn resolve_address(
        &self,
        name: &str,
        family: AddressFamily,
    ) -> Result<Vec<IpAddr>, DnsError> {
        let fqdn = fqdn(name);
        let expected = family.record_type();
        let answers = self.exchange.exchange(&fqdn, expected).await?;

        let mut addrs = Vec::with_capacity(answers.len());
        for answer in &answers {
            let ip = match answer {
                RData::A(a) if family == AddressFamily::V4 => IpAddr::V4(a.0),
                RData::AAAA(aaaa) if family == AddressFamily::V6 => IpAddr::V6(aaaa.0),
                RData::CNAME(_) => continue,
                other => {
                    return Err(DnsError::UnexpectedRecord {
                        name: fqdn,
                        expected,
                        actual: other.record_type(),
                    })
                }
            };
            addrs.push(ip);
        }

        if addrs.is_empty() {
            return Err(DnsError::Empty {
                name: fqdn,
                record_type: expected,
            });
        }
        debug!(name = %fqdn, %family, count = addrs.len(), "Resolved addresses");
        Ok(addrs)
    }

    /// Targets of the MX or SRV records of `name`. MX targets get
    /// [`SMTP_PORT`]; SRV targets carry their own port.
    pub async fn resolve_pointer(
        &self,
        name: &str,
        kind: PointerKind,
    ) -> Result<Vec<Pointer>, DnsError> {
        let fqdn = fqdn(name);
        let expected = kind.record_type();
        let answers = self.exchange.exchange(&fqdn, expected).await?;

        let mut pointers = Vec::with_capacity(answers.len());
        for answer in &answers {
            let pointer = match answer {
                RData::MX(mx) if kind == PointerKind::Mx => Pointer {
                    host: host_of(&mx.exchange().to_utf8()),
                    port: SMTP_PORT,
                },
                RData::SRV(srv) if kind == PointerKind::Srv => Pointer {
                    host: host_of(&srv.target().to_utf8()),
                    port: srv.port(),
                },
                RData::CNAME(_) => continue,
                other => {
                    return Err(DnsError::UnexpectedRecord {
                        name: fqdn,
                        expected,
                        actual: other.record_type(),
                    })
                }
            };
            pointers.push(pointer);
        }

        if pointers.is_empty() {
            return Err(DnsError::Empty {
                name: fqdn,
                record_type: expected,
            });
        }
        debug!(name = %fqdn, record_type = %expected, count = pointers.len(), "Resolved pointers");
        Ok(pointers)
    }
}

/// Absolute form of `name`, so search domains never apply.
pub fn fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}

fn host_of(name: &str) -> String {
    name.trim_end_matches('.').to_string()
}
