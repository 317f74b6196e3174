//! Matrix homeserver reachability.
//!
//! Homeservers are discovered twice: through the `_matrix._tcp` SRV record
//! and through the client well-known document served by the domain itself.
//! Every distinct endpoint either path yields must answer a HEAD request.

use std::net::SocketAddr;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::{cancelled, merge_targets, resolve_cancelled, Probe, Target};
use crate::config::MatrixDef;
use crate::dial::{classify_http_error, pinned_client};
use crate::dns::{AddressFamily, PointerKind, Resolver};
use crate::error::ProbeError;
use crate::group::{Policy, TaskGroup};

pub const WELL_KNOWN_PATH: &str = "/.well-known/matrix/client";
const HTTPS_PORT: u16 = 443;
const HTTPS: &str = "https";

#[derive(Debug, Deserialize)]
struct WellKnown {
    #[serde(rename = "m.homeserver")]
    homeserver: HomeserverInfo,
}

#[derive(Debug, Deserialize)]
struct HomeserverInfo {
    base_url: String,
}

pub struct MatrixProbe {
    domain: String,
    family: AddressFamily,
    resolver: Resolver,
    scheme: String,
    well_known_port: u16,
}

impl MatrixProbe {
    pub fn new(def: &MatrixDef, resolver: Resolver) -> Self {
        Self {
            domain: def.domain.clone(),
            family: def.family(),
            resolver,
            scheme: HTTPS.to_string(),
            well_known_port: HTTPS_PORT,
        }
    }

    /// Override the scheme of SRV-derived homeserver URLs and of the
    /// well-known request, and the port the well-known document is fetched
    /// from. Defaults to `https` on 443.
    pub fn with_endpoint(mut self, scheme: &str, well_known_port: u16) -> Self {
        self.scheme = scheme.to_string();
        self.well_known_port = well_known_port;
        self
    }

    /// Candidates from the SRV record. A domain without SRV records simply
    /// contributes nothing.
    pub async fn srv_targets(&self) -> Result<Vec<Target>, ProbeError> {
        let name = format!("_matrix._tcp.{}", self.domain);
        let pointers = match self.resolver.resolve_pointer(&name, PointerKind::Srv).await {
            Ok(pointers) => pointers,
            Err(e) if e.is_empty_answer() => {
                debug!(domain = %self.domain, "No SRV records published");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into_probe_error("SRV")),
        };

        let mut targets = Vec::new();
        for pointer in pointers {
            let url = Url::parse(&format!("{}://{}:{}", self.scheme, pointer.host, pointer.port))
                .map_err(|e| ProbeError::protocol(&name, "SRV target", e))?;
            let addrs = self
                .resolver
                .resolve_address(&pointer.host, self.family)
                .await
                .map_err(|e| e.into_probe_error("SRV target address"))?;
            for ip in addrs {
                targets.push(
                    Target::new(pointer.host.clone(), SocketAddr::new(ip, pointer.port))
                        .with_url(url.clone()),
                );
            }
        }
        Ok(targets)
    }

    /// Candidates from the well-known document, fetched from every address of
    /// the domain. A domain without addresses contributes nothing.
    pub async fn well_known_targets(&self) -> Result<Vec<Target>, ProbeError> {
        let addrs = match self.resolver.resolve_address(&self.domain, self.family).await {
            Ok(addrs) => addrs,
            Err(e) if e.is_empty_answer() => {
                debug!(domain = %self.domain, "Domain has no address to serve well-known from");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into_probe_error("well-known host address")),
        };

        let url = Url::parse(&format!(
            "{}://{}:{}{}",
            self.scheme, self.domain, self.well_known_port, WELL_KNOWN_PATH
        ))
        .map_err(|e| ProbeError::fault(&self.domain, format!("well-known URL: {e}")))?;

        let mut targets = Vec::new();
        for ip in addrs {
            let source = Target::new(self.domain.clone(), SocketAddr::new(ip, self.well_known_port))
                .with_url(url.clone());
            let base_url = fetch_well_known(&source).await?;
            targets.extend(self.homeserver_targets(&base_url).await?);
        }
        Ok(targets)
    }

    async fn homeserver_targets(&self, base_url: &Url) -> Result<Vec<Target>, ProbeError> {
        let host = base_url.host_str().ok_or_else(|| {
            ProbeError::protocol(base_url.as_str(), "well-known", "homeserver base_url has no host")
        })?;
        let port = base_url.port_or_known_default().ok_or_else(|| {
            ProbeError::protocol(base_url.as_str(), "well-known", "homeserver base_url has no port")
        })?;

        let addrs = self
            .resolver
            .resolve_address(host, self.family)
            .await
            .map_err(|e| e.into_probe_error("homeserver address"))?;
        Ok(addrs
            .into_iter()
            .map(|ip| Target::new(host, SocketAddr::new(ip, port)).with_url(base_url.clone()))
            .collect())
    }

    pub async fn resolve_targets(&self) -> Result<Vec<Target>, ProbeError> {
        let (srv, well_known) = tokio::try_join!(self.srv_targets(), self.well_known_targets())?;
        let targets = merge_targets([srv, well_known]);
        if targets.is_empty() {
            return Err(ProbeError::resolution(
                &self.domain,
                "homeserver discovery",
                "neither SRV nor well-known yielded a homeserver",
            ));
        }
        Ok(targets)
    }
}

#[async_trait]
impl Probe for MatrixProbe {
    fn kind(&self) -> &'static str {
        "matrix"
    }

    async fn check(&self, token: CancellationToken) -> Result<(), ProbeError> {
        let targets = token
            .run_until_cancelled(self.resolve_targets())
            .await
            .ok_or_else(|| resolve_cancelled(&self.domain))??;

        debug!(domain = %self.domain, count = targets.len(), "Probing homeservers");

        let mut group = TaskGroup::new(&token);
        for target in targets {
            group.spawn(Policy::NeverCancel, move |token| async move {
                token
                    .run_until_cancelled(check_liveness(&target))
                    .await
                    .unwrap_or_else(|| Err(cancelled(&target.to_string(), "HEAD")))
            });
        }
        group.wait().await
    }
}

/// GET the well-known document from the pinned `source` and return the
/// advertised homeserver base URL.
pub async fn fetch_well_known(source: &Target) -> Result<Url, ProbeError> {
    let label = source.to_string();
    let url = source
        .url
        .clone()
        .ok_or_else(|| ProbeError::fault(&label, "well-known target without URL"))?;

    let client = pinned_client(&source.host, source.addr)?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| classify_http_error(&e, &label, "GET well-known"))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ProbeError::protocol(
            &label,
            "GET well-known",
            format!("unexpected HTTP status {status}"),
        ));
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| classify_http_error(&e, &label, "read well-known"))?;
    parse_well_known(&body).map_err(|reason| ProbeError::protocol(&label, "parse well-known", reason))
}

pub fn parse_well_known(body: &[u8]) -> Result<Url, String> {
    let doc: WellKnown = serde_json::from_slice(body).map_err(|e| e.to_string())?;
    let url = Url::parse(&doc.homeserver.base_url)
        .map_err(|e| format!("invalid base_url '{}': {e}", doc.homeserver.base_url))?;
    match url.scheme() {
        "https" | "http" => Ok(url),
        other => Err(format!("unsupported base_url scheme '{other}'")),
    }
}

/// HEAD the homeserver root through the pinned address.
///
/// A live homeserver has no handler on its root and answers 404. That 404 is
/// the expected answer here; anything else means something other than the
/// homeserver is listening (or the homeserver is misbehaving).
pub async fn check_liveness(target: &Target) -> Result<(), ProbeError> {
    let label = target.to_string();
    let url = target
        .url
        .clone()
        .ok_or_else(|| ProbeError::fault(&label, "homeserver target without URL"))?;

    let client = pinned_client(&target.host, target.addr)?;
    let response = client
        .head(url)
        .send()
        .await
        .map_err(|e| classify_http_error(&e, &label, "HEAD"))?;
    expect_not_found(&label, response.status())
}

pub fn expect_not_found(label: &str, status: StatusCode) -> Result<(), ProbeError> {
    if status == StatusCode::NOT_FOUND {
        return Ok(());
    }
    Err(ProbeError::protocol(
        label,
        "HEAD",
        format!("expected {}, got {status}", StatusCode::NOT_FOUND),
    ))
}
