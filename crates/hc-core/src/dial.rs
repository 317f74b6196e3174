//! Connections pinned to one already-resolved address.
//!
//! A probe validates a service under its DNS name but connects to one
//! specific address of that name, so a domain with several addresses gets
//! every address checked on its own. Nothing in here resolves names: the
//! TCP dialer only takes socket addresses, and the HTTP client answers name
//! lookups with the pinned address and treats any other name as a fault.

use std::error::Error as StdError;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::Client;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use crate::error::ProbeError;

#[async_trait]
pub trait Dial: Send + Sync {
    async fn dial(&self, addr: SocketAddr) -> io::Result<TcpStream>;
}

/// Plain TCP connect to exactly the given address.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dial for TcpDialer {
    async fn dial(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        TcpStream::connect(addr).await
    }
}

/// The HTTP stack tried to reach a host other than the one it was pinned to.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("transport pinned to {pinned} was asked to resolve {requested}")]
pub struct PinViolation {
    pub pinned: String,
    pub requested: String,
}

struct PinnedResolve {
    host: String,
    addr: SocketAddr,
}

impl Resolve for PinnedResolve {
    fn resolve(&self, name: Name) -> Resolving {
        let requested = name.as_str();
        if !requested.eq_ignore_ascii_case(&self.host) {
            let violation = PinViolation {
                pinned: self.host.clone(),
                requested: requested.to_string(),
            };
            return Box::pin(futures::future::ready(Err(
                Box::new(violation) as Box<dyn StdError + Send + Sync>
            )));
        }
        let addrs: Addrs = Box::new(std::iter::once(self.addr));
        Box::pin(futures::future::ready(Ok(addrs)))
    }
}

/// HTTP client that sends every request for `host` to `addr`.
///
/// TLS still validates against `host` (taken from the request URL), at
/// TLS 1.3 or newer. Redirects are not followed and connections are not
/// pooled, so each client talks to the pinned address once per request.
pub fn pinned_client(host: &str, addr: SocketAddr) -> Result<Client, ProbeError> {
    Client::builder()
        .dns_resolver(Arc::new(PinnedResolve {
            host: host.to_string(),
            addr,
        }))
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .pool_max_idle_per_host(0)
        .min_tls_version(reqwest::tls::Version::TLS_1_3)
        .user_agent(concat!("healthcheck/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ProbeError::fault(format!("{host}/{addr}"), format!("build pinned client: {e}")))
}

/// Whether `err` was caused by the pinned resolver refusing another host.
pub fn is_pin_violation(err: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if e.is::<PinViolation>() {
            return true;
        }
        current = e.source();
    }
    false
}

/// Map a failed pinned request to the probe taxonomy.
pub fn classify_http_error(err: &reqwest::Error, target: &str, stage: &str) -> ProbeError {
    if is_pin_violation(err) {
        return ProbeError::fault(target, format!("{stage}: {}", error_chain(err)));
    }
    if err.is_decode() || err.is_body() {
        return ProbeError::protocol(target, stage, error_chain(err));
    }
    ProbeError::connection(target, stage, error_chain(err))
}

/// `err` and all its sources joined into one line. reqwest's own display
/// omits the underlying cause.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut current = err.source();
    while let Some(e) = current {
        out.push_str(": ");
        out.push_str(&e.to_string());
        current = e.source();
    }
    out
}

/// TLS client config used for STARTTLS: TLS 1.3 only, webpki roots.
pub fn tls13_connector() -> Result<TlsConnector, ProbeError> {
    tls13_connector_with_roots(RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    })
}

pub fn tls13_connector_with_roots(roots: RootCertStore) -> Result<TlsConnector, ProbeError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| ProbeError::fault("tls", format!("TLS 1.3 config: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

pub fn server_name(host: &str) -> Result<ServerName<'static>, ProbeError> {
    ServerName::try_from(host.to_string())
        .map_err(|e| ProbeError::fault(host, format!("invalid TLS server name: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use tokio::net::TcpListener;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn pinned_client_reaches_pinned_address_without_dns() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .and(header("host", format!("homeserver.invalid:{}", server.address().port()).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
            .expect(1)
            .mount(&server)
            .await;

        let client = pinned_client("homeserver.invalid", *server.address()).unwrap();
        let url = format!("http://homeserver.invalid:{}/ping", server.address().port());
        let response = client.get(&url).send().await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "pong");
    }

    #[tokio::test]
    async fn other_host_is_a_pin_violation() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = pinned_client("homeserver.invalid", *server.address()).unwrap();
        let url = format!("http://elsewhere.invalid:{}/", server.address().port());
        let err = client.get(&url).send().await.unwrap_err();
        assert!(is_pin_violation(&err), "{}", error_chain(&err));
        assert_eq!(
            classify_http_error(&err, "elsewhere.invalid", "GET").kind(),
            FailureKind::Fault
        );
    }

    #[tokio::test]
    async fn refused_connection_is_connection_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = pinned_client("homeserver.invalid", addr).unwrap();
        let url = format!("http://homeserver.invalid:{}/", addr.port());
        let err = client.head(&url).send().await.unwrap_err();
        assert!(!is_pin_violation(&err));
        assert_eq!(
            classify_http_error(&err, "homeserver.invalid", "HEAD").kind(),
            FailureKind::Connection
        );
    }

    #[tokio::test]
    async fn tcp_dialer_connects_to_exact_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|(_, peer)| peer) });

        let stream = TcpDialer.dial(addr).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
        assert_eq!(accept.await.unwrap().unwrap(), stream.local_addr().unwrap());
    }

    #[test]
    fn tls_connector_builds() {
        assert!(tls13_connector().is_ok());
    }

    #[test]
    fn server_name_accepts_dns_names() {
        assert!(server_name("mx1.example.org").is_ok());
        assert!(server_name("not a host").is_err());
    }
}
