//! SMTP reachability: every mail exchanger address must accept STARTTLS and
//! complete a TLS 1.3 handshake for the exchanger's name.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{cancelled, resolve_cancelled, Probe, Target};
use crate::config::SmtpDef;
use crate::dial::{server_name, Dial};
use crate::dns::{AddressFamily, PointerKind, Resolver};
use crate::error::ProbeError;
use crate::group::TaskGroup;

const READY: &str = "220";
const GREETING: &[u8] = b"EHLO healthcheck\r\n";

pub struct SmtpProbe {
    domain: String,
    family: AddressFamily,
    resolver: Resolver,
    dialer: Arc<dyn Dial>,
    tls: TlsConnector,
}

impl SmtpProbe {
    pub fn new(def: &SmtpDef, resolver: Resolver, dialer: Arc<dyn Dial>, tls: TlsConnector) -> Self {
        Self {
            domain: def.domain.clone(),
            family: def.family(),
            resolver,
            dialer,
            tls,
        }
    }

    /// Every address of every exchanger in the MX set of the domain.
    pub async fn resolve_targets(&self) -> Result<Vec<Target>, ProbeError> {
        let exchangers = match self.resolver.resolve_pointer(&self.domain, PointerKind::Mx).await {
            Ok(exchangers) => exchangers,
            Err(e) if e.is_empty_answer() => {
                return Err(ProbeError::resolution(&self.domain, "MX", "no exchangers defined"))
            }
            Err(e) => return Err(e.into_probe_error("MX")),
        };

        let mut targets = Vec::new();
        for exchanger in exchangers {
            let addrs = self
                .resolver
                .resolve_address(&exchanger.host, self.family)
                .await
                .map_err(|e| e.into_probe_error("exchanger address"))?;
            for ip in addrs {
                targets.push(Target::new(
                    exchanger.host.clone(),
                    SocketAddr::new(ip, exchanger.port),
                ));
            }
        }

        if targets.is_empty() {
            return Err(ProbeError::resolution(&self.domain, "MX", "no exchangers defined"));
        }
        Ok(targets)
    }
}

#[async_trait]
impl Probe for SmtpProbe {
    fn kind(&self) -> &'static str {
        "smtp"
    }

    async fn check(&self, token: CancellationToken) -> Result<(), ProbeError> {
        let targets = token
            .run_until_cancelled(self.resolve_targets())
            .await
            .ok_or_else(|| resolve_cancelled(&self.domain))??;

        debug!(domain = %self.domain, count = targets.len(), "Probing mail exchangers");

        let mut group = TaskGroup::new(&token);
        for target in targets {
            let dialer = Arc::clone(&self.dialer);
            let tls = self.tls.clone();
            group.go(move |token| async move { probe_exchanger(dialer, tls, target, token).await });
        }
        group.wait().await
    }
}

async fn probe_exchanger(
    dialer: Arc<dyn Dial>,
    tls: TlsConnector,
    target: Target,
    token: CancellationToken,
) -> Result<(), ProbeError> {
    let label = target.to_string();

    let stream = token
        .run_until_cancelled(dialer.dial(target.addr))
        .await
        .ok_or_else(|| cancelled(&label, "dial"))?
        .map_err(|e| ProbeError::connection(&label, "dial", e))?;

    // The session owns the socket; losing the race against the token drops
    // the session future and with it the connection.
    let result = token
        .run_until_cancelled(session(stream, &tls, &target, &label))
        .await
        .ok_or_else(|| cancelled(&label, "session"))?;

    if result.is_ok() {
        debug!(endpoint = %label, "STARTTLS handshake succeeded");
    }
    result
}

async fn session<S>(stream: S, tls: &TlsConnector, target: &Target, label: &str) -> Result<(), ProbeError>
where
    S: tokio::io::AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    prepare_tls(&mut reader, label).await?;

    let name = server_name(&target.host)?;
    let mut tls_stream = tls
        .connect(name, reader.into_inner())
        .await
        .map_err(|e| ProbeError::protocol(label, "TLS handshake", e))?;

    tls_stream
        .write_all(b"QUIT\r\n")
        .await
        .map_err(|e| ProbeError::connection(label, "QUIT", e))?;
    // The server may already have hung up after QUIT.
    if let Err(e) = tls_stream.shutdown().await {
        debug!(endpoint = label, error = %e, "TLS shutdown after QUIT failed");
    }
    Ok(())
}

/// Plaintext part of the session: greet, expect `220`, request STARTTLS and
/// skip everything the server says until it answers `220` again.
pub async fn prepare_tls<S>(stream: &mut S, label: &str) -> Result<(), ProbeError>
where
    S: AsyncBufRead + AsyncWrite + Unpin,
{
    stream
        .write_all(GREETING)
        .await
        .map_err(|e| ProbeError::connection(label, "write EHLO", e))?;
    stream
        .flush()
        .await
        .map_err(|e| ProbeError::connection(label, "write EHLO", e))?;

    let line = read_reply_line(stream, label, "read EHLO reply").await?;
    if !line.starts_with(READY) {
        return Err(ProbeError::protocol(
            label,
            "EHLO",
            format!("server did not accept greeting: {}", line.trim_end()),
        ));
    }

    stream
        .write_all(b"STARTTLS\r\n")
        .await
        .map_err(|e| ProbeError::connection(label, "write STARTTLS", e))?;
    stream
        .flush()
        .await
        .map_err(|e| ProbeError::connection(label, "write STARTTLS", e))?;

    loop {
        let line = read_reply_line(stream, label, "read STARTTLS reply").await?;
        if line.starts_with(READY) {
            return Ok(());
        }
        debug!(endpoint = label, line = line.trim_end(), "Skipping reply line before STARTTLS go-ahead");
    }
}

async fn read_reply_line<S>(stream: &mut S, label: &str, stage: &str) -> Result<String, ProbeError>
where
    S: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = stream
        .read_line(&mut line)
        .await
        .map_err(|e| ProbeError::connection(label, stage, e))?;
    if read == 0 {
        return Err(ProbeError::connection(label, stage, "connection closed by server"));
    }
    Ok(line)
}
