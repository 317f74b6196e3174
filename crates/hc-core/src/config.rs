use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dns::AddressFamily;

/// Shortest accepted poll interval. Each cycle splits its interval into a
/// probe half and a sink half, and both halves need at least a second.
pub const MIN_INTERVAL_SECS: u64 = 2;

pub const DEFAULT_HCIO_BASE_URL: &str = "https://hc-ping.com";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("check '{check}': expected exactly one {what} variant, found {found}")]
    Variant {
        check: String,
        what: &'static str,
        found: usize,
    },
    #[error("check '{check}': {reason}")]
    Invalid { check: String, reason: String },
    #[error("Failed to read {path}: {reason}")]
    Io { path: String, reason: String },
    #[error("Failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
    #[error("check '{check}': sink setup failed: {reason}")]
    SinkSetup { check: String, reason: String },
    #[error("{what} setup failed: {reason}")]
    Setup { what: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(check: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            check: check.to_string(),
            reason: reason.into(),
        }
    }
}

/// The resolver endpoint every check queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsSettings {
    /// Cloudflare by default, to keep answers as uncached as possible.
    #[serde(default = "default_dns_server")]
    pub server: SocketAddr,

    #[serde(default = "default_dns_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            server: default_dns_server(),
            timeout_secs: default_dns_timeout_secs(),
        }
    }
}

impl DnsSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_dns_server() -> SocketAddr {
    SocketAddr::new(
        std::net::IpAddr::V6(std::net::Ipv6Addr::new(0x2606, 0x4700, 0x4700, 0, 0, 0, 0, 0x1111)),
        53,
    )
}

fn default_dns_timeout_secs() -> u64 {
    5
}

/// One configured check as written in the config file.
///
/// The probe blocks are sibling options here; [`CheckDef::probe_variant`]
/// turns them into the single [`ProbeDef`] the check runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckDef {
    pub name: String,

    pub interval_secs: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp: Option<SmtpDef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<MatrixDef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ceph: Option<CephDef>,

    #[serde(default, rename = "sink")]
    pub sinks: Vec<SinkDef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpDef {
    pub domain: String,
    #[serde(default)]
    pub ipv4: bool,
}

impl SmtpDef {
    pub fn family(&self) -> AddressFamily {
        AddressFamily::from_ipv4_flag(self.ipv4)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixDef {
    pub domain: String,
    #[serde(default)]
    pub ipv4: bool,
}

impl MatrixDef {
    pub fn family(&self) -> AddressFamily {
        AddressFamily::from_ipv4_flag(self.ipv4)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CephDef {
    /// Passed as `-n`. Omitted when unset.
    #[serde(default)]
    pub client_name: Option<String>,

    /// Passed as `-k`. Relative paths are looked up in `$CREDENTIALS_DIRECTORY`.
    #[serde(default)]
    pub keyring: Option<PathBuf>,

    #[serde(default = "default_ceph_command")]
    pub command: String,
}

fn default_ceph_command() -> String {
    "ceph".into()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeDef {
    Smtp(SmtpDef),
    Matrix(MatrixDef),
    Ceph(CephDef),
}

impl ProbeDef {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Smtp(_) => "smtp",
            Self::Matrix(_) => "matrix",
            Self::Ceph(_) => "ceph",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SinkDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<MatrixSinkDef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hcio: Option<HcioDef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixSinkDef {
    /// Rooms to report into. Empty means every room the account has joined.
    #[serde(default)]
    pub rooms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HcioDef {
    pub uuid: String,

    #[serde(default = "default_hcio_base_url")]
    pub base_url: String,
}

fn default_hcio_base_url() -> String {
    DEFAULT_HCIO_BASE_URL.into()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkKind {
    Matrix(MatrixSinkDef),
    Hcio(HcioDef),
}

impl SinkDef {
    pub fn variant(&self, check: &str) -> Result<SinkKind, ConfigError> {
        let mut found = Vec::new();
        if let Some(m) = &self.matrix {
            found.push(SinkKind::Matrix(m.clone()));
        }
        if let Some(h) = &self.hcio {
            found.push(SinkKind::Hcio(h.clone()));
        }
        exactly_one(found, check, "sink")
    }
}

impl CheckDef {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_variant(&self) -> Result<ProbeDef, ConfigError> {
        let mut found = Vec::new();
        if let Some(smtp) = &self.smtp {
            found.push(ProbeDef::Smtp(smtp.clone()));
        }
        if let Some(matrix) = &self.matrix {
            found.push(ProbeDef::Matrix(matrix.clone()));
        }
        if let Some(ceph) = &self.ceph {
            found.push(ProbeDef::Ceph(ceph.clone()));
        }
        exactly_one(found, &self.name, "probe")
    }

    /// Checks everything that can be checked without touching the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid(&self.name, "name must not be empty"));
        }
        if self.interval_secs < MIN_INTERVAL_SECS {
            return Err(ConfigError::invalid(
                &self.name,
                format!("interval_secs must be at least {MIN_INTERVAL_SECS}"),
            ));
        }

        match self.probe_variant()? {
            ProbeDef::Smtp(SmtpDef { domain, .. }) | ProbeDef::Matrix(MatrixDef { domain, .. }) => {
                if domain.trim().is_empty() || domain.contains('/') {
                    return Err(ConfigError::invalid(
                        &self.name,
                        format!("invalid domain '{domain}'"),
                    ));
                }
            }
            ProbeDef::Ceph(ceph) => {
                if ceph.command.trim().is_empty() {
                    return Err(ConfigError::invalid(&self.name, "ceph command must not be empty"));
                }
            }
        }

        for sink in &self.sinks {
            if let SinkKind::Hcio(hcio) = sink.variant(&self.name)? {
                if hcio.uuid.trim().is_empty() {
                    return Err(ConfigError::invalid(&self.name, "hcio uuid must not be empty"));
                }
                validate_http_url(&self.name, &hcio.base_url)?;
            }
        }

        Ok(())
    }

    pub fn uses_matrix_sink(&self) -> bool {
        self.sinks.iter().any(|s| s.matrix.is_some())
    }
}

fn exactly_one<T>(mut found: Vec<T>, check: &str, what: &'static str) -> Result<T, ConfigError> {
    if found.len() == 1 {
        if let Some(only) = found.pop() {
            return Ok(only);
        }
    }
    Err(ConfigError::Variant {
        check: check.to_string(),
        what,
        found: found.len(),
    })
}

/// Account the matrix sinks post with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixCredentials {
    pub homeserver: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// File holding the access token, e.g. a systemd credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<PathBuf>,
}

impl MatrixCredentials {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_http_url("matrix", &self.homeserver)?;
        match (&self.token, &self.token_file) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(ConfigError::invalid(
                "matrix",
                "exactly one of token or token_file must be set",
            )),
        }
    }

    pub fn access_token(&self) -> Result<String, ConfigError> {
        if let Some(token) = &self.token {
            return Ok(token.clone());
        }
        let path = self
            .token_file
            .as_deref()
            .ok_or_else(|| ConfigError::invalid("matrix", "no access token configured"))?;
        read_secret(path)
    }
}

fn read_secret(path: &Path) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(content.trim().to_string())
}

fn validate_http_url(check: &str, raw: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| ConfigError::invalid(check, format!("invalid URL '{raw}': {e}")))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(ConfigError::invalid(
            check,
            format!("URL must use http or https: {raw}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smtp_check() -> CheckDef {
        CheckDef {
            name: "mail".into(),
            interval_secs: 60,
            smtp: Some(SmtpDef {
                domain: "example.org".into(),
                ipv4: false,
            }),
            matrix: None,
            ceph: None,
            sinks: vec![],
        }
    }

    #[test]
    fn single_probe_variant_is_selected() {
        let check = smtp_check();
        assert_eq!(
            check.probe_variant().unwrap(),
            ProbeDef::Smtp(SmtpDef {
                domain: "example.org".into(),
                ipv4: false
            })
        );
        check.validate().unwrap();
    }

    #[test]
    fn zero_probe_variants_rejected() {
        let mut check = smtp_check();
        check.smtp = None;
        let err = check.probe_variant().unwrap_err();
        assert!(matches!(err, ConfigError::Variant { found: 0, .. }), "{err}");
    }

    #[test]
    fn two_probe_variants_rejected() {
        let mut check = smtp_check();
        check.matrix = Some(MatrixDef {
            domain: "example.org".into(),
            ipv4: true,
        });
        let err = check.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Variant { found: 2, what: "probe", .. }), "{err}");
    }

    #[test]
    fn sink_needs_exactly_one_variant() {
        let empty = SinkDef::default();
        assert!(matches!(
            empty.variant("mail"),
            Err(ConfigError::Variant { found: 0, what: "sink", .. })
        ));

        let both = SinkDef {
            matrix: Some(MatrixSinkDef::default()),
            hcio: Some(HcioDef {
                uuid: "abc".into(),
                base_url: DEFAULT_HCIO_BASE_URL.into(),
            }),
        };
        assert!(matches!(
            both.variant("mail"),
            Err(ConfigError::Variant { found: 2, .. })
        ));
    }

    #[test]
    fn short_interval_rejected() {
        let mut check = smtp_check();
        check.interval_secs = 1;
        let err = check.validate().unwrap_err();
        assert!(err.to_string().contains("interval_secs"), "{err}");
    }

    #[test]
    fn empty_domain_rejected() {
        let mut check = smtp_check();
        check.smtp = Some(SmtpDef {
            domain: " ".into(),
            ipv4: true,
        });
        assert!(check.validate().is_err());
    }

    #[test]
    fn credentials_need_one_token_source() {
        let creds = MatrixCredentials {
            homeserver: "https://matrix.example.org".into(),
            token: Some("secret".into()),
            token_file: Some("/run/credentials/matrix".into()),
        };
        assert!(creds.validate().is_err());

        let creds = MatrixCredentials {
            token_file: None,
            ..creds
        };
        creds.validate().unwrap();
        assert_eq!(creds.access_token().unwrap(), "secret");
    }

    #[test]
    fn credentials_reject_non_http_homeserver() {
        let creds = MatrixCredentials {
            homeserver: "ftp://matrix.example.org".into(),
            token: Some("secret".into()),
            token_file: None,
        };
        assert!(creds.validate().is_err());
    }

    #[test]
    fn default_dns_server_is_cloudflare_v6() {
        let dns = DnsSettings::default();
        assert_eq!(dns.server.to_string(), "[2606:4700:4700::1111]:53");
        assert_eq!(dns.timeout(), Duration::from_secs(5));
    }
}
