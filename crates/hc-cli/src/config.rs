//! TOML configuration file schema and parsing.
//!
//! Example config file:
//!
//! ```toml
//! [logging]
//! format = "json"
//!
//! [dns]
//! server = "[2606:4700:4700::1111]:53"
//! timeout_secs = 5
//!
//! [matrix]
//! homeserver = "https://matrix.example.org"
//! token_file = "/run/credentials/healthcheck.service/matrix"
//!
//! [[check]]
//! name = "mail"
//! interval_secs = 300
//! smtp = { domain = "example.org" }
//! sink = [
//!   { hcio = { uuid = "5f0b7c8e-1d2a-4a4e-9d6b-3c2f1e0a9b87" } },
//!   { matrix = { rooms = ["!ops:example.org"] } },
//! ]
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use hc_core::{CheckDef, ConfigError, DnsSettings, MatrixCredentials};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub dns: DnsSettings,

    #[serde(default)]
    pub matrix: Option<MatrixCredentials>,

    #[serde(default)]
    pub check: Vec<CheckDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
        }
    }
}

fn default_log_format() -> String {
    "pretty".into()
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let config: AppConfig = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// File-wide settings. Problems with individual checks only disable those
    /// checks and are reported by [`AppConfig::check_faults`].
    fn validate(&self) -> Result<(), ConfigError> {
        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(ConfigError::Invalid {
                    check: "logging".into(),
                    reason: format!("invalid format '{other}': must be 'pretty' or 'json'"),
                });
            }
        }

        if self.dns.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                check: "dns".into(),
                reason: "timeout_secs must be positive".into(),
            });
        }

        if let Some(matrix) = &self.matrix {
            matrix.validate()?;
        }

        if self.check.is_empty() {
            return Err(ConfigError::Invalid {
                check: "check".into(),
                reason: "no checks configured".into(),
            });
        }

        Ok(())
    }

    /// Everything wrong with the individual checks that can be found without
    /// touching the network.
    pub fn check_faults(&self) -> Vec<ConfigError> {
        let mut faults = Vec::new();
        let mut names = HashSet::new();
        for check in &self.check {
            if !names.insert(check.name.as_str()) {
                faults.push(ConfigError::Invalid {
                    check: check.name.clone(),
                    reason: "duplicate check name".into(),
                });
                continue;
            }
            if let Err(e) = check.validate() {
                faults.push(e);
                continue;
            }
            if check.uses_matrix_sink() && self.matrix.is_none() {
                faults.push(ConfigError::Invalid {
                    check: check.name.clone(),
                    reason: "matrix sink needs the [matrix] credentials section".into(),
                });
            }
        }
        faults
    }

    pub fn find(&self, name: &str) -> Option<&CheckDef> {
        self.check.iter().find(|c| c.name == name)
    }
}
