//! Ceph cluster health through the `ceph` CLI.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{cancelled, Probe};
use crate::config::CephDef;
use crate::error::ProbeError;

pub const HEALTH_OK: &str = "HEALTH_OK";
const CREDENTIALS_DIRECTORY: &str = "CREDENTIALS_DIRECTORY";

#[derive(Debug, Deserialize)]
struct Report {
    health: Health,
}

#[derive(Debug, Deserialize)]
struct Health {
    status: String,
}

pub struct CephProbe {
    command: String,
    client_name: Option<String>,
    keyring: Option<PathBuf>,
}

impl CephProbe {
    pub fn new(def: &CephDef) -> Self {
        Self {
            command: def.command.clone(),
            client_name: def.client_name.clone(),
            keyring: def.keyring.clone(),
        }
    }

    /// `status -f json`, plus client name and keyring when configured. A
    /// relative keyring lives in `credentials_dir`.
    pub fn args(&self, credentials_dir: Option<&Path>) -> Result<Vec<String>, ProbeError> {
        let mut args = vec!["status".to_string(), "-f".into(), "json".into()];
        if let Some(name) = &self.client_name {
            args.push("-n".into());
            args.push(name.clone());
        }
        if let Some(keyring) = &self.keyring {
            let path = if keyring.is_absolute() {
                keyring.clone()
            } else {
                let dir = credentials_dir.ok_or_else(|| {
                    ProbeError::fault(
                        &self.command,
                        format!("keyring {} is relative but {CREDENTIALS_DIRECTORY} is not set", keyring.display()),
                    )
                })?;
                dir.join(keyring)
            };
            args.push("-k".into());
            args.push(path.display().to_string());
        }
        Ok(args)
    }

    async fn run(&self, args: Vec<String>) -> Result<Vec<u8>, ProbeError> {
        let output = Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProbeError::connection(&self.command, "spawn", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::connection(
                &self.command,
                "query status",
                format!("{}: {}", output.status, stderr.trim()),
            ));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl Probe for CephProbe {
    fn kind(&self) -> &'static str {
        "ceph"
    }

    async fn check(&self, token: CancellationToken) -> Result<(), ProbeError> {
        let credentials_dir = std::env::var_os(CREDENTIALS_DIRECTORY).map(PathBuf::from);
        let args = self.args(credentials_dir.as_deref())?;
        debug!(command = %self.command, ?args, "Querying ceph status");

        // Dropping the output future kills the child.
        let stdout = token
            .run_until_cancelled(self.run(args))
            .await
            .ok_or_else(|| cancelled(&self.command, "query status"))??;
        parse_report(&self.command, &stdout)
    }
}

pub fn parse_report(label: &str, stdout: &[u8]) -> Result<(), ProbeError> {
    let report: Report = serde_json::from_slice(stdout)
        .map_err(|e| ProbeError::protocol(label, "parse status", e))?;
    if report.health.status != HEALTH_OK {
        return Err(ProbeError::status(label, HEALTH_OK, report.health.status));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    fn def(client: Option<&str>, keyring: Option<&str>, command: &str) -> CephDef {
        CephDef {
            client_name: client.map(String::from),
            keyring: keyring.map(PathBuf::from),
            command: command.into(),
        }
    }

    #[test]
    fn bare_args() {
        let probe = CephProbe::new(&def(None, None, "ceph"));
        assert_eq!(probe.args(None).unwrap(), vec!["status", "-f", "json"]);
    }

    #[test]
    fn relative_keyring_joins_credentials_dir() {
        let probe = CephProbe::new(&def(Some("client.health"), Some("ceph.keyring"), "ceph"));
        let args = probe.args(Some(Path::new("/run/credentials/healthcheck"))).unwrap();
        assert_eq!(
            args,
            vec![
                "status",
                "-f",
                "json",
                "-n",
                "client.health",
                "-k",
                "/run/credentials/healthcheck/ceph.keyring"
            ]
        );
    }

    #[test]
    fn relative_keyring_without_credentials_dir_is_fault() {
        let probe = CephProbe::new(&def(None, Some("ceph.keyring"), "ceph"));
        assert!(probe.args(None).unwrap_err().is_fault());

        let absolute = CephProbe::new(&def(None, Some("/etc/ceph/keyring"), "ceph"));
        assert_eq!(absolute.args(None).unwrap()[4], "/etc/ceph/keyring");
    }

    #[test]
    fn healthy_report_passes() {
        let out = br#"{"fsid": "x", "health": {"status": "HEALTH_OK", "checks": {}}}"#;
        parse_report("ceph", out).unwrap();
    }

    #[test]
    fn warning_is_status_mismatch() {
        let out = br#"{"health": {"status": "HEALTH_WARN"}}"#;
        let err = parse_report("ceph", out).unwrap_err();
        assert_eq!(err.kind(), FailureKind::StatusMismatch);
        assert!(err.to_string().contains("HEALTH_WARN"), "{err}");
    }

    #[test]
    fn garbage_is_protocol_failure() {
        let err = parse_report("ceph", b"status -f json\n").unwrap_err();
        assert_eq!(err.kind(), FailureKind::Protocol);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_is_connection_failure() {
        let probe = CephProbe::new(&def(None, None, "false"));
        let err = probe.check(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Connection);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_binary_is_connection_failure() {
        let probe = CephProbe::new(&def(None, None, "/nonexistent/ceph"));
        let err = probe.check(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Connection);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_json_output_is_protocol_failure() {
        // echo prints its arguments back, which is not a status report.
        let probe = CephProbe::new(&def(None, None, "echo"));
        let err = probe.check(CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Protocol);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelled_before_start_returns_promptly() {
        let token = CancellationToken::new();
        token.cancel();
        let probe = CephProbe::new(&def(None, None, "sleep"));
        let err = probe.check(token).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"), "{err}");
    }
}
