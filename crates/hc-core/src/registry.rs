//! Turns check definitions into pollers and runs them side by side.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use reqwest::Client;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{CheckDef, ConfigError, DnsSettings, MatrixCredentials, ProbeDef, SinkKind};
use crate::dial::{tls13_connector, Dial, TcpDialer};
use crate::dns::Resolver;
use crate::error::ProbeError;
use crate::group::{Policy, TaskGroup};
use crate::poller::Poller;
use crate::probe::{CephProbe, MatrixProbe, Probe, SmtpProbe};
use crate::sink::{HcioSink, MatrixClient, MatrixSink, Sink};

/// Upper bound on building one check, sink setup round trips included.
pub const SETUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared plumbing every check is built from.
#[derive(Clone)]
pub struct CheckDeps {
    resolver: Resolver,
    dialer: Arc<dyn Dial>,
    tls: TlsConnector,
    http: Client,
    matrix: Option<Arc<MatrixClient>>,
    setup_timeout: Duration,
}

impl CheckDeps {
    pub fn new(dns: &DnsSettings, matrix: Option<&MatrixCredentials>) -> Result<Self, ConfigError> {
        let tls = tls13_connector().map_err(|e| ConfigError::Setup {
            what: "TLS",
            reason: e.to_string(),
        })?;
        let http = Client::builder()
            .user_agent(concat!("healthcheck/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::Setup {
                what: "HTTP client",
                reason: e.to_string(),
            })?;

        let matrix = match matrix {
            Some(creds) => {
                creds.validate()?;
                let client = MatrixClient::new(&creds.homeserver, creds.access_token()?, http.clone())
                    .map_err(|e| ConfigError::Setup {
                        what: "matrix client",
                        reason: e.to_string(),
                    })?;
                Some(Arc::new(client))
            }
            None => None,
        };

        Ok(Self {
            resolver: Resolver::pinned(dns),
            dialer: Arc::new(TcpDialer),
            tls,
            http,
            matrix,
            setup_timeout: SETUP_TIMEOUT,
        })
    }

    pub fn with_resolver(mut self, resolver: Resolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dial>) -> Self {
        self.dialer = dialer;
        self
    }

    pub fn with_matrix_client(mut self, client: Arc<MatrixClient>) -> Self {
        self.matrix = Some(client);
        self
    }

    pub fn with_setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }
}

pub fn build_probe(def: &ProbeDef, deps: &CheckDeps) -> Arc<dyn Probe> {
    match def {
        ProbeDef::Smtp(smtp) => Arc::new(SmtpProbe::new(
            smtp,
            deps.resolver.clone(),
            Arc::clone(&deps.dialer),
            deps.tls.clone(),
        )),
        ProbeDef::Matrix(matrix) => Arc::new(MatrixProbe::new(matrix, deps.resolver.clone())),
        ProbeDef::Ceph(ceph) => Arc::new(CephProbe::new(ceph)),
    }
}

pub async fn build_sinks(check: &CheckDef, deps: &CheckDeps) -> Result<Vec<Arc<dyn Sink>>, ConfigError> {
    let setup_failed = |reason: String| ConfigError::SinkSetup {
        check: check.name.clone(),
        reason,
    };

    let mut sinks: Vec<Arc<dyn Sink>> = Vec::with_capacity(check.sinks.len());
    for def in &check.sinks {
        match def.variant(&check.name)? {
            SinkKind::Hcio(hcio) => {
                let sink = HcioSink::new(&hcio, deps.http.clone()).map_err(|e| setup_failed(e.to_string()))?;
                sinks.push(Arc::new(sink));
            }
            SinkKind::Matrix(matrix) => {
                let client = deps.matrix.as_ref().ok_or_else(|| {
                    setup_failed("matrix sink needs the [matrix] credentials section".into())
                })?;
                let sink = MatrixSink::setup(&check.name, Arc::clone(client), &matrix)
                    .await
                    .map_err(|e| setup_failed(e.to_string()))?;
                sinks.push(Arc::new(sink));
            }
        }
    }
    Ok(sinks)
}

/// Checks that stopped on a fault while the registry ran.
#[derive(Debug, Default)]
pub struct RunReport {
    pub faulted: Vec<(String, ProbeError)>,
}

#[derive(Default)]
pub struct Registry {
    pollers: Vec<Arc<Poller>>,
}

impl Registry {
    /// Build a poller for every valid definition. Invalid or duplicate
    /// definitions, and those whose setup outlasts the setup timeout, are
    /// skipped and returned alongside the registry.
    pub async fn setup(defs: &[CheckDef], deps: &CheckDeps) -> (Self, Vec<ConfigError>) {
        let mut registry = Self::default();
        let mut faults = Vec::new();
        let mut seen = HashSet::new();

        for def in defs {
            if !seen.insert(def.name.as_str()) {
                faults.push(ConfigError::Invalid {
                    check: def.name.clone(),
                    reason: "duplicate check name".into(),
                });
                continue;
            }
            let built = tokio::time::timeout(deps.setup_timeout, Self::build(def, deps))
                .await
                .unwrap_or_else(|_| {
                    Err(ConfigError::SinkSetup {
                        check: def.name.clone(),
                        reason: format!("setup did not finish within {:?}", deps.setup_timeout),
                    })
                });
            match built {
                Ok(poller) => registry.pollers.push(Arc::new(poller)),
                Err(err) => {
                    error!(check = %def.name, error = %err, "Skipping check");
                    faults.push(err);
                }
            }
        }

        (registry, faults)
    }

    async fn build(def: &CheckDef, deps: &CheckDeps) -> Result<Poller, ConfigError> {
        def.validate()?;
        let probe = build_probe(&def.probe_variant()?, deps);
        let sinks = build_sinks(def, deps).await?;
        Ok(Poller::new(def.name.clone(), def.interval(), probe, sinks))
    }

    pub fn from_pollers(pollers: Vec<Poller>) -> Self {
        Self {
            pollers: pollers.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Poller>> {
        self.pollers.iter().find(|p| p.name() == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.pollers.iter().map(|p| p.name())
    }

    pub fn len(&self) -> usize {
        self.pollers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pollers.is_empty()
    }

    /// Run every poller until `token` is cancelled. `ready` is called once
    /// all pollers have been started.
    ///
    /// Pollers never cancel each other: a check stopped by a fault leaves the
    /// others running. Returns once every poller has stopped.
    pub async fn run<F>(&self, token: &CancellationToken, ready: F) -> RunReport
    where
        F: FnOnce(),
    {
        let faulted = Arc::new(Mutex::new(Vec::new()));
        let mut group: TaskGroup<Infallible> = TaskGroup::new(token);

        for poller in &self.pollers {
            let poller = Arc::clone(poller);
            let faulted = Arc::clone(&faulted);
            group.spawn(Policy::NeverCancel, move |token| async move {
                if let Some(fault) = poller.run(token).await {
                    faulted
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((poller.name().to_string(), fault));
                }
                Ok(())
            });
        }

        info!(checks = self.pollers.len(), "All checks started");
        ready();

        if let Err(never) = group.wait().await {
            match never {}
        }

        let faulted = std::mem::take(&mut *faulted.lock().unwrap_or_else(PoisonError::into_inner));
        RunReport { faulted }
    }
}
