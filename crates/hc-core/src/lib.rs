#![forbid(unsafe_code)]

pub mod config;
pub mod dial;
pub mod dns;
pub mod error;
pub mod group;
pub mod poller;
pub mod probe;
pub mod registry;
pub mod sink;

pub use config::{
    CephDef, CheckDef, ConfigError, DnsSettings, HcioDef, MatrixCredentials, MatrixDef,
    MatrixSinkDef, ProbeDef, SinkDef, SinkKind, SmtpDef,
};
pub use dial::{pinned_client, tls13_connector, tls13_connector_with_roots, Dial, PinViolation, TcpDialer};
pub use dns::{AddressFamily, DnsError, Exchange, PinnedServer, Pointer, PointerKind, Resolver};
pub use error::{FailureKind, ProbeError};
pub use group::{Policy, TaskGroup};
pub use poller::{Cycle, Poller, PollerState};
pub use probe::{merge_targets, CephProbe, MatrixProbe, Probe, SmtpProbe, Target};
pub use registry::{build_probe, build_sinks, CheckDeps, Registry, RunReport};
pub use sink::{HcioSink, MatrixClient, MatrixSink, Sink, SinkError};
