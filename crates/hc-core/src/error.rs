use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Resolution,
    Connection,
    Protocol,
    StatusMismatch,
    Fault,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolution => write!(f, "Resolution Failure"),
            Self::Connection => write!(f, "Connection Failure"),
            Self::Protocol => write!(f, "Protocol Failure"),
            Self::StatusMismatch => write!(f, "Status Mismatch"),
            Self::Fault => write!(f, "Configuration Fault"),
        }
    }
}

/// Failure of a single probe run.
///
/// Every variant names the thing that was being checked (`target`) and the
/// step that broke (`stage`), so the rendered message is enough for a human
/// reading a chat notification to know where to look.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("resolve {target}: {stage}: {reason}")]
    Resolution {
        target: String,
        stage: String,
        reason: String,
    },
    #[error("connect {target}: {stage}: {reason}")]
    Connection {
        target: String,
        stage: String,
        reason: String,
    },
    #[error("{target}: {stage}: protocol failure: {reason}")]
    Protocol {
        target: String,
        stage: String,
        reason: String,
    },
    #[error("{target}: unexpected status: expected {expected}, got {actual}")]
    StatusMismatch {
        target: String,
        expected: String,
        actual: String,
    },
    /// A contract the code relies on was broken (pinned dial reached for
    /// another host, DNS answered with a record type that was not asked for).
    /// Not retryable: the poller stops the affected check.
    #[error("fault in {target}: {reason}")]
    Fault { target: String, reason: String },
}

impl ProbeError {
    pub fn resolution(
        target: impl Into<String>,
        stage: impl Into<String>,
        reason: impl fmt::Display,
    ) -> Self {
        Self::Resolution {
            target: target.into(),
            stage: stage.into(),
            reason: reason.to_string(),
        }
    }

    pub fn connection(
        target: impl Into<String>,
        stage: impl Into<String>,
        reason: impl fmt::Display,
    ) -> Self {
        Self::Connection {
            target: target.into(),
            stage: stage.into(),
            reason: reason.to_string(),
        }
    }

    pub fn protocol(
        target: impl Into<String>,
        stage: impl Into<String>,
        reason: impl fmt::Display,
    ) -> Self {
        Self::Protocol {
            target: target.into(),
            stage: stage.into(),
            reason: reason.to_string(),
        }
    }

    pub fn status(
        target: impl Into<String>,
        expected: impl fmt::Display,
        actual: impl fmt::Display,
    ) -> Self {
        Self::StatusMismatch {
            target: target.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn fault(target: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Fault {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Resolution { .. } => FailureKind::Resolution,
            Self::Connection { .. } => FailureKind::Connection,
            Self::Protocol { .. } => FailureKind::Protocol,
            Self::StatusMismatch { .. } => FailureKind::StatusMismatch,
            Self::Fault { .. } => FailureKind::Fault,
        }
    }

    pub fn is_fault(&self) -> bool {
        self.kind() == FailureKind::Fault
    }
}
