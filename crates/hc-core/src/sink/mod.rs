//! Destinations for check results.
//!
//! A sink is called once per poll cycle with the cycle's outcome. Sinks are
//! free to drop reports they consider redundant.

pub mod hcio;
pub mod matrix;

pub use hcio::HcioSink;
pub use matrix::{MatrixClient, MatrixSink};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::ProbeError;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("request to {url} failed: {reason}")]
    Http { url: String, reason: String },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("matrix reports {status}: {errcode}: {message}")]
    Matrix {
        status: u16,
        errcode: String,
        message: String,
    },

    #[error("unexpected response from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("invalid URL {url}: {reason}")]
    Url { url: String, reason: String },

    #[error("cancelled before delivery")]
    Cancelled,
}

impl SinkError {
    pub(crate) fn http(url: &url::Url, err: &reqwest::Error) -> Self {
        Self::Http {
            url: url.to_string(),
            reason: crate::dial::error_chain(err),
        }
    }
}

#[async_trait]
pub trait Sink: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Report one cycle. `failure` is `None` when the check passed.
    async fn sink(
        &self,
        token: CancellationToken,
        failure: Option<&ProbeError>,
    ) -> Result<(), SinkError>;
}
