//! healthchecks.io dead man's switch.
//!
//! Only successful cycles ping. A failing check stays silent and the missing
//! ping is what raises the alarm on the healthchecks.io side.

use async_trait::async_trait;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::{Sink, SinkError};
use crate::config::HcioDef;
use crate::error::ProbeError;

pub struct HcioSink {
    url: Url,
    http: Client,
}

impl HcioSink {
    pub fn new(def: &HcioDef, http: Client) -> Result<Self, SinkError> {
        let invalid = |reason: &str| SinkError::Url {
            url: def.base_url.clone(),
            reason: reason.to_string(),
        };
        let mut url = Url::parse(&def.base_url).map_err(|e| invalid(&e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid("cannot be a base URL"))?
            .pop_if_empty()
            .push(def.uuid.trim());
        Ok(Self { url, http })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn ping(&self) -> Result<(), SinkError> {
        let response = self
            .http
            .head(self.url.clone())
            .send()
            .await
            .map_err(|e| SinkError::http(&self.url, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Status {
                url: self.url.to_string(),
                status: status.as_u16(),
            });
        }
        debug!(url = %self.url, "Pinged healthchecks.io");
        Ok(())
    }
}

#[async_trait]
impl Sink for HcioSink {
    fn kind(&self) -> &'static str {
        "hcio"
    }

    async fn sink(
        &self,
        token: CancellationToken,
        failure: Option<&ProbeError>,
    ) -> Result<(), SinkError> {
        if failure.is_some() {
            return Ok(());
        }
        token
            .run_until_cancelled(self.ping())
            .await
            .unwrap_or(Err(SinkError::Cancelled))
    }
}
