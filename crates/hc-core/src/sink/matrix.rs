//! Reports into Matrix rooms via the client-server API.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use super::{Sink, SinkError};
use crate::config::MatrixSinkDef;
use crate::error::ProbeError;

const CLIENT_API: [&str; 3] = ["_matrix", "client", "v3"];

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errcode: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JoinedRooms {
    joined_rooms: Vec<String>,
}

#[derive(Debug, Serialize)]
struct TextMessage<'a> {
    msgtype: &'static str,
    body: &'a str,
}

/// Authenticated access to one homeserver.
///
/// Transaction ids are unique per client: a counter seeded with the current
/// unix time in milliseconds, so restarts do not reuse ids of earlier runs.
pub struct MatrixClient {
    homeserver: Url,
    token: String,
    http: Client,
    txn: AtomicU64,
}

impl MatrixClient {
    pub fn new(homeserver: &str, token: impl Into<String>, http: Client) -> Result<Self, SinkError> {
        let homeserver = Url::parse(homeserver).map_err(|e| SinkError::Url {
            url: homeserver.to_string(),
            reason: e.to_string(),
        })?;
        let seed = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default();
        Ok(Self {
            homeserver,
            token: token.into(),
            http,
            txn: AtomicU64::new(seed),
        })
    }

    fn next_txn(&self) -> String {
        (self.txn.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, SinkError> {
        let mut url = self.homeserver.clone();
        url.path_segments_mut()
            .map_err(|_| SinkError::Url {
                url: self.homeserver.to_string(),
                reason: "cannot be a base URL".into(),
            })?
            .pop_if_empty()
            .extend(CLIENT_API)
            .extend(segments);
        Ok(url)
    }

    async fn call<T: DeserializeOwned>(&self, url: &Url, request: RequestBuilder) -> Result<T, SinkError> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| SinkError::http(url, &e))?;
        let status = response.status();
        let body = response.bytes().await.map_err(|e| SinkError::http(url, &e))?;

        let reported: ErrorBody = serde_json::from_slice(&body).unwrap_or_default();
        if status != StatusCode::OK || reported.errcode.is_some() || reported.error.is_some() {
            return Err(SinkError::Matrix {
                status: status.as_u16(),
                errcode: reported.errcode.unwrap_or_default(),
                message: reported.error.unwrap_or_default(),
            });
        }

        serde_json::from_slice(&body).map_err(|e| SinkError::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    pub async fn joined_rooms(&self) -> Result<Vec<String>, SinkError> {
        let url = self.endpoint(&["joined_rooms"])?;
        let rooms: JoinedRooms = self.call(&url, self.http.get(url.clone())).await?;
        Ok(rooms.joined_rooms)
    }

    pub async fn join(&self, room: &str) -> Result<(), SinkError> {
        let url = self.endpoint(&["join", room])?;
        let _: IgnoredAny = self
            .call(&url, self.http.post(url.clone()).json(&serde_json::json!({})))
            .await?;
        Ok(())
    }

    pub async fn send_text(&self, room: &str, text: &str) -> Result<(), SinkError> {
        let txn = self.next_txn();
        let url = self.endpoint(&["rooms", room, "send", "m.room.message", &txn])?;
        let message = TextMessage {
            msgtype: "m.text",
            body: text,
        };
        let _: IgnoredAny = self.call(&url, self.http.put(url.clone()).json(&message)).await?;
        Ok(())
    }
}

/// Posts `"<check>: OK"` or `"<check>: <error>"` into rooms, skipping a
/// message identical to the last one delivered.
pub struct MatrixSink {
    check: String,
    client: Arc<MatrixClient>,
    rooms: Vec<String>,
    last_message: Mutex<Option<String>>,
}

impl MatrixSink {
    /// Join the configured rooms, or adopt every joined room when none are
    /// configured.
    pub async fn setup(
        check: &str,
        client: Arc<MatrixClient>,
        def: &MatrixSinkDef,
    ) -> Result<Self, SinkError> {
        let joined = client.joined_rooms().await?;

        let rooms = if def.rooms.is_empty() {
            joined
        } else {
            for room in &def.rooms {
                if !joined.contains(room) {
                    client.join(room).await?;
                    info!(check, room = %room, "Joined matrix room");
                }
            }
            def.rooms.clone()
        };

        debug!(check, rooms = rooms.len(), "Matrix sink ready");
        Ok(Self {
            check: check.to_string(),
            client,
            rooms,
            last_message: Mutex::new(None),
        })
    }

    pub fn rooms(&self) -> &[String] {
        &self.rooms
    }

    pub fn message(check: &str, failure: Option<&ProbeError>) -> String {
        match failure {
            None => format!("{check}: OK"),
            Some(err) => format!("{check}: {err}"),
        }
    }

    async fn deliver(&self, message: String) -> Result<(), SinkError> {
        let mut last = self.last_message.lock().await;
        if last.as_deref() == Some(message.as_str()) {
            debug!(check = %self.check, "Suppressing repeated matrix message");
            return Ok(());
        }
        for room in &self.rooms {
            self.client.send_text(room, &message).await?;
        }
        *last = Some(message);
        Ok(())
    }
}

#[async_trait]
impl Sink for MatrixSink {
    fn kind(&self) -> &'static str {
        "matrix"
    }

    async fn sink(
        &self,
        token: CancellationToken,
        failure: Option<&ProbeError>,
    ) -> Result<(), SinkError> {
        let message = Self::message(&self.check, failure);
        token
            .run_until_cancelled(self.deliver(message))
            .await
            .unwrap_or(Err(SinkError::Cancelled))
    }
}
