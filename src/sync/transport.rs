//! Sync transports
//!
//! The coordinator talks to the server through `SyncTransport`. `HttpTransport`
//! goes over the network; `LoopbackTransport` calls a `SyncServer` in-process.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

use super::protocol::{SyncDownResponse, SyncUpRequest, SyncUpResponse};
use super::server::{AssessorIdentity, SyncServer};
use crate::error::SyncError;

/// Header carrying the authenticated assessor id
pub const ASSESSOR_HEADER: &str = "x-assessor-id";
/// Header carrying the assessor's tenant id
pub const TENANT_HEADER: &str = "x-tenant-id";

pub const SYNC_DOWN_PATH: &str = "/api/v1/sync/down";
pub const SYNC_UP_PATH: &str = "/api/v1/sync/up";

#[async_trait::async_trait]
pub trait SyncTransport: Send + Sync {
    async fn pull(&self, since: Option<DateTime<Utc>>) -> Result<SyncDownResponse, SyncError>;
    async fn push(&self, request: &SyncUpRequest) -> Result<SyncUpResponse, SyncError>;
}

/// JSON over HTTP to a remote sync server.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    identity: AssessorIdentity,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, identity: AssessorIdentity, timeout: Duration) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            identity,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn with_identity(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header(ASSESSOR_HEADER, self.identity.assessor_id.to_string())
            .header(TENANT_HEADER, self.identity.tenant_id.to_string())
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, SyncError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait::async_trait]
impl SyncTransport for HttpTransport {
    async fn pull(&self, since: Option<DateTime<Utc>>) -> Result<SyncDownResponse, SyncError> {
        let mut request = self.with_identity(self.client.get(self.url(SYNC_DOWN_PATH)));
        if let Some(since) = since {
            request = request.query(&[("last_sync", since.to_rfc3339_opts(SecondsFormat::Micros, true))]);
        }
        debug!(url = %self.base_url, ?since, "Pulling");
        Self::decode(request.send().await?).await
    }

    async fn push(&self, body: &SyncUpRequest) -> Result<SyncUpResponse, SyncError> {
        debug!(url = %self.base_url, items = body.len(), "Pushing");
        let request = self.with_identity(self.client.post(self.url(SYNC_UP_PATH))).json(body);
        Self::decode(request.send().await?).await
    }
}

/// Calls a `SyncServer` directly. Can be switched offline to simulate a
/// dropped connection.
pub struct LoopbackTransport {
    server: SyncServer,
    identity: AssessorIdentity,
    online: AtomicBool,
    pushes: AtomicUsize,
}

impl LoopbackTransport {
    pub fn new(server: SyncServer, identity: AssessorIdentity) -> Self {
        Self {
            server,
            identity,
            online: AtomicBool::new(true),
            pushes: AtomicUsize::new(0),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Number of push requests that reached the server
    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    fn ensure_online(&self) -> Result<(), SyncError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::Connection("network unreachable".into()))
        }
    }
}

#[async_trait::async_trait]
impl SyncTransport for LoopbackTransport {
    async fn pull(&self, since: Option<DateTime<Utc>>) -> Result<SyncDownResponse, SyncError> {
        self.ensure_online()?;
        Ok(self.server.pull(&self.identity, since)?)
    }

    async fn push(&self, request: &SyncUpRequest) -> Result<SyncUpResponse, SyncError> {
        self.ensure_online()?;
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Ok(self.server.push(&self.identity, request.clone()))
    }
}
