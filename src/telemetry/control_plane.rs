// src/telemetry/control_plane.rs
//! Control-plane delivery targets
//!
//! - `HttpControlPlane`: POSTs updates to `<endpoint>/battles/<battle_id>`
//! - `JsonlFallback`: appends undeliverable events to `<dir>/<battle_id>.jsonl`

use crate::telemetry::event::TelemetryEvent;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Receiver of battle telemetry
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Deliver one event; errors are retried by the sink
    async fn deliver(&self, event: &TelemetryEvent) -> Result<()>;
}

/// HTTP control plane client
pub struct HttpControlPlane {
    base_url: String,
    auth_token: Option<String>,
    request_timeout: Duration,
    http_client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpControlPlane {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>, request_timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http_client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        Self {
            base_url,
            auth_token,
            request_timeout,
            http_client,
        }
    }

    fn url_for(&self, event: &TelemetryEvent) -> String {
        format!("{}/battles/{}", self.base_url, event.battle_id)
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn deliver(&self, event: &TelemetryEvent) -> Result<()> {
        let body = serde_json::to_vec(&event.to_update())?;

        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(self.url_for(event))
            .header(CONTENT_TYPE, "application/json");
        if let Some(token) = &self.auth_token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = builder
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| EngineError::Telemetry(format!("request build error: {}", e)))?;

        let response = tokio::time::timeout(self.request_timeout, self.http_client.request(request))
            .await
            .map_err(|_| EngineError::Telemetry("control plane request timed out".into()))?
            .map_err(|e| EngineError::Telemetry(format!("control plane request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Telemetry(format!(
                "control plane answered HTTP {}",
                status
            )));
        }

        debug!(battle_id = %event.battle_id, sequence = event.sequence, "Telemetry event delivered");
        Ok(())
    }
}

/// Local JSONL log for events the control plane never accepted
#[derive(Debug, Clone)]
pub struct JsonlFallback {
    dir: PathBuf,
}

impl JsonlFallback {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, event: &TelemetryEvent) -> PathBuf {
        self.dir.join(format!("{}.jsonl", event.battle_id))
    }

    pub async fn append(&self, event: &TelemetryEvent) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(event))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
