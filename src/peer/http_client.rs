// src/peer/http_client.rs
//! HTTP peer client
//!
//! POSTs the peer request as JSON to the endpoint URL and waits for the
//! action response until the step deadline. Holds only a connection pool;
//! nothing about previous exchanges is retained.

use crate::battle::{Action, PeerEndpoint};
use crate::peer::protocol::{parse_response, PeerRequest};
use crate::peer::{PeerClient, PeerConfig};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Peer client speaking JSON over HTTP/1.1
pub struct HttpPeerClient {
    config: PeerConfig,
    http_client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpPeerClient {
    pub fn new(config: PeerConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_millis(config.connect_timeout_ms)));
        connector.set_nodelay(true);

        let http_client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            config,
            http_client,
        }
    }

    async fn post(&self, endpoint: &PeerEndpoint, request: &PeerRequest) -> Result<Action> {
        let body = serde_json::to_vec(request)?;

        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(&endpoint.url)
            .header(CONTENT_TYPE, "application/json");
        if let Some(token) = &endpoint.auth_token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let http_request = builder
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| EngineError::PeerProtocol(format!("request build error: {}", e)))?;

        let response = self
            .http_client
            .request(http_request)
            .await
            .map_err(|e| EngineError::PeerProtocol(format!("peer request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            warn!(battle_id = %request.battle_id, %status, "Peer returned error status");
            return Err(EngineError::PeerProtocol(format!("peer answered HTTP {}", status)));
        }

        let body = Limited::new(response.into_body(), self.config.max_response_bytes)
            .collect()
            .await
            .map_err(|e| EngineError::PeerProtocol(format!("response body error: {}", e)))?
            .to_bytes();

        parse_response(&body, request)
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn exchange(
        &self,
        endpoint: &PeerEndpoint,
        request: &PeerRequest,
        deadline: Instant,
    ) -> Result<Action> {
        let started = Instant::now();
        debug!(
            battle_id = %request.battle_id,
            step_index = request.step_index,
            url = %endpoint.url,
            "Sending observation to peer"
        );

        match tokio::time::timeout_at(deadline, self.post(endpoint, request)).await {
            Ok(result) => {
                metrics::histogram!("battle_peer_exchange_seconds")
                    .record(started.elapsed().as_secs_f64());
                result
            }
            Err(_) => Err(EngineError::PeerTimeout {
                step_index: request.step_index,
                timeout_ms: deadline.saturating_duration_since(started).as_millis() as u64,
            }),
        }
    }
}
