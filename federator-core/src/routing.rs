//! Client for the routing service that maps a query to archive nodes.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::FederatorConfig;
use crate::error::TransportError;
use crate::query::Query;
use crate::transport::Transport;

/// Resolved routing call: status (`None` on transport failure) and the body
/// of a successful response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingResponse {
    pub status: Option<u16>,
    pub body: Bytes,
}

/// Interpretation of a [`RoutingResponse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingOutcome {
    /// One node query target per line.
    Routes(Vec<String>),
    NoContent,
    Failed { status: Option<u16> },
}

impl RoutingResponse {
    pub fn outcome(&self) -> RoutingOutcome {
        match self.status {
            Some(200) => {
                let routes: Vec<String> = String::from_utf8_lossy(&self.body)
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect();
                if routes.is_empty() {
                    RoutingOutcome::NoContent
                } else {
                    RoutingOutcome::Routes(routes)
                }
            }
            Some(204) => RoutingOutcome::NoContent,
            status => RoutingOutcome::Failed { status },
        }
    }
}

/// Append the shared extension parameters to one routed node URL.
pub fn extend_route(route: &str, extension: &str) -> String {
    if extension.is_empty() {
        route.to_string()
    } else {
        format!("{route}&{extension}")
    }
}

#[derive(Clone)]
pub struct RoutingClient {
    config: Arc<FederatorConfig>,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for RoutingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingClient")
            .field("routing_url", &self.config.routing_url)
            .finish_non_exhaustive()
    }
}

impl RoutingClient {
    pub fn new(config: Arc<FederatorConfig>, transport: Arc<dyn Transport>) -> Self {
        Self { config, transport }
    }

    /// Query string sent to the routing service, e.g.
    /// `?net=NL&start=...&service=dataselect&format=get`.
    pub fn format_query(query: &Query) -> String {
        let mut pairs: Vec<String> = query
            .routing_pairs()
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        // Ask for plain per-node URLs.
        pairs.push("format=get".to_string());
        format!("?{}", pairs.join("&"))
    }

    pub fn request_url(&self, query: &Query) -> String {
        format!("{}{}", self.config.routing_url, Self::format_query(query))
    }

    /// Issue the routing call once. Never retried; failures resolve to a
    /// response without status.
    pub async fn get(&self, query: &Query) -> RoutingResponse {
        let url = self.request_url(query);
        let started = Instant::now();

        let result = tokio::time::timeout(self.config.routing_timeout, self.fetch(&url))
            .await
            .unwrap_or(Err(TransportError::TimedOut));

        let host = url::Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                info!(
                    status = response.status,
                    host,
                    bytes = response.body.len(),
                    elapsed_ms,
                    "routing status"
                );
                response
            }
            Err(e) => {
                warn!(error = %e, host, elapsed_ms, "routing request failed");
                RoutingResponse {
                    status: None,
                    body: Bytes::new(),
                }
            }
        }
    }

    async fn fetch(&self, url: &str) -> Result<RoutingResponse, TransportError> {
        let response = self.transport.get(url).await?;
        let status = response.status;

        let mut body = BytesMut::new();
        if status == 200 {
            let mut stream = response.body;
            while let Some(chunk) = stream.next().await {
                body.extend_from_slice(&chunk?);
            }
        }

        Ok(RoutingResponse {
            status: Some(status),
            body: body.freeze(),
        })
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //
