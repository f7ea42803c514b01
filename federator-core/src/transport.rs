//! Outbound HTTP seam and implementations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};

use crate::error::TransportError;

// ------------------------------------------------------------------ //
//  Trait                                                              //
// ------------------------------------------------------------------ //

/// Streaming response body.
pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Response head plus a lazily consumed body.
pub struct TransportResponse {
    pub status: u16,
    pub body: BodyStream,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Issues HTTP GET requests. Dropping the returned body aborts the transfer.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<TransportResponse, TransportError>;
}

// ------------------------------------------------------------------ //
//  ReqwestTransport (production)                                      //
// ------------------------------------------------------------------ //

/// Transport backed by a shared `reqwest` connection pool.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().user_agent(user_agent).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<TransportResponse, TransportError> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from))
            .boxed();
        Ok(TransportResponse { status, body })
    }
}

// ------------------------------------------------------------------ //
//  FakeTransport (for tests)                                          //
// ------------------------------------------------------------------ //

/// Canned reply served by [`FakeTransport`].
#[derive(Debug, Clone, Default)]
pub struct FakeReply {
    pub status: u16,
    pub chunks: Vec<Bytes>,
    /// Delay before the response head is returned.
    pub delay: Duration,
    /// Keep the body open forever after the last chunk.
    pub stall: bool,
}

impl FakeReply {
    pub fn ok(chunks: Vec<Bytes>) -> Self {
        Self {
            status: 200,
            chunks,
            ..Self::default()
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn stalled(mut self) -> Self {
        self.stall = true;
        self
    }
}

/// In-memory transport keyed by exact URL. Unknown URLs fail as if the
/// connection was refused.
#[derive(Debug, Default, Clone)]
pub struct FakeTransport {
    replies: Arc<Mutex<HashMap<String, FakeReply>>>,
    requests: Arc<Mutex<Vec<String>>>,
    open_bodies: Arc<AtomicUsize>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, reply: FakeReply) {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.into(), reply);
    }

    /// URLs requested so far, in request order.
    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Bodies handed out and not yet dropped.
    pub fn open_bodies(&self) -> usize {
        self.open_bodies.load(Ordering::SeqCst)
    }
}

struct OpenBodyGuard(Arc<AtomicUsize>);

impl Drop for OpenBodyGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn get(&self, url: &str) -> Result<TransportResponse, TransportError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(url.to_string());

        let reply = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
            .ok_or_else(|| TransportError::Other(format!("connection refused: {url}")))?;

        if !reply.delay.is_zero() {
            tokio::time::sleep(reply.delay).await;
        }

        self.open_bodies.fetch_add(1, Ordering::SeqCst);
        let guard = OpenBodyGuard(Arc::clone(&self.open_bodies));

        let chunks = stream::iter(reply.chunks.into_iter().map(Ok));
        let body = if reply.stall {
            chunks.chain(stream::pending()).boxed()
        } else {
            chunks.boxed()
        };
        // The guard lives as long as the body stream.
        let body = body
            .map(move |chunk| {
                let _guard = &guard;
                chunk
            })
            .boxed();

        Ok(TransportResponse {
            status: reply.status,
            body,
        })
    }
}
