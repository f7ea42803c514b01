//! Axum HTTP handlers for the federator service.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    async_trait,
    body::Body,
    extract::{ConnectInfo, FromRequestParts, OriginalUri, RawQuery, Request, State},
    http::{header, request::Parts, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use chrono::Utc;
use federator_core::{EventStream, FederatorEvent, RequestHandler, Service};
use futures::stream;
use tracing::{info, warn};

use crate::{
    config::ServerConfig,
    error::{error_response, ErrorContext},
    framing::ResponseFramer,
    models, AppState,
};

// ------------------------------------------------------------------ //
//  Request metadata                                                   //
// ------------------------------------------------------------------ //

/// Client-facing details of an inbound request, kept for error documents
/// and the request summary.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    /// Full request URI as submitted, base URL included.
    pub uri: String,
    pub client: String,
    pub started: Instant,
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for RequestInfo {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let uri = parts
            .extensions
            .get::<OriginalUri>()
            .map(|original| original.0.clone())
            .unwrap_or_else(|| parts.uri.clone());

        // Prefer the proxy's view of the client.
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());

        Ok(Self {
            method: parts.method.to_string(),
            path: uri.path().to_string(),
            uri: uri.to_string(),
            client: forwarded.or(peer).unwrap_or_else(|| "-".to_string()),
            started: Instant::now(),
        })
    }
}

// ------------------------------------------------------------------ //
//  Request guard                                                      //
// ------------------------------------------------------------------ //

/// Owns the request coordinator for as long as the response is alive.
///
/// Dropping it (response finished, or client gone) kills the coordinator and
/// writes the request summary.
struct RequestGuard {
    handler: Arc<RequestHandler>,
    info: RequestInfo,
    status: Option<StatusCode>,
}

impl RequestGuard {
    fn new(handler: Arc<RequestHandler>, info: RequestInfo) -> Self {
        Self {
            handler,
            info,
            status: None,
        }
    }

    fn error_response(&self, status: StatusCode, message: &str, config: &ServerConfig) -> Response {
        error_response(
            status,
            message,
            ErrorContext {
                request_uri: &self.info.uri,
                submitted: self.handler.submitted(),
                config,
            },
        )
    }

    /// Record the final status of a response that carries no stream.
    fn finish(mut self, response: Response) -> Response {
        self.status = Some(response.status());
        response
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.handler.kill();

        let stats = self.handler.stats();
        info!(
            id = %self.handler.id(),
            code = self.status.map_or(0, |status| status.as_u16()),
            path = %self.info.path,
            client = %self.info.client,
            method = %self.info.method,
            bytes = stats.bytes,
            routes_total = stats.routes_total,
            routes_success = stats.routes_success,
            routes_empty = stats.routes_empty,
            routes_failed = stats.routes_failed,
            elapsed_ms = self.info.started.elapsed().as_millis() as u64,
            "HTTP request summary"
        );
    }
}

// ------------------------------------------------------------------ //
//  GET {base}/{service}/query                                         //
// ------------------------------------------------------------------ //

pub async fn dataselect_query(
    State(state): State<Arc<AppState>>,
    info: RequestInfo,
    RawQuery(raw): RawQuery,
) -> Response {
    federate(state, Service::Dataselect, info, raw).await
}

pub async fn station_query(
    State(state): State<Arc<AppState>>,
    info: RequestInfo,
    RawQuery(raw): RawQuery,
) -> Response {
    federate(state, Service::Station, info, raw).await
}

pub async fn wfcatalog_query(
    State(state): State<Arc<AppState>>,
    info: RequestInfo,
    RawQuery(raw): RawQuery,
) -> Response {
    federate(state, Service::Wfcatalog, info, raw).await
}

/// Validate, route and fan out one query.
///
/// The status is decided by the first event: `Header` streams a 200,
/// `End(error)` answers with the error's status and a bare `End` with 204.
async fn federate(
    state: Arc<AppState>,
    service: Service,
    info: RequestInfo,
    raw: Option<String>,
) -> Response {
    let config = &state.config;
    let handler = Arc::new(RequestHandler::new(
        Arc::clone(&config.federator),
        Arc::clone(&state.transport),
    ));
    let guard = RequestGuard::new(Arc::clone(&handler), info);

    let query = match models::parse_query(service, raw.as_deref(), config.max_query_bytes) {
        Ok(query) => query,
        Err(e) => {
            let response = guard.error_response(e.status_code(), &e.to_string(), config);
            return guard.finish(response);
        }
    };

    let mut events = match handler.get(query).await {
        Ok(Some(events)) => events,
        Ok(None) => return guard.finish(StatusCode::NO_CONTENT.into_response()),
        Err(e) => {
            let response = guard.error_response(StatusCode::BAD_REQUEST, &e.to_string(), config);
            return guard.finish(response);
        }
    };

    match events.recv().await {
        Some(FederatorEvent::Header) => stream_response(config, service, events, guard, None),
        Some(FederatorEvent::Data(first)) => {
            stream_response(config, service, events, guard, Some(first))
        }
        Some(FederatorEvent::End(Some(error))) => {
            let status = StatusCode::from_u16(error.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            if status == StatusCode::NO_CONTENT {
                return guard.finish(status.into_response());
            }
            let response = guard.error_response(status, &error.to_string(), config);
            guard.finish(response)
        }
        Some(FederatorEvent::End(None)) | None => {
            guard.finish(StatusCode::NO_CONTENT.into_response())
        }
    }
}

// ------------------------------------------------------------------ //
//  Streaming body                                                     //
// ------------------------------------------------------------------ //

struct BodyState {
    events: EventStream,
    framer: ResponseFramer,
    pending: VecDeque<Bytes>,
    done: bool,
    // Dropped with the body.
    _guard: RequestGuard,
}

fn stream_response(
    config: &ServerConfig,
    service: Service,
    events: EventStream,
    mut guard: RequestGuard,
    first: Option<Bytes>,
) -> Response {
    let now = Utc::now();
    let mut framer = ResponseFramer::new(service, config);

    let mut pending = VecDeque::from([framer.preamble(config, now)]);
    if let Some(first) = first {
        pending.push_back(framer.frame(first));
    }

    let content_type = framer.content_type();
    let disposition = framer
        .disposition(&config.name, now)
        .and_then(|value| HeaderValue::from_str(&value).ok());

    guard.status = Some(StatusCode::OK);
    let body = BodyState {
        events,
        framer,
        pending,
        done: false,
        _guard: guard,
    };

    let mut response = Response::new(Body::from_stream(stream::unfold(body, next_chunk)));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    if let Some(disposition) = disposition {
        headers.insert(header::CONTENT_DISPOSITION, disposition);
    }
    response
}

async fn next_chunk(mut body: BodyState) -> Option<(Result<Bytes, Infallible>, BodyState)> {
    loop {
        if let Some(chunk) = body.pending.pop_front() {
            if chunk.is_empty() {
                continue;
            }
            return Some((Ok(chunk), body));
        }
        if body.done {
            return None;
        }

        match body.events.recv().await {
            Some(FederatorEvent::Header) => {}
            Some(FederatorEvent::Data(payload)) => {
                let framed = body.framer.frame(payload);
                body.pending.push_back(framed);
            }
            Some(FederatorEvent::End(error)) => {
                if let Some(error) = error {
                    warn!(%error, "stream ended with an error after the header");
                }
                body.done = true;
                body.pending.push_back(body.framer.footer());
            }
            None => body.done = true,
        }
    }
}

// ------------------------------------------------------------------ //
//  Maintenance, version, health                                       //
// ------------------------------------------------------------------ //

/// Answer 503 on every service route while the service is closed.
pub async fn maintenance(
    State(state): State<Arc<AppState>>,
    info: RequestInfo,
    request: Request,
    next: Next,
) -> Response {
    if !state.config.service_closed {
        return next.run(request).await;
    }
    error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        "The service is closed for maintenance",
        ErrorContext {
            request_uri: &info.uri,
            submitted: Utc::now(),
            config: &state.config,
        },
    )
}

pub async fn version(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.config.version.clone(),
    )
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router;
    use axum::{http::HeaderMap, Router};
    use federator_core::{FakeReply, FakeTransport, FederatorConfig};
    use std::time::Duration;
    use tower::ServiceExt;

    const ROUTING: &str = "http://routing.test/query";
    const DAY: &str = "start=2017-01-01T00:00:00.000Z&end=2017-01-02T00:00:00.000Z";

    fn app_with(transport: &FakeTransport, tweak: impl FnOnce(&mut ServerConfig)) -> Router {
        let mut config = ServerConfig::default();
        config.federator = Arc::new(FederatorConfig {
            routing_url: ROUTING.to_string(),
            max_threads: 2,
            thread_timeout: Duration::from_secs(5),
            ..FederatorConfig::default()
        });
        tweak(&mut config);
        router(Arc::new(AppState {
            config: Arc::new(config),
            transport: Arc::new(transport.clone()),
        }))
    }

    fn app(transport: &FakeTransport) -> Router {
        app_with(transport, |_| {})
    }

    async fn call(app: Router, uri: &str) -> (StatusCode, HeaderMap, Bytes) {
        let request = axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, body)
    }

    fn text(body: &Bytes) -> &str {
        std::str::from_utf8(body).unwrap()
    }

    #[tokio::test]
    async fn health_and_version() {
        let transport = FakeTransport::new();
        let (status, _, _) = call(app(&transport), "/health").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, body) = call(app(&transport), "/fdsnws/version").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(text(&body), env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn closed_service_answers_503_but_stays_healthy() {
        let transport = FakeTransport::new();
        let closed = |config: &mut ServerConfig| config.service_closed = true;

        let (status, _, body) = call(
            app_with(&transport, closed),
            "/fdsnws/dataselect/query?net=NL&start=2017-01-01&end=2017-01-02",
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(text(&body).starts_with("Error 503: Service Unavailable"));
        assert!(transport.requests().is_empty());

        let (status, _, _) = call(app_with(&transport, closed), "/health").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn invalid_queries_never_reach_routing() {
        let transport = FakeTransport::new();

        let (status, headers, body) =
            call(app(&transport), "/fdsnws/dataselect/query?net=NL&start=2017-01-01").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain; charset=utf-8");
        let body = text(&body);
        assert!(body.starts_with("Error 400: Bad Request"));
        assert!(body.contains("An end time is required"));
        assert!(body.contains("/fdsnws/dataselect/query?net=NL&start=2017-01-01"));

        let (status, _, _) = call(app(&transport), "/fdsnws/station/query?net=NL&bogus=1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let long = format!("/fdsnws/station/query?net={}", "N".repeat(5000));
        let (status, _, _) = call(app(&transport), &long).await;
        assert_eq!(status, StatusCode::URI_TOO_LONG);

        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn dataselect_streams_records_from_every_node() {
        let transport = FakeTransport::new();
        transport.insert(
            format!("{ROUTING}?net=NL&{DAY}&service=dataselect&format=get"),
            FakeReply::ok(vec![Bytes::from_static(b"http://a/ds?net=NL\nhttp://b/ds?net=NL\n")]),
        );
        transport.insert("http://a/ds?net=NL", FakeReply::ok(vec![Bytes::from(vec![1u8; 4096])]));
        transport.insert(
            "http://b/ds?net=NL",
            FakeReply::ok(vec![Bytes::from(vec![2u8; 2048]), Bytes::from(vec![2u8; 2048])]),
        );

        let (status, headers, body) = call(
            app(&transport),
            "/fdsnws/dataselect/query?net=NL&start=2017-01-01&end=2017-01-02",
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "application/vnd.fdsn.mseed");
        let disposition = headers[header::CONTENT_DISPOSITION].to_str().unwrap();
        assert!(disposition.starts_with("attachment; filename=federator-"));
        assert!(disposition.ends_with(".mseed"));
        assert_eq!(body.len(), 8192);
        assert_eq!(body.iter().filter(|b| **b == 1).count(), 4096);
    }

    #[tokio::test]
    async fn routing_no_content_is_204() {
        let transport = FakeTransport::new();
        transport.insert(
            format!("{ROUTING}?net=XX&{DAY}&service=dataselect&format=get"),
            FakeReply::status(204),
        );

        let (status, _, body) = call(
            app(&transport),
            "/fdsnws/dataselect/query?net=XX&start=2017-01-01&end=2017-01-02",
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn unreachable_routing_service_is_500() {
        let transport = FakeTransport::new();
        let (status, _, body) = call(
            app(&transport),
            "/fdsnws/dataselect/query?net=NL&start=2017-01-01&end=2017-01-02",
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(text(&body).starts_with("Error 500: Internal Server Error"));
    }

    #[tokio::test]
    async fn nodes_without_data_give_204() {
        let transport = FakeTransport::new();
        transport.insert(
            format!("{ROUTING}?net=NL&{DAY}&service=dataselect&format=get"),
            FakeReply::ok(vec![Bytes::from_static(b"http://a/ds?net=NL\nhttp://b/ds?net=NL")]),
        );
        transport.insert("http://a/ds?net=NL", FakeReply::status(204));
        transport.insert("http://b/ds?net=NL", FakeReply::status(500));

        let (status, _, body) = call(
            app(&transport),
            "/fdsnws/dataselect/query?net=NL&start=2017-01-01&end=2017-01-02",
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn station_documents_are_merged() {
        let transport = FakeTransport::new();
        transport.insert(
            format!("{ROUTING}?net=NL&service=station&format=get"),
            FakeReply::ok(vec![Bytes::from_static(b"http://a/st?net=NL")]),
        );
        transport.insert(
            "http://a/st?net=NL&level=station",
            FakeReply::ok(vec![Bytes::from_static(
                b"<?xml version=\"1.0\"?><FDSNStationXML><Source>NODE</Source>\
                  <Network code=\"NL\"></Network></FDSNStationXML>",
            )]),
        );

        let (status, headers, body) =
            call(app(&transport), "/fdsnws/station/query?net=NL&level=station").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "application/xml");
        assert!(headers.get(header::CONTENT_DISPOSITION).is_none());

        let body = text(&body);
        assert!(body.starts_with("<FDSNStationXML xmlns=\"http://www.fdsn.org/xml/station/1\""));
        assert!(body.contains("<Network code=\"NL\"></Network>"));
        assert_eq!(body.matches("<Source>").count(), 1);
        assert!(body.ends_with("</Network></FDSNStationXML>"));
    }

    #[tokio::test]
    async fn wfcatalog_documents_are_merged() {
        let transport = FakeTransport::new();
        transport.insert(
            format!("{ROUTING}?net=NL&{DAY}&service=wfcatalog&format=get"),
            FakeReply::ok(vec![Bytes::from_static(b"http://a/wf?net=NL")]),
        );
        transport.insert(
            "http://a/wf?net=NL&include=default",
            FakeReply::ok(vec![Bytes::from_static(b"[{\"num_gaps\":0}]")]),
        );

        let (status, headers, body) = call(
            app(&transport),
            "/fdsnws/wfcatalog/query?net=NL&start=2017-01-01&end=2017-01-02&include=default",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "application/json");
        assert!(headers[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .ends_with(".json"));
        assert_eq!(text(&body), "[{\"num_gaps\":0}]");
    }

    #[tokio::test]
    async fn services_can_be_mounted_at_the_root() {
        let transport = FakeTransport::new();
        let (status, _, _) = call(
            app_with(&transport, |config| config.base_url = String::new()),
            "/version",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
}
