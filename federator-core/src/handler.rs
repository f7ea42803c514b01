//! Per-request coordinator: routes the query, then hands the node URLs to a
//! [`Dispatcher`].

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument, Span};
use uuid::Uuid;

use crate::config::FederatorConfig;
use crate::dispatcher::Dispatcher;
use crate::error::FederatorError;
use crate::event::{self, EventStream};
use crate::query::{Query, QueryError};
use crate::routing::{extend_route, RoutingClient, RoutingOutcome};
use crate::stats::{RequestStats, StatsSnapshot};
use crate::transport::Transport;

/// Owns one client request from routing to the final `End` event.
pub struct RequestHandler {
    id: Uuid,
    submitted: DateTime<Utc>,
    config: Arc<FederatorConfig>,
    transport: Arc<dyn Transport>,
    stats: Arc<RequestStats>,
    cancel: CancellationToken,
    dispatcher: Mutex<Option<Dispatcher>>,
    span: Span,
}

impl std::fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandler")
            .field("id", &self.id)
            .field("submitted", &self.submitted)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl RequestHandler {
    pub fn new(config: Arc<FederatorConfig>, transport: Arc<dyn Transport>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            submitted: Utc::now(),
            config,
            transport,
            stats: Arc::new(RequestStats::new()),
            cancel: CancellationToken::new(),
            dispatcher: Mutex::new(None),
            span: info_span!("request", %id),
        }
    }

    /// Identifier used to correlate every log line of this request.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn submitted(&self) -> DateTime<Utc> {
        self.submitted
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Route `query` and start fetching from the matching nodes.
    ///
    /// Resolves once the routing call has completed. Returns `Ok(None)` when
    /// the handler was killed before that, in which case nothing else
    /// happens. Routing failures and empty results arrive as the stream's
    /// `End` event.
    pub async fn get(&self, query: Query) -> Result<Option<EventStream>, QueryError> {
        query.ensure_dispatchable()?;

        let router = RoutingClient::new(Arc::clone(&self.config), Arc::clone(&self.transport));
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(None),
            response = router.get(&query).instrument(self.span.clone()) => response,
        };
        if self.cancel.is_cancelled() {
            return Ok(None);
        }

        let (mut sender, events) = event::channel(self.config.event_capacity, self.cancel.clone());

        let routes = match response.outcome() {
            RoutingOutcome::Routes(routes) => routes,
            RoutingOutcome::NoContent => {
                sender.end(Some(FederatorError::NoContent));
                return Ok(Some(events));
            }
            RoutingOutcome::Failed { status } => {
                sender.end(Some(FederatorError::RoutingFailed { status }));
                return Ok(Some(events));
            }
        };

        let extension = query.extension_query();
        let mut urls: Vec<String> = routes
            .iter()
            .map(|route| extend_route(route, &extension))
            .collect();
        self.stats.set_routes_total(urls.len());
        // Spread simultaneous load over the nodes.
        urls.shuffle(&mut rand::thread_rng());

        let mut dispatcher = Dispatcher::new(
            Arc::clone(&self.config),
            Arc::clone(&self.transport),
            query.service,
            Arc::clone(&self.stats),
            self.cancel.child_token(),
        );
        {
            let _entered = self.span.enter();
            debug!(routes = urls.len(), "routing resolved");
            dispatcher.start(urls, sender);
        }
        *self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner) = Some(dispatcher);

        Ok(Some(events))
    }

    /// Stop the request. Safe to call repeatedly and at any stage.
    pub fn kill(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();

        let dispatcher = self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(dispatcher) = dispatcher.as_ref() {
            if dispatcher.is_running() {
                dispatcher.kill();
            }
        }
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //
