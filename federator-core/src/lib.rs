//! Request routing and fan-out core of the federator.
//!
//! One client query is resolved against the routing service into a list of
//! archive-node URLs, which a bounded pool of work units fetches
//! concurrently. Node payloads are forwarded to the response layer through a
//! single ordered [`EventStream`] (`header`, `data`, `end`).
//!
//! ```text
//! RequestHandler ──► RoutingClient ──► routing service
//!       │
//!       └──► Dispatcher ──► WorkUnit lanes ──► archive nodes
//!                 │
//!                 └──► EventStream ──► response framer
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod handler;
pub mod query;
pub mod routing;
pub mod stats;
pub mod transport;
pub mod work_unit;

pub use config::FederatorConfig;
pub use dispatcher::{Dispatcher, DispatcherState};
pub use error::{FederatorError, TransportError};
pub use event::{EventStream, FederatorEvent};
pub use handler::RequestHandler;
pub use query::{Query, QueryError, Service, StreamSelector};
pub use routing::{RoutingClient, RoutingOutcome, RoutingResponse};
pub use stats::{RequestStats, StatsSnapshot};
pub use transport::{FakeReply, FakeTransport, ReqwestTransport, Transport, TransportResponse};
pub use work_unit::{UnitOutcome, WorkUnit};
