//! Error types shared across the core.

use thiserror::Error;

/// Terminal descriptor carried by an `end` event.
///
/// Per-node failures never surface here; they are counted by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FederatorError {
    /// Routing matched no node, or no node returned data.
    #[error("No data available for the requested streams")]
    NoContent,
    /// The routing service could not be queried.
    #[error("Unable to route the request (routing service status {})", display_status(.status))]
    RoutingFailed { status: Option<u16> },
}

impl FederatorError {
    /// HTTP status the response layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            FederatorError::NoContent => 204,
            FederatorError::RoutingFailed { .. } => 500,
        }
    }
}

fn display_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "unavailable".to_string(),
    }
}

/// Failure of a single outbound HTTP call.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("request timed out")]
    TimedOut,
    #[error("{0}")]
    Other(String),
}
