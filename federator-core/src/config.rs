//! Core configuration value handed to every pipeline component.

use std::time::Duration;

/// Size of one indivisible record in the binary (miniSEED) payload.
pub const RECORD_SIZE: usize = 4096;

/// User agent attached to every outbound request. Some archive nodes refuse
/// requests from unknown clients, so this mimics a desktop browser.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Fedora; Linux x86_64; rv:49.0) Gecko/20100101 Firefox/49.0";

/// Tunables for routing and fan-out.
///
/// Built once at startup and shared by `Arc` with every request handler.
#[derive(Debug, Clone)]
pub struct FederatorConfig {
    /// Base URL of the routing service (query string is appended).
    pub routing_url: String,
    /// Upper bound on concurrently active work units per request.
    pub max_threads: usize,
    /// Bound on the wait for a node's response head and for each body fragment.
    pub thread_timeout: Duration,
    /// Bound on the whole routing call.
    pub routing_timeout: Duration,
    /// Unflushed bytes a binary work unit may hold before an early flush.
    pub max_bytes_flush: usize,
    /// Alignment of early flushes.
    pub record_size: usize,
    pub user_agent: String,
    /// Capacity of the event channel between dispatcher and response writer.
    pub event_capacity: usize,
}

impl Default for FederatorConfig {
    fn default() -> Self {
        Self {
            routing_url: "http://www.orfeus-eu.org/eidaws/routing/1/query".to_string(),
            max_threads: 8,
            thread_timeout: Duration::from_secs(120),
            routing_timeout: Duration::from_secs(30),
            max_bytes_flush: 8 * 1024 * 1024,
            record_size: RECORD_SIZE,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            event_capacity: 16,
        }
    }
}
