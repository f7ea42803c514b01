//! Service configuration resolved from environment variables.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use federator_core::FederatorConfig;
use tracing::warn;

/// Everything the HTTP layer needs, plus the core tunables it hands to each
/// request.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: String,
    /// Prefix of every service route, e.g. `/fdsnws`. Empty when mounted at
    /// the root.
    pub base_url: String,
    /// Used in attachment file names.
    pub name: String,
    pub source: String,
    pub sender: String,
    pub documentation_uri: String,
    pub service_closed: bool,
    pub max_query_bytes: usize,
    pub json_separate_nodes: bool,
    pub version: String,
    pub federator: Arc<FederatorConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; missing keys take their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let core_defaults = FederatorConfig::default();
        let federator = FederatorConfig {
            routing_url: string("ROUTING_URL", &core_defaults.routing_url),
            max_threads: parse_or(&lookup, "FEDERATOR_MAX_THREADS", core_defaults.max_threads),
            thread_timeout: millis_or(&lookup, "FEDERATOR_THREAD_TIMEOUT_MS", core_defaults.thread_timeout),
            routing_timeout: millis_or(
                &lookup,
                "FEDERATOR_ROUTING_TIMEOUT_MS",
                core_defaults.routing_timeout,
            ),
            max_bytes_flush: parse_or(&lookup, "FEDERATOR_MAX_BYTES_FLUSH", core_defaults.max_bytes_flush),
            ..core_defaults
        };

        Self {
            addr: string("FEDERATOR_ADDR", "0.0.0.0:8080"),
            base_url: normalize_base_url(&string("FEDERATOR_BASE_URL", "/fdsnws")),
            name: string("FEDERATOR_NAME", "federator"),
            source: string("FEDERATOR_SOURCE", "EIDA"),
            sender: string("FEDERATOR_SENDER", "ORFEUS"),
            documentation_uri: string(
                "FEDERATOR_DOCUMENTATION_URI",
                "http://www.orfeus-eu.org/data/eida/webservices/",
            ),
            service_closed: parse_or(&lookup, "FEDERATOR_SERVICE_CLOSED", false),
            max_query_bytes: parse_or(&lookup, "FEDERATOR_MAX_QUERY_BYTES", 4096),
            json_separate_nodes: parse_or(&lookup, "FEDERATOR_JSON_SEPARATE_NODES", false),
            version: env!("CARGO_PKG_VERSION").to_string(),
            federator: Arc::new(federator),
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, ?default, "invalid configuration value, using default");
                default
            }
        },
    }
}

fn millis_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    let ms = parse_or(lookup, key, default.as_millis() as u64);
    Duration::from_millis(ms)
}

/// `fdsnws/` → `/fdsnws`, `/` → ``.
fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}
