//! Normalized client query handed to the core by the parsing layer.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;

// ------------------------------------------------------------------ //
//  Service tag                                                        //
// ------------------------------------------------------------------ //

/// Federated web services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    /// Binary waveform records (miniSEED).
    Dataselect,
    /// Station metadata (FDSNStationXML).
    Station,
    /// Waveform quality metrics (JSON).
    Wfcatalog,
}

impl Service {
    pub fn as_str(self) -> &'static str {
        match self {
            Service::Dataselect => "dataselect",
            Service::Station => "station",
            Service::Wfcatalog => "wfcatalog",
        }
    }

    /// Whether the payload is made of fixed-size records that may be
    /// flushed early on record boundaries.
    pub fn is_binary(self) -> bool {
        matches!(self, Service::Dataselect)
    }

    /// Whether a query must carry both start and end time.
    pub fn requires_time_window(self) -> bool {
        matches!(self, Service::Dataselect)
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dataselect" => Ok(Service::Dataselect),
            "station" => Ok(Service::Station),
            "wfcatalog" => Ok(Service::Wfcatalog),
            other => Err(QueryError::UnknownService(other.to_string())),
        }
    }
}

// ------------------------------------------------------------------ //
//  Query model                                                        //
// ------------------------------------------------------------------ //

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("the {0} service requires a start time")]
    MissingStart(Service),
    #[error("the {0} service requires an end time")]
    MissingEnd(Service),
    #[error("unknown service '{0}'")]
    UnknownService(String),
}

/// Network / station / location / channel selector. `None` means "any".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSelector {
    pub network: Option<String>,
    pub station: Option<String>,
    pub location: Option<String>,
    pub channel: Option<String>,
}

/// A validated query. Immutable once handed to a [`crate::RequestHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub selector: StreamSelector,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub service: Service,
    /// Service-specific parameters forwarded verbatim to every node.
    pub extension: BTreeMap<String, String>,
}

impl Query {
    pub fn new(service: Service) -> Self {
        Self {
            selector: StreamSelector::default(),
            start: None,
            end: None,
            service,
            extension: BTreeMap::new(),
        }
    }

    /// Refuse queries the core must not dispatch.
    pub fn ensure_dispatchable(&self) -> Result<(), QueryError> {
        if self.service.requires_time_window() {
            if self.start.is_none() {
                return Err(QueryError::MissingStart(self.service));
            }
            if self.end.is_none() {
                return Err(QueryError::MissingEnd(self.service));
            }
        }
        Ok(())
    }

    /// Key/value pairs sent to the routing service: every set field except
    /// the extension map.
    pub fn routing_pairs(&self) -> Vec<(&'static str, String)> {
        let fields = [
            ("net", self.selector.network.clone()),
            ("sta", self.selector.station.clone()),
            ("loc", self.selector.location.clone()),
            ("cha", self.selector.channel.clone()),
            ("start", self.start.map(format_instant)),
            ("end", self.end.map(format_instant)),
            ("service", Some(self.service.as_str().to_string())),
        ];

        fields
            .into_iter()
            .filter_map(|(key, value)| match value {
                Some(v) if !v.is_empty() => Some((key, v)),
                _ => None,
            })
            .collect()
    }

    /// Extension map rendered as `key=value&...`, skipping empty values.
    pub fn extension_query(&self) -> String {
        self.extension
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Render an instant the way the routing service expects it
/// (`2017-01-01T00:00:00.000Z`).
pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dataselect() -> Query {
        let mut q = Query::new(Service::Dataselect);
        q.selector.network = Some("NL".into());
        q.selector.station = Some("HGN".into());
        q.selector.location = Some(String::new());
        q.start = Some(Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).unwrap());
        q.end = Some(Utc.with_ymd_and_hms(2017, 1, 1, 1, 0, 0).unwrap());
        q
    }

    #[test]
    fn routing_pairs_skip_empty_and_unset_fields() {
        let pairs = dataselect().routing_pairs();
        assert_eq!(
            pairs,
            vec![
                ("net", "NL".to_string()),
                ("sta", "HGN".to_string()),
                ("start", "2017-01-01T00:00:00.000Z".to_string()),
                ("end", "2017-01-01T01:00:00.000Z".to_string()),
                ("service", "dataselect".to_string()),
            ]
        );
    }

    #[test]
    fn routing_pairs_exclude_extension() {
        let mut q = dataselect();
        q.extension.insert("level".into(), "channel".into());
        assert!(q.routing_pairs().iter().all(|(k, _)| *k != "level"));
    }

    #[test]
    fn extension_query_skips_empty_values() {
        let mut q = Query::new(Service::Station);
        q.extension.insert("level".into(), "channel".into());
        q.extension.insert("latitude".into(), String::new());
        q.extension.insert("maxradius".into(), "10".into());
        assert_eq!(q.extension_query(), "level=channel&maxradius=10");
    }

    #[test]
    fn dataselect_requires_time_window() {
        let mut q = dataselect();
        q.start = None;
        assert_eq!(
            q.ensure_dispatchable(),
            Err(QueryError::MissingStart(Service::Dataselect))
        );

        let mut q = dataselect();
        q.end = None;
        assert_eq!(
            q.ensure_dispatchable(),
            Err(QueryError::MissingEnd(Service::Dataselect))
        );
    }

    #[test]
    fn station_accepts_open_time_window() {
        assert!(Query::new(Service::Station).ensure_dispatchable().is_ok());
    }

    #[test]
    fn service_round_trips_through_str() {
        for service in [Service::Dataselect, Service::Station, Service::Wfcatalog] {
            assert_eq!(service.as_str().parse::<Service>(), Ok(service));
        }
        assert!("event".parse::<Service>().is_err());
    }
}
