//! Query-string parsing and validation for the public FDSN endpoints.
//!
//! Turns the raw query string of a `dataselect`, `station` or `wfcatalog`
//! request into a [`Query`] the core can dispatch.

use std::sync::OnceLock;

use axum::http::StatusCode;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use federator_core::{Query, Service};
use regex::Regex;
use thiserror::Error;

// ------------------------------------------------------------------ //
//  Errors                                                             //
// ------------------------------------------------------------------ //

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    #[error("No query string was submitted")]
    QueryEmpty,
    #[error("The query string exceeds the maximum length of {0} bytes")]
    QueryTooLong(usize),
    #[error("The query string is invalid")]
    QueryInvalid,
    #[error("Parameter '{0}' is not supported")]
    UnsupportedParameter(String),
    #[error("Parameter '{0}' has an invalid value")]
    InvalidValue(String),
    #[error("A start time is required")]
    StartRequired,
    #[error("An end time is required")]
    EndRequired,
    #[error("The start time is invalid")]
    InvalidStart,
    #[error("The end time is invalid")]
    InvalidEnd,
    #[error("The start time must be before the end time")]
    StartAfterEnd,
}

impl ParamError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ParamError::QueryTooLong(_) => StatusCode::URI_TOO_LONG,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

// ------------------------------------------------------------------ //
//  Value patterns                                                     //
// ------------------------------------------------------------------ //

const QUERY_PATTERN: &str = r"^([\w\-?.:*,]+(=[\w\-?.:*,]*)?(&[\w\-?.:*,]+(=[\w\-?.:*,]*)?)*)?$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Time,
    StringListWildcards,
    Float,
    Int,
    Level,
    Include,
    Quality,
    Boolean,
    FormatWfcatalog,
    Granularity,
}

impl Kind {
    fn pattern(self) -> Option<&'static str> {
        let pattern = match self {
            // Checked by parsing.
            Kind::Time => return None,
            Kind::StringListWildcards => r"^[\w\-?*]*(,[\w\-?*]*)*$",
            Kind::Float => r"^-?(\d+(\.\d*)?|\.\d+)$",
            Kind::Int => r"^-?\d+$",
            Kind::Level => r"^(network|station|channel|response)$",
            Kind::Include => r"^(default|sample|header|all)$",
            Kind::Quality => r"^[DRQM]$",
            Kind::Boolean => r"^(true|false)$",
            Kind::FormatWfcatalog => r"^json$",
            Kind::Granularity => r"^day$",
        };
        Some(pattern)
    }

    fn accepts(self, value: &str) -> bool {
        static COMPILED: OnceLock<Vec<(Kind, Regex)>> = OnceLock::new();

        if self.pattern().is_none() {
            return true;
        }
        COMPILED
            .get_or_init(|| {
                ALL_KINDS
                    .iter()
                    .filter_map(|kind| {
                        let re = Regex::new(kind.pattern()?).ok()?;
                        Some((*kind, re))
                    })
                    .collect()
            })
            .iter()
            .find(|(kind, _)| *kind == self)
            .is_some_and(|(_, re)| re.is_match(value))
    }
}

const ALL_KINDS: [Kind; 10] = [
    Kind::Time,
    Kind::StringListWildcards,
    Kind::Float,
    Kind::Int,
    Kind::Level,
    Kind::Include,
    Kind::Quality,
    Kind::Boolean,
    Kind::FormatWfcatalog,
    Kind::Granularity,
];

fn query_string_is_valid(raw: &str) -> bool {
    static QUERY: OnceLock<Option<Regex>> = OnceLock::new();
    QUERY
        .get_or_init(|| Regex::new(QUERY_PATTERN).ok())
        .as_ref()
        .is_some_and(|re| re.is_match(raw))
}

// ------------------------------------------------------------------ //
//  Parameter tables                                                   //
// ------------------------------------------------------------------ //

/// `(canonical name, aliases, kind)`.
type ParamSpec = (&'static str, &'static [&'static str], Kind);

const SELECTOR_PARAMS: &[ParamSpec] = &[
    ("network", &["net", "network"], Kind::StringListWildcards),
    ("station", &["sta", "station"], Kind::StringListWildcards),
    ("location", &["loc", "location"], Kind::StringListWildcards),
    ("channel", &["cha", "channel"], Kind::StringListWildcards),
    ("start", &["start", "starttime"], Kind::Time),
    ("end", &["end", "endtime"], Kind::Time),
];

const STATION_PARAMS: &[ParamSpec] = &[
    ("level", &["level"], Kind::Level),
    ("latitude", &["latitude"], Kind::Float),
    ("longitude", &["longitude"], Kind::Float),
    ("minradius", &["minradius"], Kind::Float),
    ("maxradius", &["maxradius"], Kind::Float),
    ("minlatitude", &["minlatitude"], Kind::Float),
    ("maxlatitude", &["maxlatitude"], Kind::Float),
    ("minlongitude", &["minlongitude"], Kind::Float),
    ("maxlongitude", &["maxlongitude"], Kind::Float),
];

const WFCATALOG_PARAMS: &[ParamSpec] = &[
    ("include", &["include"], Kind::Include),
    ("quality", &["quality"], Kind::Quality),
    ("format", &["format"], Kind::FormatWfcatalog),
    ("granularity", &["gran", "granularity"], Kind::Granularity),
    ("minimumlength", &["minlen", "minimumlength"], Kind::Float),
    ("longestonly", &["longestonly"], Kind::Boolean),
    ("csegments", &["csegments"], Kind::Boolean),
    ("sample_rate", &["sample_rate"], Kind::Float),
    ("record_length", &["record_length"], Kind::Int),
];

/// Metrics a WFCatalog query may filter on.
const WFCATALOG_METRICS: &[(&str, Kind)] = &[
    ("num_gaps", Kind::Int),
    ("num_overlaps", Kind::Int),
    ("num_samples", Kind::Int),
    ("num_records", Kind::Int),
    ("max_gap", Kind::Float),
    ("max_overlap", Kind::Float),
    ("sum_gaps", Kind::Float),
    ("sum_overlaps", Kind::Float),
    ("percent_availability", Kind::Float),
    ("sample_min", Kind::Float),
    ("sample_max", Kind::Float),
    ("sample_mean", Kind::Float),
    ("sample_median", Kind::Float),
    ("sample_stdev", Kind::Float),
    ("sample_rms", Kind::Float),
    ("sample_lower_quartile", Kind::Float),
    ("sample_upper_quartile", Kind::Float),
    ("timing_quality_mean", Kind::Float),
    ("timing_quality_min", Kind::Float),
    ("timing_quality_max", Kind::Float),
];

const METRIC_OPERATORS: [&str; 6] = ["_eq", "_ne", "_gt", "_ge", "_lt", "_le"];

fn extension_params(service: Service) -> &'static [ParamSpec] {
    match service {
        Service::Dataselect => &[],
        Service::Station => STATION_PARAMS,
        Service::Wfcatalog => WFCATALOG_PARAMS,
    }
}

/// Resolve a submitted key to its canonical name and kind.
fn lookup_param(service: Service, key: &str) -> Option<(&'static str, Kind)> {
    SELECTOR_PARAMS
        .iter()
        .chain(extension_params(service))
        .find(|(_, aliases, _)| aliases.iter().any(|alias| *alias == key))
        .map(|(name, _, kind)| (*name, *kind))
}

/// Kind of a WFCatalog metric filter key such as `num_gaps` or
/// `sample_rms_lt`.
fn metric_kind(key: &str) -> Option<Kind> {
    let metric = METRIC_OPERATORS
        .iter()
        .find_map(|op| key.strip_suffix(op))
        .unwrap_or(key);
    WFCATALOG_METRICS
        .iter()
        .find(|(name, _)| *name == metric)
        .map(|(_, kind)| *kind)
}

// ------------------------------------------------------------------ //
//  Parsing                                                            //
// ------------------------------------------------------------------ //

/// Parse a request time. Accepts RFC 3339, a naive date-time taken as UTC,
/// or a bare date (midnight UTC).
pub fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(value) {
        return Some(instant.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Validate `raw` (the query string without `?`) for `service`.
pub fn parse_query(service: Service, raw: Option<&str>, max_bytes: usize) -> Result<Query, ParamError> {
    let raw = raw.unwrap_or_default();
    if raw.is_empty() {
        return Err(ParamError::QueryEmpty);
    }
    if raw.len() > max_bytes {
        return Err(ParamError::QueryTooLong(max_bytes));
    }
    if !query_string_is_valid(raw) {
        return Err(ParamError::QueryInvalid);
    }

    let mut query = Query::new(service);
    for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
        let (key, value) = (&*key, value.into_owned());

        let (name, kind) = match lookup_param(service, key) {
            Some(found) => found,
            None if service == Service::Wfcatalog => match metric_kind(key) {
                Some(kind) => (key, kind),
                None => return Err(ParamError::UnsupportedParameter(key.to_string())),
            },
            None => return Err(ParamError::UnsupportedParameter(key.to_string())),
        };
        if !kind.accepts(&value) {
            return Err(ParamError::InvalidValue(key.to_string()));
        }

        match name {
            "network" => query.selector.network = Some(value),
            "station" => query.selector.station = Some(value),
            "location" => query.selector.location = Some(value),
            "channel" => query.selector.channel = Some(value),
            "start" => query.start = Some(parse_time(&value).ok_or(ParamError::InvalidStart)?),
            "end" => query.end = Some(parse_time(&value).ok_or(ParamError::InvalidEnd)?),
            _ => {
                query.extension.insert(name.to_string(), value);
            }
        }
    }

    check_time_window(&query)?;
    Ok(query)
}

fn check_time_window(query: &Query) -> Result<(), ParamError> {
    if query.service.requires_time_window() {
        if query.start.is_none() {
            return Err(ParamError::StartRequired);
        }
        if query.end.is_none() {
            return Err(ParamError::EndRequired);
        }
    }
    match (query.start, query.end) {
        (Some(start), Some(end)) if start > end => Err(ParamError::StartAfterEnd),
        _ => Ok(()),
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 4096;

    fn parse(service: Service, raw: &str) -> Result<Query, ParamError> {
        parse_query(service, Some(raw), MAX)
    }

    #[test]
    fn dataselect_aliases_and_times() {
        let q = parse(
            Service::Dataselect,
            "network=NL&sta=HGN,WIT&cha=BH?&starttime=2017-01-01&end=2017-01-01T01:30:00",
        )
        .unwrap();
        assert_eq!(q.selector.network.as_deref(), Some("NL"));
        assert_eq!(q.selector.station.as_deref(), Some("HGN,WIT"));
        assert_eq!(q.selector.channel.as_deref(), Some("BH?"));
        assert_eq!(q.start, Some(Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).unwrap()));
        assert_eq!(q.end, Some(Utc.with_ymd_and_hms(2017, 1, 1, 1, 30, 0).unwrap()));
        assert!(q.extension.is_empty());
    }

    #[test]
    fn dataselect_requires_time_window() {
        assert_eq!(parse(Service::Dataselect, "net=NL&end=2017-01-02"), Err(ParamError::StartRequired));
        assert_eq!(parse(Service::Dataselect, "net=NL&start=2017-01-02"), Err(ParamError::EndRequired));
    }

    #[test]
    fn station_accepts_open_time_window_and_extension() {
        let q = parse(Service::Station, "net=NL&level=channel&minlatitude=-12.5").unwrap();
        assert_eq!(q.start, None);
        assert_eq!(q.extension.get("level").map(String::as_str), Some("channel"));
        assert_eq!(q.extension.get("minlatitude").map(String::as_str), Some("-12.5"));
    }

    #[test]
    fn wfcatalog_metric_filters_are_forwarded() {
        let q = parse(
            Service::Wfcatalog,
            "net=NL&start=2017-01-01&gran=day&num_gaps_le=3&sample_rms_gt=1.5&include=all",
        )
        .unwrap();
        assert_eq!(q.extension.get("granularity").map(String::as_str), Some("day"));
        assert_eq!(q.extension.get("num_gaps_le").map(String::as_str), Some("3"));
        assert_eq!(q.extension.get("sample_rms_gt").map(String::as_str), Some("1.5"));

        assert_eq!(
            parse(Service::Wfcatalog, "num_gaps=1.5"),
            Err(ParamError::InvalidValue("num_gaps".into()))
        );
        assert_eq!(
            parse(Service::Wfcatalog, "bogus_metric_gt=1"),
            Err(ParamError::UnsupportedParameter("bogus_metric_gt".into()))
        );
    }

    #[test]
    fn unsupported_parameters_are_rejected_per_service() {
        assert_eq!(
            parse(Service::Dataselect, "net=NL&level=station"),
            Err(ParamError::UnsupportedParameter("level".into()))
        );
        assert_eq!(
            parse(Service::Station, "net=NL&level=everything"),
            Err(ParamError::InvalidValue("level".into()))
        );
    }

    #[test]
    fn query_string_checks() {
        assert_eq!(parse_query(Service::Station, None, MAX), Err(ParamError::QueryEmpty));
        assert_eq!(parse(Service::Station, ""), Err(ParamError::QueryEmpty));
        assert_eq!(parse(Service::Station, "net=NL;drop"), Err(ParamError::QueryInvalid));
        assert_eq!(
            parse_query(Service::Station, Some("net=NL"), 3),
            Err(ParamError::QueryTooLong(3))
        );
        assert_eq!(ParamError::QueryTooLong(3).status_code(), StatusCode::URI_TOO_LONG);
    }

    #[test]
    fn bad_times() {
        assert_eq!(
            parse(Service::Dataselect, "start=yesterday&end=2017-01-01"),
            Err(ParamError::InvalidStart)
        );
        assert_eq!(
            parse(Service::Dataselect, "start=2017-01-02&end=2017-01-01"),
            Err(ParamError::StartAfterEnd)
        );
    }

    #[test]
    fn time_formats() {
        let expected = Utc.with_ymd_and_hms(2017, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(parse_time("2017-01-01T12:00:00Z"), Some(expected));
        assert_eq!(parse_time("2017-01-01T12:00:00"), Some(expected));
        assert_eq!(parse_time("2017-01-01T12:00:00.000"), Some(expected));
        assert_eq!(
            parse_time("2017-01-01"),
            Some(Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(parse_time("01/01/2017"), None);
    }
}
