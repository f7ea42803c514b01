//! Per-service wrapping of node payloads into one response document.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};
use federator_core::Service;

use crate::config::ServerConfig;

const STATION_XML_OPEN: &str =
    r#"<FDSNStationXML xmlns="http://www.fdsn.org/xml/station/1" schemaVersion="1.0">"#;
const STATION_XML_CLOSE: &[u8] = b"</FDSNStationXML>";
const NETWORK_OPEN: &[u8] = b"<Network";

/// Bytes at the end of a station document searched for its closing tag.
const CLOSING_TAG_WINDOW: usize = 25;

/// Streams node payloads of one service as a single document.
#[derive(Debug)]
pub struct ResponseFramer {
    service: Service,
    separate_nodes: bool,
    written: usize,
}

impl ResponseFramer {
    pub fn new(service: Service, config: &ServerConfig) -> Self {
        Self {
            service,
            separate_nodes: config.json_separate_nodes,
            written: 0,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self.service {
            Service::Dataselect => "application/vnd.fdsn.mseed",
            Service::Station => "application/xml",
            Service::Wfcatalog => "application/json",
        }
    }

    /// `Content-Disposition` value, for services delivered as a download.
    pub fn disposition(&self, name: &str, now: DateTime<Utc>) -> Option<String> {
        let extension = match self.service {
            Service::Dataselect => "mseed",
            Service::Wfcatalog => "json",
            Service::Station => return None,
        };
        let stamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
        Some(format!("attachment; filename={name}-{stamp}.{extension}"))
    }

    pub fn preamble(&self, config: &ServerConfig, now: DateTime<Utc>) -> Bytes {
        match self.service {
            Service::Dataselect => Bytes::new(),
            Service::Station => Bytes::from(format!(
                "{STATION_XML_OPEN}<Source>{}</Source><Sender>{}</Sender><Created>{}</Created>",
                config.source,
                config.sender,
                now.to_rfc3339_opts(SecondsFormat::Millis, true),
            )),
            Service::Wfcatalog => Bytes::from_static(b"["),
        }
    }

    /// Re-frame one node payload for inclusion in the merged document.
    pub fn frame(&mut self, payload: Bytes) -> Bytes {
        match self.service {
            Service::Dataselect => payload,
            Service::Station => payload.slice(station_body(&payload)),
            Service::Wfcatalog => {
                let inner = json_elements(&payload);
                if inner.is_empty() {
                    return Bytes::new();
                }
                self.written += 1;
                if self.separate_nodes && self.written > 1 {
                    let mut out = BytesMut::with_capacity(inner.len() + 1);
                    out.put_u8(b',');
                    out.put_slice(&payload[inner]);
                    out.freeze()
                } else {
                    payload.slice(inner)
                }
            }
        }
    }

    pub fn footer(&self) -> Bytes {
        match self.service {
            Service::Dataselect => Bytes::new(),
            Service::Station => Bytes::from_static(STATION_XML_CLOSE),
            Service::Wfcatalog => Bytes::from_static(b"]"),
        }
    }
}

/// Range from the first `<Network` up to the document's closing tag.
fn station_body(payload: &[u8]) -> std::ops::Range<usize> {
    let Some(start) = find(payload, NETWORK_OPEN) else {
        return 0..0;
    };
    let window = payload.len().saturating_sub(CLOSING_TAG_WINDOW).max(start);
    let end = find(&payload[window..], STATION_XML_CLOSE)
        .map(|at| window + at)
        .unwrap_or(payload.len());
    start..end
}

/// Range inside the outer `[` `]` of a JSON array payload.
fn json_elements(payload: &[u8]) -> std::ops::Range<usize> {
    let start = payload.iter().position(|b| !b.is_ascii_whitespace());
    let end = payload.iter().rposition(|b| !b.is_ascii_whitespace());
    match (start, end) {
        (Some(start), Some(end)) if end > start => {
            let inner = (start + 1)..end;
            let trimmed_start = payload[inner.clone()]
                .iter()
                .position(|b| !b.is_ascii_whitespace());
            match trimmed_start {
                Some(_) => inner,
                None => 0..0,
            }
        }
        _ => 0..0,
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn framer(service: Service) -> ResponseFramer {
        ResponseFramer::new(service, &ServerConfig::default())
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2017, 1, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn binary_passthrough_with_download_name() {
        let mut f = framer(Service::Dataselect);
        let payload = Bytes::from(vec![7u8; 4096]);
        assert_eq!(f.frame(payload.clone()), payload);
        assert_eq!(f.content_type(), "application/vnd.fdsn.mseed");
        assert_eq!(
            f.disposition("federator", now()).as_deref(),
            Some("attachment; filename=federator-2017-01-01T12:00:00Z.mseed")
        );
        assert!(f.preamble(&ServerConfig::default(), now()).is_empty());
        assert!(f.footer().is_empty());
    }

    #[test]
    fn station_payload_is_sliced_to_networks() {
        let mut f = framer(Service::Station);
        let node = Bytes::from_static(
            b"<?xml version=\"1.0\"?>\n<FDSNStationXML><Source>NODE</Source>\
              <Network code=\"NL\"></Network><Network code=\"NR\"></Network>\n</FDSNStationXML>\n",
        );
        assert_eq!(
            &f.frame(node)[..],
            b"<Network code=\"NL\"></Network><Network code=\"NR\"></Network>\n"
        );
        assert!(f.disposition("federator", now()).is_none());

        let preamble = f.preamble(&ServerConfig::default(), now());
        assert_eq!(
            std::str::from_utf8(&preamble).unwrap(),
            "<FDSNStationXML xmlns=\"http://www.fdsn.org/xml/station/1\" schemaVersion=\"1.0\">\
             <Source>EIDA</Source><Sender>ORFEUS</Sender><Created>2017-01-01T12:00:00.000Z</Created>"
        );
    }

    #[test]
    fn station_payload_without_networks_is_dropped() {
        let mut f = framer(Service::Station);
        assert!(f.frame(Bytes::from_static(b"<FDSNStationXML></FDSNStationXML>")).is_empty());
    }

    #[test]
    fn json_payloads_concatenate_without_separator_by_default() {
        let mut f = framer(Service::Wfcatalog);
        let a = f.frame(Bytes::from_static(b"[{\"a\":1}]"));
        let b = f.frame(Bytes::from_static(b"[{\"b\":2}]\n"));
        assert_eq!(&a[..], b"{\"a\":1}");
        assert_eq!(&b[..], b"{\"b\":2}");
    }

    #[test]
    fn json_payloads_can_be_separated() {
        let config = ServerConfig {
            json_separate_nodes: true,
            ..ServerConfig::default()
        };
        let mut f = ResponseFramer::new(Service::Wfcatalog, &config);
        let a = f.frame(Bytes::from_static(b"[{\"a\":1}]"));
        let empty = f.frame(Bytes::from_static(b"[]"));
        let b = f.frame(Bytes::from_static(b"[{\"b\":2}]"));
        assert_eq!(&a[..], b"{\"a\":1}");
        assert!(empty.is_empty());
        assert_eq!(&b[..], b",{\"b\":2}");
    }
}
