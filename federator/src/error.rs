//! Plain-text error documents returned to clients.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::config::ServerConfig;

/// What an error document needs to describe the failed request.
#[derive(Debug, Clone, Copy)]
pub struct ErrorContext<'a> {
    pub request_uri: &'a str,
    pub submitted: DateTime<Utc>,
    pub config: &'a ServerConfig,
}

pub fn error_body(status: StatusCode, message: &str, ctx: ErrorContext<'_>) -> String {
    let reason = status.canonical_reason().unwrap_or("Unknown");
    format!(
        "Error {code}: {reason}\n\n\
         {message}\n\n\
         Usage details are available from {doc}\n\n\
         Request:\n{uri}\n\n\
         Request Submitted:\n{submitted}\n\n\
         Service Version:\n{version}\n",
        code = status.as_u16(),
        doc = ctx.config.documentation_uri,
        uri = ctx.request_uri,
        submitted = ctx.submitted.to_rfc3339_opts(SecondsFormat::Millis, true),
        version = ctx.config.version,
    )
}

pub fn error_response(status: StatusCode, message: &str, ctx: ErrorContext<'_>) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        error_body(status, message, ctx),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn body_lists_request_details() {
        let config = ServerConfig::default();
        let ctx = ErrorContext {
            request_uri: "/fdsnws/dataselect/query?net=NL",
            submitted: Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).unwrap(),
            config: &config,
        };
        let body = error_body(StatusCode::BAD_REQUEST, "An end time is required", ctx);
        let lines: Vec<&str> = body.lines().filter(|l| !l.is_empty()).collect();

        assert_eq!(lines[0], "Error 400: Bad Request");
        assert_eq!(lines[1], "An end time is required");
        assert_eq!(
            lines[2],
            "Usage details are available from http://www.orfeus-eu.org/data/eida/webservices/"
        );
        assert_eq!(&lines[3..5], ["Request:", "/fdsnws/dataselect/query?net=NL"]);
        assert_eq!(&lines[5..7], ["Request Submitted:", "2017-01-01T00:00:00.000Z"]);
        assert_eq!(lines[7], "Service Version:");
        assert_eq!(lines[8], env!("CARGO_PKG_VERSION"));
    }
}
