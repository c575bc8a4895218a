//! nginx access log lines carrying upstream timing.
//!
//! The expected `log_format` is:
//!
//! ```text
//! $remote_addr - $remote_user [$time_local] "$request" $status $body_bytes_sent
//! "$http_referer" "$http_x_forwarded_for" "$http_user_agent" $request_time
//! $request_length $upstream_response_time $upstream_addr $upstream_status
//! $server_name $server_addr $server_port $request_uri
//! ```

use super::{Charset, FieldSpec, LineLayout, Segment};
use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

pub const URI_FIELD: &str = "uri";
pub const UPSTREAM_RESPONSE_TIME_FIELD: &str = "upstream_response_time";

pub const UPSTREAM_TIMING_LAYOUT: LineLayout = LineLayout::new(&[
    Segment::Field(FieldSpec::bare("remote_addr")),
    Segment::Literal("-"),
    Segment::Field(FieldSpec::bare("remote_user")),
    Segment::Field(FieldSpec::bracketed("time_local")),
    Segment::Field(FieldSpec::quoted("request", Charset::NonEmpty)),
    Segment::Field(FieldSpec::digits("status")),
    Segment::Field(FieldSpec::digits("body_bytes_sent")),
    Segment::Field(FieldSpec::quoted("http_referer", Charset::Any)),
    Segment::Field(FieldSpec::quoted("http_x_forwarded_for", Charset::NoWhitespace)),
    Segment::Field(FieldSpec::quoted("http_user_agent", Charset::Any)),
    Segment::Field(FieldSpec::bare("request_time")),
    Segment::Field(FieldSpec::digits("request_length")),
    Segment::Field(FieldSpec::bare(UPSTREAM_RESPONSE_TIME_FIELD)),
    Segment::Field(FieldSpec::bare("upstream_addr")),
    Segment::Field(FieldSpec::digits("upstream_status")),
    Segment::Field(FieldSpec::bare("server_name")),
    Segment::Field(FieldSpec::bare("server_addr")),
    Segment::Field(FieldSpec::digits("server_port")),
    Segment::Field(FieldSpec::bare(URI_FIELD)),
]);

/// One observation extracted from an access log line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub uri: String,
    /// Seconds, as reported by nginx.
    pub upstream_response_time: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("upstream response time {value:?} for {uri} is not a number")]
    InvalidDuration { uri: String, value: String },
}

/// What to do when a line matches the layout but its upstream time is not numeric
/// (nginx writes `-` when no upstream was contacted).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DurationPolicy {
    /// Record the URI with a duration of zero.
    #[default]
    DefaultZero,
    /// Return [`ParseError::InvalidDuration`] and skip the line.
    Reject,
}

impl FromStr for DurationPolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "default-zero" | "default_zero" | "zero" => Ok(DurationPolicy::DefaultZero),
            "reject" | "skip" => Ok(DurationPolicy::Reject),
            other => Err(anyhow!(
                "unknown duration policy {other:?}; expected \"default-zero\" or \"reject\""
            )),
        }
    }
}

/// Stateless parser for [`UPSTREAM_TIMING_LAYOUT`] (or any layout exposing the same two fields).
///
/// Field positions are resolved once at construction, so `parse` only tokenizes and indexes.
///
/// ```
/// use nginx_exporter::parser::{AccessLogParser, DurationPolicy};
///
/// let parser = AccessLogParser::new(DurationPolicy::DefaultZero).unwrap();
/// let line = r#"10.0.0.1 - - [01/Jan/2024:00:00:00 +0000] "GET /foo HTTP/1.1" 200 512 "-" "-" "curl/8.0" 0.050 128 0.045 10.0.0.2:80 200 web01 10.0.0.3 80 /foo"#;
/// let record = parser.parse(line).unwrap().unwrap();
/// assert_eq!(record.uri, "/foo");
/// ```
#[derive(Debug, Clone)]
pub struct AccessLogParser {
    layout: LineLayout,
    uri_index: usize,
    duration_index: usize,
    policy: DurationPolicy,
}

impl AccessLogParser {
    pub fn new(policy: DurationPolicy) -> Result<Self> {
        Self::with_layout(UPSTREAM_TIMING_LAYOUT, policy)
    }

    pub fn with_layout(layout: LineLayout, policy: DurationPolicy) -> Result<Self> {
        let uri_index = layout
            .position(URI_FIELD)
            .ok_or_else(|| anyhow!("layout has no {URI_FIELD:?} field"))?;
        let duration_index = layout
            .position(UPSTREAM_RESPONSE_TIME_FIELD)
            .ok_or_else(|| anyhow!("layout has no {UPSTREAM_RESPONSE_TIME_FIELD:?} field"))?;

        Ok(Self {
            layout,
            uri_index,
            duration_index,
            policy,
        })
    }

    /// Returns `Ok(None)` for lines that do not fit the layout.
    pub fn parse(&self, line: &str) -> Result<Option<LogRecord>, ParseError> {
        let Some(values) = self.layout.tokenize(line) else {
            return Ok(None);
        };

        let uri = values[self.uri_index];
        let raw_duration = values[self.duration_index];

        let upstream_response_time = match parse_seconds(raw_duration) {
            Some(seconds) => seconds,
            None => match self.policy {
                DurationPolicy::DefaultZero => {
                    debug!(
                        uri,
                        value = raw_duration,
                        "non-numeric upstream response time; recording zero"
                    );
                    0.0
                }
                DurationPolicy::Reject => {
                    return Err(ParseError::InvalidDuration {
                        uri: uri.to_string(),
                        value: raw_duration.to_string(),
                    })
                }
            },
        };

        Ok(Some(LogRecord {
            uri: uri.to_string(),
            upstream_response_time,
        }))
    }
}

fn parse_seconds(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|value| value.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"10.0.0.1 - - [01/Jan/2024:00:00:00 +0000] "GET /foo HTTP/1.1" 200 512 "-" "-" "curl/8.0" 0.050 128 0.045 10.0.0.2:80 200 web01 10.0.0.3 80 /foo"#;

    fn sample_with_duration(duration: &str) -> String {
        SAMPLE.replace(" 0.045 ", &format!(" {duration} "))
    }

    fn parser() -> AccessLogParser {
        AccessLogParser::new(DurationPolicy::DefaultZero).expect("default layout resolves")
    }

    #[test]
    fn parses_uri_and_upstream_time() {
        let record = parser()
            .parse(SAMPLE)
            .expect("no error")
            .expect("line matches");
        assert_eq!(record.uri, "/foo");
        assert!((record.upstream_response_time - 0.045).abs() < 1e-9);
    }

    #[test]
    fn layout_positions_match_documented_format() {
        assert_eq!(UPSTREAM_TIMING_LAYOUT.field_count(), 18);
        assert_eq!(
            UPSTREAM_TIMING_LAYOUT.position(UPSTREAM_RESPONSE_TIME_FIELD),
            Some(11)
        );
        assert_eq!(UPSTREAM_TIMING_LAYOUT.position(URI_FIELD), Some(17));
    }

    #[test]
    fn tokenizes_every_field_of_sample() {
        let values = UPSTREAM_TIMING_LAYOUT.tokenize(SAMPLE).expect("matches");
        let named: Vec<(&str, &str)> = UPSTREAM_TIMING_LAYOUT
            .field_names()
            .zip(values.iter().copied())
            .collect();
        assert_eq!(
            named,
            vec![
                ("remote_addr", "10.0.0.1"),
                ("remote_user", "-"),
                ("time_local", "01/Jan/2024:00:00:00 +0000"),
                ("request", "GET /foo HTTP/1.1"),
                ("status", "200"),
                ("body_bytes_sent", "512"),
                ("http_referer", "-"),
                ("http_x_forwarded_for", "-"),
                ("http_user_agent", "curl/8.0"),
                ("request_time", "0.050"),
                ("request_length", "128"),
                ("upstream_response_time", "0.045"),
                ("upstream_addr", "10.0.0.2:80"),
                ("upstream_status", "200"),
                ("server_name", "web01"),
                ("server_addr", "10.0.0.3"),
                ("server_port", "80"),
                ("uri", "/foo"),
            ]
        );
    }

    #[test]
    fn parses_exact_decimal_value() {
        let record = parser()
            .parse(&sample_with_duration("0.123"))
            .expect("no error")
            .expect("line matches");
        assert!((record.upstream_response_time - 0.123).abs() < 1e-9);
    }

    #[test]
    fn dash_duration_defaults_to_zero_and_keeps_uri() {
        let record = parser()
            .parse(&sample_with_duration("-"))
            .expect("permissive policy never errors")
            .expect("line matches");
        assert_eq!(record.uri, "/foo");
        assert_eq!(record.upstream_response_time, 0.0);
    }

    #[test]
    fn non_finite_duration_is_treated_as_non_numeric() {
        let record = parser()
            .parse(&sample_with_duration("NaN"))
            .expect("no error")
            .expect("line matches");
        assert_eq!(record.upstream_response_time, 0.0);
    }

    #[test]
    fn reject_policy_returns_error_for_non_numeric_duration() {
        let parser = AccessLogParser::new(DurationPolicy::Reject).expect("layout resolves");
        let err = parser
            .parse(&sample_with_duration("-"))
            .expect_err("strict policy rejects");
        assert_eq!(
            err,
            ParseError::InvalidDuration {
                uri: "/foo".to_string(),
                value: "-".to_string(),
            }
        );
    }

    #[test]
    fn non_matching_lines_yield_none() {
        let parser = parser();
        let lines = vec![
            String::new(),
            "hello world".to_string(),
            r#"10.0.0.1 - - [01/Jan/2024:00:00:00 +0000] "GET /foo HTTP/1.1" 200 512"#.to_string(),
            // upstream_status must be numeric
            SAMPLE.replace(" 10.0.0.2:80 200 ", " 10.0.0.2:80 - "),
            // empty request line
            SAMPLE.replace(r#""GET /foo HTTP/1.1""#, r#""""#),
        ];
        for line in &lines {
            assert_eq!(parser.parse(line), Ok(None), "line: {line}");
        }
    }

    #[test]
    fn user_agent_with_spaces_and_query_uri() {
        let line = SAMPLE
            .replace(r#""curl/8.0""#, r#""Mozilla/5.0 (X11; Linux x86_64)""#)
            .replace(" /foo", " /search?q=rust&page=2");
        let record = parser()
            .parse(&line)
            .expect("no error")
            .expect("line matches");
        assert_eq!(record.uri, "/search?q=rust&page=2");
    }

    #[test]
    fn escaped_quotes_in_quoted_fields_still_match() {
        let line = SAMPLE
            .replace(r#""curl/8.0""#, r#""Mozilla \"compat\" bot""#)
            .replace(r#""GET /foo HTTP/1.1""#, r#""GET /foo\" x HTTP/1.1""#);
        let record = parser()
            .parse(&line)
            .expect("no error")
            .expect("line matches");
        assert_eq!(record.uri, "/foo");
        assert!((record.upstream_response_time - 0.045).abs() < 1e-9);

        let values = UPSTREAM_TIMING_LAYOUT.tokenize(&line).expect("matches");
        assert_eq!(values[8], r#"Mozilla \"compat\" bot"#);
        assert_eq!(values[3], r#"GET /foo\" x HTTP/1.1"#);
    }

    #[test]
    fn layout_without_uri_is_rejected() {
        const NO_URI: LineLayout = LineLayout::new(&[Segment::Field(FieldSpec::bare(
            UPSTREAM_RESPONSE_TIME_FIELD,
        ))]);
        assert!(AccessLogParser::with_layout(NO_URI, DurationPolicy::DefaultZero).is_err());
    }

    #[test]
    fn duration_policy_from_str() {
        assert_eq!(
            "default-zero".parse::<DurationPolicy>().unwrap(),
            DurationPolicy::DefaultZero
        );
        assert_eq!(
            " Reject ".parse::<DurationPolicy>().unwrap(),
            DurationPolicy::Reject
        );
        assert!("maybe".parse::<DurationPolicy>().is_err());
    }
}
