//! Per-format line parsers. Each returns a [`RawRecord`] or a typed
//! [`ParseError`]; none of them touch normalizer state.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::fields::{self, FieldMap, RawRecord};
use super::{Field, LogFormat, Outcome, ParseError};

static CLF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^(?P<host>\S+) (?P<ident>\S+) (?P<user>\S+) \[(?P<ts>[^\]]+)\] "(?P<req>[^"]*)" (?P<status>\d{3}|-) (?P<bytes>\d+|-)(?: "(?P<referer>[^"]*)" "(?P<ua>[^"]*)")?(?:\s+(?P<latency>\d+(?:\.\d+)?))?\s*$"#,
    )
    .expect("CLF pattern compiles")
});

static RFC3164_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:<(?P<pri>\d{1,3})>)?(?P<ts>[A-Z][a-z]{2}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2})\s+(?P<host>\S+)\s+(?P<app>[^\s:\[]+)(?:\[(?P<pid>\d+)\])?:\s*(?P<msg>.*)$",
    )
    .expect("RFC 3164 pattern compiles")
});

static RFC5424_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^<(?P<pri>\d{1,3})>\d{1,2}\s+(?P<ts>\S+)\s+(?P<host>\S+)\s+(?P<app>\S+)\s+(?P<pid>\S+)\s+(?P<msgid>\S+)\s+(?P<sd>-|(?:\[[^\]]*\])+)\s*(?P<msg>.*)$",
    )
    .expect("RFC 5424 pattern compiles")
});

/// Authentication messages recognised inside free-text payloads.
static AUTH_PATTERNS: Lazy<Vec<(Regex, Outcome)>> = Lazy::new(|| {
    [
        (
            r"Failed (?:password|publickey|keyboard-interactive\S*) for (?:invalid user )?(?P<user>\S+) from (?P<ip>[0-9A-Fa-f:.]+)",
            Outcome::Failure,
        ),
        (
            r"Accepted (?:password|publickey|keyboard-interactive\S*) for (?P<user>\S+) from (?P<ip>[0-9A-Fa-f:.]+)",
            Outcome::Success,
        ),
        (
            r"Invalid user (?P<user>\S+) from (?P<ip>[0-9A-Fa-f:.]+)",
            Outcome::Failure,
        ),
        (
            r"authentication failure;.*?rhost=(?P<ip>[0-9A-Fa-f:.]*)(?:\s+user=(?P<user>\S+))?",
            Outcome::Failure,
        ),
        (
            r"(?i)login (?:failed|failure) for (?:user )?(?P<user>\S+)(?: from (?P<ip>[0-9A-Fa-f:.]+))?",
            Outcome::Failure,
        ),
    ]
    .into_iter()
    .map(|(p, o)| (Regex::new(p).expect("auth pattern compiles"), o))
    .collect()
});

static KV_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?P<key>[A-Za-z_][\w.\-]*)=(?P<value>"[^"]*"|\S+)"#).expect("kv pattern compiles")
});

static IPV4_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("ipv4 pattern compiles")
});

const DELIMITERS: [char; 4] = [',', '\t', '|', ';'];

fn mismatch(format: LogFormat, reason: impl Into<String>) -> ParseError {
    ParseError::FormatMismatch {
        format,
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// JSON lines
// ---------------------------------------------------------------------------

fn json_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parse one JSON object. Nested objects are flattened one level with `_`
/// so `{"geo":{"country":"DE"}}` maps through `geo_country`.
pub fn parse_json(line: &str, field_map: &BTreeMap<String, Field>) -> Result<RawRecord, ParseError> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with('{') {
        return Err(mismatch(LogFormat::Json, "not a JSON object"));
    }
    let value: Value =
        serde_json::from_str(trimmed).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    let Value::Object(map) = value else {
        return Err(ParseError::InvalidJson("top-level value is not an object".into()));
    };

    let mut record = RawRecord::default();
    let mut message = None;
    let mut apply = |key: &str, value: &Value, record: &mut RawRecord| {
        let Some(text) = json_scalar(value) else {
            return;
        };
        match fields::resolve_field(key, field_map) {
            Some(field) => record.set(field, &text),
            None => {
                let norm = fields::normalize_key(key);
                if norm == "message" || norm == "msg" {
                    message = Some(text);
                }
            }
        }
    };

    for (key, value) in &map {
        match value {
            Value::Object(inner) => {
                for (sub, v) in inner {
                    apply(&format!("{}_{}", key, sub), v, &mut record);
                }
            }
            other => apply(key, other, &mut record),
        }
    }

    if let Some(msg) = message {
        apply_auth_message(&mut record, &msg);
    }
    Ok(record)
}

// ---------------------------------------------------------------------------
// Delimited (CSV / TSV)
// ---------------------------------------------------------------------------

/// Split on `delimiter`, honouring double quotes and `""` escapes.
fn split_quoted(line: &str, delimiter: char) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                cur.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            c if c == delimiter && !in_quotes => out.push(std::mem::take(&mut cur)),
            c => cur.push(c),
        }
    }
    out.push(cur);
    out
}

/// Recognise a header row: at least two mapped columns, one of which is a
/// timestamp, IP or status column.
pub fn parse_delimited_header(
    line: &str,
    field_map: &BTreeMap<String, Field>,
) -> Result<FieldMap, ParseError> {
    let mut best: Option<FieldMap> = None;
    for delimiter in DELIMITERS {
        let cells = split_quoted(line, delimiter);
        if cells.len() < 2 {
            continue;
        }
        let columns: Vec<Option<Field>> = cells
            .iter()
            .map(|c| fields::resolve_field(c, field_map))
            .collect();
        let mapped = columns.iter().flatten().count();
        let anchored = columns
            .iter()
            .flatten()
            .any(|f| matches!(f, Field::Timestamp | Field::Ip | Field::Status));
        if mapped < 2 || !anchored {
            continue;
        }
        let better = best
            .as_ref()
            .map(|b| mapped > b.columns.iter().flatten().count())
            .unwrap_or(true);
        if better {
            best = Some(FieldMap { delimiter, columns });
        }
    }
    best.ok_or(ParseError::MissingHeader)
}

pub fn parse_delimited_row(line: &str, header: &FieldMap) -> Result<RawRecord, ParseError> {
    let cells = split_quoted(line, header.delimiter);
    if cells.len() != header.len() {
        return Err(ParseError::FieldCount {
            expected: header.len(),
            found: cells.len(),
        });
    }
    let mut record = RawRecord::default();
    for (field, cell) in header.columns.iter().zip(&cells) {
        if let Some(field) = field {
            record.set(*field, cell);
        }
    }
    Ok(record)
}

// ---------------------------------------------------------------------------
// Common / combined log format
// ---------------------------------------------------------------------------

/// Parse an Apache/nginx common or combined line. An optional trailing
/// number is the request time: a decimal value is seconds, an integer is
/// milliseconds.
pub fn parse_common_log(line: &str) -> Result<RawRecord, ParseError> {
    let caps = CLF_RE
        .captures(line.trim())
        .ok_or_else(|| mismatch(LogFormat::CommonLog, "no CLF request structure"))?;

    let ts = &caps["ts"];
    let timestamp = DateTime::parse_from_str(ts, "%d/%b/%Y:%H:%M:%S %z")
        .map_err(|e| mismatch(LogFormat::CommonLog, format!("bad timestamp `{}`: {}", ts, e)))?
        .with_timezone(&Utc);

    let mut record = RawRecord {
        timestamp: Some(timestamp),
        ..RawRecord::default()
    };
    record.set(Field::Ip, &caps["host"]);
    record.set(Field::User, &caps["user"]);
    record.set(Field::Request, &caps["req"]);
    record.set(Field::Status, &caps["status"]);
    record.set(Field::Bytes, &caps["bytes"]);
    if let Some(ua) = caps.name("ua") {
        record.set(Field::UserAgent, ua.as_str());
    }
    if let Some(lat) = caps.name("latency") {
        let raw = lat.as_str();
        if let Ok(v) = raw.parse::<f64>() {
            record.latency_ms = Some(if raw.contains('.') { v * 1000.0 } else { v });
        }
    }
    Ok(record)
}

// ---------------------------------------------------------------------------
// Syslog
// ---------------------------------------------------------------------------

/// Parse RFC 5424 or RFC 3164 syslog. 3164 timestamps carry no year, so
/// `year` is supplied by the caller.
pub fn parse_syslog(line: &str, year: i32) -> Result<RawRecord, ParseError> {
    let line = line.trim();
    let (timestamp, app, msg) = if let Some(caps) = RFC5424_RE.captures(line) {
        let ts = match &caps["ts"] {
            "-" => None,
            s => Some(
                DateTime::parse_from_rfc3339(s)
                    .map_err(|e| mismatch(LogFormat::Syslog, format!("bad timestamp `{}`: {}", s, e)))?
                    .with_timezone(&Utc),
            ),
        };
        (ts, caps["app"].to_string(), caps["msg"].to_string())
    } else if let Some(caps) = RFC3164_RE.captures(line) {
        let collapsed = caps["ts"].split_whitespace().collect::<Vec<_>>().join(" ");
        let stamped = format!("{} {}", year, collapsed);
        let naive = NaiveDateTime::parse_from_str(&stamped, "%Y %b %d %H:%M:%S").map_err(|e| {
            mismatch(LogFormat::Syslog, format!("bad timestamp `{}`: {}", collapsed, e))
        })?;
        (
            Some(Utc.from_utc_datetime(&naive)),
            caps["app"].to_string(),
            caps["msg"].to_string(),
        )
    } else {
        return Err(mismatch(LogFormat::Syslog, "no syslog header"));
    };

    let mut record = RawRecord {
        timestamp,
        ..RawRecord::default()
    };
    if app != "-" {
        record.service = Some(app);
    }
    apply_key_values(&mut record, &msg);
    apply_auth_message(&mut record, &msg);
    if record.ip.is_none() {
        if let Some(m) = IPV4_RE.find(&msg) {
            record.set(Field::Ip, m.as_str());
        }
    }
    Ok(record)
}

fn apply_key_values(record: &mut RawRecord, msg: &str) {
    let empty = BTreeMap::new();
    for caps in KV_RE.captures_iter(msg) {
        if let Some(field) = fields::resolve_field(&caps["key"], &empty) {
            record.set(field, &caps["value"]);
        }
    }
}

/// Fill user, IP and outcome from a recognised authentication message.
/// Values already present on the record are kept.
pub fn apply_auth_message(record: &mut RawRecord, msg: &str) {
    for (re, outcome) in AUTH_PATTERNS.iter() {
        let Some(caps) = re.captures(msg) else {
            continue;
        };
        record.auth_hint = true;
        if record.status.is_none() && record.outcome.is_none() {
            record.outcome = Some(*outcome);
        }
        if record.user.is_none() {
            if let Some(user) = caps.name("user") {
                record.set(Field::User, user.as_str());
            }
        }
        if record.ip.is_none() {
            if let Some(ip) = caps.name("ip") {
                record.set(Field::Ip, ip.as_str());
            }
        }
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_log_with_request_time() {
        let r = parse_common_log(
            r#"198.51.100.7 - - [01/Feb/2024:08:00:00 +0100] "GET /api/items?page=2 HTTP/2.0" 200 1043 "https://ref" "Mozilla/5.0" 0.250"#,
        )
        .unwrap();
        assert_eq!(r.ip, Some("198.51.100.7".parse().unwrap()));
        assert_eq!(r.user, None);
        assert_eq!(r.method.as_deref(), Some("GET"));
        assert_eq!(r.path.as_deref(), Some("/api/items?page=2"));
        assert_eq!(r.status, Some(200));
        assert_eq!(r.bytes, Some(1043));
        assert_eq!(r.user_agent.as_deref(), Some("Mozilla/5.0"));
        assert_eq!(r.latency_ms, Some(250.0));
        assert_eq!(
            r.timestamp,
            Some(Utc.with_ymd_and_hms(2024, 2, 1, 7, 0, 0).unwrap())
        );
    }

    #[test]
    fn integer_request_time_is_milliseconds() {
        let r = parse_common_log(r#"10.0.0.1 - - [01/Feb/2024:08:00:00 +0000] "GET / HTTP/1.1" 200 - 87"#)
            .unwrap();
        assert_eq!(r.latency_ms, Some(87.0));
        assert_eq!(r.bytes, None);
    }

    #[test]
    fn json_line_is_not_clf() {
        let err = parse_common_log(r#"{"ip":"1.2.3.4"}"#).unwrap_err();
        assert!(matches!(err, ParseError::FormatMismatch { format: LogFormat::CommonLog, .. }));
    }

    #[test]
    fn json_nested_and_message() {
        let r = parse_json(
            r#"{"ts":"2024-03-01T10:00:00Z","geo":{"country":"de"},"message":"Failed password for root from 192.0.2.4 port 22 ssh2"}"#,
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(r.country.as_deref(), Some("DE"));
        assert_eq!(r.user.as_deref(), Some("root"));
        assert_eq!(r.ip, Some("192.0.2.4".parse().unwrap()));
        assert_eq!(r.outcome, Some(Outcome::Failure));
        assert!(r.auth_hint);
    }

    #[test]
    fn json_errors_are_typed() {
        assert!(matches!(
            parse_json("{not json", &BTreeMap::new()),
            Err(ParseError::InvalidJson(_))
        ));
        assert!(matches!(
            parse_json("plain text", &BTreeMap::new()),
            Err(ParseError::FormatMismatch { format: LogFormat::Json, .. })
        ));
    }

    #[test]
    fn delimited_header_picks_best_delimiter() {
        let header =
            parse_delimited_header("time\tuser\tsrc_ip\tstatus\tnote", &BTreeMap::new()).unwrap();
        assert_eq!(header.delimiter, '\t');
        assert_eq!(header.len(), 5);
        assert_eq!(header.columns[4], None);
        assert!(parse_delimited_header("alpha,beta,gamma", &BTreeMap::new()).is_err());
    }

    #[test]
    fn delimited_row_respects_quotes() {
        let header = parse_delimited_header("timestamp,user_agent,status", &BTreeMap::new()).unwrap();
        let r = parse_delimited_row(
            r#"2024-01-01 00:00:00,"Mozilla/5.0 (X11, Linux)",404"#,
            &header,
        )
        .unwrap();
        assert_eq!(r.user_agent.as_deref(), Some("Mozilla/5.0 (X11, Linux)"));
        assert_eq!(r.status, Some(404));
        assert_eq!(
            parse_delimited_row("a,b", &header).unwrap_err(),
            ParseError::FieldCount { expected: 3, found: 2 }
        );
    }

    #[test]
    fn rfc3164_sshd_failure() {
        let r = parse_syslog(
            "Mar  5 06:25:01 bastion sshd[4242]: Failed password for invalid user admin from 203.0.113.50 port 51234 ssh2",
            2024,
        )
        .unwrap();
        assert_eq!(r.service.as_deref(), Some("sshd"));
        assert_eq!(r.user.as_deref(), Some("admin"));
        assert_eq!(r.ip, Some("203.0.113.50".parse().unwrap()));
        assert_eq!(r.outcome, Some(Outcome::Failure));
        assert_eq!(
            r.timestamp,
            Some(Utc.with_ymd_and_hms(2024, 3, 5, 6, 25, 1).unwrap())
        );
    }

    #[test]
    fn rfc5424_with_key_values() {
        let r = parse_syslog(
            r#"<34>1 2024-05-01T12:00:00Z web01 api 311 - - request path=/orders status=503 latency_ms=812 client_ip=10.9.8.7"#,
            2024,
        )
        .unwrap();
        assert_eq!(r.service.as_deref(), Some("api"));
        assert_eq!(r.path.as_deref(), Some("/orders"));
        assert_eq!(r.status, Some(503));
        assert_eq!(r.latency_ms, Some(812.0));
        assert_eq!(r.ip, Some("10.9.8.7".parse().unwrap()));
        assert!(!r.auth_hint);
    }

    #[test]
    fn syslog_falls_back_to_bare_ipv4() {
        let r = parse_syslog("Jan 12 00:00:00 fw kernel: DROP IN=eth0 SRC 192.0.2.77", 2024).unwrap();
        assert_eq!(r.ip, Some("192.0.2.77".parse().unwrap()));
        assert!(parse_syslog("garbage line", 2024).is_err());
    }
}
