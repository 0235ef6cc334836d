//! Field aliasing, value coercion and status classification shared by the
//! structured parsers.

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use super::{Field, Outcome};

/// Accepted spellings for each canonical field, after key normalization.
const ALIASES: &[(Field, &[&str])] = &[
    (
        Field::Timestamp,
        &[
            "timestamp", "time", "datetime", "date", "ts", "@timestamp", "login_time",
            "event_time", "created_at", "log_time",
        ],
    ),
    (
        Field::User,
        &["user_id", "user", "username", "user_name", "uid", "account", "login"],
    ),
    (
        Field::Ip,
        &[
            "ip_address", "ip", "src_ip", "source_ip", "client_ip", "remote_addr", "clientip",
            "rhost",
        ],
    ),
    (
        Field::Status,
        &["status", "status_code", "http_status", "response_code", "result", "outcome"],
    ),
    (
        Field::Method,
        &["method", "http_method", "request_method", "action", "operation"],
    ),
    (
        Field::Endpoint,
        &["endpoint", "path", "url", "uri", "request_path", "route", "resource"],
    ),
    (Field::Request, &["request", "request_line"]),
    (
        Field::Service,
        &["service", "service_name", "app", "application", "module", "component"],
    ),
    (
        Field::Latency,
        &[
            "latency_ms", "latency", "response_time", "duration", "elapsed_ms", "time_ms",
            "response_time_ms",
        ],
    ),
    (
        Field::Country,
        &["country", "geo_country", "country_code", "geo"],
    ),
    (Field::UserAgent, &["user_agent", "ua", "useragent", "http_user_agent"]),
    (Field::Session, &["session_id", "session", "sid", "request_id"]),
    (
        Field::Bytes,
        &["bytes_sent", "bytes", "response_size", "size", "content_length"],
    ),
];

/// Lower-case a key and fold spaces and hyphens to underscores.
pub fn normalize_key(key: &str) -> String {
    key.trim()
        .trim_matches('"')
        .to_ascii_lowercase()
        .replace([' ', '-'], "_")
}

/// Resolve a column name or JSON key to a canonical field. The explicit map
/// wins over the built-in alias table.
pub fn resolve_field(key: &str, explicit: &BTreeMap<String, Field>) -> Option<Field> {
    if let Some(field) = explicit.get(key) {
        return Some(*field);
    }
    let norm = normalize_key(key);
    if let Some((_, field)) = explicit.iter().find(|(k, _)| normalize_key(k) == norm) {
        return Some(*field);
    }
    ALIASES
        .iter()
        .find(|(_, aliases)| aliases.contains(&norm.as_str()))
        .map(|(field, _)| *field)
}

/// Column layout of a delimited file, fixed by its header row.
#[derive(Debug, Clone)]
pub struct FieldMap {
    pub delimiter: char,
    pub columns: Vec<Option<Field>>,
}

impl FieldMap {
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Intermediate record produced by a format parser before event building.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord {
    pub timestamp: Option<DateTime<Utc>>,
    pub ip: Option<IpAddr>,
    pub user: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    pub service: Option<String>,
    pub status: Option<u16>,
    pub outcome: Option<Outcome>,
    pub latency_ms: Option<f64>,
    pub bytes: Option<u64>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
    pub country: Option<String>,
    /// Set by parsers that recognise an authentication message.
    pub auth_hint: bool,
}

impl RawRecord {
    /// Assign a textual value to a canonical field, coercing its type.
    /// Placeholder values (`-`, empty, `null`) leave the field unset.
    pub fn set(&mut self, field: Field, value: &str) {
        let value = value.trim().trim_matches('"');
        if is_placeholder(value) {
            return;
        }
        match field {
            Field::Timestamp => self.timestamp = parse_timestamp(value),
            Field::User => self.user = Some(value.to_string()),
            Field::Ip => self.ip = parse_ip(value),
            Field::Status => match value.parse::<u16>() {
                Ok(code) => self.status = Some(code),
                Err(_) => self.outcome = Some(classify_status_text(value)),
            },
            Field::Method => self.method = Some(value.to_ascii_uppercase()),
            Field::Endpoint => self.path = Some(value.to_string()),
            Field::Request => {
                let mut parts = value.split_whitespace();
                if let (Some(method), Some(path)) = (parts.next(), parts.next()) {
                    self.method = Some(method.to_ascii_uppercase());
                    self.path = Some(path.to_string());
                }
            }
            Field::Service => self.service = Some(value.to_string()),
            Field::Latency => self.latency_ms = value.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0),
            Field::Country => self.country = Some(value.to_ascii_uppercase()),
            Field::UserAgent => self.user_agent = Some(value.to_string()),
            Field::Session => self.session_id = Some(value.to_string()),
            Field::Bytes => self.bytes = value.parse::<u64>().ok(),
        }
    }
}

fn is_placeholder(value: &str) -> bool {
    value.is_empty() || value == "-" || value.eq_ignore_ascii_case("null") || value.eq_ignore_ascii_case("none")
}

/// Parse an IP, tolerating a trailing `:port` on IPv4 and bracketed IPv6.
pub fn parse_ip(value: &str) -> Option<IpAddr> {
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(ip);
    }
    if let Some(rest) = value.strip_prefix('[') {
        return rest.split(']').next().and_then(|v| v.parse().ok());
    }
    value.rsplit_once(':').and_then(|(host, _)| host.parse().ok())
}

/// Parse the timestamp shapes seen in application logs. Naive timestamps are
/// taken as UTC; bare numbers are epoch seconds, or milliseconds when large.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(value, "%d/%b/%Y:%H:%M:%S %z") {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f %z") {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y/%m/%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(num) = value.parse::<f64>() {
        if !num.is_finite() || num < 0.0 {
            return None;
        }
        // Anything past year ~5138 in seconds is read as milliseconds.
        let millis = if num >= 1e11 { num } else { num * 1000.0 };
        return Utc.timestamp_millis_opt(millis as i64).single();
    }
    None
}

/// Classify a numeric HTTP-style status code.
pub fn classify_status_code(code: u16) -> Outcome {
    match code {
        200..=299 => Outcome::Success,
        300..=399 => Outcome::Redirect,
        400..=499 => Outcome::ClientError,
        500..=599 => Outcome::ServerError,
        _ => Outcome::Unknown,
    }
}

/// Classify a textual outcome such as `success` or `denied`.
pub fn classify_status_text(value: &str) -> Outcome {
    match value.to_ascii_lowercase().as_str() {
        "success" | "succeeded" | "ok" | "allowed" | "accepted" | "true" => Outcome::Success,
        "fail" | "failed" | "failure" | "error" | "denied" | "rejected" | "blocked"
        | "false" => Outcome::Failure,
        _ => Outcome::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_after_key_normalization() {
        let explicit = BTreeMap::new();
        assert_eq!(resolve_field("Source-IP", &explicit), Some(Field::Ip));
        assert_eq!(resolve_field("Response Time", &explicit), Some(Field::Latency));
        assert_eq!(resolve_field("mystery", &explicit), None);
    }

    #[test]
    fn explicit_map_overrides_alias() {
        let mut explicit = BTreeMap::new();
        explicit.insert("account".to_string(), Field::Session);
        assert_eq!(resolve_field("account", &explicit), Some(Field::Session));
    }

    #[test]
    fn timestamps_in_common_shapes() {
        let expected = Utc.with_ymd_and_hms(2024, 10, 10, 13, 55, 36).unwrap();
        assert_eq!(parse_timestamp("2024-10-10T13:55:36Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-10-10 13:55:36"), Some(expected));
        assert_eq!(parse_timestamp("10/Oct/2024:15:55:36 +0200"), Some(expected));
        assert_eq!(parse_timestamp("1728568536"), Some(expected));
        assert_eq!(parse_timestamp("1728568536000"), Some(expected));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status_code(204), Outcome::Success);
        assert_eq!(classify_status_code(302), Outcome::Redirect);
        assert!(classify_status_code(403).is_failure());
        assert!(classify_status_code(503).is_failure());
        assert_eq!(classify_status_text("Denied"), Outcome::Failure);
        assert_eq!(classify_status_text("OK"), Outcome::Success);
    }

    #[test]
    fn textual_status_sets_outcome() {
        let mut r = RawRecord::default();
        r.set(Field::Status, "failed");
        assert_eq!(r.status, None);
        assert_eq!(r.outcome, Some(Outcome::Failure));
    }

    #[test]
    fn ip_with_port() {
        assert_eq!(parse_ip("10.1.2.3:5555"), Some("10.1.2.3".parse().unwrap()));
        assert_eq!(parse_ip("[::1]:80"), Some("::1".parse().unwrap()));
        assert_eq!(parse_ip("host.example"), None);
    }
}
