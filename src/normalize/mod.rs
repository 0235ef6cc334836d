//! Event normalization: raw log lines into the canonical [`LogEvent`] model.
//!
//! Formats are a closed set of parser variants tried in priority order
//! (structured JSON, then delimited, then the free-text regex formats). In
//! auto mode the first format that matches is locked for the rest of the
//! input so a file never flaps between formats line by line. Lines that do
//! not match are counted and skipped; they never abort the batch.

pub mod fields;
pub mod formats;
pub mod geo;

use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::NormalizerConfig;
use fields::{FieldMap, RawRecord};
pub use geo::{GeoLocation, GeoResolver, GeoSource, StaticGeoResolver};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseError {
    #[error("line did not match any known log format")]
    NoMatchingFormat,
    #[error("line does not match the {format} format: {reason}")]
    FormatMismatch { format: LogFormat, reason: String },
    #[error("malformed JSON record: {0}")]
    InvalidJson(String),
    #[error("delimited row has {found} fields, header declares {expected}")]
    FieldCount { expected: usize, found: usize },
    #[error("delimited input has no recognizable header row")]
    MissingHeader,
}

/// Supported input formats, in auto-detection priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Delimited,
    CommonLog,
    Syslog,
}

impl LogFormat {
    pub const PRIORITY: [LogFormat; 4] = [
        LogFormat::Json,
        LogFormat::Delimited,
        LogFormat::CommonLog,
        LogFormat::Syslog,
    ];
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Json => write!(f, "json"),
            LogFormat::Delimited => write!(f, "delimited"),
            LogFormat::CommonLog => write!(f, "clf"),
            LogFormat::Syslog => write!(f, "syslog"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" | "jsonl" | "ndjson" => Ok(LogFormat::Json),
            "delimited" | "csv" => Ok(LogFormat::Delimited),
            "clf" | "common" | "combined" | "commonlog" => Ok(LogFormat::CommonLog),
            "syslog" => Ok(LogFormat::Syslog),
            other => Err(format!("unknown log format `{}`", other)),
        }
    }
}

/// Declared format, or auto-detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatHint {
    #[default]
    Auto,
    Declared(LogFormat),
}

/// Canonical field names that column headers and JSON keys map onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Timestamp,
    User,
    Ip,
    Status,
    Method,
    Endpoint,
    Request,
    Service,
    Latency,
    Country,
    UserAgent,
    Session,
    Bytes,
}

/// Classified result of a request or action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Redirect,
    ClientError,
    ServerError,
    Failure,
    Unknown,
}

impl Outcome {
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Outcome::ClientError | Outcome::ServerError | Outcome::Failure
        )
    }
}

/// Where an event came from in the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRef {
    /// 1-based line number in the input batch.
    pub line: usize,
    pub format: LogFormat,
}

/// Canonical normalized log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Stable id: the 1-based input line number.
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    /// True when the timestamp was synthesized from ingestion order.
    pub timestamp_synthesized: bool,
    pub source_ip: Option<IpAddr>,
    pub user: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    pub service: Option<String>,
    pub status: Option<u16>,
    pub outcome: Outcome,
    pub auth_attempt: bool,
    pub latency_ms: Option<f64>,
    pub bytes: Option<u64>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,
    pub geo: Option<GeoLocation>,
    pub raw: RawRef,
}

impl LogEvent {
    pub fn is_failure(&self) -> bool {
        self.outcome.is_failure()
    }

    pub fn is_failed_auth(&self) -> bool {
        self.auth_attempt && self.outcome.is_failure()
    }

    pub fn country(&self) -> Option<&str> {
        self.geo.as_ref().map(|g| g.country.as_str())
    }
}

/// A sampled parse failure, kept for the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseFailure {
    pub line: usize,
    pub reason: String,
}

/// Running parse-success metric surfaced to callers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseStats {
    pub total_lines: usize,
    /// Blank lines and delimited header rows.
    pub skipped: usize,
    pub parsed: usize,
    pub failed: usize,
    pub synthesized_timestamps: usize,
    pub format: Option<LogFormat>,
    pub failures: Vec<ParseFailure>,
}

impl ParseStats {
    /// Fraction of candidate lines that produced an event. Vacuously 1.0.
    pub fn success_rate(&self) -> f64 {
        let attempted = self.parsed + self.failed;
        if attempted == 0 {
            return 1.0;
        }
        self.parsed as f64 / attempted as f64
    }
}

/// Output of normalizing a full batch.
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub events: Vec<LogEvent>,
    pub stats: ParseStats,
}

/// Stateful line normalizer for one input file.
pub struct Normalizer<'a> {
    config: &'a NormalizerConfig,
    resolver: Option<&'a dyn GeoResolver>,
    locked: Option<LogFormat>,
    header: Option<FieldMap>,
    syslog_year: i32,
    last_timestamp: Option<DateTime<Utc>>,
    lines_since_timestamp: i64,
    stats: ParseStats,
}

impl<'a> Normalizer<'a> {
    pub fn new(config: &'a NormalizerConfig, hint: FormatHint) -> Self {
        let syslog_year = config
            .syslog_year
            .unwrap_or_else(|| chrono::Datelike::year(&Utc::now()));
        let locked = match hint {
            FormatHint::Declared(format) => Some(format),
            FormatHint::Auto => None,
        };
        Self {
            config,
            resolver: None,
            locked,
            header: None,
            syslog_year,
            last_timestamp: None,
            lines_since_timestamp: 0,
            stats: ParseStats {
                format: locked,
                ..ParseStats::default()
            },
        }
    }

    /// Attach an IP-to-location resolver.
    pub fn with_resolver(mut self, resolver: &'a dyn GeoResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn stats(&self) -> &ParseStats {
        &self.stats
    }

    pub fn into_stats(self) -> ParseStats {
        self.stats
    }

    /// Format in effect, once declared or detected.
    pub fn format(&self) -> Option<LogFormat> {
        self.locked
    }

    /// Normalize one line. `Ok(None)` for blank lines and header rows.
    pub fn normalize_line(
        &mut self,
        line_no: usize,
        line: &str,
    ) -> Result<Option<LogEvent>, ParseError> {
        self.stats.total_lines += 1;
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            self.stats.skipped += 1;
            return Ok(None);
        }

        let result = match self.locked {
            Some(format) => self.parse_with(format, line),
            None => self.detect(line),
        };

        match result {
            Ok(Some(record)) => {
                let format = self.locked.unwrap_or(LogFormat::Json);
                let event = self.build_event(line_no, format, record);
                self.stats.parsed += 1;
                Ok(Some(event))
            }
            Ok(None) => {
                self.stats.skipped += 1;
                Ok(None)
            }
            Err(e) => {
                self.stats.failed += 1;
                if self.stats.failures.len() < self.config.max_failure_samples {
                    self.stats.failures.push(ParseFailure {
                        line: line_no,
                        reason: e.to_string(),
                    });
                }
                // Failed lines still advance ingestion order for timestamp synthesis.
                self.lines_since_timestamp += 1;
                Err(e)
            }
        }
    }

    fn detect(&mut self, line: &str) -> Result<Option<RawRecord>, ParseError> {
        for format in LogFormat::PRIORITY {
            if let Ok(parsed) = self.parse_with(format, line) {
                info!(%format, "log format detected");
                self.locked = Some(format);
                self.stats.format = Some(format);
                return Ok(parsed);
            }
        }
        Err(ParseError::NoMatchingFormat)
    }

    fn parse_with(&mut self, format: LogFormat, line: &str) -> Result<Option<RawRecord>, ParseError> {
        match format {
            LogFormat::Json => formats::parse_json(line, &self.config.field_map).map(Some),
            LogFormat::Delimited => match &self.header {
                Some(header) => formats::parse_delimited_row(line, header).map(Some),
                None => {
                    let header = formats::parse_delimited_header(line, &self.config.field_map)?;
                    debug!(columns = header.len(), "delimited header recognized");
                    self.header = Some(header);
                    Ok(None)
                }
            },
            LogFormat::CommonLog => formats::parse_common_log(line).map(Some),
            LogFormat::Syslog => formats::parse_syslog(line, self.syslog_year).map(Some),
        }
    }

    fn build_event(&mut self, line_no: usize, format: LogFormat, record: RawRecord) -> LogEvent {
        let (timestamp, synthesized) = match record.timestamp {
            Some(ts) => {
                self.last_timestamp = Some(ts);
                self.lines_since_timestamp = 0;
                (ts, false)
            }
            None => {
                self.lines_since_timestamp += 1;
                // Epoch when nothing before this line carried a timestamp.
                let base = self.last_timestamp.unwrap_or_default();
                self.stats.synthesized_timestamps += 1;
                (base + Duration::milliseconds(self.lines_since_timestamp), true)
            }
        };

        let outcome = match record.status {
            Some(code) => fields::classify_status_code(code),
            None => record.outcome.unwrap_or(Outcome::Unknown),
        };

        let auth_attempt = record.auth_hint
            || record.status == Some(401)
            || record
                .path
                .as_deref()
                .map(|p| self.is_auth_path(p))
                .unwrap_or(false);

        let geo = match (&record.country, record.ip) {
            (Some(country), _) => Some(GeoLocation {
                country: country.clone(),
                city: None,
                source: GeoSource::Record,
            }),
            (None, Some(ip)) => self.resolver.and_then(|r| r.resolve(ip)),
            (None, None) => None,
        };

        LogEvent {
            id: line_no as u64,
            timestamp,
            timestamp_synthesized: synthesized,
            source_ip: record.ip,
            user: record.user,
            method: record.method,
            path: record.path,
            service: record.service,
            status: record.status,
            outcome,
            auth_attempt,
            latency_ms: record.latency_ms,
            bytes: record.bytes,
            user_agent: record.user_agent,
            session_id: record.session_id,
            geo,
            raw: RawRef {
                line: line_no,
                format,
            },
        }
    }

    fn is_auth_path(&self, path: &str) -> bool {
        let path = path.split('?').next().unwrap_or(path).trim_end_matches('/');
        self.config
            .auth_paths
            .iter()
            .any(|p| p.trim_end_matches('/').eq_ignore_ascii_case(path))
    }
}

/// Normalize a whole batch of lines, skipping and counting failures.
pub fn normalize_batch<'l, I>(
    lines: I,
    hint: FormatHint,
    config: &NormalizerConfig,
    resolver: Option<&dyn GeoResolver>,
) -> NormalizedBatch
where
    I: IntoIterator<Item = &'l str>,
{
    let mut normalizer = Normalizer::new(config, hint);
    if let Some(r) = resolver {
        normalizer = normalizer.with_resolver(r);
    }

    let mut events = Vec::new();
    for (idx, line) in lines.into_iter().enumerate() {
        match normalizer.normalize_line(idx + 1, line) {
            Ok(Some(event)) => events.push(event),
            Ok(None) => {}
            Err(e) => debug!(line = idx + 1, error = %e, "skipping unparseable line"),
        }
    }

    let stats = normalizer.into_stats();
    if stats.failed > 0 {
        warn!(
            failed = stats.failed,
            parsed = stats.parsed,
            success_rate = stats.success_rate(),
            "some lines could not be parsed"
        );
    }
    info!(
        parsed = stats.parsed,
        format = ?stats.format,
        synthesized = stats.synthesized_timestamps,
        "normalization complete"
    );
    NormalizedBatch { events, stats }
}
