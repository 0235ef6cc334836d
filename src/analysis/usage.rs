//! Usage analytics: sessions, endpoint and service popularity, and the
//! weekday by hour activity heatmap.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::Serialize;
use tracing::debug;

use crate::analysis::percentile::mean;
use crate::analysis::service::service_id;
use crate::config::AnalyticsConfig;
use crate::normalize::LogEvent;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub session: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_secs: f64,
    pub requests: usize,
    pub distinct_services: usize,
    pub failures: usize,
    pub mean_latency_ms: Option<f64>,
    /// The session's last request failed.
    pub ended_in_error: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSummary {
    pub total_sessions: usize,
    pub avg_duration_secs: f64,
    pub avg_requests_per_session: f64,
    pub sessions_with_errors_pct: f64,
    /// Share of sessions whose last request failed.
    pub drop_off_rate_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointUsage {
    pub endpoint: String,
    pub requests: usize,
    pub mean_latency_ms: Option<f64>,
    pub error_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceUsage {
    pub service: String,
    pub requests: usize,
    pub unique_users: usize,
    pub mean_latency_ms: Option<f64>,
    pub errors: usize,
    pub error_rate: f64,
}

/// Request counts by UTC weekday (Monday first) and hour of day.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActivityHeatmap {
    pub counts: [[usize; 24]; 7],
}

impl ActivityHeatmap {
    pub fn from_events(events: &[LogEvent]) -> Self {
        let mut heatmap = Self::default();
        for e in events {
            let day = e.timestamp.weekday().num_days_from_monday() as usize;
            let hour = e.timestamp.hour() as usize;
            heatmap.counts[day][hour] += 1;
        }
        heatmap
    }

    /// Busiest (weekday, hour) cell; earliest wins ties. `None` when empty.
    pub fn peak(&self) -> Option<(usize, usize)> {
        let mut best: Option<((usize, usize), usize)> = None;
        for (day, hours) in self.counts.iter().enumerate() {
            for (hour, &count) in hours.iter().enumerate() {
                if count > 0 && best.map_or(true, |(_, c)| count > c) {
                    best = Some(((day, hour), count));
                }
            }
        }
        best.map(|(cell, _)| cell)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageReport {
    pub session_summary: SessionSummary,
    pub sessions: Vec<SessionStats>,
    pub top_endpoints: Vec<EndpointUsage>,
    pub services: Vec<ServiceUsage>,
    pub heatmap: ActivityHeatmap,
    pub peak: Option<(usize, usize)>,
}

/// Rebuild sessions from events carrying a session id. Sorted by session id.
pub fn sessions(events: &[LogEvent]) -> Vec<SessionStats> {
    let mut groups: BTreeMap<&str, Vec<&LogEvent>> = BTreeMap::new();
    for e in events {
        if let Some(s) = &e.session_id {
            groups.entry(s.as_str()).or_default().push(e);
        }
    }

    groups
        .into_iter()
        .filter_map(|(session, mut members)| {
            members.sort_by_key(|e| (e.timestamp, e.id));
            let first = members.first()?;
            let last = members.last()?;
            let latencies: Vec<f64> = members.iter().filter_map(|e| e.latency_ms).collect();
            let services: BTreeSet<String> = members.iter().map(|e| service_id(e)).collect();
            Some(SessionStats {
                session: session.to_string(),
                start: first.timestamp,
                end: last.timestamp,
                duration_secs: (last.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0,
                requests: members.len(),
                distinct_services: services.len(),
                failures: members.iter().filter(|e| e.is_failure()).count(),
                mean_latency_ms: mean(&latencies),
                ended_in_error: last.is_failure(),
            })
        })
        .collect()
}

pub fn summarize_sessions(sessions: &[SessionStats]) -> SessionSummary {
    if sessions.is_empty() {
        return SessionSummary::default();
    }
    let n = sessions.len() as f64;
    let pct = |count: usize| count as f64 / n * 100.0;
    SessionSummary {
        total_sessions: sessions.len(),
        avg_duration_secs: sessions.iter().map(|s| s.duration_secs).sum::<f64>() / n,
        avg_requests_per_session: sessions.iter().map(|s| s.requests as f64).sum::<f64>() / n,
        sessions_with_errors_pct: pct(sessions.iter().filter(|s| s.failures > 0).count()),
        drop_off_rate_pct: pct(sessions.iter().filter(|s| s.ended_in_error).count()),
    }
}

/// The `n` most requested endpoints (path without query), busiest first.
pub fn top_endpoints(events: &[LogEvent], n: usize) -> Vec<EndpointUsage> {
    let mut groups: BTreeMap<&str, (usize, usize, Vec<f64>)> = BTreeMap::new();
    for e in events {
        let Some(path) = &e.path else {
            continue;
        };
        let slot = groups.entry(path.split('?').next().unwrap_or(path)).or_default();
        slot.0 += 1;
        if e.is_failure() {
            slot.1 += 1;
        }
        if let Some(l) = e.latency_ms {
            slot.2.push(l);
        }
    }

    let mut ranked: Vec<EndpointUsage> = groups
        .into_iter()
        .map(|(endpoint, (requests, errors, latencies))| EndpointUsage {
            endpoint: endpoint.to_string(),
            requests,
            mean_latency_ms: mean(&latencies),
            error_rate: errors as f64 / requests as f64,
        })
        .collect();
    // Stable sort keeps endpoint order among equal counts.
    ranked.sort_by_key(|u| Reverse(u.requests));
    ranked.truncate(n);
    ranked
}

/// Usage per service id, busiest first.
pub fn service_usage(events: &[LogEvent]) -> Vec<ServiceUsage> {
    let mut groups: BTreeMap<String, Vec<&LogEvent>> = BTreeMap::new();
    for e in events {
        groups.entry(service_id(e)).or_default().push(e);
    }

    let mut usage: Vec<ServiceUsage> = groups
        .into_iter()
        .map(|(service, members)| {
            let users: BTreeSet<&str> = members.iter().filter_map(|e| e.user.as_deref()).collect();
            let latencies: Vec<f64> = members.iter().filter_map(|e| e.latency_ms).collect();
            let errors = members.iter().filter(|e| e.is_failure()).count();
            ServiceUsage {
                service,
                requests: members.len(),
                unique_users: users.len(),
                mean_latency_ms: mean(&latencies),
                errors,
                error_rate: errors as f64 / members.len() as f64,
            }
        })
        .collect();
    usage.sort_by_key(|u| Reverse(u.requests));
    usage
}

pub fn usage_report(events: &[LogEvent], config: &AnalyticsConfig) -> UsageReport {
    let sessions = sessions(events);
    let heatmap = ActivityHeatmap::from_events(events);
    let report = UsageReport {
        session_summary: summarize_sessions(&sessions),
        sessions,
        top_endpoints: top_endpoints(events, config.top_endpoints),
        services: service_usage(events),
        peak: heatmap.peak(),
        heatmap,
    };
    debug!(
        sessions = report.session_summary.total_sessions,
        endpoints = report.top_endpoints.len(),
        "usage analytics computed"
    );
    report
}
