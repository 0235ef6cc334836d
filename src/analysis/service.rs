//! Per-service performance aggregates feeding the health scorer.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::analysis::percentile::LatencySummary;
use crate::normalize::{LogEvent, Outcome};

/// Service id used when an event has neither a service nor a path.
pub const UNKNOWN_SERVICE: &str = "unknown";

/// Service id of an event: the service field, else the endpoint path
/// without its query string.
pub fn service_id(event: &LogEvent) -> String {
    if let Some(s) = &event.service {
        return s.clone();
    }
    match &event.path {
        Some(p) => p.split('?').next().unwrap_or(p).to_string(),
        None => UNKNOWN_SERVICE.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStats {
    pub service: String,
    pub request_count: usize,
    /// Requests with a failure outcome (4xx, 5xx or textual failure).
    pub error_count: usize,
    pub server_error_count: usize,
    pub error_rate: f64,
    /// `1 - error_rate`.
    pub availability: f64,
    /// `None` when no event for the service carried a latency.
    pub latency: Option<LatencySummary>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Aggregate events by service id. Output is sorted by service id.
pub fn service_stats(events: &[LogEvent]) -> Vec<ServiceStats> {
    let mut groups: BTreeMap<String, Vec<&LogEvent>> = BTreeMap::new();
    for e in events {
        groups.entry(service_id(e)).or_default().push(e);
    }

    groups
        .into_iter()
        .map(|(service, members)| {
            let request_count = members.len();
            let error_count = members.iter().filter(|e| e.is_failure()).count();
            let server_error_count = members
                .iter()
                .filter(|e| e.outcome == Outcome::ServerError)
                .count();
            let latencies: Vec<f64> = members.iter().filter_map(|e| e.latency_ms).collect();
            let error_rate = error_count as f64 / request_count.max(1) as f64;
            ServiceStats {
                service,
                request_count,
                error_count,
                server_error_count,
                error_rate,
                availability: 1.0 - error_rate,
                latency: LatencySummary::from_values(&latencies),
                first_seen: members.iter().map(|e| e.timestamp).min().unwrap_or_default(),
                last_seen: members.iter().map(|e| e.timestamp).max().unwrap_or_default(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::aggregator::tests::event;

    #[test]
    fn groups_by_service_then_path() {
        let mut a = event(1, 0, "10.0.0.1", None);
        a.service = Some("checkout".into());
        a.latency_ms = Some(120.0);
        let mut b = event(2, 5, "10.0.0.2", None);
        b.service = Some("checkout".into());
        b.status = Some(503);
        b.outcome = Outcome::ServerError;
        b.latency_ms = Some(900.0);
        let mut c = event(3, 9, "10.0.0.3", None);
        c.path = Some("/search?q=x".into());
        let mut d = event(4, 9, "10.0.0.3", None);
        d.path = None;

        let stats = service_stats(&[a, b, c, d]);
        let names: Vec<_> = stats.iter().map(|s| s.service.as_str()).collect();
        assert_eq!(names, vec!["/search", "checkout", "unknown"]);

        let checkout = &stats[1];
        assert_eq!(checkout.request_count, 2);
        assert_eq!(checkout.server_error_count, 1);
        assert_eq!(checkout.error_rate, 0.5);
        assert_eq!(checkout.availability, 0.5);
        assert_eq!(checkout.latency.unwrap().p50, 510.0);
        assert!(stats[0].latency.is_none());
    }
}
