//! Per-service health against the configured SLA.

use serde::Serialize;
use tracing::info;

use crate::analysis::{LatencySummary, ServiceStats};
use crate::config::HealthConfig;

/// Red/amber/green status of a composite health score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Red,
    Amber,
    Green,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaMetric {
    P95Latency,
    P99Latency,
    ErrorRate,
    Availability,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlaBreach {
    pub metric: SlaMetric,
    pub actual: f64,
    pub target: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthFlag {
    /// No latency samples; the latency score defaults to 100.
    NoLatencyData,
    LowParseRate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthScore {
    pub service: String,
    pub score: f64,
    pub status: HealthStatus,
    pub error_score: f64,
    pub latency_score: f64,
    pub error_weight: f64,
    pub latency_weight: f64,
    pub error_rate: f64,
    pub availability: f64,
    pub requests: usize,
    pub latency: Option<LatencySummary>,
    /// p95 above `bottleneck_multiple` times the service's own median.
    pub bottleneck: bool,
    pub breaches: Vec<SlaBreach>,
    pub flags: Vec<HealthFlag>,
}

/// 100 at 0 % errors, 0 at `max_error_rate` and above.
pub fn error_score(error_rate: f64, max_error_rate: f64) -> f64 {
    (1.0 - error_rate.clamp(0.0, max_error_rate) / max_error_rate) * 100.0
}

/// 100 at or under the p95 target, `100 * target / p95` above it.
pub fn latency_score(p95: f64, target: f64) -> f64 {
    if p95 <= target {
        100.0
    } else {
        100.0 * target / p95
    }
}

pub fn status(score: f64, config: &HealthConfig) -> HealthStatus {
    if score >= config.green_threshold {
        HealthStatus::Green
    } else if score >= config.amber_threshold {
        HealthStatus::Amber
    } else {
        HealthStatus::Red
    }
}

pub fn is_bottleneck(latency: &LatencySummary, multiple: f64) -> bool {
    latency.p50 > 0.0 && latency.p95 > multiple * latency.p50
}

pub fn sla_breaches(stats: &ServiceStats, config: &HealthConfig) -> Vec<SlaBreach> {
    let mut out = Vec::new();
    if let Some(l) = &stats.latency {
        if l.p95 > config.sla_p95_ms {
            out.push(SlaBreach {
                metric: SlaMetric::P95Latency,
                actual: l.p95,
                target: config.sla_p95_ms,
            });
        }
        if l.p99 > config.sla_p99_ms {
            out.push(SlaBreach {
                metric: SlaMetric::P99Latency,
                actual: l.p99,
                target: config.sla_p99_ms,
            });
        }
    }
    if stats.error_rate > config.sla_error_rate {
        out.push(SlaBreach {
            metric: SlaMetric::ErrorRate,
            actual: stats.error_rate,
            target: config.sla_error_rate,
        });
    }
    if stats.availability < config.sla_availability {
        out.push(SlaBreach {
            metric: SlaMetric::Availability,
            actual: stats.availability,
            target: config.sla_availability,
        });
    }
    out
}

/// Health of one service. Pure in its inputs.
pub fn score_service(stats: &ServiceStats, low_parse_rate: bool, config: &HealthConfig) -> HealthScore {
    let mut flags = Vec::new();
    let err = error_score(stats.error_rate, config.max_error_rate);
    let lat = match &stats.latency {
        Some(l) => latency_score(l.p95, config.sla_p95_ms),
        None => {
            flags.push(HealthFlag::NoLatencyData);
            100.0
        }
    };
    if low_parse_rate {
        flags.push(HealthFlag::LowParseRate);
    }
    let bottleneck = stats
        .latency
        .as_ref()
        .map(|l| is_bottleneck(l, config.bottleneck_multiple))
        .unwrap_or(false);

    let weight_sum = config.error_weight + config.latency_weight;
    let mut score = (err * config.error_weight + lat * config.latency_weight) / weight_sum;
    if bottleneck {
        score -= config.bottleneck_penalty;
    }
    let score = score.clamp(0.0, 100.0);

    HealthScore {
        service: stats.service.clone(),
        score,
        status: status(score, config),
        error_score: err,
        latency_score: lat,
        error_weight: config.error_weight,
        latency_weight: config.latency_weight,
        error_rate: stats.error_rate,
        availability: stats.availability,
        requests: stats.request_count,
        latency: stats.latency,
        bottleneck,
        breaches: sla_breaches(stats, config),
        flags,
    }
}

/// Health of every service, worst first.
pub fn score_services(
    services: &[ServiceStats],
    parse_rate: f64,
    min_parse_rate: f64,
    config: &HealthConfig,
) -> Vec<HealthScore> {
    let low = parse_rate < min_parse_rate;
    let mut scores: Vec<HealthScore> = services
        .iter()
        .map(|s| score_service(s, low, config))
        .collect();
    scores.sort_by(|a, b| a.score.total_cmp(&b.score).then_with(|| a.service.cmp(&b.service)));
    info!(
        services = scores.len(),
        red = scores.iter().filter(|s| s.status == HealthStatus::Red).count(),
        overall = overall_health(&scores),
        "service health scored"
    );
    scores
}

/// Mean service score; 100 with no services.
pub fn overall_health(scores: &[HealthScore]) -> f64 {
    if scores.is_empty() {
        return 100.0;
    }
    scores.iter().map(|s| s.score).sum::<f64>() / scores.len() as f64
}
