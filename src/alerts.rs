//! Alert generation from the outputs of every analysis stage.
//!
//! Alerts are derived, never stored: ids are name-based UUIDs of the alert's
//! source and subject, so a rerun on the same batch yields the same ids.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::analysis::series::{Spike, SpikeMetric};
use crate::analysis::EntityKind;
use crate::detect::{Severity, ThreatFinding, ID_NAMESPACE};
use crate::score::{HealthScore, RiskProfile, SlaMetric};

/// How many entity ids a grouped alert lists.
const MAX_SUBJECTS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    Security,
    Performance,
    Anomaly,
    Risk,
}

impl fmt::Display for AlertCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertCategory::Security => "security",
            AlertCategory::Performance => "performance",
            AlertCategory::Anomaly => "anomaly",
            AlertCategory::Risk => "risk",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub severity: Severity,
    pub category: AlertCategory,
    pub title: String,
    pub description: String,
    /// Stage that produced the underlying signal.
    pub source: &'static str,
    pub timestamp: Option<DateTime<Utc>>,
    /// Entities or services the alert is about.
    pub subjects: Vec<String>,
}

impl Alert {
    fn new(
        source: &'static str,
        key: &str,
        severity: Severity,
        category: AlertCategory,
        title: String,
        description: String,
    ) -> Self {
        Self {
            id: Uuid::new_v5(&ID_NAMESPACE, format!("alert|{}|{}", source, key).as_bytes()),
            severity,
            category,
            title,
            description,
            source,
            timestamp: None,
            subjects: Vec::new(),
        }
    }

    fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    fn about(mut self, subjects: Vec<String>) -> Self {
        self.subjects = subjects;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlertSummary {
    pub total: usize,
    pub by_severity: BTreeMap<Severity, usize>,
    pub by_category: BTreeMap<AlertCategory, usize>,
}

impl AlertSummary {
    pub fn of(alerts: &[Alert]) -> Self {
        let mut summary = Self {
            total: alerts.len(),
            ..Self::default()
        };
        for a in alerts {
            *summary.by_severity.entry(a.severity).or_default() += 1;
            *summary.by_category.entry(a.category).or_default() += 1;
        }
        summary
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.by_severity.get(&severity).copied().unwrap_or(0)
    }
}

fn finding_alert(f: &ThreatFinding) -> Alert {
    let mut subjects = vec![f.entity.clone()];
    subjects.extend(f.related_entities.iter().take(MAX_SUBJECTS).cloned());
    Alert::new(
        "threat_detector",
        &f.id.to_string(),
        f.severity,
        AlertCategory::Security,
        format!("{} from {} {}", f.mitre.technique_name, f.entity_kind, f.entity),
        format!("{} ({} {})", f.summary, f.mitre.technique_id, f.mitre.tactic.name()),
    )
    .at(f.first_seen)
    .about(subjects)
}

fn sla_alert(h: &HealthScore) -> Option<Alert> {
    if h.breaches.is_empty() {
        return None;
    }
    let reliability = h
        .breaches
        .iter()
        .any(|b| matches!(b.metric, SlaMetric::ErrorRate | SlaMetric::Availability));
    let severity = match (reliability, h.breaches.len()) {
        (true, n) if n >= 3 => Severity::Critical,
        (true, _) => Severity::High,
        (false, _) => Severity::Medium,
    };
    let details: Vec<String> = h
        .breaches
        .iter()
        .map(|b| format!("{:?} {:.3} vs target {:.3}", b.metric, b.actual, b.target))
        .collect();
    Some(
        Alert::new(
            "sla_monitor",
            &h.service,
            severity,
            AlertCategory::Performance,
            format!("SLA breach: {}", h.service),
            details.join("; "),
        )
        .about(vec![h.service.clone()]),
    )
}

fn bottleneck_alert(h: &HealthScore) -> Option<Alert> {
    if !h.bottleneck {
        return None;
    }
    let latency = h.latency.as_ref()?;
    Some(
        Alert::new(
            "bottleneck_detector",
            &h.service,
            Severity::Medium,
            AlertCategory::Performance,
            format!("Bottleneck: {}", h.service),
            format!(
                "p95 latency {:.0} ms is {:.1}x the median of {:.0} ms",
                latency.p95,
                latency.p95 / latency.p50,
                latency.p50
            ),
        )
        .about(vec![h.service.clone()]),
    )
}

fn spike_alerts(spikes: &[Spike]) -> Vec<Alert> {
    let mut by_metric: BTreeMap<&'static str, Vec<&Spike>> = BTreeMap::new();
    for s in spikes {
        let name = match s.metric {
            SpikeMetric::Requests => "request volume",
            SpikeMetric::ErrorRate => "error rate",
            SpikeMetric::Latency => "latency",
        };
        by_metric.entry(name).or_default().push(s);
    }
    by_metric
        .into_iter()
        .map(|(name, group)| {
            let severity = if group.iter().any(|s| s.critical) {
                Severity::Critical
            } else {
                Severity::Medium
            };
            let first = group.iter().map(|s| s.start).min();
            let alert = Alert::new(
                "anomaly_engine",
                name,
                severity,
                AlertCategory::Anomaly,
                format!("Abnormal {}", name),
                format!(
                    "{} time bucket(s) with unusual {}, peak |z| {:.2}",
                    group.len(),
                    name,
                    group.iter().map(|s| s.z_score.abs()).fold(0.0, f64::max)
                ),
            );
            match first {
                Some(t) => alert.at(t),
                None => alert,
            }
        })
        .collect()
}

fn risk_alerts(profiles: &[RiskProfile]) -> Vec<Alert> {
    EntityKind::ALL
        .iter()
        .filter_map(|kind| {
            let critical: Vec<&RiskProfile> = profiles
                .iter()
                .filter(|p| p.kind == *kind && p.tier == Severity::Critical)
                .collect();
            if critical.is_empty() {
                return None;
            }
            let label = match kind {
                EntityKind::Ip => "IP address(es)",
                EntityKind::User => "user(s)",
            };
            Some(
                Alert::new(
                    "risk_scorer",
                    &kind.to_string(),
                    Severity::Critical,
                    AlertCategory::Risk,
                    format!("Critical-risk {} identified", label),
                    format!("{} {} with a composite risk score of 75 or more", critical.len(), label),
                )
                .about(
                    critical
                        .iter()
                        .take(MAX_SUBJECTS)
                        .map(|p| p.entity.clone())
                        .collect(),
                ),
            )
        })
        .collect()
}

/// Build every alert, most severe first.
pub fn generate(
    findings: &[ThreatFinding],
    health: &[HealthScore],
    spikes: &[Spike],
    risk: &[RiskProfile],
) -> Vec<Alert> {
    let mut alerts: Vec<Alert> = findings.iter().map(finding_alert).collect();
    alerts.extend(health.iter().filter_map(sla_alert));
    alerts.extend(health.iter().filter_map(bottleneck_alert));
    alerts.extend(spike_alerts(spikes));
    alerts.extend(risk_alerts(risk));

    alerts.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then(a.category.cmp(&b.category))
            .then(a.timestamp.cmp(&b.timestamp))
            .then(a.id.cmp(&b.id))
    });
    let summary = AlertSummary::of(&alerts);
    info!(
        total = summary.total,
        critical = summary.count(Severity::Critical),
        high = summary.count(Severity::High),
        "alerts generated"
    );
    alerts
}
