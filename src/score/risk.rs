//! Composite per-entity risk.
//!
//! Every factor is normalized to 0..=100 and non-decreasing in its input, and
//! weights are non-negative, so the composite is monotonic in each factor.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info};

use crate::analysis::{percentile, EntityKind, EntityWindow, WindowId};
use crate::config::{RiskConfig, RiskWeights};
use crate::detect::{Severity, ThreatFinding};
use crate::ml::{Archetype, BehaviorReport};

/// Degraded-input markers carried on a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFlag {
    /// The ML stage failed; the anomaly factor is zero.
    AnomalyUnavailable,
    /// The batch parse success rate is below the configured floor.
    LowParseRate,
}

/// One weighted factor of a composite score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskFactor {
    pub name: &'static str,
    /// Normalized factor score, 0..=100.
    pub value: f64,
    pub weight: f64,
    pub contribution: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskProfile {
    pub kind: EntityKind,
    pub entity: String,
    pub score: f64,
    pub tier: Severity,
    pub factors: Vec<RiskFactor>,
    /// The weight set this score was computed with.
    pub weights: RiskWeights,
    pub findings: usize,
    pub last_window: Option<WindowId>,
    pub flags: Vec<RiskFlag>,
}

/// Raw factor scores before weighting, each 0..=100.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FactorScores {
    pub threat: f64,
    pub anomaly: f64,
    pub auth_failure: f64,
    pub geo: f64,
    pub archetype: f64,
    pub volume: f64,
}

impl FactorScores {
    fn as_pairs(&self) -> [(&'static str, f64); 6] {
        [
            ("threat", self.threat),
            ("anomaly", self.anomaly),
            ("auth_failure", self.auth_failure),
            ("geo", self.geo),
            ("archetype", self.archetype),
            ("volume", self.volume),
        ]
    }
}

pub fn severity_points(severity: Severity) -> f64 {
    match severity {
        Severity::Low => 10.0,
        Severity::Medium => 25.0,
        Severity::High => 50.0,
        Severity::Critical => 100.0,
    }
}

/// Severity points summed over findings, capped at 100.
pub fn threat_factor<'f>(findings: impl IntoIterator<Item = &'f ThreatFinding>) -> f64 {
    findings
        .into_iter()
        .map(|f| severity_points(f.severity))
        .sum::<f64>()
        .min(100.0)
}

/// Isolation score mapped linearly: 0.5 and below is 0, 1.0 is 100.
pub fn anomaly_factor(max_score: f64) -> f64 {
    ((max_score - 0.5) * 200.0).clamp(0.0, 100.0)
}

pub fn geo_factor(countries: usize) -> f64 {
    match countries {
        0 | 1 => 0.0,
        2 => 30.0,
        3 | 4 => 60.0,
        _ => 100.0,
    }
}

pub fn archetype_factor(archetype: Option<Archetype>) -> f64 {
    match archetype {
        Some(Archetype::Suspicious) => 80.0,
        Some(Archetype::Scraper) => 60.0,
        Some(Archetype::PowerUser) => 20.0,
        _ => 0.0,
    }
}

/// Batch-wide request volume percentiles for one entity kind.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VolumeBaseline {
    pub p95: f64,
    pub p99: f64,
}

impl VolumeBaseline {
    pub fn from_totals(totals: &[f64]) -> Self {
        Self {
            p95: percentile(totals, 95.0).unwrap_or(0.0),
            p99: percentile(totals, 99.0).unwrap_or(0.0),
        }
    }

    pub fn factor(&self, total: f64) -> f64 {
        if total > self.p99 {
            70.0
        } else if total > self.p95 {
            40.0
        } else {
            0.0
        }
    }
}

/// Weighted sum of the factors, clamped to 0..=100.
pub fn composite(factors: &FactorScores, weights: &RiskWeights) -> (f64, Vec<RiskFactor>) {
    let parts: Vec<RiskFactor> = factors
        .as_pairs()
        .into_iter()
        .zip(weights.as_pairs())
        .map(|((name, value), (_, weight))| RiskFactor {
            name,
            value,
            weight,
            contribution: value * weight,
        })
        .collect();
    let score = parts.iter().map(|p| p.contribution).sum::<f64>().clamp(0.0, 100.0);
    (score, parts)
}

pub fn tier(score: f64) -> Severity {
    if score >= 75.0 {
        Severity::Critical
    } else if score >= 50.0 {
        Severity::High
    } else if score >= 25.0 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Score every entity that has at least one window. `behavior` is `None` when
/// the ML stage failed. Sorted by score, highest first.
pub fn score_entities(
    windows: &[EntityWindow],
    findings: &[ThreatFinding],
    behavior: Option<&BehaviorReport>,
    parse_rate: f64,
    config: &RiskConfig,
) -> Vec<RiskProfile> {
    let mut grouped: BTreeMap<(EntityKind, &str), Vec<&EntityWindow>> = BTreeMap::new();
    for w in windows {
        grouped.entry((w.kind(), w.entity())).or_default().push(w);
    }

    let mut baselines: BTreeMap<EntityKind, VolumeBaseline> = BTreeMap::new();
    for kind in EntityKind::ALL {
        let totals: Vec<f64> = grouped
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, ws)| ws.iter().map(|w| w.features.request_count).sum())
            .collect();
        baselines.insert(kind, VolumeBaseline::from_totals(&totals));
    }

    let mut flags = Vec::new();
    if behavior.is_none() {
        flags.push(RiskFlag::AnomalyUnavailable);
    }
    if parse_rate < config.min_parse_rate {
        flags.push(RiskFlag::LowParseRate);
    }

    let mut profiles: Vec<RiskProfile> = grouped
        .into_iter()
        .map(|((kind, entity), ws)| {
            let mine: Vec<&ThreatFinding> = findings
                .iter()
                .filter(|f| f.entity_kind == kind && f.entity == entity)
                .collect();
            let (attempts, failed) = ws.iter().fold((0.0, 0.0), |(a, f), w| {
                (a + w.features.auth_attempts, f + w.features.failed_auth)
            });
            let countries: std::collections::BTreeSet<&String> =
                ws.iter().flat_map(|w| w.countries.iter()).collect();
            let total: f64 = ws.iter().map(|w| w.features.request_count).sum();

            let factors = FactorScores {
                threat: threat_factor(mine.iter().copied()),
                anomaly: behavior
                    .and_then(|b| b.max_score(kind, entity))
                    .map(anomaly_factor)
                    .unwrap_or(0.0),
                auth_failure: if attempts > 0.0 { failed / attempts * 100.0 } else { 0.0 },
                geo: geo_factor(countries.len()),
                archetype: archetype_factor(behavior.and_then(|b| b.archetype_of(kind, entity))),
                volume: baselines.get(&kind).map(|b| b.factor(total)).unwrap_or(0.0),
            };
            let (score, parts) = composite(&factors, &config.weights);
            RiskProfile {
                kind,
                entity: entity.to_string(),
                score,
                tier: tier(score),
                factors: parts,
                weights: config.weights.clone(),
                findings: mine.len(),
                last_window: ws.iter().map(|w| &w.id).max_by_key(|id| id.bucket).cloned(),
                flags: flags.clone(),
            }
        })
        .collect();

    profiles.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| (a.kind, &a.entity).cmp(&(b.kind, &b.entity)))
    });
    let critical = profiles.iter().filter(|p| p.tier == Severity::Critical).count();
    info!(entities = profiles.len(), critical, "risk profiles scored");
    debug!(?flags, "risk flags");
    profiles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factor_tables() {
        assert_eq!(anomaly_factor(0.4), 0.0);
        assert_eq!(anomaly_factor(0.75), 50.0);
        assert_eq!(anomaly_factor(1.0), 100.0);
        assert_eq!(geo_factor(2), 30.0);
        assert_eq!(geo_factor(4), 60.0);
        assert_eq!(geo_factor(9), 100.0);
        assert_eq!(archetype_factor(Some(Archetype::Suspicious)), 80.0);
        assert_eq!(archetype_factor(None), 0.0);
        let base = VolumeBaseline { p95: 100.0, p99: 500.0 };
        assert_eq!(base.factor(100.0), 0.0);
        assert_eq!(base.factor(101.0), 40.0);
        assert_eq!(base.factor(501.0), 70.0);
    }

    #[test]
    fn composite_is_monotonic_in_each_factor() {
        let weights = RiskWeights::default();
        let base = FactorScores {
            threat: 20.0,
            anomaly: 10.0,
            auth_failure: 30.0,
            geo: 0.0,
            archetype: 20.0,
            volume: 40.0,
        };
        let (s0, _) = composite(&base, &weights);
        let bumps: [fn(&mut FactorScores); 6] = [
            |f| f.threat += 5.0,
            |f| f.anomaly += 5.0,
            |f| f.auth_failure += 5.0,
            |f| f.geo += 5.0,
            |f| f.archetype += 5.0,
            |f| f.volume += 5.0,
        ];
        for bump in bumps {
            let mut f = base;
            bump(&mut f);
            assert!(composite(&f, &weights).0 >= s0);
        }
    }

    #[test]
    fn composite_exposes_weights_and_clamps() {
        let weights = RiskWeights {
            threat: 2.0,
            ..RiskWeights::default()
        };
        let factors = FactorScores {
            threat: 100.0,
            ..FactorScores::default()
        };
        let (score, parts) = composite(&factors, &weights);
        assert_eq!(score, 100.0);
        assert_eq!(parts[0].name, "threat");
        assert_eq!(parts[0].weight, 2.0);
        assert_eq!(parts[0].contribution, 200.0);
        assert_eq!(tier(score), Severity::Critical);
        assert_eq!(tier(24.9), Severity::Low);
        assert_eq!(tier(50.0), Severity::High);
    }
}
