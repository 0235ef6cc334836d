//! Rule-based threat detection over entity windows.

pub mod botnet;
pub mod brute_force;
pub mod credential;
pub mod engine;
pub mod geo;
pub mod mitre;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analysis::{EntityKind, EntityWindow, WindowId};
use crate::config::{DetectionConfig, SeverityTiers};
use crate::normalize::LogEvent;
pub use engine::DetectionEngine;
pub use mitre::{MitreMapping, MitreTactic};

/// Namespace for content-derived ids of findings and alerts.
pub const ID_NAMESPACE: Uuid = Uuid::from_u128(0x6c6f_6769_6e74_656c_8000_0000_0000_0001);

/// Severity levels for findings and alerts, ordered low to critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Tier reached by `value` measured against `threshold`.
    pub fn from_ratio(value: f64, threshold: f64, tiers: &SeverityTiers) -> Self {
        let ratio = if threshold > 0.0 { value / threshold } else { 0.0 };
        if ratio >= tiers.critical {
            Severity::Critical
        } else if ratio >= tiers.high {
            Severity::High
        } else if ratio >= 1.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    /// One tier up, saturating at critical.
    pub fn escalate(self) -> Self {
        match self {
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High | Severity::Critical => Severity::Critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.pad(s)
    }
}

/// Detection techniques implemented by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Technique {
    BruteForce,
    CredentialStuffing,
    Botnet,
    GeoAnomaly,
}

impl Technique {
    pub const ALL: [Technique; 4] = [
        Technique::BruteForce,
        Technique::CredentialStuffing,
        Technique::Botnet,
        Technique::GeoAnomaly,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Technique::BruteForce => "brute-force",
            Technique::CredentialStuffing => "credential-stuffing",
            Technique::Botnet => "botnet",
            Technique::GeoAnomaly => "geo-anomaly",
        }
    }

    pub fn mitre(&self) -> MitreMapping {
        mitre::lookup(self.id())
    }
}

impl fmt::Display for Technique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.id())
    }
}

/// A detected threat. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreatFinding {
    pub id: Uuid,
    pub entity_kind: EntityKind,
    pub entity: String,
    pub technique: Technique,
    pub severity: Severity,
    pub mitre: MitreMapping,
    /// Covered time range, from the first to the end of the last window.
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub evidence: Vec<WindowId>,
    /// Other entities involved, such as botnet peers.
    pub related_entities: Vec<String>,
    /// Countries the entity was seen from, for geo findings.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub countries: Vec<String>,
    /// Peak values of the rule's metrics over the covered range.
    pub metrics: BTreeMap<String, f64>,
    pub summary: String,
}

/// Raw rule output before coalescing.
#[derive(Debug, Clone)]
pub struct RuleHit {
    pub technique: Technique,
    pub entity_kind: EntityKind,
    pub entity: String,
    pub first_bucket: i64,
    pub last_bucket: i64,
    pub severity: Severity,
    pub evidence: Vec<WindowId>,
    pub related: BTreeSet<String>,
    pub countries: BTreeSet<String>,
    pub metrics: BTreeMap<String, f64>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl RuleHit {
    /// A hit covering exactly one window.
    pub fn for_window(technique: Technique, window: &EntityWindow, severity: Severity) -> Self {
        Self {
            technique,
            entity_kind: window.kind(),
            entity: window.entity().to_string(),
            first_bucket: window.bucket(),
            last_bucket: window.bucket(),
            severity,
            evidence: vec![window.id.clone()],
            related: BTreeSet::new(),
            countries: BTreeSet::new(),
            metrics: BTreeMap::new(),
            first_seen: window.first_seen,
            last_seen: window.last_seen,
        }
    }

    /// A hit covering a run of windows, ordered by bucket.
    pub fn for_run(technique: Technique, run: &[&EntityWindow], severity: Severity) -> Option<Self> {
        let first = run.first()?;
        let last = run.last()?;
        let mut hit = Self::for_window(technique, first, severity);
        hit.last_bucket = last.bucket();
        hit.evidence = run.iter().map(|w| w.id.clone()).collect();
        hit.first_seen = run.iter().map(|w| w.first_seen).min()?;
        hit.last_seen = run.iter().map(|w| w.last_seen).max()?;
        Some(hit)
    }

    pub fn metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }
}

/// All windows of one entity, ordered by bucket.
pub struct EntityHistory<'w> {
    pub kind: EntityKind,
    pub entity: &'w str,
    pub windows: Vec<&'w EntityWindow>,
}

impl<'w> EntityHistory<'w> {
    /// Split into runs of consecutive buckets.
    pub fn consecutive_runs(&self) -> Vec<&[&'w EntityWindow]> {
        let mut runs = Vec::new();
        let mut start = 0;
        for i in 1..=self.windows.len() {
            let breaks = i == self.windows.len()
                || self.windows[i].bucket() != self.windows[i - 1].bucket() + 1;
            if breaks {
                runs.push(&self.windows[start..i]);
                start = i;
            }
        }
        runs
    }
}

/// Shared read-only inputs for every rule.
pub struct DetectContext<'a> {
    pub config: &'a DetectionConfig,
    pub events: HashMap<u64, &'a LogEvent>,
}

impl<'a> DetectContext<'a> {
    pub fn new(config: &'a DetectionConfig, events: &'a [LogEvent]) -> Self {
        Self {
            config,
            events: events.iter().map(|e| (e.id, e)).collect(),
        }
    }

    /// Raw events of a window, in window order.
    pub fn window_events(&self, window: &EntityWindow) -> Vec<&'a LogEvent> {
        window
            .event_ids
            .iter()
            .filter_map(|id| self.events.get(id).copied())
            .collect()
    }
}

/// A pure detection rule over the history of one entity.
pub trait EntityRule: Send + Sync {
    fn technique(&self) -> Technique;

    /// Entity kinds this rule inspects.
    fn applies_to(&self, kind: EntityKind) -> bool;

    fn scan(&self, history: &EntityHistory<'_>, ctx: &DetectContext<'_>) -> Vec<RuleHit>;
}

/// A rule that correlates windows across entities.
pub trait CorrelationRule: Send + Sync {
    fn technique(&self) -> Technique;

    fn scan(&self, windows: &[EntityWindow], ctx: &DetectContext<'_>) -> Vec<RuleHit>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_tiers_from_ratio() {
        let tiers = SeverityTiers::default();
        assert_eq!(Severity::from_ratio(9.0, 10.0, &tiers), Severity::Low);
        assert_eq!(Severity::from_ratio(10.0, 10.0, &tiers), Severity::Medium);
        assert_eq!(Severity::from_ratio(20.0, 10.0, &tiers), Severity::High);
        assert_eq!(Severity::from_ratio(45.0, 10.0, &tiers), Severity::Critical);
        assert_eq!(Severity::Critical.escalate(), Severity::Critical);
        assert!(Severity::High > Severity::Medium);
    }

    #[test]
    fn technique_ids_round_trip_through_serde() {
        let json = serde_json::to_string(&Technique::CredentialStuffing).unwrap();
        assert_eq!(json, "\"credential-stuffing\"");
        for t in Technique::ALL {
            assert_ne!(t.mitre().tactic, MitreTactic::Unclassified);
        }
    }
}
