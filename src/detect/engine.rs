use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::analysis::{EntityKind, EntityWindow};
use crate::config::{DetectionConfig, WindowConfig};
use crate::detect::botnet::BotnetRule;
use crate::detect::brute_force::BruteForceRule;
use crate::detect::credential::CredentialStuffingRule;
use crate::detect::geo::GeoAnomalyRule;
use crate::detect::{
    CorrelationRule, DetectContext, EntityHistory, EntityRule, RuleHit, Technique,
    ThreatFinding, ID_NAMESPACE,
};
use crate::normalize::LogEvent;
use crate::parallel::par_map;

/// Runs every rule over a batch of windows and coalesces the hits.
pub struct DetectionEngine<'a> {
    config: &'a DetectionConfig,
    window_secs: i64,
    workers: usize,
    entity_rules: Vec<Box<dyn EntityRule>>,
    correlation_rules: Vec<Box<dyn CorrelationRule>>,
}

impl<'a> DetectionEngine<'a> {
    pub fn new(config: &'a DetectionConfig, window: &WindowConfig, workers: usize) -> Self {
        Self {
            config,
            window_secs: window.size_secs,
            workers,
            entity_rules: vec![
                Box::new(BruteForceRule),
                Box::new(CredentialStuffingRule),
                Box::new(GeoAnomalyRule),
            ],
            correlation_rules: vec![Box::new(BotnetRule)],
        }
    }

    /// Detect threats. Output is sorted by start time, technique and entity,
    /// and identical input always yields identical findings and ids.
    pub fn detect(&self, windows: &[EntityWindow], events: &[LogEvent]) -> Vec<ThreatFinding> {
        let ctx = DetectContext::new(self.config, events);

        let mut grouped: BTreeMap<(EntityKind, &str), Vec<&EntityWindow>> = BTreeMap::new();
        for w in windows {
            grouped.entry((w.kind(), w.entity())).or_default().push(w);
        }
        let histories: Vec<EntityHistory<'_>> = grouped
            .into_iter()
            .map(|((kind, entity), mut windows)| {
                windows.sort_by_key(|w| w.bucket());
                EntityHistory {
                    kind,
                    entity,
                    windows,
                }
            })
            .collect();

        let per_entity = par_map(&histories, self.workers, |history| {
            self.entity_rules
                .iter()
                .filter(|rule| rule.applies_to(history.kind))
                .flat_map(|rule| rule.scan(history, &ctx))
                .collect::<Vec<_>>()
        });
        let mut hits: Vec<RuleHit> = per_entity.into_iter().flatten().collect();
        for rule in &self.correlation_rules {
            let found = rule.scan(windows, &ctx);
            debug!(technique = %rule.technique(), hits = found.len(), "correlation rule finished");
            hits.extend(found);
        }
        debug!(entities = histories.len(), hits = hits.len(), "rules evaluated");

        let mut findings: Vec<ThreatFinding> = coalesce(hits, self.config.coalesce_gap_windows)
            .into_iter()
            .map(|hit| self.finding(hit))
            .collect();
        findings.sort_by(|a, b| {
            (a.start, a.technique, a.entity_kind, &a.entity)
                .cmp(&(b.start, b.technique, b.entity_kind, &b.entity))
        });

        for technique in Technique::ALL {
            let n = findings.iter().filter(|f| f.technique == technique).count();
            if n > 0 {
                info!(%technique, findings = n, "threats detected");
            }
        }
        findings
    }

    fn bucket_start(&self, bucket: i64) -> DateTime<Utc> {
        crate::analysis::bucket_start(bucket, self.window_secs)
    }

    fn finding(&self, hit: RuleHit) -> ThreatFinding {
        let id = Uuid::new_v5(
            &ID_NAMESPACE,
            format!(
                "finding|{}|{}|{}|{}|{}",
                hit.technique, hit.entity_kind, hit.entity, hit.first_bucket, hit.last_bucket
            )
            .as_bytes(),
        );
        let summary = summarize(&hit);
        ThreatFinding {
            id,
            entity_kind: hit.entity_kind,
            technique: hit.technique,
            severity: hit.severity,
            mitre: hit.technique.mitre(),
            start: self.bucket_start(hit.first_bucket),
            end: self.bucket_start(hit.last_bucket + 1),
            first_seen: hit.first_seen,
            last_seen: hit.last_seen,
            evidence: hit.evidence,
            related_entities: hit.related.into_iter().collect(),
            countries: hit.countries.into_iter().collect(),
            metrics: hit.metrics,
            summary,
            entity: hit.entity,
        }
    }
}

/// Merge hits of the same (technique, entity) whose bucket ranges overlap or
/// sit within `gap` buckets of each other. The merged hit keeps the highest
/// severity and the peak of each metric.
pub fn coalesce(hits: Vec<RuleHit>, gap: i64) -> Vec<RuleHit> {
    let mut grouped: BTreeMap<(Technique, EntityKind, String), Vec<RuleHit>> = BTreeMap::new();
    for hit in hits {
        grouped
            .entry((hit.technique, hit.entity_kind, hit.entity.clone()))
            .or_default()
            .push(hit);
    }

    let mut out = Vec::new();
    for (_, mut group) in grouped {
        group.sort_by_key(|h| (h.first_bucket, h.last_bucket));
        let mut iter = group.into_iter();
        let Some(mut current) = iter.next() else {
            continue;
        };
        for hit in iter {
            if hit.first_bucket - current.last_bucket <= gap {
                merge(&mut current, hit);
            } else {
                out.push(std::mem::replace(&mut current, hit));
            }
        }
        out.push(current);
    }
    out
}

fn merge(into: &mut RuleHit, hit: RuleHit) {
    into.last_bucket = into.last_bucket.max(hit.last_bucket);
    into.severity = into.severity.max(hit.severity);
    into.first_seen = into.first_seen.min(hit.first_seen);
    into.last_seen = into.last_seen.max(hit.last_seen);
    let evidence: BTreeSet<_> = into.evidence.drain(..).chain(hit.evidence).collect();
    into.evidence = evidence.into_iter().collect();
    into.related.extend(hit.related);
    into.countries.extend(hit.countries);
    for (name, value) in hit.metrics {
        let slot = into.metrics.entry(name).or_insert(value);
        *slot = slot.max(value);
    }
}

fn summarize(hit: &RuleHit) -> String {
    let m = |k: &str| hit.metrics.get(k).copied().unwrap_or(0.0);
    match hit.technique {
        Technique::BruteForce if hit.metrics.contains_key("focused_failures") => format!(
            "{} {} had up to {} failed logins against one account in a window",
            hit.entity_kind,
            hit.entity,
            m("focused_failures")
        ),
        Technique::BruteForce => format!(
            "{} {} failed logins persistently across {} consecutive windows",
            hit.entity_kind,
            hit.entity,
            m("sustained_windows")
        ),
        Technique::CredentialStuffing => format!(
            "ip {} tried {} distinct accounts with about {:.1} attempts each",
            hit.entity,
            m("distinct_users"),
            m("attempts_per_user")
        ),
        Technique::Botnet => format!(
            "ip {} shares a request signature with {} other addresses",
            hit.entity,
            hit.related.len()
        ),
        Technique::GeoAnomaly => format!(
            "user {} was active from {} countries ({})",
            hit.entity,
            hit.countries.len(),
            hit.countries.iter().cloned().collect::<Vec<_>>().join(", ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use crate::analysis::aggregator::tests::failed_login;
    use crate::analysis::FeatureAggregator;
    use crate::detect::Severity;

    fn run(events: &[LogEvent], workers: usize) -> Vec<ThreatFinding> {
        let wcfg = WindowConfig::default();
        let dcfg = DetectionConfig::default();
        let windows = FeatureAggregator::new(&wcfg, workers).aggregate_all(events);
        DetectionEngine::new(&dcfg, &wcfg, workers).detect(&windows, events)
    }

    #[test]
    fn adjacent_windows_coalesce_into_one_finding() {
        // 15 failures in bucket 0 and 25 in bucket 1 from the same IP.
        let events: Vec<LogEvent> = (0..40)
            .map(|i| {
                let t = if i < 15 { i as i64 * 15 } else { 300 + (i as i64 - 15) * 11 };
                failed_login(i, t, "10.1.1.1", "admin")
            })
            .collect();
        let findings = run(&events, 1);
        let ip: Vec<_> = findings
            .iter()
            .filter(|f| f.entity_kind == EntityKind::Ip && f.technique == Technique::BruteForce)
            .collect();
        assert_eq!(ip.len(), 1);
        assert_eq!(ip[0].evidence.len(), 2);
        assert_eq!(ip[0].severity, Severity::High);
        assert_eq!(ip[0].metrics["focused_failures"], 25.0);
        assert_eq!(ip[0].end - ip[0].start, Duration::seconds(600));
        assert_eq!(ip[0].mitre.technique_id, "T1110");
    }

    #[test]
    fn distant_hits_stay_separate() {
        let hit = |b: i64| RuleHit {
            technique: Technique::BruteForce,
            entity_kind: EntityKind::Ip,
            entity: "10.0.0.1".into(),
            first_bucket: b,
            last_bucket: b,
            severity: Severity::Medium,
            evidence: Vec::new(),
            related: BTreeSet::new(),
            countries: BTreeSet::new(),
            metrics: BTreeMap::new(),
            first_seen: DateTime::<Utc>::UNIX_EPOCH,
            last_seen: DateTime::<Utc>::UNIX_EPOCH,
        };
        assert_eq!(coalesce(vec![hit(0), hit(1), hit(2)], 1).len(), 1);
        assert_eq!(coalesce(vec![hit(0), hit(2)], 1).len(), 2);
        assert_eq!(coalesce(vec![hit(0), hit(2)], 2).len(), 1);
    }

    #[test]
    fn parallel_and_serial_agree_with_stable_ids() {
        let events: Vec<LogEvent> = (0..300)
            .map(|i| failed_login(i, i as i64 * 3, &format!("10.0.0.{}", i % 4), &format!("u{}", i % 3)))
            .collect();
        let a = run(&events, 1);
        let b = run(&events, 4);
        assert!(!a.is_empty());
        assert_eq!(a, b);
    }
}
