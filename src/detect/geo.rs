//! Geo anomaly: one account active from many countries across the batch.

use std::collections::BTreeSet;

use crate::analysis::{EntityKind, EntityWindow};
use crate::detect::{DetectContext, EntityHistory, EntityRule, RuleHit, Severity, Technique};

pub struct GeoAnomalyRule;

impl EntityRule for GeoAnomalyRule {
    fn technique(&self) -> Technique {
        Technique::GeoAnomaly
    }

    fn applies_to(&self, kind: EntityKind) -> bool {
        kind == EntityKind::User
    }

    fn scan(&self, history: &EntityHistory<'_>, ctx: &DetectContext<'_>) -> Vec<RuleHit> {
        let cfg = ctx.config;
        let located: Vec<&EntityWindow> = history
            .windows
            .iter()
            .copied()
            .filter(|w| !w.countries.is_empty())
            .collect();
        let countries: BTreeSet<&str> = located
            .iter()
            .flat_map(|w| w.countries.iter().map(String::as_str))
            .collect();
        if countries.len() < cfg.geo_min_countries {
            return Vec::new();
        }

        let severity = Severity::from_ratio(
            countries.len() as f64,
            cfg.geo_min_countries as f64,
            &cfg.tiers,
        );
        match RuleHit::for_run(Technique::GeoAnomaly, &located, severity) {
            Some(mut hit) => {
                hit.countries = countries.iter().map(|c| c.to_string()).collect();
                vec![hit.metric("countries", countries.len() as f64)]
            }
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::aggregator::tests::event;
    use crate::analysis::FeatureAggregator;
    use crate::config::{DetectionConfig, WindowConfig};
    use crate::normalize::{GeoLocation, GeoSource, LogEvent};

    fn login_from(id: u64, secs: i64, country: &str) -> LogEvent {
        let mut e = event(id, secs, "192.0.2.1", Some("carol"));
        e.geo = Some(GeoLocation {
            country: country.into(),
            city: None,
            source: GeoSource::Record,
        });
        e
    }

    #[test]
    fn three_countries_raise_a_finding() {
        let events = vec![
            login_from(1, 0, "US"),
            login_from(2, 4000, "BR"),
            login_from(3, 9000, "RU"),
        ];
        let wcfg = WindowConfig::default();
        let dcfg = DetectionConfig::default();
        let windows = FeatureAggregator::new(&wcfg, 1).aggregate(&events, EntityKind::User);
        let ctx = DetectContext::new(&dcfg, &events);
        let history = EntityHistory {
            kind: EntityKind::User,
            entity: "carol",
            windows: windows.iter().collect(),
        };
        let hits = GeoAnomalyRule.scan(&history, &ctx);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].evidence.len(), 3);
        assert_eq!(hits[0].severity, Severity::Medium);
        assert!(hits[0].countries.contains("BR"));
        assert!(hits[0].related.is_empty());

        let two = &windows[..2];
        let history = EntityHistory {
            kind: EntityKind::User,
            entity: "carol",
            windows: two.iter().collect(),
        };
        assert!(GeoAnomalyRule.scan(&history, &ctx).is_empty());
    }
}
