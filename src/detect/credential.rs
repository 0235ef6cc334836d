//! Credential stuffing: one IP failing against many distinct accounts with
//! few attempts each.

use crate::analysis::aggregator::UNKNOWN_TARGET;
use crate::analysis::EntityKind;
use crate::detect::{DetectContext, EntityHistory, EntityRule, RuleHit, Severity, Technique};

pub struct CredentialStuffingRule;

impl EntityRule for CredentialStuffingRule {
    fn technique(&self) -> Technique {
        Technique::CredentialStuffing
    }

    fn applies_to(&self, kind: EntityKind) -> bool {
        kind == EntityKind::Ip
    }

    fn scan(&self, history: &EntityHistory<'_>, ctx: &DetectContext<'_>) -> Vec<RuleHit> {
        let cfg = ctx.config;
        let min_users = cfg.stuffing_min_users as f64;

        history
            .windows
            .iter()
            .filter_map(|window| {
                let failed_targets = window
                    .failed_auth_by_target
                    .keys()
                    .filter(|k| k.as_str() != UNKNOWN_TARGET)
                    .count();
                if (failed_targets as f64) < min_users {
                    return None;
                }
                let attempts: u32 = window
                    .auth_attempts_by_target
                    .iter()
                    .filter(|(k, _)| k.as_str() != UNKNOWN_TARGET)
                    .map(|(_, v)| *v)
                    .sum();
                let per_user = attempts as f64 / window.distinct_targets().max(1) as f64;
                if per_user > cfg.stuffing_max_attempts_per_user {
                    return None;
                }
                let severity = Severity::from_ratio(failed_targets as f64, min_users, &cfg.tiers);
                let mut hit = RuleHit::for_window(Technique::CredentialStuffing, window, severity)
                    .metric("distinct_users", failed_targets as f64)
                    .metric("attempts_per_user", per_user)
                    .metric("failed_auth", window.features.failed_auth);
                hit.related = window
                    .failed_auth_by_target
                    .keys()
                    .filter(|k| k.as_str() != UNKNOWN_TARGET)
                    .take(20)
                    .cloned()
                    .collect();
                Some(hit)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::aggregator::tests::failed_login;
    use crate::analysis::FeatureAggregator;
    use crate::config::{DetectionConfig, WindowConfig};
    use crate::normalize::LogEvent;

    fn scan(events: &[LogEvent]) -> Vec<RuleHit> {
        let wcfg = WindowConfig::default();
        let dcfg = DetectionConfig::default();
        let windows = FeatureAggregator::new(&wcfg, 1).aggregate(events, EntityKind::Ip);
        let ctx = DetectContext::new(&dcfg, events);
        let history = EntityHistory {
            kind: EntityKind::Ip,
            entity: windows[0].entity(),
            windows: windows.iter().collect(),
        };
        CredentialStuffingRule.scan(&history, &ctx)
    }

    #[test]
    fn fifty_accounts_once_each() {
        let events: Vec<LogEvent> = (0..50)
            .map(|i| failed_login(i, i as i64 * 5, "198.51.100.4", &format!("user{:02}", i)))
            .collect();
        let hits = scan(&events);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].metrics["distinct_users"], 50.0);
        assert_eq!(hits[0].severity, Severity::Critical);
        assert_eq!(hits[0].related.len(), 20);
    }

    #[test]
    fn repeated_attempts_per_account_are_not_stuffing() {
        let events: Vec<LogEvent> = (0..60)
            .map(|i| failed_login(i, i as i64 * 4, "198.51.100.4", &format!("user{}", i % 12)))
            .collect();
        assert!(scan(&events).is_empty());
    }
}
