//! Botnet correlation: many IPs sharing one request signature in the same
//! bucket. A single grouping pass keyed by signature, no pairwise compare.

use std::collections::{BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};

use crate::analysis::{EntityKind, EntityWindow};
use crate::detect::{CorrelationRule, DetectContext, RuleHit, Severity, Technique};

/// Grouping key for near-identical request behaviour.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SignatureKey {
    pub bucket: i64,
    /// Hex SHA-256 of the sorted endpoint set.
    pub endpoints: String,
    pub user_agents: String,
    /// Mean inter-arrival time rounded to the cadence resolution.
    pub cadence: i64,
}

impl SignatureKey {
    pub fn of(window: &EntityWindow, cadence_secs: f64) -> Option<Self> {
        let gap = window.mean_inter_arrival_secs?;
        let mut hasher = Sha256::new();
        for endpoint in &window.endpoints {
            hasher.update(endpoint.as_bytes());
            hasher.update(b"\n");
        }
        let agents: Vec<&str> = window.user_agents.iter().map(String::as_str).collect();
        Some(Self {
            bucket: window.bucket(),
            endpoints: hex::encode(hasher.finalize()),
            user_agents: agents.join("|"),
            cadence: (gap / cadence_secs).round() as i64,
        })
    }
}

pub struct BotnetRule;

impl CorrelationRule for BotnetRule {
    fn technique(&self) -> Technique {
        Technique::Botnet
    }

    fn scan(&self, windows: &[EntityWindow], ctx: &DetectContext<'_>) -> Vec<RuleHit> {
        let cfg = ctx.config;
        let mut groups: BTreeMap<SignatureKey, Vec<&EntityWindow>> = BTreeMap::new();
        for w in windows {
            if w.kind() != EntityKind::Ip || w.features.request_count < cfg.botnet_min_requests as f64 {
                continue;
            }
            if let Some(key) = SignatureKey::of(w, cfg.botnet_cadence_secs) {
                groups.entry(key).or_default().push(w);
            }
        }

        let mut hits = Vec::new();
        for (key, members) in groups {
            if members.len() < cfg.botnet_min_ips {
                continue;
            }
            let peers: BTreeSet<String> = members.iter().map(|w| w.entity().to_string()).collect();
            let severity = Severity::from_ratio(
                members.len() as f64,
                cfg.botnet_min_ips as f64,
                &cfg.tiers,
            );
            for w in &members {
                let mut hit = RuleHit::for_window(Technique::Botnet, w, severity)
                    .metric("group_size", members.len() as f64)
                    .metric("requests", w.features.request_count)
                    .metric("cadence_secs", key.cadence as f64 * cfg.botnet_cadence_secs);
                hit.related = peers
                    .iter()
                    .filter(|p| p.as_str() != w.entity())
                    .cloned()
                    .collect();
                hits.push(hit);
            }
        }
        hits
    }
}
