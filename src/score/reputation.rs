//! Rule-based IP reputation: 0 (trusted) to 100 (malicious).
//!
//! Three components over the whole batch: failure ratio, request volume
//! against the batch p95, and how many accounts the address touched.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use serde::Serialize;
use tracing::debug;

use crate::analysis::percentile;
use crate::detect::Severity;
use crate::normalize::LogEvent;

const FAILURE_WEIGHT: f64 = 0.5;
const VOLUME_WEIGHT: f64 = 0.2;
const USER_SPREAD_WEIGHT: f64 = 0.3;

/// Accounts an address may touch before the spread component starts.
const USER_SPREAD_FREE: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IpReputation {
    pub ip: IpAddr,
    pub requests: usize,
    pub failures: usize,
    pub failure_ratio: f64,
    pub unique_users: usize,
    pub score: f64,
    pub tier: Severity,
}

/// Volume component: 80 above the batch p95, else linear up to 40 at p95.
pub fn volume_score(requests: f64, p95: f64) -> f64 {
    if requests > p95 {
        80.0
    } else if p95 > 0.0 {
        requests / p95 * 40.0
    } else {
        0.0
    }
}

/// Spread component: zero up to five accounts, then 60 plus 4 per extra
/// account, capped at 100.
pub fn user_spread_score(users: usize) -> f64 {
    if users > USER_SPREAD_FREE {
        (60.0 + (users - USER_SPREAD_FREE) as f64 * 4.0).min(100.0)
    } else {
        0.0
    }
}

/// Tier bands: low up to 25, medium up to 50, high up to 70.
pub fn reputation_tier(score: f64) -> Severity {
    if score > 70.0 {
        Severity::Critical
    } else if score > 50.0 {
        Severity::High
    } else if score > 25.0 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Score every source IP in the batch. Sorted by score, highest first, then
/// by address.
pub fn ip_reputation(events: &[LogEvent]) -> Vec<IpReputation> {
    let mut groups: BTreeMap<IpAddr, (usize, usize, BTreeSet<&str>)> = BTreeMap::new();
    for e in events {
        let Some(ip) = e.source_ip else {
            continue;
        };
        let slot = groups.entry(ip).or_default();
        slot.0 += 1;
        if e.is_failure() {
            slot.1 += 1;
        }
        if let Some(user) = e.user.as_deref() {
            slot.2.insert(user);
        }
    }

    let totals: Vec<f64> = groups.values().map(|g| g.0 as f64).collect();
    let p95 = percentile(&totals, 95.0).unwrap_or(0.0);

    let mut scored: Vec<IpReputation> = groups
        .into_iter()
        .map(|(ip, (requests, failures, users))| {
            let failure_ratio = failures as f64 / requests as f64;
            let score = (failure_ratio * 100.0 * FAILURE_WEIGHT
                + volume_score(requests as f64, p95) * VOLUME_WEIGHT
                + user_spread_score(users.len()) * USER_SPREAD_WEIGHT)
                .clamp(0.0, 100.0);
            IpReputation {
                ip,
                requests,
                failures,
                failure_ratio,
                unique_users: users.len(),
                score,
                tier: reputation_tier(score),
            }
        })
        .collect();
    scored.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.ip.cmp(&b.ip)));
    debug!(addresses = scored.len(), "ip reputation scored");
    scored
}
