//! Per-entity behavior summaries and archetype labelling of clusters.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::analysis::{percentile, EntityWindow};

/// Human-readable behavior label of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Archetype {
    Suspicious,
    Scraper,
    PowerUser,
    LightUser,
    Normal,
    /// All entities look the same; clustering was skipped.
    Uniform,
}

impl fmt::Display for Archetype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Archetype::Suspicious => "suspicious",
            Archetype::Scraper => "scraper",
            Archetype::PowerUser => "power_user",
            Archetype::LightUser => "light_user",
            Archetype::Normal => "normal",
            Archetype::Uniform => "uniform",
        };
        f.write_str(s)
    }
}

/// Aggregated behavior of one entity over the whole batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntitySummary {
    pub entity: String,
    pub windows: f64,
    pub total_requests: f64,
    /// Mean requests per active window.
    pub request_rate: f64,
    pub endpoint_diversity: f64,
    pub error_rate: f64,
    pub auth_failure_rate: f64,
    pub mean_latency_ms: f64,
    pub distinct_peers: f64,
    pub distinct_countries: f64,
}

impl EntitySummary {
    pub const NAMES: [&'static str; 9] = [
        "windows",
        "total_requests",
        "request_rate",
        "endpoint_diversity",
        "error_rate",
        "auth_failure_rate",
        "mean_latency_ms",
        "distinct_peers",
        "distinct_countries",
    ];

    pub fn to_vector(&self) -> Vec<f64> {
        vec![
            self.windows,
            self.total_requests,
            self.request_rate,
            self.endpoint_diversity,
            self.error_rate,
            self.auth_failure_rate,
            self.mean_latency_ms,
            self.distinct_peers,
            self.distinct_countries,
        ]
    }

    /// Summaries for every entity in `windows`, sorted by entity id.
    pub fn from_windows<'w>(windows: impl IntoIterator<Item = &'w EntityWindow>) -> Vec<Self> {
        let mut grouped: BTreeMap<&str, Vec<&EntityWindow>> = BTreeMap::new();
        for w in windows {
            grouped.entry(w.entity()).or_default().push(w);
        }
        grouped
            .into_iter()
            .map(|(entity, ws)| Self::summarize(entity, &ws))
            .collect()
    }

    fn summarize(entity: &str, windows: &[&EntityWindow]) -> Self {
        let mut endpoints = BTreeSet::new();
        let mut peers = BTreeSet::new();
        let mut countries = BTreeSet::new();
        let (mut requests, mut errors, mut attempts, mut failed) = (0.0, 0.0, 0.0, 0.0);
        let (mut latency_sum, mut latency_weight) = (0.0, 0.0);
        for w in windows {
            let f = &w.features;
            endpoints.extend(w.endpoints.iter());
            peers.extend(w.peers.iter());
            countries.extend(w.countries.iter());
            requests += f.request_count;
            errors += f.error_rate * f.request_count;
            attempts += f.auth_attempts;
            failed += f.failed_auth;
            if let Some(l) = &w.latency {
                latency_sum += l.mean * l.samples as f64;
                latency_weight += l.samples as f64;
            }
        }
        let n = windows.len() as f64;
        Self {
            entity: entity.to_string(),
            windows: n,
            total_requests: requests,
            request_rate: if n > 0.0 { requests / n } else { 0.0 },
            endpoint_diversity: endpoints.len() as f64,
            error_rate: if requests > 0.0 { errors / requests } else { 0.0 },
            auth_failure_rate: if attempts > 0.0 { failed / attempts } else { 0.0 },
            mean_latency_ms: if latency_weight > 0.0 {
                latency_sum / latency_weight
            } else {
                0.0
            },
            distinct_peers: peers.len() as f64,
            distinct_countries: countries.len() as f64,
        }
    }
}

/// Mean of each summary field over a cluster's members.
pub fn centroid(members: &[&EntitySummary]) -> BTreeMap<String, f64> {
    let n = members.len().max(1) as f64;
    let mut sums = vec![0.0; EntitySummary::NAMES.len()];
    for m in members {
        for (s, v) in sums.iter_mut().zip(m.to_vector()) {
            *s += v;
        }
    }
    EntitySummary::NAMES
        .iter()
        .zip(sums)
        .map(|(name, s)| (name.to_string(), s / n))
        .collect()
}

/// Label each cluster from its centroid and the batch-wide entity
/// distribution. Rules apply in order: suspicious, busiest cluster as
/// scraper or power user, light user, normal.
pub fn label(
    centroids: &[BTreeMap<String, f64>],
    summaries: &[EntitySummary],
    suspicious_rate: f64,
) -> Vec<Archetype> {
    let rates: Vec<f64> = summaries.iter().map(|s| s.request_rate).collect();
    let diversities: Vec<f64> = summaries.iter().map(|s| s.endpoint_diversity).collect();
    let p25 = percentile(&rates, 25.0).unwrap_or(0.0);
    let p75 = percentile(&rates, 75.0).unwrap_or(0.0);
    let median_diversity = percentile(&diversities, 50.0).unwrap_or(0.0);

    let get = |c: &BTreeMap<String, f64>, k: &str| c.get(k).copied().unwrap_or(0.0);
    let busiest = centroids
        .iter()
        .enumerate()
        .max_by(|(i, a), (j, b)| {
            get(a, "request_rate")
                .total_cmp(&get(b, "request_rate"))
                .then(j.cmp(i))
        })
        .map(|(i, _)| i);

    centroids
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let rate = get(c, "request_rate");
            if get(c, "error_rate") > suspicious_rate || get(c, "auth_failure_rate") > suspicious_rate {
                Archetype::Suspicious
            } else if Some(i) == busiest && rate > p75 {
                if get(c, "endpoint_diversity") <= median_diversity {
                    Archetype::Scraper
                } else {
                    Archetype::PowerUser
                }
            } else if rate < p25 {
                Archetype::LightUser
            } else {
                Archetype::Normal
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(entity: &str, rate: f64, diversity: f64, error_rate: f64) -> EntitySummary {
        EntitySummary {
            entity: entity.into(),
            windows: 1.0,
            total_requests: rate,
            request_rate: rate,
            endpoint_diversity: diversity,
            error_rate,
            ..EntitySummary::default()
        }
    }

    #[test]
    fn labels_follow_rule_order() {
        let summaries = vec![
            summary("a", 500.0, 1.0, 0.0),
            summary("b", 10.0, 5.0, 0.0),
            summary("c", 12.0, 4.0, 0.0),
            summary("d", 1.0, 1.0, 0.0),
            summary("e", 8.0, 3.0, 0.9),
        ];
        let clusters: Vec<BTreeMap<String, f64>> = [&[0][..], &[1, 2], &[3], &[4]]
            .iter()
            .map(|idx| centroid(&idx.iter().map(|&i| &summaries[i]).collect::<Vec<_>>()))
            .collect();
        let labels = label(&clusters, &summaries, 0.3);
        assert_eq!(
            labels,
            vec![
                Archetype::Scraper,
                Archetype::Normal,
                Archetype::LightUser,
                Archetype::Suspicious
            ]
        );
    }

    #[test]
    fn diverse_heavy_cluster_is_power_user() {
        let summaries = vec![
            summary("a", 400.0, 40.0, 0.0),
            summary("b", 5.0, 2.0, 0.0),
            summary("c", 6.0, 2.0, 0.0),
            summary("d", 7.0, 3.0, 0.0),
        ];
        let clusters = vec![
            centroid(&[&summaries[0]]),
            centroid(&[&summaries[1], &summaries[2], &summaries[3]]),
        ];
        let labels = label(&clusters, &summaries, 0.3);
        assert_eq!(labels[0], Archetype::PowerUser);
    }
}
