use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use tracing::debug;

use crate::analysis::percentile::LatencySummary;
use crate::config::WindowConfig;
use crate::normalize::LogEvent;
use crate::parallel::par_map;

/// Key used for auth attempts that carry no user identifier.
pub const UNKNOWN_TARGET: &str = "(none)";

/// The two kinds of tracked actors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Ip,
    User,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::Ip, EntityKind::User];

    /// Entity id of `event` under this kind, if the event has one.
    pub fn entity_of(self, event: &LogEvent) -> Option<String> {
        match self {
            EntityKind::Ip => event.source_ip.map(|ip| ip.to_string()),
            EntityKind::User => event.user.clone(),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Ip => write!(f, "ip"),
            EntityKind::User => write!(f, "user"),
        }
    }
}

/// Stable window identifier, rendered as `kind:entity@bucket`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId {
    pub kind: EntityKind,
    pub entity: String,
    pub bucket: i64,
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.kind, self.entity, self.bucket)
    }
}

impl Serialize for WindowId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Numeric feature vector of one entity window.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct WindowFeatures {
    pub request_count: f64,
    pub distinct_endpoints: f64,
    pub auth_attempts: f64,
    pub failed_auth: f64,
    pub error_rate: f64,
    pub mean_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub unique_user_agents: f64,
    /// Distinct countries seen (geo dispersion).
    pub distinct_countries: f64,
    /// Distinct users behind an IP, or distinct IPs used by a user.
    pub distinct_peers: f64,
}

impl WindowFeatures {
    pub const NAMES: [&'static str; 11] = [
        "request_count",
        "distinct_endpoints",
        "auth_attempts",
        "failed_auth",
        "error_rate",
        "mean_latency_ms",
        "p95_latency_ms",
        "p99_latency_ms",
        "unique_user_agents",
        "distinct_countries",
        "distinct_peers",
    ];

    pub fn to_vector(&self) -> Vec<f64> {
        vec![
            self.request_count,
            self.distinct_endpoints,
            self.auth_attempts,
            self.failed_auth,
            self.error_rate,
            self.mean_latency_ms,
            self.p95_latency_ms,
            self.p99_latency_ms,
            self.unique_user_agents,
            self.distinct_countries,
            self.distinct_peers,
        ]
    }

    /// Failed share of auth attempts, 0 when there were none.
    pub fn auth_failure_rate(&self) -> f64 {
        if self.auth_attempts > 0.0 {
            self.failed_auth / self.auth_attempts
        } else {
            0.0
        }
    }
}

/// One entity's activity inside one time bucket. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct EntityWindow {
    pub id: WindowId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub features: WindowFeatures,
    pub latency: Option<LatencySummary>,
    pub endpoints: BTreeSet<String>,
    pub user_agents: BTreeSet<String>,
    pub countries: BTreeSet<String>,
    pub peers: BTreeSet<String>,
    /// Auth attempts per target user identifier.
    pub auth_attempts_by_target: BTreeMap<String, u32>,
    /// Failed auth attempts per target user identifier.
    pub failed_auth_by_target: BTreeMap<String, u32>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Mean seconds between consecutive events; `None` for single events.
    pub mean_inter_arrival_secs: Option<f64>,
    /// Ids of the events in this window, in time order.
    pub event_ids: Vec<u64>,
}

impl EntityWindow {
    pub fn kind(&self) -> EntityKind {
        self.id.kind
    }

    pub fn entity(&self) -> &str {
        &self.id.entity
    }

    pub fn bucket(&self) -> i64 {
        self.id.bucket
    }

    /// Largest failure count against a single target.
    pub fn max_failures_per_target(&self) -> u32 {
        self.failed_auth_by_target.values().copied().max().unwrap_or(0)
    }

    /// Distinct named identifiers that saw an auth attempt.
    pub fn distinct_targets(&self) -> usize {
        self.auth_attempts_by_target
            .keys()
            .filter(|k| k.as_str() != UNKNOWN_TARGET)
            .count()
    }
}

/// Groups normalized events into per-entity time windows.
pub struct FeatureAggregator<'a> {
    config: &'a WindowConfig,
    workers: usize,
}

impl<'a> FeatureAggregator<'a> {
    pub fn new(config: &'a WindowConfig, workers: usize) -> Self {
        Self { config, workers }
    }

    /// Bucket index for a timestamp: floor division by the window size.
    pub fn bucket_of(&self, ts: DateTime<Utc>) -> i64 {
        ts.timestamp().div_euclid(self.config.size_secs)
    }

    pub fn bucket_start(&self, bucket: i64) -> DateTime<Utc> {
        super::bucket_start(bucket, self.config.size_secs)
    }

    /// Build one window per (entity, bucket) that has at least one event.
    /// Input order does not matter. Output is sorted by window id.
    pub fn aggregate(&self, events: &[LogEvent], kind: EntityKind) -> Vec<EntityWindow> {
        let mut groups: BTreeMap<WindowId, Vec<&LogEvent>> = BTreeMap::new();
        for event in events {
            let Some(entity) = kind.entity_of(event) else {
                continue;
            };
            let id = WindowId {
                kind,
                entity,
                bucket: self.bucket_of(event.timestamp),
            };
            groups.entry(id).or_default().push(event);
        }

        let groups: Vec<(WindowId, Vec<&LogEvent>)> = groups.into_iter().collect();
        let windows = par_map(&groups, self.workers, |(id, members)| {
            self.build_window(id.clone(), members)
        });
        debug!(%kind, windows = windows.len(), "entity windows built");
        windows
    }

    /// Windows for every entity kind, IP windows first.
    pub fn aggregate_all(&self, events: &[LogEvent]) -> Vec<EntityWindow> {
        EntityKind::ALL
            .iter()
            .flat_map(|kind| self.aggregate(events, *kind))
            .collect()
    }

    fn build_window(&self, id: WindowId, members: &[&LogEvent]) -> EntityWindow {
        let mut ordered: Vec<&LogEvent> = members.to_vec();
        ordered.sort_by_key(|e| (e.timestamp, e.id));

        let mut endpoints = BTreeSet::new();
        let mut user_agents = BTreeSet::new();
        let mut countries = BTreeSet::new();
        let mut peers = BTreeSet::new();
        let mut attempts: BTreeMap<String, u32> = BTreeMap::new();
        let mut failed: BTreeMap<String, u32> = BTreeMap::new();
        let mut latencies = Vec::new();
        let mut failures = 0usize;

        for e in &ordered {
            if let Some(path) = &e.path {
                endpoints.insert(path.split('?').next().unwrap_or(path).to_string());
            }
            if let Some(ua) = &e.user_agent {
                user_agents.insert(ua.clone());
            }
            if let Some(c) = e.country() {
                countries.insert(c.to_string());
            }
            let peer = match id.kind {
                EntityKind::Ip => e.user.clone(),
                EntityKind::User => e.source_ip.map(|ip| ip.to_string()),
            };
            if let Some(p) = peer {
                peers.insert(p);
            }
            if let Some(l) = e.latency_ms {
                latencies.push(l);
            }
            if e.is_failure() {
                failures += 1;
            }
            if e.auth_attempt {
                let target = e.user.clone().unwrap_or_else(|| UNKNOWN_TARGET.to_string());
                *attempts.entry(target.clone()).or_default() += 1;
                if e.is_failed_auth() {
                    *failed.entry(target).or_default() += 1;
                }
            }
        }

        let count = ordered.len();
        let first_seen = ordered.first().map(|e| e.timestamp).unwrap_or_default();
        let last_seen = ordered.last().map(|e| e.timestamp).unwrap_or_default();
        let mean_inter_arrival_secs = (count > 1).then(|| {
            (last_seen - first_seen).num_milliseconds() as f64 / 1000.0 / (count - 1) as f64
        });
        let latency = LatencySummary::from_values(&latencies);

        let features = WindowFeatures {
            request_count: count as f64,
            distinct_endpoints: endpoints.len() as f64,
            auth_attempts: attempts.values().sum::<u32>() as f64,
            failed_auth: failed.values().sum::<u32>() as f64,
            error_rate: failures as f64 / count.max(1) as f64,
            mean_latency_ms: latency.map(|l| l.mean).unwrap_or(0.0),
            p95_latency_ms: latency.map(|l| l.p95).unwrap_or(0.0),
            p99_latency_ms: latency.map(|l| l.p99).unwrap_or(0.0),
            unique_user_agents: user_agents.len() as f64,
            distinct_countries: countries.len() as f64,
            distinct_peers: peers.len() as f64,
        };

        let start = self.bucket_start(id.bucket);
        EntityWindow {
            end: super::bucket_end(start, self.config.size_secs),
            start,
            id,
            features,
            latency,
            endpoints,
            user_agents,
            countries,
            peers,
            auth_attempts_by_target: attempts,
            failed_auth_by_target: failed,
            first_seen,
            last_seen,
            mean_inter_arrival_secs,
            event_ids: ordered.iter().map(|e| e.id).collect(),
        }
    }
}
