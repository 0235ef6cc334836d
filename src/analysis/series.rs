//! Traffic series and rolling z-score spike detection, batch-wide and per service.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::analysis::service::service_id;
use crate::config::WindowConfig;
use crate::normalize::LogEvent;

/// A simple series for statistical analysis.
pub struct TimeSeries<'a> {
    values: &'a [f64],
}

impl<'a> TimeSeries<'a> {
    pub fn new(values: &'a [f64]) -> Self {
        Self { values }
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Sample variance (n - 1). Zero below two samples.
    pub fn variance(&self) -> f64 {
        if self.values.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let sum_sq_diff: f64 = self.values.iter().map(|&x| (x - mean).powi(2)).sum();
        sum_sq_diff / (self.values.len() - 1) as f64
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Z-score of each point against a trailing window that includes the
    /// point itself. A zero or undefined deviation is replaced by 1.
    pub fn rolling_z_scores(&self, window: usize) -> Vec<f64> {
        let window = window.max(1);
        (0..self.values.len())
            .map(|i| {
                let start = (i + 1).saturating_sub(window);
                let baseline = TimeSeries::new(&self.values[start..=i]);
                let std = baseline.std_dev();
                let std = if std > 0.0 { std } else { 1.0 };
                (self.values[i] - baseline.mean()) / std
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrafficBucket {
    pub bucket: i64,
    pub start: DateTime<Utc>,
    pub requests: usize,
    pub errors: usize,
    pub error_rate: f64,
    /// `None` when no event in the bucket carried a latency.
    pub mean_latency_ms: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpikeMetric {
    Requests,
    ErrorRate,
    Latency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpikeDirection {
    High,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Spike {
    pub metric: SpikeMetric,
    pub bucket: i64,
    pub start: DateTime<Utc>,
    pub value: f64,
    pub z_score: f64,
    pub direction: SpikeDirection,
    /// |z| above 1.5x the spike threshold.
    pub critical: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrafficSeries {
    pub bucket_secs: i64,
    pub buckets: Vec<TrafficBucket>,
    pub spikes: Vec<Spike>,
}

/// Latency spikes of one service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceSpikes {
    pub service: String,
    pub spikes: Vec<Spike>,
}

fn bucketize<'e>(events: impl IntoIterator<Item = &'e LogEvent>, size: i64) -> Vec<TrafficBucket> {
    let mut acc: BTreeMap<i64, (usize, usize, f64, usize)> = BTreeMap::new();
    for e in events {
        let slot = acc.entry(e.timestamp.timestamp().div_euclid(size)).or_default();
        slot.0 += 1;
        if e.is_failure() {
            slot.1 += 1;
        }
        if let Some(l) = e.latency_ms.filter(|l| l.is_finite()) {
            slot.2 += l;
            slot.3 += 1;
        }
    }

    acc.into_iter()
        .map(|(bucket, (requests, errors, lat_sum, lat_n))| TrafficBucket {
            bucket,
            start: super::bucket_start(bucket, size),
            requests,
            errors,
            error_rate: errors as f64 / requests.max(1) as f64,
            mean_latency_ms: (lat_n > 0).then(|| lat_sum / lat_n as f64),
        })
        .collect()
}

/// Latency z-scores run only over buckets that have a latency.
fn latency_spikes(buckets: &[TrafficBucket], config: &WindowConfig) -> Vec<Spike> {
    let (lat_buckets, lat_values): (Vec<TrafficBucket>, Vec<f64>) = buckets
        .iter()
        .filter_map(|b| b.mean_latency_ms.map(|l| (b.clone(), l)))
        .unzip();
    detect_spikes(SpikeMetric::Latency, &lat_buckets, &lat_values, config, false)
}

/// Bucket events by `series_bucket_secs` and flag spikes. Only buckets with
/// events are materialized.
pub fn traffic_series(events: &[LogEvent], config: &WindowConfig) -> TrafficSeries {
    let size = config.series_bucket_secs;
    let buckets = bucketize(events, size);

    let mut spikes = Vec::new();
    let requests: Vec<f64> = buckets.iter().map(|b| b.requests as f64).collect();
    spikes.extend(detect_spikes(SpikeMetric::Requests, &buckets, &requests, config, false));
    let errors: Vec<f64> = buckets.iter().map(|b| b.error_rate).collect();
    spikes.extend(detect_spikes(SpikeMetric::ErrorRate, &buckets, &errors, config, true));
    spikes.extend(latency_spikes(&buckets, config));

    spikes.sort_by(|a, b| a.bucket.cmp(&b.bucket).then((a.metric as u8).cmp(&(b.metric as u8))));
    debug!(buckets = buckets.len(), spikes = spikes.len(), "traffic series built");
    TrafficSeries {
        bucket_secs: size,
        buckets,
        spikes,
    }
}

/// Latency spikes per service id over `series_bucket_secs` buckets. Services
/// without a spike are omitted; output is sorted by service id.
pub fn service_latency_spikes(events: &[LogEvent], config: &WindowConfig) -> Vec<ServiceSpikes> {
    let mut groups: BTreeMap<String, Vec<&LogEvent>> = BTreeMap::new();
    for e in events {
        groups.entry(service_id(e)).or_default().push(e);
    }

    let out: Vec<ServiceSpikes> = groups
        .into_iter()
        .filter_map(|(service, members)| {
            let spikes = latency_spikes(&bucketize(members, config.series_bucket_secs), config);
            (!spikes.is_empty()).then_some(ServiceSpikes { service, spikes })
        })
        .collect();
    debug!(services = out.len(), "per-service latency spikes computed");
    out
}

fn detect_spikes(
    metric: SpikeMetric,
    buckets: &[TrafficBucket],
    values: &[f64],
    config: &WindowConfig,
    high_only: bool,
) -> Vec<Spike> {
    let threshold = config.spike_threshold;
    TimeSeries::new(values)
        .rolling_z_scores(config.spike_window)
        .into_iter()
        .zip(buckets.iter().zip(values))
        .filter(|(z, _)| if high_only { *z > threshold } else { z.abs() > threshold })
        .map(|(z, (b, v))| Spike {
            metric,
            bucket: b.bucket,
            start: b.start,
            value: *v,
            z_score: z,
            direction: if z > 0.0 { SpikeDirection::High } else { SpikeDirection::Low },
            critical: z.abs() > threshold * 1.5,
        })
        .collect()
}
