//! Feature aggregation: entity windows, service aggregates, traffic series,
//! trends and usage analytics.

pub mod aggregator;
pub mod percentile;
pub mod series;
pub mod service;
pub mod trend;
pub mod usage;

pub use aggregator::{EntityKind, EntityWindow, FeatureAggregator, WindowFeatures, WindowId};
pub use percentile::{percentile, LatencySummary};
pub use series::{ServiceSpikes, Spike, TrafficSeries};
pub use service::ServiceStats;
pub use trend::{LinearTrend, TrendDirection, TrendReport};
pub use usage::UsageReport;

use chrono::{DateTime, Duration, Utc};

/// Start of `bucket` for buckets `size_secs` wide, saturating at the
/// representable time range.
pub fn bucket_start(bucket: i64, size_secs: i64) -> DateTime<Utc> {
    bucket
        .checked_mul(size_secs)
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or(if bucket < 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        })
}

/// `start + size_secs`, saturating at the representable time range.
pub fn bucket_end(start: DateTime<Utc>, size_secs: i64) -> DateTime<Utc> {
    Duration::try_seconds(size_secs)
        .and_then(|span| start.checked_add_signed(span))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
