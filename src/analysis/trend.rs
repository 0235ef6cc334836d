//! Hourly and daily trends with trailing moving averages and a least-squares
//! linear fit.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::debug;

use crate::analysis::percentile::mean;
use crate::config::AnalyticsConfig;
use crate::normalize::LogEvent;

const HOUR_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
}

/// Least-squares line through a series indexed 0, 1, 2, ...
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LinearTrend {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
    pub direction: TrendDirection,
}

impl LinearTrend {
    fn flat() -> Self {
        Self {
            slope: 0.0,
            intercept: 0.0,
            r_squared: 0.0,
            direction: TrendDirection::Stable,
        }
    }
}

/// Fit `values` against their position. Non-finite values are skipped but
/// keep their position. Fewer than three usable points fit a flat line.
pub fn linear_trend(values: &[f64], stable_slope: f64) -> LinearTrend {
    let points: Vec<(f64, f64)> = values
        .iter()
        .enumerate()
        .filter(|(_, y)| y.is_finite())
        .map(|(x, y)| (x as f64, *y))
        .collect();
    if points.len() < 3 {
        return LinearTrend::flat();
    }

    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let sxx: f64 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    let sxy: f64 = points.iter().map(|(x, y)| (x - mean_x) * (y - mean_y)).sum();
    if sxx == 0.0 {
        return LinearTrend::flat();
    }
    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;

    let ss_res: f64 = points
        .iter()
        .map(|(x, y)| (y - (slope * x + intercept)).powi(2))
        .sum();
    let ss_tot: f64 = points.iter().map(|(_, y)| (y - mean_y).powi(2)).sum();
    let r_squared = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 };

    let direction = if slope > stable_slope {
        TrendDirection::Increasing
    } else if slope < -stable_slope {
        TrendDirection::Decreasing
    } else {
        TrendDirection::Stable
    };
    LinearTrend {
        slope,
        intercept,
        r_squared,
        direction,
    }
}

/// Mean of each point and the `span - 1` points before it. Gaps (`None`)
/// are skipped; a window with no values yields `None`.
pub fn trailing_mean(values: &[Option<f64>], span: usize) -> Vec<Option<f64>> {
    let span = span.max(1);
    (0..values.len())
        .map(|i| {
            let start = (i + 1).saturating_sub(span);
            let window: Vec<f64> = values[start..=i].iter().flatten().copied().collect();
            mean(&window)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyPoint {
    pub start: DateTime<Utc>,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Samples of the metric in the hour.
    pub count: usize,
    pub ma_3h: f64,
    pub ma_6h: f64,
    pub ma_12h: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyPoint {
    pub date: NaiveDate,
    pub requests: usize,
    pub errors: usize,
    pub error_rate: f64,
    pub mean_latency_ms: Option<f64>,
    pub ma_3d: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrendReport {
    pub hourly_latency: Vec<HourlyPoint>,
    pub hourly_throughput: Vec<HourlyPoint>,
    pub daily: Vec<DailyPoint>,
    /// `None` when no event carried a latency.
    pub latency_trend: Option<LinearTrend>,
    /// `None` when no event carried a byte count.
    pub throughput_trend: Option<LinearTrend>,
}

/// Hourly aggregates of `metric`. Hours where no event carries the metric
/// are not materialized.
pub fn hourly_trend<F>(events: &[LogEvent], metric: F) -> Vec<HourlyPoint>
where
    F: Fn(&LogEvent) -> Option<f64>,
{
    let mut hours: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
    for e in events {
        if let Some(v) = metric(e).filter(|v| v.is_finite()) {
            hours
                .entry(e.timestamp.timestamp().div_euclid(HOUR_SECS))
                .or_default()
                .push(v);
        }
    }

    let means: Vec<Option<f64>> = hours.values().map(|v| mean(v)).collect();
    let ma = |span| trailing_mean(&means, span);
    let (ma_3h, ma_6h, ma_12h) = (ma(3), ma(6), ma(12));

    hours
        .into_iter()
        .enumerate()
        .map(|(i, (hour, values))| HourlyPoint {
            start: super::bucket_start(hour, HOUR_SECS),
            mean: means[i].unwrap_or(0.0),
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            count: values.len(),
            ma_3h: ma_3h[i].unwrap_or(0.0),
            ma_6h: ma_6h[i].unwrap_or(0.0),
            ma_12h: ma_12h[i].unwrap_or(0.0),
        })
        .collect()
}

/// Per-day request and error counts with mean latency and its 3-day
/// trailing average. Days are UTC calendar days that have events.
pub fn daily_trend(events: &[LogEvent]) -> Vec<DailyPoint> {
    let mut days: BTreeMap<NaiveDate, (usize, usize, Vec<f64>)> = BTreeMap::new();
    for e in events {
        let day = days.entry(e.timestamp.date_naive()).or_default();
        day.0 += 1;
        if e.is_failure() {
            day.1 += 1;
        }
        if let Some(l) = e.latency_ms.filter(|l| l.is_finite()) {
            day.2.push(l);
        }
    }

    let means: Vec<Option<f64>> = days.values().map(|d| mean(&d.2)).collect();
    let ma_3d = trailing_mean(&means, 3);
    days.into_iter()
        .enumerate()
        .map(|(i, (date, (requests, errors, _)))| DailyPoint {
            date,
            requests,
            errors,
            error_rate: errors as f64 / requests.max(1) as f64,
            mean_latency_ms: means[i],
            ma_3d: ma_3d[i],
        })
        .collect()
}

pub fn trend_report(events: &[LogEvent], config: &AnalyticsConfig) -> TrendReport {
    let hourly_latency = hourly_trend(events, |e| e.latency_ms);
    let hourly_throughput = hourly_trend(events, |e| e.bytes.map(|b| b as f64));
    let fit = |points: &[HourlyPoint]| {
        (!points.is_empty()).then(|| {
            let means: Vec<f64> = points.iter().map(|p| p.mean).collect();
            linear_trend(&means, config.trend_slope)
        })
    };
    let report = TrendReport {
        latency_trend: fit(&hourly_latency),
        throughput_trend: fit(&hourly_throughput),
        daily: daily_trend(events),
        hourly_latency,
        hourly_throughput,
    };
    debug!(
        hours = report.hourly_latency.len(),
        days = report.daily.len(),
        "trends computed"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::aggregator::tests::event;
    use crate::normalize::Outcome;

    #[test]
    fn perfect_line_fits_exactly() {
        let t = linear_trend(&[1.0, 3.0, 5.0, 7.0], 0.5);
        assert!((t.slope - 2.0).abs() < 1e-12);
        assert!((t.intercept - 1.0).abs() < 1e-12);
        assert!((t.r_squared - 1.0).abs() < 1e-12);
        assert_eq!(t.direction, TrendDirection::Increasing);

        let down = linear_trend(&[9.0, 6.0, 3.0], 0.5);
        assert_eq!(down.direction, TrendDirection::Decreasing);
    }

    #[test]
    fn short_or_flat_series_is_stable() {
        assert_eq!(linear_trend(&[1.0, 100.0], 0.5), LinearTrend::flat());
        assert_eq!(linear_trend(&[1.0, f64::NAN, 100.0], 0.5), LinearTrend::flat());

        let flat = linear_trend(&[4.0, 4.0, 4.0, 4.0], 0.5);
        assert_eq!(flat.slope, 0.0);
        assert_eq!(flat.r_squared, 0.0);
        assert_eq!(flat.direction, TrendDirection::Stable);

        let gentle = linear_trend(&[10.0, 10.2, 10.4, 10.6], 0.5);
        assert_eq!(gentle.direction, TrendDirection::Stable);
    }

    #[test]
    fn nan_keeps_its_position() {
        let t = linear_trend(&[0.0, f64::NAN, 2.0, 3.0], 0.5);
        assert!((t.slope - 1.0).abs() < 1e-12);
        assert!(t.intercept.abs() < 1e-12);
    }

    #[test]
    fn trailing_mean_uses_min_one_period() {
        let v = [Some(2.0), Some(4.0), None, Some(12.0)];
        assert_eq!(
            trailing_mean(&v, 3),
            vec![Some(2.0), Some(3.0), Some(3.0), Some(8.0)]
        );
        assert_eq!(trailing_mean(&[None], 3), vec![None]);
    }

    #[test]
    fn hourly_points_and_moving_averages() {
        let mut events = Vec::new();
        for (hour, latency) in [(0i64, 100.0), (0, 300.0), (1, 400.0), (3, 700.0)] {
            let mut e = event(events.len() as u64 + 1, hour * 3600 + 10, "10.0.0.1", None);
            e.latency_ms = Some(latency);
            events.push(e);
        }
        events.push(event(99, 2 * 3600, "10.0.0.1", None));

        let hourly = hourly_trend(&events, |e| e.latency_ms);
        assert_eq!(hourly.len(), 3);
        assert_eq!(hourly[0].mean, 200.0);
        assert_eq!(hourly[0].min, 100.0);
        assert_eq!(hourly[0].max, 300.0);
        assert_eq!(hourly[0].count, 2);
        assert_eq!(hourly[1].ma_3h, 300.0);
        assert!((hourly[2].ma_3h - 1300.0 / 3.0).abs() < 1e-9);
        assert_eq!(hourly[2].start.timestamp(), 3 * 3600);
    }

    #[test]
    fn daily_points_count_errors() {
        let mut events: Vec<LogEvent> = (0..4).map(|i| event(i + 1, i as i64 * 60, "10.0.0.1", None)).collect();
        events[1].outcome = Outcome::ServerError;
        events.push(event(9, 86_400 + 5, "10.0.0.1", None));

        let daily = daily_trend(&events);
        assert_eq!(daily.len(), 2);
        assert_eq!(daily[0].requests, 4);
        assert_eq!(daily[0].errors, 1);
        assert_eq!(daily[0].error_rate, 0.25);
        assert_eq!(daily[0].mean_latency_ms, None);
        assert_eq!(daily[1].date, NaiveDate::from_ymd_opt(1970, 1, 2).unwrap());
    }

    #[test]
    fn report_without_metrics_has_no_trends() {
        let events = vec![event(1, 0, "10.0.0.1", None)];
        let report = trend_report(&events, &AnalyticsConfig::default());
        assert!(report.hourly_latency.is_empty());
        assert_eq!(report.latency_trend, None);
        assert_eq!(report.throughput_trend, None);
        assert_eq!(report.daily.len(), 1);
    }
}
