//! Order statistics.
//!
//! Every percentile in the engine goes through [`percentile`]: linear
//! interpolation between the closest ranks, `rank = p/100 * (n - 1)`. The
//! input is sorted internally so the result does not depend on input order.

use serde::{Deserialize, Serialize};

/// Percentile `p` (0..=100) of `values`. `None` for empty input.
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(f64::total_cmp);
    percentile_sorted(&sorted, p)
}

/// Percentile over an already ascending-sorted slice.
pub fn percentile_sorted(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let p = p.clamp(0.0, 100.0);
    let rank = p / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Latency summary used by windows and services.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub samples: usize,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub max: f64,
}

impl LatencySummary {
    /// `None` when there are no finite samples.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(f64::total_cmp);
        Some(Self {
            samples: sorted.len(),
            mean: mean(&sorted)?,
            p50: percentile_sorted(&sorted, 50.0)?,
            p95: percentile_sorted(&sorted, 95.0)?,
            p99: percentile_sorted(&sorted, 99.0)?,
            max: *sorted.last()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_interpolation() {
        let v = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&v, 50.0), Some(3.0));
        assert_eq!(percentile(&v, 0.0), Some(1.0));
        assert_eq!(percentile(&v, 100.0), Some(5.0));
        // rank = 0.95 * 4 = 3.8
        assert!((percentile(&v, 95.0).unwrap() - 4.8).abs() < 1e-12);
    }

    #[test]
    fn single_and_empty() {
        assert_eq!(percentile(&[7.0], 99.0), Some(7.0));
        assert_eq!(percentile(&[], 50.0), None);
        assert!(LatencySummary::from_values(&[f64::NAN]).is_none());
    }

    #[test]
    fn order_independent() {
        let a = [12.0, 3.5, 99.0, 41.0, 7.25, 64.0, 18.0];
        let mut b = a;
        b.reverse();
        b.swap(1, 5);
        assert_eq!(percentile(&a, 95.0), percentile(&b, 95.0));
        assert_eq!(percentile(&a, 99.0), percentile(&b, 99.0));
    }
}
