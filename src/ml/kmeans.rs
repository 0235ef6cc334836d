//! Seeded k-means with k-means++ seeding and silhouette scoring.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::ml::MlError;

/// Result of the best of several k-means runs.
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansFit {
    pub centroids: Vec<Vec<f64>>,
    /// Cluster of each input point. Clusters are numbered in order of their
    /// lowest member index.
    pub assignments: Vec<usize>,
    pub inertia: f64,
}

impl KMeansFit {
    pub fn k(&self) -> usize {
        self.centroids.len()
    }

    /// Point indices per cluster.
    pub fn members(&self) -> Vec<Vec<usize>> {
        let mut out = vec![Vec::new(); self.k()];
        for (i, &c) in self.assignments.iter().enumerate() {
            out[c].push(i);
        }
        out
    }
}

fn sq_dist(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

fn nearest(point: &[f64], centroids: &[Vec<f64>]) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (i, c) in centroids.iter().enumerate() {
        let d = sq_dist(point, c);
        if d < best.1 {
            best = (i, d);
        }
    }
    best
}

/// Number of distinct rows, compared exactly.
pub fn distinct_points(points: &[Vec<f64>]) -> usize {
    let mut rows: Vec<&Vec<f64>> = points.iter().collect();
    rows.sort_by(|a, b| {
        a.iter()
            .zip(b.iter())
            .map(|(x, y)| x.total_cmp(y))
            .find(|o| o.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    rows.dedup();
    rows.len()
}

/// Fit `k` clusters. `k` must not exceed the number of distinct points.
pub fn fit(
    points: &[Vec<f64>],
    k: usize,
    max_iterations: usize,
    restarts: usize,
    seed: u64,
) -> Result<KMeansFit, MlError> {
    if points.is_empty() || k == 0 {
        return Err(MlError::InsufficientData {
            needed: 1,
            have: points.len(),
        });
    }
    if k > points.len() {
        return Err(MlError::InsufficientData {
            needed: k,
            have: points.len(),
        });
    }
    if points.iter().flatten().any(|v| !v.is_finite()) {
        return Err(MlError::ModelFit("cluster input contains non-finite values".into()));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut best: Option<KMeansFit> = None;
    for _ in 0..restarts.max(1) {
        let run = lloyd(points, seed_centroids(points, k, &mut rng), max_iterations);
        if best.as_ref().map_or(true, |b| run.inertia < b.inertia) {
            best = Some(run);
        }
    }
    best.map(canonical)
        .ok_or_else(|| MlError::ModelFit("k-means produced no run".into()))
}

fn seed_centroids(points: &[Vec<f64>], k: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    let mut centroids = vec![points[rng.gen_range(0..points.len())].clone()];
    while centroids.len() < k {
        let weights: Vec<f64> = points.iter().map(|p| nearest(p, &centroids).1).collect();
        let total: f64 = weights.iter().sum();
        let pick = if total > 0.0 {
            let mut target = rng.gen_range(0.0..total);
            let mut chosen = points.len() - 1;
            for (i, w) in weights.iter().enumerate() {
                if *w > 0.0 && target < *w {
                    chosen = i;
                    break;
                }
                target -= w;
            }
            chosen
        } else {
            // Every point coincides with a centroid already.
            0
        };
        centroids.push(points[pick].clone());
    }
    centroids
}

fn lloyd(points: &[Vec<f64>], mut centroids: Vec<Vec<f64>>, max_iterations: usize) -> KMeansFit {
    let k = centroids.len();
    let width = points[0].len();
    let mut assignments: Vec<usize> = points.iter().map(|p| nearest(p, &centroids).0).collect();

    for _ in 0..max_iterations {
        let mut sums = vec![vec![0.0; width]; k];
        let mut counts = vec![0usize; k];
        for (p, &c) in points.iter().zip(&assignments) {
            counts[c] += 1;
            for (s, v) in sums[c].iter_mut().zip(p) {
                *s += v;
            }
        }
        for c in 0..k {
            if counts[c] > 0 {
                centroids[c] = sums[c].iter().map(|s| s / counts[c] as f64).collect();
            }
        }

        // Refill empty clusters with the point farthest from its centroid.
        for c in 0..k {
            if counts[c] > 0 {
                continue;
            }
            let far = points
                .iter()
                .enumerate()
                .filter(|(i, _)| counts[assignments[*i]] > 1)
                .max_by(|(i, a), (j, b)| {
                    sq_dist(a, &centroids[assignments[*i]])
                        .total_cmp(&sq_dist(b, &centroids[assignments[*j]]))
                        .then(j.cmp(i))
                })
                .map(|(i, _)| i);
            if let Some(i) = far {
                counts[assignments[i]] -= 1;
                counts[c] = 1;
                assignments[i] = c;
                centroids[c] = points[i].clone();
            }
        }

        let next: Vec<usize> = points.iter().map(|p| nearest(p, &centroids).0).collect();
        if next == assignments {
            break;
        }
        assignments = next;
    }

    let inertia = points
        .iter()
        .zip(&assignments)
        .map(|(p, &c)| sq_dist(p, &centroids[c]))
        .sum();
    KMeansFit {
        centroids,
        assignments,
        inertia,
    }
}

/// Renumber clusters by first appearance in point order.
fn canonical(fit: KMeansFit) -> KMeansFit {
    let mut remap = vec![usize::MAX; fit.centroids.len()];
    let mut next = 0;
    for &c in &fit.assignments {
        if remap[c] == usize::MAX {
            remap[c] = next;
            next += 1;
        }
    }
    let mut order: Vec<usize> = (0..fit.centroids.len()).collect();
    order.sort_by_key(|&c| remap[c]);
    // Unused clusters, if any, go last.
    let centroids = order.iter().map(|&c| fit.centroids[c].clone()).collect();
    let mut position = vec![0; fit.centroids.len()];
    for (new, &old) in order.iter().enumerate() {
        position[old] = new;
    }
    KMeansFit {
        centroids,
        assignments: fit.assignments.iter().map(|&c| position[c]).collect(),
        inertia: fit.inertia,
    }
}

/// Mean silhouette coefficient. Points alone in their cluster score 0.
/// `None` when there are fewer than two clusters in use.
pub fn silhouette(points: &[Vec<f64>], assignments: &[usize]) -> Option<f64> {
    let k = assignments.iter().copied().max()? + 1;
    let mut sizes = vec![0usize; k];
    for &c in assignments {
        sizes[c] += 1;
    }
    if sizes.iter().filter(|s| **s > 0).count() < 2 {
        return None;
    }

    let mut total = 0.0;
    for (i, p) in points.iter().enumerate() {
        let own = assignments[i];
        if sizes[own] <= 1 {
            continue;
        }
        let mut sums = vec![0.0; k];
        for (j, q) in points.iter().enumerate() {
            if i != j {
                sums[assignments[j]] += sq_dist(p, q).sqrt();
            }
        }
        let a = sums[own] / (sizes[own] - 1) as f64;
        let b = (0..k)
            .filter(|&c| c != own && sizes[c] > 0)
            .map(|c| sums[c] / sizes[c] as f64)
            .fold(f64::INFINITY, f64::min);
        let denom = a.max(b);
        if denom > 0.0 {
            total += (b - a) / denom;
        }
    }
    Some(total / points.len() as f64)
}
