//! Isolation forest outlier scoring.
//!
//! Trees are grown on random subsamples with uniformly random splits; points
//! that isolate in few splits are anomalous. The score is `2^(-E[h]/c(psi))`
//! in (0, 1], where 0.5 is an average point and values near 1 are outliers.

use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};

use crate::ml::MlError;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// Average path length of an unsuccessful BST search over `n` points.
pub fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Leaf { size: usize },
    Split { feature: usize, value: f64, left: usize, right: usize },
}

#[derive(Debug, Clone)]
struct IsolationTree {
    nodes: Vec<Node>,
}

impl IsolationTree {
    fn grow(data: &[Vec<f64>], sample: Vec<usize>, max_depth: usize, rng: &mut StdRng) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        tree.build(data, sample, 0, max_depth, rng);
        tree
    }

    fn build(
        &mut self,
        data: &[Vec<f64>],
        rows: Vec<usize>,
        depth: usize,
        max_depth: usize,
        rng: &mut StdRng,
    ) -> usize {
        let slot = self.nodes.len();
        self.nodes.push(Node::Leaf { size: rows.len() });
        if depth >= max_depth || rows.len() <= 1 {
            return slot;
        }

        let width = data[rows[0]].len();
        let splittable: Vec<(usize, f64, f64)> = (0..width)
            .filter_map(|f| {
                let (lo, hi) = rows.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &r| {
                    (lo.min(data[r][f]), hi.max(data[r][f]))
                });
                (hi > lo).then_some((f, lo, hi))
            })
            .collect();
        if splittable.is_empty() {
            return slot;
        }

        let (feature, lo, hi) = splittable[rng.gen_range(0..splittable.len())];
        let value = rng.gen_range(lo..hi);
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) =
            rows.into_iter().partition(|&r| data[r][feature] < value);
        let left = self.build(data, left_rows, depth + 1, max_depth, rng);
        let right = self.build(data, right_rows, depth + 1, max_depth, rng);
        self.nodes[slot] = Node::Split {
            feature,
            value,
            left,
            right,
        };
        slot
    }

    fn path_length(&self, point: &[f64]) -> f64 {
        let mut node = 0;
        let mut depth = 0.0;
        loop {
            match &self.nodes[node] {
                Node::Leaf { size } => return depth + average_path_length(*size),
                Node::Split {
                    feature,
                    value,
                    left,
                    right,
                } => {
                    node = if point[*feature] < *value { *left } else { *right };
                    depth += 1.0;
                }
            }
        }
    }
}

/// A fitted forest. Lives only for one analysis call.
#[derive(Debug, Clone)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    sample_size: usize,
}

impl IsolationForest {
    pub fn fit(
        data: &[Vec<f64>],
        trees: usize,
        sample_size: usize,
        seed: u64,
    ) -> Result<Self, MlError> {
        if data.len() < 2 {
            return Err(MlError::InsufficientData {
                needed: 2,
                have: data.len(),
            });
        }
        let psi = sample_size.min(data.len());
        let max_depth = (psi as f64).log2().ceil() as usize;
        let mut rng = StdRng::seed_from_u64(seed);
        let trees = (0..trees)
            .map(|_| {
                let sample = index::sample(&mut rng, data.len(), psi).into_vec();
                IsolationTree::grow(data, sample, max_depth, &mut rng)
            })
            .collect();
        Ok(Self {
            trees,
            sample_size: psi,
        })
    }

    pub fn score(&self, point: &[f64]) -> f64 {
        let mean_path = self.trees.iter().map(|t| t.path_length(point)).sum::<f64>()
            / self.trees.len().max(1) as f64;
        let c = average_path_length(self.sample_size);
        if c <= 0.0 {
            return 0.5;
        }
        2f64.powf(-mean_path / c)
    }

    pub fn score_all(&self, data: &[Vec<f64>]) -> Vec<f64> {
        data.iter().map(|p| self.score(p)).collect()
    }
}

/// Indices of the `ceil(contamination * n)` highest scores. `order` breaks
/// ties: among equal scores the lower `order` value wins.
pub fn top_outliers<K: Ord>(scores: &[f64], contamination: f64, order: &[K]) -> Vec<usize> {
    if scores.is_empty() {
        return Vec::new();
    }
    let k = ((contamination * scores.len() as f64).ceil() as usize).min(scores.len());
    let mut idx: Vec<usize> = (0..scores.len()).collect();
    idx.sort_by(|&a, &b| {
        scores[b]
            .total_cmp(&scores[a])
            .then_with(|| order[a].cmp(&order[b]))
    });
    idx.truncate(k);
    idx.sort_unstable();
    idx
}
